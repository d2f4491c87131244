// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/replay.rs - 回放已保存的网络输出
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, decode::Proposal, gallery::Embedding, model::Model,
  tensor::RgbTensor,
};

#[derive(Error, Debug)]
pub enum ReplayError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("回放特征已用尽: 共 {0} 条")]
  Exhausted(usize),
}

fn read_dump<T: for<'de> Deserialize<'de>>(url: &Url, scheme: &str) -> Result<T, ReplayError> {
  if url.scheme() != scheme {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      scheme,
      url.scheme()
    );
    return Err(ReplayError::SchemeMismatch);
  }
  info!("加载回放文件: {}", url.path());
  let text = std::fs::read_to_string(url.path())?;
  Ok(serde_json::from_str(&text)?)
}

/// 每次推理都返回同一份保存的候选框网络输出
///
/// 文件格式：`{"objectness": [...], "offsets": [...]}`
#[derive(Debug, Clone)]
pub struct ReplayProposal {
  proposal: Proposal,
}

impl ReplayProposal {
  pub fn new(proposal: Proposal) -> Self {
    Self { proposal }
  }
}

impl FromUrlWithScheme for ReplayProposal {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayProposal {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let proposal: Proposal = read_dump(url, Self::SCHEME)?;
    debug!(
      "回放候选框输出: objectness {} 项, offsets {} 项",
      proposal.objectness.len(),
      proposal.offsets.len()
    );
    Ok(Self { proposal })
  }
}

impl Model for ReplayProposal {
  type Input = RgbTensor;
  type Output = Proposal;
  type Error = ReplayError;

  fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
    Ok(self.proposal.clone())
  }
}

#[derive(Deserialize)]
struct EmbeddingDump {
  embeddings: Vec<Embedding>,
}

/// 按调用顺序依次返回保存的特征
///
/// 文件格式：`{"embeddings": [[...], ...]}`，URL 带 `?cycle` 时循环回放，
/// 否则用尽后返回错误。
#[derive(Debug)]
pub struct ReplayEmbedding {
  embeddings: Vec<Embedding>,
  cursor: AtomicUsize,
  cycle: bool,
}

impl ReplayEmbedding {
  pub fn new(embeddings: Vec<Embedding>, cycle: bool) -> Self {
    Self {
      embeddings,
      cursor: AtomicUsize::new(0),
      cycle,
    }
  }
}

impl FromUrlWithScheme for ReplayEmbedding {
  const SCHEME: &'static str = "replay";
}

impl FromUrl for ReplayEmbedding {
  type Error = ReplayError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let dump: EmbeddingDump = read_dump(url, Self::SCHEME)?;
    let cycle = url.query_pairs().any(|(k, _)| k == "cycle");
    debug!("回放特征 {} 条, 循环: {}", dump.embeddings.len(), cycle);
    Ok(Self::new(dump.embeddings, cycle))
  }
}

impl Model for ReplayEmbedding {
  type Input = RgbTensor;
  type Output = Embedding;
  type Error = ReplayError;

  fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
    let total = self.embeddings.len();
    let index = self.cursor.fetch_add(1, Ordering::Relaxed);
    let index = match (self.cycle, total) {
      (_, 0) => return Err(ReplayError::Exhausted(0)),
      (true, _) => index % total,
      (false, _) if index < total => index,
      (false, _) => return Err(ReplayError::Exhausted(total)),
    };
    Ok(self.embeddings[index].clone())
  }
}
