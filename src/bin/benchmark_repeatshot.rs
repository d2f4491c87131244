// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/benchmark_repeatshot.rs - 重复推理基准测试
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use shanan_fewshot::{
  AnchorGrid, FromUrl, Gallery, Pipeline, PipelineConfig,
  model::{CosineSimilarity, ReplayEmbedding, ReplayProposal},
  output::LogOutput,
  task::{RepeatShotTask, Task},
};
use tracing::info;

/// Shanan 小样本检测基准测试参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 锚框文件
  #[arg(long, value_name = "ANCHORS")]
  pub anchors: Url,
  /// 样本库
  #[arg(long, value_name = "GALLERY")]
  pub gallery: Url,
  /// 候选框网络输出回放文件
  #[arg(long, value_name = "PROPOSAL")]
  pub proposal: Url,
  /// 特征提取网络输出回放文件，自动循环回放
  #[arg(long, value_name = "EMBEDDING")]
  pub embedding: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 重复次数
  #[arg(long, default_value = "1000", value_name = "COUNT")]
  pub times: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("输入来源: {}", args.input);
  info!("重复次数: {}", args.times);

  let mut embedding = args.embedding.clone();
  if !embedding.query_pairs().any(|(k, _)| k == "cycle") {
    embedding.query_pairs_mut().append_key_only("cycle");
  }

  let pipeline = Pipeline::new(
    PipelineConfig::default(),
    AnchorGrid::from_url(&args.anchors)?,
    Gallery::from_url(&args.gallery)?,
    ReplayProposal::from_url(&args.proposal)?,
    ReplayEmbedding::from_url(&embedding)?,
    CosineSimilarity,
  );
  let input = shanan_fewshot::input::InputWrapper::from_url(&args.input)?;

  RepeatShotTask::default()
    .with_times(args.times)
    .run_task(input, pipeline, LogOutput)?;

  Ok(())
}
