// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型
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

use std::convert::Infallible;

/// 外部推理模型：候选框网络为 `Model<Input = RgbTensor, Output = Proposal>`，
/// 特征提取网络为 `Model<Input = RgbTensor, Output = Embedding>`
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 两条特征之间的相似度（比较头网络）
pub trait Similarity {
  type Error;

  fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32, Self::Error>;
}

/// 余弦相似度，零向量或维度不一致时为 0
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl Similarity for CosineSimilarity {
  type Error = Infallible;

  fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32, Self::Error> {
    if a.len() != b.len() {
      return Ok(0.0);
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
      let (x, y) = (x as f64, y as f64);
      dot += x * y;
      norm_a += x * x;
      norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
      return Ok(0.0);
    }
    Ok((dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0) as f32)
  }
}

#[cfg(feature = "model_replay")]
mod replay;
#[cfg(feature = "model_replay")]
pub use self::replay::{ReplayEmbedding, ReplayError, ReplayProposal};

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cosine_identical_and_orthogonal() {
    let s = CosineSimilarity;
    let same = s.similarity(&[1.0, 2.0, 3.0], &[2.0, 4.0, 6.0]).unwrap();
    assert!((same - 1.0).abs() < 1e-6, "got {same}");
    let ortho = s.similarity(&[1.0, 0.0], &[0.0, 1.0]).unwrap();
    assert!(ortho.abs() < 1e-6);
    let opposite = s.similarity(&[1.0, 0.0], &[-3.0, 0.0]).unwrap();
    assert!((opposite + 1.0).abs() < 1e-6);
  }

  #[test]
  fn cosine_degenerate_inputs() {
    let s = CosineSimilarity;
    assert_eq!(s.similarity(&[0.0, 0.0], &[1.0, 0.0]).unwrap(), 0.0);
    assert_eq!(s.similarity(&[1.0], &[1.0, 0.0]).unwrap(), 0.0);
  }
}
