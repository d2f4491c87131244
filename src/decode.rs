// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 锚框解码
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error};

use crate::{
  anchor::{ANCHOR_COORDINATES, AnchorGrid},
  geometry::{BBox, CenterBox},
};

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("目标置信度张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  ObjectnessShape { expected: usize, actual: usize },
  #[error("偏移张量长度不匹配: 期望 {expected}, 实际 {actual}")]
  OffsetsShape { expected: usize, actual: usize },
}

/// 候选框网络的两路输出
///
/// `objectness` 形状为 `rows × cols × anchors`，
/// `offsets` 形状为 `rows × cols × anchors × 4`，每个锚框依次为 `(dx, dy, dw, dh)`。
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Proposal {
  pub objectness: Vec<f32>,
  pub offsets: Vec<f32>,
}

/// 一个尚未去重的检测框及其置信度
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<B = BBox> {
  pub bbox: B,
  pub score: f32,
}

impl Candidate<CenterBox> {
  pub fn to_corner(&self) -> Candidate<BBox> {
    Candidate {
      bbox: self.bbox.to_corner(),
      score: self.score,
    }
  }
}

/// 将超过 `confidence_threshold` 的锚框解码为中心形式的候选框
///
/// 按单元行、单元列、锚框序号的顺序遍历，候选框下标即为该遍历顺序。
/// 低于阈值的锚框不做解码。
pub fn decode_candidates(
  proposal: &Proposal,
  grid: &AnchorGrid,
  confidence_threshold: f32,
) -> Result<Vec<Candidate<CenterBox>>, DecodeError> {
  let layout = grid.layout();

  if proposal.objectness.len() != layout.objectness_len() {
    error!(
      "目标置信度张量长度不匹配: 期望 {}, 实际 {}",
      layout.objectness_len(),
      proposal.objectness.len()
    );
    return Err(DecodeError::ObjectnessShape {
      expected: layout.objectness_len(),
      actual: proposal.objectness.len(),
    });
  }
  if proposal.offsets.len() != layout.offsets_len() {
    error!(
      "偏移张量长度不匹配: 期望 {}, 实际 {}",
      layout.offsets_len(),
      proposal.offsets.len()
    );
    return Err(DecodeError::OffsetsShape {
      expected: layout.offsets_len(),
      actual: proposal.offsets.len(),
    });
  }

  let mut candidates = Vec::new();
  for row in 0..layout.rows {
    for col in 0..layout.cols {
      for z in 0..layout.anchors {
        let slot = layout.slot(row, col, z);
        let score = proposal.objectness[slot];
        // NaN 不会超过任何阈值
        if score.is_nan() || score <= confidence_threshold {
          continue;
        }

        let offset = &proposal.offsets[slot * ANCHOR_COORDINATES..(slot + 1) * ANCHOR_COORDINATES];
        let (dx, dy, dw, dh) = (offset[0], offset[1], offset[2], offset[3]);
        let anchor = grid.anchor(row, col, z);

        // exp(dw + ln(w)) == w * exp(dw)
        let bbox = CenterBox {
          cx: dx * anchor.w + anchor.cx,
          cy: dy * anchor.h + anchor.cy,
          w: anchor.w * dw.exp(),
          h: anchor.h * dh.exp(),
        };
        candidates.push(Candidate { bbox, score });
      }
    }
  }

  debug!("解码得到 {} 个候选框", candidates.len());
  Ok(candidates)
}

/// 中心形式转为角点形式，保持下标顺序
pub fn to_corner_form(candidates: &[Candidate<CenterBox>]) -> Vec<Candidate<BBox>> {
  candidates.iter().map(Candidate::to_corner).collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::anchor::GridLayout;

  fn grid_with(layout: GridLayout, anchor: [f32; 4]) -> AnchorGrid {
    let values: Vec<f32> = (0..layout.objectness_len()).flat_map(|_| anchor).collect();
    AnchorGrid::from_values(layout, &values).unwrap()
  }

  #[test]
  fn zero_offsets_reproduce_anchor() {
    let layout = GridLayout::new(1, 1, 1);
    let grid = grid_with(layout, [100.0, 100.0, 20.0, 20.0]);
    let proposal = Proposal {
      objectness: vec![0.9],
      offsets: vec![0.0, 0.0, 0.0, 0.0],
    };
    let candidates = decode_candidates(&proposal, &grid, 0.5).unwrap();
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].bbox, CenterBox::new(100.0, 100.0, 20.0, 20.0));
    assert_eq!(candidates[0].score, 0.9);
  }

  #[test]
  fn offsets_scale_by_anchor_extent() {
    let layout = GridLayout::new(1, 1, 1);
    let grid = grid_with(layout, [50.0, 60.0, 10.0, 20.0]);
    let proposal = Proposal {
      objectness: vec![0.8],
      offsets: vec![0.5, -0.25, 2.0_f32.ln(), 0.5_f32.ln()],
    };
    let b = decode_candidates(&proposal, &grid, 0.5).unwrap()[0].bbox;
    assert!((b.cx - 55.0).abs() < 1e-5);
    assert!((b.cy - 55.0).abs() < 1e-5);
    assert!((b.w - 20.0).abs() < 1e-4);
    assert!((b.h - 10.0).abs() < 1e-4);
  }

  #[test]
  fn threshold_is_strict_and_order_is_row_major() {
    let layout = GridLayout::new(2, 2, 2);
    let values: Vec<f32> = (0..layout.objectness_len())
      .flat_map(|i| [i as f32, 0.0, 4.0, 4.0])
      .collect();
    let grid = AnchorGrid::from_values(layout, &values).unwrap();

    let mut objectness = vec![0.1; layout.objectness_len()];
    objectness[1] = 0.5; // 等于阈值，跳过
    objectness[3] = 0.7;
    objectness[6] = 0.6;
    let proposal = Proposal {
      objectness,
      offsets: vec![0.0; layout.offsets_len()],
    };

    let candidates = decode_candidates(&proposal, &grid, 0.5).unwrap();
    let centers: Vec<f32> = candidates.iter().map(|c| c.bbox.cx).collect();
    assert_eq!(centers, vec![3.0, 6.0]);
  }

  #[test]
  fn nothing_above_threshold() {
    let layout = GridLayout::new(2, 2, 1);
    let grid = grid_with(layout, [1.0, 1.0, 1.0, 1.0]);
    let proposal = Proposal {
      objectness: vec![0.2; 4],
      offsets: vec![0.0; 16],
    };
    assert!(decode_candidates(&proposal, &grid, 0.5).unwrap().is_empty());
  }

  #[test]
  fn nan_objectness_is_rejected() {
    let layout = GridLayout::new(1, 2, 1);
    let grid = grid_with(layout, [10.0, 10.0, 4.0, 4.0]);
    let proposal = Proposal {
      objectness: vec![f32::NAN, 0.2],
      offsets: vec![0.0; 8],
    };
    assert!(decode_candidates(&proposal, &grid, 0.5).unwrap().is_empty());
  }

  #[test]
  fn shape_mismatch() {
    let layout = GridLayout::new(1, 1, 2);
    let grid = grid_with(layout, [1.0, 1.0, 1.0, 1.0]);
    let bad_obj = Proposal {
      objectness: vec![0.9],
      offsets: vec![0.0; 8],
    };
    assert!(matches!(
      decode_candidates(&bad_obj, &grid, 0.5),
      Err(DecodeError::ObjectnessShape {
        expected: 2,
        actual: 1
      })
    ));
    let bad_box = Proposal {
      objectness: vec![0.9, 0.9],
      offsets: vec![0.0; 7],
    };
    assert!(matches!(
      decode_candidates(&bad_box, &grid, 0.5),
      Err(DecodeError::OffsetsShape { .. })
    ));
  }

  #[test]
  fn corner_conversion_keeps_order_and_scores() {
    let centers = [
      Candidate {
        bbox: CenterBox::new(10.0, 10.0, 4.0, 6.0),
        score: 0.6,
      },
      Candidate {
        bbox: CenterBox::new(30.0, 20.0, 10.0, 10.0),
        score: 0.9,
      },
    ];
    let corners = to_corner_form(&centers);
    assert_eq!(corners[0].bbox, BBox::new(8.0, 7.0, 4.0, 6.0));
    assert_eq!(corners[1].bbox, BBox::new(25.0, 15.0, 10.0, 10.0));
    assert_eq!(corners[1].score, 0.9);
  }
}
