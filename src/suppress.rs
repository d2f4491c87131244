// 该文件是 Shanan （山南西风） 项目的一部分。
// src/suppress.rs - 非极大值抑制
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

use tracing::debug;

use crate::{
  decode::Candidate,
  geometry::{BBox, overlap_ratio},
  rank::{Order, argsort},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressState {
  Unvisited,
  Suppressed,
  Kept,
}

/// 贪心非极大值抑制，返回每个候选框的最终状态
///
/// 从最高分开始遍历；每个尚未访问的候选框被保留，并将与其（取整后）
/// 交并比严格大于 `threshold` 的未访问候选框标记为抑制。
/// 状态一旦确定不再改变。
pub fn suppression_states(candidates: &[Candidate<BBox>], threshold: f32) -> Vec<SuppressState> {
  let scores: Vec<f32> = candidates.iter().map(|c| c.score).collect();
  let order = argsort(&scores, Order::Ascending);
  let rounded: Vec<BBox> = candidates.iter().map(|c| c.bbox.round()).collect();
  let mut states = vec![SuppressState::Unvisited; candidates.len()];

  for &i in order.iter().rev() {
    if states[i] != SuppressState::Unvisited {
      continue;
    }
    states[i] = SuppressState::Kept;

    for j in 0..candidates.len() {
      if states[j] != SuppressState::Unvisited {
        continue;
      }
      if overlap_ratio(&rounded[i], &rounded[j]) > threshold {
        states[j] = SuppressState::Suppressed;
      }
    }
  }

  states
}

/// 返回保留下来的候选框，按原始下标顺序（而非分数顺序）
pub fn suppress(candidates: &[Candidate<BBox>], threshold: f32) -> Vec<Candidate<BBox>> {
  let states = suppression_states(candidates, threshold);
  let kept: Vec<Candidate<BBox>> = candidates
    .iter()
    .zip(states)
    .filter(|(_, state)| *state == SuppressState::Kept)
    .map(|(c, _)| *c)
    .collect();
  debug!("NMS: {} 个候选框保留 {} 个", candidates.len(), kept.len());
  kept
}
