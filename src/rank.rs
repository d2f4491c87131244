// 该文件是 Shanan （山南西风） 项目的一部分。
// src/rank.rs - 分数排序工具
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

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
  #[default]
  Ascending,
  Descending,
}

/// 返回按分数排序后的下标序列，不修改输入
///
/// 排序是稳定的，相同分数保持原始下标的先后顺序；调用方不应依赖这一点。
pub fn argsort(scores: &[f32], order: Order) -> Vec<usize> {
  let mut indexes: Vec<usize> = (0..scores.len()).collect();
  match order {
    Order::Ascending => indexes.sort_by(|&a, &b| scores[a].total_cmp(&scores[b])),
    Order::Descending => indexes.sort_by(|&a, &b| scores[b].total_cmp(&scores[a])),
  }
  indexes
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_input() {
    assert!(argsort(&[], Order::Ascending).is_empty());
    assert!(argsort(&[], Order::Descending).is_empty());
  }

  #[test]
  fn ascending_and_descending() {
    let scores = [0.3, 0.9, 0.1, 0.5];
    assert_eq!(argsort(&scores, Order::Ascending), vec![2, 0, 3, 1]);
    assert_eq!(argsort(&scores, Order::Descending), vec![1, 3, 0, 2]);
  }

  #[test]
  fn input_is_untouched() {
    let scores = vec![0.7, 0.2, 0.4];
    let copy = scores.clone();
    let _ = argsort(&scores, Order::Ascending);
    assert_eq!(scores, copy);
  }

  #[test]
  fn result_is_a_permutation() {
    let scores = [0.5, 0.5, 0.1, 0.5];
    let mut idx = argsort(&scores, Order::Ascending);
    assert_eq!(idx[0], 2);
    idx.sort_unstable();
    assert_eq!(idx, vec![0, 1, 2, 3]);
  }
}
