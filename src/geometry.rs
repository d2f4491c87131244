// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框几何
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

/// 角点形式的边界框：左上角 `(x, y)` 加尺寸 `(w, h)`，单位为解码器像素
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BBox {
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

/// 中心形式的边界框，解码器直接输出的形式
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CenterBox {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
}

impl CenterBox {
  pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
    Self { cx, cy, w, h }
  }

  /// 转换为角点形式：`x = cx - w/2, y = cy - h/2`
  pub fn to_corner(&self) -> BBox {
    BBox {
      x: self.cx - self.w / 2.0,
      y: self.cy - self.h / 2.0,
      w: self.w,
      h: self.h,
    }
  }
}

impl From<CenterBox> for BBox {
  fn from(center: CenterBox) -> Self {
    center.to_corner()
  }
}

impl BBox {
  pub fn new(x: f32, y: f32, w: f32, h: f32) -> Self {
    Self { x, y, w, h }
  }

  pub fn area(&self) -> f32 {
    self.w * self.h
  }

  pub fn right(&self) -> f32 {
    self.x + self.w
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.h
  }

  /// 将各坐标四舍五入到整数像素（半数向上取整）
  pub fn round(&self) -> BBox {
    BBox {
      x: round_half_up(self.x),
      y: round_half_up(self.y),
      w: round_half_up(self.w),
      h: round_half_up(self.h),
    }
  }

  /// `[x_min, y_min, x_max, y_max]`
  pub fn to_xyxy(&self) -> [f32; 4] {
    [self.x, self.y, self.right(), self.bottom()]
  }
}

fn round_half_up(v: f32) -> f32 {
  (v + 0.5).floor()
}

/// 计算两个角点形式边界框的交并比（IoU）
///
/// 水平或竖直方向的重叠长度不为正时交集按 0 计；并集面积不为正时返回 0，
/// 不会产生 NaN。
pub fn overlap_ratio(a: &BBox, b: &BBox) -> f32 {
  let overlap_w = a.right().min(b.right()) - a.x.max(b.x);
  let overlap_h = a.bottom().min(b.bottom()) - a.y.max(b.y);

  let overlap_area = if overlap_w <= 0.0 || overlap_h <= 0.0 {
    0.0
  } else {
    overlap_w * overlap_h
  };

  let union = a.area() + b.area() - overlap_area;
  if union > 0.0 {
    overlap_area / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn self_overlap_is_one() {
    let a = BBox::new(3.0, 4.0, 10.0, 20.0);
    assert_eq!(overlap_ratio(&a, &a), 1.0);
  }

  #[test]
  fn disjoint_boxes_do_not_overlap() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(20.0, 0.0, 10.0, 10.0);
    assert_eq!(overlap_ratio(&a, &b), 0.0);

    let below = BBox::new(0.0, 30.0, 10.0, 10.0);
    assert_eq!(overlap_ratio(&a, &below), 0.0);
  }

  #[test]
  fn touching_edges_count_as_disjoint() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(10.0, 0.0, 10.0, 10.0);
    assert_eq!(overlap_ratio(&a, &b), 0.0);
  }

  #[test]
  fn partial_overlap_and_symmetry() {
    let a = BBox::new(0.0, 0.0, 10.0, 10.0);
    let b = BBox::new(5.0, 0.0, 10.0, 10.0);
    // 交集 50，并集 150
    let ratio = overlap_ratio(&a, &b);
    assert!((ratio - 1.0 / 3.0).abs() < 1e-6, "got {ratio}");
    assert_eq!(overlap_ratio(&a, &b), overlap_ratio(&b, &a));
  }

  #[test]
  fn contained_box() {
    let outer = BBox::new(0.0, 0.0, 10.0, 10.0);
    let inner = BBox::new(2.0, 2.0, 5.0, 5.0);
    let ratio = overlap_ratio(&outer, &inner);
    assert!((ratio - 0.25).abs() < 1e-6, "got {ratio}");
  }

  #[test]
  fn zero_area_boxes_yield_zero() {
    let a = BBox::new(5.0, 5.0, 0.0, 0.0);
    assert_eq!(overlap_ratio(&a, &a), 0.0);
    assert!(!overlap_ratio(&a, &a).is_nan());
  }

  #[test]
  fn center_to_corner() {
    let corner = CenterBox::new(100.0, 50.0, 20.0, 10.0).to_corner();
    assert_eq!(corner, BBox::new(90.0, 45.0, 20.0, 10.0));
  }

  #[test]
  fn rounding_is_half_up() {
    let b = BBox::new(1.5, -1.5, 2.4, 2.6).round();
    assert_eq!(b, BBox::new(2.0, -1.0, 2.0, 3.0));
  }
}
