// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - NHWC 浮点张量与图像预处理
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

use std::str::FromStr;

use image::{RgbImage, imageops::FilterType};
use thiserror::Error;

use crate::geometry::BBox;

const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug, PartialEq)]
pub enum TensorError {
  #[error("裁剪区域为空: {0:?}")]
  EmptyCrop(BBox),
  #[error("未知的归一化方式: {0}")]
  UnknownNormalization(String),
}

/// 像素到浮点数的归一化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Normalization {
  /// `v / 127.5 - 1`
  #[default]
  MobileNet,
  /// `v / 255`
  Vgg,
  /// 原始像素值
  Raw,
}

impl Normalization {
  pub fn apply(&self, value: u8) -> f32 {
    match self {
      Normalization::MobileNet => value as f32 / 127.5 - 1.0,
      Normalization::Vgg => value as f32 / 255.0,
      Normalization::Raw => value as f32,
    }
  }
}

impl FromStr for Normalization {
  type Err = TensorError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "mobilenet" => Ok(Normalization::MobileNet),
      "vgg" => Ok(Normalization::Vgg),
      "raw" | "" => Ok(Normalization::Raw),
      _ => Err(TensorError::UnknownNormalization(s.to_string())),
    }
  }
}

/// `[1, H, W, 3]` 的 NHWC 浮点张量
#[derive(Debug, Clone, PartialEq)]
pub struct RgbTensor {
  width: usize,
  height: usize,
  data: Box<[f32]>,
}

impl RgbTensor {
  pub fn from_image(image: &RgbImage, normalization: Normalization) -> Self {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let data: Box<[f32]> = image
      .as_raw()
      .iter()
      .map(|&v| normalization.apply(v))
      .collect();
    debug_assert_eq!(data.len(), width * height * RGB_CHANNELS);

    Self {
      width,
      height,
      data,
    }
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  pub fn as_nhwc(&self) -> &[f32] {
    &self.data
  }
}

/// 最近邻缩放
pub fn resize(image: &RgbImage, width: u32, height: u32) -> RgbImage {
  if image.dimensions() == (width, height) {
    return image.clone();
  }
  image::imageops::resize(image, width, height, FilterType::Nearest)
}

/// 按取整后的边界框裁剪（裁剪到图像范围内），再缩放到 `size × size`
pub fn crop_resized(image: &RgbImage, bbox: &BBox, size: u32) -> Result<RgbImage, TensorError> {
  let rounded = bbox.round();
  let (img_w, img_h) = (image.width() as f32, image.height() as f32);

  let x0 = rounded.x.clamp(0.0, img_w);
  let y0 = rounded.y.clamp(0.0, img_h);
  let x1 = rounded.right().clamp(0.0, img_w);
  let y1 = rounded.bottom().clamp(0.0, img_h);
  if !(x1 > x0 && y1 > y0) {
    return Err(TensorError::EmptyCrop(*bbox));
  }

  let crop = image::imageops::crop_imm(
    image,
    x0 as u32,
    y0 as u32,
    (x1 - x0) as u32,
    (y1 - y0) as u32,
  )
  .to_image();
  Ok(resize(&crop, size, size))
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn normalization_ranges() {
    assert_eq!(Normalization::MobileNet.apply(0), -1.0);
    assert_eq!(Normalization::MobileNet.apply(255), 1.0);
    assert_eq!(Normalization::Vgg.apply(255), 1.0);
    assert_eq!(Normalization::Raw.apply(17), 17.0);
    assert_eq!("VGG".parse::<Normalization>(), Ok(Normalization::Vgg));
    assert!("bgr".parse::<Normalization>().is_err());
  }

  #[test]
  fn tensor_is_nhwc() {
    let mut image = RgbImage::new(2, 1);
    image.put_pixel(1, 0, Rgb([10, 20, 30]));
    let tensor = RgbTensor::from_image(&image, Normalization::Raw);
    assert_eq!(tensor.width(), 2);
    assert_eq!(tensor.height(), 1);
    assert_eq!(tensor.as_nhwc(), &[0.0, 0.0, 0.0, 10.0, 20.0, 30.0]);
  }

  #[test]
  fn crop_is_clamped_and_resized() {
    let mut image = RgbImage::new(20, 20);
    image.put_pixel(19, 19, Rgb([255, 0, 0]));
    // 裁剪到 16..20，尺寸恰为 4x4
    let crop = crop_resized(&image, &BBox::new(16.0, 16.0, 30.0, 30.0), 4).unwrap();
    assert_eq!(crop.dimensions(), (4, 4));
    assert_eq!(*crop.get_pixel(3, 3), Rgb([255, 0, 0]));

    let scaled = crop_resized(&image, &BBox::new(0.0, 0.0, 10.0, 5.0), 8).unwrap();
    assert_eq!(scaled.dimensions(), (8, 8));
  }

  #[test]
  fn crop_outside_image_fails() {
    let image = RgbImage::new(20, 20);
    let bbox = BBox::new(25.0, 0.0, 5.0, 5.0);
    assert_eq!(
      crop_resized(&image, &bbox, 4),
      Err(TensorError::EmptyCrop(bbox))
    );
    let flat = BBox::new(2.0, 2.0, 0.2, 5.0);
    assert!(crop_resized(&image, &flat, 4).is_err());
  }
}
