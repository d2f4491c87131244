// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/directory_record.rs - 目录记录输出
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

use std::{
  path::PathBuf,
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{Datelike, Utc};
use image::RgbImage;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::Render,
  pipeline::{Prediction, StageStatus},
};

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 按日期目录保存每次预测的 JSON 记录：`folder:///dir?always&image`
///
/// `always` 时没有检测结果也记录，`image` 时同时保存输入图像。
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  frame_counter: AtomicU16,
  always: bool,
  save_image: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    let save_image = uri.query_pairs().any(|(k, _)| k == "image");

    Ok(DirectoryRecordOutput {
      directory: PathBuf::from(uri.path()),
      frame_counter: AtomicU16::new(0),
      always,
      save_image,
    })
  }
}

fn stage_value(status: &StageStatus) -> Value {
  match status {
    StageStatus::Succeeded => json!({ "status": "succeeded" }),
    StageStatus::Skipped => json!({ "status": "skipped" }),
    StageStatus::Failed(reason) => json!({ "status": "failed", "reason": reason }),
  }
}

/// 预测结果的 JSON 表示
pub fn prediction_record(result: &Prediction) -> Value {
  let detections: Vec<Value> = result
    .detections
    .iter()
    .map(|d| json!({ "bbox": d.bbox, "score": d.score }))
    .collect();

  json!({
    "detections": detections,
    "classifications": result.classifications,
    "stages": {
      "decode": stage_value(&result.stages.decode),
      "embed": stage_value(&result.stages.embed),
      "matching": stage_value(&result.stages.matching),
    },
    "timings_ms": {
      "decode": result.timings.decode.as_secs_f64() * 1e3,
      "embed": result.timings.embed.as_secs_f64() * 1e3,
      "matching": result.timings.matching.as_secs_f64() * 1e3,
      "total": result.timings.total().as_secs_f64() * 1e3,
    },
  })
}

impl DirectoryRecordOutput {
  fn frame_id(&self) -> u16 {
    self.frame_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn frame_path(&self) -> Result<PathBuf, DirectoryRecordOutputError> {
    let now = Utc::now();
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;

    Ok(directory.join(format!(
      "{}-{:04X}.json",
      now.format("%H-%M-%S"),
      self.frame_id()
    )))
  }
}

impl Render<RgbImage, Prediction> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbImage, result: &Prediction) -> Result<(), Self::Error> {
    if !self.always && result.is_empty() {
      return Ok(());
    }

    let path = self.frame_path()?;
    std::fs::write(&path, serde_json::to_string_pretty(&prediction_record(result))?)?;
    if self.save_image {
      frame.save(path.with_extension("png"))?;
    }
    debug!("记录已保存: {}", path.display());
    Ok(())
  }
}
