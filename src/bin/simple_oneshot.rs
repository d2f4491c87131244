// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/simple_oneshot.rs - 单张图像的小样本检测
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
  task::{OneShotTask, Task},
  tensor::Normalization,
};
use tracing::info;

/// Shanan 小样本检测参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 锚框文件，如 anchors:///data/anchors.csv?rows=20&cols=20&anchors=9
  #[arg(long, value_name = "ANCHORS")]
  pub anchors: Url,
  /// 样本库，如 gallery:///data/gallery 或 gallery:///data/gallery.json
  #[arg(long, value_name = "GALLERY")]
  pub gallery: Url,
  /// 候选框网络输出回放文件
  #[arg(long, value_name = "PROPOSAL")]
  pub proposal: Url,
  /// 特征提取网络输出回放文件
  #[arg(long, value_name = "EMBEDDING")]
  pub embedding: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.5", value_name = "THRESHOLD")]
  pub confidence: f32,
  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.2", value_name = "THRESHOLD")]
  pub nms_threshold: f32,
  /// 候选框网络输入归一化方式 (mobilenet / vgg / raw)
  #[arg(long, default_value = "mobilenet", value_name = "KIND")]
  pub proposal_normalization: Normalization,
  /// 特征提取网络输入归一化方式 (mobilenet / vgg / raw)
  #[arg(long, default_value = "raw", value_name = "KIND")]
  pub embedding_normalization: Normalization,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("锚框文件: {}", args.anchors);
  info!("样本库: {}", args.gallery);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let config = PipelineConfig::default()
    .confidence_threshold(args.confidence)
    .iou_threshold(args.nms_threshold)
    .proposal_normalization(args.proposal_normalization)
    .embedding_normalization(args.embedding_normalization);

  let pipeline = Pipeline::new(
    config,
    AnchorGrid::from_url(&args.anchors)?,
    Gallery::from_url(&args.gallery)?,
    ReplayProposal::from_url(&args.proposal)?,
    ReplayEmbedding::from_url(&args.embedding)?,
    CosineSimilarity,
  );
  let input = shanan_fewshot::input::InputWrapper::from_url(&args.input)?;
  let output = shanan_fewshot::output::OutputWrapper::from_url(&args.output)?;

  OneShotTask.run_task(input, pipeline, output)?;

  Ok(())
}
