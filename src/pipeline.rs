// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 检测、抑制与小样本分类流水线
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
  convert::Infallible,
  fmt::Display,
  time::{Duration, Instant},
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::{
  anchor::AnchorGrid,
  decode::{Candidate, DecodeError, Proposal, decode_candidates, to_corner_form},
  gallery::{Embedding, Gallery},
  geometry::BBox,
  model::{Model, Similarity},
  suppress::suppress,
  tensor::{self, Normalization, RgbTensor, TensorError},
};

const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_IOU_THRESHOLD: f32 = 0.2;
const DEFAULT_PROPOSAL_INPUT_SIZE: u32 = 320;
const DEFAULT_EMBEDDING_INPUT_SIZE: u32 = 100;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("候选框网络推理失败: {0}")]
  Proposal(String),
  #[error("候选框解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("第 {index} 个检测框裁剪失败: {source}")]
  Crop { index: usize, source: TensorError },
  #[error("第 {index} 个检测框特征提取失败: {reason}")]
  Embedding { index: usize, reason: String },
  #[error("第 {index} 个特征维度不匹配: 期望 {expected}, 实际 {actual}")]
  EmbeddingSize {
    index: usize,
    expected: usize,
    actual: usize,
  },
  #[error("第 {index} 个特征相似度计算失败: {reason}")]
  Similarity { index: usize, reason: String },
  #[error("样本库为空")]
  EmptyGallery,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
  /// 目标置信度阈值，严格大于该值的锚框才会被解码
  pub confidence_threshold: f32,
  /// NMS 交并比阈值
  pub iou_threshold: f32,
  /// 候选框网络输入边长，检测框坐标均位于该像素空间
  pub proposal_input_size: u32,
  /// 特征提取网络输入边长
  pub embedding_input_size: u32,
  pub proposal_normalization: Normalization,
  pub embedding_normalization: Normalization,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
      iou_threshold: DEFAULT_IOU_THRESHOLD,
      proposal_input_size: DEFAULT_PROPOSAL_INPUT_SIZE,
      embedding_input_size: DEFAULT_EMBEDDING_INPUT_SIZE,
      proposal_normalization: Normalization::MobileNet,
      embedding_normalization: Normalization::Raw,
    }
  }
}

impl PipelineConfig {
  pub fn confidence_threshold(mut self, threshold: f32) -> Self {
    self.confidence_threshold = threshold;
    self
  }

  pub fn iou_threshold(mut self, threshold: f32) -> Self {
    self.iou_threshold = threshold;
    self
  }

  pub fn proposal_input_size(mut self, size: u32) -> Self {
    self.proposal_input_size = size;
    self
  }

  pub fn embedding_input_size(mut self, size: u32) -> Self {
    self.embedding_input_size = size;
    self
  }

  pub fn proposal_normalization(mut self, normalization: Normalization) -> Self {
    self.proposal_normalization = normalization;
    self
  }

  pub fn embedding_normalization(mut self, normalization: Normalization) -> Self {
    self.embedding_normalization = normalization;
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StageStatus {
  #[default]
  Succeeded,
  /// 上游没有产生任何输入，本阶段未执行
  Skipped,
  Failed(String),
}

impl StageStatus {
  pub fn is_failed(&self) -> bool {
    matches!(self, StageStatus::Failed(_))
  }
}

/// 单个阶段的结果：失败时仍携带已完成的部分输出
#[derive(Debug)]
pub struct StageResult<T> {
  pub output: T,
  pub status: StageStatus,
}

impl<T> StageResult<T> {
  fn succeeded(output: T) -> Self {
    Self {
      output,
      status: StageStatus::Succeeded,
    }
  }

  fn skipped(output: T) -> Self {
    Self {
      output,
      status: StageStatus::Skipped,
    }
  }

  fn failed(output: T, stage: &str, err: PipelineError) -> Self {
    error!("{}阶段失败: {}", stage, err);
    Self {
      output,
      status: StageStatus::Failed(err.to_string()),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StageReport {
  pub decode: StageStatus,
  pub embed: StageStatus,
  pub matching: StageStatus,
}

impl StageReport {
  pub fn all_succeeded(&self) -> bool {
    [&self.decode, &self.embed, &self.matching]
      .iter()
      .all(|s| !s.is_failed())
  }
}

/// 各阶段耗时：解码（含推理与 NMS）、特征提取、样本库匹配
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timings {
  pub decode: Duration,
  pub embed: Duration,
  pub matching: Duration,
}

impl Timings {
  pub fn total(&self) -> Duration {
    self.decode + self.embed + self.matching
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
  pub bbox: BBox,
  pub label: String,
  pub score: f32,
}

/// 单张图像的预测结果
#[derive(Debug, Clone, Default)]
pub struct Prediction {
  /// NMS 后保留的检测框，按候选框下标排序
  pub detections: Vec<Candidate<BBox>>,
  /// 与 `detections` 前缀一一对应的分类结果，特征提取或匹配中途失败时可能更短
  pub classifications: Vec<Classification>,
  pub stages: StageReport,
  pub timings: Timings,
}

impl Prediction {
  pub fn is_empty(&self) -> bool {
    self.detections.is_empty()
  }
}

/// 小样本检测流水线，持有锚框网格、样本库与三个外部模型
pub struct Pipeline<P, E, S> {
  config: PipelineConfig,
  anchors: AnchorGrid,
  gallery: Gallery,
  proposal: P,
  embedding: E,
  similarity: S,
}

impl<P, E, S> Pipeline<P, E, S>
where
  P: Model<Input = RgbTensor, Output = Proposal>,
  P::Error: Display,
  E: Model<Input = RgbTensor, Output = Embedding>,
  E::Error: Display,
  S: Similarity,
  S::Error: Display,
{
  pub fn new(
    config: PipelineConfig,
    anchors: AnchorGrid,
    gallery: Gallery,
    proposal: P,
    embedding: E,
    similarity: S,
  ) -> Self {
    info!(
      "创建流水线: 置信度阈值 {}, NMS 阈值 {}, 样本库 {} 个类别",
      config.confidence_threshold,
      config.iou_threshold,
      gallery.len()
    );
    Self {
      config,
      anchors,
      gallery,
      proposal,
      embedding,
      similarity,
    }
  }

  pub fn config(&self) -> &PipelineConfig {
    &self.config
  }

  pub fn anchors(&self) -> &AnchorGrid {
    &self.anchors
  }

  pub fn gallery(&self) -> &Gallery {
    &self.gallery
  }

  /// 整体替换样本库，返回旧的样本库
  pub fn replace_gallery(&mut self, gallery: Gallery) -> Gallery {
    info!("替换样本库: {} 个类别", gallery.len());
    std::mem::replace(&mut self.gallery, gallery)
  }

  /// 对一张图像执行完整流水线
  ///
  /// 任何阶段的失败都只记录在 [`StageReport`] 中，后续阶段在已有的（可能为空的）
  /// 输出上继续执行，本函数不会因外部推理失败而返回错误。
  pub fn predict(&self, image: &RgbImage) -> Prediction {
    let size = self.config.proposal_input_size;
    let resized = tensor::resize(image, size, size);

    let now = Instant::now();
    let detected = self.detect(&resized);
    let decode_time = now.elapsed();
    debug!("检测框生成耗时: {:.2?}", decode_time);

    let boxes: Vec<BBox> = detected.output.iter().map(|c| c.bbox).collect();

    let now = Instant::now();
    let embedded = self.embed(&resized, &boxes);
    let embed_time = now.elapsed();
    debug!("特征提取耗时: {:.2?}", embed_time);

    let now = Instant::now();
    let matched = self.classify(&boxes, &embedded.output);
    let matching_time = now.elapsed();
    debug!("样本库匹配耗时: {:.2?}", matching_time);

    let prediction = Prediction {
      detections: detected.output,
      classifications: matched.output,
      stages: StageReport {
        decode: detected.status,
        embed: embedded.status,
        matching: matched.status,
      },
      timings: Timings {
        decode: decode_time,
        embed: embed_time,
        matching: matching_time,
      },
    };
    info!(
      "预测完成: {} 个检测框, {} 个分类结果, 总耗时 {:.2?}",
      prediction.detections.len(),
      prediction.classifications.len(),
      prediction.timings.total()
    );
    prediction
  }

  /// 推理、解码、坐标转换与 NMS
  pub fn detect(&self, image: &RgbImage) -> StageResult<Vec<Candidate<BBox>>> {
    let input = RgbTensor::from_image(image, self.config.proposal_normalization);
    let proposal = match self.proposal.infer(&input) {
      Ok(proposal) => proposal,
      Err(e) => {
        return StageResult::failed(Vec::new(), "检测框生成", PipelineError::Proposal(e.to_string()));
      }
    };

    let centers = match decode_candidates(&proposal, &self.anchors, self.config.confidence_threshold) {
      Ok(centers) => centers,
      Err(e) => return StageResult::failed(Vec::new(), "检测框生成", e.into()),
    };
    let candidates = to_corner_form(&centers);
    StageResult::succeeded(suppress(&candidates, self.config.iou_threshold))
  }

  /// 为每个检测框提取特征，遇到第一个失败即停止，保留已提取的特征
  pub fn embed(&self, image: &RgbImage, boxes: &[BBox]) -> StageResult<Vec<Embedding>> {
    if boxes.is_empty() {
      return StageResult::skipped(Vec::new());
    }

    let expected = self.gallery.dim();
    let mut embeddings = Vec::with_capacity(boxes.len());
    for (index, bbox) in boxes.iter().enumerate() {
      let crop = match tensor::crop_resized(image, bbox, self.config.embedding_input_size) {
        Ok(crop) => crop,
        Err(source) => {
          return StageResult::failed(embeddings, "特征提取", PipelineError::Crop { index, source });
        }
      };
      let input = RgbTensor::from_image(&crop, self.config.embedding_normalization);
      let embedding = match self.embedding.infer(&input) {
        Ok(embedding) => embedding,
        Err(e) => {
          let err = PipelineError::Embedding {
            index,
            reason: e.to_string(),
          };
          return StageResult::failed(embeddings, "特征提取", err);
        }
      };
      if embedding.len() != expected {
        let err = PipelineError::EmbeddingSize {
          index,
          expected,
          actual: embedding.len(),
        };
        return StageResult::failed(embeddings, "特征提取", err);
      }
      embeddings.push(embedding);
    }
    StageResult::succeeded(embeddings)
  }

  /// 逐个特征在样本库中匹配，只处理实际产生的特征
  pub fn classify(&self, boxes: &[BBox], embeddings: &[Embedding]) -> StageResult<Vec<Classification>> {
    if embeddings.is_empty() {
      return StageResult::skipped(Vec::new());
    }
    if self.gallery.is_empty() {
      return StageResult::failed(Vec::new(), "样本库匹配", PipelineError::EmptyGallery);
    }
    if embeddings.len() < boxes.len() {
      warn!(
        "仅有 {}/{} 个检测框得到特征，其余检测框不做分类",
        embeddings.len(),
        boxes.len()
      );
    }

    let mut classifications = Vec::with_capacity(embeddings.len());
    for (index, (bbox, embedding)) in boxes.iter().zip(embeddings).enumerate() {
      match self.gallery.best_match(embedding, &self.similarity) {
        Ok(Some(best)) => {
          debug!("检测框 {}: {} ({:.4})", index, best.label, best.score);
          classifications.push(Classification {
            bbox: *bbox,
            label: best.label,
            score: best.score,
          });
        }
        Ok(None) => {
          return StageResult::failed(classifications, "样本库匹配", PipelineError::EmptyGallery);
        }
        Err(e) => {
          let err = PipelineError::Similarity {
            index,
            reason: e.to_string(),
          };
          return StageResult::failed(classifications, "样本库匹配", err);
        }
      }
    }
    StageResult::succeeded(classifications)
  }
}

/// 流水线本身也是一个模型：输入原始图像，输出预测结果，永不失败
impl<P, E, S> Model for Pipeline<P, E, S>
where
  P: Model<Input = RgbTensor, Output = Proposal>,
  P::Error: Display,
  E: Model<Input = RgbTensor, Output = Embedding>,
  E::Error: Display,
  S: Similarity,
  S::Error: Display,
{
  type Input = RgbImage;
  type Output = Prediction;
  type Error = Infallible;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    Ok(self.predict(input))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{anchor::GridLayout, model::CosineSimilarity};
  use std::cell::Cell;

  #[derive(Debug)]
  struct MockError(&'static str);

  impl Display for MockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.write_str(self.0)
    }
  }

  struct FixedProposal(Option<Proposal>);

  impl Model for FixedProposal {
    type Input = RgbTensor;
    type Output = Proposal;
    type Error = MockError;

    fn infer(&self, _input: &Self::Input) -> Result<Self::Output, Self::Error> {
      self.0.clone().ok_or(MockError("npu offline"))
    }
  }

  /// 依次返回预设特征，`fail_at` 处返回错误
  struct ScriptedEmbedding {
    outputs: Vec<Embedding>,
    fail_at: Option<usize>,
    calls: Cell<usize>,
  }

  impl ScriptedEmbedding {
    fn new(outputs: Vec<Embedding>) -> Self {
      Self {
        outputs,
        fail_at: None,
        calls: Cell::new(0),
      }
    }
  }

  impl Model for ScriptedEmbedding {
    type Input = RgbTensor;
    type Output = Embedding;
    type Error = MockError;

    fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
      assert_eq!(input.width(), 100);
      let call = self.calls.get();
      self.calls.set(call + 1);
      if self.fail_at == Some(call) {
        return Err(MockError("extractor crashed"));
      }
      Ok(self.outputs[call % self.outputs.len()].clone())
    }
  }

  struct CountingSimilarity {
    calls: Cell<usize>,
  }

  impl Similarity for CountingSimilarity {
    type Error = MockError;

    fn similarity(&self, a: &[f32], b: &[f32]) -> Result<f32, Self::Error> {
      self.calls.set(self.calls.get() + 1);
      Ok(CosineSimilarity.similarity(a, b).unwrap_or(0.0))
    }
  }

  struct BrokenSimilarity;

  impl Similarity for BrokenSimilarity {
    type Error = MockError;

    fn similarity(&self, _a: &[f32], _b: &[f32]) -> Result<f32, Self::Error> {
      Err(MockError("head unavailable"))
    }
  }

  const LAYOUT: GridLayout = GridLayout {
    rows: 2,
    cols: 2,
    anchors: 1,
  };

  /// 2x2 网格，每个单元一个 40x40 锚框，中心位于单元中心（单元边长 160）
  fn anchors() -> AnchorGrid {
    let mut values = Vec::new();
    for row in 0..2 {
      for col in 0..2 {
        values.extend([col as f32 * 160.0 + 80.0, row as f32 * 160.0 + 80.0, 40.0, 40.0]);
      }
    }
    AnchorGrid::from_values(LAYOUT, &values).unwrap()
  }

  fn gallery() -> Gallery {
    let mut gallery = Gallery::new(2);
    gallery.insert("plain", vec![vec![1.0, 0.0]]).unwrap();
    gallery
      .insert("glazed", vec![vec![0.0, 1.0], vec![0.6, 0.8]])
      .unwrap();
    gallery
  }

  fn proposal(objectness: [f32; 4]) -> Proposal {
    Proposal {
      objectness: objectness.to_vec(),
      offsets: vec![0.0; LAYOUT.offsets_len()],
    }
  }

  fn image() -> RgbImage {
    RgbImage::new(320, 320)
  }

  fn pipeline<E, S>(
    proposal: Option<Proposal>,
    embedding: E,
    similarity: S,
  ) -> Pipeline<FixedProposal, E, S>
  where
    E: Model<Input = RgbTensor, Output = Embedding>,
    E::Error: Display,
    S: Similarity,
    S::Error: Display,
  {
    Pipeline::new(
      PipelineConfig::default(),
      anchors(),
      gallery(),
      FixedProposal(proposal),
      embedding,
      similarity,
    )
  }

  fn counting() -> CountingSimilarity {
    CountingSimilarity {
      calls: Cell::new(0),
    }
  }

  #[test]
  fn end_to_end_classification() {
    let embedder = ScriptedEmbedding::new(vec![vec![0.0, 2.0], vec![3.0, 0.1]]);
    let p = pipeline(Some(proposal([0.9, 0.1, 0.2, 0.8])), embedder, counting());
    let prediction = p.predict(&image());

    assert!(prediction.stages.all_succeeded());
    assert_eq!(prediction.detections.len(), 2);
    assert_eq!(prediction.detections[0].bbox, BBox::new(60.0, 60.0, 40.0, 40.0));
    assert_eq!(prediction.detections[1].bbox, BBox::new(220.0, 220.0, 40.0, 40.0));

    let labels: Vec<&str> = prediction
      .classifications
      .iter()
      .map(|c| c.label.as_str())
      .collect();
    assert_eq!(labels, vec!["glazed", "plain"]);
    assert_eq!(prediction.classifications[0].bbox, prediction.detections[0].bbox);
    assert!((prediction.classifications[0].score - 1.0).abs() < 1e-6);
    // 两个特征各与 3 条参考特征比较
    assert_eq!(p.similarity.calls.get(), 6);
  }

  #[test]
  fn nothing_above_threshold_issues_no_downstream_calls() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let p = pipeline(Some(proposal([0.1, 0.2, 0.3, 0.5])), embedder, counting());
    let prediction = p.predict(&image());

    assert!(prediction.is_empty());
    assert!(prediction.classifications.is_empty());
    assert_eq!(prediction.stages.decode, StageStatus::Succeeded);
    assert_eq!(prediction.stages.embed, StageStatus::Skipped);
    assert_eq!(prediction.stages.matching, StageStatus::Skipped);
    assert_eq!(p.embedding.calls.get(), 0);
    assert_eq!(p.similarity.calls.get(), 0);
  }

  #[test]
  fn proposal_failure_is_reported_not_raised() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let p = pipeline(None, embedder, counting());
    let prediction = p.predict(&image());

    assert!(prediction.is_empty());
    assert!(matches!(
      &prediction.stages.decode,
      StageStatus::Failed(reason) if reason.contains("npu offline")
    ));
    assert_eq!(prediction.stages.embed, StageStatus::Skipped);
    assert_eq!(p.embedding.calls.get(), 0);
  }

  #[test]
  fn malformed_proposal_is_a_decode_failure() {
    let bad = Proposal {
      objectness: vec![0.9; 3],
      offsets: vec![0.0; 16],
    };
    let p = pipeline(Some(bad), ScriptedEmbedding::new(vec![vec![1.0, 0.0]]), counting());
    let prediction = p.predict(&image());
    assert!(prediction.stages.decode.is_failed());
    assert!(prediction.detections.is_empty());
  }

  #[test]
  fn partial_embedding_batch_is_still_classified() {
    let mut embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    embedder.fail_at = Some(1);
    let p = pipeline(Some(proposal([0.9, 0.9, 0.9, 0.1])), embedder, counting());
    let prediction = p.predict(&image());

    assert_eq!(prediction.detections.len(), 3);
    assert!(prediction.stages.embed.is_failed());
    assert_eq!(prediction.stages.matching, StageStatus::Succeeded);
    assert_eq!(prediction.classifications.len(), 1);
    assert_eq!(prediction.classifications[0].label, "plain");
    assert_eq!(prediction.classifications[0].bbox, prediction.detections[0].bbox);
  }

  #[test]
  fn wrong_embedding_length_stops_extraction() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0, 0.0]]);
    let p = pipeline(Some(proposal([0.9, 0.1, 0.1, 0.1])), embedder, counting());
    let prediction = p.predict(&image());
    assert!(matches!(
      &prediction.stages.embed,
      StageStatus::Failed(reason) if reason.contains("维度")
    ));
    assert_eq!(prediction.stages.matching, StageStatus::Skipped);
    assert_eq!(prediction.detections.len(), 1);
  }

  #[test]
  fn similarity_failure_keeps_detections() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let p = pipeline(Some(proposal([0.9, 0.9, 0.1, 0.1])), embedder, BrokenSimilarity);
    let prediction = p.predict(&image());
    assert_eq!(prediction.detections.len(), 2);
    assert!(prediction.stages.matching.is_failed());
    assert!(prediction.classifications.is_empty());
  }

  #[test]
  fn empty_gallery_fails_matching_only() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let mut p = pipeline(Some(proposal([0.9, 0.1, 0.1, 0.1])), embedder, counting());
    let old = p.replace_gallery(Gallery::new(2));
    assert_eq!(old.len(), 2);

    let prediction = p.predict(&image());
    assert_eq!(prediction.stages.embed, StageStatus::Succeeded);
    assert!(matches!(
      &prediction.stages.matching,
      StageStatus::Failed(reason) if reason.contains("样本库为空")
    ));
  }

  #[test]
  fn overlapping_candidates_are_suppressed() {
    // 第二个锚框向左偏移到与第一个重叠
    let mut proposal = proposal([0.9, 0.95, 0.1, 0.1]);
    proposal.offsets[4] = -3.9;
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let p = pipeline(Some(proposal), embedder, counting());

    let prediction = p.predict(&image());
    assert_eq!(prediction.detections.len(), 1);
    assert_eq!(prediction.detections[0].score, 0.95);
  }

  #[test]
  fn timings_add_up() {
    let t = Timings {
      decode: Duration::from_millis(3),
      embed: Duration::from_millis(5),
      matching: Duration::from_millis(7),
    };
    assert_eq!(t.total(), Duration::from_millis(15));
  }

  #[test]
  fn input_is_resized_to_proposal_size() {
    let embedder = ScriptedEmbedding::new(vec![vec![1.0, 0.0]]);
    let p = pipeline(Some(proposal([0.9, 0.1, 0.1, 0.1])), embedder, counting());
    let prediction = p.predict(&RgbImage::new(640, 480));
    assert_eq!(prediction.classifications.len(), 1);
  }
}
