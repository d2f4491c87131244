// 该文件是 Shanan （山南西风） 项目的一部分。
// src/gallery.rs - 注册样本库与相似度匹配
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

use std::{cmp::Ordering, collections::BTreeMap, fmt, path::Path};

use serde::{
  Deserialize, Deserializer, Serialize,
  de::{MapAccess, Visitor},
};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme, model::Similarity};

pub const DEFAULT_EMBEDDING_SIZE: usize = 256;

const EMBEDDINGS_FILE: &str = "embeds.csv";
const CLASSES_FILE: &str = "classes.csv";

pub type Embedding = Vec<f32>;

#[derive(Error, Debug)]
pub enum GalleryError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
  #[error("{file} 第 {line} 行无法解析: {reason}")]
  ParseError {
    file: &'static str,
    line: usize,
    reason: String,
  },
  #[error("类别 {label} 的特征维度不匹配: 期望 {expected}, 实际 {actual}")]
  DimensionMismatch {
    label: String,
    expected: usize,
    actual: usize,
  },
  #[error("类别 {0} 没有参考特征")]
  EmptyClass(String),
  #[error("类别 {0} 重复")]
  DuplicateLabel(String),
  #[error("类别 {label} 的结束下标 {end} 超出范围 ({start}..={total})")]
  IndexOutOfRange {
    label: String,
    start: usize,
    end: usize,
    total: usize,
  },
  #[error("有 {0} 条参考特征未分配到任何类别")]
  UnassignedEmbeddings(usize),
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
}

/// 某个类别对查询特征的得分
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelScore {
  pub label: String,
  pub score: f32,
}

/// 注册样本库：类别名到一组参考特征的映射
#[derive(Debug, Clone)]
pub struct Gallery {
  dim: usize,
  classes: BTreeMap<String, Vec<Embedding>>,
}

impl Default for Gallery {
  fn default() -> Self {
    Self::new(DEFAULT_EMBEDDING_SIZE)
  }
}

impl Gallery {
  pub fn new(dim: usize) -> Self {
    Self {
      dim,
      classes: BTreeMap::new(),
    }
  }

  pub fn dim(&self) -> usize {
    self.dim
  }

  pub fn len(&self) -> usize {
    self.classes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.classes.is_empty()
  }

  pub fn labels(&self) -> impl Iterator<Item = &str> {
    self.classes.keys().map(String::as_str)
  }

  pub fn get(&self, label: &str) -> Option<&[Embedding]> {
    self.classes.get(label).map(Vec::as_slice)
  }

  /// 注册一个类别，已存在的同名类别被整体替换并返回
  pub fn insert(
    &mut self,
    label: impl Into<String>,
    embeddings: Vec<Embedding>,
  ) -> Result<Option<Vec<Embedding>>, GalleryError> {
    let label = label.into();
    if embeddings.is_empty() {
      return Err(GalleryError::EmptyClass(label));
    }
    if let Some(bad) = embeddings.iter().find(|e| e.len() != self.dim) {
      return Err(GalleryError::DimensionMismatch {
        label,
        expected: self.dim,
        actual: bad.len(),
      });
    }
    debug!("注册类别 {}: {} 条参考特征", label, embeddings.len());
    Ok(self.classes.insert(label, embeddings))
  }

  /// 由 `embeds.csv`（每行一条特征）与 `classes.csv`（每行 `结束下标,类别名`）构建
  ///
  /// 结束下标是累计的、不含端点的行号，相邻两行之间的特征属于同一类别。
  pub fn from_csv(dim: usize, embeddings: &str, classes: &str) -> Result<Self, GalleryError> {
    let rows = embeddings
      .lines()
      .enumerate()
      .filter(|(_, l)| !l.trim().is_empty())
      .map(|(line, l)| {
        l.split(',')
          .map(|v| v.trim().parse::<f32>())
          .collect::<Result<Embedding, _>>()
          .map_err(|e| GalleryError::ParseError {
            file: EMBEDDINGS_FILE,
            line: line + 1,
            reason: e.to_string(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    let mut gallery = Gallery::new(dim);
    let mut start = 0usize;
    for (line, l) in classes.lines().enumerate() {
      let l = l.trim();
      if l.is_empty() {
        continue;
      }
      let (end, label) = l.split_once(',').ok_or_else(|| GalleryError::ParseError {
        file: CLASSES_FILE,
        line: line + 1,
        reason: "缺少逗号分隔的类别名".to_string(),
      })?;
      let end = end.trim().parse::<usize>().map_err(|e| GalleryError::ParseError {
        file: CLASSES_FILE,
        line: line + 1,
        reason: e.to_string(),
      })?;
      let label = label.trim().to_string();

      if end <= start || end > rows.len() {
        error!("类别 {} 的结束下标 {} 无效", label, end);
        return Err(GalleryError::IndexOutOfRange {
          label,
          start,
          end,
          total: rows.len(),
        });
      }
      if gallery.classes.contains_key(&label) {
        return Err(GalleryError::DuplicateLabel(label));
      }
      gallery.insert(label, rows[start..end].to_vec())?;
      start = end;
    }

    if start != rows.len() {
      return Err(GalleryError::UnassignedEmbeddings(rows.len() - start));
    }
    Ok(gallery)
  }

  pub fn from_csv_dir<P: AsRef<Path>>(dim: usize, directory: P) -> Result<Self, GalleryError> {
    let directory = directory.as_ref();
    info!("从目录加载样本库: {}", directory.display());
    let embeddings = std::fs::read_to_string(directory.join(EMBEDDINGS_FILE))?;
    let classes = std::fs::read_to_string(directory.join(CLASSES_FILE))?;
    let gallery = Self::from_csv(dim, &embeddings, &classes)?;
    info!("样本库加载完成: {} 个类别", gallery.len());
    Ok(gallery)
  }

  /// JSON 格式：`{"类别名": [[f32; dim], ...], ...}`，同名类别重复出现视为错误
  pub fn from_json(dim: usize, text: &str) -> Result<Self, GalleryError> {
    let JsonClasses(classes) = serde_json::from_str(text)?;
    let mut gallery = Gallery::new(dim);
    for (label, embeddings) in classes {
      if gallery.classes.contains_key(&label) {
        error!("样本库 JSON 中类别 {} 重复", label);
        return Err(GalleryError::DuplicateLabel(label));
      }
      gallery.insert(label, embeddings)?;
    }
    Ok(gallery)
  }

  pub fn from_json_file<P: AsRef<Path>>(dim: usize, path: P) -> Result<Self, GalleryError> {
    let path = path.as_ref();
    info!("从 JSON 文件加载样本库: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let gallery = Self::from_json(dim, &text)?;
    info!("样本库加载完成: {} 个类别", gallery.len());
    Ok(gallery)
  }

  /// 计算每个类别的得分并排序
  ///
  /// 类别得分为查询特征与该类别全部参考特征相似度的最大值。
  /// 按得分降序排列，得分相同时按类别名升序，结果与遍历顺序无关。
  pub fn rank_labels<S: Similarity>(
    &self,
    query: &[f32],
    similarity: &S,
  ) -> Result<Vec<LabelScore>, S::Error> {
    let mut ranking = Vec::with_capacity(self.classes.len());
    for (label, embeddings) in &self.classes {
      let mut best = f32::NEG_INFINITY;
      for reference in embeddings {
        let score = similarity.similarity(query, reference)?;
        if score > best {
          best = score;
        }
      }
      if !best.is_finite() {
        warn!("类别 {} 的得分无效: {}", label, best);
      }
      ranking.push(LabelScore {
        label: label.clone(),
        score: best,
      });
    }

    ranking.sort_by(compare_label_scores);
    Ok(ranking)
  }

  /// 得分最高的类别；样本库为空时返回 `None`
  pub fn best_match<S: Similarity>(
    &self,
    query: &[f32],
    similarity: &S,
  ) -> Result<Option<LabelScore>, S::Error> {
    Ok(self.rank_labels(query, similarity)?.into_iter().next())
  }
}

/// 按出现顺序保留 JSON 对象的全部键值对，重复的键不会被覆盖
struct JsonClasses(Vec<(String, Vec<Embedding>)>);

impl<'de> Deserialize<'de> for JsonClasses {
  fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
  where
    D: Deserializer<'de>,
  {
    struct ClassesVisitor;

    impl<'de> Visitor<'de> for ClassesVisitor {
      type Value = JsonClasses;

      fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("类别名到参考特征列表的映射")
      }

      fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
      where
        A: MapAccess<'de>,
      {
        let mut classes = Vec::with_capacity(map.size_hint().unwrap_or(0));
        while let Some(entry) = map.next_entry::<String, Vec<Embedding>>()? {
          classes.push(entry);
        }
        Ok(JsonClasses(classes))
      }
    }

    deserializer.deserialize_map(ClassesVisitor)
  }
}

fn compare_label_scores(a: &LabelScore, b: &LabelScore) -> Ordering {
  b.score
    .total_cmp(&a.score)
    .then_with(|| a.label.cmp(&b.label))
}

impl FromUrlWithScheme for Gallery {
  const SCHEME: &'static str = "gallery";
}

impl FromUrl for Gallery {
  type Error = GalleryError;

  /// `gallery:///dir?dim=256` 读取目录下的 CSV 文件，
  /// `gallery:///file.json` 读取 JSON 文件
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(GalleryError::SchemeMismatch);
    }

    let mut dim = DEFAULT_EMBEDDING_SIZE;
    for (k, v) in url.query_pairs() {
      if k == "dim" {
        dim = v
          .parse::<usize>()
          .map_err(|_| GalleryError::InvalidParameter(k.to_string(), v.to_string()))?;
      }
    }

    let path = Path::new(url.path());
    if path.extension().is_some_and(|ext| ext == "json") {
      Self::from_json_file(dim, path)
    } else {
      Self::from_csv_dir(dim, path)
    }
  }
}
