// 该文件是 Shanan （山南西风） 项目的一部分。
// src/anchor.rs - 锚框网格
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

use std::path::Path;

use thiserror::Error;
use tracing::{debug, error, info};
use url::Url;

use crate::{FromUrl, FromUrlWithScheme};

pub const ANCHOR_COORDINATES: usize = 4;

const DEFAULT_GRID_ROWS: usize = 20;
const DEFAULT_GRID_COLS: usize = 20;
const DEFAULT_ANCHORS_PER_CELL: usize = 9;

#[derive(Error, Debug)]
pub enum AnchorError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("锚框文件为空")]
  Empty,
  #[error("第 {index} 个数值无法解析: {value:?}")]
  ParseError { index: usize, value: String },
  #[error("锚框数量不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
  #[error("第 {index} 个锚框尺寸无效: w={w}, h={h}")]
  NonPositiveExtent { index: usize, w: f32, h: f32 },
  #[error("参数 {0} 无效: {1}")]
  InvalidParameter(String, String),
}

/// 网格形状：`rows × cols` 个单元，每个单元 `anchors` 个锚框
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
  pub rows: usize,
  pub cols: usize,
  pub anchors: usize,
}

impl Default for GridLayout {
  fn default() -> Self {
    Self {
      rows: DEFAULT_GRID_ROWS,
      cols: DEFAULT_GRID_COLS,
      anchors: DEFAULT_ANCHORS_PER_CELL,
    }
  }
}

impl GridLayout {
  pub fn new(rows: usize, cols: usize, anchors: usize) -> Self {
    Self {
      rows,
      cols,
      anchors,
    }
  }

  pub fn cells(&self) -> usize {
    self.rows * self.cols
  }

  /// 目标置信度张量长度
  pub fn objectness_len(&self) -> usize {
    self.cells() * self.anchors
  }

  /// 偏移张量（以及锚框序列）长度
  pub fn offsets_len(&self) -> usize {
    self.objectness_len() * ANCHOR_COORDINATES
  }

  /// `(row, col, anchor)` 在展平序列中的锚框序号
  pub fn slot(&self, row: usize, col: usize, anchor: usize) -> usize {
    (row * self.cols + col) * self.anchors + anchor
  }
}

/// 中心形式的参考框
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
  pub cx: f32,
  pub cy: f32,
  pub w: f32,
  pub h: f32,
}

/// 加载后不可变的锚框网格
#[derive(Debug, Clone)]
pub struct AnchorGrid {
  layout: GridLayout,
  anchors: Box<[Anchor]>,
}

impl AnchorGrid {
  /// 由 `[cx, cy, w, h]` 展平序列构建，按行优先的网格顺序排列
  pub fn from_values(layout: GridLayout, values: &[f32]) -> Result<Self, AnchorError> {
    let expected = layout.offsets_len();
    if values.len() != expected {
      error!(
        "锚框数量不匹配: 期望长度 {}, 实际长度 {}",
        expected,
        values.len()
      );
      return Err(AnchorError::LengthMismatch {
        expected,
        actual: values.len(),
      });
    }

    let mut anchors = Vec::with_capacity(layout.objectness_len());
    for (index, chunk) in values.chunks_exact(ANCHOR_COORDINATES).enumerate() {
      let anchor = Anchor {
        cx: chunk[0],
        cy: chunk[1],
        w: chunk[2],
        h: chunk[3],
      };
      // 解码时要对宽高取对数
      if !(anchor.w > 0.0 && anchor.h > 0.0) {
        return Err(AnchorError::NonPositiveExtent {
          index,
          w: anchor.w,
          h: anchor.h,
        });
      }
      anchors.push(anchor);
    }

    Ok(Self {
      layout,
      anchors: anchors.into_boxed_slice(),
    })
  }

  /// 解析单行逗号分隔的锚框文本
  pub fn parse_csv(layout: GridLayout, text: &str) -> Result<Self, AnchorError> {
    let line = text
      .lines()
      .map(str::trim)
      .find(|l| !l.is_empty())
      .ok_or(AnchorError::Empty)?;

    let values = line
      .split(',')
      .enumerate()
      .map(|(index, value)| {
        value
          .trim()
          .parse::<f32>()
          .map_err(|_| AnchorError::ParseError {
            index,
            value: value.to_string(),
          })
      })
      .collect::<Result<Vec<_>, _>>()?;

    Self::from_values(layout, &values)
  }

  pub fn from_csv_file<P: AsRef<Path>>(layout: GridLayout, path: P) -> Result<Self, AnchorError> {
    let path = path.as_ref();
    info!("加载锚框文件: {}", path.display());
    let text = std::fs::read_to_string(path)?;
    let grid = Self::parse_csv(layout, &text)?;
    debug!(
      "锚框网格: {}x{}x{}",
      layout.rows, layout.cols, layout.anchors
    );
    Ok(grid)
  }

  pub fn layout(&self) -> GridLayout {
    self.layout
  }

  pub fn anchor(&self, row: usize, col: usize, anchor: usize) -> &Anchor {
    &self.anchors[self.layout.slot(row, col, anchor)]
  }

  pub fn len(&self) -> usize {
    self.anchors.len()
  }

  pub fn is_empty(&self) -> bool {
    self.anchors.is_empty()
  }
}

impl FromUrlWithScheme for AnchorGrid {
  const SCHEME: &'static str = "anchors";
}

fn parse_query_usize(key: &str, value: &str) -> Result<usize, AnchorError> {
  value
    .parse::<usize>()
    .map_err(|_| AnchorError::InvalidParameter(key.to_string(), value.to_string()))
}

impl FromUrl for AnchorGrid {
  type Error = AnchorError;

  /// `anchors:///path/anchors.csv?rows=20&cols=20&anchors=9`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(AnchorError::SchemeMismatch);
    }

    let mut layout = GridLayout::default();
    for (k, v) in url.query_pairs() {
      match k.as_ref() {
        "rows" => layout.rows = parse_query_usize("rows", &v)?,
        "cols" => layout.cols = parse_query_usize("cols", &v)?,
        "anchors" => layout.anchors = parse_query_usize("anchors", &v)?,
        _ => debug!("忽略未知参数: {}={}", k, v),
      }
    }

    Self::from_csv_file(layout, url.path())
  }
}
