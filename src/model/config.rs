// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/config.rs - 模型配置
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

use std::path::PathBuf;

use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{ModelKind, Precision},
};

pub const ONNX_SCHEME: &str = "onnx";
pub const DEFAULT_INPUT_SIZE: (u32, u32) = (640, 640);

#[derive(Error, Debug)]
pub enum ModelConfigError {
  #[error("URI 方案不匹配: 期望 {expected}, 实际 {found}")]
  SchemeMismatch { expected: &'static str, found: String },
  #[error("参数 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
  #[error("参数 {key} 超出范围: {value}")]
  OutOfRange { key: &'static str, value: String },
  #[error("模型路径解码失败: {0}")]
  PathDecode(String),
}

/// letterbox 时缩放后图像在画布中的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetterboxAnchor {
  TopLeft,
  Center,
}

/// 检测输出张量去掉前导 1 之后的两维排布
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputLayout {
  /// `[attributes, candidates]`，YOLOv8 导出的默认排布
  #[default]
  AttributesFirst,
  /// `[candidates, attributes]`
  CandidatesFirst,
}

/// 模型配置，推理引擎创建后不再改变
#[derive(Debug, Clone)]
pub struct ModelConfig {
  pub model_path: PathBuf,
  pub kind: ModelKind,
  pub input_width: u32,
  pub input_height: u32,
  pub confidence_threshold: f32,
  pub iou_threshold: f32,
  pub precision: Precision,
  /// 执行上下文数量
  pub pool_size: usize,
  pub intra_threads: usize,
  pub inter_threads: usize,
  pub use_cuda: bool,
  /// 类别表路径，缺省时使用 COCO 类别
  pub labels_path: Option<PathBuf>,
  pub pad_value: u8,
  pub anchor: LetterboxAnchor,
  /// NMS 是否忽略类别
  pub agnostic_nms: bool,
  pub output_layout: OutputLayout,
}

impl ModelConfig {
  pub fn new<P: Into<PathBuf>>(model_path: P) -> Self {
    let cores = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(2);
    Self {
      model_path: model_path.into(),
      kind: ModelKind::Detect,
      input_width: DEFAULT_INPUT_SIZE.0,
      input_height: DEFAULT_INPUT_SIZE.1,
      confidence_threshold: 0.4,
      iou_threshold: 0.5,
      precision: Precision::Fp32,
      pool_size: 1,
      intra_threads: (cores / 2).max(1),
      inter_threads: 1,
      use_cuda: false,
      labels_path: None,
      pad_value: 0,
      anchor: LetterboxAnchor::TopLeft,
      agnostic_nms: true,
      output_layout: OutputLayout::AttributesFirst,
    }
  }

  pub fn with_input_size(mut self, width: u32, height: u32) -> Self {
    self.input_width = width;
    self.input_height = height;
    self
  }

  pub fn with_kind(mut self, kind: ModelKind) -> Self {
    self.kind = kind;
    self
  }

  pub fn with_thresholds(mut self, confidence: f32, iou: f32) -> Self {
    self.confidence_threshold = confidence;
    self.iou_threshold = iou;
    self
  }

  pub fn with_precision(mut self, precision: Precision) -> Self {
    self.precision = precision;
    self
  }

  pub fn with_pool_size(mut self, pool_size: usize) -> Self {
    self.pool_size = pool_size;
    self
  }

  pub fn with_cuda(mut self, use_cuda: bool) -> Self {
    self.use_cuda = use_cuda;
    self
  }

  pub fn with_labels<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn with_anchor(mut self, anchor: LetterboxAnchor) -> Self {
    self.anchor = anchor;
    self
  }

  pub fn with_agnostic_nms(mut self, agnostic: bool) -> Self {
    self.agnostic_nms = agnostic;
    self
  }

  pub fn with_output_layout(mut self, layout: OutputLayout) -> Self {
    self.output_layout = layout;
    self
  }

  pub fn validate(&self) -> Result<(), ModelConfigError> {
    if self.input_width == 0 || self.input_height == 0 {
      return Err(ModelConfigError::OutOfRange {
        key: "size",
        value: format!("{}x{}", self.input_width, self.input_height),
      });
    }
    if !(0.0..=1.0).contains(&self.confidence_threshold) {
      return Err(ModelConfigError::OutOfRange {
        key: "conf",
        value: self.confidence_threshold.to_string(),
      });
    }
    if !(0.0..=1.0).contains(&self.iou_threshold) {
      return Err(ModelConfigError::OutOfRange {
        key: "iou",
        value: self.iou_threshold.to_string(),
      });
    }
    if self.pool_size == 0 {
      return Err(ModelConfigError::OutOfRange {
        key: "pool",
        value: "0".to_string(),
      });
    }
    if self.intra_threads == 0 || self.inter_threads == 0 {
      return Err(ModelConfigError::OutOfRange {
        key: "threads",
        value: format!("{}/{}", self.intra_threads, self.inter_threads),
      });
    }
    Ok(())
  }

  fn apply(&mut self, key: &str, value: &str) -> Result<(), ModelConfigError> {
    match key {
      "size" => {
        let (width, height) = parse_size(value).ok_or_else(|| invalid(key, value))?;
        self.input_width = width;
        self.input_height = height;
      }
      "conf" => self.confidence_threshold = value.parse().map_err(|_| invalid(key, value))?,
      "iou" => self.iou_threshold = value.parse().map_err(|_| invalid(key, value))?,
      "precision" => {
        self.precision = match value {
          "fp32" | "f32" => Precision::Fp32,
          "fp16" | "f16" | "half" => Precision::Fp16,
          _ => return Err(invalid(key, value)),
        }
      }
      "pool" => self.pool_size = value.parse().map_err(|_| invalid(key, value))?,
      "intra" => self.intra_threads = value.parse().map_err(|_| invalid(key, value))?,
      "inter" => self.inter_threads = value.parse().map_err(|_| invalid(key, value))?,
      "cuda" => self.use_cuda = parse_bool(value).ok_or_else(|| invalid(key, value))?,
      "task" => {
        self.kind = match value {
          "detect" => ModelKind::Detect,
          "classify" | "cls" => ModelKind::Classify,
          _ => return Err(invalid(key, value)),
        }
      }
      "labels" => self.labels_path = Some(PathBuf::from(value)),
      "pad" => self.pad_value = value.parse().map_err(|_| invalid(key, value))?,
      "anchor" => {
        self.anchor = match value {
          "top-left" | "topleft" => LetterboxAnchor::TopLeft,
          "center" | "centre" => LetterboxAnchor::Center,
          _ => return Err(invalid(key, value)),
        }
      }
      "agnostic" => self.agnostic_nms = parse_bool(value).ok_or_else(|| invalid(key, value))?,
      "layout" => {
        self.output_layout = match value {
          "acn" | "attributes-first" => OutputLayout::AttributesFirst,
          "nca" | "candidates-first" | "transposed" => OutputLayout::CandidatesFirst,
          _ => return Err(invalid(key, value)),
        }
      }
      _ => warn!("忽略未知的模型参数: {}={}", key, value),
    }
    Ok(())
  }
}

impl FromUrlWithScheme for ModelConfig {
  const SCHEME: &'static str = ONNX_SCHEME;
}

impl FromUrl for ModelConfig {
  type Error = ModelConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ModelConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| ModelConfigError::PathDecode(e.to_string()))?;
    let mut config = ModelConfig::new(path.into_owned());
    for (key, value) in url.query_pairs() {
      config.apply(&key, &value)?;
    }
    config.validate()?;
    Ok(config)
  }
}

fn invalid(key: &str, value: &str) -> ModelConfigError {
  ModelConfigError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  }
}

/// 解析 `640x480` 或 `640`（正方形）
pub(crate) fn parse_size(value: &str) -> Option<(u32, u32)> {
  match value.split_once(['x', 'X']) {
    Some((w, h)) => Some((w.trim().parse().ok()?, h.trim().parse().ok()?)),
    None => {
      let side = value.trim().parse().ok()?;
      Some((side, side))
    }
  }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
  match value.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Some(true),
    "0" | "false" | "no" | "off" => Some(false),
    _ => None,
  }
}
