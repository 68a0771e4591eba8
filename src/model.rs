// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model.rs - 模型
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

use serde::Serialize;
use tracing::{debug, info};

/// 模型任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
  /// 目标检测（letterbox + NMS）
  Detect,
  /// 图像分类（中心裁剪，每类输出一个结果）
  Classify,
}

/// 模型输入输出的数值精度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
  Fp32,
  Fp16,
}

/// 轴对齐边界框，坐标为像素：(x, y) 为左上角
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct BoundingBox {
  pub x: f32,
  pub y: f32,
  pub width: f32,
  pub height: f32,
}

impl BoundingBox {
  pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  pub fn area(&self) -> f32 {
    self.width.max(0.0) * self.height.max(0.0)
  }

  pub fn right(&self) -> f32 {
    self.x + self.width
  }

  pub fn bottom(&self) -> f32 {
    self.y + self.height
  }

  /// 交并比
  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let ix1 = self.x.max(other.x);
    let iy1 = self.y.max(other.y);
    let ix2 = self.right().min(other.right());
    let iy2 = self.bottom().min(other.bottom());
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    if inter <= 0.0 {
      return 0.0;
    }
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }

  /// 按帧尺寸归一化到 [0, 1]，超出画面的部分被裁掉
  pub fn normalized(&self, frame_width: u32, frame_height: u32) -> BoundingBox {
    let fw = frame_width.max(1) as f32;
    let fh = frame_height.max(1) as f32;
    let x1 = (self.x / fw).clamp(0.0, 1.0);
    let y1 = (self.y / fh).clamp(0.0, 1.0);
    let x2 = (self.right() / fw).clamp(0.0, 1.0);
    let y2 = (self.bottom() / fh).clamp(0.0, 1.0);
    BoundingBox::new(x1, y1, (x2 - x1).max(0.0), (y2 - y1).max(0.0))
  }
}

/// 单个检测结果，坐标位于被推理帧的像素空间
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
  pub class_id: u32,
  pub confidence: f32,
  pub bbox: BoundingBox,
  pub label: Option<String>,
}

/// 各阶段耗时（毫秒）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct InferenceTiming {
  pub preprocess_ms: f64,
  pub inference_ms: f64,
  pub postprocess_ms: f64,
}

impl InferenceTiming {
  pub fn total_ms(&self) -> f64 {
    self.preprocess_ms + self.inference_ms + self.postprocess_ms
  }
}

/// 一次推理的输出
#[derive(Debug, Clone)]
pub struct InferenceOutput {
  pub detections: Vec<DetectionResult>,
  pub timing: InferenceTiming,
}

/// COCO 数据集类别名称
pub const COCO_CLASSES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];

/// 类别名称表，行号即类别 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTable {
  names: Vec<String>,
}

impl Default for ClassTable {
  fn default() -> Self {
    Self::coco()
  }
}

impl ClassTable {
  pub fn coco() -> Self {
    Self {
      names: COCO_CLASSES.iter().map(|name| name.to_string()).collect(),
    }
  }

  pub fn from_names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  /// 解析纯文本类别表：每行一个名称，末尾空行忽略
  pub fn parse(text: &str) -> Self {
    let mut names: Vec<String> = text
      .lines()
      .map(|line| line.trim_end_matches('\r').trim().to_string())
      .collect();
    while names.last().is_some_and(|name| name.is_empty()) {
      names.pop();
    }
    Self { names }
  }

  pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
    info!("加载类别表: {}", path.as_ref().display());
    let text = std::fs::read_to_string(path)?;
    let table = Self::parse(&text);
    debug!("类别数量: {}", table.len());
    Ok(table)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn label(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }
}

pub mod config;
pub mod engine;
pub mod postprocess;
pub mod preprocess;
pub mod session;

pub use self::config::{
  DEFAULT_INPUT_SIZE, LetterboxAnchor, ModelConfig, ModelConfigError, ONNX_SCHEME, OutputLayout,
};
pub use self::engine::{EngineError, InferenceEngine};
