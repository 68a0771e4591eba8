// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output.rs - 对外输出：显示帧与检测记录
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

use image::RgbaImage;
use serde::Serialize;
use tracing::debug;

use crate::{
  frame::Frame,
  model::{DetectionResult, InferenceTiming},
  pipeline::InferenceReport,
};

/// 显示端。由采集线程按采集帧率调用，不受推理节奏影响。
pub trait DisplaySink: Send {
  fn present(&mut self, frame: &Frame);
}

/// 把采集帧转换成 RGBA 后交给回调，转换缓冲在多帧间复用
pub struct RgbaDisplay<F>
where
  F: FnMut(&RgbaImage) + Send,
{
  buffer: RgbaImage,
  callback: F,
}

impl<F> RgbaDisplay<F>
where
  F: FnMut(&RgbaImage) + Send,
{
  pub fn new(callback: F) -> Self {
    Self {
      buffer: RgbaImage::new(0, 0),
      callback,
    }
  }
}

impl<F> DisplaySink for RgbaDisplay<F>
where
  F: FnMut(&RgbaImage) + Send,
{
  fn present(&mut self, frame: &Frame) {
    if frame.width() == 0 || frame.height() == 0 {
      return;
    }
    if self.buffer.dimensions() != (frame.width(), frame.height()) {
      debug!("显示缓冲尺寸变为 {}x{}", frame.width(), frame.height());
      self.buffer = RgbaImage::new(frame.width(), frame.height());
    }

    let swap = frame.format().swaps_red_blue();
    let width = frame.width() as usize;
    let dst_rows = self.buffer.chunks_exact_mut(width * 4);
    for (y, dst_row) in (0..frame.height()).zip(dst_rows) {
      for (src, dst) in frame.row(y).chunks_exact(3).zip(dst_row.chunks_exact_mut(4)) {
        let (r, b) = if swap { (src[2], src[0]) } else { (src[0], src[2]) };
        dst.copy_from_slice(&[r, src[1], b, u8::MAX]);
      }
    }

    (self.callback)(&self.buffer);
  }
}

/// 单个检测结果，坐标按采集帧尺寸归一化
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
  pub class_id: u32,
  pub label: String,
  pub confidence: f32,
  pub x: f32,
  pub y: f32,
  pub w: f32,
  pub h: f32,
}

impl DetectionRecord {
  pub fn new(detection: &DetectionResult, frame_width: u32, frame_height: u32) -> Self {
    let bbox = detection.bbox.normalized(frame_width, frame_height);
    Self {
      class_id: detection.class_id,
      label: detection
        .label
        .clone()
        .unwrap_or_else(|| detection.class_id.to_string()),
      confidence: detection.confidence,
      x: bbox.x,
      y: bbox.y,
      w: bbox.width,
      h: bbox.height,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingRecord {
  pub preprocess_ms: f64,
  pub inference_ms: f64,
  pub postprocess_ms: f64,
}

impl From<InferenceTiming> for TimingRecord {
  fn from(timing: InferenceTiming) -> Self {
    Self {
      preprocess_ms: timing.preprocess_ms.max(0.0),
      inference_ms: timing.inference_ms.max(0.0),
      postprocess_ms: timing.postprocess_ms.max(0.0),
    }
  }
}

/// 一次推理的完整记录，命令行按行输出该结构的 JSON
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
  pub sequence: u64,
  pub frame_width: u32,
  pub frame_height: u32,
  pub timing: TimingRecord,
  pub detections: Vec<DetectionRecord>,
}

impl From<&InferenceReport> for ReportRecord {
  fn from(report: &InferenceReport) -> Self {
    Self {
      sequence: report.sequence,
      frame_width: report.frame_width,
      frame_height: report.frame_height,
      timing: report.timing.into(),
      detections: report
        .detections
        .iter()
        .map(|d| DetectionRecord::new(d, report.frame_width, report.frame_height))
        .collect(),
    }
  }
}
