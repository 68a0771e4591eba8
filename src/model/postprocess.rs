// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/postprocess.rs - 后处理：候选框解码与非极大值抑制
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

use tracing::debug;

use crate::model::{
  BoundingBox, DetectionResult, config::OutputLayout, engine::EngineError,
  preprocess::LetterboxInfo, session::OutputTensor,
};

/// 每个候选框前 4 个属性为 (cx, cy, w, h)
const BOX_ATTRIBUTES: usize = 4;

/// 输出张量的排布
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Layout {
  attributes: usize,
  candidates: usize,
  /// `[attributes, candidates]` 为真，`[candidates, attributes]` 为假
  attribute_major: bool,
}

impl Layout {
  /// 去掉前导的 1 之后必须恰好剩两维，按配置的排布解释，与两维的大小无关
  fn resolve(shape: &[usize], layout: OutputLayout) -> Option<Self> {
    let dims: Vec<usize> = shape
      .iter()
      .copied()
      .skip_while(|&d| d == 1)
      .collect();
    let (rows, cols) = match dims.as_slice() {
      [rows, cols] => (*rows, *cols),
      _ => return None,
    };
    let resolved = match layout {
      OutputLayout::AttributesFirst => Layout {
        attributes: rows,
        candidates: cols,
        attribute_major: true,
      },
      OutputLayout::CandidatesFirst => Layout {
        attributes: cols,
        candidates: rows,
        attribute_major: false,
      },
    };
    (resolved.attributes > BOX_ATTRIBUTES).then_some(resolved)
  }

  #[inline]
  fn at(&self, data: &[f32], attribute: usize, candidate: usize) -> f32 {
    if self.attribute_major {
      data[attribute * self.candidates + candidate]
    } else {
      data[candidate * self.attributes + attribute]
    }
  }
}

/// 解码检测输出，保留最高类别分数大于阈值的候选框，坐标映射回源图像
pub fn decode_detections(
  output: &OutputTensor,
  layout: OutputLayout,
  info: &LetterboxInfo,
  confidence_threshold: f32,
) -> Result<Vec<DetectionResult>, EngineError> {
  let layout = Layout::resolve(&output.shape, layout)
    .ok_or_else(|| EngineError::OutputShape(output.shape.clone()))?;
  if output.data.len() < layout.attributes * layout.candidates {
    return Err(EngineError::OutputShape(output.shape.clone()));
  }
  let data = output.data.as_slice();

  let mut detections = Vec::new();
  for candidate in 0..layout.candidates {
    let mut best_class = 0;
    let mut best_score = f32::MIN;
    for attribute in BOX_ATTRIBUTES..layout.attributes {
      let score = layout.at(data, attribute, candidate);
      if score > best_score {
        best_score = score;
        best_class = attribute - BOX_ATTRIBUTES;
      }
    }
    if best_score <= confidence_threshold {
      continue;
    }

    let cx = layout.at(data, 0, candidate);
    let cy = layout.at(data, 1, candidate);
    let w = layout.at(data, 2, candidate);
    let h = layout.at(data, 3, candidate);
    detections.push(DetectionResult {
      class_id: best_class as u32,
      confidence: best_score,
      bbox: info.to_source(cx, cy, w, h),
      label: None,
    });
  }

  debug!(
    "候选框 {} 个，置信度过滤后剩余 {} 个",
    layout.candidates,
    detections.len()
  );
  Ok(detections)
}

/// 非极大值抑制。
///
/// 按分数降序（分数相同保持原顺序）遍历，与已保留框的 IoU 不小于阈值时抑制。
/// `agnostic` 为假时只在同类之间抑制。返回保留项的下标，按分数降序排列。
pub fn non_max_suppression(
  detections: &[DetectionResult],
  iou_threshold: f32,
  agnostic: bool,
) -> Vec<usize> {
  let mut order: Vec<usize> = (0..detections.len()).collect();
  order.sort_by(|&a, &b| {
    detections[b]
      .confidence
      .total_cmp(&detections[a].confidence)
  });

  let mut kept: Vec<usize> = Vec::with_capacity(order.len());
  for index in order {
    let candidate = &detections[index];
    let suppressed = kept.iter().any(|&k| {
      let other = &detections[k];
      if !agnostic && other.class_id != candidate.class_id {
        return false;
      }
      let iou = other.bbox.iou(&candidate.bbox);
      iou > 0.0 && iou >= iou_threshold
    });
    if !suppressed {
      kept.push(index);
    }
  }
  kept
}

/// 对检测结果做 NMS，返回保留的结果
pub fn suppress(
  detections: Vec<DetectionResult>,
  iou_threshold: f32,
  agnostic: bool,
) -> Vec<DetectionResult> {
  let kept = non_max_suppression(&detections, iou_threshold, agnostic);
  let mut slots: Vec<Option<DetectionResult>> = detections.into_iter().map(Some).collect();
  kept
    .into_iter()
    .filter_map(|index| slots[index].take())
    .collect()
}

/// 分类输出：每个类别一个结果，不做阈值过滤，框为零
pub fn decode_classification(output: &OutputTensor) -> Vec<DetectionResult> {
  output
    .data
    .iter()
    .enumerate()
    .map(|(class_id, &confidence)| DetectionResult {
      class_id: class_id as u32,
      confidence,
      bbox: BoundingBox::default(),
      label: None,
    })
    .collect()
}
