// 该文件是 Liaowang （瞭望） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
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

#![allow(dead_code)]

use std::{thread, time::Duration};

use liaowang::{
  frame::{Frame, PixelFormat},
  model::{
    ClassTable, EngineError, InferenceEngine, ModelConfig,
    session::{ExecutionContext, InputTensor, OutputTensor},
  },
};

/// 输出张量中的候选框数量，排布为 [1, 4 + 2, CANDIDATES]
pub const CANDIDATES: usize = 8;
const ATTRIBUTES: usize = 6;

/// 代替 ONNX 模型的执行上下文：把输入中饱和的红色像素“检测”为类别 0。
///
/// 找到红色区域时输出三个候选框：目标本身（0.9）、稍有偏移的重复框（0.8）
/// 以及一个低分噪声框（0.1）。
pub struct RedBox {
  delay: Duration,
}

impl RedBox {
  pub fn new() -> Self {
    Self {
      delay: Duration::ZERO,
    }
  }

  /// 每次执行额外耗时，用于模拟慢速推理
  pub fn with_delay(delay: Duration) -> Self {
    Self { delay }
  }
}

impl ExecutionContext for RedBox {
  fn run(&mut self, input: InputTensor<'_>, output: &mut OutputTensor) -> Result<(), EngineError> {
    let InputTensor::F32 { shape, data } = input else {
      return Err(EngineError::Session("RedBox 只支持 fp32 输入".to_string()));
    };
    if !self.delay.is_zero() {
      thread::sleep(self.delay);
    }

    let [_, _, height, width] = shape;
    let plane = width * height;
    let (r, rest) = data.split_at(plane);
    let (g, b) = rest.split_at(plane);

    let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0, 0);
    for idx in 0..plane {
      if r[idx] > 0.8 && g[idx] < 0.2 && b[idx] < 0.2 {
        let (x, y) = (idx % width, idx / width);
        x1 = x1.min(x);
        y1 = y1.min(y);
        x2 = x2.max(x + 1);
        y2 = y2.max(y + 1);
      }
    }

    let mut values = vec![0.0f32; ATTRIBUTES * CANDIDATES];
    let mut put = |candidate: usize, attributes: [f32; ATTRIBUTES]| {
      for (attribute, value) in attributes.into_iter().enumerate() {
        values[attribute * CANDIDATES + candidate] = value;
      }
    };
    if x1 < x2 {
      let w = (x2 - x1) as f32;
      let h = (y2 - y1) as f32;
      let cx = x1 as f32 + w / 2.0;
      let cy = y1 as f32 + h / 2.0;
      put(0, [cx, cy, w, h, 0.9, 0.05]);
      put(1, [cx + 1.0, cy + 1.0, w, h, 0.8, 0.1]);
      put(2, [4.0, 4.0, 4.0, 4.0, 0.1, 0.05]);
    }
    output.assign([1, ATTRIBUTES as i64, CANDIDATES as i64], values);
    Ok(())
  }
}

pub fn red_box_engine(
  config: ModelConfig,
  classes: ClassTable,
  delay: Duration,
) -> Result<InferenceEngine, EngineError> {
  let contexts: Vec<Box<dyn ExecutionContext>> = (0..config.pool_size)
    .map(|_| Box::new(RedBox::with_delay(delay)) as Box<dyn ExecutionContext>)
    .collect();
  InferenceEngine::with_contexts(config, classes, contexts)
}

/// 灰色背景上画一个纯红色矩形 (x, y, w, h)
pub fn red_box_frame(width: u32, height: u32, bbox: (u32, u32, u32, u32)) -> Frame {
  let mut frame = Frame::new(width, height, PixelFormat::Rgb8);
  let stride = frame.stride();
  let (bx, by, bw, bh) = bbox;
  for (y, row) in frame.data_mut().chunks_exact_mut(stride).enumerate() {
    let y = y as u32;
    for (x, px) in row.chunks_exact_mut(3).enumerate() {
      let x = x as u32;
      let inside = x >= bx && x < bx + bw && y >= by && y < by + bh;
      px.copy_from_slice(if inside { &[255, 0, 0] } else { &[90, 90, 90] });
    }
  }
  frame
}
