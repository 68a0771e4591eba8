// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/engine.rs - 推理引擎
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

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
  frame::Frame,
  model::{
    ClassTable, InferenceOutput, InferenceTiming, ModelKind,
    config::{ModelConfig, ModelConfigError},
    postprocess,
    preprocess::{Preprocessor, TensorBuffer},
    session::{self, ExecutionContext, OutputTensor, SessionPool},
  },
};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型文件读取失败: {0}")]
  ModelLoad(#[from] std::io::Error),
  #[error("模型路径无效: {0}")]
  ModelPath(String),
  #[error("模型配置错误: {0}")]
  Config(#[from] ModelConfigError),
  #[error("类别表读取失败: {0}")]
  Labels(std::io::Error),
  #[error("ONNX Runtime 错误: {0}")]
  Session(String),
  #[error("模型节点解析失败: {0}")]
  NodeResolution(String),
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidImage { width: u32, height: u32 },
  #[error("预处理失败: {0}")]
  Preprocess(String),
  #[error("不支持的输出张量形状: {0:?}")]
  OutputShape(Vec<usize>),
  #[error("执行上下文 {0} 不存在")]
  NoContext(usize),
  #[error("执行上下文池为空")]
  EmptyPool,
}

/// 推理引擎：持有模型配置、执行上下文池以及常驻的输入输出缓冲。
///
/// 创建后不可重新配置，需要更换模型时重新创建引擎。
pub struct InferenceEngine {
  config: ModelConfig,
  classes: ClassTable,
  pool: SessionPool,
  preprocessor: Preprocessor,
  tensor: TensorBuffer,
  output: OutputTensor,
  accelerated: bool,
}

impl InferenceEngine {
  /// 加载 ONNX 模型并完成预热
  pub fn create(config: ModelConfig) -> Result<Self, EngineError> {
    config.validate()?;
    let classes = match &config.labels_path {
      Some(path) => ClassTable::from_file(path).map_err(EngineError::Labels)?,
      None => ClassTable::coco(),
    };
    let (contexts, accelerated) = session::build_ort_contexts(&config)?;
    let mut engine = Self::with_contexts(config, classes, contexts)?;
    engine.accelerated = accelerated;
    Ok(engine)
  }

  /// 以给定的执行上下文构建引擎，并逐个预热
  pub fn with_contexts(
    config: ModelConfig,
    classes: ClassTable,
    contexts: Vec<Box<dyn ExecutionContext>>,
  ) -> Result<Self, EngineError> {
    config.validate()?;
    let pool = SessionPool::new(contexts)?;
    let preprocessor = Preprocessor::new(&config);
    let tensor = TensorBuffer::new(config.precision, config.input_width, config.input_height);

    let mut engine = Self {
      config,
      classes,
      pool,
      preprocessor,
      tensor,
      output: OutputTensor::default(),
      accelerated: false,
    };
    engine.warm_up()?;
    Ok(engine)
  }

  fn warm_up(&mut self) -> Result<(), EngineError> {
    for index in 0..self.pool.len() {
      let start = Instant::now();
      self
        .pool
        .run_on(index, self.tensor.view(), &mut self.output)?;
      info!("执行上下文 {} 预热完成，耗时 {:.2?}", index, start.elapsed());
    }
    Ok(())
  }

  /// 对一帧执行完整的预处理、推理与后处理
  pub fn run(&mut self, frame: &Frame) -> Result<InferenceOutput, EngineError> {
    let start = Instant::now();
    let info = self.preprocessor.process(frame)?;
    self
      .tensor
      .fill(self.preprocessor.canvas(), frame.format().swaps_red_blue());
    let preprocess = start.elapsed();

    let start = Instant::now();
    let context = self.pool.run(self.tensor.view(), &mut self.output)?;
    let inference = start.elapsed();

    let start = Instant::now();
    let mut detections = match self.config.kind {
      ModelKind::Detect => {
        let candidates = postprocess::decode_detections(
          &self.output,
          self.config.output_layout,
          &info,
          self.config.confidence_threshold,
        )?;
        postprocess::suppress(
          candidates,
          self.config.iou_threshold,
          self.config.agnostic_nms,
        )
      }
      ModelKind::Classify => postprocess::decode_classification(&self.output),
    };
    for detection in &mut detections {
      detection.label = self.classes.label(detection.class_id).map(str::to_string);
    }
    let postprocess = start.elapsed();

    let timing = InferenceTiming {
      preprocess_ms: millis(preprocess),
      inference_ms: millis(inference),
      postprocess_ms: millis(postprocess),
    };
    debug!(
      "帧 {} 推理完成 (上下文 {}): {} 个结果, 预处理 {:.2} ms, 推理 {:.2} ms, 后处理 {:.2} ms",
      frame.sequence(),
      context,
      detections.len(),
      timing.preprocess_ms,
      timing.inference_ms,
      timing.postprocess_ms
    );

    Ok(InferenceOutput { detections, timing })
  }

  pub fn config(&self) -> &ModelConfig {
    &self.config
  }

  pub fn classes(&self) -> &ClassTable {
    &self.classes
  }

  pub fn pool_size(&self) -> usize {
    self.pool.len()
  }

  /// 是否运行在 CUDA 上
  pub fn is_accelerated(&self) -> bool {
    self.accelerated
  }
}

fn millis(duration: Duration) -> f64 {
  duration.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    frame::PixelFormat,
    model::session::InputTensor,
  };
  use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  };

  /// 固定输出一个候选框，并记录被调用次数
  struct Fixed {
    calls: Arc<AtomicUsize>,
  }

  impl ExecutionContext for Fixed {
    fn run(&mut self, input: InputTensor<'_>, output: &mut OutputTensor) -> Result<(), EngineError> {
      assert_eq!(input.shape(), [1, 3, 640, 640]);
      self.calls.fetch_add(1, Ordering::SeqCst);
      // [1, 4 + 2, 8]，只有第一个候选框有分数
      let mut data = vec![0.0f32; 6 * 8];
      for (attribute, value) in [320.0, 320.0, 64.0, 64.0, 0.9, 0.05].into_iter().enumerate() {
        data[attribute * 8] = value;
      }
      output.assign([1, 6, 8], data);
      Ok(())
    }
  }

  fn engine(pool: usize) -> (InferenceEngine, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let contexts = (0..pool)
      .map(|_| {
        Box::new(Fixed {
          calls: Arc::clone(&calls),
        }) as Box<dyn ExecutionContext>
      })
      .collect();
    let config = ModelConfig::new("fixed.onnx").with_pool_size(pool);
    let engine = InferenceEngine::with_contexts(config, ClassTable::coco(), contexts).unwrap();
    (engine, calls)
  }

  #[test]
  fn every_context_is_warmed_up() {
    let (_engine, calls) = engine(3);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[test]
  fn run_maps_labels_and_timing() {
    let (mut engine, _) = engine(1);
    let frame = Frame::new(640, 480, PixelFormat::Rgb8);
    let output = engine.run(&frame).unwrap();
    assert_eq!(output.detections.len(), 1);
    let detection = &output.detections[0];
    assert_eq!(detection.class_id, 0);
    assert_eq!(detection.label.as_deref(), Some("person"));
    assert_eq!(detection.bbox.x, 288.0);
    assert!(output.timing.preprocess_ms >= 0.0);
    assert!(output.timing.total_ms() >= output.timing.inference_ms);
  }

  #[test]
  fn invalid_frame_is_reported() {
    let (mut engine, _) = engine(1);
    let frame = Frame::new(0, 0, PixelFormat::Rgb8);
    assert!(matches!(
      engine.run(&frame),
      Err(EngineError::InvalidImage { .. })
    ));
  }
}
