// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/session.rs - 执行上下文与会话池
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
  path::Path,
  sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
  },
};

use half::f16;
use ort::{
  execution_providers::CUDAExecutionProvider,
  session::{Session, builder::GraphOptimizationLevel},
  value::TensorRef,
};
use tracing::{debug, error, info, warn};

use crate::model::{config::ModelConfig, engine::EngineError};

/// 送入执行上下文的输入张量视图（NCHW）
#[derive(Debug, Clone, Copy)]
pub enum InputTensor<'a> {
  F32 { shape: [usize; 4], data: &'a [f32] },
  F16 { shape: [usize; 4], data: &'a [f16] },
}

impl InputTensor<'_> {
  pub fn shape(&self) -> [usize; 4] {
    match self {
      InputTensor::F32 { shape, .. } | InputTensor::F16 { shape, .. } => *shape,
    }
  }
}

/// 常驻的输出张量缓冲，输出统一展开为 f32
#[derive(Debug, Clone, Default)]
pub struct OutputTensor {
  pub shape: Vec<usize>,
  pub data: Vec<f32>,
}

impl OutputTensor {
  pub fn assign<S, V>(&mut self, shape: S, values: V)
  where
    S: IntoIterator<Item = i64>,
    V: IntoIterator<Item = f32>,
  {
    self.shape.clear();
    self.shape.extend(shape.into_iter().map(|d| d.max(0) as usize));
    self.data.clear();
    self.data.extend(values);
  }
}

/// 一个可独立执行模型的上下文。同一会话池中的上下文输入输出一致。
pub trait ExecutionContext: Send {
  fn run(&mut self, input: InputTensor<'_>, output: &mut OutputTensor) -> Result<(), EngineError>;
}

/// 固定大小的执行上下文池，按原子轮转索引选取上下文。
///
/// 引擎独占会话池，执行时借用 `&mut self`，轮转索引是唯一的可变状态。
pub struct SessionPool {
  contexts: Vec<Box<dyn ExecutionContext>>,
  next: AtomicUsize,
}

impl SessionPool {
  pub fn new(contexts: Vec<Box<dyn ExecutionContext>>) -> Result<Self, EngineError> {
    if contexts.is_empty() {
      return Err(EngineError::EmptyPool);
    }
    Ok(Self {
      contexts,
      next: AtomicUsize::new(0),
    })
  }

  pub fn len(&self) -> usize {
    self.contexts.len()
  }

  pub fn is_empty(&self) -> bool {
    self.contexts.is_empty()
  }

  pub fn next_index(&self) -> usize {
    self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len()
  }

  /// 在下一个上下文上执行，返回所用上下文的索引
  pub fn run(
    &mut self,
    input: InputTensor<'_>,
    output: &mut OutputTensor,
  ) -> Result<usize, EngineError> {
    let index = self.next_index();
    self.run_on(index, input, output)?;
    Ok(index)
  }

  pub fn run_on(
    &mut self,
    index: usize,
    input: InputTensor<'_>,
    output: &mut OutputTensor,
  ) -> Result<(), EngineError> {
    self
      .contexts
      .get_mut(index)
      .ok_or(EngineError::NoContext(index))?
      .run(input, output)
  }
}

/// ONNX Runtime 会话。输入输出名称在池内共享。
pub struct OrtContext {
  session: Session,
  input_name: Arc<str>,
  output_name: Arc<str>,
}

impl ExecutionContext for OrtContext {
  fn run(&mut self, input: InputTensor<'_>, output: &mut OutputTensor) -> Result<(), EngineError> {
    let outputs = match input {
      InputTensor::F32 { shape, data } => {
        let tensor = TensorRef::from_array_view((shape, data)).map_err(ort_error)?;
        self
          .session
          .run(ort::inputs![&*self.input_name => tensor])
          .map_err(ort_error)?
      }
      InputTensor::F16 { shape, data } => {
        let tensor = TensorRef::from_array_view((shape, data)).map_err(ort_error)?;
        self
          .session
          .run(ort::inputs![&*self.input_name => tensor])
          .map_err(ort_error)?
      }
    };

    let value = &outputs[&*self.output_name];
    if let Ok((shape, data)) = value.try_extract_tensor::<f32>() {
      output.assign(shape.iter().copied(), data.iter().copied());
    } else {
      let (shape, data) = value.try_extract_tensor::<f16>().map_err(ort_error)?;
      output.assign(shape.iter().copied(), data.iter().map(|v| v.to_f32()));
    }
    Ok(())
  }
}

fn ort_error<E: std::fmt::Display>(err: E) -> EngineError {
  EngineError::Session(err.to_string())
}

/// 拒绝 ONNX Runtime 无法正确处理编码的模型路径
pub fn validate_model_path(path: &Path) -> Result<(), EngineError> {
  let text = path
    .to_str()
    .ok_or_else(|| EngineError::ModelPath(format!("路径不是有效的 UTF-8: {}", path.display())))?;
  if text.chars().any(|c| ('\u{4e00}'..='\u{9fa5}').contains(&c)) {
    return Err(EngineError::ModelPath(format!(
      "模型路径中不能包含中文字符: {}",
      text
    )));
  }
  Ok(())
}

fn commit_session(config: &ModelConfig, use_cuda: bool) -> Result<Session, EngineError> {
  let mut builder = Session::builder()
    .map_err(ort_error)?
    .with_optimization_level(GraphOptimizationLevel::Level3)
    .map_err(ort_error)?
    .with_intra_threads(config.intra_threads)
    .map_err(ort_error)?
    .with_inter_threads(config.inter_threads)
    .map_err(ort_error)?
    .with_parallel_execution(false)
    .map_err(ort_error)?;

  if use_cuda {
    builder = builder
      .with_execution_providers([CUDAExecutionProvider::default()
        .with_device_id(0)
        .build()
        .error_on_failure()])
      .map_err(ort_error)?;
  }

  builder
    .commit_from_file(&config.model_path)
    .map_err(ort_error)
}

/// 以 `commit(use_cuda)` 创建第一个会话。
///
/// 启用 CUDA 时失败会以纯 CPU 配置重试一次，两次结果都记录日志；重试仍失败则返回错误。
/// 返回会话以及最终是否启用了 CUDA。
pub fn open_with_fallback<S, F>(use_cuda: bool, mut commit: F) -> Result<(S, bool), EngineError>
where
  F: FnMut(bool) -> Result<S, EngineError>,
{
  match commit(use_cuda) {
    Ok(session) => Ok((session, use_cuda)),
    Err(e) if use_cuda => {
      warn!("CUDA 初始化失败 ({})，回退到 CPU", e);
      match commit(false) {
        Ok(session) => {
          info!("已回退到 CPU 执行");
          Ok((session, false))
        }
        Err(e) => {
          error!("CPU 回退同样失败: {}", e);
          Err(e)
        }
      }
    }
    Err(e) => {
      error!("创建推理会话失败: {}", e);
      Err(e)
    }
  }
}

/// 按配置创建 ONNX Runtime 执行上下文。
///
/// 第一个会话创建失败且启用了 CUDA 时，会改用纯 CPU 配置重试一次；
/// 其余会话沿用最终生效的配置。返回的布尔值表示是否启用了 CUDA。
pub fn build_ort_contexts(
  config: &ModelConfig,
) -> Result<(Vec<Box<dyn ExecutionContext>>, bool), EngineError> {
  validate_model_path(&config.model_path)?;

  info!("加载模型文件: {}", config.model_path.display());
  let metadata = std::fs::metadata(&config.model_path)?;
  debug!(
    "模型文件大小: {:.2} MB",
    metadata.len() as f64 / (1024.0 * 1024.0)
  );

  let (first, use_cuda) =
    open_with_fallback(config.use_cuda, |cuda| commit_session(config, cuda))?;

  let input_name: Arc<str> = first
    .inputs
    .first()
    .map(|input| Arc::from(input.name.as_str()))
    .ok_or_else(|| EngineError::NodeResolution("模型没有输入节点".to_string()))?;
  let output_name: Arc<str> = first
    .outputs
    .first()
    .map(|output| Arc::from(output.name.as_str()))
    .ok_or_else(|| EngineError::NodeResolution("模型没有输出节点".to_string()))?;
  debug!("模型输入节点: {}, 输出节点: {}", input_name, output_name);

  let mut contexts: Vec<Box<dyn ExecutionContext>> = Vec::with_capacity(config.pool_size);
  contexts.push(Box::new(OrtContext {
    session: first,
    input_name: Arc::clone(&input_name),
    output_name: Arc::clone(&output_name),
  }));
  for index in 1..config.pool_size {
    let session = commit_session(config, use_cuda)?;
    debug!("执行上下文 {} 创建完成", index);
    contexts.push(Box::new(OrtContext {
      session,
      input_name: Arc::clone(&input_name),
      output_name: Arc::clone(&output_name),
    }));
  }

  info!(
    "创建了 {} 个执行上下文 ({})",
    contexts.len(),
    if use_cuda { "CUDA" } else { "CPU" }
  );
  Ok((contexts, use_cuda))
}
