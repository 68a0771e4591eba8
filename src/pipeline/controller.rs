// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/pipeline/controller.rs - 流水线控制端
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

use std::{sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, Sender};
use tracing::{error, info, warn};

use crate::{
  input::{CameraConfig, CameraSource, CaptureSettings},
  model::{EngineError, InferenceEngine, InferenceTiming, ModelConfig},
  output::DisplaySink,
  pipeline::{
    CaptureState, CaptureWorker, DEFAULT_EVENT_CAPACITY, EventSender, InferenceReport,
    InferenceWorker, PipelineError, PipelineEvent,
  },
};

/// 控制端汇总的遥测数据
#[derive(Debug, Clone, Default)]
pub struct TelemetrySnapshot {
  pub capturing: bool,
  pub engine_ready: bool,
  pub capture_fps: f64,
  pub inference_fps: f64,
  pub frames_captured: u64,
  /// 推理线程忙而被丢弃的帧
  pub frames_dropped: u64,
  pub inferences: u64,
  pub capture_error: Option<String>,
  pub engine_error: Option<String>,
  pub last_timing: Option<InferenceTiming>,
  pub last_report: Option<InferenceReport>,
}

impl TelemetrySnapshot {
  fn apply(&mut self, event: &PipelineEvent) {
    match event {
      PipelineEvent::CaptureFps { fps, .. } => self.capture_fps = *fps,
      PipelineEvent::CaptureFailed(_) | PipelineEvent::CaptureStopped { .. } => {
        self.capture_fps = 0.0
      }
      PipelineEvent::EngineFailed(_) => self.inference_fps = 0.0,
      PipelineEvent::Inference(report) => {
        self.last_timing = Some(report.timing);
        self.last_report = Some(report.clone());
      }
      PipelineEvent::CaptureStarted { .. }
      | PipelineEvent::EngineReady
      | PipelineEvent::InferenceFailed(_) => {}
      PipelineEvent::InferenceFps { fps, .. } => self.inference_fps = *fps,
    }
  }
}

/// 管理采集与推理两个线程的生命周期，并汇总它们发出的事件。
///
/// 事件经有界队列送达，由持有 `Controller` 的线程通过 [`Controller::next_event`]
/// 或 [`Controller::drain`] 消费。
pub struct Controller {
  capture: CaptureWorker,
  inference: Option<InferenceWorker>,
  events_tx: Sender<PipelineEvent>,
  events_rx: Receiver<PipelineEvent>,
  telemetry: TelemetrySnapshot,
}

impl Controller {
  pub fn new(source: Arc<dyn CameraSource>, settings: CaptureSettings) -> Self {
    let (events_tx, events_rx) = crossbeam_channel::bounded(DEFAULT_EVENT_CAPACITY);
    Self {
      capture: CaptureWorker::new(source, settings),
      inference: None,
      events_tx,
      events_rx,
      telemetry: TelemetrySnapshot::default(),
    }
  }

  pub fn from_camera(config: CameraConfig) -> Self {
    Self::new(Arc::new(config.source), config.settings)
  }

  /// 加载 ONNX 模型并开始采集
  pub fn start(
    &mut self,
    model: ModelConfig,
    display: Option<Box<dyn DisplaySink>>,
  ) -> Result<(), PipelineError> {
    self.start_with_engine(move || InferenceEngine::create(model), display)
  }

  /// 以给定的加载函数创建引擎并开始采集。
  ///
  /// 推理线程先于采集线程启动，引擎在推理线程中加载；加载完成前采集到的帧
  /// 不会进入推理。已在运行时再次调用不做任何事。
  pub fn start_with_engine<F>(
    &mut self,
    loader: F,
    display: Option<Box<dyn DisplaySink>>,
  ) -> Result<(), PipelineError>
  where
    F: FnOnce() -> Result<InferenceEngine, EngineError> + Send + 'static,
  {
    if self.capture.state() != CaptureState::Idle {
      warn!("流水线已在运行");
      return Ok(());
    }
    // 上一轮留下的推理线程（例如摄像头打开失败后）
    if let Some(mut worker) = self.inference.take() {
      worker.stop()?;
    }

    info!("启动流水线");
    let events = EventSender::new(self.events_tx.clone());
    let worker = InferenceWorker::start_with(loader, self.capture.settings().fps_window, events)?;
    let submitter = worker.submitter();
    self.inference = Some(worker);
    self.capture.start(
      submitter,
      display,
      EventSender::new(self.events_tx.clone()),
    )
  }

  /// 停止流水线：先发停止信号，再依次等待采集线程与推理线程退出
  pub fn stop(&mut self) -> Result<(), PipelineError> {
    self.capture.signal_stop();
    if let Some(worker) = &self.inference {
      worker.signal_stop();
    }
    let captured = self.capture.join();
    let inferred = match self.inference.as_mut() {
      Some(worker) => worker.join(),
      None => Ok(()),
    };
    self.drain();
    if let Some(worker) = &self.inference {
      let stats = worker.stats();
      info!(
        "流水线已停止: 采集 {} 帧, 推理 {} 帧, 丢弃 {} 帧",
        self.capture.frames_captured(),
        stats.completed,
        stats.dropped
      );
    }
    captured.and(inferred)
  }

  pub fn capture_state(&self) -> CaptureState {
    self.capture.state()
  }

  pub fn is_engine_ready(&self) -> bool {
    self.inference.as_ref().is_some_and(|w| w.is_ready())
  }

  /// 等待下一个事件，超时返回 `None`
  pub fn next_event(&mut self, timeout: Duration) -> Option<PipelineEvent> {
    let event = self.events_rx.recv_timeout(timeout).ok()?;
    self.observe(&event);
    Some(event)
  }

  /// 取出当前队列中的全部事件
  pub fn drain(&mut self) -> Vec<PipelineEvent> {
    let events: Vec<PipelineEvent> = self.events_rx.try_iter().collect();
    for event in &events {
      self.observe(event);
    }
    events
  }

  fn observe(&mut self, event: &PipelineEvent) {
    match event {
      PipelineEvent::CaptureFailed(reason) => error!("采集失败: {}", reason),
      PipelineEvent::EngineFailed(reason) => error!("推理引擎不可用: {}", reason),
      _ => {}
    }
    self.telemetry.apply(event);
  }

  /// 当前遥测。计数器与错误状态直接读取工作线程，帧率与最近结果来自已消费的事件。
  pub fn telemetry(&self) -> TelemetrySnapshot {
    let mut snapshot = self.telemetry.clone();
    snapshot.capturing = self.capture.is_capturing();
    snapshot.frames_captured = self.capture.frames_captured();
    snapshot.capture_error = self.capture.failure();
    match &self.inference {
      Some(worker) => {
        let stats = worker.stats();
        snapshot.engine_ready = worker.is_ready();
        snapshot.engine_error = worker.failure();
        snapshot.frames_dropped = stats.dropped;
        snapshot.inferences = stats.completed;
      }
      None => {
        snapshot.engine_ready = false;
        snapshot.engine_error = None;
      }
    }
    if !snapshot.capturing {
      snapshot.capture_fps = 0.0;
    }
    snapshot
  }
}

impl Drop for Controller {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      error!("停止流水线失败: {}", e);
    }
  }
}
