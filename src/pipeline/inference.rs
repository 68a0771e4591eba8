// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/pipeline/inference.rs - 推理线程
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
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
  time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::{
  frame::SharedFrame,
  model::{EngineError, InferenceEngine, ModelConfig},
  pipeline::{EventSender, FpsMeter, InferenceReport, PipelineError, PipelineEvent},
};

/// 推理线程检查停止标志的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// `submit` 的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
  /// 帧已交给推理线程
  Accepted,
  /// 推理线程正忙，帧被丢弃
  DroppedBusy,
  /// 引擎未就绪或已停止
  NotReady,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InferenceStats {
  pub accepted: u64,
  pub dropped: u64,
  pub completed: u64,
}

#[derive(Debug, Default)]
struct Shared {
  ready: AtomicBool,
  running: AtomicBool,
  processing: AtomicBool,
  accepted: AtomicU64,
  dropped: AtomicU64,
  completed: AtomicU64,
  /// 引擎加载失败的原因
  failure: Mutex<Option<String>>,
}

impl Shared {
  fn stats(&self) -> InferenceStats {
    InferenceStats {
      accepted: self.accepted.load(Ordering::Relaxed),
      dropped: self.dropped.load(Ordering::Relaxed),
      completed: self.completed.load(Ordering::Relaxed),
    }
  }
}

/// 向推理线程提交帧的句柄，可在采集线程中使用
#[derive(Debug, Clone)]
pub struct FrameSubmitter {
  shared: Arc<Shared>,
  tx: Sender<SharedFrame>,
}

impl FrameSubmitter {
  /// 非阻塞提交。推理线程忙时直接丢弃该帧，不排队。
  pub fn submit(&self, frame: SharedFrame) -> SubmitOutcome {
    if !self.shared.ready.load(Ordering::Acquire) || !self.shared.running.load(Ordering::Acquire) {
      return SubmitOutcome::NotReady;
    }
    if self
      .shared
      .processing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      self.shared.dropped.fetch_add(1, Ordering::Relaxed);
      return SubmitOutcome::DroppedBusy;
    }
    match self.tx.try_send(frame) {
      Ok(()) => {
        self.shared.accepted.fetch_add(1, Ordering::Relaxed);
        SubmitOutcome::Accepted
      }
      Err(_) => {
        self.shared.processing.store(false, Ordering::Release);
        SubmitOutcome::NotReady
      }
    }
  }

  pub fn stats(&self) -> InferenceStats {
    self.shared.stats()
  }
}

/// 推理线程：加载引擎后逐帧推理，同一时间最多处理一帧
pub struct InferenceWorker {
  shared: Arc<Shared>,
  tx: Sender<SharedFrame>,
  handle: Option<JoinHandle<()>>,
}

impl InferenceWorker {
  /// 在新线程中加载 ONNX 模型并开始推理
  pub fn start(
    config: ModelConfig,
    fps_window: Duration,
    events: EventSender,
  ) -> Result<Self, PipelineError> {
    Self::start_with(move || InferenceEngine::create(config), fps_window, events)
  }

  /// 使用给定的加载函数创建引擎，加载在推理线程中进行
  pub fn start_with<F>(
    loader: F,
    fps_window: Duration,
    events: EventSender,
  ) -> Result<Self, PipelineError>
  where
    F: FnOnce() -> Result<InferenceEngine, EngineError> + Send + 'static,
  {
    let shared = Arc::new(Shared::default());
    shared.running.store(true, Ordering::Release);
    let (tx, rx) = crossbeam_channel::bounded::<SharedFrame>(1);

    let thread_shared = Arc::clone(&shared);
    let handle = thread::Builder::new()
      .name("liaowang-inference".to_string())
      .spawn(move || inference_loop(loader, rx, thread_shared, fps_window, events))?;

    Ok(Self {
      shared,
      tx,
      handle: Some(handle),
    })
  }

  pub fn submitter(&self) -> FrameSubmitter {
    FrameSubmitter {
      shared: Arc::clone(&self.shared),
      tx: self.tx.clone(),
    }
  }

  pub fn is_ready(&self) -> bool {
    self.shared.ready.load(Ordering::Acquire)
  }

  /// 线程是否仍在运行（引擎加载失败后线程即退出）
  pub fn is_alive(&self) -> bool {
    self
      .handle
      .as_ref()
      .is_some_and(|handle| !handle.is_finished())
  }

  /// 等待引擎就绪，加载失败或超时返回 false
  pub fn wait_ready(&self, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
      if self.is_ready() {
        return true;
      }
      if !self.is_alive() {
        return false;
      }
      thread::sleep(Duration::from_millis(5));
    }
    self.is_ready()
  }

  pub fn stats(&self) -> InferenceStats {
    self.shared.stats()
  }

  /// 引擎加载失败的原因。不依赖事件队列，队列满时仍然可见。
  pub fn failure(&self) -> Option<String> {
    self
      .shared
      .failure
      .lock()
      .ok()
      .and_then(|failure| failure.clone())
  }

  /// 通知线程停止，正在进行的推理会完成
  pub fn signal_stop(&self) {
    self.shared.running.store(false, Ordering::Release);
  }

  pub fn join(&mut self) -> Result<(), PipelineError> {
    match self.handle.take() {
      Some(handle) => handle
        .join()
        .map_err(|_| PipelineError::ThreadPanicked("推理")),
      None => Ok(()),
    }
  }

  pub fn stop(&mut self) -> Result<(), PipelineError> {
    self.signal_stop();
    self.join()
  }
}

impl Drop for InferenceWorker {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      error!("停止推理线程失败: {}", e);
    }
  }
}

fn inference_loop<F>(
  loader: F,
  rx: Receiver<SharedFrame>,
  shared: Arc<Shared>,
  fps_window: Duration,
  events: EventSender,
) where
  F: FnOnce() -> Result<InferenceEngine, EngineError>,
{
  info!("推理线程启动，加载引擎...");
  let start = Instant::now();
  let mut engine = match loader() {
    Ok(engine) => engine,
    Err(e) => {
      error!("引擎加载失败: {}", e);
      if let Ok(mut failure) = shared.failure.lock() {
        *failure = Some(e.to_string());
      }
      events.emit(PipelineEvent::EngineFailed(e.to_string()));
      return;
    }
  };
  info!("引擎就绪，耗时 {:.2?}", start.elapsed());
  shared.ready.store(true, Ordering::Release);
  events.emit(PipelineEvent::EngineReady);

  let mut meter = FpsMeter::new(fps_window);
  while shared.running.load(Ordering::Acquire) {
    let frame = match rx.recv_timeout(POLL_INTERVAL) {
      Ok(frame) => frame,
      Err(RecvTimeoutError::Timeout) => {
        emit_fps(&mut meter, false, &shared, &events);
        continue;
      }
      Err(RecvTimeoutError::Disconnected) => break,
    };
    if !shared.running.load(Ordering::Acquire) {
      drop(frame);
      shared.processing.store(false, Ordering::Release);
      break;
    }

    match engine.run(&frame) {
      Ok(output) => {
        shared.completed.fetch_add(1, Ordering::Relaxed);
        events.emit(PipelineEvent::Inference(InferenceReport {
          sequence: frame.sequence(),
          slot: frame.slot(),
          frame_width: frame.width(),
          frame_height: frame.height(),
          detections: output.detections,
          timing: output.timing,
        }));
      }
      Err(e) => {
        warn!("帧 {} 推理失败: {}", frame.sequence(), e);
        events.emit(PipelineEvent::InferenceFailed(e.to_string()));
      }
    }
    // 先释放帧再清除标志，槽位在下一次提交前已不再被持有
    drop(frame);
    shared.processing.store(false, Ordering::Release);
    emit_fps(&mut meter, true, &shared, &events);
  }

  shared.ready.store(false, Ordering::Release);
  let stats = shared.stats();
  info!(
    "推理线程退出: 完成 {} 帧, 丢弃 {} 帧",
    stats.completed, stats.dropped
  );
}

fn emit_fps(meter: &mut FpsMeter, completed: bool, shared: &Shared, events: &EventSender) {
  let fps = if completed { meter.tick() } else { meter.poll() };
  if let Some(fps) = fps {
    let stats = shared.stats();
    debug!("推理帧率: {:.1} fps", fps);
    events.emit(PipelineEvent::InferenceFps {
      fps,
      completed: stats.completed,
      dropped: stats.dropped,
    });
  }
}
