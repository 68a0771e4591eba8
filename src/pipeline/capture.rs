// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/pipeline/capture.rs - 采集线程
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
    atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
};

use tracing::{debug, error, info, warn};

use crate::{
  frame::FramePool,
  input::{CameraSource, CaptureSettings},
  output::DisplaySink,
  pipeline::{EventSender, FpsMeter, FrameSubmitter, PipelineError, PipelineEvent},
};

/// 采集状态：Idle → Capturing → Stopping → Idle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CaptureState {
  Idle = 0,
  Capturing = 1,
  Stopping = 2,
}

impl CaptureState {
  fn from_u8(value: u8) -> Self {
    match value {
      1 => CaptureState::Capturing,
      2 => CaptureState::Stopping,
      _ => CaptureState::Idle,
    }
  }
}

#[derive(Debug, Default)]
struct Shared {
  state: AtomicU8,
  running: AtomicBool,
  frames_total: AtomicU64,
  read_failures: AtomicU64,
  /// 最近一次启动失败的原因，重新启动时清除
  failure: Mutex<Option<String>>,
}

impl Shared {
  fn set_failure(&self, reason: Option<String>) {
    if let Ok(mut failure) = self.failure.lock() {
      *failure = reason;
    }
  }
}

/// 采集线程。持有摄像头，按设备节拍读帧并发布到推理端与显示端。
pub struct CaptureWorker {
  source: Arc<dyn CameraSource>,
  settings: CaptureSettings,
  shared: Arc<Shared>,
  handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
  pub fn new(source: Arc<dyn CameraSource>, settings: CaptureSettings) -> Self {
    Self {
      source,
      settings,
      shared: Arc::new(Shared::default()),
      handle: None,
    }
  }

  pub fn settings(&self) -> &CaptureSettings {
    &self.settings
  }

  pub fn state(&self) -> CaptureState {
    CaptureState::from_u8(self.shared.state.load(Ordering::Acquire))
  }

  pub fn is_capturing(&self) -> bool {
    self.state() == CaptureState::Capturing
  }

  pub fn frames_captured(&self) -> u64 {
    self.shared.frames_total.load(Ordering::Relaxed)
  }

  /// 读帧失败（含空帧）的累计次数
  pub fn read_failures(&self) -> u64 {
    self.shared.read_failures.load(Ordering::Relaxed)
  }

  /// 最近一次打开摄像头失败的原因。不依赖事件队列，队列满时仍然可见。
  pub fn failure(&self) -> Option<String> {
    self
      .shared
      .failure
      .lock()
      .ok()
      .and_then(|failure| failure.clone())
  }

  /// 启动采集。已在采集时直接返回。
  pub fn start(
    &mut self,
    submitter: FrameSubmitter,
    display: Option<Box<dyn DisplaySink>>,
    events: EventSender,
  ) -> Result<(), PipelineError> {
    if self
      .shared
      .state
      .compare_exchange(
        CaptureState::Idle as u8,
        CaptureState::Capturing as u8,
        Ordering::AcqRel,
        Ordering::Acquire,
      )
      .is_err()
    {
      debug!("采集已在进行，忽略重复启动");
      return Ok(());
    }
    // 上一次采集（例如摄像头打开失败）留下的线程
    self.join()?;

    self.shared.set_failure(None);
    self.shared.running.store(true, Ordering::Release);
    let context = CaptureLoop {
      source: Arc::clone(&self.source),
      settings: self.settings.clone(),
      shared: Arc::clone(&self.shared),
      submitter,
      display,
      events,
    };
    let spawned = thread::Builder::new()
      .name("liaowang-capture".to_string())
      .spawn(move || context.run());
    match spawned {
      Ok(handle) => {
        self.handle = Some(handle);
        Ok(())
      }
      Err(e) => {
        self.shared.running.store(false, Ordering::Release);
        self
          .shared
          .state
          .store(CaptureState::Idle as u8, Ordering::Release);
        Err(PipelineError::Spawn(e))
      }
    }
  }

  /// 通知采集线程停止，可在任意线程调用。线程在下一次循环开始时退出。
  pub fn signal_stop(&self) {
    self.shared.running.store(false, Ordering::Release);
    let _ = self.shared.state.compare_exchange(
      CaptureState::Capturing as u8,
      CaptureState::Stopping as u8,
      Ordering::AcqRel,
      Ordering::Acquire,
    );
  }

  pub fn join(&mut self) -> Result<(), PipelineError> {
    match self.handle.take() {
      Some(handle) => handle
        .join()
        .map_err(|_| PipelineError::ThreadPanicked("采集")),
      None => Ok(()),
    }
  }

  pub fn stop(&mut self) -> Result<(), PipelineError> {
    self.signal_stop();
    self.join()
  }
}

impl Drop for CaptureWorker {
  fn drop(&mut self) {
    if let Err(e) = self.stop() {
      error!("停止采集线程失败: {}", e);
    }
  }
}

struct CaptureLoop {
  source: Arc<dyn CameraSource>,
  settings: CaptureSettings,
  shared: Arc<Shared>,
  submitter: FrameSubmitter,
  display: Option<Box<dyn DisplaySink>>,
  events: EventSender,
}

impl CaptureLoop {
  fn run(mut self) {
    info!("采集线程启动: {}", self.source.describe());
    match self.source.open(&self.settings) {
      Ok(stream) => self.capture(stream),
      Err(e) => {
        error!("摄像头打开失败: {}", e);
        self.shared.set_failure(Some(e.to_string()));
        self.events.emit(PipelineEvent::CaptureFailed(e.to_string()));
      }
    }
    self.shared.running.store(false, Ordering::Release);
    self
      .shared
      .state
      .store(CaptureState::Idle as u8, Ordering::Release);
  }

  fn capture(&mut self, mut stream: Box<dyn crate::input::CameraStream>) {
    let (width, height, format) = stream.geometry();
    let mut pool = FramePool::new(self.settings.pool_size, width, height, format);
    info!(
      "开始采集: {}x{} {:?}, 帧池 {} 个槽位",
      width,
      height,
      format,
      pool.len()
    );
    self
      .events
      .emit(PipelineEvent::CaptureStarted { width, height });

    let mut meter = FpsMeter::new(self.settings.fps_window);
    let mut streak = 0u64;
    while self.shared.running.load(Ordering::Acquire) {
      let frame = pool.acquire_next_slot();
      let failure = match stream.read_into(frame) {
        Ok(true) => None,
        Ok(false) => Some("空帧".to_string()),
        Err(e) => Some(e.to_string()),
      };
      if let Some(reason) = failure {
        streak += 1;
        self.shared.read_failures.fetch_add(1, Ordering::Relaxed);
        if streak == 1 {
          warn!("读帧失败，稍后重试: {}", reason);
        } else {
          debug!("读帧连续失败 {} 次: {}", streak, reason);
        }
        // 设备持续失败时帧率随窗口结束归零
        if let Some(fps) = meter.poll() {
          debug!("采集帧率: {:.1} fps", fps);
          self.events.emit(PipelineEvent::CaptureFps {
            fps,
            frames_total: self.shared.frames_total.load(Ordering::Relaxed),
          });
        }
        thread::sleep(self.settings.retry_backoff);
        continue;
      }
      if streak > 0 {
        info!("读帧恢复，此前连续失败 {} 次", streak);
        streak = 0;
      }

      if let Some(display) = self.display.as_mut() {
        display.present(frame);
      }
      let shared_frame = pool.publish();
      let total = self.shared.frames_total.fetch_add(1, Ordering::Relaxed) + 1;
      let outcome = self.submitter.submit(shared_frame);
      debug!("帧 {} 已发布: {:?}", total, outcome);

      if let Some(fps) = meter.tick() {
        debug!("采集帧率: {:.1} fps", fps);
        self.events.emit(PipelineEvent::CaptureFps {
          fps,
          frames_total: total,
        });
      }
    }

    // 释放摄像头
    drop(stream);
    let frames_total = self.shared.frames_total.load(Ordering::Relaxed);
    if pool.copy_on_write_count() > 0 {
      warn!("采集期间发生 {} 次槽位复制", pool.copy_on_write_count());
    }
    info!("采集线程退出，共采集 {} 帧", frames_total);
    self
      .events
      .emit(PipelineEvent::CaptureStopped { frames_total });
  }
}
