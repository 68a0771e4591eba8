// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/pipeline.rs - 采集与推理流水线
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

use crossbeam_channel::{Sender, TrySendError};
use thiserror::Error;
use tracing::trace;

use crate::model::{DetectionResult, InferenceTiming};

pub mod capture;
pub mod controller;
pub mod inference;

pub use self::capture::{CaptureState, CaptureWorker};
pub use self::controller::{Controller, TelemetrySnapshot};
pub use self::inference::{FrameSubmitter, InferenceStats, InferenceWorker, SubmitOutcome};

/// 默认事件队列容量
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("线程创建失败: {0}")]
  Spawn(#[from] std::io::Error),
  #[error("{0} 线程异常退出")]
  ThreadPanicked(&'static str),
}

/// 一次完成的推理
#[derive(Debug, Clone)]
pub struct InferenceReport {
  pub sequence: u64,
  pub slot: usize,
  pub frame_width: u32,
  pub frame_height: u32,
  pub detections: Vec<DetectionResult>,
  pub timing: InferenceTiming,
}

/// 工作线程发往控制端的事件
#[derive(Debug, Clone)]
pub enum PipelineEvent {
  CaptureStarted { width: u32, height: u32 },
  CaptureFps { fps: f64, frames_total: u64 },
  CaptureFailed(String),
  CaptureStopped { frames_total: u64 },
  EngineReady,
  EngineFailed(String),
  Inference(InferenceReport),
  InferenceFailed(String),
  InferenceFps { fps: f64, completed: u64, dropped: u64 },
}

/// 事件发送端。队列满时丢弃事件，工作线程从不因此阻塞。
#[derive(Debug, Clone)]
pub struct EventSender {
  tx: Sender<PipelineEvent>,
}

impl EventSender {
  pub fn new(tx: Sender<PipelineEvent>) -> Self {
    Self { tx }
  }

  pub fn emit(&self, event: PipelineEvent) -> bool {
    match self.tx.try_send(event) {
      Ok(()) => true,
      Err(TrySendError::Full(event)) => {
        trace!("事件队列已满，丢弃事件: {:?}", event);
        false
      }
      Err(TrySendError::Disconnected(_)) => false,
    }
  }
}

/// 固定窗口的帧率统计
#[derive(Debug)]
pub struct FpsMeter {
  window: Duration,
  started: Instant,
  frames: u64,
}

impl FpsMeter {
  pub fn new(window: Duration) -> Self {
    Self {
      window: window.max(Duration::from_millis(1)),
      started: Instant::now(),
      frames: 0,
    }
  }

  /// 记录一帧；窗口结束时返回窗口内的平均帧率并开始新窗口
  pub fn tick(&mut self) -> Option<f64> {
    self.frames += 1;
    self.poll()
  }

  /// 不记帧，仅检查窗口是否结束。没有帧时帧率为 0。
  pub fn poll(&mut self) -> Option<f64> {
    let elapsed = self.started.elapsed();
    if elapsed < self.window {
      return None;
    }
    let fps = self.frames as f64 / elapsed.as_secs_f64();
    self.started = Instant::now();
    self.frames = 0;
    Some(fps)
  }
}
