// 该文件是 Liaowang （瞭望） 项目的一部分。
// tests/pipeline.rs - 采集与推理流水线集成测试
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

mod common;

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use image::RgbaImage;
use liaowang::{
  frame::{Frame, PixelFormat},
  input::{CameraSource, CameraStream, CaptureError, CaptureSettings, SyntheticCamera},
  model::{ClassTable, ModelConfig},
  output::{DetectionRecord, RgbaDisplay},
  pipeline::{CaptureState, Controller, PipelineEvent},
};

use common::red_box_engine;

fn settings(fps: u32) -> CaptureSettings {
  CaptureSettings {
    width: 160,
    height: 120,
    fps,
    fps_window: Duration::from_millis(250),
    ..CaptureSettings::default()
  }
}

fn small_model() -> ModelConfig {
  ModelConfig::new("red_box.onnx").with_input_size(64, 64)
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
  let deadline = Instant::now() + timeout;
  while Instant::now() < deadline {
    if condition() {
      return true;
    }
    thread::sleep(Duration::from_millis(5));
  }
  condition()
}

#[test]
fn slow_inference_does_not_slow_capture() {
  const LATENCY: Duration = Duration::from_millis(100);

  let camera = SyntheticCamera::new().with_motion(false);
  let mut controller = Controller::new(Arc::new(camera), settings(100));
  controller
    .start_with_engine(
      || red_box_engine(small_model(), ClassTable::coco(), LATENCY),
      None,
    )
    .unwrap();
  assert!(wait_until(Duration::from_secs(5), || controller.is_engine_ready()));

  let before = controller.telemetry();
  let started = Instant::now();
  thread::sleep(Duration::from_millis(1500));
  let after = controller.telemetry();
  let elapsed = started.elapsed().as_secs_f64();

  let captured = after.frames_captured - before.frames_captured;
  let completed = after.inferences - before.inferences;
  let capture_fps = captured as f64 / elapsed;
  assert!(capture_fps > 50.0, "capture fps = {capture_fps}");
  assert!(
    completed as f64 <= elapsed / LATENCY.as_secs_f64() + 1.0,
    "completed = {completed} in {elapsed}s"
  );
  assert!(completed > 0);
  assert!(after.frames_dropped > before.frames_dropped);

  controller.stop().unwrap();
  assert_eq!(controller.capture_state(), CaptureState::Idle);
}

#[test]
fn detections_reach_the_controller_normalized() {
  let camera = SyntheticCamera::new().with_motion(false);
  let expected = camera.object_at(0, 160, 120).normalized(160, 120);

  let mut controller = Controller::new(Arc::new(camera), settings(60));
  controller
    .start_with_engine(
      || red_box_engine(small_model(), ClassTable::coco(), Duration::ZERO),
      None,
    )
    .unwrap();

  let deadline = Instant::now() + Duration::from_secs(5);
  let mut report = None;
  while report.is_none() && Instant::now() < deadline {
    if let Some(PipelineEvent::Inference(found)) = controller.next_event(Duration::from_millis(50)) {
      report = Some(found);
    }
  }
  let report = report.unwrap();
  assert_eq!((report.frame_width, report.frame_height), (160, 120));
  assert_eq!(report.detections.len(), 1);

  let record = DetectionRecord::new(&report.detections[0], 160, 120);
  assert_eq!(record.label, "person");
  for (actual, wanted) in [
    (record.x, expected.x),
    (record.y, expected.y),
    (record.w, expected.width),
    (record.h, expected.height),
  ] {
    assert!((actual - wanted).abs() <= 0.02, "{record:?} vs {expected:?}");
  }
  assert!(controller.telemetry().last_timing.is_some());
  controller.stop().unwrap();
}

/// 每隔一次读帧失败，失败方式在错误与空帧之间交替
struct Flaky {
  reads: Arc<AtomicU64>,
}

struct FlakyStream {
  reads: Arc<AtomicU64>,
}

impl CameraSource for Flaky {
  fn describe(&self) -> String {
    "flaky".to_string()
  }

  fn open(&self, _settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    Ok(Box::new(FlakyStream {
      reads: Arc::clone(&self.reads),
    }))
  }
}

impl CameraStream for FlakyStream {
  fn geometry(&self) -> (u32, u32, PixelFormat) {
    (32, 24, PixelFormat::Rgb8)
  }

  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError> {
    thread::sleep(Duration::from_millis(2));
    let n = self.reads.fetch_add(1, Ordering::SeqCst);
    match n % 4 {
      1 => Err(CaptureError::Read("设备忙".to_string())),
      3 => Ok(false),
      _ => {
        frame.reshape(32, 24, PixelFormat::Rgb8);
        frame.data_mut().fill(n as u8);
        Ok(true)
      }
    }
  }
}

#[test]
fn transient_read_failures_are_retried() {
  let reads = Arc::new(AtomicU64::new(0));
  let source = Flaky {
    reads: Arc::clone(&reads),
  };
  let presented = Arc::new(AtomicU64::new(0));
  let display_count = Arc::clone(&presented);
  let display = RgbaDisplay::new(move |image: &RgbaImage| {
    assert_eq!(image.dimensions(), (32, 24));
    display_count.fetch_add(1, Ordering::SeqCst);
  });

  let mut controller = Controller::new(Arc::new(source), CaptureSettings::default());
  controller
    .start_with_engine(
      || red_box_engine(small_model(), ClassTable::coco(), Duration::ZERO),
      Some(Box::new(display)),
    )
    .unwrap();

  assert!(wait_until(Duration::from_secs(5), || {
    controller.telemetry().frames_captured >= 20
  }));
  let events = controller.drain();
  assert!(
    !events
      .iter()
      .any(|e| matches!(e, PipelineEvent::CaptureFailed(_)))
  );
  assert_eq!(controller.capture_state(), CaptureState::Capturing);

  controller.stop().unwrap();
  let captured = controller.telemetry().frames_captured;
  assert_eq!(presented.load(Ordering::SeqCst), captured);
  // 一半的读取失败，但都没有中断采集
  assert!(reads.load(Ordering::SeqCst) >= captured * 2 - 1);
}

/// 先正常出若干帧，之后每次读取都失败，模拟采集中途拔出的设备
struct Dying {
  good: u64,
}

struct DyingStream {
  good: u64,
  reads: u64,
}

impl CameraSource for Dying {
  fn describe(&self) -> String {
    "dying".to_string()
  }

  fn open(&self, _settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    Ok(Box::new(DyingStream {
      good: self.good,
      reads: 0,
    }))
  }
}

impl CameraStream for DyingStream {
  fn geometry(&self) -> (u32, u32, PixelFormat) {
    (32, 24, PixelFormat::Rgb8)
  }

  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError> {
    thread::sleep(Duration::from_millis(2));
    self.reads += 1;
    if self.reads > self.good {
      return Err(CaptureError::Read("设备已断开".to_string()));
    }
    frame.reshape(32, 24, PixelFormat::Rgb8);
    Ok(true)
  }
}

#[test]
fn capture_fps_drops_to_zero_when_reads_keep_failing() {
  const GOOD: u64 = 30;

  let settings = CaptureSettings {
    fps_window: Duration::from_millis(100),
    ..CaptureSettings::default()
  };
  let mut controller = Controller::new(Arc::new(Dying { good: GOOD }), settings);
  controller
    .start_with_engine(
      || red_box_engine(small_model(), ClassTable::coco(), Duration::ZERO),
      None,
    )
    .unwrap();

  let deadline = Instant::now() + Duration::from_secs(5);
  let mut measured = false;
  let mut zeroed = false;
  while !zeroed && Instant::now() < deadline {
    if let Some(PipelineEvent::CaptureFps { fps, frames_total }) =
      controller.next_event(Duration::from_millis(50))
    {
      measured |= fps > 0.0;
      zeroed = fps == 0.0 && frames_total == GOOD;
    }
  }
  assert!(measured);
  assert!(zeroed);

  // 读取仍在重试，状态保持采集中，但帧率已反映出没有新帧
  thread::sleep(Duration::from_millis(250));
  controller.drain();
  let telemetry = controller.telemetry();
  assert_eq!(controller.capture_state(), CaptureState::Capturing);
  assert!(telemetry.capturing);
  assert_eq!(telemetry.frames_captured, GOOD);
  assert_eq!(telemetry.capture_fps, 0.0);
  assert!(telemetry.capture_error.is_none());
  controller.stop().unwrap();
}

struct Unplugged;

impl CameraSource for Unplugged {
  fn describe(&self) -> String {
    "unplugged".to_string()
  }

  fn open(&self, _settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    Err(CaptureError::NoDevice("/dev/video9".to_string()))
  }
}

#[test]
fn camera_open_failure_leaves_pipeline_idle() {
  let mut controller = Controller::new(Arc::new(Unplugged), CaptureSettings::default());
  controller
    .start_with_engine(
      || red_box_engine(small_model(), ClassTable::coco(), Duration::ZERO),
      None,
    )
    .unwrap();

  let deadline = Instant::now() + Duration::from_secs(5);
  let mut failed = false;
  while !failed && Instant::now() < deadline {
    failed = matches!(
      controller.next_event(Duration::from_millis(50)),
      Some(PipelineEvent::CaptureFailed(_))
    );
  }
  assert!(failed);
  assert!(wait_until(Duration::from_secs(2), || {
    controller.capture_state() == CaptureState::Idle
  }));

  let telemetry = controller.telemetry();
  assert!(!telemetry.capturing);
  assert_eq!(telemetry.frames_captured, 0);
  assert_eq!(telemetry.capture_fps, 0.0);
  assert!(telemetry.capture_error.is_some());
  controller.stop().unwrap();
}

#[test]
fn pipeline_can_be_restarted() {
  let mut controller = Controller::new(Arc::new(SyntheticCamera::new()), settings(100));
  let start = |controller: &mut Controller| {
    controller
      .start_with_engine(
        || red_box_engine(small_model(), ClassTable::coco(), Duration::ZERO),
        None,
      )
      .unwrap();
  };

  start(&mut controller);
  // 重复启动不做任何事
  start(&mut controller);
  assert!(wait_until(Duration::from_secs(5), || {
    controller.telemetry().frames_captured > 5
  }));
  controller.stop().unwrap();
  let first_run = controller.telemetry().frames_captured;
  assert_eq!(controller.capture_state(), CaptureState::Idle);

  start(&mut controller);
  assert!(wait_until(Duration::from_secs(5), || {
    controller.telemetry().frames_captured > first_run + 5
  }));
  assert!(wait_until(Duration::from_secs(5), || controller.is_engine_ready()));
  controller.stop().unwrap();
}
