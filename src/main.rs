// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::{
  sync::{Arc, Mutex},
  time::Duration,
};

use anyhow::Result;
use clap::Parser;
use image::RgbaImage;
use tracing::{error, info, warn};

use liaowang::{
  FromUrl,
  input::CameraConfig,
  model::ModelConfig,
  output::{DisplaySink, ReportRecord, RgbaDisplay},
  pipeline::{Controller, PipelineEvent},
};

type Preview = Arc<Mutex<Option<RgbaImage>>>;

/// 只保留最新一帧，缓冲尺寸不变时原地覆盖
fn preview_sink(latest: Preview) -> Box<dyn DisplaySink> {
  Box::new(RgbaDisplay::new(move |image: &RgbaImage| {
    let Ok(mut slot) = latest.lock() else {
      return;
    };
    match slot.as_mut() {
      Some(saved) if saved.dimensions() == image.dimensions() => saved.copy_from_slice(image),
      _ => *slot = Some(image.clone()),
    }
  }))
}

/// 只有采集结束才退出事件循环。采集或引擎失败时流水线暂停，遥测照常，等待中断信号。
fn ends_stream(event: &PipelineEvent) -> bool {
  matches!(event, PipelineEvent::CaptureStopped { .. })
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("模型: {}", args.model);
  info!("摄像头: {}", args.camera);

  let camera = CameraConfig::from_url(&args.camera)?;
  let model = ModelConfig::from_url(&args.model)?;

  let (tx, rx) = crossbeam_channel::bounded(1);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.try_send(());
  })?;

  let preview: Preview = Arc::new(Mutex::new(None));
  let display = args
    .preview
    .as_ref()
    .map(|_| preview_sink(Arc::clone(&preview)));

  let mut controller = Controller::from_camera(camera);
  controller.start(model, display)?;

  let mut reports = 0u64;
  loop {
    if rx.try_recv().is_ok() {
      warn!("中断信号接收，停止流水线");
      break;
    }
    let Some(event) = controller.next_event(Duration::from_millis(100)) else {
      continue;
    };
    let finished = ends_stream(&event);
    match event {
      PipelineEvent::Inference(report) => {
        println!("{}", serde_json::to_string(&ReportRecord::from(&report))?);
        reports += 1;
        if args.max_reports > 0 && reports >= args.max_reports {
          info!("达到指定结果数 {}, 退出", reports);
          break;
        }
      }
      PipelineEvent::CaptureStarted { width, height } => {
        info!("采集开始: {}x{}", width, height);
      }
      PipelineEvent::CaptureFps { fps, frames_total } => {
        info!("采集帧率: {:.1} fps (共 {} 帧)", fps, frames_total);
      }
      PipelineEvent::InferenceFps {
        fps,
        completed,
        dropped,
      } => {
        info!(
          "推理帧率: {:.1} fps (完成 {} 帧, 丢弃 {} 帧)",
          fps, completed, dropped
        );
      }
      PipelineEvent::EngineReady => info!("推理引擎就绪"),
      PipelineEvent::InferenceFailed(reason) => warn!("推理失败: {}", reason),
      PipelineEvent::CaptureFailed(_) | PipelineEvent::EngineFailed(_) => {
        let telemetry = controller.telemetry();
        error!(
          "流水线暂停 (采集中: {}, 引擎就绪: {})，按 Ctrl-C 退出",
          telemetry.capturing, telemetry.engine_ready
        );
      }
      PipelineEvent::CaptureStopped { frames_total } => {
        info!("采集结束，共 {} 帧", frames_total);
      }
    }
    if finished {
      break;
    }
  }

  controller.stop()?;
  let telemetry = controller.telemetry();
  info!(
    "任务完成: 采集 {} 帧, 推理 {} 帧, 丢弃 {} 帧",
    telemetry.frames_captured, telemetry.inferences, telemetry.frames_dropped
  );

  if let Some(path) = &args.preview {
    let latest = preview
      .lock()
      .map_err(|_| anyhow::anyhow!("显示缓冲不可用"))?
      .take();
    match latest {
      Some(image) => {
        image.save(path)?;
        info!("最后一帧已保存到 {}", path.display());
      }
      None => warn!("没有可保存的显示帧"),
    }
  }

  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn failures_pause_instead_of_exiting() {
    assert!(!ends_stream(&PipelineEvent::CaptureFailed("设备不存在".to_string())));
    assert!(!ends_stream(&PipelineEvent::EngineFailed("模型不存在".to_string())));
    assert!(!ends_stream(&PipelineEvent::InferenceFailed("输出无效".to_string())));
    assert!(ends_stream(&PipelineEvent::CaptureStopped { frames_total: 3 }));
  }
}
