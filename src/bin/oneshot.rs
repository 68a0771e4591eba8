// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/bin/oneshot.rs - 单帧推理
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

use anyhow::Result;
use clap::Parser;
use url::Url;

use liaowang::{
  FromUrl,
  input::CameraConfig,
  model::{InferenceEngine, ModelConfig},
  output::{DetectionRecord, TimingRecord},
};
use tracing::info;

/// 对一帧输入执行一次推理并输出结果
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///path/to/image.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);

  let frame = CameraConfig::from_url(&args.input)?.grab_frame()?;
  info!("输入帧获取成功: {}x{}", frame.width(), frame.height());

  let mut engine = InferenceEngine::create(ModelConfig::from_url(&args.model)?)?;
  info!("开始推理...");
  let output = engine.run(&frame)?;
  info!(
    "推理完成，共 {} 个结果，总耗时 {:.2} ms",
    output.detections.len(),
    output.timing.total_ms()
  );

  let detections: Vec<DetectionRecord> = output
    .detections
    .iter()
    .map(|d| DetectionRecord::new(d, frame.width(), frame.height()))
    .collect();
  let report = serde_json::json!({
    "timing": TimingRecord::from(output.timing),
    "detections": detections,
  });
  println!("{}", serde_json::to_string_pretty(&report)?);

  Ok(())
}
