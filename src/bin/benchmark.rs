// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/bin/benchmark.rs - 重复推理计时
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

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use liaowang::{
  FromUrl,
  input::CameraConfig,
  model::{InferenceEngine, InferenceTiming, ModelConfig},
};
use tracing::{debug, info, warn};

/// 前几次推理包含缓存预热，不计入平均值
const SKIPPED_RUNS: usize = 2;

/// 对同一帧重复推理并统计各阶段平均耗时
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// ONNX 模型
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源，例如 image:///path/to/image.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 推理次数
  #[arg(long, default_value = "1000", value_name = "COUNT")]
  pub repeat: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  if args.repeat <= SKIPPED_RUNS {
    bail!("推理次数必须大于 {}", SKIPPED_RUNS);
  }

  info!("模型: {}", args.model);
  info!("输入来源: {}", args.input);

  let frame = CameraConfig::from_url(&args.input)?.grab_frame()?;
  let mut engine = InferenceEngine::create(ModelConfig::from_url(&args.model)?)?;
  info!(
    "开始 {} 次推理 (执行上下文 {} 个, CUDA: {})",
    args.repeat,
    engine.pool_size(),
    engine.is_accelerated()
  );

  let mut timings = Vec::with_capacity(args.repeat);
  for i in 0..args.repeat {
    let output = engine.run(&frame)?;
    debug!(
      "({}) {} 个结果, 耗时 {:.2} ms",
      i,
      output.detections.len(),
      output.timing.total_ms()
    );
    timings.push(output.timing);
  }

  let counted = &timings[SKIPPED_RUNS..];
  let n = counted.len() as f64;
  let mean = counted.iter().fold(InferenceTiming::default(), |acc, t| InferenceTiming {
    preprocess_ms: acc.preprocess_ms + t.preprocess_ms / n,
    inference_ms: acc.inference_ms + t.inference_ms / n,
    postprocess_ms: acc.postprocess_ms + t.postprocess_ms / n,
  });

  warn!(
    "平均耗时: 预处理 {:.2} ms, 推理 {:.2} ms, 后处理 {:.2} ms, 合计 {:.2} ms",
    mean.preprocess_ms,
    mean.inference_ms,
    mean.postprocess_ms,
    mean.total_ms()
  );
  println!("{}", serde_json::to_string(&mean)?);

  Ok(())
}
