// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Liaowang 实时检测参数配置
///
/// 每条推理结果以一行 JSON 输出到标准输出。摄像头或模型不可用时流水线暂停并记录错误，
/// 程序不会自行退出，按 Ctrl-C 结束。
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Args {
  /// ONNX 模型，例如 onnx:///models/yolo11n.onnx?conf=0.4&iou=0.5
  #[arg(long, value_name = "MODEL")]
  pub model: Url,

  /// 摄像头来源
  /// 支持格式:
  /// - V4L2: v4l:///dev/video0?width=640&height=480&fps=30&format=mjpg
  /// - 图片: image:///path/to/image.png?fps=30
  /// - 测试图案: synthetic://?width=640&height=480&fps=30
  #[arg(long, value_name = "CAMERA", default_value = "v4l:///dev/video0")]
  pub camera: Url,

  /// 退出时把最后一帧显示画面保存为图片
  #[arg(long, value_name = "FILE")]
  pub preview: Option<PathBuf>,

  /// 输出的推理结果条数上限，0 表示无限制
  #[arg(long, default_value = "0", value_name = "COUNT")]
  pub max_reports: u64,
}
