// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input.rs - 摄像头输入
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
  path::PathBuf,
  time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{error, warn};
use url::Url;

use crate::{
  FromUrl,
  frame::{DEFAULT_POOL_SIZE, Frame, MIN_POOL_SIZE, PixelFormat},
  model::config::{parse_bool, parse_size},
};

mod image_camera;
mod synthetic_camera;
#[cfg(feature = "v4l_input")]
mod v4l_camera;

pub use self::image_camera::{IMAGE_SCHEME, ImageFileCamera, load_rgb_image};
pub use self::synthetic_camera::{SYNTHETIC_SCHEME, SyntheticCamera};
#[cfg(feature = "v4l_input")]
pub use self::v4l_camera::{V4L_SCHEME, V4lCamera};

#[derive(Error, Debug)]
pub enum CaptureError {
  #[error("URI 方案不支持: {0}")]
  SchemeMismatch(String),
  #[error("参数 {key} 的值无效: {value}")]
  InvalidValue { key: String, value: String },
  #[error("没有可用的摄像头设备: {0}")]
  NoDevice(String),
  #[error("V4L 错误: {0}")]
  V4l(String),
  #[error("不支持的像素格式: {0}")]
  UnsupportedFormat(String),
  #[error("帧解码失败: {0}")]
  Decode(String),
  #[error("读取帧失败: {0}")]
  Read(String),
  #[error("I/O 错误: {0}")]
  Io(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  Image(#[from] image::ImageError),
}

/// 向设备请求的像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
  Mjpg,
  Yuyv,
  Rgb,
}

impl CaptureFormat {
  pub fn fourcc(&self) -> [u8; 4] {
    match self {
      CaptureFormat::Mjpg => *b"MJPG",
      CaptureFormat::Yuyv => *b"YUYV",
      CaptureFormat::Rgb => *b"RGB3",
    }
  }

  pub fn from_fourcc(fourcc: &[u8; 4]) -> Option<Self> {
    match fourcc {
      b"MJPG" => Some(CaptureFormat::Mjpg),
      b"YUYV" => Some(CaptureFormat::Yuyv),
      b"RGB3" => Some(CaptureFormat::Rgb),
      _ => None,
    }
  }
}

/// 采集参数。设备可能协商出不同的实际参数，下游应以帧自身的尺寸为准。
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureSettings {
  pub format: CaptureFormat,
  pub width: u32,
  pub height: u32,
  pub fps: u32,
  /// 帧池槽位数
  pub pool_size: usize,
  /// FPS 统计窗口
  pub fps_window: Duration,
  /// 读帧失败后的退避时间
  pub retry_backoff: Duration,
}

impl Default for CaptureSettings {
  fn default() -> Self {
    Self {
      format: CaptureFormat::Mjpg,
      width: 640,
      height: 480,
      fps: 30,
      pool_size: DEFAULT_POOL_SIZE,
      fps_window: Duration::from_millis(1000),
      retry_backoff: Duration::from_millis(10),
    }
  }
}

impl CaptureSettings {
  pub fn frame_interval(&self) -> Duration {
    Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
  }

  fn apply(&mut self, key: &str, value: &str) -> Result<bool, CaptureError> {
    match key {
      "width" => self.width = parse_number(key, value)?,
      "height" => self.height = parse_number(key, value)?,
      "size" => {
        let (width, height) = parse_size(value).ok_or_else(|| invalid(key, value))?;
        self.width = width;
        self.height = height;
      }
      "fps" => self.fps = parse_number(key, value)?,
      "format" => {
        self.format = match value.to_ascii_lowercase().as_str() {
          "mjpg" | "mjpeg" => CaptureFormat::Mjpg,
          "yuyv" => CaptureFormat::Yuyv,
          "rgb" | "rgb3" => CaptureFormat::Rgb,
          _ => return Err(invalid(key, value)),
        }
      }
      "pool" => {
        let pool: usize = parse_number(key, value)?;
        if pool < MIN_POOL_SIZE {
          return Err(invalid(key, value));
        }
        self.pool_size = pool;
      }
      "window" => self.fps_window = Duration::from_millis(parse_number(key, value)?),
      "backoff" => self.retry_backoff = Duration::from_millis(parse_number(key, value)?),
      _ => return Ok(false),
    }
    if self.width == 0 || self.height == 0 || self.fps == 0 {
      return Err(invalid(key, value));
    }
    Ok(true)
  }
}

fn invalid(key: &str, value: &str) -> CaptureError {
  CaptureError::InvalidValue {
    key: key.to_string(),
    value: value.to_string(),
  }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, CaptureError> {
  value.trim().parse().map_err(|_| invalid(key, value))
}

/// 可打开的摄像头
pub trait CameraSource: Send + Sync {
  fn describe(&self) -> String;

  fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError>;
}

/// 已打开的摄像头流，在采集线程内使用
pub trait CameraStream {
  /// 实际协商得到的尺寸与像素格式
  fn geometry(&self) -> (u32, u32, PixelFormat);

  /// 把下一帧写入 `frame`。返回 `Ok(false)` 表示本次读到空帧。
  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError>;
}

/// 按目标帧率节拍等待，用于没有硬件节拍的输入源
#[derive(Debug)]
pub(crate) struct Pacer {
  interval: Duration,
  next: Instant,
}

impl Pacer {
  pub(crate) fn new(fps: u32) -> Self {
    Self {
      interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
      next: Instant::now(),
    }
  }

  pub(crate) fn wait(&mut self) {
    let now = Instant::now();
    if self.next > now {
      std::thread::sleep(self.next - now);
      self.next += self.interval;
    } else {
      // 落后时不追帧
      self.next = now + self.interval;
    }
  }
}

/// 由 URL 构造的输入源
pub enum InputWrapper {
  #[cfg(feature = "v4l_input")]
  V4l(V4lCamera),
  Image(ImageFileCamera),
  Synthetic(SyntheticCamera),
}

impl CameraSource for InputWrapper {
  fn describe(&self) -> String {
    match self {
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(camera) => camera.describe(),
      InputWrapper::Image(camera) => camera.describe(),
      InputWrapper::Synthetic(camera) => camera.describe(),
    }
  }

  fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    match self {
      #[cfg(feature = "v4l_input")]
      InputWrapper::V4l(camera) => camera.open(settings),
      InputWrapper::Image(camera) => camera.open(settings),
      InputWrapper::Synthetic(camera) => camera.open(settings),
    }
  }
}

/// 摄像头 URL：输入源加采集参数
pub struct CameraConfig {
  pub source: InputWrapper,
  pub settings: CaptureSettings,
}

/// 单帧抓取时允许的连续空帧次数
const GRAB_ATTEMPTS: usize = 10;

impl CameraConfig {
  /// 打开输入源抓取一帧后立即释放设备，空帧按退避时间重试
  pub fn grab_frame(&self) -> Result<Frame, CaptureError> {
    let mut stream = self.source.open(&self.settings)?;
    let (width, height, format) = stream.geometry();
    let mut frame = Frame::new(width, height, format);
    for attempt in 1..=GRAB_ATTEMPTS {
      if stream.read_into(&mut frame)? {
        return Ok(frame);
      }
      warn!("第 {} 次读到空帧，重试", attempt);
      std::thread::sleep(self.settings.retry_backoff);
    }
    Err(CaptureError::Read(format!(
      "连续 {} 次读到空帧",
      GRAB_ATTEMPTS
    )))
  }
}

impl FromUrl for CameraConfig {
  type Error = CaptureError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let mut settings = CaptureSettings::default();
    let mut fallbacks: Vec<PathBuf> = Vec::new();
    let mut moving = true;

    for (key, value) in url.query_pairs() {
      if settings.apply(&key, &value)? {
        continue;
      }
      match &*key {
        "fallback" => fallbacks.push(PathBuf::from(value.into_owned())),
        "moving" => moving = parse_bool(&value).ok_or_else(|| invalid(&key, &value))?,
        _ => warn!("忽略未知的摄像头参数: {}={}", key, value),
      }
    }

    let path = urlencoding::decode(url.path())
      .map_err(|e| invalid("path", &e.to_string()))?
      .into_owned();

    let source = match url.scheme() {
      #[cfg(feature = "v4l_input")]
      V4L_SCHEME => {
        let device = if path.is_empty() || path == "/" {
          PathBuf::from("/dev/video0")
        } else {
          PathBuf::from(path)
        };
        InputWrapper::V4l(V4lCamera::new(device).with_fallbacks(fallbacks))
      }
      IMAGE_SCHEME => InputWrapper::Image(ImageFileCamera::new(path)),
      SYNTHETIC_SCHEME => InputWrapper::Synthetic(SyntheticCamera::new().with_motion(moving)),
      other => {
        error!("不支持的摄像头 URI 方案: {}", other);
        return Err(CaptureError::SchemeMismatch(other.to_string()));
      }
    };

    Ok(Self { source, settings })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn synthetic_url_reads_shared_keys() {
    let url = Url::parse("synthetic://?width=320&height=240&fps=15&pool=4&window=500").unwrap();
    let config = CameraConfig::from_url(&url).unwrap();
    assert!(matches!(config.source, InputWrapper::Synthetic(_)));
    assert_eq!(config.settings.width, 320);
    assert_eq!(config.settings.height, 240);
    assert_eq!(config.settings.fps, 15);
    assert_eq!(config.settings.pool_size, 4);
    assert_eq!(config.settings.fps_window, Duration::from_millis(500));
  }

  #[test]
  fn image_url_keeps_decoded_path() {
    let url = Url::parse("image:///tmp/some%20frame.png?fps=5").unwrap();
    let config = CameraConfig::from_url(&url).unwrap();
    match config.source {
      InputWrapper::Image(camera) => assert!(camera.describe().contains("/tmp/some frame.png")),
      _ => panic!("expected image source"),
    }
  }

  #[test]
  fn pool_below_floor_is_rejected() {
    let url = Url::parse("synthetic://?pool=1").unwrap();
    assert!(matches!(
      CameraConfig::from_url(&url),
      Err(CaptureError::InvalidValue { .. })
    ));
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rtsp://camera.local/stream").unwrap();
    assert!(matches!(
      CameraConfig::from_url(&url),
      Err(CaptureError::SchemeMismatch(_))
    ));
  }

  #[test]
  fn grab_frame_reads_negotiated_geometry() {
    let url = Url::parse("synthetic://?width=64&height=48&fps=200").unwrap();
    let frame = CameraConfig::from_url(&url).unwrap().grab_frame().unwrap();
    assert_eq!((frame.width(), frame.height()), (64, 48));
    assert!(frame.data().iter().any(|&v| v != 0));
  }

  #[test]
  fn fourcc_round_trips_known_formats() {
    for format in [CaptureFormat::Mjpg, CaptureFormat::Yuyv, CaptureFormat::Rgb] {
      assert_eq!(CaptureFormat::from_fourcc(&format.fourcc()), Some(format));
    }
    assert_eq!(CaptureFormat::from_fourcc(b"NV12"), None);
  }
}
