// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/v4l_camera.rs - V4L2 摄像头
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

use std::path::{Path, PathBuf};

use image::ImageFormat;
use tracing::{debug, info, warn};
use v4l::{
  Device, FourCC,
  buffer::Type,
  io::{mmap::Stream, traits::CaptureStream},
  video::{Capture, capture::Parameters},
};

use super::{CameraSource, CameraStream, CaptureError, CaptureFormat, CaptureSettings};
use crate::frame::{Frame, PixelFormat};

pub const V4L_SCHEME: &str = "v4l";

const STREAM_BUFFERS: u32 = 4;

/// V4L2 摄像头。首选设备打开失败时依次尝试备用设备。
pub struct V4lCamera {
  device: PathBuf,
  fallbacks: Vec<PathBuf>,
}

impl V4lCamera {
  pub fn new<P: Into<PathBuf>>(device: P) -> Self {
    Self {
      device: device.into(),
      fallbacks: Vec::new(),
    }
  }

  pub fn with_fallbacks(mut self, fallbacks: Vec<PathBuf>) -> Self {
    self.fallbacks = fallbacks;
    self
  }

  fn open_device(path: &Path, settings: &CaptureSettings) -> Result<V4lStream, CaptureError> {
    let device = Device::with_path(path).map_err(|e| CaptureError::V4l(e.to_string()))?;

    let mut format = device
      .format()
      .map_err(|e| CaptureError::V4l(e.to_string()))?;
    format.width = settings.width;
    format.height = settings.height;
    format.fourcc = FourCC::new(&settings.format.fourcc());
    let format = device
      .set_format(&format)
      .map_err(|e| CaptureError::V4l(e.to_string()))?;

    let negotiated = CaptureFormat::from_fourcc(&format.fourcc.repr)
      .ok_or_else(|| CaptureError::UnsupportedFormat(format.fourcc.to_string()))?;

    if let Err(e) = device.set_params(&Parameters::with_fps(settings.fps)) {
      warn!("设置帧率 {} 失败: {}", settings.fps, e);
    }

    info!(
      "打开摄像头 {}: 请求 {}x{} {:?} @ {} fps, 实际 {}x{} {}",
      path.display(),
      settings.width,
      settings.height,
      settings.format,
      settings.fps,
      format.width,
      format.height,
      format.fourcc
    );

    let stream = Stream::with_buffers(&device, Type::VideoCapture, STREAM_BUFFERS)
      .map_err(|e| CaptureError::V4l(e.to_string()))?;

    Ok(V4lStream {
      stream,
      _device: device,
      width: format.width,
      height: format.height,
      format: negotiated,
    })
  }
}

impl CameraSource for V4lCamera {
  fn describe(&self) -> String {
    format!("v4l {}", self.device.display())
  }

  fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    let mut failures = Vec::new();
    for path in std::iter::once(&self.device).chain(self.fallbacks.iter()) {
      match Self::open_device(path, settings) {
        Ok(stream) => return Ok(Box::new(stream)),
        Err(e) => {
          warn!("摄像头 {} 打开失败: {}", path.display(), e);
          failures.push(format!("{}: {}", path.display(), e));
        }
      }
    }
    Err(CaptureError::NoDevice(failures.join("; ")))
  }
}

struct V4lStream {
  // 先于设备释放
  stream: Stream<'static>,
  _device: Device,
  width: u32,
  height: u32,
  format: CaptureFormat,
}

impl CameraStream for V4lStream {
  fn geometry(&self) -> (u32, u32, PixelFormat) {
    (self.width, self.height, PixelFormat::Rgb8)
  }

  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError> {
    let (buffer, meta) = self
      .stream
      .next()
      .map_err(|e| CaptureError::Read(e.to_string()))?;
    let used = (meta.bytesused as usize).min(buffer.len());
    if used == 0 {
      return Ok(false);
    }
    let data = &buffer[..used];

    match self.format {
      CaptureFormat::Yuyv => {
        frame.reshape(self.width, self.height, PixelFormat::Rgb8);
        let expected = self.width as usize * self.height as usize * 2;
        if data.len() < expected {
          debug!("YUYV 帧长度不足: {} < {}", data.len(), expected);
          return Ok(false);
        }
        yuyv_to_rgb(&data[..expected], frame.data_mut());
      }
      CaptureFormat::Mjpg => {
        let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
          .map_err(|e| CaptureError::Decode(e.to_string()))?
          .to_rgb8();
        frame.reshape(image.width(), image.height(), PixelFormat::Rgb8);
        frame.data_mut().copy_from_slice(image.as_raw());
      }
      CaptureFormat::Rgb => {
        frame.reshape(self.width, self.height, PixelFormat::Rgb8);
        let expected = frame.data().len();
        if data.len() < expected {
          debug!("RGB 帧长度不足: {} < {}", data.len(), expected);
          return Ok(false);
        }
        frame.data_mut().copy_from_slice(&data[..expected]);
      }
    }
    Ok(true)
  }
}

/// YUYV (4:2:2) 转交错 RGB，每 4 字节输入产生 2 个像素
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut [u8]) {
  for (src, dst) in yuyv.chunks_exact(4).zip(rgb.chunks_exact_mut(6)) {
    let u = src[1] as f32 - 128.0;
    let v = src[3] as f32 - 128.0;
    for (i, y) in [src[0] as f32, src[2] as f32].into_iter().enumerate() {
      dst[i * 3] = (y + 1.402 * v).clamp(0.0, 255.0) as u8;
      dst[i * 3 + 1] = (y - 0.344 * u - 0.714 * v).clamp(0.0, 255.0) as u8;
      dst[i * 3 + 2] = (y + 1.772 * u).clamp(0.0, 255.0) as u8;
    }
  }
}
