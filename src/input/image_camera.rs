// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/image_camera.rs - 以固定帧率重复输出一张图像
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

use image::{ImageReader, RgbImage};
use tracing::info;

use super::{CameraSource, CameraStream, CaptureError, CaptureSettings, Pacer};
use crate::frame::{Frame, PixelFormat};

pub const IMAGE_SCHEME: &str = "image";

pub struct ImageFileCamera {
  path: PathBuf,
}

impl ImageFileCamera {
  pub fn new<P: Into<PathBuf>>(path: P) -> Self {
    Self { path: path.into() }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

/// 读取并解码为 RGB 图像
pub fn load_rgb_image<P: AsRef<Path>>(path: P) -> Result<RgbImage, CaptureError> {
  let image = ImageReader::open(path.as_ref())?.decode()?;
  Ok(image.to_rgb8())
}

impl CameraSource for ImageFileCamera {
  fn describe(&self) -> String {
    format!("image file {}", self.path.display())
  }

  fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    let image = load_rgb_image(&self.path)?;
    info!(
      "打开图像输入: {} ({}x{}) @ {} fps",
      self.path.display(),
      image.width(),
      image.height(),
      settings.fps
    );
    Ok(Box::new(ImageFileStream {
      image,
      pacer: Pacer::new(settings.fps),
    }))
  }
}

struct ImageFileStream {
  image: RgbImage,
  pacer: Pacer,
}

impl CameraStream for ImageFileStream {
  fn geometry(&self) -> (u32, u32, PixelFormat) {
    (self.image.width(), self.image.height(), PixelFormat::Rgb8)
  }

  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError> {
    self.pacer.wait();
    frame.reshape(self.image.width(), self.image.height(), PixelFormat::Rgb8);
    frame.data_mut().copy_from_slice(self.image.as_raw());
    Ok(true)
  }
}
