// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/input/synthetic_camera.rs - 合成测试画面
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

use tracing::info;

use super::{CameraSource, CameraStream, CaptureError, CaptureSettings, Pacer};
use crate::{
  frame::{Frame, PixelFormat},
  model::BoundingBox,
};

pub const SYNTHETIC_SCHEME: &str = "synthetic";

const BACKGROUND: [u8; 3] = [90, 90, 90];
const OBJECT: [u8; 3] = [255, 0, 0];
/// 每帧水平移动的像素数
const STEP: u32 = 8;

/// 灰色背景上的红色矩形，可选水平移动
#[derive(Debug, Clone)]
pub struct SyntheticCamera {
  moving: bool,
}

impl Default for SyntheticCamera {
  fn default() -> Self {
    Self::new()
  }
}

impl SyntheticCamera {
  pub fn new() -> Self {
    Self { moving: true }
  }

  pub fn with_motion(mut self, moving: bool) -> Self {
    self.moving = moving;
    self
  }

  /// 第 `index` 帧中矩形的位置
  pub fn object_at(&self, index: u64, width: u32, height: u32) -> BoundingBox {
    let (w, h) = ((width / 4).max(1), (height / 4).max(1));
    let travel = width.saturating_sub(w).max(1) as u64;
    let x = if self.moving {
      ((index * STEP as u64) % travel) as u32
    } else {
      (width - w) / 2
    };
    let y = (height - h) / 2;
    BoundingBox::new(x as f32, y as f32, w as f32, h as f32)
  }
}

impl CameraSource for SyntheticCamera {
  fn describe(&self) -> String {
    format!("synthetic (moving={})", self.moving)
  }

  fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraStream>, CaptureError> {
    if settings.width == 0 || settings.height == 0 {
      return Err(CaptureError::InvalidValue {
        key: "size".to_string(),
        value: format!("{}x{}", settings.width, settings.height),
      });
    }
    info!(
      "打开合成画面: {}x{} @ {} fps",
      settings.width, settings.height, settings.fps
    );
    Ok(Box::new(SyntheticStream {
      camera: self.clone(),
      width: settings.width,
      height: settings.height,
      index: 0,
      pacer: Pacer::new(settings.fps),
    }))
  }
}

struct SyntheticStream {
  camera: SyntheticCamera,
  width: u32,
  height: u32,
  index: u64,
  pacer: Pacer,
}

impl CameraStream for SyntheticStream {
  fn geometry(&self) -> (u32, u32, PixelFormat) {
    (self.width, self.height, PixelFormat::Rgb8)
  }

  fn read_into(&mut self, frame: &mut Frame) -> Result<bool, CaptureError> {
    self.pacer.wait();
    frame.reshape(self.width, self.height, PixelFormat::Rgb8);

    let object = self.camera.object_at(self.index, self.width, self.height);
    let (x1, y1) = (object.x as u32, object.y as u32);
    let (x2, y2) = (x1 + object.width as u32, y1 + object.height as u32);
    let stride = frame.stride();
    for (y, row) in frame.data_mut().chunks_exact_mut(stride).enumerate() {
      let y = y as u32;
      for (x, px) in row.chunks_exact_mut(3).enumerate() {
        let x = x as u32;
        let inside = x >= x1 && x < x2 && y >= y1 && y < y2;
        px.copy_from_slice(if inside { &OBJECT } else { &BACKGROUND });
      }
    }

    self.index += 1;
    Ok(true)
  }
}
