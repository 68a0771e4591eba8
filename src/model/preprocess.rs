// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/preprocess.rs - 预处理：letterbox、中心裁剪与张量构建
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

use fast_image_resize as fr;
use half::{f16, slice::HalfFloatSliceExt};
use tracing::debug;

use crate::{
  frame::Frame,
  model::{
    BoundingBox, ModelKind, Precision,
    config::{LetterboxAnchor, ModelConfig},
    engine::EngineError,
    session::InputTensor,
  },
};

const RGB_CHANNELS: usize = 3;

/// 模型空间与源图像空间之间的映射
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LetterboxInfo {
  /// 模型空间到源图像空间的统一缩放系数（resizeScale）
  pub scale: f32,
  /// 画布中图像左上角的偏移
  pub pad_x: f32,
  pub pad_y: f32,
  pub source_width: u32,
  pub source_height: u32,
}

impl LetterboxInfo {
  /// 中心点格式 (cx, cy, w, h) 的模型空间框映射到源图像像素坐标
  pub fn to_source(&self, cx: f32, cy: f32, w: f32, h: f32) -> BoundingBox {
    BoundingBox::new(
      (cx - 0.5 * w - self.pad_x) * self.scale,
      (cy - 0.5 * h - self.pad_y) * self.scale,
      w * self.scale,
      h * self.scale,
    )
  }

  /// 源图像中的框映射到模型空间，与 `to_source` 互逆
  pub fn to_model(&self, bbox: &BoundingBox) -> BoundingBox {
    BoundingBox::new(
      bbox.x / self.scale + self.pad_x,
      bbox.y / self.scale + self.pad_y,
      bbox.width / self.scale,
      bbox.height / self.scale,
    )
  }
}

/// 把任意尺寸的帧变换到模型输入尺寸的画布上，画布在多次调用间复用
pub struct Preprocessor {
  kind: ModelKind,
  target_width: u32,
  target_height: u32,
  pad_value: u8,
  anchor: LetterboxAnchor,
  resizer: fr::Resizer,
  resized: Vec<u8>,
  canvas: Vec<u8>,
}

impl Preprocessor {
  pub fn new(config: &ModelConfig) -> Self {
    let canvas_len = config.input_width as usize * config.input_height as usize * RGB_CHANNELS;
    Self {
      kind: config.kind,
      target_width: config.input_width,
      target_height: config.input_height,
      pad_value: config.pad_value,
      anchor: config.anchor,
      resizer: fr::Resizer::new(),
      resized: Vec::with_capacity(canvas_len),
      canvas: vec![config.pad_value; canvas_len],
    }
  }

  pub fn target_size(&self) -> (u32, u32) {
    (self.target_width, self.target_height)
  }

  /// 交错排列的 HWC 画布，通道顺序与源帧一致
  pub fn canvas(&self) -> &[u8] {
    &self.canvas
  }

  pub fn process(&mut self, frame: &Frame) -> Result<LetterboxInfo, EngineError> {
    if frame.width() == 0 || frame.height() == 0 {
      return Err(EngineError::InvalidImage {
        width: frame.width(),
        height: frame.height(),
      });
    }
    if !frame.is_packed() {
      return Err(EngineError::Preprocess(format!(
        "不支持带行填充的帧: stride={}, width={}",
        frame.stride(),
        frame.width()
      )));
    }

    match self.kind {
      ModelKind::Detect => self.letterbox(frame),
      ModelKind::Classify => self.center_crop(frame),
    }
  }

  fn letterbox(&mut self, frame: &Frame) -> Result<LetterboxInfo, EngineError> {
    let (src_w, src_h) = (frame.width(), frame.height());
    let (dst_w, dst_h) = (self.target_width, self.target_height);

    let ratio = (dst_w as f32 / src_w as f32).min(dst_h as f32 / src_h as f32);
    let resized_w = ((src_w as f32 * ratio) as u32).clamp(1, dst_w);
    let resized_h = ((src_h as f32 * ratio) as u32).clamp(1, dst_h);
    let (pad_x, pad_y) = match self.anchor {
      LetterboxAnchor::TopLeft => (0, 0),
      LetterboxAnchor::Center => ((dst_w - resized_w) / 2, (dst_h - resized_h) / 2),
    };

    let src = fr::images::ImageRef::new(src_w, src_h, frame.data(), fr::PixelType::U8x3)
      .map_err(|e| EngineError::Preprocess(e.to_string()))?;

    let mut buffer = std::mem::take(&mut self.resized);
    buffer.resize(resized_w as usize * resized_h as usize * RGB_CHANNELS, 0);
    let mut dst = fr::images::Image::from_vec_u8(resized_w, resized_h, buffer, fr::PixelType::U8x3)
      .map_err(|e| EngineError::Preprocess(e.to_string()))?;

    let options =
      fr::ResizeOptions::new().resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));
    self
      .resizer
      .resize(&src, &mut dst, Some(&options))
      .map_err(|e| EngineError::Preprocess(e.to_string()))?;
    self.resized = dst.into_vec();

    // 填充背景后逐行拷入画布
    self.canvas.fill(self.pad_value);
    let row_len = resized_w as usize * RGB_CHANNELS;
    let canvas_row = dst_w as usize * RGB_CHANNELS;
    for (y, row) in self.resized.chunks_exact(row_len).enumerate() {
      let offset = (pad_y as usize + y) * canvas_row + pad_x as usize * RGB_CHANNELS;
      self.canvas[offset..offset + row_len].copy_from_slice(row);
    }

    debug!(
      "letterbox: {}x{} -> {}x{} (画布 {}x{}, 偏移 {},{})",
      src_w, src_h, resized_w, resized_h, dst_w, dst_h, pad_x, pad_y
    );

    Ok(LetterboxInfo {
      scale: 1.0 / ratio,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
      source_width: src_w,
      source_height: src_h,
    })
  }

  fn center_crop(&mut self, frame: &Frame) -> Result<LetterboxInfo, EngineError> {
    let (src_w, src_h) = (frame.width(), frame.height());
    let side = src_w.min(src_h);
    let left = (src_w - side) / 2;
    let top = (src_h - side) / 2;

    let src = fr::images::ImageRef::new(src_w, src_h, frame.data(), fr::PixelType::U8x3)
      .map_err(|e| EngineError::Preprocess(e.to_string()))?;

    let canvas = std::mem::take(&mut self.canvas);
    let mut dst = fr::images::Image::from_vec_u8(
      self.target_width,
      self.target_height,
      canvas,
      fr::PixelType::U8x3,
    )
    .map_err(|e| EngineError::Preprocess(e.to_string()))?;

    let options = fr::ResizeOptions::new()
      .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear))
      .crop(left as f64, top as f64, side as f64, side as f64);
    let result = self.resizer.resize(&src, &mut dst, Some(&options));
    self.canvas = dst.into_vec();
    result.map_err(|e| EngineError::Preprocess(e.to_string()))?;

    let scale = side as f32 / self.target_width as f32;
    Ok(LetterboxInfo {
      scale,
      pad_x: -(left as f32) / scale,
      pad_y: -(top as f32) / scale,
      source_width: src_w,
      source_height: src_h,
    })
  }
}

/// 交错 HWC 字节 -> 平面 CHW 浮点，归一化到 [0, 1]。
/// `swap_red_blue` 为真时源数据是 BGR，输出总是 RGB 平面顺序。
pub fn fill_planar_tensor(
  canvas: &[u8],
  width: usize,
  height: usize,
  swap_red_blue: bool,
  dst: &mut [f32],
) {
  let plane = width * height;
  let (r_plane, rest) = dst[..plane * RGB_CHANNELS].split_at_mut(plane);
  let (g_plane, b_plane) = rest.split_at_mut(plane);

  for (idx, px) in canvas.chunks_exact(RGB_CHANNELS).take(plane).enumerate() {
    let (r, g, b) = if swap_red_blue {
      (px[2], px[1], px[0])
    } else {
      (px[0], px[1], px[2])
    };
    r_plane[idx] = r as f32 / 255.0;
    g_plane[idx] = g as f32 / 255.0;
    b_plane[idx] = b as f32 / 255.0;
  }
}

/// 常驻的输入张量缓冲，配置确定后只分配一次
pub struct TensorBuffer {
  precision: Precision,
  width: usize,
  height: usize,
  full: Vec<f32>,
  half: Vec<f16>,
}

impl TensorBuffer {
  pub fn new(precision: Precision, width: u32, height: u32) -> Self {
    let len = RGB_CHANNELS * width as usize * height as usize;
    let half = match precision {
      Precision::Fp16 => vec![f16::ZERO; len],
      Precision::Fp32 => Vec::new(),
    };
    Self {
      precision,
      width: width as usize,
      height: height as usize,
      full: vec![0.0; len],
      half,
    }
  }

  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height, self.width]
  }

  pub fn fill(&mut self, canvas: &[u8], swap_red_blue: bool) {
    fill_planar_tensor(canvas, self.width, self.height, swap_red_blue, &mut self.full);
    if self.precision == Precision::Fp16 {
      self.half.convert_from_f32_slice(&self.full);
    }
  }

  pub fn as_f32(&self) -> &[f32] {
    &self.full
  }

  pub fn view(&self) -> InputTensor<'_> {
    match self.precision {
      Precision::Fp32 => InputTensor::F32 {
        shape: self.shape(),
        data: &self.full,
      },
      Precision::Fp16 => InputTensor::F16 {
        shape: self.shape(),
        data: &self.half,
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::frame::PixelFormat;

  /// 灰色背景上画一个纯红色矩形
  fn frame_with_box(width: u32, height: u32, bbox: (u32, u32, u32, u32)) -> Frame {
    let mut frame = Frame::new(width, height, PixelFormat::Rgb8);
    let stride = frame.stride();
    let data = frame.data_mut();
    for y in 0..height {
      for x in 0..width {
        let inside = x >= bbox.0 && x < bbox.0 + bbox.2 && y >= bbox.1 && y < bbox.1 + bbox.3;
        let px = if inside { [255, 0, 0] } else { [90, 90, 90] };
        let offset = y as usize * stride + x as usize * 3;
        data[offset..offset + 3].copy_from_slice(&px);
      }
    }
    frame
  }

  /// 在画布上找出红色像素的外接框（模型空间，左上角格式）
  fn red_extent(canvas: &[u8], width: usize) -> BoundingBox {
    let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0, 0);
    for (idx, px) in canvas.chunks_exact(3).enumerate() {
      if px[0] > 200 && px[1] < 60 && px[2] < 60 {
        let (x, y) = (idx % width, idx / width);
        x1 = x1.min(x);
        y1 = y1.min(y);
        x2 = x2.max(x + 1);
        y2 = y2.max(y + 1);
      }
    }
    BoundingBox::new(x1 as f32, y1 as f32, (x2 - x1) as f32, (y2 - y1) as f32)
  }

  fn assert_reversible(anchor: LetterboxAnchor) {
    let config = ModelConfig::new("unused.onnx").with_anchor(anchor);
    let mut pre = Preprocessor::new(&config);
    let frame = frame_with_box(640, 480, (200, 120, 160, 100));
    let info = pre.process(&frame).unwrap();

    let model_box = red_extent(pre.canvas(), 640);
    let back = info.to_source(
      model_box.x + model_box.width / 2.0,
      model_box.y + model_box.height / 2.0,
      model_box.width,
      model_box.height,
    );
    assert!((back.x - 200.0).abs() <= 1.0, "x = {}", back.x);
    assert!((back.y - 120.0).abs() <= 1.0, "y = {}", back.y);
    assert!((back.right() - 360.0).abs() <= 1.0, "right = {}", back.right());
    assert!((back.bottom() - 220.0).abs() <= 1.0, "bottom = {}", back.bottom());
  }

  #[test]
  fn letterbox_top_left_is_reversible() {
    assert_reversible(LetterboxAnchor::TopLeft);
  }

  #[test]
  fn letterbox_center_is_reversible() {
    assert_reversible(LetterboxAnchor::Center);
  }

  #[test]
  fn letterbox_pads_with_constant() {
    let mut config = ModelConfig::new("unused.onnx").with_anchor(LetterboxAnchor::Center);
    config.pad_value = 114;
    let mut pre = Preprocessor::new(&config);
    let frame = frame_with_box(640, 320, (0, 0, 1, 1));
    let info = pre.process(&frame).unwrap();
    assert_eq!(info.scale, 1.0);
    assert_eq!(info.pad_y, 160.0);
    assert_eq!(&pre.canvas()[..3], &[114, 114, 114]);
    let last = pre.canvas().len() - 3;
    assert_eq!(&pre.canvas()[last..], &[114, 114, 114]);
  }

  #[test]
  fn rejects_empty_frame() {
    let config = ModelConfig::new("unused.onnx");
    let mut pre = Preprocessor::new(&config);
    let frame = Frame::new(0, 480, PixelFormat::Rgb8);
    assert!(matches!(
      pre.process(&frame),
      Err(EngineError::InvalidImage { width: 0, .. })
    ));
  }

  #[test]
  fn center_crop_maps_back_to_source() {
    let config = ModelConfig::new("unused.onnx")
      .with_kind(ModelKind::Classify)
      .with_input_size(224, 224);
    let mut pre = Preprocessor::new(&config);
    let frame = frame_with_box(640, 480, (0, 0, 1, 1));
    let info = pre.process(&frame).unwrap();
    let full = info.to_source(112.0, 112.0, 224.0, 224.0);
    assert!((full.x - 80.0).abs() < 1e-3);
    assert!(full.y.abs() < 1e-3);
    assert!((full.width - 480.0).abs() < 1e-3);
  }

  #[test]
  fn planar_tensor_swaps_bgr_and_normalizes() {
    let canvas = [10u8, 20, 30, 40, 50, 60];
    let mut dst = [0f32; 6];
    fill_planar_tensor(&canvas, 2, 1, true, &mut dst);
    assert_eq!(dst, [30.0 / 255.0, 60.0 / 255.0, 20.0 / 255.0, 50.0 / 255.0, 10.0 / 255.0, 40.0 / 255.0]);

    fill_planar_tensor(&canvas, 2, 1, false, &mut dst);
    assert_eq!(dst[0], 10.0 / 255.0);
    assert_eq!(dst[4], 30.0 / 255.0);
  }

  #[test]
  fn half_tensor_tracks_full_tensor() {
    let mut tensor = TensorBuffer::new(Precision::Fp16, 2, 1);
    tensor.fill(&[255, 0, 0, 0, 255, 0], false);
    match tensor.view() {
      InputTensor::F16 { shape, data } => {
        assert_eq!(shape, [1, 3, 1, 2]);
        assert_eq!(data[0].to_f32(), 1.0);
        assert_eq!(data[3].to_f32(), 1.0);
      }
      InputTensor::F32 { .. } => panic!("expected f16 tensor"),
    }
  }
}
