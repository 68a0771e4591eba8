// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/frame.rs - 帧定义与帧缓冲池
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

use std::sync::Arc;

use chrono::{DateTime, Utc};
use image::RgbImage;
use tracing::{debug, warn};

pub const DEFAULT_POOL_SIZE: usize = 3;
pub const MIN_POOL_SIZE: usize = 2;

/// 像素排列格式（交错存储，每像素 3 字节）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
  Rgb8,
  Bgr8,
}

impl PixelFormat {
  pub fn channels(&self) -> usize {
    3
  }

  /// 与模型约定的 RGB 通道顺序相比是否需要交换 R/B
  pub fn swaps_red_blue(&self) -> bool {
    matches!(self, PixelFormat::Bgr8)
  }
}

/// 一帧图像：二维交错像素缓冲以及所属的池槽位信息
#[derive(Debug, Clone)]
pub struct Frame {
  data: Vec<u8>,
  width: u32,
  height: u32,
  stride: usize,
  format: PixelFormat,
  /// 所属帧池槽位
  slot: usize,
  /// 该槽位被写入的次数
  generation: u64,
  /// 全局采集序号
  sequence: u64,
  captured_at: DateTime<Utc>,
}

pub type SharedFrame = Arc<Frame>;

impl Frame {
  pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
    let stride = width as usize * format.channels();
    Self {
      data: vec![0u8; stride * height as usize],
      width,
      height,
      stride,
      format,
      slot: 0,
      generation: 0,
      sequence: 0,
      captured_at: Utc::now(),
    }
  }

  /// 由已有的紧密排列缓冲构造，长度不匹配时返回 `None`
  pub fn from_raw(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Option<Self> {
    let stride = width as usize * format.channels();
    if data.len() != stride * height as usize {
      return None;
    }
    Some(Self {
      data,
      width,
      height,
      stride,
      format,
      slot: 0,
      generation: 0,
      sequence: 0,
      captured_at: Utc::now(),
    })
  }

  /// 调整帧尺寸。尺寸不变时不会重新分配内存。
  pub fn reshape(&mut self, width: u32, height: u32, format: PixelFormat) {
    if self.width == width && self.height == height && self.format == format {
      return;
    }
    debug!(
      "槽位 {} 尺寸变化: {}x{} -> {}x{}",
      self.slot, self.width, self.height, width, height
    );
    self.width = width;
    self.height = height;
    self.format = format;
    self.stride = width as usize * format.channels();
    self.data.resize(self.stride * height as usize, 0);
  }

  pub fn width(&self) -> u32 {
    self.width
  }

  pub fn height(&self) -> u32 {
    self.height
  }

  pub fn stride(&self) -> usize {
    self.stride
  }

  pub fn format(&self) -> PixelFormat {
    self.format
  }

  pub fn slot(&self) -> usize {
    self.slot
  }

  pub fn generation(&self) -> u64 {
    self.generation
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn captured_at(&self) -> DateTime<Utc> {
    self.captured_at
  }

  pub fn data(&self) -> &[u8] {
    &self.data
  }

  pub fn data_mut(&mut self) -> &mut [u8] {
    &mut self.data
  }

  pub fn row(&self, y: u32) -> &[u8] {
    let start = y as usize * self.stride;
    &self.data[start..start + self.width as usize * self.format.channels()]
  }

  /// 行内像素是否紧密排列（无行尾填充）
  pub fn is_packed(&self) -> bool {
    self.stride == self.width as usize * self.format.channels()
  }

  fn stamp(&mut self, sequence: u64) {
    self.generation += 1;
    self.sequence = sequence;
    self.captured_at = Utc::now();
  }
}

impl From<RgbImage> for Frame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    let stride = width as usize * 3;
    Self {
      data: image.into_raw(),
      width,
      height,
      stride,
      format: PixelFormat::Rgb8,
      slot: 0,
      generation: 0,
      sequence: 0,
      captured_at: Utc::now(),
    }
  }
}

/// 固定数量的可复用帧缓冲
///
/// 采集线程按轮转顺序写入下一个槽位，写完后以 `Arc` 共享给下游，不做深拷贝。
/// 池本身不检查槽位是否仍被下游持有：在 N 个槽位、采集周期 T 的前提下，
/// 槽位在 N×T 之后才会被复用，而推理侧同一时间最多只有一帧在处理。
/// 若该前提被打破，槽位会在写入前被复制一份（写时复制），采集不会阻塞。
pub struct FramePool {
  slots: Vec<SharedFrame>,
  cursor: usize,
  sequence: u64,
  copy_on_write: u64,
}

impl FramePool {
  pub fn new(size: usize, width: u32, height: u32, format: PixelFormat) -> Self {
    let size = size.max(MIN_POOL_SIZE);
    let slots = (0..size)
      .map(|slot| {
        let mut frame = Frame::new(width, height, format);
        frame.slot = slot;
        Arc::new(frame)
      })
      .collect();
    Self {
      slots,
      cursor: 0,
      sequence: 0,
      copy_on_write: 0,
    }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// 下一个将被写入的槽位
  pub fn cursor(&self) -> usize {
    self.cursor
  }

  /// 槽位被下游占用而不得不复制的次数
  pub fn copy_on_write_count(&self) -> u64 {
    self.copy_on_write
  }

  /// 取得下一个槽位的可写引用。多次调用（例如读帧失败后重试）返回同一个槽位。
  pub fn acquire_next_slot(&mut self) -> &mut Frame {
    let index = self.cursor;
    let slot = &mut self.slots[index];
    if Arc::strong_count(slot) > 1 {
      self.copy_on_write += 1;
      warn!("槽位 {} 仍被下游持有，写入前复制该槽位", index);
    }
    Arc::make_mut(slot)
  }

  /// 发布刚写好的槽位并前进到下一个槽位
  pub fn publish(&mut self) -> SharedFrame {
    let index = self.cursor;
    self.sequence += 1;
    if let Some(frame) = Arc::get_mut(&mut self.slots[index]) {
      frame.stamp(self.sequence);
    }
    self.cursor = (index + 1) % self.slots.len();
    Arc::clone(&self.slots[index])
  }

  /// 只读查看槽位内容
  pub fn slot(&self, index: usize) -> Option<&Frame> {
    self.slots.get(index).map(|frame| frame.as_ref())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn write_value(pool: &mut FramePool, value: u8) -> SharedFrame {
    let frame = pool.acquire_next_slot();
    frame.data_mut().fill(value);
    pool.publish()
  }

  #[test]
  fn slot_zero_changes_only_after_full_cycle() {
    let mut pool = FramePool::new(3, 4, 2, PixelFormat::Rgb8);

    drop(write_value(&mut pool, 1));
    assert_eq!(pool.slot(0).unwrap().data()[0], 1);

    for value in 2..=3 {
      drop(write_value(&mut pool, value));
      assert_eq!(pool.slot(0).unwrap().data()[0], 1);
    }

    drop(write_value(&mut pool, 4));
    assert_eq!(pool.slot(0).unwrap().data()[0], 4);
    assert_eq!(pool.slot(0).unwrap().generation(), 2);
    assert_eq!(pool.copy_on_write_count(), 0);
  }

  #[test]
  fn published_frame_shares_slot_storage() {
    let mut pool = FramePool::new(3, 4, 2, PixelFormat::Rgb8);
    let shared = write_value(&mut pool, 7);
    let slot = pool.slot(0).unwrap();
    assert!(std::ptr::eq(shared.data().as_ptr(), slot.data().as_ptr()));
    assert_eq!(shared.slot(), 0);
    assert_eq!(shared.sequence(), 1);
  }

  #[test]
  fn retained_slot_is_copied_instead_of_overwritten() {
    let mut pool = FramePool::new(2, 4, 2, PixelFormat::Rgb8);
    let held = write_value(&mut pool, 1);
    drop(write_value(&mut pool, 2));
    drop(write_value(&mut pool, 3));

    assert_eq!(held.data()[0], 1);
    assert_eq!(pool.slot(0).unwrap().data()[0], 3);
    assert_eq!(pool.copy_on_write_count(), 1);
  }

  #[test]
  fn pool_size_has_a_floor() {
    let pool = FramePool::new(1, 4, 2, PixelFormat::Rgb8);
    assert_eq!(pool.len(), MIN_POOL_SIZE);
  }

  #[test]
  fn reshape_keeps_packed_stride() {
    let mut frame = Frame::new(4, 2, PixelFormat::Rgb8);
    frame.reshape(8, 3, PixelFormat::Bgr8);
    assert_eq!(frame.stride(), 24);
    assert_eq!(frame.data().len(), 72);
    assert!(frame.is_packed());
    assert!(frame.format().swaps_red_blue());
  }
}
