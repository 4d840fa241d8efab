// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/frame.rs - 图像缓冲与 NCHW 批量张量定义
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

use std::path::Path;

use image::{DynamicImage, ImageReader, RgbImage};
use thiserror::Error;

pub const RGB_CHANNELS: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  LengthMismatch { expected: usize, actual: usize },
}

/// 已解码的输入图像
///
/// 任意分辨率、任意颜色类型，预处理时统一转换为 3 通道 RGB。
#[derive(Debug, Clone)]
pub struct ImageBuffer {
  image: DynamicImage,
}

impl ImageBuffer {
  /// 从编码后的字节（PNG、JPEG 等）解码
  pub fn from_encoded(bytes: &[u8]) -> Result<Self, FrameError> {
    let image = image::load_from_memory(bytes)?;
    Ok(Self { image })
  }

  pub fn open(path: impl AsRef<Path>) -> Result<Self, FrameError> {
    let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
    Ok(Self { image })
  }

  /// 从交错排列的 RGB 字节构建
  pub fn from_rgb(width: u32, height: u32, data: Vec<u8>) -> Result<Self, FrameError> {
    let expected = RGB_CHANNELS * width as usize * height as usize;
    if data.len() != expected {
      return Err(FrameError::LengthMismatch {
        expected,
        actual: data.len(),
      });
    }
    let image = RgbImage::from_raw(width, height, data).ok_or(FrameError::LengthMismatch {
      expected,
      actual: 0,
    })?;
    Ok(Self {
      image: DynamicImage::ImageRgb8(image),
    })
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn as_dynamic(&self) -> &DynamicImage {
    &self.image
  }
}

impl From<DynamicImage> for ImageBuffer {
  fn from(image: DynamicImage) -> Self {
    Self { image }
  }
}

impl From<RgbImage> for ImageBuffer {
  fn from(image: RgbImage) -> Self {
    Self {
      image: DynamicImage::ImageRgb8(image),
    }
  }
}

/// NCHW 格式的批量浮点张量，形状为 `[batch, 3, height, width]`
#[derive(Debug, Clone)]
pub struct BatchTensor {
  shape: [usize; 4],
  data: Box<[f32]>,
}

impl BatchTensor {
  pub fn zeros(batch: usize, height: usize, width: usize) -> Self {
    let shape = [batch, RGB_CHANNELS, height, width];
    let data = vec![0f32; shape.iter().product()].into_boxed_slice();
    Self { shape, data }
  }

  pub fn shape(&self) -> [usize; 4] {
    self.shape
  }

  pub fn batch(&self) -> usize {
    self.shape[0]
  }

  pub fn channels(&self) -> usize {
    self.shape[1]
  }

  pub fn height(&self) -> usize {
    self.shape[2]
  }

  pub fn width(&self) -> usize {
    self.shape[3]
  }

  /// 单张图像占用的元素数量
  pub fn image_len(&self) -> usize {
    self.shape[1] * self.shape[2] * self.shape[3]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  /// 第 `index` 张图像的可写切片
  pub fn image_mut(&mut self, index: usize) -> &mut [f32] {
    let len = self.image_len();
    &mut self.data[index * len..(index + 1) * len]
  }
}

impl AsRef<[f32]> for BatchTensor {
  fn as_ref(&self) -> &[f32] {
    &self.data
  }
}

/// 推理引擎返回的单个输出张量
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
  pub dims: Vec<usize>,
  pub data: Vec<f32>,
}

impl Tensor {
  pub fn new(dims: Vec<usize>, data: Vec<f32>) -> Self {
    Self { dims, data }
  }

  pub fn element_count(&self) -> usize {
    self.dims.iter().product()
  }
}
