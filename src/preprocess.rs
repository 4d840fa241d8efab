// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/preprocess.rs - 图像到 NCHW 批量张量的预处理
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

use image::{Rgb, RgbImage, imageops};
use thiserror::Error;
use tracing::debug;

use crate::{
  config::PreprocessorConfig,
  frame::{BatchTensor, ImageBuffer, RGB_CHANNELS},
};

/// 填充区域使用的中性灰
pub const PAD_COLOR: [u8; 3] = [128, 128, 128];

#[derive(Error, Debug)]
pub enum PreprocessError {
  #[error("输入批次为空")]
  EmptyBatch,
  #[error("图像尺寸无效: {width}x{height}")]
  InvalidImage { width: u32, height: u32 },
  #[error("配置无效: {0}")]
  InvalidConfig(#[from] crate::config::ConfigError),
}

/// 保持宽高比缩放到目标尺寸内，居中放置，剩余区域以灰色填充
pub fn fit_contain(
  image: &ImageBuffer,
  target_w: u32,
  target_h: u32,
) -> Result<RgbImage, PreprocessError> {
  let (orig_w, orig_h) = (image.width(), image.height());
  if orig_w == 0 || orig_h == 0 {
    return Err(PreprocessError::InvalidImage {
      width: orig_w,
      height: orig_h,
    });
  }

  // 去掉 alpha 通道
  let rgb = image.as_dynamic().to_rgb8();

  let scale = f64::min(
    target_w as f64 / orig_w as f64,
    target_h as f64 / orig_h as f64,
  );
  let new_w = ((orig_w as f64 * scale).round() as u32).clamp(1, target_w);
  let new_h = ((orig_h as f64 * scale).round() as u32).clamp(1, target_h);

  let resized = if (new_w, new_h) == (orig_w, orig_h) {
    rgb
  } else {
    imageops::resize(&rgb, new_w, new_h, imageops::FilterType::Triangle)
  };

  if (new_w, new_h) == (target_w, target_h) {
    return Ok(resized);
  }

  let mut canvas = RgbImage::from_pixel(target_w, target_h, Rgb(PAD_COLOR));
  let offset_x = (target_w - new_w) / 2;
  let offset_y = (target_h - new_h) / 2;
  imageops::replace(&mut canvas, &resized, offset_x as i64, offset_y as i64);

  Ok(canvas)
}

/// 将一批图像转换为 `[N, 3, H, W]` 的浮点张量
///
/// 仅在 `do_rescale` 时乘以 `rescale_factor`，不做均值方差归一化。
pub fn preprocess(
  images: &[ImageBuffer],
  config: &PreprocessorConfig,
) -> Result<BatchTensor, PreprocessError> {
  if images.is_empty() {
    return Err(PreprocessError::EmptyBatch);
  }
  config.validate()?;

  let model_w = config.width() as usize;
  let model_h = config.height() as usize;
  let plane = model_w * model_h;
  let scale = if config.do_rescale {
    config.rescale_factor
  } else {
    1.0
  };

  let mut tensor = BatchTensor::zeros(images.len(), model_h, model_w);

  for (i, image) in images.iter().enumerate() {
    let fitted = fit_contain(image, config.width(), config.height())?;
    let hwc = fitted.as_raw();
    let chw = tensor.image_mut(i);

    // HWC -> CHW
    for h in 0..model_h {
      for w in 0..model_w {
        let pixel = h * model_w + w;
        for c in 0..RGB_CHANNELS {
          chw[c * plane + pixel] = hwc[pixel * RGB_CHANNELS + c] as f32 * scale;
        }
      }
    }
  }

  debug!("预处理完成, 张量形状: {:?}", tensor.shape());
  Ok(tensor)
}
