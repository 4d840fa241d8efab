// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/draw.rs - 检测框绘制
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

use image::{Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::postprocess::DetectionResult;

const PALETTE_SIZE: usize = 80;
const BOX_THICKNESS: i32 = 2;

pub struct Draw {
  colors: Vec<Rgb<u8>>,
  thickness: i32,
}

impl Default for Draw {
  fn default() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb(i as f32 / PALETTE_SIZE as f32 * 360.0, 0.8, 0.9))
      .collect();
    Self {
      colors,
      thickness: BOX_THICKNESS,
    }
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = match h {
    h if h < 60.0 => (c, x, 0.0),
    h if h < 120.0 => (x, c, 0.0),
    h if h < 180.0 => (0.0, c, x),
    h if h < 240.0 => (0.0, x, c),
    h if h < 300.0 => (x, 0.0, c),
    _ => (c, 0.0, x),
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

impl Draw {
  /// 同一标签总是同一种颜色
  pub fn color_for(&self, label: &str) -> Rgb<u8> {
    let hash = label
      .bytes()
      .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    self.colors[hash % self.colors.len()]
  }

  /// 坐标为图像像素坐标 `[x1, y1, x2, y2]`，超出部分被裁剪
  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[DetectionResult]) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    for detection in detections {
      let Some([x1, y1, x2, y2]) = detection.pixel_box() else {
        continue;
      };
      let x_min = (x1 as i32).clamp(0, w - 1);
      let y_min = (y1 as i32).clamp(0, h - 1);
      let x_max = (x2 as i32).clamp(0, w - 1);
      let y_max = (y2 as i32).clamp(0, h - 1);
      if x_min >= x_max || y_min >= y_max {
        continue;
      }

      let color = self.color_for(&detection.label);
      for t in 0..self.thickness {
        let width = (x_max - x_min + 1 - 2 * t).max(0) as u32;
        let height = (y_max - y_min + 1 - 2 * t).max(0) as u32;
        if width == 0 || height == 0 {
          break;
        }
        draw_hollow_rect_mut(
          image,
          Rect::at(x_min + t, y_min + t).of_size(width, height),
          color,
        );
      }
    }
  }
}
