// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/save_image_file.rs - 保存标注后的图像
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

use thiserror::Error;
use tracing::info;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  output::{NamedImage, Render, draw::Draw},
  postprocess::DetectionResult,
  preprocess::{PreprocessError, fit_contain},
};

#[derive(Error, Debug)]
pub enum SaveImageFileError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("图像缩放错误: {0}")]
  ResizeError(#[from] PreprocessError),
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("未设置模型输入尺寸")]
  MissingModelSize,
}

/// `image:///path/to/output/dir`
///
/// 检测框位于模型输入坐标系，因此先按预处理相同的方式缩放图像再绘制。
pub struct SaveImageFileOutput {
  directory: PathBuf,
  model_size: Option<(u32, u32)>,
  draw: Draw,
}

impl FromUrlWithScheme for SaveImageFileOutput {
  const SCHEME: &'static str = "image";
}

impl FromUrl for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn from_url(uri: &Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(SaveImageFileError::SchemeMismatch(format!(
        "期望保存方式 '{}', 实际保存方式 '{}'",
        Self::SCHEME,
        uri.scheme()
      )));
    }

    Ok(Self::new(uri.path()))
  }
}

impl SaveImageFileOutput {
  pub fn new(directory: impl AsRef<Path>) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      model_size: None,
      draw: Draw::default(),
    }
  }

  pub fn with_model_size(mut self, width: u32, height: u32) -> Self {
    self.model_size = Some((width, height));
    self
  }

  fn output_path(&self, name: &str) -> PathBuf {
    let stem = Path::new(name)
      .file_stem()
      .and_then(|s| s.to_str())
      .unwrap_or("frame");
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
    self.directory.join(format!("{}-{}.png", stem, timestamp))
  }
}

impl Render<NamedImage, Vec<DetectionResult>> for SaveImageFileOutput {
  type Error = SaveImageFileError;

  fn render_result(
    &self,
    frame: &NamedImage,
    result: &Vec<DetectionResult>,
  ) -> Result<(), Self::Error> {
    let (width, height) = self.model_size.ok_or(SaveImageFileError::MissingModelSize)?;
    let mut image = fit_contain(&frame.image, width, height)?;
    self.draw.draw_detections(&mut image, result);

    std::fs::create_dir_all(&self.directory)?;
    let path = self.output_path(&frame.name);
    image.save(&path)?;
    info!("保存标注图像到文件: {}", path.display());

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use image::{Rgb, RgbImage};

  use super::*;

  #[test]
  fn test_saves_annotated_png() {
    let dir = tempfile::tempdir().unwrap();
    let output = SaveImageFileOutput::new(dir.path().join("annotated")).with_model_size(16, 16);
    let frame = NamedImage {
      name: "/data/door.jpg".to_string(),
      image: RgbImage::from_pixel(32, 16, Rgb([200, 200, 200])).into(),
    };
    let detections = vec![DetectionResult {
      label: "person".to_string(),
      score: "0.800".to_string(),
      bbox: ["2", "5", "10", "11"].map(String::from),
    }];
    output.render_result(&frame, &detections).unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path().join("annotated"))
      .unwrap()
      .map(|e| e.unwrap().path())
      .collect();
    assert_eq!(files.len(), 1);
    let name = files[0].file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("door-") && name.ends_with(".png"));

    let saved = image::open(&files[0]).unwrap().to_rgb8();
    assert_eq!(saved.dimensions(), (16, 16));
    assert_eq!(*saved.get_pixel(2, 5), Draw::default().color_for("person"));
  }

  #[test]
  fn test_requires_model_size() {
    let dir = tempfile::tempdir().unwrap();
    let output = SaveImageFileOutput::new(dir.path());
    let frame = NamedImage {
      name: "a.png".to_string(),
      image: RgbImage::new(4, 4).into(),
    };
    assert!(matches!(
      output.render_result(&frame, &Vec::new()),
      Err(SaveImageFileError::MissingModelSize)
    ));
  }
}
