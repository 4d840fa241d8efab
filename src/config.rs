// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/config.rs - 模型配置文件定义
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

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("读取配置文件 {path} 失败: {source}")]
  Io {
    path: String,
    source: std::io::Error,
  },
  #[error("解析配置文件 {path} 失败: {source}")]
  Parse {
    path: String,
    source: serde_json::Error,
  },
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// `config.json`，只关心类别映射
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
  pub id2label: HashMap<u32, String>,
}

impl ModelConfig {
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let config: Self = read_json(path.as_ref())?;
    debug!("类别数量: {}", config.id2label.len());
    Ok(config)
  }

  pub fn label(&self, class_id: u32) -> Option<&str> {
    self.id2label.get(&class_id).map(String::as_str)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
  pub width: u32,
  pub height: u32,
}

/// `preprocessor_config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessorConfig {
  pub size: ImageSize,
  #[serde(default)]
  pub do_rescale: bool,
  #[serde(default = "default_rescale_factor")]
  pub rescale_factor: f32,
}

fn default_rescale_factor() -> f32 {
  1.0 / 255.0
}

impl PreprocessorConfig {
  pub fn new(width: u32, height: u32) -> Self {
    Self {
      size: ImageSize { width, height },
      do_rescale: false,
      rescale_factor: default_rescale_factor(),
    }
  }

  pub fn with_rescale(mut self, rescale_factor: f32) -> Self {
    self.do_rescale = true;
    self.rescale_factor = rescale_factor;
    self
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let config: Self = read_json(path.as_ref())?;
    config.validate()?;
    debug!(
      "模型输入尺寸: {}x{}, 缩放: {} ({})",
      config.size.width, config.size.height, config.do_rescale, config.rescale_factor
    );
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.size.width == 0 || self.size.height == 0 {
      return Err(ConfigError::Invalid(format!(
        "模型输入尺寸必须为正数, 实际为 {}x{}",
        self.size.width, self.size.height
      )));
    }
    Ok(())
  }

  pub fn width(&self) -> u32 {
    self.size.width
  }

  pub fn height(&self) -> u32 {
    self.size.height
  }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
  let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
    path: path.display().to_string(),
    source,
  })?;
  serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
    path: path.display().to_string(),
    source,
  })
}
