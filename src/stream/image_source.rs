// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream/image_source.rs - 静态图像流（快照摄像头）
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

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  frame::{FrameError, ImageBuffer},
  stream::{
    StreamTaskError,
    source::{FrameEmitter, RawFrame},
  },
};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum ImageFileSourceError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("无效的间隔参数: {0}")]
  InvalidInterval(String),
  #[error("读取图像失败: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码失败: {0}")]
  ImageLoadError(#[from] FrameError),
}

/// `image:///path/to/snapshot.jpg?interval_ms=1000`
///
/// 每次尝试重新读取文件，然后按固定间隔重复发送同一帧。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFileSource {
  path: String,
  interval: Duration,
}

impl FromUrlWithScheme for ImageFileSource {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileSource {
  type Error = ImageFileSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileSourceError::SchemeMismatch(url.scheme().to_string()));
    }

    let mut interval = DEFAULT_INTERVAL;
    for (k, v) in url.query_pairs() {
      if k == "interval_ms" {
        let ms: u64 = v
          .parse()
          .ok()
          .filter(|&ms| ms > 0)
          .ok_or_else(|| ImageFileSourceError::InvalidInterval(v.to_string()))?;
        interval = Duration::from_millis(ms);
      }
    }

    Ok(Self {
      path: url.path().to_string(),
      interval,
    })
  }
}

impl ImageFileSource {
  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn interval(&self) -> Duration {
    self.interval
  }

  async fn load(&self) -> Result<RawFrame, ImageFileSourceError> {
    let bytes = tokio::fs::read(&self.path).await?;
    let image = ImageBuffer::from_encoded(&bytes)?;
    Ok(image.as_dynamic().to_rgb8().into())
  }

  pub async fn run(
    &self,
    emitter: &FrameEmitter,
    cancel: &CancellationToken,
  ) -> Result<(), StreamTaskError> {
    let frame = self.load().await?;
    debug!(
      "流 {} 读取图像 {} ({}x{})",
      emitter.stream_id(),
      self.path,
      frame.width,
      frame.height
    );

    loop {
      if cancel.is_cancelled() {
        return Ok(());
      }
      emitter.emit_frame(frame.clone()).await?;
      tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = tokio::time::sleep(self.interval) => {}
      }
    }
  }
}
