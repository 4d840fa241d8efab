// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream.rs - 视频流管理
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

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::error;
use url::Url;

pub mod protocol;
pub mod source;
pub mod supervisor;

#[cfg(feature = "read_image_file")]
mod image_source;
#[cfg(feature = "read_image_file")]
pub use self::image_source::{ImageFileSource, ImageFileSourceError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer_source;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer_source::{GStreamerSource, GStreamerSourceError};

pub use self::protocol::{
  EncodedMessage, ProtocolError, StreamEvent, SupervisorCommand, WorkerMessage, spawn_encoder,
  write_framed,
};
pub use self::source::{FrameEmitter, RawFrame, StreamSource, StreamSpec};
pub use self::supervisor::{
  ExitReason, StreamExit, StreamHandle, StreamPhase, StreamState, StreamSupervisor,
  SupervisorConfig,
};

#[derive(Error, Debug)]
pub enum SourceError {
  #[cfg(feature = "read_image_file")]
  #[error("图像来源错误: {0}")]
  ImageFile(#[from] ImageFileSourceError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer 来源错误: {0}")]
  GStreamer(#[from] GStreamerSourceError),
  #[error("无效的流地址: {0}")]
  InvalidUrl(#[from] url::ParseError),
  #[error("不支持的流地址: {0}")]
  Unsupported(String),
}

/// 单次尝试结束的原因；除 `Cancelled` 外都会触发重试
#[derive(Error, Debug)]
pub enum StreamTaskError {
  #[error("来源错误: {0}")]
  Source(#[from] SourceError),
  #[error("流意外结束")]
  Ended,
  #[error("事件通道已关闭")]
  Channel,
  #[error("流已被取消")]
  Cancelled,
}

#[cfg(feature = "read_image_file")]
impl From<ImageFileSourceError> for StreamTaskError {
  fn from(err: ImageFileSourceError) -> Self {
    StreamTaskError::Source(err.into())
  }
}

#[cfg(feature = "gstreamer_input")]
impl From<GStreamerSourceError> for StreamTaskError {
  fn from(err: GStreamerSourceError) -> Self {
    StreamTaskError::Source(err.into())
  }
}

/// 按 URL 方案选择具体来源，每次尝试重新解析
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceRouter;

#[async_trait]
impl StreamSource for SourceRouter {
  async fn run(
    &self,
    stream: &StreamSpec,
    emitter: &FrameEmitter,
    cancel: &CancellationToken,
  ) -> Result<(), StreamTaskError> {
    let url = Url::parse(&stream.uri).map_err(SourceError::from)?;

    #[cfg(feature = "read_image_file")]
    {
      use crate::{FromUrl, FromUrlWithScheme};

      if url.scheme() == ImageFileSource::SCHEME {
        let source = ImageFileSource::from_url(&url)?;
        return source.run(emitter, cancel).await;
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      use crate::FromUrl;

      if GStreamerSource::accepts(&url) {
        let source = GStreamerSource::from_url(&url)?;
        return source.run(emitter, cancel).await;
      }
    }

    let _ = (emitter, cancel);
    error!("流 {} 的地址没有可用的来源: {}", stream.id, stream.uri);
    Err(SourceError::Unsupported(url.scheme().to_string()).into())
  }
}
