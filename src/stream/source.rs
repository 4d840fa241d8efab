// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream/source.rs - 流来源接口与事件发送
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
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
  frame::ImageBuffer,
  model::{ObjectDetectionModel, detect_objects},
  stream::{
    StreamTaskError,
    protocol::{StreamEvent, WorkerMessage},
  },
};

/// 一路流的标识与地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
  pub id: String,
  pub uri: String,
}

/// 解码后的一帧，RGB 交错排列
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
  pub width: u32,
  pub height: u32,
  pub data: Vec<u8>,
}

impl From<RgbImage> for RawFrame {
  fn from(image: RgbImage) -> Self {
    let (width, height) = image.dimensions();
    Self {
      width,
      height,
      data: image.into_raw(),
    }
  }
}

/// 媒体来源
///
/// 一次 `run` 即一次尝试：持续产生帧直到出错或被取消。
/// 被取消时返回 `Ok(())` 或 `StreamTaskError::Cancelled`。
#[async_trait]
pub trait StreamSource: Send + Sync {
  async fn run(
    &self,
    stream: &StreamSpec,
    emitter: &FrameEmitter,
    cancel: &CancellationToken,
  ) -> Result<(), StreamTaskError>;
}

/// 为事件加上流标识并发往上游，按需对帧做检测
///
/// 上游停止读取时发送会阻塞，取消令牌可以打断阻塞的发送。
pub struct FrameEmitter {
  stream_id: String,
  events: mpsc::Sender<WorkerMessage>,
  detector: Option<Arc<ObjectDetectionModel>>,
  detect_every: u64,
  next_index: AtomicU64,
  cancel: CancellationToken,
}

impl FrameEmitter {
  pub fn new(
    stream_id: impl Into<String>,
    events: mpsc::Sender<WorkerMessage>,
    detector: Option<Arc<ObjectDetectionModel>>,
    detect_every: u64,
  ) -> Self {
    Self {
      stream_id: stream_id.into(),
      events,
      detector,
      detect_every: detect_every.max(1),
      next_index: AtomicU64::new(0),
      cancel: CancellationToken::new(),
    }
  }

  pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn stream_id(&self) -> &str {
    &self.stream_id
  }

  pub async fn emit(&self, event: StreamEvent) -> Result<(), StreamTaskError> {
    let message = WorkerMessage {
      stream_id: self.stream_id.clone(),
      event,
    };
    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(StreamTaskError::Cancelled),
      sent = self.events.send(message) => sent.map_err(|_| StreamTaskError::Channel),
    }
  }

  /// 发送一帧；若需要检测，检测结果紧随该帧之后发送
  pub async fn emit_frame(&self, frame: RawFrame) -> Result<(), StreamTaskError> {
    let index = self.next_index.fetch_add(1, Ordering::Relaxed);

    let pending = match &self.detector {
      Some(detector) if index % self.detect_every == 0 => {
        match ImageBuffer::from_rgb(frame.width, frame.height, frame.data.clone()) {
          Ok(image) => Some((detector.clone(), image)),
          Err(e) => {
            warn!("流 {} 第 {} 帧无法转换为图像: {}", self.stream_id, index, e);
            None
          }
        }
      }
      _ => None,
    };

    self
      .emit(StreamEvent::Frame {
        index,
        timestamp_ms: chrono::Utc::now().timestamp_millis(),
        width: frame.width,
        height: frame.height,
        data: frame.data,
      })
      .await?;

    let Some((detector, image)) = pending else {
      return Ok(());
    };

    let detected = tokio::select! {
      biased;
      _ = self.cancel.cancelled() => return Err(StreamTaskError::Cancelled),
      detected = detect_objects(detector, vec![image]) => detected,
    };
    match detected {
      Ok(mut batch) => {
        let detections = batch.pop().unwrap_or_default();
        debug!(
          "流 {} 第 {} 帧检测到 {} 个目标",
          self.stream_id,
          index,
          detections.len()
        );
        self
          .emit(StreamEvent::Detections {
            frame_index: index,
            detections,
          })
          .await
      }
      Err(e) => {
        warn!("流 {} 第 {} 帧检测失败, 跳过: {}", self.stream_id, index, e);
        Ok(())
      }
    }
  }
}
