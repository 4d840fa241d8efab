// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream/protocol.rs - 与父进程之间的命令与事件协议
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
  io::{AsyncWrite, AsyncWriteExt},
  sync::mpsc,
  task::JoinHandle,
};
use tracing::{debug, error};

use crate::postprocess::DetectionResult;

#[derive(Error, Debug)]
pub enum ProtocolError {
  #[error("命令解析失败: {0}")]
  Command(#[from] serde_json::Error),
  #[error("CBOR 编码失败: {0}")]
  Encode(String),
}

/// 父进程发来的命令，每行一个 JSON 对象
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorCommand {
  StartStream { stream_id: String, uri: String },
  StopStream { stream_id: String },
}

impl SupervisorCommand {
  pub fn parse_line(line: &str) -> Result<Self, ProtocolError> {
    Ok(serde_json::from_str(line.trim())?)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
  /// 一帧 RGB 图像，按行紧密排列
  Frame {
    index: u64,
    timestamp_ms: i64,
    width: u32,
    height: u32,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
  },
  Detections {
    frame_index: u64,
    detections: Vec<DetectionResult>,
  },
}

/// 带流标识的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
  pub stream_id: String,
  pub event: StreamEvent,
}

/// 一条已编码的 CBOR 消息，独占自己的缓冲区
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage(Vec<u8>);

impl EncodedMessage {
  pub fn encode(message: &WorkerMessage) -> Result<Self, ProtocolError> {
    let mut buffer = Vec::new();
    ciborium::into_writer(message, &mut buffer)
      .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(Self(buffer))
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.0
  }

  pub fn into_bytes(self) -> Vec<u8> {
    self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

/// 以 4 字节大端长度为前缀写出一条消息
pub async fn write_framed<W>(writer: &mut W, message: &EncodedMessage) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let len = u32::try_from(message.len())
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "消息过长"))?;
  writer.write_u32(len).await?;
  writer.write_all(message.as_bytes()).await?;
  writer.flush().await
}

/// 启动编码任务：接收事件，输出编码后的消息
///
/// 任一端关闭后任务结束。编码失败的事件被记录并丢弃。
pub fn spawn_encoder(
  mut events: mpsc::Receiver<WorkerMessage>,
  buffer: usize,
) -> (JoinHandle<()>, mpsc::Receiver<EncodedMessage>) {
  let (tx, rx) = mpsc::channel(buffer);
  let handle = tokio::spawn(async move {
    while let Some(message) = events.recv().await {
      match EncodedMessage::encode(&message) {
        Ok(encoded) => {
          debug!("流 {} 的消息编码为 {} 字节", message.stream_id, encoded.len());
          if tx.send(encoded).await.is_err() {
            break;
          }
        }
        Err(e) => error!("流 {} 的消息编码失败: {}", message.stream_id, e),
      }
    }
    debug!("编码任务结束");
  });
  (handle, rx)
}
