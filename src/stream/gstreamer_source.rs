// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream/gstreamer_source.rs - 基于 GStreamer 的视频流来源
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

//! # GStreamer 视频流来源
//!
//! 支持的地址：
//! - `rtsp://host:port/path` - RTSP 网络摄像头
//! - `file:///path/to/video.mp4` - 视频文件
//! - `gst://camera/dev/video0?width=640&height=480&fps=15` - V4L2 摄像头
//! - `gst://file/path/to/video.mp4` - 视频文件
//!
//! 可选参数 `rotate=90|180|270` 旋转画面。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev
//! ```
//!
//! 管道描述直接交给 GStreamer 解析，不要使用不可信的地址。

use std::collections::HashMap;

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::{
  FromUrl,
  stream::{
    StreamTaskError,
    source::{FrameEmitter, RawFrame},
  },
};

const PULL_TIMEOUT_MS: u64 = 100;

#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  #[error("URI 方案不匹配: {0}")]
  SchemeMismatch(String),
  #[error("GStreamer 错误: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer 操作失败: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("无法获取 appsink 元素")]
  AppSinkNotFound,
  #[error("无法从 caps 获取视频信息")]
  VideoInfoError,
  #[error("不支持的视频格式: {0}")]
  UnsupportedFormat(String),
  #[error("管道错误: {0}")]
  PipelineError(String),
  #[error("缓冲区大小不匹配: 期望 {expected} 字节, 实际 {actual} 字节")]
  BufferSizeMismatch { expected: usize, actual: usize },
  #[error("状态切换失败: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  #[error("视频流结束")]
  EndOfStream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PipelineItem {
  RtspSource(String),
  FileSource(String),
  CameraSource {
    device: String,
    io_mode: Option<u32>,
    format: String,
    width: u32,
    height: u32,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  TargetFormat,
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::RtspSource(location) => {
        format!("rtspsrc location={} latency=200 ! decodebin", location)
      }
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        device,
        io_mode,
        format,
        width,
        height,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!(
          "v4l2src device={}{} ! video/x-raw,format={},width={},height={},framerate={}/1",
          device, io_mode, format, width, height, fps
        )
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::TargetFormat => "videoconvert ! video/x-raw,format=RGB".to_string(),
    }
  }
}

/// 每次尝试都会重新创建管道
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GStreamerSource {
  items: Vec<PipelineItem>,
}

impl GStreamerSource {
  pub const SCHEMES: [&'static str; 3] = ["gst", "rtsp", "file"];

  pub fn accepts(url: &Url) -> bool {
    Self::SCHEMES.contains(&url.scheme())
  }

  fn camera(device: &str, query: &HashMap<String, String>) -> PipelineItem {
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };
    PipelineItem::CameraSource {
      device: device.to_string(),
      io_mode: query.get("io-mode").and_then(|v| v.parse().ok()),
      format: query
        .get("format")
        .cloned()
        .unwrap_or_else(|| "YUY2".to_string()),
      width: number("width", 640),
      height: number("height", 480),
      fps: number("fps", 15),
    }
  }

  fn video_flip(rotate: Option<&str>) -> Option<PipelineItem> {
    let method = match rotate? {
      "90" => 1,
      "180" => 2,
      "270" => 3,
      _ => return None,
    };
    Some(PipelineItem::VideoFlip { method })
  }

  pub fn description(&self) -> String {
    let basic = self
      .items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<_>>()
      .join(" ! ");
    format!("{} ! appsink max-buffers=2 drop=true name=sink", basic)
  }

  pub async fn run(
    &self,
    emitter: &FrameEmitter,
    cancel: &CancellationToken,
  ) -> Result<(), StreamTaskError> {
    let description = self.description();
    let (tx, mut rx) = mpsc::channel(2);
    let stop = cancel.child_token();
    let puller = tokio::task::spawn_blocking({
      let stop = stop.clone();
      move || pull_frames(&description, tx, stop)
    });

    let result = loop {
      tokio::select! {
        _ = cancel.cancelled() => break Ok(()),
        item = rx.recv() => match item {
          Some(Ok(frame)) => {
            if let Err(e) = emitter.emit_frame(frame).await {
              break Err(e);
            }
          }
          Some(Err(e)) => break Err(StreamTaskError::from(e)),
          None => break Err(StreamTaskError::Ended),
        },
      }
    };

    stop.cancel();
    drop(rx);
    if let Err(e) = puller.await {
      warn!("流 {} 的拉取线程异常退出: {}", emitter.stream_id(), e);
    }
    result
  }
}

impl FromUrl for GStreamerSource {
  type Error = GStreamerSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();

    let source = match (url.scheme(), url.host_str()) {
      ("rtsp", _) => {
        // 查询参数属于摄像头地址本身，原样保留
        PipelineItem::RtspSource(url.as_str().to_string())
      }
      ("file", _) | ("gst", Some("file")) => PipelineItem::FileSource(url.path().to_string()),
      ("gst", Some("camera")) => Self::camera(url.path(), &query),
      (scheme, _) => return Err(GStreamerSourceError::SchemeMismatch(scheme.to_string())),
    };

    let mut items = vec![source];
    if url.scheme() != "rtsp" {
      items.extend(Self::video_flip(query.get("rotate").map(String::as_str)));
    }
    items.push(PipelineItem::TargetFormat);

    Ok(Self { items })
  }
}

struct Pipeline {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
}

impl Pipeline {
  fn launch(description: &str) -> Result<Self, GStreamerSourceError> {
    gst::init()?;
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("无法创建管道".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .and_then(|sink| sink.downcast::<gst_app::AppSink>().ok())
      .ok_or(GStreamerSourceError::AppSinkNotFound)?;

    pipeline.set_state(gst::State::Playing)?;
    Ok(Self { pipeline, appsink })
  }

  /// 超时返回 `Ok(None)`
  fn poll(&self) -> Result<Option<RawFrame>, GStreamerSourceError> {
    if let Some(sample) = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_mseconds(PULL_TIMEOUT_MS))
    {
      return convert_sample(&sample).map(Some);
    }

    if self.appsink.is_eos() {
      return Err(GStreamerSourceError::EndOfStream);
    }
    let message = self
      .pipeline
      .bus()
      .and_then(|bus| bus.pop_filtered(&[gst::MessageType::Error]));
    if let Some(message) = message {
      if let gst::MessageView::Error(err) = message.view() {
        return Err(GStreamerSourceError::PipelineError(format!(
          "{} ({:?})",
          err.error(),
          err.debug()
        )));
      }
    }
    Ok(None)
  }
}

impl Drop for Pipeline {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("停止 GStreamer 管道失败: {}", e);
    }
  }
}

fn pull_frames(
  description: &str,
  tx: mpsc::Sender<Result<RawFrame, GStreamerSourceError>>,
  stop: CancellationToken,
) {
  let pipeline = match Pipeline::launch(description) {
    Ok(pipeline) => pipeline,
    Err(e) => {
      let _ = tx.blocking_send(Err(e));
      return;
    }
  };

  while !stop.is_cancelled() {
    match pipeline.poll() {
      Ok(Some(frame)) => {
        if tx.blocking_send(Ok(frame)).is_err() {
          break;
        }
      }
      Ok(None) => continue,
      Err(e) => {
        let _ = tx.blocking_send(Err(e));
        break;
      }
    }
  }
  debug!("拉取线程结束");
}

/// 按行拷贝，去掉行尾填充，BGR 转为 RGB
fn convert_sample(sample: &gst::Sample) -> Result<RawFrame, GStreamerSourceError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有缓冲区".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerSourceError::PipelineError("样本中没有 caps".to_string()))?;
  let video_info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerSourceError::VideoInfoError)?;

  let width = video_info.width() as usize;
  let height = video_info.height() as usize;
  let stride = video_info.stride()[0] as usize;
  let row = width * 3;

  let map = buffer
    .map_readable()
    .map_err(|e| GStreamerSourceError::PipelineError(format!("无法映射缓冲区: {}", e)))?;
  let data = map.as_slice();

  let expected = stride * (height.saturating_sub(1)) + row;
  if stride < row || data.len() < expected {
    return Err(GStreamerSourceError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut rgb = Vec::with_capacity(row * height);
  match video_info.format() {
    gst_video::VideoFormat::Rgb => {
      for h in 0..height {
        rgb.extend_from_slice(&data[h * stride..h * stride + row]);
      }
    }
    gst_video::VideoFormat::Bgr => {
      for h in 0..height {
        for pixel in data[h * stride..h * stride + row].chunks_exact(3) {
          rgb.extend_from_slice(&[pixel[2], pixel[1], pixel[0]]);
        }
      }
    }
    other => return Err(GStreamerSourceError::UnsupportedFormat(format!("{:?}", other))),
  }

  Ok(RawFrame {
    width: width as u32,
    height: height as u32,
    data: rgb,
  })
}
