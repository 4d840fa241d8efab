// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/bin/stream_worker.rs - 流管理进程
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

//! 从标准输入逐行读取 JSON 命令，向标准输出写出带长度前缀的 CBOR 消息。
//! 日志写入标准错误。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use liaowang::{
  asset::{AssetResolver, DEFAULT_ORIGIN},
  model::{DetectionConfig, ObjectDetectionModel, parse_threshold},
  postprocess::CONFIDENCE_THRESHOLD,
  stream::{
    SourceRouter, StreamSupervisor, SupervisorCommand, SupervisorConfig, spawn_encoder,
    write_framed,
  },
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 对视频帧运行检测
  #[arg(long)]
  pub detect: bool,
  /// 模型根目录，启用检测时必须提供
  #[arg(long, env = "LIAOWANG_MODELS_DIR", value_name = "DIR")]
  pub models_dir: Option<PathBuf>,
  /// 模型文件下载地址
  #[arg(long, env = "LIAOWANG_ASSET_ORIGIN", default_value = DEFAULT_ORIGIN, value_name = "URL")]
  pub origin: Url,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = CONFIDENCE_THRESHOLD, value_parser = parse_threshold, value_name = "THRESHOLD")]
  pub threshold: f32,
  /// 每隔多少帧检测一次
  #[arg(long, default_value_t = 1, value_name = "FRAMES")]
  pub detect_every: u64,
  /// 连续失败多少次后放弃
  #[arg(long, default_value_t = 5, value_name = "COUNT")]
  pub hearts: i32,
  /// 稳定运行多少秒后恢复生命值
  #[arg(long, default_value_t = 30, value_name = "SECONDS")]
  pub stability_secs: u64,
  /// 失败后等待多少秒重试
  #[arg(long, default_value_t = 5, value_name = "SECONDS")]
  pub retry_delay_secs: u64,
  /// 事件通道容量
  #[arg(long, default_value_t = 64, value_name = "COUNT")]
  pub event_buffer: usize,
}

impl Args {
  fn supervisor_config(&self) -> SupervisorConfig {
    SupervisorConfig {
      heart_budget: self.hearts.max(1),
      stability_window: Duration::from_secs(self.stability_secs),
      retry_delay: Duration::from_secs(self.retry_delay_secs),
      detect_every: self.detect_every.max(1),
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  let runtime = tokio::runtime::Builder::new_multi_thread()
    .enable_all()
    .build()?;
  let result = runtime.block_on(run(args));
  // 标准输入的读取线程不会自行结束
  runtime.shutdown_timeout(Duration::from_secs(1));
  result
}

async fn load_detector(args: &Args) -> Result<Option<Arc<ObjectDetectionModel>>> {
  if !args.detect {
    return Ok(None);
  }
  let Some(models_dir) = &args.models_dir else {
    bail!("启用检测时必须提供 --models-dir");
  };

  let resolver = AssetResolver::with_http(args.origin.clone(), models_dir)?;
  resolver.ensure_assets().await?;
  let detection = DetectionConfig::with_threshold(args.threshold)?;
  Ok(Some(Arc::new(resolver.load_model(detection).await?)))
}

async fn run(args: Args) -> Result<()> {
  let detector = load_detector(&args).await?;
  let config = args.supervisor_config();
  info!("流管理配置: {:?}", config);

  let (events_tx, events_rx) = mpsc::channel(args.event_buffer);
  let (encoder, mut encoded) = spawn_encoder(events_rx, args.event_buffer);
  let supervisor = StreamSupervisor::new(Arc::new(SourceRouter), config, detector, events_tx);

  let shutdown = supervisor.shutdown_token();
  ctrlc::set_handler({
    let shutdown = shutdown.clone();
    move || {
      info!("收到退出信号");
      shutdown.cancel();
    }
  })?;

  let writer = tokio::spawn(async move {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = encoded.recv().await {
      if let Err(e) = write_framed(&mut stdout, &message).await {
        error!("写出消息失败: {}", e);
        break;
      }
    }
  });

  let (commands_tx, commands_rx) = mpsc::channel(16);
  let reader = tokio::spawn(read_commands(commands_tx, shutdown));

  supervisor.run(commands_rx).await;
  reader.abort();
  encoder.await?;
  writer.await?;

  info!("流管理进程退出");
  Ok(())
}

async fn read_commands(commands: mpsc::Sender<SupervisorCommand>, shutdown: CancellationToken) {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = tokio::select! {
      _ = shutdown.cancelled() => break,
      line = lines.next_line() => line,
    };

    match line {
      Ok(Some(line)) if line.trim().is_empty() => continue,
      Ok(Some(line)) => match SupervisorCommand::parse_line(&line) {
        Ok(command) => {
          if commands.send(command).await.is_err() {
            break;
          }
        }
        Err(e) => warn!("忽略无法解析的命令: {}", e),
      },
      Ok(None) => {
        info!("标准输入已关闭");
        break;
      }
      Err(e) => {
        error!("读取标准输入失败: {}", e);
        break;
      }
    }
  }
}
