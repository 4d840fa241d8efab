// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/stream/supervisor.rs - 流的生命周期管理与故障恢复
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
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  model::ObjectDetectionModel,
  stream::{
    StreamTaskError,
    protocol::{SupervisorCommand, WorkerMessage},
    source::{FrameEmitter, StreamSource, StreamSpec},
  },
};

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
  /// 连续失败多少次后放弃
  pub heart_budget: i32,
  /// 持续运行多久后恢复全部生命值
  pub stability_window: Duration,
  pub retry_delay: Duration,
  /// 每隔多少帧检测一次
  pub detect_every: u64,
}

impl Default for SupervisorConfig {
  fn default() -> Self {
    Self {
      heart_budget: 5,
      stability_window: Duration::from_secs(30),
      retry_delay: Duration::from_secs(5),
      detect_every: 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
  Idle,
  Running,
  Recovering,
  Stopped,
  GivenUp,
}

#[derive(Debug)]
pub struct StreamState {
  hearts: AtomicI32,
  phase: Mutex<StreamPhase>,
}

impl StreamState {
  fn new(hearts: i32) -> Self {
    Self {
      hearts: AtomicI32::new(hearts),
      phase: Mutex::new(StreamPhase::Idle),
    }
  }

  pub fn hearts(&self) -> i32 {
    self.hearts.load(Ordering::SeqCst)
  }

  pub fn phase(&self) -> StreamPhase {
    *self.phase.lock()
  }

  fn set_phase(&self, phase: StreamPhase) {
    *self.phase.lock() = phase;
  }

  fn reset_hearts(&self, hearts: i32) {
    self.hearts.store(hearts, Ordering::SeqCst);
  }

  /// 返回扣除后的剩余生命值
  fn lose_heart(&self) -> i32 {
    self.hearts.fetch_sub(1, Ordering::SeqCst) - 1
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
  Stopped,
  GivenUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamExit {
  pub stream_id: String,
  pub generation: u64,
  pub reason: ExitReason,
}

#[derive(Debug)]
pub struct StreamHandle {
  pub id: String,
  pub uri: String,
  pub generation: u64,
  cancel: CancellationToken,
  state: Arc<StreamState>,
}

impl StreamHandle {
  pub fn state(&self) -> &StreamState {
    &self.state
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }
}

/// 流管理器
///
/// 注册表只由持有者修改：命令与退出通知都在同一个任务中处理。
pub struct StreamSupervisor {
  source: Arc<dyn StreamSource>,
  config: SupervisorConfig,
  detector: Option<Arc<ObjectDetectionModel>>,
  events: mpsc::Sender<WorkerMessage>,
  root: CancellationToken,
  exits_tx: mpsc::UnboundedSender<StreamExit>,
  exits_rx: mpsc::UnboundedReceiver<StreamExit>,
  streams: HashMap<String, StreamHandle>,
  next_generation: u64,
}

impl StreamSupervisor {
  pub fn new(
    source: Arc<dyn StreamSource>,
    config: SupervisorConfig,
    detector: Option<Arc<ObjectDetectionModel>>,
    events: mpsc::Sender<WorkerMessage>,
  ) -> Self {
    let (exits_tx, exits_rx) = mpsc::unbounded_channel();
    Self {
      source,
      config,
      detector,
      events,
      root: CancellationToken::new(),
      exits_tx,
      exits_rx,
      streams: HashMap::new(),
      next_generation: 0,
    }
  }

  /// 取消该令牌即关闭全部流
  pub fn shutdown_token(&self) -> CancellationToken {
    self.root.clone()
  }

  pub fn handle(&self, stream_id: &str) -> Option<&StreamHandle> {
    self.streams.get(stream_id)
  }

  pub fn is_active(&self, stream_id: &str) -> bool {
    self.streams.contains_key(stream_id)
  }

  pub fn hearts(&self, stream_id: &str) -> Option<i32> {
    self.handle(stream_id).map(|h| h.state.hearts())
  }

  pub fn phase(&self, stream_id: &str) -> Option<StreamPhase> {
    self.handle(stream_id).map(|h| h.state.phase())
  }

  pub fn active_streams(&self) -> Vec<String> {
    let mut ids: Vec<String> = self.streams.keys().cloned().collect();
    ids.sort();
    ids
  }

  pub fn apply(&mut self, command: SupervisorCommand) {
    match command {
      SupervisorCommand::StartStream { stream_id, uri } => self.start(stream_id, uri),
      SupervisorCommand::StopStream { stream_id } => {
        self.stop(&stream_id);
      }
    }
  }

  /// 启动一路流；同一标识已存在时取消旧的并替换
  pub fn start(&mut self, stream_id: impl Into<String>, uri: impl Into<String>) {
    let spec = StreamSpec {
      id: stream_id.into(),
      uri: uri.into(),
    };

    if let Some(previous) = self.streams.get(&spec.id) {
      warn!(
        "流 {} 已存在 (第 {} 代), 取消并替换",
        spec.id, previous.generation
      );
      previous.cancel.cancel();
    }

    self.next_generation += 1;
    let generation = self.next_generation;
    let cancel = self.root.child_token();
    let state = Arc::new(StreamState::new(self.config.heart_budget));

    info!("启动流 {} (第 {} 代): {}", spec.id, generation, spec.uri);

    let recovery = RecoveryLoop {
      emitter: FrameEmitter::new(
        spec.id.clone(),
        self.events.clone(),
        self.detector.clone(),
        self.config.detect_every,
      )
      .with_cancellation(cancel.clone()),
      spec: spec.clone(),
      source: self.source.clone(),
      config: self.config.clone(),
      cancel: cancel.clone(),
      state: state.clone(),
    };
    let exits = self.exits_tx.clone();
    tokio::spawn(async move {
      let reason = recovery.run().await;
      recovery.state.set_phase(match reason {
        ExitReason::Stopped => StreamPhase::Stopped,
        ExitReason::GivenUp => StreamPhase::GivenUp,
      });
      let _ = exits.send(StreamExit {
        stream_id: recovery.spec.id.clone(),
        generation,
        reason,
      });
    });

    self.streams.insert(
      spec.id.clone(),
      StreamHandle {
        id: spec.id,
        uri: spec.uri,
        generation,
        cancel,
        state,
      },
    );
  }

  /// 请求停止；句柄在循环退出后移除
  pub fn stop(&mut self, stream_id: &str) -> bool {
    match self.streams.get(stream_id) {
      Some(handle) => {
        info!("停止流 {} (第 {} 代)", stream_id, handle.generation);
        handle.cancel.cancel();
        true
      }
      None => {
        info!("流 {} 不存在, 忽略停止请求", stream_id);
        false
      }
    }
  }

  fn handle_exit(&mut self, exit: &StreamExit) {
    match self.streams.get(&exit.stream_id) {
      Some(handle) if handle.generation == exit.generation => {
        info!(
          "流 {} (第 {} 代) 已退出: {:?}",
          exit.stream_id, exit.generation, exit.reason
        );
        self.streams.remove(&exit.stream_id);
      }
      _ => debug!(
        "忽略过期的退出通知: 流 {} 第 {} 代",
        exit.stream_id, exit.generation
      ),
    }
  }

  /// 等待下一次循环退出并更新注册表
  pub async fn next_exit(&mut self) -> Option<StreamExit> {
    let exit = self.exits_rx.recv().await?;
    self.handle_exit(&exit);
    Some(exit)
  }

  /// 处理命令直到命令通道关闭或收到关闭信号，然后等待全部流退出
  pub async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
    let root = self.root.clone();
    loop {
      tokio::select! {
        _ = root.cancelled() => break,
        Some(exit) = self.exits_rx.recv() => self.handle_exit(&exit),
        command = commands.recv() => match command {
          Some(command) => self.apply(command),
          None => {
            info!("命令通道已关闭");
            break;
          }
        },
      }
    }

    self.shutdown().await;
  }

  pub async fn shutdown(&mut self) {
    info!("关闭全部 {} 路流", self.streams.len());
    self.root.cancel();
    while !self.streams.is_empty() {
      if self.next_exit().await.is_none() {
        break;
      }
    }
    info!("全部流已退出");
  }
}

struct RecoveryLoop {
  spec: StreamSpec,
  emitter: FrameEmitter,
  source: Arc<dyn StreamSource>,
  config: SupervisorConfig,
  cancel: CancellationToken,
  state: Arc<StreamState>,
}

impl RecoveryLoop {
  async fn attempt(&self) -> Result<(), StreamTaskError> {
    let attempt = self.source.run(&self.spec, &self.emitter, &self.cancel);
    tokio::pin!(attempt);
    let stability = tokio::time::sleep(self.config.stability_window);
    tokio::pin!(stability);
    let mut armed = true;

    loop {
      tokio::select! {
        result = &mut attempt => return result,
        _ = &mut stability, if armed => {
          armed = false;
          self.state.reset_hearts(self.config.heart_budget);
          info!(
            "流 {} 已稳定运行 {:?}, 生命值恢复为 {}",
            self.spec.id, self.config.stability_window, self.config.heart_budget
          );
        }
      }
    }
  }

  async fn run(&self) -> ExitReason {
    loop {
      self.state.set_phase(StreamPhase::Running);
      let error = match self.attempt().await {
        Ok(()) if self.cancel.is_cancelled() => return ExitReason::Stopped,
        Ok(()) => StreamTaskError::Ended,
        Err(StreamTaskError::Cancelled) => return ExitReason::Stopped,
        Err(e) => e,
      };

      let hearts = self.state.lose_heart();
      if hearts <= 0 {
        error!("流 {} 连续失败, 放弃: {}", self.spec.id, error);
        return ExitReason::GivenUp;
      }
      if self.cancel.is_cancelled() {
        return ExitReason::Stopped;
      }

      warn!(
        "流 {} 出错: {}, 剩余生命值 {}, {:?} 后重试",
        self.spec.id, error, hearts, self.config.retry_delay
      );
      self.state.set_phase(StreamPhase::Recovering);
      tokio::select! {
        _ = self.cancel.cancelled() => return ExitReason::Stopped,
        _ = tokio::time::sleep(self.config.retry_delay) => {}
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;
  use std::sync::atomic::AtomicUsize;

  use async_trait::async_trait;
  use image::{Rgb, RgbImage};

  use super::*;
  use crate::stream::{protocol::StreamEvent, source::RawFrame};

  #[derive(Debug, Clone, Copy)]
  enum Step {
    Fail,
    End,
    RunUntilCancelled,
    EmitThenRun(usize),
    Flood,
  }

  /// 按脚本执行的来源，脚本用完后一直失败
  struct ScriptedSource {
    script: Mutex<VecDeque<Step>>,
    starts: AtomicUsize,
  }

  impl ScriptedSource {
    fn new(steps: &[Step]) -> Arc<Self> {
      Arc::new(Self {
        script: Mutex::new(steps.iter().copied().collect()),
        starts: AtomicUsize::new(0),
      })
    }

    fn starts(&self) -> usize {
      self.starts.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl StreamSource for ScriptedSource {
    async fn run(
      &self,
      _stream: &StreamSpec,
      emitter: &FrameEmitter,
      cancel: &CancellationToken,
    ) -> Result<(), StreamTaskError> {
      self.starts.fetch_add(1, Ordering::SeqCst);
      let step = self.script.lock().pop_front().unwrap_or(Step::Fail);
      match step {
        Step::Fail => Err(StreamTaskError::Ended),
        Step::End => Ok(()),
        Step::RunUntilCancelled => {
          cancel.cancelled().await;
          Ok(())
        }
        Step::EmitThenRun(frames) => {
          for _ in 0..frames {
            let frame: RawFrame = RgbImage::from_pixel(2, 2, Rgb([5, 5, 5])).into();
            emitter.emit_frame(frame).await?;
          }
          cancel.cancelled().await;
          Ok(())
        }
        Step::Flood => loop {
          let frame: RawFrame = RgbImage::from_pixel(2, 2, Rgb([5, 5, 5])).into();
          emitter.emit_frame(frame).await?;
        },
      }
    }
  }

  fn supervisor(
    source: Arc<ScriptedSource>,
  ) -> (StreamSupervisor, mpsc::Receiver<WorkerMessage>) {
    let (tx, rx) = mpsc::channel(16);
    let supervisor = StreamSupervisor::new(source, SupervisorConfig::default(), None, tx);
    (supervisor, rx)
  }

  fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
  }

  #[tokio::test(start_paused = true)]
  async fn test_hearts_recover_after_stable_window() {
    let source = ScriptedSource::new(&[
      Step::Fail,
      Step::Fail,
      Step::Fail,
      Step::Fail,
      Step::RunUntilCancelled,
    ]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://cam");

    // 失败发生在 0, 5, 10, 15 秒, 第 5 次尝试从 20 秒开始
    tokio::time::sleep(secs(21)).await;
    assert_eq!(source.starts(), 5);
    assert_eq!(supervisor.hearts("cam"), Some(1));
    assert_eq!(supervisor.phase("cam"), Some(StreamPhase::Running));

    tokio::time::sleep(secs(30)).await;
    assert_eq!(supervisor.hearts("cam"), Some(5));
    assert_eq!(source.starts(), 5);
  }

  #[tokio::test(start_paused = true)]
  async fn test_gives_up_after_budget() {
    let source = ScriptedSource::new(&[]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://cam");

    let exit = supervisor.next_exit().await.unwrap();
    assert_eq!(exit.reason, ExitReason::GivenUp);
    assert_eq!(exit.stream_id, "cam");
    assert_eq!(source.starts(), 5);
    assert!(!supervisor.is_active("cam"));
  }

  #[tokio::test(start_paused = true)]
  async fn test_normal_end_counts_as_failure() {
    let source = ScriptedSource::new(&[Step::End, Step::RunUntilCancelled]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://cam");

    tokio::time::sleep(secs(1)).await;
    assert_eq!(supervisor.hearts("cam"), Some(4));
    assert_eq!(supervisor.phase("cam"), Some(StreamPhase::Recovering));
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_during_retry_delay() {
    let source = ScriptedSource::new(&[Step::Fail, Step::RunUntilCancelled]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://cam");

    tokio::time::sleep(secs(1)).await;
    assert_eq!(supervisor.phase("cam"), Some(StreamPhase::Recovering));
    assert!(supervisor.stop("cam"));

    let exit = supervisor.next_exit().await.unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert!(!supervisor.is_active("cam"));

    tokio::time::sleep(secs(10)).await;
    assert_eq!(source.starts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_running_stream() {
    let source = ScriptedSource::new(&[Step::RunUntilCancelled]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://cam");
    tokio::time::sleep(secs(1)).await;

    supervisor.stop("cam");
    let exit = supervisor.next_exit().await.unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert_eq!(source.starts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_unknown_stream_is_noop() {
    let (mut supervisor, _rx) = supervisor(ScriptedSource::new(&[]));
    assert!(!supervisor.stop("missing"));
    assert!(supervisor.active_streams().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_duplicate_start_replaces_handle() {
    let source = ScriptedSource::new(&[Step::RunUntilCancelled, Step::RunUntilCancelled]);
    let (mut supervisor, _rx) = supervisor(source.clone());
    supervisor.start("cam", "test://old");
    tokio::time::sleep(secs(1)).await;
    supervisor.start("cam", "test://new");

    let exit = supervisor.next_exit().await.unwrap();
    assert_eq!(exit.generation, 1);
    assert_eq!(exit.reason, ExitReason::Stopped);

    let handle = supervisor.handle("cam").unwrap();
    assert_eq!(handle.generation, 2);
    assert_eq!(handle.uri, "test://new");
    assert!(!handle.is_cancelled());
  }

  #[tokio::test(start_paused = true)]
  async fn test_events_are_tagged_with_stream_id() {
    let source = ScriptedSource::new(&[Step::EmitThenRun(2), Step::EmitThenRun(1)]);
    let (mut supervisor, mut rx) = supervisor(source);
    supervisor.start("front", "test://front");
    supervisor.start("back", "test://back");

    let mut seen = HashMap::<String, Vec<u64>>::new();
    for _ in 0..3 {
      let message = rx.recv().await.unwrap();
      if let StreamEvent::Frame { index, .. } = message.event {
        seen.entry(message.stream_id).or_default().push(index);
      }
    }
    let mut counts: Vec<usize> = seen.values().map(Vec::len).collect();
    counts.sort();
    assert_eq!(counts, [1, 2]);
    assert!(seen.values().all(|indices| indices[0] == 0));
  }

  #[tokio::test(start_paused = true)]
  async fn test_run_until_commands_close() {
    let source = ScriptedSource::new(&[Step::RunUntilCancelled, Step::RunUntilCancelled]);
    let (supervisor, _rx) = supervisor(source.clone());
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(supervisor.run(rx));

    for command in [
      r#"{"type":"start_stream","stream_id":"a","uri":"test://a"}"#,
      r#"{"type":"start_stream","stream_id":"b","uri":"test://b"}"#,
      r#"{"type":"stop_stream","stream_id":"a"}"#,
    ] {
      tx.send(SupervisorCommand::parse_line(command).unwrap())
        .await
        .unwrap();
    }
    tokio::time::sleep(secs(1)).await;
    drop(tx);

    task.await.unwrap();
    assert_eq!(source.starts(), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_token_stops_everything() {
    let source = ScriptedSource::new(&[Step::RunUntilCancelled, Step::Fail]);
    let (supervisor, _rx) = supervisor(source.clone());
    let shutdown = supervisor.shutdown_token();
    let (tx, rx) = mpsc::channel(4);
    let task = tokio::spawn(supervisor.run(rx));

    tx.send(SupervisorCommand::StartStream {
      stream_id: "a".to_string(),
      uri: "test://a".to_string(),
    })
    .await
    .unwrap();
    tx.send(SupervisorCommand::StartStream {
      stream_id: "b".to_string(),
      uri: "test://b".to_string(),
    })
    .await
    .unwrap();
    tokio::time::sleep(secs(2)).await;

    shutdown.cancel();
    task.await.unwrap();
    assert_eq!(source.starts(), 2);
    drop(tx);
  }

  #[tokio::test(start_paused = true)]
  async fn test_stop_wins_over_stalled_consumer() {
    let source = ScriptedSource::new(&[Step::Flood]);
    // 没有人读取事件通道
    let (tx, _rx) = mpsc::channel(1);
    let mut supervisor =
      StreamSupervisor::new(source.clone(), SupervisorConfig::default(), None, tx);
    supervisor.start("cam", "test://cam");
    tokio::time::sleep(secs(1)).await;

    assert!(supervisor.stop("cam"));
    let exit = tokio::time::timeout(secs(60), supervisor.next_exit())
      .await
      .expect("stream did not exit after stop")
      .unwrap();
    assert_eq!(exit.reason, ExitReason::Stopped);
    assert!(!supervisor.is_active("cam"));
    assert_eq!(source.starts(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_shutdown_with_stalled_consumer() {
    let source = ScriptedSource::new(&[Step::Flood, Step::Flood]);
    let (tx, _rx) = mpsc::channel(1);
    let mut supervisor =
      StreamSupervisor::new(source.clone(), SupervisorConfig::default(), None, tx);
    supervisor.start("a", "test://a");
    supervisor.start("b", "test://b");
    tokio::time::sleep(secs(1)).await;

    tokio::time::timeout(secs(60), supervisor.shutdown())
      .await
      .expect("shutdown did not finish");
    assert!(supervisor.active_streams().is_empty());
  }
}
