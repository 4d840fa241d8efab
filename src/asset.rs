// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/asset.rs - 模型文件的下载与定位
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
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::model::{
  DetectionConfig, InferenceEngine, ModelError, ObjectDetectionModel, ObjectDetectionModelBuilder,
};

pub const DEFAULT_ORIGIN: &str = "https://backend.zapdoslabs.com/api/v1/models";

pub const WEIGHTS_FILE: &str = "d_fine/onnx/model.onnx";
pub const CONFIG_FILE: &str = "d_fine/config.json";
pub const PREPROCESSOR_CONFIG_FILE: &str = "d_fine/preprocessor_config.json";

/// 需要下载的全部文件，相对于模型根目录
pub const MODEL_FILES: [&str; 3] = [WEIGHTS_FILE, CONFIG_FILE, PREPROCESSOR_CONFIG_FILE];

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum AssetError {
  #[error("下载 {url} 失败: {status}")]
  Fetch { url: String, status: String },
  #[error("HTTP 请求错误: {0}")]
  Http(#[from] reqwest::Error),
  #[error("写入 {path} 失败: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("无效的地址: {0}")]
  InvalidUrl(String),
}

/// 单次下载的结果由所有等待者共享
pub type SharedAssetError = Arc<AssetError>;

type InFlight = Shared<BoxFuture<'static, Result<(), SharedAssetError>>>;

/// 模型根目录下的文件布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
  root: PathBuf,
}

impl ModelFiles {
  pub fn new(root: impl AsRef<Path>) -> Self {
    Self {
      root: root.as_ref().to_path_buf(),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn local_path(&self, relative: &str) -> PathBuf {
    self.root.join(relative)
  }

  pub fn weights(&self) -> PathBuf {
    self.local_path(WEIGHTS_FILE)
  }

  pub fn config(&self) -> PathBuf {
    self.local_path(CONFIG_FILE)
  }

  pub fn preprocessor_config(&self) -> PathBuf {
    self.local_path(PREPROCESSOR_CONFIG_FILE)
  }
}

/// 取回远程文件的全部字节
#[async_trait]
pub trait AssetFetcher: Send + Sync {
  async fn fetch(&self, url: &Url) -> Result<Vec<u8>, AssetError>;
}

pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self, AssetError> {
    let client = reqwest::Client::builder()
      .timeout(DOWNLOAD_TIMEOUT)
      .build()?;
    Ok(Self { client })
  }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
  async fn fetch(&self, url: &Url) -> Result<Vec<u8>, AssetError> {
    let response = self.client.get(url.clone()).send().await?;
    if !response.status().is_success() {
      return Err(AssetError::Fetch {
        url: url.to_string(),
        status: response.status().to_string(),
      });
    }
    Ok(response.bytes().await?.to_vec())
  }
}

struct Inner {
  origin: Url,
  files: ModelFiles,
  fetcher: Arc<dyn AssetFetcher>,
  inflight: Mutex<Option<InFlight>>,
}

/// 模型文件解析器
///
/// 同一进程内同时只会有一次下载；下载期间到来的调用者等待同一个结果，
/// 成功之后的调用直接返回。失败的下载会被丢弃，之后的调用可以重新尝试。
#[derive(Clone)]
pub struct AssetResolver {
  inner: Arc<Inner>,
}

impl AssetResolver {
  pub fn new(origin: Url, root: impl AsRef<Path>, fetcher: Arc<dyn AssetFetcher>) -> Self {
    Self {
      inner: Arc::new(Inner {
        origin,
        files: ModelFiles::new(root),
        fetcher,
        inflight: Mutex::new(None),
      }),
    }
  }

  pub fn with_http(origin: Url, root: impl AsRef<Path>) -> Result<Self, AssetError> {
    Ok(Self::new(origin, root, Arc::new(HttpFetcher::new()?)))
  }

  pub fn files(&self) -> &ModelFiles {
    &self.inner.files
  }

  pub fn model_path(&self) -> PathBuf {
    self.inner.files.weights()
  }

  pub fn remote_url(&self, relative: &str) -> Result<Url, AssetError> {
    remote_url(&self.inner.origin, relative)
  }

  /// 确保全部模型文件存在于本地
  pub async fn ensure_assets(&self) -> Result<(), SharedAssetError> {
    let download = {
      let mut slot = self.inner.inflight.lock();
      match slot.as_ref() {
        Some(download) => download.clone(),
        None => {
          let inner = self.inner.clone();
          let download = async move { inner.download_all().await.map_err(Arc::new) }
            .boxed()
            .shared();
          *slot = Some(download.clone());
          download
        }
      }
    };

    let result = download.await;
    if result.is_err() {
      let mut slot = self.inner.inflight.lock();
      // 只清除已经失败的那一次，不影响新发起的下载
      if slot
        .as_ref()
        .and_then(|download| download.peek())
        .is_some_and(|r| r.is_err())
      {
        *slot = None;
      }
    }
    result
  }

  /// 等待正在进行的下载结束，不会发起新的下载
  pub async fn wait_resolved(&self) {
    let download = self.inner.inflight.lock().clone();
    if let Some(download) = download {
      let _ = download.await;
    }
  }

  pub async fn load_model(
    &self,
    detection: DetectionConfig,
  ) -> Result<ObjectDetectionModel, ModelError> {
    self.load(None, detection).await
  }

  pub async fn load_model_with_engine(
    &self,
    engine: Box<dyn InferenceEngine>,
    detection: DetectionConfig,
  ) -> Result<ObjectDetectionModel, ModelError> {
    self.load(Some(engine), detection).await
  }

  async fn load(
    &self,
    engine: Option<Box<dyn InferenceEngine>>,
    detection: DetectionConfig,
  ) -> Result<ObjectDetectionModel, ModelError> {
    self.wait_resolved().await;

    let mut builder = ObjectDetectionModelBuilder::new(self.inner.files.clone())
      .threshold(detection.confidence_threshold);
    if let Some(engine) = engine {
      builder = builder.engine(engine);
    }

    tokio::task::spawn_blocking(move || builder.build())
      .await
      .map_err(|e| ModelError::Io(std::io::Error::other(e)))?
  }
}

impl Inner {
  async fn download_all(&self) -> Result<(), AssetError> {
    info!("模型目录: {}", self.files.root().display());
    for relative in MODEL_FILES {
      let local = self.files.local_path(relative);
      let exists = tokio::fs::try_exists(&local)
        .await
        .map_err(|source| AssetError::Io {
          path: local.clone(),
          source,
        })?;
      if exists {
        debug!("已存在, 跳过: {}", local.display());
        continue;
      }

      let url = remote_url(&self.origin, relative)?;
      info!("下载模型文件: {}", url);
      let bytes = self.fetcher.fetch(&url).await?;
      write_file(&local, &bytes).await?;
      debug!("已写入 {} 字节: {}", bytes.len(), local.display());
    }
    info!("模型文件就绪");
    Ok(())
  }
}

/// `<origin>/<relative>`，逐段编码
fn remote_url(origin: &Url, relative: &str) -> Result<Url, AssetError> {
  let base = origin.as_str().trim_end_matches('/');
  let path = relative
    .split('/')
    .map(|segment| urlencoding::encode(segment).into_owned())
    .collect::<Vec<_>>()
    .join("/");
  let url = format!("{}/{}", base, path);
  Url::parse(&url).map_err(|e| AssetError::InvalidUrl(format!("{}: {}", url, e)))
}

async fn write_file(path: &Path, bytes: &[u8]) -> Result<(), AssetError> {
  let io_error = |source: std::io::Error| AssetError::Io {
    path: path.to_path_buf(),
    source,
  };
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
  }
  tokio::fs::write(path, bytes).await.map_err(io_error)
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};

  use super::*;
  use crate::model::tests::FixedEngine;

  /// 记录调用次数的假下载器
  struct CountingFetcher {
    calls: AtomicUsize,
    fail: bool,
  }

  impl CountingFetcher {
    fn new(fail: bool) -> Arc<Self> {
      Arc::new(Self {
        calls: AtomicUsize::new(0),
        fail,
      })
    }

    fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl AssetFetcher for CountingFetcher {
    async fn fetch(&self, url: &Url) -> Result<Vec<u8>, AssetError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      if self.fail {
        return Err(AssetError::Fetch {
          url: url.to_string(),
          status: "404 Not Found".to_string(),
        });
      }
      let body = if url.path().ends_with("preprocessor_config.json") {
        r#"{"size": {"width": 8, "height": 8}, "do_rescale": true, "rescale_factor": 0.00392156862745098}"#
      } else if url.path().ends_with("config.json") {
        r#"{"id2label": {"0": "person"}}"#
      } else {
        "onnx"
      };
      Ok(body.as_bytes().to_vec())
    }
  }

  fn origin() -> Url {
    Url::parse(DEFAULT_ORIGIN).unwrap()
  }

  #[test]
  fn test_remote_url_layout() {
    let resolver = AssetResolver::new(origin(), "/models", CountingFetcher::new(false));
    assert_eq!(
      resolver.remote_url(WEIGHTS_FILE).unwrap().as_str(),
      "https://backend.zapdoslabs.com/api/v1/models/d_fine/onnx/model.onnx"
    );
    assert_eq!(
      resolver.files().config(),
      PathBuf::from("/models/d_fine/config.json")
    );
  }

  #[tokio::test]
  async fn test_concurrent_calls_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(false);
    let resolver = AssetResolver::new(origin(), dir.path(), fetcher.clone());

    let other = resolver.clone();
    let (a, b) = tokio::join!(resolver.ensure_assets(), other.ensure_assets());
    a.unwrap();
    b.unwrap();
    assert_eq!(fetcher.calls(), MODEL_FILES.len());
    for relative in MODEL_FILES {
      assert!(resolver.files().local_path(relative).exists());
    }

    // 成功之后不再下载
    resolver.ensure_assets().await.unwrap();
    assert_eq!(fetcher.calls(), MODEL_FILES.len());
  }

  #[tokio::test]
  async fn test_existing_files_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(false);
    let resolver = AssetResolver::new(origin(), dir.path(), fetcher.clone());
    let weights = resolver.model_path();
    std::fs::create_dir_all(weights.parent().unwrap()).unwrap();
    std::fs::write(&weights, b"local").unwrap();

    resolver.ensure_assets().await.unwrap();
    assert_eq!(fetcher.calls(), 2);
    assert_eq!(std::fs::read(&weights).unwrap(), b"local");
  }

  #[tokio::test]
  async fn test_unreadable_root_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    // 根目录是普通文件，检查子路径时得到 ENOTDIR 而不是“不存在”
    let root = dir.path().join("models");
    std::fs::write(&root, b"not a directory").unwrap();
    let fetcher = CountingFetcher::new(false);
    let resolver = AssetResolver::new(origin(), &root, fetcher.clone());

    let err = resolver.ensure_assets().await.unwrap_err();
    assert!(matches!(*err, AssetError::Io { .. }));
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_failure_is_shared_and_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(true);
    let resolver = AssetResolver::new(origin(), dir.path(), fetcher.clone());

    let (a, b) = tokio::join!(resolver.ensure_assets(), resolver.ensure_assets());
    let (a, b) = (a.unwrap_err(), b.unwrap_err());
    assert!(Arc::ptr_eq(&a, &b));
    assert!(matches!(*a, AssetError::Fetch { .. }));
    assert_eq!(fetcher.calls(), 1);

    assert!(resolver.ensure_assets().await.is_err());
    assert_eq!(fetcher.calls(), 2);
  }

  #[tokio::test]
  async fn test_load_model_without_assets() {
    let dir = tempfile::tempdir().unwrap();
    let fetcher = CountingFetcher::new(false);
    let resolver = AssetResolver::new(origin(), dir.path(), fetcher.clone());
    let result = resolver.load_model(DetectionConfig::default()).await;
    assert!(matches!(result, Err(ModelError::ModelMissing(_))));
    // 加载不会触发下载
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_load_model_waits_for_download() {
    let dir = tempfile::tempdir().unwrap();
    let resolver = AssetResolver::new(origin(), dir.path(), CountingFetcher::new(false));

    let download = tokio::spawn({
      let resolver = resolver.clone();
      async move { resolver.ensure_assets().await }
    });
    tokio::task::yield_now().await;
    while resolver.inner.inflight.lock().is_none() {
      tokio::task::yield_now().await;
    }

    let model = resolver
      .load_model_with_engine(Box::new(FixedEngine), DetectionConfig::default())
      .await
      .unwrap();
    assert_eq!(model.model_width(), 8);
    assert_eq!(model.labels().label(0), Some("person"));
    download.await.unwrap().unwrap();
  }
}
