// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model.rs - 目标检测模型与推理流水线
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

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  asset::ModelFiles,
  config::{ConfigError, ModelConfig, PreprocessorConfig},
  frame::ImageBuffer,
  postprocess::{CONFIDENCE_THRESHOLD, DetectionResult, PostprocessError, postprocess},
  preprocess::{PreprocessError, preprocess},
};

pub mod engine;
#[cfg(feature = "ort_engine")]
mod ort_engine;

pub use self::engine::{EngineError, InferenceEngine};
#[cfg(feature = "ort_engine")]
pub use self::ort_engine::OrtEngine;

pub trait Model {
  type Input: ?Sized;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}, 请先运行 fetch-assets 下载模型文件")]
  ModelMissing(PathBuf),
  #[error("模型配置错误: {0}")]
  Config(#[from] ConfigError),
  #[error("推理引擎错误: {0}")]
  Engine(#[from] EngineError),
  #[error("未启用任何推理引擎, 请启用 ort_engine 特性")]
  EngineUnavailable,
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("置信度阈值必须在 [0, 1] 之间, 实际为 {0}")]
  InvalidThreshold(f32),
  #[error("IO 错误: {0}")]
  Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum DetectError {
  #[error("预处理错误: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("推理错误: {0}")]
  Engine(#[from] EngineError),
  #[error("后处理错误: {0}")]
  Postprocess(#[from] PostprocessError),
  #[error("推理任务异常退出: {0}")]
  Join(String),
}

/// 检测阶段的可调参数
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectionConfig {
  pub confidence_threshold: f32,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      confidence_threshold: CONFIDENCE_THRESHOLD,
    }
  }
}

impl DetectionConfig {
  pub fn with_threshold(confidence_threshold: f32) -> Result<Self, ModelError> {
    let config = Self {
      confidence_threshold,
    };
    config.validate()?;
    Ok(config)
  }

  /// NaN 与超出 `[0, 1]` 的阈值会过滤掉全部结果
  pub fn validate(&self) -> Result<(), ModelError> {
    if (0.0..=1.0).contains(&self.confidence_threshold) {
      Ok(())
    } else {
      Err(ModelError::InvalidThreshold(self.confidence_threshold))
    }
  }
}

/// 命令行参数解析用
pub fn parse_threshold(value: &str) -> Result<f32, String> {
  let threshold: f32 = value
    .parse()
    .map_err(|e| format!("无效的阈值 {}: {}", value, e))?;
  DetectionConfig::with_threshold(threshold)
    .map(|config| config.confidence_threshold)
    .map_err(|e| e.to_string())
}

/// 已加载的检测模型，加载后只读，可通过 `Arc` 在多个调用间共享
pub struct ObjectDetectionModel {
  engine: Box<dyn InferenceEngine>,
  labels: ModelConfig,
  preprocessor: PreprocessorConfig,
  detection: DetectionConfig,
}

impl std::fmt::Debug for ObjectDetectionModel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ObjectDetectionModel")
      .field("input_name", &self.engine.input_name())
      .field("labels", &self.labels.id2label.len())
      .field("preprocessor", &self.preprocessor)
      .field("detection", &self.detection)
      .finish()
  }
}

impl ObjectDetectionModel {
  pub fn new(
    engine: Box<dyn InferenceEngine>,
    labels: ModelConfig,
    preprocessor: PreprocessorConfig,
    detection: DetectionConfig,
  ) -> Self {
    Self {
      engine,
      labels,
      preprocessor,
      detection,
    }
  }

  pub fn labels(&self) -> &ModelConfig {
    &self.labels
  }

  pub fn preprocessor(&self) -> &PreprocessorConfig {
    &self.preprocessor
  }

  pub fn model_width(&self) -> u32 {
    self.preprocessor.width()
  }

  pub fn model_height(&self) -> u32 {
    self.preprocessor.height()
  }

  /// 预处理 -> 推理 -> 后处理，任一阶段出错即整体失败
  pub fn detect(&self, images: &[ImageBuffer]) -> Result<Vec<Vec<DetectionResult>>, DetectError> {
    let now = std::time::Instant::now();
    let tensor = preprocess(images, &self.preprocessor)?;
    let preprocessed = now.elapsed();

    let input_name = self.engine.input_name();
    let outputs = self.engine.run(input_name, &tensor)?;
    let inferred = now.elapsed();

    let detections = postprocess(
      &outputs,
      &self.labels,
      self.model_width(),
      self.model_height(),
      self.detection.confidence_threshold,
    )?;
    debug!(
      "{} 张图像推理完成, 预处理 {:.2?}, 推理 {:.2?}, 总计 {:.2?}",
      images.len(),
      preprocessed,
      inferred - preprocessed,
      now.elapsed()
    );

    Ok(detections)
  }
}

impl Model for ObjectDetectionModel {
  type Input = [ImageBuffer];
  type Output = Vec<Vec<DetectionResult>>;
  type Error = DetectError;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error> {
    self.detect(input)
  }
}

/// 在阻塞线程池上执行检测，避免阻塞异步任务
pub async fn detect_objects(
  model: Arc<ObjectDetectionModel>,
  images: Vec<ImageBuffer>,
) -> Result<Vec<Vec<DetectionResult>>, DetectError> {
  detect_objects_keep_images(model, images)
    .await
    .map(|(_, detections)| detections)
}

/// 同 [`detect_objects`]，检测完成后交还输入图像
pub async fn detect_objects_keep_images(
  model: Arc<ObjectDetectionModel>,
  images: Vec<ImageBuffer>,
) -> Result<(Vec<ImageBuffer>, Vec<Vec<DetectionResult>>), DetectError> {
  tokio::task::spawn_blocking(move || {
    let detections = model.detect(&images)?;
    Ok((images, detections))
  })
  .await
  .map_err(|e| DetectError::Join(e.to_string()))?
}

/// 从本地模型目录加载模型
pub struct ObjectDetectionModelBuilder {
  files: ModelFiles,
  detection: DetectionConfig,
  engine: Option<Box<dyn InferenceEngine>>,
}

impl FromUrlWithScheme for ObjectDetectionModelBuilder {
  const SCHEME: &'static str = "onnx";
}

impl FromUrl for ObjectDetectionModelBuilder {
  type Error = ModelError;

  /// `onnx:///path/to/models`
  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ModelError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }

    let mut builder = Self::new(ModelFiles::new(url.path()));
    for (k, v) in url.query_pairs() {
      if k == "threshold" {
        let threshold = v
          .parse()
          .map_err(|_| ModelError::ModelPathError(format!("无效的阈值: {}", v)))?;
        DetectionConfig::with_threshold(threshold)?;
        builder = builder.threshold(threshold);
      }
    }
    Ok(builder)
  }
}

impl ObjectDetectionModelBuilder {
  pub fn new(files: ModelFiles) -> Self {
    Self {
      files,
      detection: DetectionConfig::default(),
      engine: None,
    }
  }

  pub fn threshold(mut self, threshold: f32) -> Self {
    self.detection.confidence_threshold = threshold;
    self
  }

  /// 使用自定义推理引擎，而不是从权重文件创建
  pub fn engine(mut self, engine: Box<dyn InferenceEngine>) -> Self {
    self.engine = Some(engine);
    self
  }

  pub fn build(self) -> Result<ObjectDetectionModel, ModelError> {
    self.detection.validate()?;
    let weights = self.files.weights();
    if !weights.exists() {
      return Err(ModelError::ModelMissing(weights));
    }

    let labels = ModelConfig::load(self.files.config())?;
    let preprocessor = PreprocessorConfig::load(self.files.preprocessor_config())?;

    let engine = match self.engine {
      Some(engine) => engine,
      None => load_engine(&weights)?,
    };

    info!(
      "模型就绪: {} 个类别, 输入尺寸 {}x{}, 阈值 {}",
      labels.id2label.len(),
      preprocessor.width(),
      preprocessor.height(),
      self.detection.confidence_threshold
    );

    Ok(ObjectDetectionModel::new(
      engine,
      labels,
      preprocessor,
      self.detection,
    ))
  }
}

#[cfg(feature = "ort_engine")]
fn load_engine(weights: &std::path::Path) -> Result<Box<dyn InferenceEngine>, ModelError> {
  Ok(Box::new(OrtEngine::load(weights)?))
}

#[cfg(not(feature = "ort_engine"))]
fn load_engine(_weights: &std::path::Path) -> Result<Box<dyn InferenceEngine>, ModelError> {
  Err(ModelError::EngineUnavailable)
}

#[cfg(test)]
pub(crate) mod tests {
  use std::collections::HashMap;

  use super::*;
  use crate::{
    frame::{BatchTensor, Tensor},
    postprocess::{LOGITS_OUTPUT, PRED_BOXES_OUTPUT},
  };
  use image::{Rgb, RgbImage};

  /// 每张图像输出一个查询：类别 0 概率 0.8，框位于中心
  pub(crate) struct FixedEngine;

  impl InferenceEngine for FixedEngine {
    fn input_name(&self) -> &str {
      "pixel_values"
    }

    fn run(
      &self,
      input_name: &str,
      input: &BatchTensor,
    ) -> Result<HashMap<String, Tensor>, EngineError> {
      if input_name != "pixel_values" {
        return Err(EngineError::InvalidInput(input_name.to_string()));
      }
      let batch = input.batch();
      let logits = [0.8f32.ln(), 0.2f32.ln()].repeat(batch);
      let boxes = [0.5, 0.5, 0.5, 0.5].repeat(batch);
      Ok(HashMap::from([
        (
          LOGITS_OUTPUT.to_string(),
          Tensor::new(vec![batch, 1, 2], logits),
        ),
        (
          PRED_BOXES_OUTPUT.to_string(),
          Tensor::new(vec![batch, 1, 4], boxes),
        ),
      ]))
    }
  }

  struct FailingEngine;

  impl InferenceEngine for FailingEngine {
    fn input_name(&self) -> &str {
      "pixel_values"
    }

    fn run(&self, _: &str, _: &BatchTensor) -> Result<HashMap<String, Tensor>, EngineError> {
      Err(EngineError::RunError("shape mismatch".to_string()))
    }
  }

  pub(crate) fn fixed_model() -> ObjectDetectionModel {
    let labels = ModelConfig {
      id2label: HashMap::from([(0, "person".to_string())]),
    };
    ObjectDetectionModel::new(
      Box::new(FixedEngine),
      labels,
      PreprocessorConfig::new(8, 8).with_rescale(1.0 / 255.0),
      DetectionConfig::default(),
    )
  }

  fn image() -> ImageBuffer {
    RgbImage::from_pixel(4, 4, Rgb([1, 2, 3])).into()
  }

  #[test]
  fn test_detect_batch() {
    let model = fixed_model();
    let results = model.detect(&[image(), image()]).unwrap();
    assert_eq!(results.len(), 2);
    for detections in results {
      assert_eq!(detections.len(), 1);
      assert_eq!(detections[0].label, "person");
      assert_eq!(detections[0].score, "0.800");
      assert_eq!(detections[0].bbox, ["2", "2", "6", "6"].map(String::from));
    }
  }

  #[test]
  fn test_engine_error_propagates() {
    let model = ObjectDetectionModel::new(
      Box::new(FailingEngine),
      ModelConfig::default(),
      PreprocessorConfig::new(8, 8),
      DetectionConfig::default(),
    );
    assert!(matches!(
      model.detect(&[image()]),
      Err(DetectError::Engine(_))
    ));
  }

  #[test]
  fn test_empty_batch_fails_fast() {
    let model = fixed_model();
    assert!(matches!(
      model.infer(&[]),
      Err(DetectError::Preprocess(PreprocessError::EmptyBatch))
    ));
  }

  #[tokio::test]
  async fn test_detect_objects_shares_model() {
    let model = Arc::new(fixed_model());
    let (a, b) = tokio::join!(
      detect_objects(model.clone(), vec![image()]),
      detect_objects(model.clone(), vec![image(), image(), image()]),
    );
    assert_eq!(a.unwrap().len(), 1);
    assert_eq!(b.unwrap().len(), 3);
  }

  #[tokio::test]
  async fn test_detect_objects_returns_inputs() {
    let model = Arc::new(fixed_model());
    let wide: ImageBuffer = RgbImage::new(6, 2).into();
    let (images, detections) = detect_objects_keep_images(model, vec![image(), wide])
      .await
      .unwrap();
    assert_eq!(detections.len(), 2);
    let sizes: Vec<_> = images.iter().map(|i| (i.width(), i.height())).collect();
    assert_eq!(sizes, [(4, 4), (6, 2)]);
  }

  #[test]
  fn test_builder_reports_missing_model() {
    let dir = tempfile::tempdir().unwrap();
    let url = Url::parse(&format!("onnx://{}?threshold=0.5", dir.path().display())).unwrap();
    let builder = ObjectDetectionModelBuilder::from_url(&url).unwrap();
    assert_eq!(builder.detection.confidence_threshold, 0.5);
    assert!(matches!(builder.build(), Err(ModelError::ModelMissing(_))));
  }

  #[test]
  fn test_builder_with_engine() {
    let dir = tempfile::tempdir().unwrap();
    let files = ModelFiles::new(dir.path());
    for (path, content) in [
      (files.weights(), "onnx"),
      (files.config(), r#"{"id2label": {"0": "person"}}"#),
      (
        files.preprocessor_config(),
        r#"{"size": {"width": 8, "height": 8}, "do_rescale": false, "rescale_factor": 1.0}"#,
      ),
    ] {
      std::fs::create_dir_all(path.parent().unwrap()).unwrap();
      std::fs::write(path, content).unwrap();
    }

    let model = ObjectDetectionModelBuilder::new(files)
      .engine(Box::new(FixedEngine))
      .build()
      .unwrap();
    assert_eq!(model.model_width(), 8);
    assert_eq!(model.detect(&[image()]).unwrap()[0][0].label, "person");
  }

  #[test]
  fn test_builder_rejects_other_scheme() {
    let url = Url::parse("tflite:///tmp/model").unwrap();
    assert!(matches!(
      ObjectDetectionModelBuilder::from_url(&url),
      Err(ModelError::ModelPathError(_))
    ));
  }

  #[test]
  fn test_threshold_outside_unit_range_is_rejected() {
    for query in ["threshold=1.5", "threshold=-0.1", "threshold=NaN"] {
      let url = Url::parse(&format!("onnx:///tmp/models?{}", query)).unwrap();
      assert!(matches!(
        ObjectDetectionModelBuilder::from_url(&url),
        Err(ModelError::InvalidThreshold(_))
      ));
    }

    assert!(matches!(
      ObjectDetectionModelBuilder::new(ModelFiles::new("/tmp/models"))
        .threshold(f32::NAN)
        .build(),
      Err(ModelError::InvalidThreshold(_))
    ));

    assert_eq!(parse_threshold("0.45"), Ok(0.45));
    assert_eq!(parse_threshold("0"), Ok(0.0));
    assert!(parse_threshold("2").is_err());
    assert!(parse_threshold("high").is_err());
  }
}
