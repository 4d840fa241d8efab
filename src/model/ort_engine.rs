// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/ort_engine.rs - ONNX Runtime 推理引擎
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

use std::{borrow::Cow, collections::HashMap, path::Path, sync::Mutex};

use ort::{
  logging::LogLevel,
  session::{Session, SessionInputs},
  value::TensorRef,
};
use tracing::{debug, info};

use crate::{
  frame::{BatchTensor, Tensor},
  model::engine::{EngineError, InferenceEngine},
};

pub struct OrtEngine {
  session: Mutex<Session>,
  input_name: String,
  output_names: Vec<String>,
}

impl OrtEngine {
  pub fn load(model_path: impl AsRef<Path>) -> Result<Self, EngineError> {
    let path = model_path.as_ref();
    info!("加载模型文件: {}", path.display());

    let load_error = |e: ort::Error| EngineError::ModelLoadError(format!("{}: {}", path.display(), e));
    let builder = Session::builder()
      .map_err(load_error)?
      .with_log_level(LogLevel::Error)
      .map_err(load_error)?;
    let session = builder.commit_from_file(path).map_err(load_error)?;

    let input_name = session
      .inputs()
      .first()
      .map(|i| i.name().to_string())
      .ok_or_else(|| EngineError::ModelLoadError("模型没有输入".to_string()))?;
    let output_names: Vec<String> = session
      .outputs()
      .iter()
      .map(|o| o.name().to_string())
      .collect();

    debug!("模型输入: {}", input_name);
    debug!("模型输出: {:?}", output_names);
    info!("模型加载完成");

    Ok(Self {
      session: Mutex::new(session),
      input_name,
      output_names,
    })
  }
}

impl InferenceEngine for OrtEngine {
  fn input_name(&self) -> &str {
    &self.input_name
  }

  fn run(
    &self,
    input_name: &str,
    input: &BatchTensor,
  ) -> Result<HashMap<String, Tensor>, EngineError> {
    let dims: Vec<i64> = input.shape().iter().map(|&d| d as i64).collect();
    let tensor = TensorRef::from_array_view((dims, input.as_slice()))
      .map_err(|e| EngineError::InvalidInput(e.to_string()))?;

    let mut session = self
      .session
      .lock()
      .map_err(|_| EngineError::RunError("会话锁已损坏".to_string()))?;

    let inputs: SessionInputs<'_, '_, 0> =
      SessionInputs::ValueMap(vec![(Cow::Borrowed(input_name), tensor.into())]);
    let outputs = session
      .run(inputs)
      .map_err(|e| EngineError::RunError(e.to_string()))?;

    let mut results = HashMap::with_capacity(self.output_names.len());
    for name in &self.output_names {
      let (shape, data) = outputs[name.as_str()]
        .try_extract_tensor::<f32>()
        .map_err(|e| EngineError::InvalidOutput(format!("{}: {}", name, e)))?;
      let dims = shape
        .iter()
        .map(|&d| usize::try_from(d))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| EngineError::InvalidOutput(format!("{} 的维度为负数", name)))?;
      results.insert(name.clone(), Tensor::new(dims, data.to_vec()));
    }

    Ok(results)
  }
}
