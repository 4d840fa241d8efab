// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/model/engine.rs - 推理引擎适配接口
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

use thiserror::Error;

use crate::frame::{BatchTensor, Tensor};

#[derive(Error, Debug)]
pub enum EngineError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(String),
  #[error("模型输入无效: {0}")]
  InvalidInput(String),
  #[error("推理执行错误: {0}")]
  RunError(String),
  #[error("模型输出无效: {0}")]
  InvalidOutput(String),
}

/// 推理引擎适配器
///
/// 输入一个命名张量，返回全部命名输出张量。实现不做重试。
pub trait InferenceEngine: Send + Sync {
  /// 模型的第一个输入名
  fn input_name(&self) -> &str;

  fn run(
    &self,
    input_name: &str,
    input: &BatchTensor,
  ) -> Result<HashMap<String, Tensor>, EngineError>;
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
  fn input_name(&self) -> &str {
    (**self).input_name()
  }

  fn run(
    &self,
    input_name: &str,
    input: &BatchTensor,
  ) -> Result<HashMap<String, Tensor>, EngineError> {
    (**self).run(input_name, input)
  }
}
