// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/postprocess.rs - logits / pred_boxes 解码为检测结果
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{config::ModelConfig, frame::Tensor};

pub const LOGITS_OUTPUT: &str = "logits";
pub const PRED_BOXES_OUTPUT: &str = "pred_boxes";
pub const CONFIDENCE_THRESHOLD: f32 = 0.3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PostprocessError {
  #[error("张量维度无效: {0}")]
  InvalidTensor(String),
}

fn invalid(msg: impl Into<String>) -> PostprocessError {
  PostprocessError::InvalidTensor(msg.into())
}

/// 单个检测结果，分数保留 3 位小数，坐标取整
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
  pub label: String,
  pub score: String,
  #[serde(rename = "box")]
  pub bbox: [String; 4],
}

impl DetectionResult {
  /// 解析回 `[x1, y1, x2, y2]` 像素坐标
  pub fn pixel_box(&self) -> Option<[f32; 4]> {
    let mut out = [0f32; 4];
    for (slot, value) in out.iter_mut().zip(self.bbox.iter()) {
      *slot = value.parse().ok()?;
    }
    Some(out)
  }
}

/// 数值稳定的 softmax：先减去最大值再取指数，以 f64 计算
pub fn softmax(logits: &[f32]) -> Vec<f64> {
  let max_logit = logits
    .iter()
    .map(|&x| x as f64)
    .fold(f64::NEG_INFINITY, f64::max);
  let exps: Vec<f64> = logits
    .iter()
    .map(|&x| (x as f64 - max_logit).exp())
    .collect();
  let sum: f64 = exps.iter().sum();
  exps.into_iter().map(|x| x / sum).collect()
}

/// 在除最后一个“无目标”类别之外的类别中选出概率最大者
///
/// 概率相同时取下标最小者；只有“无目标”类别时返回 `None`。
pub fn best_object_class(probabilities: &[f64]) -> Option<(usize, f64)> {
  let candidates = probabilities.len().checked_sub(1)?;
  probabilities[..candidates]
    .iter()
    .copied()
    .enumerate()
    .fold(None, |best, (idx, prob)| match best {
      Some((_, best_prob)) if best_prob >= prob => best,
      _ => Some((idx, prob)),
    })
}

/// 置信度严格大于阈值才保留
pub fn passes_threshold(probability: f64, threshold: f32) -> bool {
  probability > threshold as f64
}

/// 四舍五入（远离零），`-0` 输出为 `0`
fn format_coord(value: f64) -> String {
  format!("{:.0}", value.round() + 0.0)
}

struct OutputLayout<'a> {
  batch: usize,
  num_queries: usize,
  num_classes: usize,
  logits: &'a [f32],
  boxes: &'a [f32],
}

fn validate<'a>(output: &'a HashMap<String, Tensor>) -> Result<OutputLayout<'a>, PostprocessError> {
  let logits = output
    .get(LOGITS_OUTPUT)
    .ok_or_else(|| invalid("缺少 logits 输出"))?;
  let boxes = output
    .get(PRED_BOXES_OUTPUT)
    .ok_or_else(|| invalid("缺少 pred_boxes 输出"))?;

  let &[batch, num_queries, num_classes] = logits.dims.as_slice() else {
    return Err(invalid(format!("logits 维度应为 3, 实际为 {:?}", logits.dims)));
  };
  let &[box_batch, box_queries, box_width] = boxes.dims.as_slice() else {
    return Err(invalid(format!(
      "pred_boxes 维度应为 3, 实际为 {:?}",
      boxes.dims
    )));
  };

  if batch == 0 || num_queries == 0 || num_classes == 0 {
    return Err(invalid(format!("logits 维度必须为正数: {:?}", logits.dims)));
  }
  if box_batch != batch || box_queries != num_queries || box_width != 4 {
    return Err(invalid(format!(
      "pred_boxes 维度 {:?} 与 logits 维度 {:?} 不匹配",
      boxes.dims, logits.dims
    )));
  }
  if logits.data.len() != logits.element_count() || boxes.data.len() != boxes.element_count() {
    return Err(invalid(format!(
      "张量数据长度与维度不符: logits {} / {}, pred_boxes {} / {}",
      logits.data.len(),
      logits.element_count(),
      boxes.data.len(),
      boxes.element_count()
    )));
  }

  Ok(OutputLayout {
    batch,
    num_queries,
    num_classes,
    logits: &logits.data,
    boxes: &boxes.data,
  })
}

/// 将模型输出解码为每张图像的检测列表
///
/// 结果按查询顺序排列，不按置信度排序；坐标以模型输入尺寸反归一化。
pub fn postprocess(
  output: &HashMap<String, Tensor>,
  labels: &ModelConfig,
  model_width: u32,
  model_height: u32,
  threshold: f32,
) -> Result<Vec<Vec<DetectionResult>>, PostprocessError> {
  let layout = validate(output)?;
  let (q, c) = (layout.num_queries, layout.num_classes);
  let (model_w, model_h) = (model_width as f64, model_height as f64);

  let mut results = Vec::with_capacity(layout.batch);
  for i in 0..layout.batch {
    let mut detections = Vec::new();
    for j in 0..q {
      let logits_offset = i * q * c + j * c;
      let probabilities = softmax(&layout.logits[logits_offset..logits_offset + c]);

      let Some((class_id, probability)) = best_object_class(&probabilities) else {
        continue;
      };
      if !passes_threshold(probability, threshold) {
        continue;
      }

      let box_offset = i * q * 4 + j * 4;
      let [cx, cy, w, h] = [
        layout.boxes[box_offset] as f64,
        layout.boxes[box_offset + 1] as f64,
        layout.boxes[box_offset + 2] as f64,
        layout.boxes[box_offset + 3] as f64,
      ];
      let x1 = (cx - w / 2.0) * model_w;
      let y1 = (cy - h / 2.0) * model_h;
      let x2 = (cx + w / 2.0) * model_w;
      let y2 = (cy + h / 2.0) * model_h;

      let label = match labels.label(class_id as u32) {
        Some(label) => label.to_string(),
        None => {
          warn!("类别 {} 没有对应的标签", class_id);
          class_id.to_string()
        }
      };

      detections.push(DetectionResult {
        label,
        score: format!("{:.3}", probability),
        bbox: [
          format_coord(x1),
          format_coord(y1),
          format_coord(x2),
          format_coord(y2),
        ],
      });
    }
    debug!("图像 {}: 检测到 {} 个物体", i, detections.len());
    results.push(detections);
  }

  Ok(results)
}
