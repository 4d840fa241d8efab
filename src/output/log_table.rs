// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/output/log_table.rs - 以表格形式记录检测结果
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

use std::convert::Infallible;

use tracing::info;

use crate::{
  FromUrlWithScheme,
  output::{NamedImage, Render},
  postprocess::DetectionResult,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogTableOutput;

impl FromUrlWithScheme for LogTableOutput {
  const SCHEME: &'static str = "log";
}

impl crate::FromUrl for LogTableOutput {
  type Error = Infallible;

  fn from_url(_url: &url::Url) -> Result<Self, Self::Error> {
    Ok(LogTableOutput)
  }
}

impl LogTableOutput {
  pub fn table(detections: &[DetectionResult]) -> Vec<String> {
    let label_width = detections
      .iter()
      .map(|d| d.label.chars().count())
      .max()
      .unwrap_or(0)
      .max("label".len());

    let mut rows = Vec::with_capacity(detections.len() + 1);
    rows.push(format!(
      "{:>3} | {:<label_width$} | {:>5} | box",
      "#", "label", "score"
    ));
    for (i, d) in detections.iter().enumerate() {
      rows.push(format!(
        "{:>3} | {:<label_width$} | {:>5} | [{}]",
        i,
        d.label,
        d.score,
        d.bbox.join(", ")
      ));
    }
    rows
  }
}

impl Render<NamedImage, Vec<DetectionResult>> for LogTableOutput {
  type Error = Infallible;

  fn render_result(
    &self,
    frame: &NamedImage,
    result: &Vec<DetectionResult>,
  ) -> Result<(), Self::Error> {
    info!("{} 的检测结果:", frame.name);
    if result.is_empty() {
      info!("没有检测到高置信度的目标");
      return Ok(());
    }
    for row in Self::table(result) {
      info!("{}", row);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_table_rows() {
    let detections = vec![DetectionResult {
      label: "traffic light".to_string(),
      score: "0.912".to_string(),
      bbox: ["1", "2", "30", "40"].map(String::from),
    }];
    let rows = LogTableOutput::table(&detections);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0], "  # | label         | score | box");
    assert_eq!(rows[1], "  0 | traffic light | 0.912 | [1, 2, 30, 40]");
  }
}
