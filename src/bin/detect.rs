// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/bin/detect.rs - 对图像文件运行一次检测
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use liaowang::{
  FromUrl,
  asset::{AssetResolver, DEFAULT_ORIGIN},
  frame::ImageBuffer,
  model::{DetectionConfig, detect_objects_keep_images, parse_threshold},
  output::{NamedImage, OutputWrapper, Render},
  postprocess::CONFIDENCE_THRESHOLD,
};

/// 加载模型并对图像文件运行检测，可用于预热
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型根目录
  #[arg(long, env = "LIAOWANG_MODELS_DIR", value_name = "DIR")]
  pub models_dir: PathBuf,
  /// 模型文件下载地址
  #[arg(long, env = "LIAOWANG_ASSET_ORIGIN", default_value = DEFAULT_ORIGIN, value_name = "URL")]
  pub origin: Url,
  /// 置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value_t = CONFIDENCE_THRESHOLD, value_parser = parse_threshold, value_name = "THRESHOLD")]
  pub threshold: f32,
  /// 输出方式，可多次指定
  /// - log:// 以表格形式打印结果
  /// - image:///path/to/dir 保存标注后的图像
  #[arg(long, default_value = "log://", value_name = "OUTPUT")]
  pub output: Vec<Url>,
  /// 不下载缺失的模型文件
  #[arg(long)]
  pub offline: bool,
  /// 图像文件
  #[arg(required = true, value_name = "IMAGE")]
  pub images: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型目录: {}", args.models_dir.display());
  info!("图像数量: {}", args.images.len());

  let resolver = AssetResolver::with_http(args.origin.clone(), &args.models_dir)?;
  if !args.offline {
    resolver.ensure_assets().await?;
  }

  let detection = DetectionConfig::with_threshold(args.threshold)?;
  let model = Arc::new(resolver.load_model(detection).await?);

  let outputs = args
    .output
    .iter()
    .map(|url| {
      OutputWrapper::from_url(url)
        .map(|output| output.with_model_size(model.model_width(), model.model_height()))
    })
    .collect::<Result<Vec<_>, _>>()?;

  let images = args
    .images
    .iter()
    .map(ImageBuffer::open)
    .collect::<Result<Vec<_>, _>>()?;

  info!("开始推理...");
  let now = std::time::Instant::now();
  let (images, results) = detect_objects_keep_images(model, images).await?;
  info!("推理完成，耗时: {:.2?}", now.elapsed());

  for ((path, image), detections) in args.images.iter().zip(images).zip(results) {
    let frame = NamedImage {
      name: path.display().to_string(),
      image,
    };
    for output in &outputs {
      output.render_result(&frame, &detections)?;
    }
  }

  Ok(())
}
