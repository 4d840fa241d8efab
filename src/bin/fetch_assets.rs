// 该文件是 Liaowang （瞭望） 项目的一部分。
// src/bin/fetch_assets.rs - 下载模型文件
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

use anyhow::Result;
use clap::Parser;
use tracing::info;
use url::Url;

use liaowang::asset::{AssetResolver, DEFAULT_ORIGIN, MODEL_FILES};

/// 下载缺失的模型文件，已存在的文件不会被覆盖
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型根目录
  #[arg(long, env = "LIAOWANG_MODELS_DIR", value_name = "DIR")]
  pub models_dir: PathBuf,
  /// 模型文件下载地址
  #[arg(long, env = "LIAOWANG_ASSET_ORIGIN", default_value = DEFAULT_ORIGIN, value_name = "URL")]
  pub origin: Url,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();
  info!("下载地址: {}", args.origin);

  let resolver = AssetResolver::with_http(args.origin, &args.models_dir)?;
  resolver.ensure_assets().await?;

  for relative in MODEL_FILES {
    info!("{}", resolver.files().local_path(relative).display());
  }

  Ok(())
}
