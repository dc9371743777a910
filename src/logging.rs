// 该文件是 Tianyan （天眼） 项目的一部分。
// src/logging.rs - 日志初始化
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

use clap::ValueEnum;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// 日志输出格式
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
  /// 适合开发时阅读的彩色输出
  Pretty,
  /// 适合生产环境采集的 JSON 输出
  Json,
}

/// 初始化全局日志
///
/// 使用 `RUST_LOG` 过滤，未设置时默认 `info`。
pub fn setup_logging(format: LogFormat) {
  let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
  let registry = tracing_subscriber::registry().with(env_filter);

  match format {
    LogFormat::Pretty => registry
      .with(tracing_subscriber::fmt::layer().pretty().with_ansi(true))
      .init(),
    LogFormat::Json => registry
      .with(tracing_subscriber::fmt::layer().json().with_level(true))
      .init(),
  }
}
