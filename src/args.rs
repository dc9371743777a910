// 该文件是 Tianyan （天眼） 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use thiserror::Error;

use crate::{
  logging::LogFormat,
  model::{CONFIDENCE_PERCENT_MAX, CONFIDENCE_PERCENT_MIN},
};

/// Tianyan 项目参数配置
///
/// 所有参数都有默认值，不带任何参数即可启动。
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 网页服务监听地址
  #[arg(
    long,
    env = "TIANYAN_BIND",
    default_value = "0.0.0.0:8501",
    value_name = "ADDR"
  )]
  pub bind: SocketAddr,

  /// 检测模型所在目录
  #[arg(
    long,
    env = "TIANYAN_MODEL_DIR",
    default_value = "weights/detection",
    value_name = "DIR"
  )]
  pub model_dir: PathBuf,

  /// 可供选择的模型文件名（逗号分隔或多次指定）
  #[arg(
    long = "model",
    env = "TIANYAN_MODELS",
    value_delimiter = ',',
    default_values = ["yolov8n.onnx", "yolov8s.onnx", "yolov8m.onnx"],
    value_name = "FILE"
  )]
  pub models: Vec<String>,

  /// 默认置信度（百分比，30 - 100）
  #[arg(
    long,
    env = "TIANYAN_CONFIDENCE",
    default_value_t = 50,
    value_parser = clap::value_parser!(u8).range((CONFIDENCE_PERCENT_MIN as i64)..=(CONFIDENCE_PERCENT_MAX as i64)),
    value_name = "PERCENT"
  )]
  pub confidence: u8,

  /// 摄像头设备编号
  #[arg(long, env = "TIANYAN_CAMERA", default_value_t = 0, value_name = "INDEX")]
  pub camera: u32,

  /// 摄像头读取超时（毫秒），超时视为采集失败
  #[arg(
    long,
    env = "TIANYAN_CAMERA_TIMEOUT_MS",
    default_value_t = 5000,
    value_name = "MILLIS"
  )]
  pub camera_timeout_ms: u64,

  /// 模型输入尺寸（正方形边长）
  #[arg(long, env = "TIANYAN_INPUT_SIZE", default_value_t = 640, value_name = "PIXELS")]
  pub input_size: u32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(
    long,
    env = "TIANYAN_NMS_THRESHOLD",
    default_value_t = 0.45,
    value_name = "THRESHOLD"
  )]
  pub nms_threshold: f32,

  /// 类别名称文件（每行一个），缺省使用 COCO 类别
  #[arg(long, env = "TIANYAN_LABELS", value_name = "FILE")]
  pub labels: Option<PathBuf>,

  /// 标签字体文件（TTF/OTF），缺省时只绘制色块不绘制文字
  #[arg(long, env = "TIANYAN_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 上传文件大小上限（MiB）
  #[arg(
    long,
    env = "TIANYAN_MAX_UPLOAD_MB",
    default_value_t = 512,
    value_name = "MIB"
  )]
  pub max_upload_mb: usize,

  /// 日志格式
  #[arg(
    long,
    env = "TIANYAN_LOG_FORMAT",
    value_enum,
    default_value_t = LogFormat::Pretty
  )]
  pub log_format: LogFormat,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
  #[error("模型列表为空")]
  EmptyModelList,
  #[error("模型文件名不合法: {0}")]
  InvalidModelName(String),
  #[error("NMS 阈值必须在 0.0 - 1.0 之间, 实际为 {0}")]
  InvalidNmsThreshold(f32),
  #[error("模型输入尺寸必须大于 0")]
  InvalidInputSize,
  #[error("上传大小上限必须大于 0")]
  InvalidUploadLimit,
}

/// 校验后的运行配置
#[derive(Debug, Clone)]
pub struct Settings {
  pub bind: SocketAddr,
  pub model_dir: PathBuf,
  pub models: Vec<String>,
  pub default_confidence: u8,
  pub camera_index: u32,
  pub camera_timeout: Duration,
  pub input_size: u32,
  pub nms_threshold: f32,
  pub labels: Option<PathBuf>,
  pub font: Option<PathBuf>,
  pub max_upload_bytes: usize,
}

impl Default for Settings {
  /// 与命令行默认值一致，不读取环境变量
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([0, 0, 0, 0], 8501)),
      model_dir: PathBuf::from("weights/detection"),
      models: vec![
        "yolov8n.onnx".to_string(),
        "yolov8s.onnx".to_string(),
        "yolov8m.onnx".to_string(),
      ],
      default_confidence: 50,
      camera_index: 0,
      camera_timeout: Duration::from_secs(5),
      input_size: 640,
      nms_threshold: 0.45,
      labels: None,
      font: None,
      max_upload_bytes: 512 * 1024 * 1024,
    }
  }
}

impl TryFrom<Args> for Settings {
  type Error = ConfigError;

  fn try_from(args: Args) -> Result<Self, Self::Error> {
    if args.models.is_empty() {
      return Err(ConfigError::EmptyModelList);
    }
    // 模型只能是目录下的文件名，不允许路径穿越
    if let Some(name) = args
      .models
      .iter()
      .find(|name| name.is_empty() || name.contains('/') || name.contains('\\') || *name == "..")
    {
      return Err(ConfigError::InvalidModelName(name.clone()));
    }
    if !(0.0..=1.0).contains(&args.nms_threshold) {
      return Err(ConfigError::InvalidNmsThreshold(args.nms_threshold));
    }
    if args.input_size == 0 {
      return Err(ConfigError::InvalidInputSize);
    }
    if args.max_upload_mb == 0 {
      return Err(ConfigError::InvalidUploadLimit);
    }

    Ok(Settings {
      bind: args.bind,
      model_dir: args.model_dir,
      models: args.models,
      default_confidence: args.confidence,
      camera_index: args.camera,
      camera_timeout: Duration::from_millis(args.camera_timeout_ms),
      input_size: args.input_size,
      nms_threshold: args.nms_threshold,
      labels: args.labels,
      font: args.font,
      max_upload_bytes: args.max_upload_mb * 1024 * 1024,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(extra: &[&str]) -> Result<Args, clap::Error> {
    let mut argv = vec!["tianyan"];
    argv.extend_from_slice(extra);
    Args::try_parse_from(argv)
  }

  #[test]
  fn defaults_need_no_flags() {
    let settings = Settings::try_from(parse(&[]).unwrap()).unwrap();
    assert_eq!(settings.bind.port(), 8501);
    assert_eq!(settings.models.len(), 3);
    assert_eq!(settings.default_confidence, 50);
    assert_eq!(settings.camera_index, 0);
    assert_eq!(settings.input_size, 640);
    assert_eq!(settings.max_upload_bytes, 512 * 1024 * 1024);
  }

  #[test]
  fn models_accept_comma_list() {
    let args = parse(&["--model", "plane.onnx,plane-s.onnx"]).unwrap();
    assert_eq!(args.models, vec!["plane.onnx", "plane-s.onnx"]);
  }

  #[test]
  fn confidence_outside_slider_range_is_rejected() {
    assert!(parse(&["--confidence", "29"]).is_err());
    assert!(parse(&["--confidence", "101"]).is_err());
    assert!(parse(&["--confidence", "100"]).is_ok());
  }

  #[test]
  fn model_names_cannot_escape_model_dir() {
    let args = parse(&["--model", "../secret.onnx"]).unwrap();
    assert_eq!(
      Settings::try_from(args).unwrap_err(),
      ConfigError::InvalidModelName("../secret.onnx".to_string())
    );
  }

  #[test]
  fn nms_threshold_must_be_a_ratio() {
    let args = parse(&["--nms-threshold", "1.5"]).unwrap();
    assert_eq!(
      Settings::try_from(args).unwrap_err(),
      ConfigError::InvalidNmsThreshold(1.5)
    );
  }
}
