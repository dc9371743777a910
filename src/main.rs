// 该文件是 Tianyan （天眼） 项目的一部分。
// src/main.rs - 飞机检测仪表盘
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

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use tianyan::{
  args::{Args, Settings},
  input::GStreamerOpener,
  logging::setup_logging,
  model::{Labels, OnnxModelLoader},
  output::Draw,
  server,
  session::SessionController,
};

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();
  setup_logging(args.log_format);

  let settings = Settings::try_from(args).context("配置参数不合法")?;

  info!("Tianyan 飞机检测仪表盘");
  info!("模型目录: {}", settings.model_dir.display());
  info!("可选模型: {}", settings.models.join(", "));
  info!("默认置信度: {}%", settings.default_confidence);
  info!("摄像头: /dev/video{}", settings.camera_index);

  for model in &settings.models {
    let path = settings.model_dir.join(model);
    if !path.is_file() {
      warn!("模型文件不存在: {}", path.display());
    }
  }

  let labels = match &settings.labels {
    Some(path) => Labels::from_file(path)
      .with_context(|| format!("无法读取类别文件: {}", path.display()))?,
    None => Labels::default(),
  };
  let draw = match &settings.font {
    Some(path) => {
      Draw::with_font_file(path).with_context(|| format!("无法加载字体: {}", path.display()))?
    }
    None => Draw::default(),
  };
  if !draw.has_font() {
    warn!("未配置标签字体，检测框只绘制色块");
  }

  let loader = OnnxModelLoader::new(settings.input_size, settings.nms_threshold, labels);
  let opener = GStreamerOpener::new(settings.camera_timeout);
  let session = Arc::new(SessionController::new(
    settings,
    Box::new(loader),
    Arc::new(opener),
    draw,
  ));

  server::serve(session).await.context("网页服务运行失败")?;
  Ok(())
}
