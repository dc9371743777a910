// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/camera_source.rs - 摄像头输入源
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

use std::time::Duration;

use tracing::info;

use super::{FrameSource, GStreamerInput, GStreamerInputPipelineBuilder, InputError, SourceKind};
use crate::frame::Frame;

/// V4L2 摄像头输入源
///
/// 有意丢帧：appsink 只保留最新一帧（`max-buffers=1 drop=true`），推理慢于
/// 采集时旧帧被丢弃，每次读取得到的都是当前画面。循环本身仍是串行的
/// 采集、推理、展示，不另设队列。
pub struct CameraSource {
  device: String,
  input: GStreamerInput,
}

impl CameraSource {
  pub fn open(index: u32, timeout: Duration) -> Result<Self, InputError> {
    let device = format!("/dev/video{}", index);
    let input = Self::pipeline(&device, timeout)
      .build()
      .map_err(|e| InputError::Capture(format!("{}: {}", device, e)))?;

    info!("摄像头已打开: {}", device);
    Ok(Self { device, input })
  }

  fn pipeline(device: &str, timeout: Duration) -> GStreamerInputPipelineBuilder {
    GStreamerInputPipelineBuilder::new()
      .camera(device)
      .target_format("RGB")
      .appsink(1, true)
      .read_timeout(timeout)
  }
}

impl Iterator for CameraSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    match self.input.next() {
      Some(frame) => Some(frame.map_err(|e| InputError::Capture(format!("{}: {}", self.device, e)))),
      // 摄像头不会正常结束，流结束视为断开
      None => Some(Err(InputError::Capture(format!("{}: 设备已断开", self.device)))),
    }
  }
}

impl FrameSource for CameraSource {
  fn source_type(&self) -> SourceKind {
    SourceKind::Camera
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn camera_keeps_only_the_newest_buffer() {
    let description = CameraSource::pipeline("/dev/video2", Duration::from_secs(5)).description();
    assert!(description.starts_with("v4l2src device=/dev/video2 ! "));
    assert!(description.contains("format=RGB"));
    assert!(description.ends_with("max-buffers=1 drop=true"));
  }
}
