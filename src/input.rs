// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input.rs - 图片/视频/摄像头输入
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

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::frame::Frame;

mod image_source;
pub use self::image_source::{ImageSource, SUPPORTED_IMAGE_EXTENSIONS, check_image_extension};

#[cfg(feature = "gstreamer_input")]
mod camera_source;
#[cfg(feature = "gstreamer_input")]
mod gstreamer_input;
#[cfg(feature = "gstreamer_input")]
mod video_source;
#[cfg(feature = "gstreamer_input")]
pub use self::{
  camera_source::CameraSource,
  gstreamer_input::{
    GStreamerInput, GStreamerInputBuilderItem, GStreamerInputError,
    GStreamerInputPipelineBuilder, GStreamerOpener,
  },
  video_source::VideoSource,
};

#[derive(Error, Debug)]
pub enum InputError {
  #[error("不支持的图片格式: {0}")]
  UnsupportedFormat(String),
  #[error("无法解码: {0}")]
  Decode(String),
  #[error("无法读取图片: {0}")]
  Image(String),
  #[error("采集失败: {0}")]
  Capture(String),
  #[error("IO 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// 输入源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
  Image,
  Video,
  Camera,
}

impl SourceKind {
  pub const ALL: [SourceKind; 3] = [SourceKind::Image, SourceKind::Video, SourceKind::Camera];

  pub fn as_str(&self) -> &'static str {
    match self {
      SourceKind::Image => "image",
      SourceKind::Video => "video",
      SourceKind::Camera => "camera",
    }
  }

  /// 页面上显示的名称
  pub fn label(&self) -> &'static str {
    match self {
      SourceKind::Image => "图像",
      SourceKind::Video => "视频",
      SourceKind::Camera => "摄像头",
    }
  }
}

impl fmt::Display for SourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SourceKind {
  type Err = InputError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "image" => Ok(SourceKind::Image),
      "video" => Ok(SourceKind::Video),
      "camera" => Ok(SourceKind::Camera),
      other => Err(InputError::UnsupportedFormat(other.to_string())),
    }
  }
}

/// 帧序列
///
/// 每次 `next` 读取一帧；返回 `None` 表示输入结束。
/// 采集资源（管道、临时文件）在源被丢弃时释放。
pub trait FrameSource: Iterator<Item = Result<Frame, InputError>> + Send {
  fn source_type(&self) -> SourceKind;
}

/// 打开视频与摄像头输入
///
/// 会话控制器通过该接口创建输入源，测试中可替换为桩实现。
pub trait SourceOpener: Send + Sync {
  /// 打开上传的视频，`filename` 仅用于推断临时文件后缀
  fn open_video(&self, bytes: &[u8], filename: &str) -> Result<Box<dyn FrameSource>, InputError>;

  /// 打开编号为 `index` 的摄像头
  fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, InputError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn source_kind_parses_and_serializes_lowercase() {
    assert_eq!("Camera".parse::<SourceKind>().unwrap(), SourceKind::Camera);
    assert!("rtsp".parse::<SourceKind>().is_err());
    assert_eq!(
      serde_json::to_string(&SourceKind::Video).unwrap(),
      "\"video\""
    );
    assert_eq!(SourceKind::Image.to_string(), "image");
  }
}
