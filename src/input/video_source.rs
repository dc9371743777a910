// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/video_source.rs - 视频输入源
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

use std::{io::Write, path::Path, time::Duration};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use super::{FrameSource, GStreamerInput, GStreamerInputPipelineBuilder, InputError, SourceKind};
use crate::frame::Frame;

/// 解码器单帧最长等待时间
const VIDEO_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// 上传视频输入源
///
/// 解码器需要文件路径，上传内容先写入临时文件。
pub struct VideoSource {
  // 字段按声明顺序释放：先停管道，再删临时文件
  input: GStreamerInput,
  spool: NamedTempFile,
}

impl VideoSource {
  pub fn open(bytes: &[u8], filename: &str) -> Result<Self, InputError> {
    if bytes.is_empty() {
      return Err(InputError::Decode(format!("{}: 文件为空", filename)));
    }

    let suffix = Path::new(filename)
      .extension()
      .and_then(|ext| ext.to_str())
      .map(|ext| format!(".{}", ext))
      .unwrap_or_default();
    let mut spool = tempfile::Builder::new()
      .prefix("tianyan-")
      .suffix(&suffix)
      .tempfile()?;
    spool.write_all(bytes)?;
    spool.flush()?;
    debug!(
      "视频已写入临时文件: {}, {} 字节",
      spool.path().display(),
      bytes.len()
    );

    let input = GStreamerInputPipelineBuilder::new()
      .file(spool.path())
      .target_format("RGB")
      .appsink(4, false)
      .read_timeout(VIDEO_READ_TIMEOUT)
      .build()
      .map_err(|e| InputError::Decode(format!("{}: {}", filename, e)))?;

    info!("视频已打开: {}", filename);
    Ok(Self { input, spool })
  }

  pub fn spool_path(&self) -> &Path {
    self.spool.path()
  }
}

impl Iterator for VideoSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self
      .input
      .next()
      .map(|frame| frame.map_err(|e| InputError::Decode(e.to_string())))
  }
}

impl FrameSource for VideoSource {
  fn source_type(&self) -> SourceKind {
    SourceKind::Video
  }
}

#[cfg(test)]
mod tests {
  use gstreamer::{self as gst, prelude::*};

  use super::*;

  /// 用 videotestsrc 生成一段 MJPEG/AVI 视频；缺少插件时返回 None
  fn encode_clip(frames: u32) -> Option<Vec<u8>> {
    gst::init().unwrap();
    let required = [
      "videotestsrc",
      "jpegenc",
      "avimux",
      "filesink",
      "decodebin",
      "avidemux",
      "jpegdec",
      "videoconvert",
      "appsink",
    ];
    for element in required {
      if gst::ElementFactory::find(element).is_none() {
        eprintln!("缺少 GStreamer 元素 {}，跳过", element);
        return None;
      }
    }

    let clip = tempfile::Builder::new().suffix(".avi").tempfile().unwrap();
    let description = format!(
      "videotestsrc num-buffers={} ! video/x-raw,width=64,height=48,framerate=10/1 ! \
       jpegenc ! avimux ! filesink location=\"{}\"",
      frames,
      clip.path().display()
    );
    let pipeline = gst::parse::launch(&description).unwrap();
    pipeline.set_state(gst::State::Playing).unwrap();
    let message = pipeline
      .bus()
      .unwrap()
      .timed_pop_filtered(
        gst::ClockTime::from_seconds(30),
        &[gst::MessageType::Eos, gst::MessageType::Error],
      )
      .unwrap();
    assert!(
      matches!(message.view(), gst::MessageView::Eos(_)),
      "生成测试视频失败: {:?}",
      message
    );
    pipeline.set_state(gst::State::Null).unwrap();
    Some(std::fs::read(clip.path()).unwrap())
  }

  #[test]
  fn decodes_every_frame_then_ends_and_removes_spool() {
    let Some(bytes) = encode_clip(10) else {
      return;
    };

    let mut source = VideoSource::open(&bytes, "clip.avi").unwrap();
    assert_eq!(source.source_type(), SourceKind::Video);
    let spool = source.spool_path().to_path_buf();
    assert!(spool.exists());
    assert_eq!(spool.extension().unwrap(), "avi");

    let mut frames = 0;
    for frame in source.by_ref() {
      let frame = frame.unwrap();
      assert_eq!(frame.image.dimensions(), (64, 48));
      assert_eq!(frame.index, frames);
      frames += 1;
    }
    assert_eq!(frames, 10);
    assert!(source.next().is_none());

    drop(source);
    assert!(!spool.exists());
  }

  #[test]
  fn undecodable_upload_fails_at_open() {
    let result = VideoSource::open(b"this is not a video container", "clip.mp4");
    assert!(matches!(result, Err(InputError::Decode(_))));
  }

  #[test]
  fn empty_upload_is_rejected_before_spooling() {
    let result = VideoSource::open(&[], "empty.mp4");
    assert!(matches!(result, Err(InputError::Decode(_))));
  }
}
