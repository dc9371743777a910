// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/gstreamer_input.rs - GStreamer 输入
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

//! # GStreamer 视频输入模块
//!
//! 视频文件和摄像头都通过 GStreamer 管道解码，末端为名为 `sink` 的
//! appsink，输出 RGB 帧。
//!
//! ## 系统依赖
//!
//! **Ubuntu/Debian:**
//! ```bash
//! sudo apt-get install libgstreamer1.0-dev libgstreamer-plugins-base1.0-dev \
//!   gstreamer1.0-plugins-good gstreamer1.0-libav
//! ```
//!
//! ## Pipeline Builder
//!
//! ```no_run
//! use std::time::Duration;
//! use tianyan::input::GStreamerInputPipelineBuilder;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let input = GStreamerInputPipelineBuilder::new()
//!     .camera("/dev/video0")
//!     .target_format("RGB")
//!     .appsink(1, true)
//!     .read_timeout(Duration::from_secs(5))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use std::{
  path::Path,
  time::{Duration, Instant},
};

use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{CameraSource, FrameSource, InputError, SourceOpener, VideoSource};
use crate::frame::Frame;

/// 单次拉取等待时间，超时后检查总线错误与结束标志
const PULL_INTERVAL: Duration = Duration::from_millis(200);

/// GStreamer 输入错误类型
#[derive(Error, Debug)]
pub enum GStreamerInputError {
  /// GStreamer 库错误
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  /// GStreamer 布尔操作错误
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  /// 无法获取 appsink 元素
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  /// 无法转换元素为 appsink
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  /// 无法从 caps 获取视频信息
  #[error("Failed to get video info from caps")]
  VideoInfoError,
  /// 不支持的视频格式
  #[error("Unsupported video format: {0}")]
  UnsupportedFormat(String),
  /// 管道错误
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  /// 缓冲区大小不匹配
  #[error("Buffer size mismatch: expected {expected} bytes, got {actual} bytes")]
  BufferSizeMismatch { expected: usize, actual: usize },
  /// 状态改变错误
  #[error("State change error: {0}")]
  StateChangeError(#[from] gst::StateChangeError),
  /// 超时未收到帧
  #[error("No frame within {0:?}")]
  Timeout(Duration),
}

/// 管道中的一段
#[derive(Debug, Clone, PartialEq)]
pub enum GStreamerInputBuilderItem {
  FileSource(String),
  CameraSource { device: String },
  TargetFormat { format: String },
  AppSink { max_buffers: u32, drop: bool },
}

impl GStreamerInputBuilderItem {
  fn to_pipeline(&self) -> String {
    match self {
      GStreamerInputBuilderItem::FileSource(path) => {
        format!(
          "filesrc location=\"{}\" ! decodebin",
          path.replace('\\', "\\\\").replace('"', "\\\"")
        )
      }
      GStreamerInputBuilderItem::CameraSource { device } => {
        format!("v4l2src device={}", device)
      }
      GStreamerInputBuilderItem::TargetFormat { format } => {
        format!("videoconvert ! video/x-raw,format={}", format)
      }
      GStreamerInputBuilderItem::AppSink { max_buffers, drop } => {
        format!(
          "appsink name=sink sync=false max-buffers={} drop={}",
          max_buffers, drop
        )
      }
    }
  }
}

/// GStreamer 输入管道构建器
#[derive(Debug, Default)]
pub struct GStreamerInputPipelineBuilder {
  items: Vec<GStreamerInputBuilderItem>,
  read_timeout: Option<Duration>,
}

impl GStreamerInputPipelineBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn file(mut self, path: &Path) -> Self {
    self
      .items
      .push(GStreamerInputBuilderItem::FileSource(path.display().to_string()));
    self
  }

  pub fn camera(mut self, device: &str) -> Self {
    self.items.push(GStreamerInputBuilderItem::CameraSource {
      device: device.to_string(),
    });
    self
  }

  pub fn target_format(mut self, format: &str) -> Self {
    self.items.push(GStreamerInputBuilderItem::TargetFormat {
      format: format.to_string(),
    });
    self
  }

  /// `drop` 为真时 appsink 只保留最新的缓冲
  pub fn appsink(mut self, max_buffers: u32, drop: bool) -> Self {
    self
      .items
      .push(GStreamerInputBuilderItem::AppSink { max_buffers, drop });
    self
  }

  /// 读取一帧的最长等待时间，`None` 表示一直等待
  pub fn read_timeout(mut self, timeout: Duration) -> Self {
    self.read_timeout = Some(timeout);
    self
  }

  pub fn description(&self) -> String {
    let mut items = self.items.clone();
    if !items
      .iter()
      .any(|item| matches!(item, GStreamerInputBuilderItem::AppSink { .. }))
    {
      items.push(GStreamerInputBuilderItem::AppSink {
        max_buffers: 2,
        drop: false,
      });
    }
    items
      .iter()
      .map(GStreamerInputBuilderItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ")
  }

  pub fn build(self) -> Result<GStreamerInput, GStreamerInputError> {
    gst::init()?;

    let description = self.description();
    info!("GStreamer 管道: {}", description);

    let pipeline = gst::parse::launch(&description)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerInputError::PipelineError("无法创建管道".to_string()))?;

    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerInputError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerInputError::AppSinkConversionFailed)?;

    // 先构造再启动，启动失败时由 Drop 把管道置为 Null
    let input = GStreamerInput {
      pipeline,
      appsink,
      read_timeout: self.read_timeout,
      index: 0,
      finished: false,
    };
    input.start()?;
    Ok(input)
  }
}

/// GStreamer 帧输入
///
/// 迭代产生 RGB 帧；流结束返回 `None`，管道错误或超时返回一次错误后结束。
pub struct GStreamerInput {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  read_timeout: Option<Duration>,
  index: u64,
  finished: bool,
}

impl Drop for GStreamerInput {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("无法停止 GStreamer 管道: {}", e);
    } else {
      debug!("GStreamer 管道已停止");
    }
  }
}

impl GStreamerInput {
  fn start(&self) -> Result<(), GStreamerInputError> {
    if let Err(e) = self.pipeline.set_state(gst::State::Playing) {
      return Err(self.bus_error().unwrap_or(e.into()));
    }

    // 等待管道完成预卷；解码器打不开文件时在这里失败
    let wait = self.read_timeout.unwrap_or(Duration::from_secs(30));
    let (result, _, _) = self
      .pipeline
      .state(gst::ClockTime::from_mseconds(wait.as_millis() as u64));
    if let Err(e) = result {
      return Err(self.bus_error().unwrap_or(e.into()));
    }
    Ok(())
  }

  /// 取出总线上的错误消息
  fn bus_error(&self) -> Option<GStreamerInputError> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error])?;
    match message.view() {
      gst::MessageView::Error(err) => Some(GStreamerInputError::PipelineError(format!(
        "{} ({})",
        err.error(),
        err
          .debug()
          .map(|d| d.to_string())
          .unwrap_or_else(|| "无调试信息".to_string())
      ))),
      _ => None,
    }
  }

  fn pull(&mut self) -> Option<Result<Frame, GStreamerInputError>> {
    let started = Instant::now();
    loop {
      if let Some(sample) = self
        .appsink
        .try_pull_sample(gst::ClockTime::from_mseconds(PULL_INTERVAL.as_millis() as u64))
      {
        let index = self.index;
        self.index += 1;
        return Some(sample_to_frame(&sample, index));
      }

      if let Some(err) = self.bus_error() {
        return Some(Err(err));
      }
      if self.appsink.is_eos() {
        return None;
      }
      if let Some(timeout) = self.read_timeout
        && started.elapsed() >= timeout
      {
        return Some(Err(GStreamerInputError::Timeout(timeout)));
      }
    }
  }
}

impl Iterator for GStreamerInput {
  type Item = Result<Frame, GStreamerInputError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.finished {
      return None;
    }
    let item = self.pull();
    if !matches!(item, Some(Ok(_))) {
      self.finished = true;
    }
    item
  }
}

fn sample_to_frame(sample: &gst::Sample, index: u64) -> Result<Frame, GStreamerInputError> {
  let buffer = sample
    .buffer()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有缓冲".to_string()))?;
  let caps = sample
    .caps()
    .ok_or_else(|| GStreamerInputError::PipelineError("样本中没有 caps".to_string()))?;
  let info =
    gst_video::VideoInfo::from_caps(caps).map_err(|_| GStreamerInputError::VideoInfoError)?;

  let bgr = match info.format() {
    gst_video::VideoFormat::Rgb => false,
    gst_video::VideoFormat::Bgr => true,
    other => {
      return Err(GStreamerInputError::UnsupportedFormat(format!(
        "{:?}",
        other
      )));
    }
  };

  let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)?;
  let width = frame.width();
  let height = frame.height();
  let stride = frame.plane_stride()[0] as usize;
  let data = frame.plane_data(0)?;

  // 每行末尾可能有对齐填充
  let row = width as usize * 3;
  let expected = stride * (height as usize).saturating_sub(1) + row;
  if data.len() < expected {
    return Err(GStreamerInputError::BufferSizeMismatch {
      expected,
      actual: data.len(),
    });
  }

  let mut pixels = Vec::with_capacity(row * height as usize);
  for y in 0..height as usize {
    let line = &data[y * stride..y * stride + row];
    if bgr {
      for px in line.chunks_exact(3) {
        pixels.extend_from_slice(&[px[2], px[1], px[0]]);
      }
    } else {
      pixels.extend_from_slice(line);
    }
  }

  let image = RgbImage::from_raw(width, height, pixels).ok_or_else(|| {
    GStreamerInputError::PipelineError("无法构造 RGB 图像".to_string())
  })?;
  let timestamp_ms = buffer.pts().map(|pts| pts.mseconds()).unwrap_or(0);

  Ok(Frame::new(image, index, timestamp_ms))
}

/// 基于 GStreamer 的输入打开器
#[derive(Debug, Clone)]
pub struct GStreamerOpener {
  camera_timeout: Duration,
}

impl GStreamerOpener {
  pub fn new(camera_timeout: Duration) -> Self {
    Self { camera_timeout }
  }
}

impl SourceOpener for GStreamerOpener {
  fn open_video(&self, bytes: &[u8], filename: &str) -> Result<Box<dyn FrameSource>, InputError> {
    Ok(Box::new(VideoSource::open(bytes, filename)?))
  }

  fn open_camera(&self, index: u32) -> Result<Box<dyn FrameSource>, InputError> {
    Ok(Box::new(CameraSource::open(index, self.camera_timeout)?))
  }
}
