// 该文件是 Tianyan （天眼） 项目的一部分。
// src/frame.rs - 帧定义
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

//! 所有帧统一使用 RGB 通道顺序：采集管道输出 RGB，模型输入 RGB，
//! 绘制与 JPEG 编码也按 RGB 处理。

use image::{RgbImage, imageops::FilterType};

const RGB_CHANNELS: usize = 3;

/// 视频/摄像头帧推理前统一缩放到的宽度
pub const STREAM_WIDTH: u32 = 720;
/// 视频/摄像头帧推理前统一缩放到的高度（16:9）
pub const STREAM_HEIGHT: u32 = STREAM_WIDTH * 9 / 16;

/// 一帧图像
#[derive(Debug, Clone)]
pub struct Frame {
  /// RGB 图像数据
  pub image: RgbImage,
  /// 帧索引
  pub index: u64,
  /// 时间戳（毫秒）
  pub timestamp_ms: u64,
}

impl Frame {
  pub fn new(image: RgbImage, index: u64, timestamp_ms: u64) -> Self {
    Self {
      image,
      index,
      timestamp_ms,
    }
  }
}

/// 推理前的尺寸处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScale {
  /// 保持原始分辨率（单张图片）
  Native,
  /// 缩放到 720x405（视频/摄像头）
  Stream,
}

impl FrameScale {
  /// 按需缩放，`Native` 时不复制图像
  pub fn apply<'a>(&self, image: &'a RgbImage) -> std::borrow::Cow<'a, RgbImage> {
    match self {
      FrameScale::Native => std::borrow::Cow::Borrowed(image),
      FrameScale::Stream => {
        if image.dimensions() == (STREAM_WIDTH, STREAM_HEIGHT) {
          std::borrow::Cow::Borrowed(image)
        } else {
          std::borrow::Cow::Owned(image::imageops::resize(
            image,
            STREAM_WIDTH,
            STREAM_HEIGHT,
            FilterType::Triangle,
          ))
        }
      }
    }
  }
}

/// 模型输入张量，NCHW 排列，取值归一化到 0..1
#[derive(Debug, Clone)]
pub struct RgbNchwTensor {
  data: Box<[f32]>,
  height: usize,
  width: usize,
}

impl RgbNchwTensor {
  /// 将图像缩放到 `width` x `height` 后转为 NCHW 张量
  pub fn from_image(image: &RgbImage, width: u32, height: u32) -> Self {
    let resized;
    let image = if image.dimensions() == (width, height) {
      image
    } else {
      resized = image::imageops::resize(image, width, height, FilterType::Triangle);
      &resized
    };

    let (width, height) = (width as usize, height as usize);
    let plane = width * height;
    let mut data = vec![0f32; RGB_CHANNELS * plane];
    for (index, pixel) in image.as_raw().chunks_exact(RGB_CHANNELS).enumerate() {
      for c in 0..RGB_CHANNELS {
        data[c * plane + index] = pixel[c] as f32 / 255.0;
      }
    }

    Self {
      data: data.into_boxed_slice(),
      height,
      width,
    }
  }

  /// 张量形状 `[1, 3, H, W]`
  pub fn shape(&self) -> [usize; 4] {
    [1, RGB_CHANNELS, self.height, self.width]
  }

  pub fn as_slice(&self) -> &[f32] {
    &self.data
  }

  pub fn into_data(self) -> Box<[f32]> {
    self.data
  }
}
