// 该文件是 Tianyan （天眼） 项目的一部分。
// src/output.rs - 结果展示
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

use std::io::Cursor;

use image::{ImageFormat, RgbImage};
use thiserror::Error;

pub mod draw;
mod display;

pub use self::display::{DisplayFrame, DisplaySlot};
pub use self::draw::Draw;

/// 展示一帧标注后的图像
pub trait Render {
  type Error;
  fn show(&self, annotated: &RgbImage, caption: &str) -> Result<(), Self::Error>;
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("图像编码错误: {0}")]
  Encode(#[from] image::ImageError),
  #[error("字体加载错误: {0}")]
  Font(String),
  #[error("IO 错误: {0}")]
  Io(#[from] std::io::Error),
}

/// RGB 图像编码为 JPEG
pub fn encode_jpeg(image: &RgbImage) -> Result<Vec<u8>, OutputError> {
  let mut jpeg_bytes = Cursor::new(Vec::new());
  image.write_to(&mut jpeg_bytes, ImageFormat::Jpeg)?;
  Ok(jpeg_bytes.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn jpeg_has_soi_marker_and_decodes_to_same_size() {
    let image = RgbImage::from_pixel(32, 18, image::Rgb([200, 10, 10]));
    let jpeg = encode_jpeg(&image).unwrap();
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    let decoded = image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (32, 18));
  }
}
