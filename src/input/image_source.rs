// 该文件是 Tianyan （天眼） 项目的一部分。
// src/input/image_source.rs - 图片输入源
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

use std::{io::Cursor, path::Path};

use image::{ImageReader, RgbImage};
use tracing::debug;

use super::{FrameSource, InputError, SourceKind};
use crate::frame::Frame;

/// 接受的图片扩展名
pub const SUPPORTED_IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// 按文件名扩展名检查图片格式（不区分大小写）
pub fn check_image_extension(filename: &str) -> Result<(), InputError> {
  let extension = Path::new(filename)
    .extension()
    .and_then(|ext| ext.to_str())
    .map(str::to_ascii_lowercase)
    .unwrap_or_default();

  if SUPPORTED_IMAGE_EXTENSIONS.contains(&extension.as_str()) {
    Ok(())
  } else {
    Err(InputError::UnsupportedFormat(filename.to_string()))
  }
}

/// 单张图片输入源，只产生一帧
pub struct ImageSource {
  image: Option<RgbImage>,
}

impl ImageSource {
  /// 扩展名决定是否接受，实际格式由内容判断
  pub fn from_bytes(bytes: &[u8], filename: &str) -> Result<Self, InputError> {
    check_image_extension(filename)?;

    let image = ImageReader::new(Cursor::new(bytes))
      .with_guessed_format()?
      .decode()
      .map_err(|e| InputError::Image(format!("{}: {}", filename, e)))?
      .to_rgb8();

    debug!(
      "图片已解码: {}, 尺寸 {}x{}",
      filename,
      image.width(),
      image.height()
    );

    Ok(Self { image: Some(image) })
  }

  pub fn from_image(image: RgbImage) -> Self {
    Self { image: Some(image) }
  }
}

impl Iterator for ImageSource {
  type Item = Result<Frame, InputError>;

  fn next(&mut self) -> Option<Self::Item> {
    self.image.take().map(|image| Ok(Frame::new(image, 0, 0)))
  }
}

impl FrameSource for ImageSource {
  fn source_type(&self) -> SourceKind {
    SourceKind::Image
  }
}

#[cfg(test)]
mod tests {
  use image::{ImageFormat, Rgb};

  use super::*;

  fn encode(format: ImageFormat) -> Vec<u8> {
    let image = RgbImage::from_pixel(8, 6, Rgb([10, 200, 30]));
    let mut bytes = Cursor::new(Vec::new());
    image.write_to(&mut bytes, format).unwrap();
    bytes.into_inner()
  }

  #[test]
  fn extension_check_is_case_insensitive() {
    assert!(check_image_extension("plane.JPG").is_ok());
    assert!(check_image_extension("plane.webp").is_ok());
    assert!(matches!(
      check_image_extension("plane.gif"),
      Err(InputError::UnsupportedFormat(_))
    ));
    assert!(check_image_extension("plane").is_err());
  }

  #[test]
  fn every_supported_format_yields_exactly_one_frame() {
    let cases = [
      ("a.png", ImageFormat::Png),
      ("a.jpg", ImageFormat::Jpeg),
      ("a.jpeg", ImageFormat::Jpeg),
      ("a.bmp", ImageFormat::Bmp),
      ("a.webp", ImageFormat::WebP),
    ];
    for (name, format) in cases {
      let mut source = ImageSource::from_bytes(&encode(format), name).unwrap();
      let frame = source.next().unwrap().unwrap();
      assert_eq!(frame.image.dimensions(), (8, 6));
      assert!(source.next().is_none(), "{} 应只产生一帧", name);
    }
  }

  #[test]
  fn content_decides_decoding_not_extension() {
    // PNG 内容但扩展名为 jpg
    let mut source = ImageSource::from_bytes(&encode(ImageFormat::Png), "a.jpg").unwrap();
    assert!(source.next().unwrap().is_ok());
  }

  #[test]
  fn garbage_bytes_are_an_image_error() {
    let result = ImageSource::from_bytes(b"not an image", "broken.png");
    assert!(matches!(result, Err(InputError::Image(_))));
  }
}
