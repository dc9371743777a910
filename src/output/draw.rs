// 该文件是 Tianyan （天眼） 项目的一部分。
// src/output/draw.rs - 目标检测结果可视化
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

use std::path::Path;

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size},
  rect::Rect,
};
use tracing::info;

use super::OutputError;
use crate::model::BoundingBox;

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_TEXT_HEIGHT: u32 = 22;
const LABEL_CHAR_WIDTH: f32 = 9.0; // 无字体时按字符数估算标签宽度
const LABEL_TEXT_PADDING: i32 = 2;
const PALETTE_SIZE: usize = 80;

/// 检测框绘制样式
///
/// 每个类别一种颜色，颜色在 HSV 色环上均匀分布。未配置字体时只绘制标签底色。
pub struct Draw {
  font: Option<FontArc>,
  font_scale: PxScale,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| {
        let hue = (i as f32 / PALETTE_SIZE as f32) * 360.0;
        hsv_to_rgb(hue, 0.8, 0.9)
      })
      .collect();

    Self {
      font: None,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }
}

impl Draw {
  /// 使用字体文件绘制标签文字
  pub fn with_font_file(path: &Path) -> Result<Self, OutputError> {
    let data = std::fs::read(path)?;
    let font = FontArc::try_from_vec(data)
      .map_err(|e| OutputError::Font(format!("{}: {}", path.display(), e)))?;
    info!("标签字体已加载: {}", path.display());
    Ok(Self {
      font: Some(font),
      ..Self::default()
    })
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color(&self, class_id: usize) -> Rgb<u8> {
    self.colors[class_id % self.colors.len()]
  }

  /// 复制一份图像并绘制检测结果
  pub fn annotate(&self, image: &RgbImage, boxes: &[BoundingBox]) -> RgbImage {
    let mut annotated = image.clone();
    self.draw_detections(&mut annotated, boxes);
    annotated
  }

  pub fn draw_detections(&self, image: &mut RgbImage, boxes: &[BoundingBox]) {
    for bbox in boxes {
      self.draw_bbox_with_label(image, bbox);
    }
  }

  fn draw_bbox_with_label(&self, image: &mut RgbImage, bbox: &BoundingBox) {
    let (w, h) = (image.width() as i32, image.height() as i32);
    if w == 0 || h == 0 {
      return;
    }

    let x_min = (bbox.x1.floor() as i32).clamp(0, w - 1);
    let y_min = (bbox.y1.floor() as i32).clamp(0, h - 1);
    let x_max = (bbox.x2.ceil() as i32).clamp(0, w - 1);
    let y_max = (bbox.y2.ceil() as i32).clamp(0, h - 1);
    if x_min >= x_max || y_min >= y_max {
      return;
    }

    let color = self.color(bbox.class_id);
    let width = (x_max - x_min + 1) as u32;
    let height = (y_max - y_min + 1) as u32;

    // 边框加粗为 2 像素
    draw_hollow_rect_mut(image, Rect::at(x_min, y_min).of_size(width, height), color);
    if width > 2 && height > 2 {
      draw_hollow_rect_mut(
        image,
        Rect::at(x_min + 1, y_min + 1).of_size(width - 2, height - 2),
        color,
      );
    }

    let label = format!("{} {:.2}", bbox.label, bbox.confidence);
    let text_width = match &self.font {
      Some(font) => text_size(self.font_scale, font, &label).0 + 2 * LABEL_TEXT_PADDING as u32,
      None => (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32,
    };

    // 标签放在边框上方，贴近图像顶部时放到框内
    let label_x = x_min;
    let label_y = (y_min - LABEL_TEXT_HEIGHT as i32).max(0);
    let label_width = text_width.min((w - label_x) as u32);
    if label_width == 0 {
      return;
    }

    draw_filled_rect_mut(
      image,
      Rect::at(label_x, label_y).of_size(label_width, LABEL_TEXT_HEIGHT),
      color,
    );
    if let Some(font) = &self.font {
      draw_text_mut(
        image,
        Rgb([255, 255, 255]),
        label_x + LABEL_TEXT_PADDING,
        label_y + LABEL_TEXT_PADDING,
        self.font_scale,
        font,
        &label,
      );
    }
  }
}

/// HSV 转 RGB
fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bbox(x1: f32, y1: f32, x2: f32, y2: f32, class_id: usize) -> BoundingBox {
    BoundingBox {
      x1,
      y1,
      x2,
      y2,
      class_id,
      label: "airplane".to_string(),
      confidence: 0.87,
    }
  }

  #[test]
  fn hsv_primary_hues() {
    assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), Rgb([255, 0, 0]));
    assert_eq!(hsv_to_rgb(120.0, 1.0, 1.0), Rgb([0, 255, 0]));
    assert_eq!(hsv_to_rgb(240.0, 1.0, 1.0), Rgb([0, 0, 255]));
  }

  #[test]
  fn classes_get_distinct_colors() {
    let draw = Draw::default();
    assert_ne!(draw.color(0), draw.color(1));
    assert_eq!(draw.color(3), draw.color(3 + PALETTE_SIZE));
    assert!(!draw.has_font());
  }

  #[test]
  fn outline_is_drawn_in_class_color() {
    let draw = Draw::default();
    let image = RgbImage::new(100, 100);
    let annotated = draw.annotate(&image, &[bbox(40.0, 50.0, 80.0, 90.0, 2)]);

    let color = draw.color(2);
    assert_eq!(*annotated.get_pixel(40, 70), color);
    assert_eq!(*annotated.get_pixel(41, 70), color);
    assert_eq!(*annotated.get_pixel(80, 90), color);
    // 框内部不填充
    assert_eq!(*annotated.get_pixel(60, 70), Rgb([0, 0, 0]));
    // 标签底色在框上方
    assert_eq!(*annotated.get_pixel(42, 50 - LABEL_TEXT_HEIGHT), color);
    // 原图不变
    assert_eq!(*image.get_pixel(40, 70), Rgb([0, 0, 0]));
  }

  #[test]
  fn boxes_outside_or_degenerate_are_ignored() {
    let draw = Draw::default();
    let image = RgbImage::new(20, 20);
    let annotated = draw.annotate(
      &image,
      &[bbox(30.0, 30.0, 50.0, 50.0, 0), bbox(5.0, 5.0, 5.0, 9.0, 0)],
    );
    assert_eq!(annotated, image);
  }

  #[test]
  fn missing_font_file_is_an_error() {
    assert!(matches!(
      Draw::with_font_file(Path::new("/nonexistent/font.ttf")),
      Err(OutputError::Io(_))
    ));
  }
}
