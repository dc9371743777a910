// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model.rs - 模型
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

use std::path::{Path, PathBuf};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;

mod cache;
mod labels;
mod postprocess;
#[cfg(feature = "onnx_model")]
mod yolo;

pub use self::cache::{ModelCache, ModelLoader};
pub use self::labels::{COCO_CLASSES, Labels};
pub use self::postprocess::{YoloOutputLayout, decode_yolo_output, nms};
#[cfg(feature = "onnx_model")]
pub use self::yolo::{OnnxModelLoader, YoloOnnx};

/// 滑块允许的最小置信度（百分比）
pub const CONFIDENCE_PERCENT_MIN: u8 = 30;
/// 滑块允许的最大置信度（百分比）
pub const CONFIDENCE_PERCENT_MAX: u8 = 100;

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型加载错误: {path}, 原因: {reason}")]
  Load { path: PathBuf, reason: String },
  #[error("推理错误: {0}")]
  Inference(String),
  #[error("置信度不合法: {0}")]
  InvalidConfidence(String),
  #[error("类别文件错误: {0}")]
  Labels(#[from] std::io::Error),
}

impl ModelError {
  pub fn load(path: &Path, reason: impl ToString) -> Self {
    ModelError::Load {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    }
  }
}

/// 置信度阈值，取值 [0.0, 1.0]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
pub struct Confidence(f32);

impl Confidence {
  pub fn new(value: f32) -> Result<Self, ModelError> {
    if (0.0..=1.0).contains(&value) {
      Ok(Confidence(value))
    } else {
      Err(ModelError::InvalidConfidence(format!(
        "{} 不在 0.0 - 1.0 之间",
        value
      )))
    }
  }

  /// 由界面上的百分比（30 - 100）换算
  pub fn from_percent(percent: u8) -> Result<Self, ModelError> {
    if !(CONFIDENCE_PERCENT_MIN..=CONFIDENCE_PERCENT_MAX).contains(&percent) {
      return Err(ModelError::InvalidConfidence(format!(
        "{}% 不在 {}% - {}% 之间",
        percent, CONFIDENCE_PERCENT_MIN, CONFIDENCE_PERCENT_MAX
      )));
    }
    Ok(Confidence(percent as f32 / 100.0))
  }

  pub fn value(&self) -> f32 {
    self.0
  }

  pub fn admits(&self, score: f32) -> bool {
    score >= self.0
  }
}

/// 一个检测框，坐标为推理图像上的像素坐标
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoundingBox {
  pub x1: f32,
  pub y1: f32,
  pub x2: f32,
  pub y2: f32,
  pub class_id: usize,
  pub label: String,
  pub confidence: f32,
}

impl BoundingBox {
  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  /// 中心点加宽高 `[cx, cy, w, h]`
  pub fn xywh(&self) -> [f32; 4] {
    [
      (self.x1 + self.x2) / 2.0,
      (self.y1 + self.y2) / 2.0,
      self.width(),
      self.height(),
    ]
  }

  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let x1 = self.x1.max(other.x1);
    let y1 = self.y1.max(other.y1);
    let x2 = self.x2.min(other.x2);
    let y2 = self.y2.min(other.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = self.width() * self.height() + other.width() * other.height() - intersection;

    if union > 0.0 {
      intersection / union
    } else {
      0.0
    }
  }
}

/// 检测模型
///
/// 输入一张 RGB 图像，输出置信度不低于阈值的检测框。
pub trait Detector: Send + Sync {
  fn detect(
    &self,
    image: &RgbImage,
    confidence: Confidence,
  ) -> Result<Vec<BoundingBox>, ModelError>;
}

/// 已加载的模型句柄，加载后不再修改
pub struct ModelHandle {
  path: PathBuf,
  detector: Box<dyn Detector>,
}

impl ModelHandle {
  pub fn new(path: impl Into<PathBuf>, detector: Box<dyn Detector>) -> Self {
    Self {
      path: path.into(),
      detector,
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn detect(
    &self,
    image: &RgbImage,
    confidence: Confidence,
  ) -> Result<Vec<BoundingBox>, ModelError> {
    self.detector.detect(image, confidence)
  }
}

impl std::fmt::Debug for ModelHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ModelHandle")
      .field("path", &self.path)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bbox(x1: f32, y1: f32, x2: f32, y2: f32) -> BoundingBox {
    BoundingBox {
      x1,
      y1,
      x2,
      y2,
      class_id: 0,
      label: "airplane".to_string(),
      confidence: 0.9,
    }
  }

  #[test]
  fn percent_maps_to_ratio() {
    assert_eq!(Confidence::from_percent(30).unwrap().value(), 0.3);
    assert_eq!(Confidence::from_percent(100).unwrap().value(), 1.0);
    assert!(Confidence::from_percent(29).is_err());
    assert!(Confidence::from_percent(101).is_err());
  }

  #[test]
  fn confidence_rejects_values_outside_unit_range() {
    assert!(Confidence::new(-0.1).is_err());
    assert!(Confidence::new(1.01).is_err());
    assert!(Confidence::new(f32::NAN).is_err());
    assert!(Confidence::new(0.0).unwrap().admits(0.0));
  }

  #[test]
  fn xywh_is_centre_based() {
    assert_eq!(bbox(10.0, 20.0, 30.0, 60.0).xywh(), [20.0, 40.0, 20.0, 40.0]);
  }

  #[test]
  fn iou_of_disjoint_and_identical_boxes() {
    let a = bbox(0.0, 0.0, 10.0, 10.0);
    assert_eq!(a.iou(&a), 1.0);
    assert_eq!(a.iou(&bbox(20.0, 20.0, 30.0, 30.0)), 0.0);
    let half = a.iou(&bbox(5.0, 0.0, 15.0, 10.0));
    assert!((half - 1.0 / 3.0).abs() < 1e-6);
  }
}
