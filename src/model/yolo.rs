// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/yolo.rs - 基于 ONNX Runtime 的 YOLO 检测模型
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

use std::{path::Path, sync::Mutex};

use image::RgbImage;
use ort::{
  session::{Session, builder::GraphOptimizationLevel},
  value::Tensor,
};
use tracing::{debug, info};

use super::{
  BoundingBox, Confidence, Detector, Labels, ModelError, ModelLoader,
  postprocess::{YoloOutputLayout, decode_yolo_output},
};
use crate::frame::RgbNchwTensor;

/// YOLOv8 布局的 ONNX 模型
///
/// ONNX Runtime 的 `Session::run` 需要独占访问，会话放在互斥锁中。
pub struct YoloOnnx {
  session: Mutex<Session>,
  input_size: u32,
  iou_threshold: f32,
  labels: Labels,
}

impl YoloOnnx {
  pub fn load(
    path: &Path,
    input_size: u32,
    iou_threshold: f32,
    labels: Labels,
  ) -> Result<Self, ModelError> {
    if !path.is_file() {
      return Err(ModelError::load(path, "文件不存在"));
    }

    // 重复初始化无副作用
    let _ = ort::init().commit();

    let session = Session::builder()
      .map_err(|e| ModelError::load(path, e))?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(|e| ModelError::load(path, e))?
      .commit_from_file(path)
      .map_err(|e| ModelError::load(path, e))?;

    info!(
      "ONNX 模型已加载: {}, 输入尺寸 {}x{}, 类别数 {}",
      path.display(),
      input_size,
      input_size,
      labels.len()
    );

    Ok(Self {
      session: Mutex::new(session),
      input_size,
      iou_threshold,
      labels,
    })
  }
}

impl Detector for YoloOnnx {
  fn detect(
    &self,
    image: &RgbImage,
    confidence: Confidence,
  ) -> Result<Vec<BoundingBox>, ModelError> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
      return Err(ModelError::Inference("输入图像为空".to_string()));
    }

    let tensor = RgbNchwTensor::from_image(image, self.input_size, self.input_size);
    let input = Tensor::from_array((tensor.shape(), tensor.into_data()))
      .map_err(|e| ModelError::Inference(e.to_string()))?;

    let (shape, data) = {
      let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
      let outputs = session
        .run(ort::inputs![input])
        .map_err(|e| ModelError::Inference(e.to_string()))?;
      let (_, output) = outputs
        .iter()
        .next()
        .ok_or_else(|| ModelError::Inference("模型没有输出".to_string()))?;
      let (shape, data) = output
        .try_extract_tensor::<f32>()
        .map_err(|e| ModelError::Inference(e.to_string()))?;
      (shape.to_vec(), data.to_vec())
    };

    let layout = YoloOutputLayout::from_shape(&shape)?;
    debug!(
      "模型输出形状 {:?}, 候选数 {}, 类别数 {}",
      shape,
      layout.proposals,
      layout.classes()
    );

    let scale = (
      width as f32 / self.input_size as f32,
      height as f32 / self.input_size as f32,
    );
    decode_yolo_output(
      &data,
      layout,
      scale,
      (width as f32, height as f32),
      confidence,
      self.iou_threshold,
      &self.labels,
    )
  }
}

/// 生产环境使用的模型加载器
pub struct OnnxModelLoader {
  input_size: u32,
  iou_threshold: f32,
  labels: Labels,
}

impl OnnxModelLoader {
  pub fn new(input_size: u32, iou_threshold: f32, labels: Labels) -> Self {
    Self {
      input_size,
      iou_threshold,
      labels,
    }
  }
}

impl ModelLoader for OnnxModelLoader {
  fn load(&self, path: &Path) -> Result<Box<dyn Detector>, ModelError> {
    let model = YoloOnnx::load(
      path,
      self.input_size,
      self.iou_threshold,
      self.labels.clone(),
    )?;
    Ok(Box::new(model))
  }
}
