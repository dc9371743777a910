// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/postprocess.rs - YOLO 输出解码与非极大值抑制
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

use super::{BoundingBox, Confidence, Labels, ModelError};

/// 前 4 行/列为 cx, cy, w, h
const BOX_VALUES: usize = 4;

/// YOLOv8 输出张量布局
///
/// 标准导出为 `[1, 4 + 类别数, 候选数]`，部分导出会转置为
/// `[1, 候选数, 4 + 类别数]`。两维都可能是属性维度时取较小的一维。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YoloOutputLayout {
  pub attributes: usize,
  pub proposals: usize,
  pub transposed: bool,
}

impl YoloOutputLayout {
  pub fn from_shape(shape: &[i64]) -> Result<Self, ModelError> {
    let dims = match shape {
      [1, a, b] => (*a, *b),
      [a, b] => (*a, *b),
      _ => {
        return Err(ModelError::Inference(format!(
          "不支持的输出形状: {:?}",
          shape
        )));
      }
    };
    if dims.0 <= 0 || dims.1 <= 0 {
      return Err(ModelError::Inference(format!(
        "输出形状包含非法维度: {:?}",
        shape
      )));
    }

    let (a, b) = (dims.0 as usize, dims.1 as usize);
    let (attributes, proposals, transposed) = match (a > BOX_VALUES, b > BOX_VALUES) {
      (true, false) => (a, b, false),
      (false, true) => (b, a, true),
      (true, true) if a <= b => (a, b, false),
      (true, true) => (b, a, true),
      (false, false) => {
        return Err(ModelError::Inference(format!(
          "输出属性维度过小: {:?}",
          shape
        )));
      }
    };

    Ok(Self {
      attributes,
      proposals,
      transposed,
    })
  }

  pub fn classes(&self) -> usize {
    self.attributes - BOX_VALUES
  }

  fn value(&self, data: &[f32], attribute: usize, proposal: usize) -> f32 {
    if self.transposed {
      data[proposal * self.attributes + attribute]
    } else {
      data[attribute * self.proposals + proposal]
    }
  }
}

/// 解码 YOLOv8 输出
///
/// `scale` 为模型输入到原图的缩放比例 `(sx, sy)`，`bounds` 为原图宽高，
/// 解码后的框会被裁剪到图像范围内。
pub fn decode_yolo_output(
  data: &[f32],
  layout: YoloOutputLayout,
  scale: (f32, f32),
  bounds: (f32, f32),
  confidence: Confidence,
  iou_threshold: f32,
  labels: &Labels,
) -> Result<Vec<BoundingBox>, ModelError> {
  let expected = layout.attributes * layout.proposals;
  if data.len() < expected {
    return Err(ModelError::Inference(format!(
      "输出长度不匹配: 期望 {}, 实际 {}",
      expected,
      data.len()
    )));
  }

  let mut candidates = Vec::new();
  for proposal in 0..layout.proposals {
    // 找到最高类别分数
    let mut best_score = f32::MIN;
    let mut best_class = 0usize;
    for class_id in 0..layout.classes() {
      let score = layout.value(data, BOX_VALUES + class_id, proposal);
      if score > best_score {
        best_score = score;
        best_class = class_id;
      }
    }

    if !confidence.admits(best_score) {
      continue;
    }

    let cx = layout.value(data, 0, proposal);
    let cy = layout.value(data, 1, proposal);
    let w = layout.value(data, 2, proposal);
    let h = layout.value(data, 3, proposal);

    let x1 = ((cx - w / 2.0) * scale.0).clamp(0.0, bounds.0);
    let y1 = ((cy - h / 2.0) * scale.1).clamp(0.0, bounds.1);
    let x2 = ((cx + w / 2.0) * scale.0).clamp(0.0, bounds.0);
    let y2 = ((cy + h / 2.0) * scale.1).clamp(0.0, bounds.1);
    if x2 <= x1 || y2 <= y1 {
      continue;
    }

    candidates.push(BoundingBox {
      x1,
      y1,
      x2,
      y2,
      class_id: best_class,
      label: labels.name(best_class),
      confidence: best_score,
    });
  }

  Ok(nms(candidates, iou_threshold))
}

/// 按类别进行非极大值抑制，结果按置信度降序
pub fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
  detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut result: Vec<BoundingBox> = Vec::with_capacity(detections.len());
  for candidate in detections {
    let suppressed = result
      .iter()
      .any(|kept| kept.class_id == candidate.class_id && kept.iou(&candidate) >= iou_threshold);
    if !suppressed {
      result.push(candidate);
    }
  }

  result
}

#[cfg(test)]
mod tests {
  use super::*;

  /// 构造 `[1, 4 + classes, proposals]` 布局的数据
  fn channel_major(proposals: &[[f32; 6]]) -> Vec<f32> {
    let n = proposals.len();
    let mut data = vec![0f32; 6 * n];
    for (i, p) in proposals.iter().enumerate() {
      for (attr, value) in p.iter().enumerate() {
        data[attr * n + i] = *value;
      }
    }
    data
  }

  fn confidence(value: f32) -> Confidence {
    Confidence::new(value).unwrap()
  }

  #[test]
  fn layout_detects_transposed_exports() {
    let standard = YoloOutputLayout::from_shape(&[1, 84, 8400]).unwrap();
    assert_eq!((standard.attributes, standard.proposals), (84, 8400));
    assert!(!standard.transposed);
    assert_eq!(standard.classes(), 80);

    let transposed = YoloOutputLayout::from_shape(&[1, 8400, 84]).unwrap();
    assert!(transposed.transposed);
    assert_eq!(transposed.attributes, 84);

    assert!(YoloOutputLayout::from_shape(&[1, 3, 640, 640]).is_err());
    assert!(YoloOutputLayout::from_shape(&[1, 4, 3]).is_err());
  }

  #[test]
  fn decode_scales_filters_and_suppresses() {
    // cx, cy, w, h, class0, class1
    let data = channel_major(&[
      [100.0, 100.0, 40.0, 40.0, 0.9, 0.1],
      [102.0, 101.0, 40.0, 40.0, 0.8, 0.1], // 与第一个重叠，被抑制
      [300.0, 300.0, 20.0, 20.0, 0.1, 0.6],
      [500.0, 500.0, 20.0, 20.0, 0.2, 0.3], // 低于阈值
    ]);
    let layout = YoloOutputLayout::from_shape(&[1, 6, 4]).unwrap();
    let labels = Labels::parse("plane\nbird");

    let boxes = decode_yolo_output(
      &data,
      layout,
      (2.0, 0.5),
      (2000.0, 2000.0),
      confidence(0.5),
      0.45,
      &labels,
    )
    .unwrap();

    assert_eq!(boxes.len(), 2);
    assert_eq!(boxes[0].label, "plane");
    assert_eq!(
      (boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2),
      (160.0, 40.0, 240.0, 60.0)
    );
    assert_eq!(boxes[1].label, "bird");
    assert!(boxes.iter().all(|b| b.confidence >= 0.5));
  }

  #[test]
  fn decode_clamps_to_image_bounds() {
    let data = channel_major(&[[5.0, 5.0, 20.0, 20.0, 0.7, 0.0]]);
    let layout = YoloOutputLayout::from_shape(&[1, 6, 1]).unwrap();
    let boxes = decode_yolo_output(
      &data,
      layout,
      (1.0, 1.0),
      (10.0, 10.0),
      confidence(0.3),
      0.45,
      &Labels::default(),
    )
    .unwrap();
    assert_eq!(
      (boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2),
      (0.0, 0.0, 10.0, 10.0)
    );
  }

  #[test]
  fn decode_rejects_short_buffers() {
    let layout = YoloOutputLayout::from_shape(&[1, 6, 10]).unwrap();
    let result = decode_yolo_output(
      &[0.0; 12],
      layout,
      (1.0, 1.0),
      (10.0, 10.0),
      confidence(0.5),
      0.45,
      &Labels::default(),
    );
    assert!(matches!(result, Err(ModelError::Inference(_))));
  }

  #[test]
  fn nms_keeps_overlapping_boxes_of_different_classes() {
    let mk = |class_id, confidence| BoundingBox {
      x1: 0.0,
      y1: 0.0,
      x2: 10.0,
      y2: 10.0,
      class_id,
      label: String::new(),
      confidence,
    };
    let kept = nms(vec![mk(0, 0.6), mk(1, 0.7), mk(0, 0.9)], 0.5);
    assert_eq!(kept.len(), 2);
    assert_eq!(kept[0].confidence, 0.9);
    assert_eq!(kept[1].class_id, 1);
  }
}
