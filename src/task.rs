// 该文件是 Tianyan （天眼） 项目的一部分。
// src/task.rs - 推理任务
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

use std::{
  sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
  },
  time::Instant,
};

use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
  frame::{Frame, FrameScale},
  input::InputError,
  model::{BoundingBox, Confidence, ModelError, ModelHandle},
  output::{Draw, OutputError, Render},
};

/// 流式展示的标题
pub const STREAM_CAPTION: &str = "检测视频";
/// 单张图片原图标题
pub const ORIGINAL_CAPTION: &str = "上传的图片";
/// 单张图片结果标题
pub const RESULT_CAPTION: &str = "检测结果";

#[derive(Error, Debug)]
pub enum TaskError {
  #[error(transparent)]
  Input(#[from] InputError),
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Output(#[from] OutputError),
  #[error("没有输入帧")]
  NoFrame,
}

/// 一次推理的结果
#[derive(Debug, Clone)]
pub struct Inference {
  /// 推理所用图像（可能已缩放）上绘制了检测框
  pub annotated: RgbImage,
  pub boxes: Vec<BoundingBox>,
}

/// 推理步骤：图像 + 置信度 → 标注图像 + 检测框
#[derive(Clone)]
pub struct InferenceStep {
  model: Arc<ModelHandle>,
  draw: Arc<Draw>,
  confidence: Confidence,
}

impl InferenceStep {
  pub fn new(model: Arc<ModelHandle>, draw: Arc<Draw>, confidence: Confidence) -> Self {
    Self {
      model,
      draw,
      confidence,
    }
  }

  pub fn confidence(&self) -> Confidence {
    self.confidence
  }

  pub fn model(&self) -> &Arc<ModelHandle> {
    &self.model
  }

  pub fn infer(&self, image: &RgbImage, scale: FrameScale) -> Result<Inference, ModelError> {
    let input = scale.apply(image);
    let mut boxes = self.model.detect(&input, self.confidence)?;
    // 不依赖模型实现的过滤
    boxes.retain(|bbox| self.confidence.admits(bbox.confidence));
    let annotated = self.draw.annotate(&input, &boxes);
    Ok(Inference { annotated, boxes })
  }
}

/// 输入源状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
  Idle,
  Running,
  /// 收到停止信号
  Stopped,
  /// 输入正常结束
  Exhausted,
  Error,
}

impl SourceState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      SourceState::Stopped | SourceState::Exhausted | SourceState::Error
    )
  }
}

/// 循环结束时的报告，此时输入源已经释放
#[derive(Debug)]
pub struct LoopReport {
  pub state: SourceState,
  pub frames: u64,
  pub error: Option<TaskError>,
}

/// 逐帧推理并覆盖展示的循环
///
/// 每读一帧之前检查一次停止信号，不会在一帧处理中途退出。
/// 任何一帧出错都会结束循环。
pub struct StreamTask {
  stop: CancellationToken,
  frames: Arc<AtomicU64>,
}

impl StreamTask {
  pub fn new(stop: CancellationToken) -> Self {
    Self {
      stop,
      frames: Arc::new(AtomicU64::new(0)),
    }
  }

  /// 已展示帧数，循环运行期间可从其他线程读取
  pub fn progress(&self) -> Arc<AtomicU64> {
    self.frames.clone()
  }

  pub fn run<S, R>(&self, mut source: S, step: &InferenceStep, sink: &R) -> LoopReport
  where
    S: Iterator<Item = Result<Frame, InputError>>,
    R: Render,
    R::Error: Into<TaskError>,
  {
    info!("开始任务...");
    let started = Instant::now();
    let (state, error) = self.drive(&mut source, step, sink);
    // 先释放输入源，再报告最终状态
    drop(source);

    let frames = self.frames.load(Ordering::SeqCst);
    match &error {
      Some(e) => error!("任务出错，已处理 {} 帧: {}", frames, e),
      None => info!(
        "任务结束: {:?}, 共 {} 帧, 耗时 {:.2?}",
        state,
        frames,
        started.elapsed()
      ),
    }
    LoopReport {
      state,
      frames,
      error,
    }
  }

  fn drive<S, R>(
    &self,
    source: &mut S,
    step: &InferenceStep,
    sink: &R,
  ) -> (SourceState, Option<TaskError>)
  where
    S: Iterator<Item = Result<Frame, InputError>>,
    R: Render,
    R::Error: Into<TaskError>,
  {
    loop {
      if self.stop.is_cancelled() {
        warn!("收到停止信号，退出任务循环");
        return (SourceState::Stopped, None);
      }

      let frame = match source.next() {
        Some(Ok(frame)) => frame,
        Some(Err(e)) => return (SourceState::Error, Some(e.into())),
        None => return (SourceState::Exhausted, None),
      };

      let now = Instant::now();
      let inference = match step.infer(&frame.image, FrameScale::Stream) {
        Ok(inference) => inference,
        Err(e) => return (SourceState::Error, Some(e.into())),
      };
      let elapsed_a = now.elapsed();
      if let Err(e) = sink.show(&inference.annotated, STREAM_CAPTION) {
        return (SourceState::Error, Some(e.into()));
      }
      let shown = self.frames.fetch_add(1, Ordering::SeqCst) + 1;
      debug!(
        "第 {} 帧: {} 个目标, 推理 {:.2?} / 展示 {:.2?}",
        shown,
        inference.boxes.len(),
        elapsed_a,
        now.elapsed()
      );
    }
  }
}

/// 单张图片的结果
#[derive(Debug, Clone)]
pub struct ImageReport {
  pub original: RgbImage,
  pub annotated: RgbImage,
  pub boxes: Vec<BoundingBox>,
}

/// 单张图片：一次推理，原图分辨率
pub struct OneShotTask;

impl OneShotTask {
  pub fn run<S>(&self, mut source: S, step: &InferenceStep) -> Result<ImageReport, TaskError>
  where
    S: Iterator<Item = Result<Frame, InputError>>,
  {
    info!("开始任务...");
    let frame = source.next().ok_or(TaskError::NoFrame)??;
    info!("输入帧获取成功，开始推理...");
    let now = Instant::now();
    let Inference { annotated, boxes } = step.infer(&frame.image, FrameScale::Native)?;
    info!(
      "推理完成，检测到 {} 个目标，耗时: {:.2?}",
      boxes.len(),
      now.elapsed()
    );

    Ok(ImageReport {
      original: frame.image,
      annotated,
      boxes,
    })
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;
  use crate::model::Detector;

  /// 返回固定检测框，记录调用次数
  struct FixedBoxes {
    boxes: Vec<BoundingBox>,
    calls: Arc<AtomicU64>,
  }

  impl Detector for FixedBoxes {
    fn detect(&self, _: &RgbImage, _: Confidence) -> Result<Vec<BoundingBox>, ModelError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Ok(self.boxes.clone())
    }
  }

  struct Failing;

  impl Detector for Failing {
    fn detect(&self, _: &RgbImage, _: Confidence) -> Result<Vec<BoundingBox>, ModelError> {
      Err(ModelError::Inference("显存不足".to_string()))
    }
  }

  #[derive(Default)]
  struct Recorder {
    sizes: Mutex<Vec<(u32, u32)>>,
  }

  impl Render for Recorder {
    type Error = OutputError;

    fn show(&self, annotated: &RgbImage, caption: &str) -> Result<(), Self::Error> {
      assert_eq!(caption, STREAM_CAPTION);
      self.sizes.lock().unwrap().push(annotated.dimensions());
      Ok(())
    }
  }

  fn scored(confidence: f32) -> BoundingBox {
    BoundingBox {
      x1: 1.0,
      y1: 1.0,
      x2: 5.0,
      y2: 5.0,
      class_id: 0,
      label: "person".to_string(),
      confidence,
    }
  }

  fn step(detector: impl Detector + 'static, confidence: f32) -> InferenceStep {
    InferenceStep::new(
      Arc::new(ModelHandle::new("stub.onnx", Box::new(detector))),
      Arc::new(Draw::default()),
      Confidence::new(confidence).unwrap(),
    )
  }

  fn frames(n: u64, width: u32, height: u32) -> impl Iterator<Item = Result<Frame, InputError>> {
    (0..n).map(move |i| Ok(Frame::new(RgbImage::new(width, height), i, i * 40)))
  }

  #[test]
  fn boxes_below_threshold_never_escape() {
    let calls = Arc::new(AtomicU64::new(0));
    let detector = FixedBoxes {
      boxes: vec![scored(0.2), scored(0.5), scored(0.49), scored(0.95)],
      calls: calls.clone(),
    };
    for threshold in [0.0, 0.3, 0.5, 0.9, 1.0] {
      let inference = step(
        FixedBoxes {
          boxes: detector.boxes.clone(),
          calls: calls.clone(),
        },
        threshold,
      )
      .infer(&RgbImage::new(10, 10), FrameScale::Native)
      .unwrap();
      assert!(inference.boxes.iter().all(|b| b.confidence >= threshold));
    }
  }

  #[test]
  fn stream_frames_are_resized_before_display() {
    let sink = Recorder::default();
    let calls = Arc::new(AtomicU64::new(0));
    let step = step(
      FixedBoxes {
        boxes: Vec::new(),
        calls: calls.clone(),
      },
      0.5,
    );

    let report = StreamTask::new(CancellationToken::new()).run(frames(3, 1280, 720), &step, &sink);

    assert_eq!(report.state, SourceState::Exhausted);
    assert_eq!(report.frames, 3);
    assert!(report.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(*sink.sizes.lock().unwrap(), vec![(720, 405); 3]);
  }

  #[test]
  fn cancelled_before_start_reads_nothing() {
    let token = CancellationToken::new();
    token.cancel();
    let sink = Recorder::default();
    let report = StreamTask::new(token).run(
      frames(5, 16, 9),
      &step(Failing, 0.5),
      &sink,
    );
    assert_eq!(report.state, SourceState::Stopped);
    assert_eq!(report.frames, 0);
  }

  #[test]
  fn inference_error_ends_the_loop() {
    let sink = Recorder::default();
    let report = StreamTask::new(CancellationToken::new()).run(
      frames(5, 16, 9),
      &step(Failing, 0.5),
      &sink,
    );
    assert_eq!(report.state, SourceState::Error);
    assert!(matches!(
      report.error,
      Some(TaskError::Model(ModelError::Inference(_)))
    ));
    assert!(sink.sizes.lock().unwrap().is_empty());
  }

  #[test]
  fn read_error_ends_the_loop() {
    let source = frames(2, 16, 9).chain(std::iter::once(Err(InputError::Capture(
      "设备已断开".to_string(),
    ))));
    let calls = Arc::new(AtomicU64::new(0));
    let report = StreamTask::new(CancellationToken::new()).run(
      source,
      &step(
        FixedBoxes {
          boxes: Vec::new(),
          calls,
        },
        0.5,
      ),
      &Recorder::default(),
    );
    assert_eq!(report.state, SourceState::Error);
    assert_eq!(report.frames, 2);
    assert!(matches!(
      report.error,
      Some(TaskError::Input(InputError::Capture(_)))
    ));
  }

  #[test]
  fn one_shot_keeps_native_resolution() {
    let calls = Arc::new(AtomicU64::new(0));
    let step = step(
      FixedBoxes {
        boxes: vec![scored(0.8)],
        calls: calls.clone(),
      },
      0.5,
    );
    let report = OneShotTask.run(frames(1, 1280, 720), &step).unwrap();
    assert_eq!(report.original.dimensions(), (1280, 720));
    assert_eq!(report.annotated.dimensions(), (1280, 720));
    assert_eq!(report.boxes.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn one_shot_without_frame_is_an_error() {
    let calls = Arc::new(AtomicU64::new(0));
    let step = step(
      FixedBoxes {
        boxes: Vec::new(),
        calls,
      },
      0.5,
    );
    assert!(matches!(
      OneShotTask.run(frames(0, 1, 1), &step),
      Err(TaskError::NoFrame)
    ));
  }
}
