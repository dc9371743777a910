// 该文件是 Tianyan （天眼） 项目的一部分。
// src/session.rs - 会话控制
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
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
  },
  thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
  args::Settings,
  input::{FrameSource, ImageSource, InputError, SourceKind, SourceOpener, check_image_extension},
  model::{CONFIDENCE_PERCENT_MAX, CONFIDENCE_PERCENT_MIN, Confidence, ModelCache, ModelError, ModelLoader},
  output::{DisplaySlot, Draw, OutputError},
  task::{ImageReport, InferenceStep, LoopReport, OneShotTask, SourceState, StreamTask, TaskError},
};

/// 任务类型，目前只有检测
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
  Detection,
}

impl TaskType {
  pub fn label(&self) -> &'static str {
    match self {
      TaskType::Detection => "检测",
    }
  }
}

/// 一次运行的用户配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RunRequest {
  pub model: String,
  /// 百分比，30 - 100
  pub confidence: u8,
}

#[derive(Error, Debug)]
pub enum SessionError {
  #[error("未知模型: {0}")]
  UnknownModel(String),
  #[error(transparent)]
  Model(#[from] ModelError),
  #[error(transparent)]
  Input(#[from] InputError),
  #[error(transparent)]
  Output(#[from] OutputError),
  #[error("没有输入帧")]
  NoFrame,
  #[error("无法启动任务线程: {0}")]
  Spawn(std::io::Error),
}

impl From<TaskError> for SessionError {
  fn from(e: TaskError) -> Self {
    match e {
      TaskError::Input(e) => SessionError::Input(e),
      TaskError::Model(e) => SessionError::Model(e),
      TaskError::Output(e) => SessionError::Output(e),
      TaskError::NoFrame => SessionError::NoFrame,
    }
  }
}

impl SessionError {
  /// 展示在页面上的提示
  pub fn user_message(&self) -> String {
    match self {
      SessionError::UnknownModel(name) => format!("请在侧边栏中选择模型（未知模型: {}）", name),
      SessionError::Model(ModelError::Load { path, .. }) => {
        format!("无法加载模型，请检查指定的路径：{}", path.display())
      }
      SessionError::Model(ModelError::InvalidConfidence(_)) => format!(
        "模型置信度必须在 {} 到 {} 之间",
        CONFIDENCE_PERCENT_MIN, CONFIDENCE_PERCENT_MAX
      ),
      SessionError::Model(e) => format!("推理出错: {}", e),
      SessionError::Input(InputError::UnsupportedFormat(name)) => format!(
        "不支持的图片格式: {}，请上传 jpg、jpeg、png、bmp 或 webp 图片",
        name
      ),
      SessionError::Input(InputError::Decode(e)) => format!("加载视频出错: {}", e),
      SessionError::Input(InputError::Image(e)) => format!("无法读取图片，请检查上传的文件: {}", e),
      SessionError::Input(InputError::Capture(e)) => format!("摄像头不可用: {}", e),
      SessionError::Input(InputError::Io(e)) => format!("读取上传文件出错: {}", e),
      SessionError::Output(e) => format!("结果展示出错: {}", e),
      SessionError::NoFrame => "尚未上传图片！".to_string(),
      SessionError::Spawn(e) => format!("无法启动任务: {}", e),
    }
  }

  /// 是否由用户输入引起
  pub fn is_user_error(&self) -> bool {
    matches!(
      self,
      SessionError::UnknownModel(_)
        | SessionError::NoFrame
        | SessionError::Model(ModelError::InvalidConfidence(_))
        | SessionError::Input(InputError::UnsupportedFormat(_))
        | SessionError::Input(InputError::Decode(_))
        | SessionError::Input(InputError::Image(_))
    )
  }
}

/// 当前运行状态
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunStatus {
  pub source: Option<SourceKind>,
  pub state: SourceState,
  pub model: Option<String>,
  pub frames: u64,
  pub message: Option<String>,
  pub updated_at: DateTime<Utc>,
}

impl RunStatus {
  pub fn idle() -> Self {
    Self {
      source: None,
      state: SourceState::Idle,
      model: None,
      frames: 0,
      message: None,
      updated_at: Utc::now(),
    }
  }

  fn running(source: SourceKind, model: &str) -> Self {
    Self {
      source: Some(source),
      state: SourceState::Running,
      model: Some(model.to_string()),
      ..Self::idle()
    }
  }

  fn finished(source: SourceKind, model: &str, report: LoopReport) -> Self {
    Self {
      source: Some(source),
      state: report.state,
      model: Some(model.to_string()),
      frames: report.frames,
      message: report
        .error
        .map(|e| SessionError::from(e).user_message()),
      updated_at: Utc::now(),
    }
  }

  fn failed(source: SourceKind, model: &str, error: &SessionError) -> Self {
    Self {
      source: Some(source),
      state: SourceState::Error,
      model: Some(model.to_string()),
      message: Some(error.user_message()),
      ..Self::idle()
    }
  }
}

/// 单张图片的推理结果
#[derive(Debug, Clone)]
pub struct ImageOutcome {
  pub report: ImageReport,
  pub model: String,
  pub confidence: Confidence,
}

struct ActiveRun {
  source: SourceKind,
  token: CancellationToken,
  progress: Arc<AtomicU64>,
  handle: JoinHandle<()>,
}

/// 会话控制器
///
/// 每个会话同时最多只有一个流式任务。开始任何新的运行之前，先停止并等待
/// 当前任务结束，确保其采集资源已经释放。
pub struct SessionController {
  settings: Settings,
  cache: ModelCache,
  opener: Arc<dyn SourceOpener>,
  draw: Arc<Draw>,
  display: DisplaySlot,
  status: Arc<watch::Sender<RunStatus>>,
  // 串行化 开始/停止 操作
  control: Mutex<()>,
  active: Mutex<Option<ActiveRun>>,
}

impl SessionController {
  pub fn new(
    settings: Settings,
    loader: Box<dyn ModelLoader>,
    opener: Arc<dyn SourceOpener>,
    draw: Draw,
  ) -> Self {
    let (status, _) = watch::channel(RunStatus::idle());
    Self {
      settings,
      cache: ModelCache::new(loader),
      opener,
      draw: Arc::new(draw),
      display: DisplaySlot::new(),
      status: Arc::new(status),
      control: Mutex::new(()),
      active: Mutex::new(None),
    }
  }

  pub fn settings(&self) -> &Settings {
    &self.settings
  }

  pub fn display(&self) -> &DisplaySlot {
    &self.display
  }

  pub fn cache(&self) -> &ModelCache {
    &self.cache
  }

  pub fn subscribe_status(&self) -> watch::Receiver<RunStatus> {
    self.status.subscribe()
  }

  /// 当前状态；运行中时帧数取实时值
  pub fn status(&self) -> RunStatus {
    let mut status = self.status.borrow().clone();
    let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(run) = active.as_ref()
      && status.state == SourceState::Running
      && status.source == Some(run.source)
    {
      status.frames = run.progress.load(Ordering::SeqCst);
    }
    status
  }

  /// 校验配置并加载模型
  fn prepare(&self, request: &RunRequest) -> Result<InferenceStep, SessionError> {
    if !self.settings.models.iter().any(|name| *name == request.model) {
      return Err(SessionError::UnknownModel(request.model.clone()));
    }
    let confidence = Confidence::from_percent(request.confidence)?;
    let model = self
      .cache
      .load(&self.settings.model_dir.join(&request.model))?;
    Ok(InferenceStep::new(model, self.draw.clone(), confidence))
  }

  /// 单张图片推理，结果直接返回
  pub fn infer_image(
    &self,
    request: &RunRequest,
    bytes: &[u8],
    filename: &str,
  ) -> Result<ImageOutcome, SessionError> {
    let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
    self.teardown();

    let result = check_image_extension(filename)
      .map_err(SessionError::from)
      .and_then(|_| self.prepare(request))
      .and_then(|step| {
        let source = ImageSource::from_bytes(bytes, filename)?;
        let report = OneShotTask.run(source, &step)?;
        Ok((report, step.confidence()))
      });

    match result {
      Ok((report, confidence)) => {
        self.status.send_replace(RunStatus {
          frames: 1,
          state: SourceState::Exhausted,
          ..RunStatus::running(SourceKind::Image, &request.model)
        });
        Ok(ImageOutcome {
          report,
          model: request.model.clone(),
          confidence,
        })
      }
      Err(e) => {
        error!("图片推理失败: {}", e);
        self
          .status
          .send_replace(RunStatus::failed(SourceKind::Image, &request.model, &e));
        Err(e)
      }
    }
  }

  /// 开始上传视频的流式推理
  pub fn start_video(
    &self,
    request: &RunRequest,
    bytes: &[u8],
    filename: &str,
  ) -> Result<(), SessionError> {
    self.start(SourceKind::Video, request, |opener| {
      opener.open_video(bytes, filename)
    })
  }

  /// 开始摄像头的流式推理
  pub fn start_camera(&self, request: &RunRequest) -> Result<(), SessionError> {
    let index = self.settings.camera_index;
    self.start(SourceKind::Camera, request, |opener| opener.open_camera(index))
  }

  fn start<F>(&self, kind: SourceKind, request: &RunRequest, open: F) -> Result<(), SessionError>
  where
    F: FnOnce(&dyn SourceOpener) -> Result<Box<dyn FrameSource>, InputError>,
  {
    let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
    self.teardown();

    let result = self
      .prepare(request)
      .and_then(|step| Ok((step, open(self.opener.as_ref())?)))
      .and_then(|(step, source)| self.spawn(&request.model, source, step));

    if let Err(e) = &result {
      error!("无法开始 {} 任务: {}", kind, e);
      self
        .status
        .send_replace(RunStatus::failed(kind, &request.model, e));
    }
    result
  }

  fn spawn(
    &self,
    model: &str,
    source: Box<dyn FrameSource>,
    step: InferenceStep,
  ) -> Result<(), SessionError> {
    let kind = source.source_type();
    let token = CancellationToken::new();
    let task = StreamTask::new(token.clone());
    let progress = task.progress();
    let display = self.display.clone();
    let status = self.status.clone();
    let model_name = model.to_string();

    // 新连接不应看到上一次运行的最后一帧
    self.display.clear();
    self
      .status
      .send_replace(RunStatus::running(kind, model));

    let handle = thread::Builder::new()
      .name(format!("tianyan-{}", kind))
      .spawn(move || {
        info!("{} 任务开始, 模型 {}", kind, model_name);
        let report = task.run(source, &step, &display);
        status.send_replace(RunStatus::finished(kind, &model_name, report));
      })
      .map_err(SessionError::Spawn)?;

    *self.active.lock().unwrap_or_else(|e| e.into_inner()) = Some(ActiveRun {
      source: kind,
      token,
      progress,
      handle,
    });
    Ok(())
  }

  /// 停止当前任务并等待其结束，最多等待一帧
  pub fn stop(&self) -> RunStatus {
    let _control = self.control.lock().unwrap_or_else(|e| e.into_inner());
    self.teardown();
    self.status()
  }

  /// 关闭会话，停止所有任务
  pub fn shutdown(&self) {
    info!("会话关闭");
    self.stop();
  }

  fn teardown(&self) {
    let run = self
      .active
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .take();
    if let Some(run) = run {
      warn!("停止正在运行的 {} 任务", run.source);
      run.token.cancel();
      if run.handle.join().is_err() {
        error!("任务线程异常退出");
        self.status.send_modify(|status| {
          status.state = SourceState::Error;
          status.message = Some("任务异常退出".to_string());
          status.updated_at = Utc::now();
        });
      }
    }
  }
}

impl Drop for SessionController {
  fn drop(&mut self) {
    self.teardown();
  }
}
