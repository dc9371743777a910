// 该文件是 Tianyan （天眼） 项目的一部分。
// src/server.rs - 网页仪表盘服务
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

//! 浏览器界面与 HTTP 接口
//!
//! 推理与任务控制都是阻塞操作，在 `spawn_blocking` 中执行。
//! WebSocket 推送两类消息：二进制帧（`u32 LE JSON 长度 | JSON | JPEG`）
//! 与文本状态 JSON。

use std::sync::Arc;

use axum::{
  Json, Router,
  body::Bytes,
  extract::{
    DefaultBodyLimit, Query, State, WebSocketUpgrade,
    ws::{Message, WebSocket},
  },
  http::StatusCode,
  response::{Html, IntoResponse, Response},
  routing::{get, post},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::{
  input::{InputError, SUPPORTED_IMAGE_EXTENSIONS, SourceKind},
  model::{BoundingBox, CONFIDENCE_PERCENT_MAX, CONFIDENCE_PERCENT_MIN, ModelError},
  output::{DisplayFrame, encode_jpeg},
  session::{RunRequest, RunStatus, SessionController, SessionError, TaskType},
  task::{ORIGINAL_CAPTION, RESULT_CAPTION},
};

const INDEX_HTML: &str = include_str!("../assets/index.html");

#[derive(Clone)]
pub struct AppState {
  pub session: Arc<SessionController>,
}

/// 接口错误，响应体为 `{"error": "..."}`
#[derive(Debug)]
pub struct ApiError {
  status: StatusCode,
  message: String,
}

impl ApiError {
  fn internal(message: impl Into<String>) -> Self {
    Self {
      status: StatusCode::INTERNAL_SERVER_ERROR,
      message: message.into(),
    }
  }
}

impl From<SessionError> for ApiError {
  fn from(e: SessionError) -> Self {
    let status = match &e {
      _ if e.is_user_error() => StatusCode::BAD_REQUEST,
      SessionError::Input(InputError::Capture(_)) => StatusCode::SERVICE_UNAVAILABLE,
      SessionError::Model(ModelError::Load { .. }) => StatusCode::SERVICE_UNAVAILABLE,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Self {
      status,
      message: e.user_message(),
    }
  }
}

impl From<tokio::task::JoinError> for ApiError {
  fn from(e: tokio::task::JoinError) -> Self {
    error!("后台任务异常: {}", e);
    Self::internal("内部错误")
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    (self.status, Json(json!({ "error": self.message }))).into_response()
  }
}

/// 上传与启动接口的查询参数
#[derive(Debug, Deserialize)]
pub struct RunQuery {
  pub model: String,
  pub confidence: Option<u8>,
  pub filename: Option<String>,
}

impl RunQuery {
  fn request(&self, default_confidence: u8) -> RunRequest {
    RunRequest {
      model: self.model.clone(),
      confidence: self.confidence.unwrap_or(default_confidence),
    }
  }
}

#[derive(Debug, Serialize)]
struct Choice {
  value: &'static str,
  label: &'static str,
}

/// 检测框详情，`xywh` 为中心点加宽高
#[derive(Debug, Serialize)]
struct BoxDetail<'a> {
  #[serde(flatten)]
  bbox: &'a BoundingBox,
  xywh: [f32; 4],
}

pub fn router(state: AppState) -> Router {
  let body_limit = state.session.settings().max_upload_bytes;
  Router::new()
    .route("/", get(index))
    .route("/api/config", get(config))
    .route("/api/image", post(infer_image))
    .route("/api/video", post(start_video))
    .route("/api/camera", post(start_camera))
    .route("/api/stop", post(stop))
    .route("/api/status", get(status))
    .route("/ws", get(ws_handler))
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(CorsLayer::permissive())
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// 启动服务，收到 Ctrl-C 后停止当前任务并退出
pub async fn serve(session: Arc<SessionController>) -> std::io::Result<()> {
  let addr = session.settings().bind;
  let app = router(AppState {
    session: session.clone(),
  });

  let listener = TcpListener::bind(addr).await?;
  info!("仪表盘已启动: http://{}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  if let Err(e) = tokio::task::spawn_blocking(move || session.shutdown()).await {
    error!("关闭会话失败: {}", e);
  }
  info!("服务已退出");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    error!("无法监听中断信号: {}", e);
    std::future::pending::<()>().await;
  }
  info!("收到中断信号，准备退出...");
}

async fn index() -> Html<&'static str> {
  Html(INDEX_HTML)
}

async fn config(State(state): State<AppState>) -> Json<serde_json::Value> {
  let settings = state.session.settings();
  let task = TaskType::Detection;
  let sources: Vec<Choice> = SourceKind::ALL
    .iter()
    .map(|kind| Choice {
      value: kind.as_str(),
      label: kind.label(),
    })
    .collect();

  Json(json!({
    "task_types": [{ "value": task, "label": task.label() }],
    "models": settings.models,
    "sources": sources,
    "confidence": {
      "min": CONFIDENCE_PERCENT_MIN,
      "max": CONFIDENCE_PERCENT_MAX,
      "default": settings.default_confidence,
    },
    "image_extensions": SUPPORTED_IMAGE_EXTENSIONS,
  }))
}

async fn infer_image(
  State(state): State<AppState>,
  Query(query): Query<RunQuery>,
  body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
  let session = state.session.clone();
  let request = query.request(session.settings().default_confidence);
  let filename = query.filename.unwrap_or_default();
  debug!("收到图片 {}, {} 字节", filename, body.len());

  let outcome = tokio::task::spawn_blocking(move || {
    session.infer_image(&request, &body, &filename)
  })
  .await??;

  let report = &outcome.report;
  let original = encode_jpeg(&report.original).map_err(SessionError::from)?;
  let annotated = encode_jpeg(&report.annotated).map_err(SessionError::from)?;
  let boxes: Vec<BoxDetail> = report
    .boxes
    .iter()
    .map(|bbox| BoxDetail {
      bbox,
      xywh: bbox.xywh(),
    })
    .collect();

  Ok(Json(json!({
    "model": outcome.model,
    "confidence": outcome.confidence.value(),
    "original_caption": ORIGINAL_CAPTION,
    "caption": RESULT_CAPTION,
    "width": report.annotated.width(),
    "height": report.annotated.height(),
    "original": STANDARD.encode(original),
    "annotated": STANDARD.encode(annotated),
    "boxes": boxes,
  })))
}

async fn start_video(
  State(state): State<AppState>,
  Query(query): Query<RunQuery>,
  body: Bytes,
) -> Result<(StatusCode, Json<RunStatus>), ApiError> {
  let session = state.session.clone();
  let request = query.request(session.settings().default_confidence);
  let filename = query.filename.unwrap_or_else(|| "upload.mp4".to_string());
  info!("收到视频 {}, {} 字节", filename, body.len());

  let status = tokio::task::spawn_blocking(move || {
    session
      .start_video(&request, &body, &filename)
      .map(|_| session.status())
  })
  .await??;
  Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn start_camera(
  State(state): State<AppState>,
  Query(query): Query<RunQuery>,
) -> Result<(StatusCode, Json<RunStatus>), ApiError> {
  let session = state.session.clone();
  let request = query.request(session.settings().default_confidence);

  let status =
    tokio::task::spawn_blocking(move || session.start_camera(&request).map(|_| session.status()))
      .await??;
  Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn stop(State(state): State<AppState>) -> Result<Json<RunStatus>, ApiError> {
  let session = state.session.clone();
  let status = tokio::task::spawn_blocking(move || session.stop()).await?;
  Ok(Json(status))
}

async fn status(State(state): State<AppState>) -> Json<RunStatus> {
  Json(state.session.status())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
  ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
  info!("WebSocket 连接建立");

  let mut frames = state.session.display().subscribe();
  let mut statuses = state.session.subscribe_status();

  // 新连接先收到当前状态与当前帧
  let current_status = statuses.borrow_and_update().clone();
  let current_frame = frames.borrow_and_update().clone();
  if send_status(&mut socket, &current_status).await.is_err() {
    return;
  }
  if let Some(frame) = current_frame
    && send_frame(&mut socket, &frame).await.is_err()
  {
    return;
  }

  loop {
    tokio::select! {
      changed = frames.changed() => {
        if changed.is_err() {
          break;
        }
        let frame = frames.borrow_and_update().clone();
        if let Some(frame) = frame
          && send_frame(&mut socket, &frame).await.is_err()
        {
          break;
        }
      }
      changed = statuses.changed() => {
        if changed.is_err() {
          break;
        }
        let status = statuses.borrow_and_update().clone();
        if send_status(&mut socket, &status).await.is_err() {
          break;
        }
      }
      message = socket.recv() => {
        match message {
          Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
          Some(Ok(_)) => {}
        }
      }
    }
  }

  info!("WebSocket 连接断开");
}

async fn send_frame(
  socket: &mut WebSocket,
  frame: &DisplayFrame,
) -> Result<(), axum::Error> {
  match frame.to_packet() {
    Ok(packet) => socket.send(Message::Binary(packet)).await,
    Err(e) => {
      error!("帧元数据序列化失败: {}", e);
      Ok(())
    }
  }
}

async fn send_status(socket: &mut WebSocket, status: &RunStatus) -> Result<(), axum::Error> {
  match serde_json::to_string(status) {
    Ok(text) => socket.send(Message::Text(text)).await,
    Err(e) => {
      error!("状态序列化失败: {}", e);
      Ok(())
    }
  }
}
