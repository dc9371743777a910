// 该文件是 Tianyan （天眼） 项目的一部分。
// src/output/display.rs - 单帧展示槽
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

use std::sync::{
  Arc,
  atomic::{AtomicU64, Ordering},
};

use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use super::{OutputError, Render, encode_jpeg};

/// 展示槽中的一帧
#[derive(Debug, Clone, Serialize)]
pub struct DisplayFrame {
  pub sequence: u64,
  pub caption: String,
  pub width: u32,
  pub height: u32,
  pub shown_at: DateTime<Utc>,
  #[serde(skip)]
  pub jpeg: Vec<u8>,
}

impl DisplayFrame {
  /// WebSocket 二进制消息：`u32 LE JSON 长度 | JSON 元数据 | JPEG`
  pub fn to_packet(&self) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_vec(self)?;
    let mut packet = Vec::with_capacity(4 + json.len() + self.jpeg.len());
    packet.extend_from_slice(&(json.len() as u32).to_le_bytes());
    packet.extend_from_slice(&json);
    packet.extend_from_slice(&self.jpeg);
    Ok(packet)
  }
}

/// 流式展示槽
///
/// 只保存最新一帧，每次 `show` 覆盖上一帧；订阅者只会看到最新的帧。
#[derive(Clone)]
pub struct DisplaySlot {
  tx: Arc<watch::Sender<Option<Arc<DisplayFrame>>>>,
  sequence: Arc<AtomicU64>,
}

impl Default for DisplaySlot {
  fn default() -> Self {
    Self::new()
  }
}

impl DisplaySlot {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(None);
    Self {
      tx: Arc::new(tx),
      sequence: Arc::new(AtomicU64::new(0)),
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<Option<Arc<DisplayFrame>>> {
    self.tx.subscribe()
  }

  pub fn current(&self) -> Option<Arc<DisplayFrame>> {
    self.tx.borrow().clone()
  }

  /// 已展示的帧数（包括被覆盖的帧）
  pub fn updates(&self) -> u64 {
    self.sequence.load(Ordering::SeqCst)
  }

  pub fn clear(&self) {
    self.tx.send_replace(None);
  }
}

impl Render for DisplaySlot {
  type Error = OutputError;

  fn show(&self, annotated: &RgbImage, caption: &str) -> Result<(), Self::Error> {
    let jpeg = encode_jpeg(annotated)?;
    let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
    debug!("展示第 {} 帧, {} 字节", sequence, jpeg.len());

    self.tx.send_replace(Some(Arc::new(DisplayFrame {
      sequence,
      caption: caption.to_string(),
      width: annotated.width(),
      height: annotated.height(),
      shown_at: Utc::now(),
      jpeg,
    })));
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn show_overwrites_the_single_slot() {
    let slot = DisplaySlot::new();
    let mut rx = slot.subscribe();
    assert!(slot.current().is_none());

    slot.show(&RgbImage::new(16, 9), "第一帧").unwrap();
    slot.show(&RgbImage::new(32, 18), "第二帧").unwrap();

    assert!(rx.has_changed().unwrap());
    let latest = rx.borrow_and_update().clone().unwrap();
    assert_eq!(latest.sequence, 2);
    assert_eq!(latest.caption, "第二帧");
    assert_eq!((latest.width, latest.height), (32, 18));
    assert_eq!(slot.updates(), 2);
    assert!(!rx.has_changed().unwrap());
  }

  #[test]
  fn clones_share_the_slot() {
    let slot = DisplaySlot::new();
    let writer = slot.clone();
    writer.show(&RgbImage::new(4, 4), "frame").unwrap();
    assert_eq!(slot.current().unwrap().sequence, 1);

    slot.clear();
    assert!(writer.current().is_none());
  }

  #[test]
  fn packet_is_length_prefixed_json_then_jpeg() {
    let slot = DisplaySlot::new();
    slot.show(&RgbImage::new(8, 8), "Detected Video").unwrap();
    let frame = slot.current().unwrap();
    let packet = frame.to_packet().unwrap();

    let json_len = u32::from_le_bytes(packet[..4].try_into().unwrap()) as usize;
    let meta: serde_json::Value = serde_json::from_slice(&packet[4..4 + json_len]).unwrap();
    assert_eq!(meta["caption"], "Detected Video");
    assert_eq!(meta["sequence"], 1);
    assert!(meta.get("jpeg").is_none());
    assert_eq!(&packet[4 + json_len..], frame.jpeg.as_slice());
  }
}
