// 该文件是 Tianyan （天眼） 项目的一部分。
// src/model/cache.rs - 模型缓存
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
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
  time::Instant,
};

use tracing::{debug, error, info};

use super::{Detector, ModelError, ModelHandle};

/// 从文件加载检测模型
pub trait ModelLoader: Send + Sync {
  fn load(&self, path: &Path) -> Result<Box<dyn Detector>, ModelError>;
}

/// 按路径缓存已加载的模型
///
/// 同一路径只加载一次，之后返回同一个 `Arc<ModelHandle>`。
/// 加载失败不会写入缓存。
pub struct ModelCache {
  loader: Box<dyn ModelLoader>,
  models: Mutex<HashMap<PathBuf, Arc<ModelHandle>>>,
}

impl ModelCache {
  pub fn new(loader: Box<dyn ModelLoader>) -> Self {
    Self {
      loader,
      models: Mutex::new(HashMap::new()),
    }
  }

  pub fn load(&self, path: &Path) -> Result<Arc<ModelHandle>, ModelError> {
    // 持锁加载，避免并发请求重复读取同一个模型
    let mut models = self.models.lock().unwrap_or_else(|e| e.into_inner());

    if let Some(handle) = models.get(path) {
      debug!("使用已缓存的模型: {}", path.display());
      return Ok(handle.clone());
    }

    info!("加载模型文件: {}", path.display());
    let now = Instant::now();
    let detector = self.loader.load(path).map_err(|e| {
      error!("模型加载失败: {}", e);
      e
    })?;
    info!("模型加载完成，耗时: {:.2?}", now.elapsed());

    let handle = Arc::new(ModelHandle::new(path, detector));
    models.insert(path.to_path_buf(), handle.clone());
    Ok(handle)
  }

  pub fn len(&self) -> usize {
    self.models.lock().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
