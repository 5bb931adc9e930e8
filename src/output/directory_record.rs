// 该文件是 Lensa 项目的一部分。
// src/output/directory_record.rs - 按日期记录结果到目录
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Lensa contributors

use std::{
  path::{Path, PathBuf},
  sync::atomic::{AtomicU16, Ordering},
};

use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  FromUrl, FromUrlWithScheme,
  dispatch::Response,
  frame::RgbFrame,
  output::Render,
  path_from_url,
};

#[cfg(feature = "save_image_file")]
use crate::output::draw::Draw;

#[derive(Error, Debug)]
pub enum DirectoryRecordOutputError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

#[derive(Serialize)]
struct RecordEntry<'a> {
  timestamp: DateTime<Utc>,
  image: &'a str,
  width: usize,
  height: usize,
  #[serde(flatten)]
  response: &'a Response,
}

/// 每次请求写入一张图像和一个同名 JSON 记录，按 年/月/日 分目录
pub struct DirectoryRecordOutput {
  directory: PathBuf,
  #[cfg(feature = "save_image_file")]
  draw: Draw,
  counter: AtomicU16,
  always: bool,
}

impl FromUrlWithScheme for DirectoryRecordOutput {
  const SCHEME: &'static str = "folder";
}

impl FromUrl for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn from_url(uri: &url::Url) -> Result<Self, Self::Error> {
    if uri.scheme() != Self::SCHEME {
      return Err(DirectoryRecordOutputError::SchemeMismatch);
    }

    let always = uri.query_pairs().any(|(k, _)| k == "always");
    Ok(Self::new(path_from_url(uri)).always(always))
  }
}

impl DirectoryRecordOutput {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      #[cfg(feature = "save_image_file")]
      draw: Draw::default(),
      counter: AtomicU16::new(0),
      always: false,
    }
  }

  /// 失败的请求默认不记录
  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  #[cfg(feature = "save_image_file")]
  pub fn with_draw(mut self, draw: Draw) -> Self {
    self.draw = draw;
    self
  }

  fn record_id(&self) -> u16 {
    self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
  }

  fn record_stem(&self, now: &DateTime<Utc>) -> Result<PathBuf, std::io::Error> {
    let directory = self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()));
    std::fs::create_dir_all(&directory)?;
    Ok(directory.join(format!(
      "{}-{:04X}",
      now.format("%H-%M-%S"),
      self.record_id()
    )))
  }

  fn save_image(
    &self,
    path: &Path,
    frame: &RgbFrame,
    result: &Response,
  ) -> Result<(), DirectoryRecordOutputError> {
    #[cfg(feature = "save_image_file")]
    let image = self.draw.render(frame, result);
    #[cfg(not(feature = "save_image_file"))]
    let image = {
      let _ = result;
      frame.to_rgb_image()
    };
    image.save(path)?;
    Ok(())
  }
}

impl Render<RgbFrame, Response> for DirectoryRecordOutput {
  type Error = DirectoryRecordOutputError;

  fn render_result(&self, frame: &RgbFrame, result: &Response) -> Result<(), Self::Error> {
    if result.is_failed() && !self.always {
      debug!("请求失败，跳过记录");
      return Ok(());
    }

    let now = Utc::now();
    let stem = self.record_stem(&now)?;
    let image_path = stem.with_extension("png");
    self.save_image(&image_path, frame, result)?;

    let image_name = image_path
      .file_name()
      .map(|n| n.to_string_lossy().into_owned())
      .unwrap_or_default();
    let entry = RecordEntry {
      timestamp: now,
      image: &image_name,
      width: frame.width(),
      height: frame.height(),
      response: result,
    };
    let json_path = stem.with_extension("json");
    std::fs::write(&json_path, serde_json::to_string_pretty(&entry)?)?;
    info!("记录结果到: {}", json_path.display());
    Ok(())
  }
}
