// 该文件是 Lensa 项目的一部分。
// src/model/metadata.rs - 标签与训练元数据
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

use std::{collections::HashSet, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
  model::LoadError,
  preprocess::{Normalization, NormalizeOptions, TensorLayout},
};

pub const DEFAULT_CLASSIFIER_INPUT: [u32; 2] = [224, 224];
pub const DEFAULT_LOW_CONFIDENCE: f32 = 0.7;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LabelError {
  #[error("标签列表为空")]
  Empty,
  #[error("第 {0} 个标签为空")]
  Blank(usize),
  #[error("标签重复: {0}")]
  Duplicate(String),
}

/// 有序的类别名列表。顺序必须来自模型训练时的配置，不做任何假设。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelSet {
  labels: Box<[String]>,
}

impl LabelSet {
  pub fn new<I, S>(labels: I) -> Result<Self, LabelError>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
    if labels.is_empty() {
      return Err(LabelError::Empty);
    }
    let mut seen = HashSet::with_capacity(labels.len());
    for (i, label) in labels.iter().enumerate() {
      if label.trim().is_empty() {
        return Err(LabelError::Blank(i));
      }
      if !seen.insert(label.as_str()) {
        return Err(LabelError::Duplicate(label.clone()));
      }
    }
    Ok(Self {
      labels: labels.into_boxed_slice(),
    })
  }

  pub fn len(&self) -> usize {
    self.labels.len()
  }

  pub fn is_empty(&self) -> bool {
    self.labels.is_empty()
  }

  pub fn get(&self, index: usize) -> Option<&str> {
    self.labels.get(index).map(String::as_str)
  }

  pub fn as_slice(&self) -> &[String] {
    &self.labels
  }
}

/// 分类模型旁边的训练元数据 JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifierMetadata {
  pub labels: Vec<String>,
  /// [宽, 高]
  #[serde(default = "default_input_size")]
  pub input_size: [u32; 2],
  #[serde(default)]
  pub normalization: Normalization,
  #[serde(default)]
  pub layout: TensorLayout,
  #[serde(default = "default_low_confidence")]
  pub low_confidence: f32,
}

fn default_input_size() -> [u32; 2] {
  DEFAULT_CLASSIFIER_INPUT
}

fn default_low_confidence() -> f32 {
  DEFAULT_LOW_CONFIDENCE
}

impl ClassifierMetadata {
  pub fn from_json_str(json: &str, origin: &Path) -> Result<Self, LoadError> {
    let meta: Self = serde_json::from_str(json).map_err(|e| LoadError::Metadata {
      path: origin.to_path_buf(),
      message: e.to_string(),
    })?;
    meta.check(origin)?;
    Ok(meta)
  }

  pub fn from_path(path: &Path) -> Result<Self, LoadError> {
    debug!("读取模型元数据: {}", path.display());
    let json = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json_str(&json, path)
  }

  fn check(&self, origin: &Path) -> Result<(), LoadError> {
    let [w, h] = self.input_size;
    if w == 0 || h == 0 {
      return Err(LoadError::Metadata {
        path: origin.to_path_buf(),
        message: format!("input_size 无效: {}x{}", w, h),
      });
    }
    if !(0.0..=1.0).contains(&self.low_confidence) {
      return Err(LoadError::Metadata {
        path: origin.to_path_buf(),
        message: format!("low_confidence 必须在 [0, 1] 内: {}", self.low_confidence),
      });
    }
    Ok(())
  }

  pub fn label_set(&self) -> Result<LabelSet, LabelError> {
    LabelSet::new(self.labels.iter().cloned())
  }

  pub fn normalize_options(&self) -> NormalizeOptions {
    NormalizeOptions {
      normalization: self.normalization,
      layout: self.layout,
      ..Default::default()
    }
  }
}

#[derive(Deserialize)]
struct LabelFile {
  labels: Vec<String>,
}

/// 读取只含 `labels` 数组的 JSON 文件（检测器类别表）
pub(crate) fn read_label_file(path: &Path) -> Result<LabelSet, LoadError> {
  let json = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
    path: path.to_path_buf(),
    source,
  })?;
  let file: LabelFile = serde_json::from_str(&json).map_err(|e| LoadError::Metadata {
    path: path.to_path_buf(),
    message: e.to_string(),
  })?;
  Ok(LabelSet::new(file.labels)?)
}

/// 解析 Ultralytics 导出时写入 ONNX 元数据的 `names` 字段，
/// 形如 `{0: 'notsmoking', 1: 'smoking'}`。
pub fn parse_ultralytics_names(raw: &str) -> Option<Vec<String>> {
  let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
  let mut pairs: Vec<(usize, String)> = Vec::new();
  let mut rest = body.trim();

  while !rest.is_empty() {
    let colon = rest.find(':')?;
    let index: usize = rest[..colon].trim().parse().ok()?;
    let after = rest[colon + 1..].trim_start();
    let quote = after.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let value_body = &after[1..];
    let end = value_body.find(quote)?;
    pairs.push((index, value_body[..end].to_string()));

    rest = value_body[end + 1..].trim_start();
    rest = rest.strip_prefix(',').unwrap_or(rest).trim_start();
  }

  pairs.sort_by_key(|(i, _)| *i);
  let contiguous = pairs.iter().enumerate().all(|(pos, (i, _))| pos == *i);
  if pairs.is_empty() || !contiguous {
    return None;
  }
  Some(pairs.into_iter().map(|(_, name)| name).collect())
}
