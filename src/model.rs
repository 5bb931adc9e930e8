// 该文件是 Lensa 项目的一部分。
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
// Copyright (C) 2026 Lensa contributors

use std::{fmt, path::PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::{
  frame::RgbFrame,
  preprocess::{NormalizeOptions, NormalizedTensor, PreprocessError},
};

mod classify;
mod detect;
mod metadata;
mod nms;
mod onnx;

pub use self::classify::{OnnxClassifier, classify, classify_with_threshold};
pub use self::detect::{AllowList, OnnxDetector, YoloParams, decode_yolo_output, detect};
pub use self::metadata::{
  ClassifierMetadata, DEFAULT_CLASSIFIER_INPUT, DEFAULT_LOW_CONFIDENCE, LabelError, LabelSet,
  parse_ultralytics_names,
};
pub use self::nms::non_max_suppression;
pub use self::onnx::OnnxSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
  Classifier,
  Detector,
}

impl fmt::Display for ModelKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModelKind::Classifier => write!(f, "classifier"),
      ModelKind::Detector => write!(f, "detector"),
    }
  }
}

#[derive(Error, Debug)]
pub enum LoadError {
  #[error("模型文件不存在: {0}")]
  NotFound(PathBuf),
  #[error("读取模型文件失败 {path}: {source}")]
  Io {
    path: PathBuf,
    source: std::io::Error,
  },
  #[error("模型文件无效 {path}: {message}")]
  Corrupt { path: PathBuf, message: String },
  #[error("推理运行时不可用: {0}")]
  RuntimeUnavailable(String),
  #[error("模型元数据错误 {path}: {message}")]
  Metadata { path: PathBuf, message: String },
  #[error("标签配置错误: {0}")]
  Labels(#[from] LabelError),
  #[error("模型输出 {model_classes} 个类别，但标签列表有 {labels} 个")]
  LabelMismatch { model_classes: usize, labels: usize },
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
  #[error("不支持的模型结构: {0}")]
  Unsupported(String),
}

#[derive(Error, Debug)]
pub enum PredictError {
  #[error("模型不可用: {0}")]
  Unavailable(String),
  #[error("模型 '{model}' 输入形状不匹配: 期望 {expected:?}, 实际 {actual:?}。{remediation}")]
  ShapeMismatch {
    model: String,
    expected: Vec<i64>,
    actual: Vec<usize>,
    remediation: String,
  },
  #[error("模型输出 {outputs} 个值，但标签列表只有 {labels} 个，拒绝越界的类别索引")]
  LabelMismatch { outputs: usize, labels: usize },
  #[error("模型 '{0}' 输出为空")]
  EmptyOutput(String),
  #[error("模型 '{model}' 输出无法解析: {message}")]
  MalformedOutput { model: String, message: String },
  #[error("预处理失败: {0}")]
  Preprocess(#[from] PreprocessError),
  #[error("模型 '{model}' 推理失败: {message}")]
  Runtime { model: String, message: String },
}

/// 某个类别的得分
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Category {
  pub index: usize,
  pub label: String,
  pub score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
  pub index: usize,
  pub label: String,
  /// [0, 1]
  pub confidence: f32,
  /// 置信度低于阈值，仅影响展示方式
  pub low_confidence: bool,
  /// 按得分降序
  pub categories: Vec<Category>,
}

/// 原图像素坐标下的矩形框，保证 x1 < x2、y1 < y2
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BoundingBox {
  x1: f32,
  y1: f32,
  x2: f32,
  y2: f32,
}

impl BoundingBox {
  /// 退化或含 NaN 的框返回 `None`
  pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Option<Self> {
    if x1 < x2 && y1 < y2 {
      Some(Self { x1, y1, x2, y2 })
    } else {
      None
    }
  }

  pub fn from_array(bbox: [f32; 4]) -> Option<Self> {
    Self::new(bbox[0], bbox[1], bbox[2], bbox[3])
  }

  pub fn x1(&self) -> f32 {
    self.x1
  }

  pub fn y1(&self) -> f32 {
    self.y1
  }

  pub fn x2(&self) -> f32 {
    self.x2
  }

  pub fn y2(&self) -> f32 {
    self.y2
  }

  pub fn width(&self) -> f32 {
    self.x2 - self.x1
  }

  pub fn height(&self) -> f32 {
    self.y2 - self.y1
  }

  pub fn area(&self) -> f32 {
    self.width() * self.height()
  }

  pub fn iou(&self, other: &BoundingBox) -> f32 {
    let ix1 = self.x1.max(other.x1);
    let iy1 = self.y1.max(other.y1);
    let ix2 = self.x2.min(other.x2);
    let iy2 = self.y2.min(other.y2);
    let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
    let union = self.area() + other.area() - inter;
    if union <= 0.0 { 0.0 } else { inter / union }
  }
}

/// 检测器内部阈值过滤后的原始输出
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
  pub class_id: usize,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
  pub class_id: usize,
  pub label: String,
  pub confidence: f32,
  pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DetectionOutcome {
  Detected { items: Vec<Detection> },
  /// 检测器没有找到任何物体
  NothingDetected,
  /// 检测器找到了物体，但都不在允许列表中
  NoTarget { ignored: Vec<String> },
}

impl DetectionOutcome {
  /// "未检测到目标"：不区分是否存在被过滤的物体
  pub fn is_empty(&self) -> bool {
    !matches!(self, DetectionOutcome::Detected { .. })
  }

  pub fn items(&self) -> &[Detection] {
    match self {
      DetectionOutcome::Detected { items } => items,
      _ => &[],
    }
  }
}

/// 图像分类模型
pub trait Classifier: Send + Sync {
  fn name(&self) -> &str;
  fn labels(&self) -> &LabelSet;
  /// (宽, 高)
  fn input_size(&self) -> (u32, u32);
  fn normalize_options(&self) -> NormalizeOptions;
  fn low_confidence_threshold(&self) -> f32 {
    DEFAULT_LOW_CONFIDENCE
  }
  /// 前向推理，返回原始输出向量
  fn forward(&self, tensor: &NormalizedTensor) -> Result<Vec<f32>, PredictError>;
}

/// 目标检测模型
pub trait Detector: Send + Sync {
  fn name(&self) -> &str;
  /// 模型自带的类别名表，按 class_id 索引
  fn class_names(&self) -> &[String];
  fn infer(&self, frame: &RgbFrame, confidence: f32) -> Result<Vec<RawDetection>, PredictError>;
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn degenerate_boxes_are_rejected() {
    assert!(BoundingBox::new(10.0, 10.0, 10.0, 20.0).is_none());
    assert!(BoundingBox::new(10.0, 20.0, 15.0, 5.0).is_none());
    assert!(BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_none());
    assert!(BoundingBox::new(0.0, 0.0, 1.0, 1.0).is_some());
  }

  #[test]
  fn iou_of_half_overlap() {
    let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0).unwrap();
    let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0).unwrap();
    assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-6);
    assert_eq!(a.iou(&a), 1.0);
  }

  #[test]
  fn outcome_emptiness_conflates_no_target() {
    assert!(DetectionOutcome::NothingDetected.is_empty());
    assert!(
      DetectionOutcome::NoTarget {
        ignored: vec!["person".to_string()]
      }
      .is_empty()
    );
    assert!(!DetectionOutcome::Detected { items: vec![] }.is_empty());
  }
}
