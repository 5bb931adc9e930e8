// 该文件是 Lensa 项目的一部分。
// src/dispatch.rs - 推理分发
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

//! 根据任务类型把一张上传图像交给对应模型，所有失败都转换为提示信息。

use std::{fmt, str::FromStr, sync::Arc, time::Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::{
  frame::RgbFrame,
  input::{DecodeError, decode_bytes},
  model::{
    AllowList, ClassificationResult, DetectionOutcome, PredictError, classify_with_threshold, detect,
  },
  preprocess::normalize,
  registry::{ClassifierSource, DetectorSource, ModelRegistry},
};

pub const DEFAULT_DETECTION_CONFIDENCE: f32 = 0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Task {
  Classify,
  Detect,
}

impl fmt::Display for Task {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Task::Classify => write!(f, "classify"),
      Task::Detect => write!(f, "detect"),
    }
  }
}

impl FromStr for Task {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "classify" | "classification" => Ok(Task::Classify),
      "detect" | "detection" => Ok(Task::Detect),
      other => Err(format!("未知任务: {}（可选 classify / detect）", other)),
    }
  }
}

/// 一次上传：解码后的图像与所选任务
#[derive(Debug, Clone)]
pub struct InferenceRequest {
  pub frame: RgbFrame,
  pub task: Task,
}

impl InferenceRequest {
  pub fn new(frame: RgbFrame, task: Task) -> Self {
    Self { frame, task }
  }

  pub fn from_bytes(bytes: &[u8], task: Task) -> Result<Self, DecodeError> {
    Ok(Self::new(decode_bytes(bytes)?, task))
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Success,
  Info,
  Warning,
  Error,
}

/// 展示给用户的提示，不会中断进程
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
  pub severity: Severity,
  pub message: String,
}

impl Notice {
  pub fn new(severity: Severity, message: impl Into<String>) -> Self {
    Self {
      severity,
      message: message.into(),
    }
  }
}

impl fmt::Display for Notice {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let tag = match self.severity {
      Severity::Success => "成功",
      Severity::Info => "提示",
      Severity::Warning => "警告",
      Severity::Error => "错误",
    };
    write!(f, "[{}] {}", tag, self.message)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
  Classified(ClassificationResult),
  Detected(DetectionOutcome),
  /// 本次请求未产生结果，原因见提示信息
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
  pub task: Task,
  pub outcome: Outcome,
  pub notice: Notice,
}

impl Response {
  fn failed(task: Task, message: impl Into<String>) -> Self {
    Self {
      task,
      outcome: Outcome::Failed,
      notice: Notice::new(Severity::Error, message),
    }
  }

  pub fn is_failed(&self) -> bool {
    matches!(self.outcome, Outcome::Failed)
  }

  pub fn classification(&self) -> Option<&ClassificationResult> {
    match &self.outcome {
      Outcome::Classified(result) => Some(result),
      _ => None,
    }
  }

  pub fn detection(&self) -> Option<&DetectionOutcome> {
    match &self.outcome {
      Outcome::Detected(outcome) => Some(outcome),
      _ => None,
    }
  }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
  pub classifier: Option<ClassifierSource>,
  pub detector: Option<DetectorSource>,
  pub detection_confidence: f32,
  /// 覆盖模型元数据中的低置信度阈值
  pub low_confidence: Option<f32>,
  pub allow_list: AllowList,
}

impl Default for DispatchConfig {
  fn default() -> Self {
    Self {
      classifier: None,
      detector: None,
      detection_confidence: DEFAULT_DETECTION_CONFIDENCE,
      low_confidence: None,
      allow_list: AllowList::allow_all(),
    }
  }
}

pub struct Dispatcher {
  registry: Arc<ModelRegistry>,
  config: DispatchConfig,
}

impl Dispatcher {
  /// 构造时即加载已配置的模型，失败只记录提示
  pub fn new(registry: Arc<ModelRegistry>, config: DispatchConfig) -> Self {
    let dispatcher = Self { registry, config };
    for notice in dispatcher.startup_notices() {
      warn!("{}", notice);
    }
    dispatcher
  }

  pub fn config(&self) -> &DispatchConfig {
    &self.config
  }

  /// 不可用模型的提示信息，供界面常驻展示
  pub fn startup_notices(&self) -> Vec<Notice> {
    let mut notices = Vec::new();
    if let Some(source) = &self.config.classifier
      && let Err(e) = self.registry.classifier(source).get()
    {
      notices.push(Notice::new(Severity::Warning, format!("分类模型未加载: {}", e)));
    }
    if let Some(source) = &self.config.detector {
      match self.registry.detector(source).get() {
        Ok(detector) => {
          let unknown = self.config.allow_list.unknown_names(detector.class_names());
          if !unknown.is_empty() {
            notices.push(Notice::new(
              Severity::Warning,
              format!("允许列表中的类别不在检测模型类别表中: {}", unknown.join(", ")),
            ));
          }
        }
        Err(e) => {
          notices.push(Notice::new(Severity::Warning, format!("检测模型未加载: {}", e)))
        }
      }
    }
    notices
  }

  /// 处理原始上传字节；无法解码时只终止本次请求
  pub fn dispatch_bytes(&self, bytes: &[u8], task: Task) -> Response {
    match InferenceRequest::from_bytes(bytes, task) {
      Ok(request) => self.dispatch(&request),
      Err(e) => {
        warn!("上传图像无法解码: {}", e);
        Response::failed(task, format!("无法读取图像，请确认文件是有效的 JPEG/PNG: {}", e))
      }
    }
  }

  pub fn dispatch(&self, request: &InferenceRequest) -> Response {
    let now = Instant::now();
    let response = match request.task {
      Task::Classify => self.run_classify(&request.frame),
      Task::Detect => self.run_detect(&request.frame),
    };
    info!(
      "{} 请求完成，耗时: {:.2?}, {}",
      request.task,
      now.elapsed(),
      response.notice
    );
    response
  }

  fn run_classify(&self, frame: &RgbFrame) -> Response {
    let Some(source) = &self.config.classifier else {
      return Response::failed(Task::Classify, "未配置分类模型");
    };
    let slot = self.registry.classifier(source);
    let result = slot.get().and_then(|model| {
      let tensor = normalize(frame, model.input_size(), &model.normalize_options())?;
      let threshold = self
        .config
        .low_confidence
        .unwrap_or_else(|| model.low_confidence_threshold());
      classify_with_threshold(model, &tensor, threshold)
    });

    match result {
      Ok(result) => {
        let notice = if result.low_confidence {
          Notice::new(
            Severity::Warning,
            format!(
              "预测为 {}，但置信度较低 ({:.2}%)",
              result.label,
              result.confidence * 100.0
            ),
          )
        } else {
          Notice::new(
            Severity::Success,
            format!("预测为 {} ({:.2}%)", result.label, result.confidence * 100.0),
          )
        };
        Response {
          task: Task::Classify,
          outcome: Outcome::Classified(result),
          notice,
        }
      }
      Err(e) => Response::failed(Task::Classify, describe(&e)),
    }
  }

  fn run_detect(&self, frame: &RgbFrame) -> Response {
    let Some(source) = &self.config.detector else {
      return Response::failed(Task::Detect, "未配置检测模型");
    };
    let slot = self.registry.detector(source);
    let result = slot.get().and_then(|model| {
      detect(
        model,
        frame,
        self.config.detection_confidence,
        &self.config.allow_list,
      )
    });

    match result {
      Ok(outcome) => {
        let notice = match &outcome {
          DetectionOutcome::Detected { items } => {
            Notice::new(Severity::Success, format!("检测到 {} 个目标", items.len()))
          }
          DetectionOutcome::NothingDetected => Notice::new(Severity::Info, "未检测到目标"),
          DetectionOutcome::NoTarget { ignored } => Notice::new(
            Severity::Info,
            format!("未检测到目标（忽略了: {}）", ignored.join(", ")),
          ),
        };
        Response {
          task: Task::Detect,
          outcome: Outcome::Detected(outcome),
          notice,
        }
      }
      Err(e) => Response::failed(Task::Detect, describe(&e)),
    }
  }
}

fn describe(error: &PredictError) -> String {
  match error {
    PredictError::Unavailable(reason) => format!("模型未加载，无法预测: {}", reason),
    PredictError::ShapeMismatch { .. } => format!("输入尺寸与模型不一致: {}", error),
    other => format!("预测失败: {}", other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  use std::{
    io::Cursor,
    sync::{
      Mutex,
      atomic::{AtomicBool, Ordering},
    },
  };

  use image::{ImageFormat, Rgb, RgbImage};

  use crate::{
    model::{BoundingBox, Classifier, Detector, LabelSet, RawDetection},
    preprocess::{NormalizeOptions, NormalizedTensor},
  };

  #[test]
  fn task_parsing() {
    assert_eq!("classify".parse::<Task>(), Ok(Task::Classify));
    assert_eq!("Detection".parse::<Task>(), Ok(Task::Detect));
    assert!("segment".parse::<Task>().is_err());
  }

  #[test]
  fn unconfigured_task_fails_softly() {
    let dispatcher = Dispatcher::new(Arc::new(ModelRegistry::default()), DispatchConfig::default());
    let frame = RgbFrame::from(image::RgbImage::new(4, 4));
    let response = dispatcher.dispatch(&InferenceRequest::new(frame, Task::Detect));
    assert!(response.is_failed());
    assert_eq!(response.notice.severity, Severity::Error);
  }

  #[test]
  fn notice_display() {
    let notice = Notice::new(Severity::Warning, "置信度较低");
    assert_eq!(notice.to_string(), "[警告] 置信度较低");
  }

  const RICE: [&str; 5] = ["Arborio", "Basmati", "Ipsala", "Jasmine", "Karacadag"];

  /// 输出固定值的分类模型，并记录收到的张量形状
  struct StubClassifier {
    labels: LabelSet,
    output: Vec<f32>,
    seen: Mutex<Vec<Vec<usize>>>,
  }

  impl StubClassifier {
    fn new(output: Vec<f32>) -> Self {
      Self {
        labels: LabelSet::new(RICE).unwrap(),
        output,
        seen: Mutex::new(Vec::new()),
      }
    }
  }

  impl Classifier for StubClassifier {
    fn name(&self) -> &str {
      "stub-classifier"
    }

    fn labels(&self) -> &LabelSet {
      &self.labels
    }

    fn input_size(&self) -> (u32, u32) {
      (128, 128)
    }

    fn normalize_options(&self) -> NormalizeOptions {
      NormalizeOptions::default()
    }

    fn forward(&self, tensor: &NormalizedTensor) -> Result<Vec<f32>, PredictError> {
      self.seen.lock().unwrap().push(tensor.shape().to_vec());
      // 让输出依赖像素值，检验相同输入得到相同结果
      let mean = tensor.as_slice().iter().sum::<f32>() / tensor.as_slice().len() as f32;
      Ok(self.output.iter().map(|v| v + mean).collect())
    }
  }

  /// 第一次推理报告输入形状不匹配，之后正常输出
  struct MismatchOnce {
    labels: LabelSet,
    failed: AtomicBool,
  }

  impl Classifier for MismatchOnce {
    fn name(&self) -> &str {
      "mismatch-once"
    }

    fn labels(&self) -> &LabelSet {
      &self.labels
    }

    fn input_size(&self) -> (u32, u32) {
      (128, 128)
    }

    fn normalize_options(&self) -> NormalizeOptions {
      NormalizeOptions::default()
    }

    fn forward(&self, tensor: &NormalizedTensor) -> Result<Vec<f32>, PredictError> {
      if !self.failed.swap(true, Ordering::SeqCst) {
        return Err(PredictError::ShapeMismatch {
          model: self.name().to_string(),
          expected: vec![-1, 224, 224, 3],
          actual: tensor.shape().to_vec(),
          remediation: "请在元数据中设置 \"input_size\": [224, 224]".to_string(),
        });
      }
      Ok(vec![0.9, 0.02, 0.02, 0.03, 0.03])
    }
  }

  struct StubDetector {
    names: Vec<String>,
    raw: Vec<RawDetection>,
  }

  impl StubDetector {
    fn new(raw: Vec<RawDetection>) -> Self {
      Self {
        names: ["person", "smoking", "notsmoking"]
          .map(String::from)
          .to_vec(),
        raw,
      }
    }
  }

  impl Detector for StubDetector {
    fn name(&self) -> &str {
      "stub-detector"
    }

    fn class_names(&self) -> &[String] {
      &self.names
    }

    fn infer(&self, _frame: &RgbFrame, _confidence: f32) -> Result<Vec<RawDetection>, PredictError> {
      Ok(self.raw.clone())
    }
  }

  fn raw(class_id: usize, confidence: f32) -> RawDetection {
    RawDetection {
      class_id,
      confidence,
      bbox: BoundingBox::new(10.0, 10.0, 50.0, 80.0).unwrap(),
    }
  }

  fn classify_dispatcher(model: Arc<StubClassifier>) -> Dispatcher {
    let registry = ModelRegistry::default();
    registry.insert_classifier(ClassifierSource::new("rice.onnx"), model);
    let config = DispatchConfig {
      classifier: Some(ClassifierSource::new("rice.onnx")),
      ..DispatchConfig::default()
    };
    Dispatcher::new(Arc::new(registry), config)
  }

  fn detect_dispatcher(model: StubDetector, allow: &[&str]) -> Dispatcher {
    let registry = ModelRegistry::default();
    registry.insert_detector(DetectorSource::new("smoking.onnx"), Arc::new(model));
    let config = DispatchConfig {
      detector: Some(DetectorSource::new("smoking.onnx")),
      allow_list: AllowList::new(allow.iter().copied()),
      ..DispatchConfig::default()
    };
    Dispatcher::new(Arc::new(registry), config)
  }

  fn jpeg(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
      .unwrap();
    bytes
  }

  #[test]
  fn white_image_classifies_identically_twice() {
    let dispatcher = classify_dispatcher(Arc::new(StubClassifier::new(vec![
      0.9, 0.02, 0.02, 0.03, 0.03,
    ])));
    let bytes = jpeg(32, 32);
    let first = dispatcher.dispatch_bytes(&bytes, Task::Classify);
    let second = dispatcher.dispatch_bytes(&bytes, Task::Classify);
    assert_eq!(first, second);

    let result = first.classification().unwrap();
    assert!(RICE.contains(&result.label.as_str()));
    assert!((0.0..=1.0).contains(&result.confidence));
  }

  #[test]
  fn corrupt_upload_fails_only_that_request() {
    let dispatcher = classify_dispatcher(Arc::new(StubClassifier::new(vec![
      0.9, 0.02, 0.02, 0.03, 0.03,
    ])));
    let bytes = jpeg(64, 64);
    let response = dispatcher.dispatch_bytes(&bytes[..24], Task::Classify);
    assert!(response.is_failed());
    assert_eq!(response.notice.severity, Severity::Error);

    // 之后的请求不受影响
    let response = dispatcher.dispatch_bytes(&bytes, Task::Classify);
    assert!(!response.is_failed());
  }

  #[test]
  fn large_image_is_resized_to_model_input() {
    let model = Arc::new(StubClassifier::new(vec![0.9, 0.02, 0.02, 0.03, 0.03]));
    let dispatcher = classify_dispatcher(model.clone());
    let response = dispatcher.dispatch_bytes(&jpeg(300, 300), Task::Classify);
    assert!(!response.is_failed());
    assert_eq!(*model.seen.lock().unwrap(), vec![vec![1, 128, 128, 3]]);
  }

  #[test]
  fn more_outputs_than_labels_is_rejected() {
    let dispatcher = classify_dispatcher(Arc::new(StubClassifier::new(vec![0.1; 7])));
    let response = dispatcher.dispatch_bytes(&jpeg(16, 16), Task::Classify);
    assert!(response.is_failed());
    assert!(response.classification().is_none());
    assert!(response.notice.message.contains('7'));
  }

  #[test]
  fn shape_mismatch_reports_remediation_and_recovers() {
    let registry = ModelRegistry::default();
    registry.insert_classifier(
      ClassifierSource::new("rice.onnx"),
      Arc::new(MismatchOnce {
        labels: LabelSet::new(RICE).unwrap(),
        failed: AtomicBool::new(false),
      }),
    );
    let config = DispatchConfig {
      classifier: Some(ClassifierSource::new("rice.onnx")),
      ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::new(Arc::new(registry), config);
    let bytes = jpeg(16, 16);

    let response = dispatcher.dispatch_bytes(&bytes, Task::Classify);
    assert!(response.is_failed());
    assert_eq!(response.notice.severity, Severity::Error);
    assert!(response.notice.message.contains("输入尺寸与模型不一致"));
    assert!(response.notice.message.contains("\"input_size\": [224, 224]"));

    let response = dispatcher.dispatch_bytes(&bytes, Task::Classify);
    assert!(!response.is_failed());
    assert_eq!(response.classification().unwrap().label, "Arborio");
  }

  #[test]
  fn low_confidence_is_a_warning() {
    let dispatcher = classify_dispatcher(Arc::new(StubClassifier::new(vec![
      0.3, 0.0, 0.0, 0.0, 0.0,
    ])));
    // 白图归一化后均值为 1，各项加 1 后 softmax 最大值约 0.25
    let response = dispatcher.dispatch_bytes(&jpeg(16, 16), Task::Classify);
    let result = response.classification().unwrap();
    assert_eq!(result.label, "Arborio");
    assert!(result.low_confidence);
    assert_eq!(response.notice.severity, Severity::Warning);
  }

  #[test]
  fn only_person_detected_with_smoking_allow_list() {
    let dispatcher = detect_dispatcher(
      StubDetector::new(vec![raw(0, 0.9)]),
      &["smoking", "notsmoking"],
    );
    let response = dispatcher.dispatch_bytes(&jpeg(64, 64), Task::Detect);
    let outcome = response.detection().unwrap();
    assert!(outcome.is_empty());
    assert_eq!(
      *outcome,
      DetectionOutcome::NoTarget {
        ignored: vec!["person".to_string()]
      }
    );
    assert_eq!(response.notice.severity, Severity::Info);
  }

  #[test]
  fn allowed_detections_are_labelled() {
    let dispatcher = detect_dispatcher(
      StubDetector::new(vec![raw(1, 0.8), raw(0, 0.95), raw(2, 0.1)]),
      &["smoking", "notsmoking"],
    );
    let response = dispatcher.dispatch_bytes(&jpeg(64, 64), Task::Detect);
    let items = response.detection().unwrap().items();
    // 低于默认阈值 0.25 的框被丢弃
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].label, "smoking");
    assert_eq!(response.notice.severity, Severity::Success);
  }

  #[test]
  fn nothing_detected_is_informational() {
    let dispatcher = detect_dispatcher(StubDetector::new(vec![]), &[]);
    let response = dispatcher.dispatch_bytes(&jpeg(64, 64), Task::Detect);
    assert_eq!(
      response.detection(),
      Some(&DetectionOutcome::NothingDetected)
    );
  }

  #[test]
  fn unavailable_model_reports_error_notice() {
    let config = DispatchConfig {
      classifier: Some(ClassifierSource::new("/nonexistent/model.onnx")),
      ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::new(Arc::new(ModelRegistry::default()), config);
    assert_eq!(dispatcher.startup_notices().len(), 1);

    let response = dispatcher.dispatch_bytes(&jpeg(16, 16), Task::Classify);
    assert!(response.is_failed());
    assert_eq!(response.notice.severity, Severity::Error);
  }

  #[test]
  fn unknown_allow_list_names_are_reported_at_startup() {
    let dispatcher = detect_dispatcher(StubDetector::new(vec![]), &["smoking", "vaping"]);
    let notices = dispatcher.startup_notices();
    assert_eq!(notices.len(), 1);
    assert!(notices[0].message.contains("vaping"));
  }
}
