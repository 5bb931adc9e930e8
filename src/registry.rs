// 该文件是 Lensa 项目的一部分。
// src/registry.rs - 模型注册表
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

//! 每个模型来源（模型文件、标签来源与参数）只加载一次，结果（包括失败）缓存到进程结束。
//! 加载失败不会中断程序，而是得到 [`ModelSlot::Unavailable`]。

use std::{
  collections::HashMap,
  path::{Path, PathBuf},
  sync::{Arc, Mutex},
};

use tracing::{error, info};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  model::{
    Classifier, Detector, LoadError, ModelKind, OnnxClassifier, OnnxDetector, PredictError,
    YoloParams,
  },
  path_from_url,
};

/// 加载结果：可用的模型，或不可用的原因
pub enum ModelSlot<M: ?Sized> {
  Available(Arc<M>),
  Unavailable(String),
}

impl<M: ?Sized> Clone for ModelSlot<M> {
  fn clone(&self) -> Self {
    match self {
      ModelSlot::Available(model) => ModelSlot::Available(Arc::clone(model)),
      ModelSlot::Unavailable(reason) => ModelSlot::Unavailable(reason.clone()),
    }
  }
}

impl<M: ?Sized> std::fmt::Debug for ModelSlot<M> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      ModelSlot::Available(_) => f.write_str("Available(..)"),
      ModelSlot::Unavailable(reason) => f.debug_tuple("Unavailable").field(reason).finish(),
    }
  }
}

impl<M: ?Sized> ModelSlot<M> {
  pub fn is_available(&self) -> bool {
    matches!(self, ModelSlot::Available(_))
  }

  pub fn get(&self) -> Result<&M, PredictError> {
    match self {
      ModelSlot::Available(model) => Ok(model.as_ref()),
      ModelSlot::Unavailable(reason) => Err(PredictError::Unavailable(reason.clone())),
    }
  }
}

/// 分类模型文件及其训练元数据
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClassifierSource {
  pub model: PathBuf,
  pub metadata: PathBuf,
}

impl ClassifierSource {
  /// 元数据默认与模型同名，扩展名为 `.json`
  pub fn new(model: impl Into<PathBuf>) -> Self {
    let model = model.into();
    let metadata = model.with_extension("json");
    Self { model, metadata }
  }

  pub fn with_metadata(mut self, metadata: impl Into<PathBuf>) -> Self {
    self.metadata = metadata.into();
    self
  }
}

impl FromUrlWithScheme for ClassifierSource {
  const SCHEME: &'static str = "classifier";
}

impl FromUrl for ClassifierSource {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Ok(Self::new(path_from_url(url)))
  }
}

/// 检测模型文件、可选的类别名文件与推理参数
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DetectorSource {
  pub model: PathBuf,
  pub labels: Option<PathBuf>,
  pub params: YoloParams,
}

impl DetectorSource {
  pub fn new(model: impl Into<PathBuf>) -> Self {
    Self {
      model: model.into(),
      labels: None,
      params: YoloParams::default(),
    }
  }

  pub fn with_labels(mut self, labels: impl Into<PathBuf>) -> Self {
    self.labels = Some(labels.into());
    self
  }

  pub fn with_params(mut self, params: YoloParams) -> Self {
    self.params = params;
    self
  }
}

impl FromUrlWithScheme for DetectorSource {
  const SCHEME: &'static str = "detector";
}

impl FromUrl for DetectorSource {
  type Error = LoadError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    check_scheme(url, Self::SCHEME)?;
    Ok(Self::new(path_from_url(url)))
  }
}

fn check_scheme(url: &Url, expected: &str) -> Result<(), LoadError> {
  if url.scheme() != expected {
    error!(
      "URI scheme mismatch: expected '{}', found '{}'",
      expected,
      url.scheme()
    );
    return Err(LoadError::SchemeMismatch {
      expected: expected.to_string(),
      actual: url.scheme().to_string(),
    });
  }
  Ok(())
}

/// 真正构造模型的地方，测试中可替换为桩实现
pub trait ModelLoader: Send + Sync {
  fn load_classifier(&self, source: &ClassifierSource) -> Result<Arc<dyn Classifier>, LoadError>;
  fn load_detector(&self, source: &DetectorSource) -> Result<Arc<dyn Detector>, LoadError>;
}

/// 基于 ONNX Runtime 的加载器
#[derive(Debug, Default, Clone, Copy)]
pub struct OnnxLoader;

impl ModelLoader for OnnxLoader {
  fn load_classifier(&self, source: &ClassifierSource) -> Result<Arc<dyn Classifier>, LoadError> {
    Ok(Arc::new(OnnxClassifier::load(&source.model, &source.metadata)?))
  }

  fn load_detector(&self, source: &DetectorSource) -> Result<Arc<dyn Detector>, LoadError> {
    Ok(Arc::new(OnnxDetector::load(
      &source.model,
      source.labels.as_deref(),
      source.params,
    )?))
  }
}

/// 模型注册表，由调用方构造后注入到分发器中
pub struct ModelRegistry {
  loader: Box<dyn ModelLoader>,
  // 同一模型文件配不同的标签文件是不同的模型
  classifiers: Mutex<HashMap<ClassifierSource, ModelSlot<dyn Classifier>>>,
  detectors: Mutex<HashMap<DetectorSource, ModelSlot<dyn Detector>>>,
}

impl Default for ModelRegistry {
  fn default() -> Self {
    Self::new(OnnxLoader)
  }
}

impl ModelRegistry {
  pub fn new(loader: impl ModelLoader + 'static) -> Self {
    Self {
      loader: Box::new(loader),
      classifiers: Mutex::new(HashMap::new()),
      detectors: Mutex::new(HashMap::new()),
    }
  }

  /// 直接放入一个已构造的分类模型
  pub fn insert_classifier(&self, source: ClassifierSource, model: Arc<dyn Classifier>) {
    lock(&self.classifiers).insert(source, ModelSlot::Available(model));
  }

  pub fn insert_detector(&self, source: DetectorSource, model: Arc<dyn Detector>) {
    lock(&self.detectors).insert(source, ModelSlot::Available(model));
  }

  pub fn classifier(&self, source: &ClassifierSource) -> ModelSlot<dyn Classifier> {
    let mut cache = lock(&self.classifiers);
    cache
      .entry(source.clone())
      .or_insert_with(|| to_slot(ModelKind::Classifier, &source.model, self.loader.load_classifier(source)))
      .clone()
  }

  pub fn detector(&self, source: &DetectorSource) -> ModelSlot<dyn Detector> {
    let mut cache = lock(&self.detectors);
    cache
      .entry(source.clone())
      .or_insert_with(|| to_slot(ModelKind::Detector, &source.model, self.loader.load_detector(source)))
      .clone()
  }

  /// 已缓存的模型数量（含不可用的）
  pub fn len(&self) -> usize {
    lock(&self.classifiers).len() + lock(&self.detectors).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

// 缓存中的值只会被插入，不会处于半更新状态，锁中毒时继续使用
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn to_slot<M: ?Sized>(
  kind: ModelKind,
  path: &Path,
  loaded: Result<Arc<M>, LoadError>,
) -> ModelSlot<M> {
  match loaded {
    Ok(model) => {
      info!("{} 模型已就绪: {}", kind, path.display());
      ModelSlot::Available(model)
    }
    Err(e) => {
      error!("{} 模型加载失败: {}", kind, e);
      ModelSlot::Unavailable(e.to_string())
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct Failing {
    calls: Arc<AtomicUsize>,
  }

  impl ModelLoader for Failing {
    fn load_classifier(&self, source: &ClassifierSource) -> Result<Arc<dyn Classifier>, LoadError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Err(LoadError::NotFound(source.model.clone()))
    }

    fn load_detector(&self, source: &DetectorSource) -> Result<Arc<dyn Detector>, LoadError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      Err(LoadError::NotFound(source.model.clone()))
    }
  }

  #[test]
  fn failed_load_is_cached_as_unavailable() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::new(Failing {
      calls: calls.clone(),
    });
    let source = ClassifierSource::new("model/Shafa Laporan 2.onnx");

    let first = registry.classifier(&source);
    let second = registry.classifier(&source);
    assert!(!first.is_available());
    assert!(matches!(second, ModelSlot::Unavailable(reason) if reason.contains("Shafa Laporan 2")));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    registry.detector(&DetectorSource::new("model/Shafa Laporan 4.onnx"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(registry.len(), 2);
  }

  #[test]
  fn metadata_is_part_of_the_cache_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let registry = ModelRegistry::new(Failing {
      calls: calls.clone(),
    });
    let rice_a = ClassifierSource::new("rice.onnx").with_metadata("rice_a.json");
    let rice_b = ClassifierSource::new("rice.onnx").with_metadata("rice_b.json");

    registry.classifier(&rice_a);
    registry.classifier(&rice_b);
    registry.classifier(&rice_a);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let plain = DetectorSource::new("best.onnx");
    registry.detector(&plain);
    registry.detector(&plain.clone().with_labels("smoking.json"));
    registry.detector(&plain.clone().with_params(YoloParams {
      iou_threshold: 0.6,
      ..YoloParams::default()
    }));
    registry.detector(&DetectorSource::new("best.onnx"));
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(registry.len(), 5);
  }

  #[test]
  fn default_loader_reports_missing_file() {
    let registry = ModelRegistry::default();
    let slot = registry.detector(&DetectorSource::new("/nonexistent/best.onnx"));
    assert!(matches!(slot.get(), Err(PredictError::Unavailable(_))));
  }

  #[test]
  fn sources_from_url() {
    let url = Url::parse("classifier:///models/Shafa%20Laporan%202.onnx").unwrap();
    let source = ClassifierSource::from_url(&url).unwrap();
    assert_eq!(source.model, PathBuf::from("/models/Shafa Laporan 2.onnx"));
    assert_eq!(source.metadata, PathBuf::from("/models/Shafa Laporan 2.json"));

    let url = Url::parse("detector:///models/best.onnx").unwrap();
    assert!(matches!(
      ClassifierSource::from_url(&url),
      Err(LoadError::SchemeMismatch { .. })
    ));
    assert_eq!(
      DetectorSource::from_url(&url).unwrap().model,
      PathBuf::from("/models/best.onnx")
    );
  }
}
