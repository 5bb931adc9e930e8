// 该文件是 Lensa 项目的一部分。
// src/model/classify.rs - 图像分类
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

use std::path::Path;

use tracing::{debug, info, warn};

use crate::{
  model::{
    Category, ClassificationResult, Classifier, ClassifierMetadata, LabelSet, LoadError,
    OnnxSession, PredictError,
  },
  preprocess::{NormalizeOptions, NormalizedTensor},
};

const BINARY_DECISION: f32 = 0.5;

/// ONNX 导出的 Keras/TensorFlow 分类模型
pub struct OnnxClassifier {
  session: OnnxSession,
  labels: LabelSet,
  meta: ClassifierMetadata,
}

impl OnnxClassifier {
  pub fn load(model_path: &Path, metadata_path: &Path) -> Result<Self, LoadError> {
    let meta = ClassifierMetadata::from_path(metadata_path)?;
    let labels = meta.label_set()?;
    let session = OnnxSession::load(model_path)?;

    // 静态类别维度必须与标签数量一致
    if let Some(&classes) = session.output_shape().and_then(|s| s.last())
      && classes > 0
    {
      let expected = if labels.len() == 2 && classes == 1 {
        1
      } else {
        labels.len()
      };
      if classes as usize != expected {
        return Err(LoadError::LabelMismatch {
          model_classes: classes as usize,
          labels: labels.len(),
        });
      }
    }

    if let Some(shape) = session.input_shape() {
      let [w, h] = meta.input_size;
      let declares = |a: i64, b: i64| a == h as i64 && b == w as i64;
      let matches = shape.len() == 4 && (declares(shape[1], shape[2]) || declares(shape[2], shape[3]));
      let dynamic = shape.iter().skip(1).any(|&d| d <= 0);
      if !matches && !dynamic {
        warn!(
          "元数据 input_size {}x{} 与模型声明的输入 {:?} 不一致，推理时将报告形状错误",
          w, h, shape
        );
      }
    }

    info!(
      "分类模型 {}: {} 个类别, 输入 {}x{}",
      session.name(),
      labels.len(),
      meta.input_size[0],
      meta.input_size[1]
    );
    Ok(Self {
      session,
      labels,
      meta,
    })
  }
}

impl Classifier for OnnxClassifier {
  fn name(&self) -> &str {
    self.session.name()
  }

  fn labels(&self) -> &LabelSet {
    &self.labels
  }

  fn input_size(&self) -> (u32, u32) {
    (self.meta.input_size[0], self.meta.input_size[1])
  }

  fn normalize_options(&self) -> NormalizeOptions {
    self.meta.normalize_options()
  }

  fn low_confidence_threshold(&self) -> f32 {
    self.meta.low_confidence
  }

  fn forward(&self, tensor: &NormalizedTensor) -> Result<Vec<f32>, PredictError> {
    let (_, data) = self.session.run(tensor)?;
    Ok(data)
  }
}

fn softmax(values: &[f32]) -> Vec<f32> {
  let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
  let exps: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
  let sum: f32 = exps.iter().sum();
  exps.into_iter().map(|e| e / sum).collect()
}

fn argmax(values: &[f32]) -> Option<(usize, f32)> {
  values
    .iter()
    .copied()
    .enumerate()
    .fold(None, |best, (i, v)| match best {
      Some((_, b)) if b >= v => best,
      _ => Some((i, v)),
    })
}

/// 把原始输出变成 (类别索引, 置信度, 每类概率)
fn scores_from_output(
  model: &str,
  output: &[f32],
  labels: &LabelSet,
) -> Result<(usize, f32, Vec<f32>), PredictError> {
  if output.is_empty() {
    return Err(PredictError::EmptyOutput(model.to_string()));
  }
  if output.iter().any(|v| !v.is_finite()) {
    return Err(PredictError::MalformedOutput {
      model: model.to_string(),
      message: "输出包含 NaN 或无穷大".to_string(),
    });
  }

  // 单值输出为 sigmoid 二分类，超出 [0, 1] 的视为 logit
  if output.len() == 1 {
    if labels.len() != 2 {
      return Err(PredictError::LabelMismatch {
        outputs: 1,
        labels: labels.len(),
      });
    }
    let raw = output[0];
    let p = if (0.0..=1.0).contains(&raw) {
      raw
    } else {
      debug!("单值输出不是概率，按 logit 处理");
      1.0 / (1.0 + (-raw).exp())
    };
    let index = usize::from(p > BINARY_DECISION);
    let confidence = if index == 1 { p } else { 1.0 - p };
    return Ok((index, confidence, vec![1.0 - p, p]));
  }

  if output.len() != labels.len() {
    return Err(PredictError::LabelMismatch {
      outputs: output.len(),
      labels: labels.len(),
    });
  }

  let probabilities = if output.iter().all(|v| (0.0..=1.0).contains(v)) {
    output.to_vec()
  } else {
    debug!("输出不是概率分布，按 logits 处理");
    softmax(output)
  };
  let (index, confidence) = argmax(&probabilities).ok_or_else(|| PredictError::EmptyOutput(model.to_string()))?;
  Ok((index, confidence.clamp(0.0, 1.0), probabilities))
}

/// 使用模型元数据中的低置信度阈值分类
pub fn classify(
  model: &dyn Classifier,
  tensor: &NormalizedTensor,
) -> Result<ClassificationResult, PredictError> {
  classify_with_threshold(model, tensor, model.low_confidence_threshold())
}

pub fn classify_with_threshold(
  model: &dyn Classifier,
  tensor: &NormalizedTensor,
  low_confidence: f32,
) -> Result<ClassificationResult, PredictError> {
  let output = model.forward(tensor)?;
  let labels = model.labels();
  let (index, confidence, probabilities) = scores_from_output(model.name(), &output, labels)?;

  let label = labels
    .get(index)
    .ok_or(PredictError::LabelMismatch {
      outputs: output.len(),
      labels: labels.len(),
    })?
    .to_string();

  let mut categories: Vec<_> = probabilities
    .iter()
    .enumerate()
    .filter_map(|(i, &score)| {
      labels.get(i).map(|l| Category {
        index: i,
        label: l.to_string(),
        score,
      })
    })
    .collect();
  categories.sort_by(|a, b| b.score.total_cmp(&a.score));

  let low_confidence = confidence < low_confidence;
  debug!(
    "分类结果: {} ({:.2}%){}",
    label,
    confidence * 100.0,
    if low_confidence { " [低置信度]" } else { "" }
  );
  Ok(ClassificationResult {
    index,
    label,
    confidence,
    low_confidence,
    categories,
  })
}
