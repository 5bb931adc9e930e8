// 该文件是 Lensa 项目的一部分。
// src/model/detect.rs - YOLO 目标检测
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
  collections::{BTreeSet, HashSet},
  hash::{Hash, Hasher},
  path::Path,
};

use tracing::{debug, error, info, warn};

use crate::{
  frame::RgbFrame,
  model::{
    BoundingBox, Detection, DetectionOutcome, Detector, LoadError, OnnxSession, PredictError,
    RawDetection, metadata::read_label_file, non_max_suppression, parse_ultralytics_names,
  },
  preprocess::{Letterbox, letterbox},
};

const YOLO_BOX_VALUES: usize = 4;

#[derive(Debug, Clone, Copy)]
pub struct YoloParams {
  /// 正方形输入边长
  pub input_size: u32,
  pub iou_threshold: f32,
  pub max_detections: usize,
}

impl Default for YoloParams {
  fn default() -> Self {
    Self {
      input_size: 640,
      iou_threshold: 0.45,
      max_detections: 300,
    }
  }
}

// 阈值按位比较，参数可以作为模型缓存的键
impl PartialEq for YoloParams {
  fn eq(&self, other: &Self) -> bool {
    self.input_size == other.input_size
      && self.iou_threshold.to_bits() == other.iou_threshold.to_bits()
      && self.max_detections == other.max_detections
  }
}

impl Eq for YoloParams {}

impl Hash for YoloParams {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.input_size.hash(state);
    self.iou_threshold.to_bits().hash(state);
    self.max_detections.hash(state);
  }
}

/// 只保留应用关心的类别；为空时全部保留
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
  names: HashSet<String>,
}

impl AllowList {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  pub fn allow_all() -> Self {
    Self::default()
  }

  pub fn is_allow_all(&self) -> bool {
    self.names.is_empty()
  }

  pub fn allows(&self, name: &str) -> bool {
    self.names.is_empty() || self.names.contains(name)
  }

  /// 允许列表中检测器永远不会输出的类别名
  pub fn unknown_names(&self, class_names: &[String]) -> Vec<String> {
    let mut unknown: Vec<String> = self
      .names
      .iter()
      .filter(|n| !class_names.iter().any(|c| c == *n))
      .cloned()
      .collect();
    unknown.sort();
    unknown
  }
}

/// 判断输出是 [1, 4+nc, N] 还是 [1, N, 4+nc]，返回 (候选数, 是否通道优先)
fn match_output_layout(shape: &[i64], channels: usize) -> Option<(usize, bool)> {
  let (a, b) = match shape {
    [1, a, b] | [a, b] => ((*a).max(0) as usize, (*b).max(0) as usize),
    _ => return None,
  };
  if a == channels {
    debug!("YOLO 输出为通道优先: {}x{}", a, b);
    Some((b, true))
  } else if b == channels {
    debug!("YOLO 输出为候选优先: {}x{}", a, b);
    Some((a, false))
  } else {
    error!(
      "YOLO 输出形状 {:?} 与类别数 {} 不匹配（期望某一维为 {}）",
      shape,
      channels - YOLO_BOX_VALUES,
      channels
    );
    None
  }
}

/// 解码 YOLOv8 风格输出（cx, cy, w, h + 各类别得分），坐标映射回原图
pub fn decode_yolo_output(
  shape: &[i64],
  data: &[f32],
  num_classes: usize,
  confidence: f32,
  transform: &Letterbox,
) -> Result<Vec<RawDetection>, String> {
  let channels = YOLO_BOX_VALUES + num_classes;
  let (count, channel_first) = match_output_layout(shape, channels)
    .ok_or_else(|| format!("输出形状 {:?} 无法匹配 {} 个类别", shape, num_classes))?;
  if data.len() < channels * count {
    return Err(format!(
      "输出数据长度 {} 小于形状所需的 {}",
      data.len(),
      channels * count
    ));
  }

  let at = |i: usize, c: usize| {
    if channel_first {
      data[c * count + i]
    } else {
      data[i * channels + c]
    }
  };

  let mut items = Vec::new();
  for i in 0..count {
    let (class_id, score) = (0..num_classes)
      .map(|c| (c, at(i, YOLO_BOX_VALUES + c)))
      .fold((0usize, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });

    if score < confidence {
      continue;
    }

    let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
    let bbox = transform.to_source([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
    if let Some(bbox) = BoundingBox::from_array(bbox) {
      items.push(RawDetection {
        class_id,
        confidence: score.clamp(0.0, 1.0),
        bbox,
      });
    }
  }
  Ok(items)
}

/// ONNX 导出的 Ultralytics YOLO 检测模型
pub struct OnnxDetector {
  session: OnnxSession,
  class_names: Vec<String>,
  params: YoloParams,
}

impl OnnxDetector {
  /// 类别名优先取 `labels_path`，否则读取模型元数据中的 `names`
  pub fn load(
    model_path: &Path,
    labels_path: Option<&Path>,
    mut params: YoloParams,
  ) -> Result<Self, LoadError> {
    let session = OnnxSession::load(model_path)?;

    let class_names = match labels_path {
      Some(path) => read_label_file(path)?.as_slice().to_vec(),
      None => session
        .metadata_names()
        .and_then(parse_ultralytics_names)
        .ok_or_else(|| LoadError::Metadata {
          path: model_path.to_path_buf(),
          message: "模型元数据中没有 names，请提供类别名文件".to_string(),
        })?,
    };

    if let Some(shape) = session.input_shape() {
      if shape.len() != 4 || shape[1] != 3 {
        return Err(LoadError::Unsupported(format!(
          "检测模型输入应为 NCHW RGB, 实际 {:?}",
          shape
        )));
      }
      if shape[2] > 0 && shape[2] == shape[3] && shape[2] as u32 != params.input_size {
        warn!(
          "检测模型声明输入为 {}x{}，覆盖配置的 {}",
          shape[3], shape[2], params.input_size
        );
        params.input_size = shape[2] as u32;
      }
    }

    info!(
      "检测模型 {}: {} 个类别, 输入 {}x{}",
      session.name(),
      class_names.len(),
      params.input_size,
      params.input_size
    );
    Ok(Self {
      session,
      class_names,
      params,
    })
  }
}

impl Detector for OnnxDetector {
  fn name(&self) -> &str {
    self.session.name()
  }

  fn class_names(&self) -> &[String] {
    &self.class_names
  }

  fn infer(&self, frame: &RgbFrame, confidence: f32) -> Result<Vec<RawDetection>, PredictError> {
    let (tensor, transform) = letterbox(frame, self.params.input_size)?;
    let (shape, data) = self.session.run(&tensor)?;
    let candidates = decode_yolo_output(&shape, &data, self.class_names.len(), confidence, &transform)
      .map_err(|message| PredictError::MalformedOutput {
        model: self.name().to_string(),
        message,
      })?;
    debug!("候选框 {} 个", candidates.len());
    Ok(non_max_suppression(
      candidates,
      self.params.iou_threshold,
      self.params.max_detections,
    ))
  }
}

/// 运行检测器，按类别名映射并按允许列表过滤
pub fn detect(
  model: &dyn Detector,
  frame: &RgbFrame,
  confidence: f32,
  allow: &AllowList,
) -> Result<DetectionOutcome, PredictError> {
  let raw = model.infer(frame, confidence)?;
  if raw.is_empty() {
    debug!("检测器没有找到任何物体");
    return Ok(DetectionOutcome::NothingDetected);
  }

  let names = model.class_names();
  let mut items = Vec::new();
  let mut ignored = BTreeSet::new();
  for RawDetection {
    class_id,
    confidence: score,
    bbox,
  } in raw
  {
    if score < confidence {
      continue;
    }
    let Some(label) = names.get(class_id) else {
      warn!("类别索引 {} 超出类别表（{} 个），已丢弃", class_id, names.len());
      continue;
    };
    if allow.allows(label) {
      items.push(Detection {
        class_id,
        label: label.clone(),
        confidence: score,
        bbox,
      });
    } else {
      ignored.insert(label.clone());
    }
  }

  if items.is_empty() {
    if ignored.is_empty() {
      return Ok(DetectionOutcome::NothingDetected);
    }
    debug!("检测到的物体均不在允许列表中: {:?}", ignored);
    return Ok(DetectionOutcome::NoTarget {
      ignored: ignored.into_iter().collect(),
    });
  }

  debug!("检测到 {} 个目标", items.len());
  Ok(DetectionOutcome::Detected { items })
}
