// 该文件是 Lensa 项目的一部分。
// src/model/onnx.rs - ONNX Runtime 会话
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
  borrow::Cow,
  path::Path,
  sync::Mutex,
  time::Instant,
};

use ort::{
  logging::LogLevel,
  session::{Session, SessionInputs},
  value::{TensorRef, ValueType},
};
use tracing::{debug, info};

use crate::{
  model::{LoadError, PredictError},
  preprocess::NormalizedTensor,
};

/// 单输入单输出的 ONNX 模型。`Session::run` 需要可变借用，所以用互斥锁包一层。
pub struct OnnxSession {
  name: String,
  session: Mutex<Session>,
  input_name: String,
  output_name: String,
  input_shape: Option<Vec<i64>>,
  output_shape: Option<Vec<i64>>,
  metadata_names: Option<String>,
}

fn tensor_dims(dtype: &ValueType) -> Option<Vec<i64>> {
  match dtype {
    ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
    _ => None,
  }
}

impl OnnxSession {
  pub fn load(path: &Path) -> Result<Self, LoadError> {
    if !path.exists() {
      return Err(LoadError::NotFound(path.to_path_buf()));
    }

    info!("加载模型文件: {}", path.display());
    let size = std::fs::metadata(path)
      .map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
      })?
      .len();
    debug!("模型文件大小: {:.2} MB", size as f64 / (1024.0 * 1024.0));

    let builder = Session::builder()
      .and_then(|b| b.with_log_level(LogLevel::Error))
      .map_err(|e| LoadError::RuntimeUnavailable(e.to_string()))?;
    let session = builder
      .commit_from_file(path)
      .map_err(|e| LoadError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
      })?;

    if session.inputs().len() != 1 || session.outputs().is_empty() {
      return Err(LoadError::Unsupported(format!(
        "期望 1 个输入、至少 1 个输出, 实际 {} 个输入、{} 个输出",
        session.inputs().len(),
        session.outputs().len()
      )));
    }

    let input = &session.inputs()[0];
    let output = &session.outputs()[0];
    let input_name = input.name().to_string();
    let output_name = output.name().to_string();
    let input_shape = tensor_dims(input.dtype());
    let output_shape = tensor_dims(output.dtype());
    debug!("模型输入 '{}': {:?}", input_name, input_shape);
    debug!("模型输出 '{}': {:?}", output_name, output_shape);

    let metadata_names = session
      .metadata()
      .ok()
      .and_then(|meta| meta.custom("names"));

    let name = path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| path.display().to_string());

    info!("模型加载完成: {}", name);
    Ok(Self {
      name,
      session: Mutex::new(session),
      input_name,
      output_name,
      input_shape,
      output_shape,
      metadata_names,
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// 模型声明的输入形状，动态维度为 -1
  pub fn input_shape(&self) -> Option<&[i64]> {
    self.input_shape.as_deref()
  }

  pub fn output_shape(&self) -> Option<&[i64]> {
    self.output_shape.as_deref()
  }

  /// ONNX 元数据中的 `names` 属性（Ultralytics 导出会写入）
  pub fn metadata_names(&self) -> Option<&str> {
    self.metadata_names.as_deref()
  }

  fn check_input(&self, tensor: &NormalizedTensor) -> Result<(), PredictError> {
    let Some(expected) = self.input_shape.as_deref() else {
      return Ok(());
    };
    let actual = tensor.shape();
    let compatible = expected.len() == actual.len()
      && expected
        .iter()
        .zip(actual)
        .all(|(&e, &a)| e <= 0 || e as usize == a);
    if compatible {
      return Ok(());
    }

    Err(PredictError::ShapeMismatch {
      model: self.name.clone(),
      expected: expected.to_vec(),
      actual: actual.to_vec(),
      remediation: shape_remediation(expected, tensor),
    })
  }

  /// 执行一次推理，返回第一个输出的 (形状, 数据)
  pub fn run(&self, tensor: &NormalizedTensor) -> Result<(Vec<i64>, Vec<f32>), PredictError> {
    self.check_input(tensor)?;

    let runtime_error = |message: String| PredictError::Runtime {
      model: self.name.clone(),
      message,
    };

    let dims: Vec<i64> = tensor.shape().iter().map(|&d| d as i64).collect();
    let tensor_ref = TensorRef::from_array_view((dims, tensor.as_slice()))
      .map_err(|e| runtime_error(format!("无法创建输入张量: {}", e)))?;
    let inputs: SessionInputs<'_, '_, 0> =
      SessionInputs::ValueMap(vec![(Cow::Borrowed(self.input_name.as_str()), tensor_ref.into())]);

    let mut session = self
      .session
      .lock()
      .map_err(|_| runtime_error("会话锁已损坏".to_string()))?;

    let now = Instant::now();
    let outputs = session
      .run(inputs)
      .map_err(|e| runtime_error(e.to_string()))?;
    debug!("模型 {} 推理耗时: {:.2?}", self.name, now.elapsed());

    let (shape, data) = outputs[self.output_name.as_str()]
      .try_extract_tensor::<f32>()
      .map_err(|e| runtime_error(format!("无法读取输出张量: {}", e)))?;
    Ok((shape.iter().copied().collect(), data.to_vec()))
  }
}

/// 根据声明形状推断训练时的输入尺寸，给出修正建议
fn shape_remediation(expected: &[i64], tensor: &NormalizedTensor) -> String {
  let (w, h) = tensor.spatial_size();
  if expected.len() != 4 {
    return format!(
      "模型期望 {} 维输入，请确认导出的模型接受单张 RGB 图像",
      expected.len()
    );
  }
  let (nhwc_h, nhwc_w, nhwc_c) = (expected[1], expected[2], expected[3]);
  let (nchw_c, nchw_h, nchw_w) = (expected[1], expected[2], expected[3]);
  if nhwc_c == 3 {
    format!(
      "模型按 NHWC 布局训练，输入应为 {}x{}（当前 {}x{}）；请在元数据中设置 \"layout\": \"nhwc\", \"input_size\": [{}, {}]",
      nhwc_w, nhwc_h, w, h, nhwc_w, nhwc_h
    )
  } else if nchw_c == 3 {
    format!(
      "模型按 NCHW 布局训练，输入应为 {}x{}（当前 {}x{}）；请在元数据中设置 \"layout\": \"nchw\", \"input_size\": [{}, {}]",
      nchw_w, nchw_h, w, h, nchw_w, nchw_h
    )
  } else {
    "模型输入不是 3 通道 RGB，请检查导出流程与训练时的预处理是否一致".to_string()
  }
}
