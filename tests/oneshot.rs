// 该文件是 Lensa 项目的一部分。
// tests/oneshot.rs - 从上传字节到输出文件的完整流程
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

#![cfg(feature = "save_image_file")]

use std::{io::Cursor, path::PathBuf, sync::Arc};

use image::{ImageFormat, Rgb, RgbImage};
use lensa::{
  dispatch::{DispatchConfig, Dispatcher, InferenceRequest, Task},
  frame::RgbFrame,
  model::{AllowList, BoundingBox, Detector, PredictError, RawDetection},
  output::{SaveImageFileOutput, draw::Draw},
  registry::{DetectorSource, ModelRegistry},
  task::{OneShotTask, TaskRunner},
};

struct OneBox;

impl Detector for OneBox {
  fn name(&self) -> &str {
    "one-box"
  }

  fn class_names(&self) -> &[String] {
    static NAMES: std::sync::OnceLock<Vec<String>> = std::sync::OnceLock::new();
    NAMES.get_or_init(|| vec!["smoking".to_string(), "notsmoking".to_string()])
  }

  fn infer(&self, _frame: &RgbFrame, _confidence: f32) -> Result<Vec<RawDetection>, PredictError> {
    Ok(vec![RawDetection {
      class_id: 0,
      confidence: 0.9,
      bbox: BoundingBox::new(4.0, 4.0, 20.0, 28.0).unwrap(),
    }])
  }
}

fn scratch(name: &str) -> PathBuf {
  std::env::temp_dir().join(format!("lensa-{}-{}", name, std::process::id()))
}

#[test]
fn detection_is_drawn_onto_saved_image() {
  let registry = ModelRegistry::default();
  registry.insert_detector(DetectorSource::new("best.onnx"), Arc::new(OneBox));
  let config = DispatchConfig {
    detector: Some(DetectorSource::new("best.onnx")),
    allow_list: AllowList::new(["smoking"]),
    ..DispatchConfig::default()
  };
  let dispatcher = Dispatcher::new(Arc::new(registry), config);

  let mut bytes = Vec::new();
  RgbImage::from_pixel(32, 32, Rgb([255, 255, 255]))
    .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
    .unwrap();
  let request = InferenceRequest::from_bytes(&bytes, Task::Detect).unwrap();

  let path = scratch("oneshot").join("result.png");
  let output = SaveImageFileOutput::new(&path, Draw::default());
  let response = OneShotTask.run_task(&request, &dispatcher, output).unwrap();

  let items = response.detection().unwrap().items();
  assert_eq!(items.len(), 1);
  assert_eq!(items[0].label, "smoking");

  let saved = image::open(&path).unwrap().to_rgb8();
  assert_eq!(saved.dimensions(), (32, 32));
  // 框线覆盖左上角，背景保持白色
  assert_ne!(*saved.get_pixel(4, 4), Rgb([255, 255, 255]));
  assert_eq!(*saved.get_pixel(0, 0), Rgb([255, 255, 255]));

  let _ = std::fs::remove_dir_all(path.parent().unwrap());
}

#[test]
fn classification_without_model_still_writes_nothing_fatal() {
  let dispatcher = Dispatcher::new(Arc::new(ModelRegistry::default()), DispatchConfig::default());
  let request = InferenceRequest::new(RgbFrame::with_shape(16, 16).unwrap(), Task::Classify);
  let path = scratch("unconfigured").join("result.png");
  let output = SaveImageFileOutput::new(&path, Draw::default());

  let response = OneShotTask.run_task(&request, &dispatcher, output).unwrap();
  assert!(response.is_failed());
  let _ = std::fs::remove_dir_all(path.parent().unwrap());
}
