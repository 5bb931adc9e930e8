// 该文件是 Lensa 项目的一部分。
// src/main.rs - 项目主程序
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

mod args;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

#[cfg(feature = "save_image_file")]
use lensa::output::draw::Draw;
use lensa::{
  FromUrl,
  dispatch::{DispatchConfig, Dispatcher, InferenceRequest},
  input::ImageFileInput,
  model::{AllowList, YoloParams},
  output::{LogOutput, OutputWrapper},
  registry::{ClassifierSource, DetectorSource, ModelRegistry},
  task::{OneShotTask, TaskRunner},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("Lensa 图像推理");
  info!("任务: {}", args.task);
  info!("输入来源: {}", args.input);
  if let Some(output) = &args.output {
    info!("输出路径: {}", output);
  }

  let classifier = args
    .classifier
    .as_ref()
    .map(ClassifierSource::from_url)
    .transpose()?
    .map(|source| match &args.classifier_meta {
      Some(meta) => source.with_metadata(meta),
      None => source,
    });

  let detector = args
    .detector
    .as_ref()
    .map(DetectorSource::from_url)
    .transpose()?
    .map(|source| {
      let source = source.with_params(YoloParams {
        input_size: args.detector_size,
        iou_threshold: args.nms_threshold,
        ..YoloParams::default()
      });
      match &args.detector_labels {
        Some(labels) => source.with_labels(labels),
        None => source,
      }
    });

  let config = DispatchConfig {
    classifier,
    detector,
    detection_confidence: args.confidence,
    low_confidence: args.low_confidence,
    allow_list: AllowList::new(&args.allow),
  };

  let registry = Arc::new(ModelRegistry::default());
  let dispatcher = Dispatcher::new(registry, config);

  let frame = ImageFileInput::from_url(&args.input)?.read()?;
  info!("输入图像: {}x{}", frame.width(), frame.height());
  let request = InferenceRequest::new(frame, args.task);

  let response = match &args.output {
    Some(url) => {
      let output = OutputWrapper::from_url(url)?;
      #[cfg(feature = "save_image_file")]
      let output = output.with_draw(match &args.font {
        Some(font) => Draw::with_font_file(font),
        None => Draw::default(),
      });
      OneShotTask.run_task(&request, &dispatcher, output)?
    }
    None => OneShotTask.run_task(&request, &dispatcher, LogOutput)?,
  };

  println!("{}", serde_json::to_string_pretty(&response)?);
  if response.is_failed() {
    warn!("推理失败: {}", response.notice);
  }

  Ok(())
}
