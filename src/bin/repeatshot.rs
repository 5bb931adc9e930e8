// 该文件是 Lensa 项目的一部分。
// src/bin/repeatshot.rs - 重复推理同一张图像，统计耗时并检查结果一致
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

use std::sync::Arc;

use anyhow::{Result, bail};
use clap::Parser;
use url::Url;

use lensa::{
  FromUrl, FromUrlWithScheme,
  dispatch::{DispatchConfig, Dispatcher, InferenceRequest, Task},
  input::ImageFileInput,
  output::OutputWrapper,
  registry::{ClassifierSource, DetectorSource, ModelRegistry},
  task::{RepeatShotTask, TaskRunner},
};
use tracing::info;

/// Lensa 重复推理
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型文件路径: classifier:///... 或 detector:///...
  #[arg(long, value_name = "MODEL")]
  pub model: Url,
  /// 输入来源
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出路径（只写第一次的结果）
  #[arg(long, value_name = "OUTPUT")]
  pub output: Url,
  /// 重复次数
  #[arg(long, default_value = "100", value_name = "TIMES")]
  pub times: usize,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型文件路径: {}", args.model);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let mut config = DispatchConfig::default();
  let task = match args.model.scheme() {
    ClassifierSource::SCHEME => {
      config.classifier = Some(ClassifierSource::from_url(&args.model)?);
      Task::Classify
    }
    DetectorSource::SCHEME => {
      config.detector = Some(DetectorSource::from_url(&args.model)?);
      Task::Detect
    }
    other => bail!("不支持的模型 URI 方案: {}", other),
  };

  let dispatcher = Dispatcher::new(Arc::new(ModelRegistry::default()), config);
  let frame = ImageFileInput::from_url(&args.input)?.read()?;
  let request = InferenceRequest::new(frame, task);
  let output = OutputWrapper::from_url(&args.output)?;

  let report = RepeatShotTask::default()
    .with_times(args.times)
    .run_task(&request, &dispatcher, output)?;

  info!(
    "共 {} 次，平均 {:.2?}，结果{}",
    report.runs,
    report.mean,
    if report.stable { "一致" } else { "不一致" }
  );
  info!("{}", report.first.notice);

  Ok(())
}
