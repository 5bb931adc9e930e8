// 该文件是 Lensa 项目的一部分。
// src/args.rs - 项目参数配置
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

use std::path::PathBuf;

use clap::Parser;
use lensa::dispatch::Task;
use url::Url;

/// Lensa 图像分类与目标检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 任务类型: classify 或 detect
  #[arg(long, value_name = "TASK")]
  pub task: Task,

  /// 上传的图像，如 image:///path/to/photo.jpg（仅支持 JPEG/PNG）
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 分类模型，如 classifier:///model/Shafa%20Laporan%202.onnx
  #[arg(long, value_name = "MODEL")]
  pub classifier: Option<Url>,

  /// 分类模型的训练元数据（默认与模型同名的 .json）
  #[arg(long, value_name = "FILE")]
  pub classifier_meta: Option<PathBuf>,

  /// 检测模型，如 detector:///model/best.onnx
  #[arg(long, value_name = "MODEL")]
  pub detector: Option<Url>,

  /// 检测模型类别名文件（默认读取模型元数据中的 names）
  #[arg(long, value_name = "FILE")]
  pub detector_labels: Option<PathBuf>,

  /// 输出路径
  /// 支持格式:
  /// - 图片: image:///out/result.png
  /// - 目录记录: folder:///out/records[?always]
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 检测置信度阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.25", value_name = "THRESHOLD")]
  pub confidence: f32,

  /// NMS IOU 阈值 (0.0 - 1.0)
  #[arg(long, default_value = "0.45", value_name = "THRESHOLD")]
  pub nms_threshold: f32,

  /// 检测模型输入边长
  #[arg(long, default_value = "640", value_name = "PIXELS")]
  pub detector_size: u32,

  /// 分类低置信度阈值，覆盖模型元数据
  #[arg(long, value_name = "THRESHOLD")]
  pub low_confidence: Option<f32>,

  /// 只保留这些检测类别（可重复），不指定则全部保留
  #[arg(long = "allow", value_name = "CLASS")]
  pub allow: Vec<String>,

  /// 绘制标签用的字体文件
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}
