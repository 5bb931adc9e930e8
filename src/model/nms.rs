// 该文件是 Lensa 项目的一部分。
// src/model/nms.rs - 非极大值抑制
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

use crate::model::RawDetection;

/// 按类别做 IoU 抑制，结果按置信度降序，最多 `max_results` 个
pub fn non_max_suppression(
  mut candidates: Vec<RawDetection>,
  iou_threshold: f32,
  max_results: usize,
) -> Vec<RawDetection> {
  candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

  let mut kept: Vec<RawDetection> = Vec::new();
  for candidate in candidates {
    if kept.len() >= max_results {
      break;
    }
    let suppressed = kept.iter().any(|k| {
      k.class_id == candidate.class_id && k.bbox.iou(&candidate.bbox) > iou_threshold
    });
    if !suppressed {
      kept.push(candidate);
    }
  }
  kept
}
