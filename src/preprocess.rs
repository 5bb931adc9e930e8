// 该文件是 Lensa 项目的一部分。
// src/preprocess.rs - 图像归一化
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

//! 把解码后的帧变成模型输入张量。
//!
//! 尺寸和归一化方式由模型训练时的预处理决定，这里不做任何推断；
//! 配置与训练不一致时不会报错，只会让精度下降。

use image::{Rgb, RgbImage, imageops::FilterType};
use ndarray::Array4;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::frame::{RGB_CHANNELS, RgbFrame};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// YOLO 系列 letterbox 的填充灰度
pub const LETTERBOX_FILL: u8 = 114;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreprocessError {
  #[error("目标尺寸无效: {0}x{1}")]
  InvalidTargetSize(u32, u32),
  #[error("输入图像为空")]
  EmptyFrame,
}

/// 像素值缩放方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
  /// 除以 255，缩放到 [0, 1]
  #[default]
  Unit,
  /// 先缩放到 [0, 1]，再按 ImageNet 均值/方差逐通道标准化（DenseNet 等 torch 模式）
  Imagenet,
  /// 缩放到 [-1, 1]（MobileNet 等 tf 模式）
  Symmetric,
  /// 保留 0..255
  Raw,
}

impl Normalization {
  #[inline]
  fn apply(self, value: u8, channel: usize) -> f32 {
    let v = value as f32;
    match self {
      Normalization::Unit => v / 255.0,
      Normalization::Imagenet => (v / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
      Normalization::Symmetric => v / 127.5 - 1.0,
      Normalization::Raw => v,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TensorLayout {
  /// Keras 导出的模型
  #[default]
  Nhwc,
  /// PyTorch / Ultralytics 导出的模型
  Nchw,
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
  pub normalization: Normalization,
  pub layout: TensorLayout,
  pub filter: FilterType,
}

impl Default for NormalizeOptions {
  fn default() -> Self {
    Self {
      normalization: Normalization::Unit,
      layout: TensorLayout::Nhwc,
      // Keras image.load_img / PIL resize 默认双线性
      filter: FilterType::Triangle,
    }
  }
}

/// 模型输入张量，batch 固定为 1
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedTensor {
  data: Array4<f32>,
  layout: TensorLayout,
}

impl NormalizedTensor {
  pub fn layout(&self) -> TensorLayout {
    self.layout
  }

  pub fn shape(&self) -> &[usize] {
    self.data.shape()
  }

  /// (宽, 高)
  pub fn spatial_size(&self) -> (usize, usize) {
    let s = self.data.shape();
    match self.layout {
      TensorLayout::Nhwc => (s[2], s[1]),
      TensorLayout::Nchw => (s[3], s[2]),
    }
  }

  pub fn as_array(&self) -> &Array4<f32> {
    &self.data
  }

  pub fn as_slice(&self) -> &[f32] {
    // 由 Array4::from_shape_fn 创建，必为标准布局
    self.data.as_slice().unwrap_or(&[])
  }
}

fn image_to_tensor(image: &RgbImage, options: &NormalizeOptions) -> NormalizedTensor {
  let (width, height) = (image.width() as usize, image.height() as usize);
  let norm = options.normalization;
  let data = match options.layout {
    TensorLayout::Nhwc => Array4::from_shape_fn((1, height, width, RGB_CHANNELS), |(_, y, x, c)| {
      norm.apply(image.get_pixel(x as u32, y as u32)[c], c)
    }),
    TensorLayout::Nchw => Array4::from_shape_fn((1, RGB_CHANNELS, height, width), |(_, c, y, x)| {
      norm.apply(image.get_pixel(x as u32, y as u32)[c], c)
    }),
  };
  NormalizedTensor {
    data,
    layout: options.layout,
  }
}

/// 缩放到 `target_size`（宽, 高）并归一化。纯函数，相同输入总是得到相同输出。
pub fn normalize(
  frame: &RgbFrame,
  target_size: (u32, u32),
  options: &NormalizeOptions,
) -> Result<NormalizedTensor, PreprocessError> {
  let (tw, th) = target_size;
  if tw == 0 || th == 0 {
    return Err(PreprocessError::InvalidTargetSize(tw, th));
  }
  if frame.width() == 0 || frame.height() == 0 {
    return Err(PreprocessError::EmptyFrame);
  }

  let source = frame.to_rgb_image();
  let resized = if source.dimensions() == (tw, th) {
    source
  } else {
    image::imageops::resize(&source, tw, th, options.filter)
  };

  debug!(
    "归一化: {}x{} -> {}x{}, {:?} {:?}",
    frame.width(),
    frame.height(),
    tw,
    th,
    options.normalization,
    options.layout
  );
  Ok(image_to_tensor(&resized, options))
}

/// letterbox 变换参数，用于把模型坐标映射回原图
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
  pub scale: f32,
  pub pad_x: f32,
  pub pad_y: f32,
  pub source_width: f32,
  pub source_height: f32,
}

impl Letterbox {
  /// 模型输入坐标 -> 原图像素坐标，并裁剪到图像范围内
  pub fn to_source(&self, bbox: [f32; 4]) -> [f32; 4] {
    let [x1, y1, x2, y2] = bbox;
    [
      ((x1 - self.pad_x) / self.scale).clamp(0.0, self.source_width),
      ((y1 - self.pad_y) / self.scale).clamp(0.0, self.source_height),
      ((x2 - self.pad_x) / self.scale).clamp(0.0, self.source_width),
      ((y2 - self.pad_y) / self.scale).clamp(0.0, self.source_height),
    ]
  }
}

/// 保持宽高比缩放并居中填充到 `size`x`size`，输出 NCHW、[0, 1] 张量
pub fn letterbox(
  frame: &RgbFrame,
  size: u32,
) -> Result<(NormalizedTensor, Letterbox), PreprocessError> {
  if size == 0 {
    return Err(PreprocessError::InvalidTargetSize(size, size));
  }
  if frame.width() == 0 || frame.height() == 0 {
    return Err(PreprocessError::EmptyFrame);
  }

  let (sw, sh) = (frame.width() as f32, frame.height() as f32);
  let scale = (size as f32 / sw).min(size as f32 / sh);
  let new_w = ((sw * scale).round() as u32).clamp(1, size);
  let new_h = ((sh * scale).round() as u32).clamp(1, size);
  let pad_x = (size - new_w) / 2;
  let pad_y = (size - new_h) / 2;

  let resized = image::imageops::resize(&frame.to_rgb_image(), new_w, new_h, FilterType::Triangle);
  let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
  image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

  let options = NormalizeOptions {
    normalization: Normalization::Unit,
    layout: TensorLayout::Nchw,
    filter: FilterType::Triangle,
  };
  let tensor = image_to_tensor(&canvas, &options);
  let transform = Letterbox {
    scale,
    pad_x: pad_x as f32,
    pad_y: pad_y as f32,
    source_width: sw,
    source_height: sh,
  };
  Ok((tensor, transform))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbFrame {
    RgbFrame::from(RgbImage::from_pixel(width, height, Rgb(rgb)))
  }

  #[test]
  fn resizes_300_to_128() {
    let frame = solid(300, 300, [10, 20, 30]);
    let tensor = normalize(&frame, (128, 128), &NormalizeOptions::default()).unwrap();
    assert_eq!(tensor.shape(), &[1, 128, 128, 3]);
    assert_eq!(tensor.spatial_size(), (128, 128));
  }

  #[test]
  fn nchw_layout_shape() {
    let frame = solid(40, 20, [0, 0, 0]);
    let options = NormalizeOptions {
      layout: TensorLayout::Nchw,
      ..Default::default()
    };
    let tensor = normalize(&frame, (250, 250), &options).unwrap();
    assert_eq!(tensor.shape(), &[1, 3, 250, 250]);
  }

  #[test]
  fn normalize_is_deterministic() {
    let mut image = RgbImage::new(37, 23);
    for (x, y, p) in image.enumerate_pixels_mut() {
      *p = Rgb([(x * 7) as u8, (y * 11) as u8, (x + y) as u8]);
    }
    let frame = RgbFrame::from(image);
    let options = NormalizeOptions {
      normalization: Normalization::Imagenet,
      ..Default::default()
    };
    let a = normalize(&frame, (224, 224), &options).unwrap();
    let b = normalize(&frame, (224, 224), &options).unwrap();
    assert_eq!(a, b);
  }

  #[test]
  fn scaling_modes() {
    let frame = solid(2, 2, [255, 0, 255]);
    let unit = normalize(&frame, (2, 2), &NormalizeOptions::default()).unwrap();
    assert_eq!(&unit.as_slice()[..3], &[1.0, 0.0, 1.0]);

    let symmetric = normalize(
      &frame,
      (2, 2),
      &NormalizeOptions {
        normalization: Normalization::Symmetric,
        ..Default::default()
      },
    )
    .unwrap();
    assert_eq!(&symmetric.as_slice()[..3], &[1.0, -1.0, 1.0]);

    let imagenet = normalize(
      &frame,
      (2, 2),
      &NormalizeOptions {
        normalization: Normalization::Imagenet,
        ..Default::default()
      },
    )
    .unwrap();
    let expected_g = (0.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
    assert!((imagenet.as_slice()[1] - expected_g).abs() < 1e-6);
  }

  #[test]
  fn zero_target_is_rejected() {
    let frame = solid(4, 4, [0, 0, 0]);
    assert_eq!(
      normalize(&frame, (0, 128), &NormalizeOptions::default()),
      Err(PreprocessError::InvalidTargetSize(0, 128))
    );
  }

  #[test]
  fn empty_frame_is_rejected() {
    let frame = RgbFrame::from(RgbImage::new(0, 0));
    assert_eq!(
      letterbox(&frame, 64).err(),
      Some(PreprocessError::EmptyFrame)
    );
    assert_eq!(
      normalize(&frame, (32, 32), &NormalizeOptions::default()),
      Err(PreprocessError::EmptyFrame)
    );
  }

  #[test]
  fn letterbox_pads_short_side() {
    let frame = solid(200, 100, [255, 255, 255]);
    let (tensor, transform) = letterbox(&frame, 64).unwrap();
    assert_eq!(tensor.shape(), &[1, 3, 64, 64]);
    assert_eq!(transform.pad_x, 0.0);
    assert_eq!(transform.pad_y, 16.0);
    // 顶部为填充灰度
    let fill = LETTERBOX_FILL as f32 / 255.0;
    assert!((tensor.as_array()[[0, 0, 0, 0]] - fill).abs() < 1e-6);

    let back = transform.to_source([0.0, 16.0, 64.0, 48.0]);
    assert!((back[0] - 0.0).abs() < 1e-3);
    assert!((back[1] - 0.0).abs() < 1e-3);
    assert!((back[2] - 200.0).abs() < 1e-3);
    assert!((back[3] - 100.0).abs() < 1e-3);
  }
}
