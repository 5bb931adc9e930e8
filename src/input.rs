// 该文件是 Lensa 项目的一部分。
// src/input.rs - 上传图像输入
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

use std::io::Cursor;

use image::{ImageFormat, ImageReader};
use thiserror::Error;
use tracing::{debug, error};

use crate::frame::RgbFrame;

#[cfg(feature = "read_image_file")]
mod read_image_file;
#[cfg(feature = "read_image_file")]
pub use self::read_image_file::ImageFileInput;

/// 允许上传的图像格式
pub const ACCEPTED_FORMATS: [ImageFormat; 2] = [ImageFormat::Jpeg, ImageFormat::Png];

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("无法识别图像格式")]
  UnknownFormat,
  #[error("不支持的图像格式: {0:?}，仅支持 JPEG/PNG")]
  UnsupportedFormat(ImageFormat),
  #[error("图像解码失败: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("URI 方案不匹配: 期望 '{expected}', 实际 '{actual}'")]
  SchemeMismatch { expected: String, actual: String },
}

/// 把上传的原始字节解码为 RGB 帧。
///
/// 截断或损坏的文件会在这里返回 [`DecodeError`]，只影响本次请求。
pub fn decode_bytes(bytes: &[u8]) -> Result<RgbFrame, DecodeError> {
  let reader = ImageReader::new(Cursor::new(bytes)).with_guessed_format()?;
  let format = reader.format().ok_or(DecodeError::UnknownFormat)?;
  if !ACCEPTED_FORMATS.contains(&format) {
    error!("拒绝不支持的图像格式: {:?}", format);
    return Err(DecodeError::UnsupportedFormat(format));
  }

  let image = reader.decode()?;
  debug!(
    "图像解码完成: {}x{} ({:?})",
    image.width(),
    image.height(),
    format
  );
  Ok(RgbFrame::from(image.to_rgb8()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::{Rgb, RgbImage};

  fn encode(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut bytes = Vec::new();
    image
      .write_to(&mut Cursor::new(&mut bytes), format)
      .unwrap();
    bytes
  }

  #[test]
  fn decodes_png() {
    let image = RgbImage::from_pixel(4, 3, Rgb([1, 2, 3]));
    let frame = decode_bytes(&encode(&image, ImageFormat::Png)).unwrap();
    assert_eq!((frame.width(), frame.height()), (4, 3));
    assert_eq!(&frame.as_hwc()[..3], &[1, 2, 3]);
  }

  #[test]
  fn truncated_jpeg_is_a_decode_error() {
    let image = RgbImage::from_pixel(64, 64, Rgb([200, 10, 10]));
    let bytes = encode(&image, ImageFormat::Jpeg);
    let truncated = &bytes[..24];
    assert!(decode_bytes(truncated).is_err());
  }

  #[test]
  fn garbage_is_unknown_format() {
    let err = decode_bytes(b"definitely not an image").unwrap_err();
    assert!(matches!(err, DecodeError::UnknownFormat));
  }

  #[test]
  fn gif_is_rejected() {
    let err = decode_bytes(b"GIF89a\x01\x00\x01\x00\x00\x00\x00;").unwrap_err();
    assert!(matches!(err, DecodeError::UnsupportedFormat(ImageFormat::Gif)));
  }
}
