// 该文件是 Lensa 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
  drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut},
  rect::Rect,
};
use tracing::warn;

use crate::{
  dispatch::{Outcome, Response},
  frame::RgbFrame,
  model::Detection,
};

const LABEL_FONT_SIZE: f32 = 18.0;
const LABEL_TEXT_HEIGHT: i32 = 22;
const LABEL_CHAR_WIDTH: f32 = 10.0; // 每字符平均宽度（粗略估计）
const BOX_THICKNESS: i32 = 2;
const PALETTE_SIZE: usize = 20;

/// 在原图上绘制检测框。没有字体时只画框，不画标签文字。
pub struct Draw {
  font: Option<FontArc>,
  font_scale: PxScale,
  colors: Vec<Rgb<u8>>,
}

impl Default for Draw {
  fn default() -> Self {
    Self::new(None)
  }
}

impl Draw {
  pub fn new(font: Option<FontArc>) -> Self {
    let colors = (0..PALETTE_SIZE)
      .map(|i| hsv_to_rgb(i as f32 / PALETTE_SIZE as f32 * 360.0, 0.8, 0.9))
      .collect();
    Self {
      font,
      font_scale: PxScale::from(LABEL_FONT_SIZE),
      colors,
    }
  }

  /// 读取 TTF/OTF 字体，失败时退化为只画框
  pub fn with_font_file(path: &Path) -> Self {
    let font = std::fs::read(path)
      .ok()
      .and_then(|data| FontArc::try_from_vec(data).ok());
    if font.is_none() {
      warn!("无法加载字体 {}，标签文字将不会绘制", path.display());
    }
    Self::new(font)
  }

  pub fn has_font(&self) -> bool {
    self.font.is_some()
  }

  pub fn color_of(&self, class_id: usize) -> Rgb<u8> {
    self.colors[class_id % self.colors.len()]
  }

  pub fn draw_detections(&self, image: &mut RgbImage, detections: &[Detection]) {
    for detection in detections {
      let color = self.color_of(detection.class_id);
      let b = detection.bbox;
      let x = b.x1().floor() as i32;
      let y = b.y1().floor() as i32;
      let width = (b.x2().ceil() as i32 - x).max(1) as u32;
      let height = (b.y2().ceil() as i32 - y).max(1) as u32;

      for t in 0..BOX_THICKNESS {
        let w = width.saturating_sub(2 * t as u32);
        let h = height.saturating_sub(2 * t as u32);
        if w == 0 || h == 0 {
          break;
        }
        draw_hollow_rect_mut(image, Rect::at(x + t, y + t).of_size(w, h), color);
      }

      let Some(font) = &self.font else {
        continue;
      };
      let label = format!("{} {:.2}", detection.label, detection.confidence);
      let text_width = (label.chars().count() as f32 * LABEL_CHAR_WIDTH) as u32;
      let label_y = (y - LABEL_TEXT_HEIGHT).max(0);
      draw_filled_rect_mut(
        image,
        Rect::at(x, label_y).of_size(text_width.max(1), LABEL_TEXT_HEIGHT as u32),
        color,
      );
      draw_text_mut(
        image,
        Rgb([255, 255, 255]),
        x,
        label_y + 2,
        self.font_scale,
        font,
        &label,
      );
    }
  }

  /// 检测结果画框；其他结果返回原图
  pub fn render(&self, frame: &RgbFrame, response: &Response) -> RgbImage {
    let mut image = frame.to_rgb_image();
    if let Outcome::Detected(outcome) = &response.outcome {
      self.draw_detections(&mut image, outcome.items());
    }
    image
  }
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> Rgb<u8> {
  let c = v * s;
  let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
  let m = v - c;

  let (r, g, b) = if h < 60.0 {
    (c, x, 0.0)
  } else if h < 120.0 {
    (x, c, 0.0)
  } else if h < 180.0 {
    (0.0, c, x)
  } else if h < 240.0 {
    (0.0, x, c)
  } else if h < 300.0 {
    (x, 0.0, c)
  } else {
    (c, 0.0, x)
  };

  Rgb([
    ((r + m) * 255.0) as u8,
    ((g + m) * 255.0) as u8,
    ((b + m) * 255.0) as u8,
  ])
}
