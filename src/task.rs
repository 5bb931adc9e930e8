// 该文件是 Lensa 项目的一部分。
// src/task.rs - 任务执行
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

use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::{
  dispatch::{Dispatcher, InferenceRequest, Response},
  frame::RgbFrame,
  output::Render,
};

pub trait TaskRunner<O> {
  type Output;
  type Error;
  fn run_task(
    self,
    request: &InferenceRequest,
    dispatcher: &Dispatcher,
    output: O,
  ) -> Result<Self::Output, Self::Error>;
}

/// 推理一次并输出
pub struct OneShotTask;

impl<RE: std::error::Error + Sync + Send + 'static, O: Render<RgbFrame, Response, Error = RE>>
  TaskRunner<O> for OneShotTask
{
  type Output = Response;
  type Error = anyhow::Error;

  fn run_task(
    self,
    request: &InferenceRequest,
    dispatcher: &Dispatcher,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务...");
    let now = Instant::now();
    let response = dispatcher.dispatch(request);
    let elapsed = now.elapsed();
    info!("推理完成，耗时: {:.2?}", elapsed);
    output.render_result(&request.frame, &response)?;
    info!("渲染完成，耗时: {:.2?}", now.elapsed());
    Ok(response)
  }
}

#[derive(Debug, Clone)]
pub struct RepeatReport {
  pub runs: usize,
  pub mean: Duration,
  /// 所有结果与第一次完全一致
  pub stable: bool,
  pub first: Response,
}

/// 对同一请求重复推理，统计耗时并检查结果是否可复现
pub struct RepeatShotTask {
  times: usize,
}

impl Default for RepeatShotTask {
  fn default() -> Self {
    Self { times: 100 }
  }
}

impl RepeatShotTask {
  pub fn with_times(mut self, times: usize) -> Self {
    self.times = times.max(1);
    self
  }
}

impl<RE: std::error::Error + Sync + Send + 'static, O: Render<RgbFrame, Response, Error = RE>>
  TaskRunner<O> for RepeatShotTask
{
  type Output = RepeatReport;
  type Error = anyhow::Error;

  fn run_task(
    self,
    request: &InferenceRequest,
    dispatcher: &Dispatcher,
    output: O,
  ) -> Result<Self::Output, Self::Error> {
    info!("开始任务，共 {} 次...", self.times);
    let mut times = Vec::with_capacity(self.times);
    let mut first: Option<Response> = None;
    let mut stable = true;

    for i in 0..self.times {
      let now = Instant::now();
      let response = dispatcher.dispatch(request);
      let elapsed = now.elapsed();
      info!("({})推理完成，耗时: {:.2?}", i, elapsed);
      times.push(elapsed);

      match &first {
        None => {
          output.render_result(&request.frame, &response)?;
          first = Some(response);
        }
        Some(expected) if *expected != response => {
          warn!("({})结果与第一次不一致: {}", i, response.notice);
          stable = false;
        }
        Some(_) => {}
      }
    }

    // 前两次包含预热开销
    let skip = if times.len() > 2 { 2 } else { 0 };
    let counted = &times[skip..];
    let mean = counted.iter().sum::<Duration>() / counted.len() as u32;
    warn!("平均推理时间: {:.2?}", mean);

    let first = first.ok_or_else(|| anyhow::anyhow!("没有执行任何推理"))?;
    Ok(RepeatReport {
      runs: times.len(),
      mean,
      stable,
      first,
    })
  }
}
