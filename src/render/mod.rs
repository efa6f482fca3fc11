//! 渲染器抽象
//!
//! 引擎只通过 `Renderer` trait 与平台音频输出交互：
//! - macOS: Core Audio 默认输出 (`coreaudio`)
//! - 其他平台/无设备: 按采样率节拍拉取的软件时钟渲染器 (`clock`)
//!
//! 渲染器启动时接管 `RenderCursor`，之后只在自己的实时上下文里拉取帧。

pub mod clock;
#[cfg(target_os = "macos")]
pub mod coreaudio;
#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;

use crate::audio::{RenderCursor, SampleLayout, StreamFormat};
use crate::engine::spatial::SpatialScene;

pub use clock::{CaptureSink, ClockConfig, ClockRenderer, RawPcmSink};

/// 输出设备类别
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceClass {
    /// 蓝牙/无线耳机
    WirelessHeadset,
    Other,
}

impl DeviceClass {
    #[inline]
    pub fn is_wireless_headset(self) -> bool {
        self == DeviceClass::WirelessHeadset
    }
}

/// 渲染器协商结果
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NegotiatedFormat {
    /// 渲染器实际采用的格式
    pub format: StreamFormat,
    /// 渲染器期望的样本布局
    pub layout: SampleLayout,
}

/// 渲染器错误
#[derive(Error, Debug)]
pub enum RendererError {
    #[error("Unsupported format: {sample_rate} Hz, {channels} channels")]
    UnsupportedFormat { sample_rate: f64, channels: u32 },

    #[error("Renderer is not configured")]
    NotConfigured,

    #[error("Invalid renderer state: {0}")]
    InvalidState(&'static str),

    #[error("Renderer unavailable: {0}")]
    Unavailable(String),

    #[error("Device query failed: {0}")]
    DeviceQuery(String),

    #[error("Spatial audio not supported by {0}")]
    SpatialUnsupported(String),

    #[error("Platform audio call failed (OSStatus {0})")]
    Os(i32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// 平台渲染器
///
/// 调用约定：`configure` 只在停止状态下调用；`start` 之后渲染器
/// 独占 `RenderCursor`，`stop` 后释放。
pub trait Renderer: Send {
    /// 设备显示名
    fn device_name(&self) -> String;

    /// 协商流格式
    fn configure(&mut self, format: StreamFormat) -> Result<NegotiatedFormat, RendererError>;

    /// 开始拉取帧
    fn start(&mut self, cursor: RenderCursor) -> Result<(), RendererError>;

    /// 暂停拉取；返回后渲染上下文不再从队列取缓冲区
    fn pause(&mut self) -> Result<(), RendererError>;

    fn resume(&mut self) -> Result<(), RendererError>;

    /// 停止并释放游标，可重复调用
    fn stop(&mut self);

    /// 当前输出设备类别，每次调用都重新查询
    fn device_class(&self) -> Result<DeviceClass, RendererError>;

    /// 应用空间场景
    fn apply_spatial(&mut self, scene: &SpatialScene) -> Result<(), RendererError>;
}

/// 当前平台的默认渲染器
pub fn default_renderer() -> Box<dyn Renderer> {
    #[cfg(target_os = "macos")]
    {
        match coreaudio::CoreAudioRenderer::new() {
            Ok(renderer) => return Box::new(renderer),
            Err(e) => log::warn!("Core Audio unavailable ({}), using clock renderer", e),
        }
    }

    Box::new(ClockRenderer::new(ClockConfig::default()))
}
