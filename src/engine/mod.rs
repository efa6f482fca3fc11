//! 输出引擎
//!
//! 宿主与平台渲染器之间的桥，整合格式协商、转换、缓冲、状态机
//! 核心设计：宿主线程只入队，渲染器在自己的实时上下文里出队，
//! 两端通过 lock-free 队列和原子状态连接
//!
//! 所有方法都在生产者上下文中顺序调用（`&mut self`）。
//! 对外接口从不返回错误：失败以 `false` / 0 帧表示并记录日志。

pub mod device;
pub mod latency;
pub mod spatial;

use std::sync::Arc;

use glam::Vec3;
use thiserror::Error;

use crate::audio::convert::{deinterleave, interleave};
use crate::audio::{
    AudioBuffer, BufferQueue, ConvertError, ConvertKernel, PlaybackStats, RenderCursor,
    RenderShared, SampleConverter, SampleLayout, StatsReport, StreamFormat,
    DEFAULT_QUEUE_CAPACITY,
};
use crate::logging::{self, LogCallback};
use crate::render::{Renderer, RendererError};

pub use device::{Adaptation, AdaptationConfig, DeviceAdaptationPolicy};
pub use latency::{LatencyEstimator, MIN_LATENCY_SECS};
pub use spatial::{Orientation, SpatialController, SpatialScene};

/// 引擎状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disabled,
    Enabled,
    Paused,
}

/// 暂停时如何处理已排队的缓冲区
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PausePolicy {
    /// 保留，恢复后继续播放
    #[default]
    Retain,
    /// 丢弃
    Flush,
}

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 队列容量（缓冲区个数）
    pub queue_capacity: usize,
    /// 音量 [0, 1]
    pub volume: f32,
    pub pause_policy: PausePolicy,
    pub device_adaptation: AdaptationConfig,
    /// 强制使用的转换内核，None 为自动检测
    pub kernel: Option<ConvertKernel>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            volume: 1.0,
            pause_policy: PausePolicy::Retain,
            device_adaptation: AdaptationConfig::default(),
            kernel: None,
        }
    }
}

impl EngineConfig {
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = clamp_volume(volume).unwrap_or(1.0);
        self
    }

    pub fn with_pause_policy(mut self, policy: PausePolicy) -> Self {
        self.pause_policy = policy;
        self
    }

    pub fn with_device_adaptation(mut self, adaptation: AdaptationConfig) -> Self {
        self.device_adaptation = adaptation;
        self
    }

    pub fn with_kernel(mut self, kernel: ConvertKernel) -> Self {
        self.kernel = Some(kernel);
        self
    }
}

/// 引擎错误（内部使用，对外只记录日志）
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid audio format: {sample_rate} Hz, {channels} channels")]
    InvalidFormat { sample_rate: f64, channels: u32 },

    #[error("Audio format must be set up before enabling output")]
    FormatNotSet,

    #[error("Renderer error: {0}")]
    Renderer(#[from] RendererError),

    #[error("Conversion error: {0}")]
    Convert(#[from] ConvertError),
}

/// 宿主提供的一块样本
#[derive(Clone, Copy, Debug)]
pub enum Samples<'a> {
    /// 交织 LRLR...
    Interleaved(&'a [f64]),
    /// 每声道一个切片
    Planar(&'a [&'a [f64]]),
}

/// 引擎统计快照
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub state: EngineState,
    pub pending_buffers: usize,
    pub queue_capacity: usize,
    pub latency_secs: f64,
    pub underrun_count: u64,
    pub frames_rendered: u64,
    pub silent_frames: u64,
    pub buffers_consumed: u64,
    pub buffers_dropped: u64,
}

/// 输出引擎
pub struct Engine {
    config: EngineConfig,
    state: EngineState,
    renderer: Box<dyn Renderer>,
    converter: SampleConverter,
    queue: Arc<BufferQueue>,
    stats: Arc<PlaybackStats>,
    shared: Arc<RenderShared>,
    /// 已协商的格式
    format: Option<StreamFormat>,
    /// 渲染器期望的布局
    layout: SampleLayout,
    latency: LatencyEstimator,
    spatial: SpatialController,
    adaptation: DeviceAdaptationPolicy,
    device_label: Option<String>,
    /// 布局转换的中间缓冲
    scratch: Vec<f32>,
}

impl Engine {
    /// 使用默认配置创建引擎
    pub fn new(renderer: Box<dyn Renderer>) -> Self {
        Self::with_config(renderer, EngineConfig::default())
    }

    pub fn with_config(renderer: Box<dyn Renderer>, mut config: EngineConfig) -> Self {
        let converter = match config.kernel {
            Some(kernel) => SampleConverter::with_kernel(kernel).unwrap_or_else(|e| {
                log::warn!("{}, using detected kernel", e);
                SampleConverter::new()
            }),
            None => SampleConverter::new(),
        };
        log::debug!("Conversion kernel: {}", converter.kernel().name());

        config.queue_capacity = config.queue_capacity.max(1);
        config.volume = clamp_volume(config.volume).unwrap_or(1.0);

        Self {
            queue: Arc::new(BufferQueue::new(config.queue_capacity)),
            stats: Arc::new(PlaybackStats::new()),
            shared: Arc::new(RenderShared::new(config.volume)),
            adaptation: DeviceAdaptationPolicy::new(config.device_adaptation.clone()),
            state: EngineState::Disabled,
            renderer,
            converter,
            format: None,
            layout: SampleLayout::Interleaved,
            latency: LatencyEstimator::new(),
            spatial: SpatialController::new(),
            device_label: None,
            scratch: Vec::new(),
            config,
        }
    }

    // ---- 格式 ----

    /// 设置流格式
    ///
    /// 格式不变时为空操作；启用状态下会停止渲染器、清空队列、
    /// 重新协商并恢复原状态。被拒绝时保留原格式。
    pub fn setup_audio_format(&mut self, sample_rate: f64, channels: u32) -> bool {
        self.poll_renderer_fault();
        match self.try_setup_format(StreamFormat::new(sample_rate, channels)) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Audio format rejected: {}", e);
                false
            }
        }
    }

    fn try_setup_format(&mut self, format: StreamFormat) -> Result<(), EngineError> {
        if !format.is_valid() {
            return Err(EngineError::InvalidFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            });
        }
        if self.format == Some(format) {
            return Ok(());
        }

        let resume_state = self.state;
        if resume_state != EngineState::Disabled {
            // 旧格式的缓冲区无法按新格式播放
            self.renderer.stop();
            let dropped = self.queue.flush();
            log::debug!("Format change: {} queued buffers dropped", dropped);
        }

        let negotiated = match self.renderer.configure(format) {
            Ok(negotiated) => negotiated,
            Err(e) => {
                self.restore_previous_format(resume_state);
                return Err(e.into());
            }
        };

        if negotiated.format != format {
            log::info!(
                "Renderer runs at {} for requested {}",
                negotiated.format,
                format
            );
        }
        self.format = Some(format);
        self.layout = negotiated.layout;
        self.latency.reset();
        log::info!("Audio format: {} ({:?})", format, negotiated.layout);

        if resume_state != EngineState::Disabled {
            if let Err(e) = self.restart_renderer(resume_state) {
                self.degrade(&e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// 新格式被拒绝后，用原格式恢复渲染；恢复失败则降级为 Disabled
    fn restore_previous_format(&mut self, resume_state: EngineState) {
        if resume_state == EngineState::Disabled {
            return;
        }

        let restored = match self.format {
            Some(previous) => match self.renderer.configure(previous) {
                Ok(_) => self.restart_renderer(resume_state),
                Err(e) => Err(e.into()),
            },
            None => Err(EngineError::FormatNotSet),
        };

        if let Err(e) = restored {
            self.degrade(&e);
        }
    }

    /// 当前协商的格式
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    /// 渲染器期望的布局
    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    // ---- 数据 ----

    /// 提交一块样本，返回接受的帧数：全部或 0
    ///
    /// 未启用、暂停、队列满或输入无效时返回 0。
    /// 格式与当前不同时先重新协商。
    pub fn feed(
        &mut self,
        samples: Samples<'_>,
        sample_rate: f64,
        channels: u32,
        frame_count: usize,
    ) -> usize {
        self.poll_renderer_fault();

        if frame_count == 0 || channels == 0 {
            return 0;
        }
        if self.state != EngineState::Enabled {
            log::trace!("Feed rejected: output {:?}", self.state);
            return 0;
        }

        let format = StreamFormat::new(sample_rate, channels);
        if self.format != Some(format) {
            if !self.setup_audio_format(sample_rate, channels) {
                return 0;
            }
            // 重新协商可能失败并降级
            if self.state != EngineState::Enabled {
                return 0;
            }
        }

        if !self.queue.is_ready_for_more() {
            log::trace!("Feed rejected: queue full");
            return 0;
        }

        let buffer = match self.build_buffer(samples, format, frame_count) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::debug!("Invalid audio chunk: {}", e);
                return 0;
            }
        };

        match self.queue.enqueue(buffer) {
            Ok(()) => {
                self.latency.record_buffer(frame_count, sample_rate);
                frame_count
            }
            Err(rejected) => {
                self.queue.recycle(rejected.into_samples());
                0
            }
        }
    }

    /// 转换为渲染器布局的 f32 缓冲区
    fn build_buffer(
        &mut self,
        samples: Samples<'_>,
        format: StreamFormat,
        frames: usize,
    ) -> Result<AudioBuffer, EngineError> {
        let channels = format.samples_per_frame();
        let mut storage = self.queue.take_recycled().unwrap_or_default();

        match (samples, self.layout) {
            (Samples::Interleaved(data), SampleLayout::Interleaved) => {
                self.converter.convert(data, frames, channels, &mut storage)?;
            }
            (Samples::Interleaved(data), SampleLayout::Planar) => {
                self.converter
                    .convert(data, frames, channels, &mut self.scratch)?;
                storage.clear();
                storage.resize(self.scratch.len(), 0.0);
                deinterleave(&self.scratch, channels, &mut storage);
            }
            (Samples::Planar(planes), layout) => {
                if planes.len() != channels {
                    return Err(ConvertError::ChannelMismatch {
                        expected: channels,
                        got: planes.len(),
                    }
                    .into());
                }
                if layout == SampleLayout::Planar {
                    self.converter.convert_planar(planes, frames, &mut storage)?;
                } else {
                    self.converter
                        .convert_planar(planes, frames, &mut self.scratch)?;
                    storage.clear();
                    storage.resize(self.scratch.len(), 0.0);
                    interleave(&self.scratch, channels, &mut storage);
                }
            }
        }

        Ok(AudioBuffer::new(format, self.layout, frames, storage)?)
    }

    /// 清空队列，状态不变
    pub fn flush(&mut self) {
        let dropped = self.queue.flush();
        log::debug!("Flushed {} queued buffers", dropped);
    }

    // ---- 状态机 ----

    /// 启用输出，已启用时直接返回 true
    pub fn enable(&mut self) -> bool {
        self.poll_renderer_fault();
        if self.state != EngineState::Disabled {
            return true;
        }

        match self.try_enable() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Failed to enable output: {}", e);
                self.renderer.stop();
                self.state = EngineState::Disabled;
                false
            }
        }
    }

    fn try_enable(&mut self) -> Result<(), EngineError> {
        if self.format.is_none() {
            return Err(EngineError::FormatNotSet);
        }

        let adaptation = self.adaptation.on_enable(self.renderer.as_ref());
        let capacity = self
            .config
            .queue_capacity
            .max(adaptation.min_queue_capacity.unwrap_or(0));

        if capacity != self.queue.capacity() {
            self.queue = Arc::new(BufferQueue::new(capacity));
        } else {
            self.queue.flush();
        }
        self.stats.reset();
        self.latency.reset();
        self.shared.take_fault();

        self.start_renderer()?;
        self.state = EngineState::Enabled;
        self.device_label = adaptation.device_label;

        if adaptation.enable_spatial {
            self.spatial.set_enabled(true, self.renderer.as_mut());
        } else {
            self.spatial.reapply(self.renderer.as_mut());
        }

        log::info!(
            "Output enabled: {} (queue {} buffers)",
            self.device_label(),
            capacity
        );
        Ok(())
    }

    /// 停用输出，释放渲染器并丢弃队列
    pub fn disable(&mut self) {
        if self.state == EngineState::Disabled {
            return;
        }

        self.renderer.stop();
        let dropped = self.queue.flush();
        self.state = EngineState::Disabled;
        self.latency.reset();
        self.device_label = None;
        log::info!("Output disabled, {} queued buffers dropped", dropped);
    }

    /// `pause(true)` 暂停，`pause(false)` 等同于 `resume()`
    pub fn pause(&mut self, paused: bool) {
        if !paused {
            self.resume();
            return;
        }

        self.poll_renderer_fault();
        if self.state != EngineState::Enabled {
            return;
        }

        if let Err(e) = self.renderer.pause() {
            self.degrade(&e.into());
            return;
        }
        if self.config.pause_policy == PausePolicy::Flush {
            self.queue.flush();
        }
        self.state = EngineState::Paused;
        log::info!(
            "Output paused ({} buffers queued)",
            self.queue.occupancy()
        );
    }

    pub fn resume(&mut self) {
        self.poll_renderer_fault();
        if self.state != EngineState::Paused {
            return;
        }

        if let Err(e) = self.renderer.resume() {
            self.degrade(&e.into());
            return;
        }
        self.state = EngineState::Enabled;
        log::info!("Output resumed");
    }

    fn start_renderer(&mut self) -> Result<(), EngineError> {
        let cursor = RenderCursor::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.stats),
            Arc::clone(&self.shared),
        );
        self.renderer.start(cursor)?;
        Ok(())
    }

    /// 重新启动渲染器并恢复暂停状态和空间场景
    fn restart_renderer(&mut self, resume_state: EngineState) -> Result<(), EngineError> {
        self.start_renderer()?;
        if resume_state == EngineState::Paused {
            self.renderer.pause()?;
        }
        self.spatial.reapply(self.renderer.as_mut());
        Ok(())
    }

    /// 渲染器不可恢复的故障：降级为 Disabled
    fn degrade(&mut self, error: &EngineError) {
        log::error!("Renderer failure, output disabled: {}", error);
        self.renderer.stop();
        self.queue.flush();
        self.state = EngineState::Disabled;
        self.latency.reset();
        self.device_label = None;
    }

    /// 检查渲染上下文报告的故障
    fn poll_renderer_fault(&mut self) {
        if self.state != EngineState::Disabled && self.shared.take_fault() {
            self.degrade(&EngineError::Renderer(RendererError::Unavailable(
                "render context reported a fault".to_string(),
            )));
        }
    }

    // ---- 配置 ----

    /// 设置队列容量：停用时立即生效，否则下次启用生效；0 被忽略
    pub fn set_queue_size(&mut self, size: u32) {
        if size == 0 {
            log::warn!("Ignoring queue size 0");
            return;
        }

        let capacity = size as usize;
        self.config.queue_capacity = capacity;
        if self.state == EngineState::Disabled {
            if self.queue.capacity() != capacity {
                self.queue = Arc::new(BufferQueue::new(capacity));
            }
        } else {
            log::info!("Queue size {} takes effect on next enable", capacity);
        }
    }

    /// 设置音量，范围外的值被截断到 [0, 1]
    pub fn set_volume(&mut self, volume: f32) {
        match clamp_volume(volume) {
            Some(volume) => {
                self.config.volume = volume;
                self.shared.set_gain(volume);
            }
            None => log::warn!("Ignoring invalid volume {}", volume),
        }
    }

    pub fn volume(&self) -> f32 {
        self.config.volume
    }

    // ---- 空间音频 ----

    pub fn set_spatial_enabled(&mut self, enabled: bool) {
        self.spatial.set_enabled(enabled, self.renderer.as_mut());
    }

    pub fn is_spatial_enabled(&self) -> bool {
        self.spatial.is_enabled()
    }

    /// 渲染器是否真的在做空间渲染（启用但渲染器不支持时为 false）
    pub fn is_spatial_rendering(&self) -> bool {
        self.spatial.is_rendered()
    }

    pub fn set_listener_position(&mut self, x: f32, y: f32, z: f32) {
        self.spatial
            .set_listener_position(Vec3::new(x, y, z), self.renderer.as_mut());
    }

    pub fn set_listener_orientation(&mut self, yaw: f32, pitch: f32, roll: f32) {
        self.spatial.set_listener_orientation(
            Orientation::new(yaw, pitch, roll),
            self.renderer.as_mut(),
        );
    }

    pub fn set_source_position(&mut self, x: f32, y: f32, z: f32) {
        self.spatial
            .set_source_position(Vec3::new(x, y, z), self.renderer.as_mut());
    }

    pub fn spatial_scene(&self) -> &SpatialScene {
        self.spatial.scene()
    }

    // ---- 查询 ----

    /// 当前输出延迟（秒）
    pub fn current_latency(&self) -> f64 {
        self.latency.estimate(self.state, self.queue.occupancy())
    }

    pub fn pending_buffer_count(&self) -> u32 {
        self.queue.occupancy() as u32
    }

    pub fn is_ready_for_more_media_data(&self) -> bool {
        self.queue.is_ready_for_more()
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn is_enabled(&self) -> bool {
        self.state != EngineState::Disabled
    }

    pub fn is_paused(&self) -> bool {
        self.state == EngineState::Paused
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// 设备显示名（无线耳机带后缀）
    pub fn device_label(&self) -> String {
        self.device_label
            .clone()
            .unwrap_or_else(|| self.renderer.device_name())
    }

    pub fn converter_kernel(&self) -> ConvertKernel {
        self.converter.kernel()
    }

    /// 设置宿主日志回调，None 恢复默认输出
    pub fn set_log_callback(&mut self, callback: Option<LogCallback>) {
        logging::init(false);
        logging::set_host_callback(callback);
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.state,
            pending_buffers: self.queue.occupancy(),
            queue_capacity: self.queue.capacity(),
            latency_secs: self.current_latency(),
            underrun_count: self.stats.underrun_count(),
            frames_rendered: self.stats.frames_rendered(),
            silent_frames: self.stats.silent_frames(),
            buffers_consumed: self.stats.buffers_consumed(),
            buffers_dropped: self.stats.buffers_dropped(),
        }
    }

    /// 渲染统计报告
    pub fn stats_report(&self, frames_per_call: usize) -> StatsReport {
        let sample_rate = self.format.map(|f| f.sample_rate).unwrap_or(0.0);
        self.stats.report(frames_per_call, sample_rate)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.disable();
    }
}

fn clamp_volume(volume: f32) -> Option<f32> {
    if volume.is_nan() {
        None
    } else {
        Some(volume.clamp(0.0, 1.0))
    }
}
