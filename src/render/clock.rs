//! 软件时钟渲染器
//!
//! 不依赖任何音频设备：专用线程按采样率节拍每次拉取 `period_frames` 帧，
//! 可选地把渲染结果交给 `CaptureSink`（例如写入原始 PCM 文件）。
//!
//! 暂停时线程 park，恢复/停止时 unpark。`pause` 等到线程确认 park 后才返回，
//! 之后渲染线程不会再从队列取缓冲区。

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;

use super::{DeviceClass, NegotiatedFormat, Renderer, RendererError};
use crate::audio::{RenderCursor, SampleLayout, StreamFormat, MAX_CHANNELS};
use crate::engine::spatial::SpatialScene;

/// 接受的采样率范围
const MIN_SAMPLE_RATE: f64 = 8_000.0;
const MAX_SAMPLE_RATE: f64 = 384_000.0;

/// 渲染输出的接收端
///
/// 在渲染线程上调用；返回错误会终止渲染并报告故障。
pub trait CaptureSink: Send {
    fn write(&mut self, samples: &[f32], format: StreamFormat) -> std::io::Result<()>;

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// 写入原始小端 f32 交织 PCM
pub struct RawPcmSink {
    writer: BufWriter<File>,
    frames_written: u64,
}

impl RawPcmSink {
    pub fn create<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = File::create(path.as_ref())?;
        log::info!("Capturing rendered audio to {}", path.as_ref().display());
        Ok(Self {
            // 1 MiB，减少渲染线程上的系统调用
            writer: BufWriter::with_capacity(1 << 20, file),
            frames_written: 0,
        })
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }
}

impl CaptureSink for RawPcmSink {
    fn write(&mut self, samples: &[f32], format: StreamFormat) -> std::io::Result<()> {
        for sample in samples {
            self.writer.write_all(&sample.to_le_bytes())?;
        }
        self.frames_written += (samples.len() / format.samples_per_frame().max(1)) as u64;
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// 时钟渲染器配置
#[derive(Clone, Debug)]
pub struct ClockConfig {
    /// 每次拉取的帧数
    pub period_frames: usize,
    pub device_name: String,
    /// 报告给设备适配策略的类别
    pub device_class: DeviceClass,
    /// 尝试提升渲染线程优先级
    pub realtime_priority: bool,
}

impl Default for ClockConfig {
    fn default() -> Self {
        Self {
            period_frames: 512,
            device_name: "Clock Output".to_string(),
            device_class: DeviceClass::Other,
            realtime_priority: true,
        }
    }
}

struct ClockControl {
    running: CachePadded<AtomicBool>,
    paused: CachePadded<AtomicBool>,
    /// 渲染线程已看到暂停并即将 park
    parked: CachePadded<AtomicBool>,
}

type SinkSlot = Option<Box<dyn CaptureSink>>;

pub struct ClockRenderer {
    config: ClockConfig,
    format: Option<StreamFormat>,
    sink: SinkSlot,
    control: Arc<ClockControl>,
    /// 渲染线程结束时交还 sink
    thread: Option<JoinHandle<SinkSlot>>,
    scene: Option<SpatialScene>,
}

impl ClockRenderer {
    pub fn new(config: ClockConfig) -> Self {
        Self {
            config,
            format: None,
            sink: None,
            control: Arc::new(ClockControl {
                running: CachePadded::new(AtomicBool::new(false)),
                paused: CachePadded::new(AtomicBool::new(false)),
                parked: CachePadded::new(AtomicBool::new(false)),
            }),
            thread: None,
            scene: None,
        }
    }

    /// 附加捕获 sink（仅在停止时生效，下一次 start 使用）
    pub fn with_sink(mut self, sink: Box<dyn CaptureSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }

    pub fn is_paused(&self) -> bool {
        self.control.paused.load(Ordering::Acquire)
    }

    /// 最近一次收到的空间场景
    pub fn last_scene(&self) -> Option<&SpatialScene> {
        self.scene.as_ref()
    }

    fn wake(&self) {
        if let Some(handle) = self.thread.as_ref() {
            handle.thread().unpark();
        }
    }

    /// 等待渲染线程确认暂停，最多两个周期加 50 ms
    fn wait_parked(&self) {
        let Some(handle) = self.thread.as_ref() else {
            return;
        };
        let period = self
            .format
            .map(|f| self.config.period_frames.max(1) as f64 / f.sample_rate)
            .unwrap_or(0.0);
        let timeout = Duration::from_secs_f64(period * 2.0) + Duration::from_millis(50);
        let start = Instant::now();

        while !self.control.parked.load(Ordering::Acquire) && !handle.is_finished() {
            if start.elapsed() > timeout {
                log::warn!("Clock render thread did not acknowledge pause within {:?}", timeout);
                return;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Renderer for ClockRenderer {
    fn device_name(&self) -> String {
        self.config.device_name.clone()
    }

    fn configure(&mut self, format: StreamFormat) -> Result<NegotiatedFormat, RendererError> {
        if self.thread.is_some() {
            return Err(RendererError::InvalidState("configure while running"));
        }

        let rate_ok = (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&format.sample_rate);
        let channels_ok = (1..=MAX_CHANNELS).contains(&format.channels);
        if !rate_ok || !channels_ok {
            return Err(RendererError::UnsupportedFormat {
                sample_rate: format.sample_rate,
                channels: format.channels,
            });
        }

        self.format = Some(format);
        log::debug!("Clock renderer configured: {}", format);
        Ok(NegotiatedFormat {
            format,
            layout: SampleLayout::Interleaved,
        })
    }

    fn start(&mut self, cursor: RenderCursor) -> Result<(), RendererError> {
        if self.thread.is_some() {
            return Err(RendererError::InvalidState("already running"));
        }
        let format = self.format.ok_or(RendererError::NotConfigured)?;

        self.control.running.store(true, Ordering::Release);
        self.control.paused.store(false, Ordering::Release);
        self.control.parked.store(false, Ordering::Release);

        let control = Arc::clone(&self.control);
        let sink = self.sink.take();
        let period_frames = self.config.period_frames.max(1);
        let realtime = self.config.realtime_priority;

        let handle = thread::Builder::new()
            .name("clock-render".into())
            .spawn(move || {
                if realtime {
                    promote_thread_priority();
                }
                clock_thread_main(cursor, control, format, period_frames, sink)
            })?;

        self.thread = Some(handle);
        log::info!(
            "Clock renderer started: {}, {} frames per period",
            format,
            period_frames
        );
        Ok(())
    }

    fn pause(&mut self) -> Result<(), RendererError> {
        if self.thread.is_none() {
            return Err(RendererError::InvalidState("pause while stopped"));
        }
        if !self.control.paused.load(Ordering::Acquire) {
            self.control.parked.store(false, Ordering::Release);
            self.control.paused.store(true, Ordering::Release);
        }
        self.wait_parked();
        Ok(())
    }

    fn resume(&mut self) -> Result<(), RendererError> {
        if self.thread.is_none() {
            return Err(RendererError::InvalidState("resume while stopped"));
        }
        self.control.paused.store(false, Ordering::Release);
        self.wake();
        Ok(())
    }

    fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        self.control.running.store(false, Ordering::Release);
        handle.thread().unpark();

        match handle.join() {
            Ok(sink) => self.sink = sink,
            Err(_) => log::error!("Clock render thread panicked"),
        }
        self.control.paused.store(false, Ordering::Release);
        self.control.parked.store(false, Ordering::Release);
        log::info!("Clock renderer stopped");
    }

    fn device_class(&self) -> Result<DeviceClass, RendererError> {
        Ok(self.config.device_class)
    }

    fn apply_spatial(&mut self, scene: &SpatialScene) -> Result<(), RendererError> {
        // 软件渲染不做空间化，只记录场景
        self.scene = Some(*scene);
        Err(RendererError::SpatialUnsupported(self.config.device_name.clone()))
    }
}

impl Drop for ClockRenderer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// 渲染线程主循环
///
/// 按截止时间推进；落后时不追帧，直接以当前时间为新起点。
fn clock_thread_main(
    mut cursor: RenderCursor,
    control: Arc<ClockControl>,
    format: StreamFormat,
    period_frames: usize,
    mut sink: SinkSlot,
) -> SinkSlot {
    let channels = format.samples_per_frame();
    let mut block = vec![0.0f32; period_frames * channels];
    let period = Duration::from_secs_f64(period_frames as f64 / format.sample_rate);
    let mut deadline = Instant::now();

    while control.running.load(Ordering::Acquire) {
        if control.paused.load(Ordering::Acquire) {
            control.parked.store(true, Ordering::Release);
            thread::park();
            deadline = Instant::now();
            continue;
        }

        cursor.render_interleaved(&mut block, channels);

        if let Some(s) = sink.as_mut() {
            if let Err(e) = s.write(&block, format) {
                log::error!("Capture sink write failed: {}", e);
                cursor.mark_faulted();
                break;
            }
        }

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            thread::sleep(deadline - now);
        } else {
            deadline = now;
        }
    }

    if let Some(s) = sink.as_mut() {
        if let Err(e) = s.flush() {
            log::warn!("Capture sink flush failed: {}", e);
        }
    }
    sink
}

/// 提升当前线程的调度优先级，失败不影响渲染
#[cfg(target_os = "linux")]
fn promote_thread_priority() {
    let param = libc::sched_param { sched_priority: 10 };
    let result = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result == 0 {
        log::debug!("Render thread promoted to SCHED_FIFO");
        return;
    }

    // 无 CAP_SYS_NICE 时退回 nice 值
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, -10) };
    if result == 0 {
        log::debug!("Render thread niceness lowered to -10");
    } else {
        log::debug!("Render thread priority unchanged (insufficient privileges)");
    }
}

#[cfg(target_os = "macos")]
fn promote_thread_priority() {
    // QOS_CLASS_USER_INTERACTIVE
    const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;
    extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
    }
    let result = unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0) };
    if result == 0 {
        log::debug!("Render thread QoS set to user-interactive");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn promote_thread_priority() {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioBuffer, BufferQueue, PlaybackStats, RenderShared};
    use std::sync::Mutex;

    /// 收集到内存的 sink
    struct MemorySink(Arc<Mutex<Vec<f32>>>);

    impl CaptureSink for MemorySink {
        fn write(&mut self, samples: &[f32], _format: StreamFormat) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }

    struct FailingSink;

    impl CaptureSink for FailingSink {
        fn write(&mut self, _samples: &[f32], _format: StreamFormat) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    fn test_config() -> ClockConfig {
        ClockConfig {
            period_frames: 64,
            realtime_priority: false,
            ..ClockConfig::default()
        }
    }

    fn cursor_for(queue: &Arc<BufferQueue>, shared: &Arc<RenderShared>) -> RenderCursor {
        RenderCursor::new(
            Arc::clone(queue),
            Arc::new(PlaybackStats::new()),
            Arc::clone(shared),
        )
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_configure_range() {
        let mut renderer = ClockRenderer::new(test_config());
        assert!(renderer.configure(StreamFormat::new(48000.0, 2)).is_ok());
        assert!(renderer.configure(StreamFormat::new(4000.0, 2)).is_err());
        assert!(renderer.configure(StreamFormat::new(48000.0, 9)).is_err());

        let negotiated = renderer.configure(StreamFormat::new(44100.0, 1)).unwrap();
        assert_eq!(negotiated.layout, SampleLayout::Interleaved);
        assert_eq!(negotiated.format.sample_rate, 44100.0);
    }

    #[test]
    fn test_start_requires_configure() {
        let mut renderer = ClockRenderer::new(test_config());
        let queue = Arc::new(BufferQueue::new(3));
        let shared = Arc::new(RenderShared::default());
        assert!(matches!(
            renderer.start(cursor_for(&queue, &shared)),
            Err(RendererError::NotConfigured)
        ));
    }

    #[test]
    fn test_renders_queued_audio_into_sink() {
        let captured = Arc::new(Mutex::new(Vec::new()));
        let mut renderer = ClockRenderer::new(test_config())
            .with_sink(Box::new(MemorySink(Arc::clone(&captured))));
        let format = StreamFormat::new(8000.0, 1);
        renderer.configure(format).unwrap();

        let queue = Arc::new(BufferQueue::new(3));
        let shared = Arc::new(RenderShared::default());
        let buffer =
            AudioBuffer::new(format, SampleLayout::Interleaved, 100, vec![0.25; 100]).unwrap();
        queue.enqueue(buffer).unwrap();

        renderer.start(cursor_for(&queue, &shared)).unwrap();
        assert!(wait_until(|| captured.lock().unwrap().len() >= 128));
        renderer.stop();

        let captured = captured.lock().unwrap();
        assert_eq!(queue.occupancy(), 0);
        assert!(captured[..100].iter().all(|&s| s == 0.25));
        assert!(captured[100..128].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_pause_holds_queue() {
        let mut renderer = ClockRenderer::new(test_config());
        let format = StreamFormat::new(8000.0, 1);
        renderer.configure(format).unwrap();

        let queue = Arc::new(BufferQueue::new(3));
        let shared = Arc::new(RenderShared::default());
        renderer.start(cursor_for(&queue, &shared)).unwrap();
        renderer.pause().unwrap();
        assert!(renderer.is_paused());

        let buffer =
            AudioBuffer::new(format, SampleLayout::Interleaved, 64, vec![0.5; 64]).unwrap();
        queue.enqueue(buffer).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.occupancy(), 1);

        renderer.resume().unwrap();
        assert!(wait_until(|| queue.occupancy() == 0));
        renderer.stop();
        assert!(!renderer.is_running());
    }

    #[test]
    fn test_no_render_calls_after_pause_returns() {
        let mut renderer = ClockRenderer::new(test_config());
        renderer.configure(StreamFormat::new(8000.0, 1)).unwrap();

        let queue = Arc::new(BufferQueue::new(3));
        let stats = Arc::new(PlaybackStats::new());
        let cursor = RenderCursor::new(
            Arc::clone(&queue),
            Arc::clone(&stats),
            Arc::new(RenderShared::default()),
        );
        renderer.start(cursor).unwrap();

        for _ in 0..5 {
            assert!(wait_until(|| stats.render_calls() > 0));
            renderer.pause().unwrap();
            let calls = stats.render_calls();
            // 至少跨过几个 8 ms 周期
            thread::sleep(Duration::from_millis(40));
            assert_eq!(stats.render_calls(), calls);

            stats.reset();
            renderer.resume().unwrap();
        }
        renderer.stop();
    }

    #[test]
    fn test_sink_failure_marks_fault() {
        let mut renderer = ClockRenderer::new(test_config()).with_sink(Box::new(FailingSink));
        renderer.configure(StreamFormat::new(8000.0, 1)).unwrap();

        let queue = Arc::new(BufferQueue::new(3));
        let shared = Arc::new(RenderShared::default());
        renderer.start(cursor_for(&queue, &shared)).unwrap();

        assert!(wait_until(|| shared.is_faulted()));
        renderer.stop();
    }

    #[test]
    fn test_raw_pcm_sink_writes_le_f32() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let format = StreamFormat::new(48000.0, 2);
        {
            let mut sink = RawPcmSink::create(file.path()).unwrap();
            sink.write(&[1.0, -0.5, 0.25, 0.0], format).unwrap();
            sink.flush().unwrap();
            assert_eq!(sink.frames_written(), 2);
        }

        let bytes = std::fs::read(file.path()).unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[4..8], &(-0.5f32).to_le_bytes());
    }

    #[test]
    fn test_spatial_scene_recorded_but_unsupported() {
        let mut renderer = ClockRenderer::new(test_config());
        let scene = SpatialScene {
            enabled: true,
            ..SpatialScene::default()
        };
        assert!(matches!(
            renderer.apply_spatial(&scene),
            Err(RendererError::SpatialUnsupported(_))
        ));
        assert_eq!(renderer.last_scene(), Some(&scene));
    }
}
