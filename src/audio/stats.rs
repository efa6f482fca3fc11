//! 播放统计模块
//!
//! 在渲染上下文中收集统计信息，采用降频采样策略减少开销

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

/// 统计采样间隔：每 N 次渲染调用才采样一次
const SAMPLE_INTERVAL: u64 = 16;

/// 采样缓冲区大小
const TIMESTAMP_BUFFER_SIZE: usize = 256;

/// 播放统计收集器
///
/// 所有操作都是 lock-free 的，适合在渲染回调中使用
pub struct PlaybackStats {
    origin: Instant,
    render_calls: AtomicU64,
    last_sampled_ns: AtomicU64,

    // 采样间隔（纳秒）
    interval_buffer: Box<[AtomicU64; TIMESTAMP_BUFFER_SIZE]>,
    interval_write_idx: AtomicUsize,

    // 队列水位（缓冲区个数，也降频采样）
    water_level_buffer: Box<[AtomicUsize; TIMESTAMP_BUFFER_SIZE]>,
    water_level_write_idx: AtomicUsize,

    underrun_count: AtomicU64,
    frames_rendered: AtomicU64,
    silent_frames: AtomicU64,
    buffers_consumed: AtomicU64,
    buffers_dropped: AtomicU64,
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            render_calls: AtomicU64::new(0),
            last_sampled_ns: AtomicU64::new(0),
            interval_buffer: Box::new(std::array::from_fn(|_| AtomicU64::new(0))),
            interval_write_idx: AtomicUsize::new(0),
            water_level_buffer: Box::new(std::array::from_fn(|_| AtomicUsize::new(0))),
            water_level_write_idx: AtomicUsize::new(0),
            underrun_count: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            silent_frames: AtomicU64::new(0),
            buffers_consumed: AtomicU64::new(0),
            buffers_dropped: AtomicU64::new(0),
        }
    }

    /// 在渲染调用开始时调用
    ///
    /// 只在采样点才读时钟和水位
    #[inline]
    pub fn on_render(&self, occupancy: usize) {
        let count = self.render_calls.fetch_add(1, Ordering::Relaxed);

        if count % SAMPLE_INTERVAL == 0 {
            // +1 保证非零，0 表示尚未采样
            let now = self.origin.elapsed().as_nanos() as u64 + 1;
            let last = self.last_sampled_ns.swap(now, Ordering::Relaxed);

            if last > 0 {
                let interval = now.saturating_sub(last);
                let idx = self.interval_write_idx.fetch_add(1, Ordering::Relaxed)
                    % TIMESTAMP_BUFFER_SIZE;
                self.interval_buffer[idx].store(interval, Ordering::Relaxed);
            }

            let idx = self.water_level_write_idx.fetch_add(1, Ordering::Relaxed)
                % TIMESTAMP_BUFFER_SIZE;
            self.water_level_buffer[idx].store(occupancy, Ordering::Relaxed);
        }
    }

    /// 记录一次渲染的输出：有效帧和补静音帧
    #[inline]
    pub fn add_frames(&self, rendered: usize, silent: usize) {
        self.frames_rendered
            .fetch_add(rendered as u64, Ordering::Relaxed);
        if silent > 0 {
            self.silent_frames.fetch_add(silent as u64, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_underrun(&self) {
        self.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_buffer_consumed(&self) {
        self.buffers_consumed.fetch_add(1, Ordering::Relaxed);
    }

    /// flush 后渲染端丢弃手中的缓冲区
    #[inline]
    pub fn record_buffer_dropped(&self) {
        self.buffers_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn render_calls(&self) -> u64 {
        self.render_calls.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn frames_rendered(&self) -> u64 {
        self.frames_rendered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn silent_frames(&self) -> u64 {
        self.silent_frames.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffers_consumed(&self) -> u64 {
        self.buffers_consumed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn buffers_dropped(&self) -> u64 {
        self.buffers_dropped.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `frames_per_call`: 渲染端每次拉取的帧数，用于计算期望间隔
    pub fn report(&self, frames_per_call: usize, sample_rate: f64) -> StatsReport {
        let expected_interval_ns = if sample_rate > 0.0 {
            (frames_per_call as f64 * 1e9 / sample_rate) as u64
        } else {
            0
        };
        let expected_sampled_interval_ns = expected_interval_ns * SAMPLE_INTERVAL;

        let intervals_ns: Vec<u64> = self
            .interval_buffer
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .filter(|&ns| ns > 0)
            .collect();

        let sampled = (self.water_level_write_idx.load(Ordering::Relaxed))
            .min(TIMESTAMP_BUFFER_SIZE);
        let water_levels: Vec<usize> = self.water_level_buffer[..sampled]
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .collect();

        let interval_stats = match (intervals_ns.iter().min(), intervals_ns.iter().max()) {
            (Some(&min_ns), Some(&max_ns)) => IntervalStats {
                min_ns,
                max_ns,
                avg_ns: intervals_ns.iter().sum::<u64>() / intervals_ns.len() as u64,
            },
            _ => IntervalStats::default(),
        };

        let water_stats = match (water_levels.iter().min(), water_levels.iter().max()) {
            (Some(&min), Some(&max)) => WaterLevelStats { min, max },
            _ => WaterLevelStats::default(),
        };

        StatsReport {
            render_calls: self.render_calls(),
            sample_interval: SAMPLE_INTERVAL,
            expected_sampled_interval_ns,
            interval_stats,
            water_stats,
            underrun_count: self.underrun_count(),
            frames_rendered: self.frames_rendered(),
            silent_frames: self.silent_frames(),
            buffers_consumed: self.buffers_consumed(),
            buffers_dropped: self.buffers_dropped(),
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.render_calls.store(0, Ordering::Relaxed);
        self.last_sampled_ns.store(0, Ordering::Relaxed);
        self.interval_write_idx.store(0, Ordering::Relaxed);
        self.water_level_write_idx.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.frames_rendered.store(0, Ordering::Relaxed);
        self.silent_frames.store(0, Ordering::Relaxed);
        self.buffers_consumed.store(0, Ordering::Relaxed);
        self.buffers_dropped.store(0, Ordering::Relaxed);

        for i in 0..TIMESTAMP_BUFFER_SIZE {
            self.interval_buffer[i].store(0, Ordering::Relaxed);
            self.water_level_buffer[i].store(0, Ordering::Relaxed);
        }
    }
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug)]
pub struct StatsReport {
    pub render_calls: u64,
    pub sample_interval: u64,
    pub expected_sampled_interval_ns: u64,
    pub interval_stats: IntervalStats,
    pub water_stats: WaterLevelStats,
    pub underrun_count: u64,
    pub frames_rendered: u64,
    pub silent_frames: u64,
    pub buffers_consumed: u64,
    pub buffers_dropped: u64,
}

#[derive(Debug, Default)]
pub struct IntervalStats {
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
}

#[derive(Debug, Default)]
pub struct WaterLevelStats {
    pub min: usize,
    pub max: usize,
}

impl std::fmt::Display for StatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ms = |ns: u64| ns as f64 / 1_000_000.0;

        writeln!(f, "Playback Statistics")?;
        writeln!(f, "===================")?;
        writeln!(f, "Total render calls: {}", self.render_calls)?;
        writeln!(
            f,
            "Stats sample interval: every {} calls",
            self.sample_interval
        )?;
        writeln!(f)?;

        writeln!(f, "Render Timing (per {} calls):", self.sample_interval)?;
        writeln!(f, "  Expected: {:.2} ms", ms(self.expected_sampled_interval_ns))?;
        writeln!(f, "  Measured:")?;
        writeln!(f, "    Min: {:.2} ms", ms(self.interval_stats.min_ns))?;
        writeln!(f, "    Max: {:.2} ms", ms(self.interval_stats.max_ns))?;
        writeln!(f, "    Avg: {:.2} ms", ms(self.interval_stats.avg_ns))?;

        let jitter_ns = self
            .interval_stats
            .max_ns
            .saturating_sub(self.interval_stats.min_ns);
        let jitter_pct = if self.expected_sampled_interval_ns > 0 {
            jitter_ns as f64 / self.expected_sampled_interval_ns as f64 * 100.0
        } else {
            0.0
        };
        writeln!(f, "  Jitter: {:.2} ms ({:.1}%)", ms(jitter_ns), jitter_pct)?;
        writeln!(f)?;

        writeln!(f, "Queue Water Level:")?;
        writeln!(f, "  Min: {} buffers", self.water_stats.min)?;
        writeln!(f, "  Max: {} buffers", self.water_stats.max)?;
        writeln!(f)?;

        writeln!(f, "Underruns: {}", self.underrun_count)?;
        writeln!(f, "Frames rendered: {}", self.frames_rendered)?;
        writeln!(f, "Silent frames: {}", self.silent_frames)?;
        writeln!(f, "Buffers consumed: {}", self.buffers_consumed)?;
        writeln!(f, "Buffers dropped by flush: {}", self.buffers_dropped)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = PlaybackStats::new();
        stats.on_render(2);
        stats.add_frames(480, 32);
        stats.record_underrun();
        stats.record_buffer_consumed();
        stats.record_buffer_dropped();

        assert_eq!(stats.render_calls(), 1);
        assert_eq!(stats.frames_rendered(), 480);
        assert_eq!(stats.silent_frames(), 32);
        assert_eq!(stats.underrun_count(), 1);
        assert_eq!(stats.buffers_consumed(), 1);
        assert_eq!(stats.buffers_dropped(), 1);
    }

    #[test]
    fn test_water_level_sampled() {
        let stats = PlaybackStats::new();
        // 第 0 次和第 16 次调用被采样
        for i in 0..17 {
            stats.on_render(if i == 16 { 1 } else { 3 });
        }

        let report = stats.report(512, 48000.0);
        assert_eq!(report.water_stats.min, 1);
        assert_eq!(report.water_stats.max, 3);
        assert_eq!(report.render_calls, 17);
        assert!(report.interval_stats.max_ns >= report.interval_stats.min_ns);
    }

    #[test]
    fn test_reset() {
        let stats = PlaybackStats::new();
        stats.on_render(3);
        stats.add_frames(100, 0);
        stats.reset();

        let report = stats.report(512, 48000.0);
        assert_eq!(report.render_calls, 0);
        assert_eq!(report.frames_rendered, 0);
        assert_eq!(report.water_stats.max, 0);
    }

    #[test]
    fn test_report_display() {
        let stats = PlaybackStats::new();
        stats.record_underrun();
        let text = stats.report(512, 48000.0).to_string();
        assert!(text.contains("Underruns: 1"));
        assert!(text.contains("Expected: 170.67 ms"));
    }
}
