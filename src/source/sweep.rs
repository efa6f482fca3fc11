//! 立体声扫频信号发生器
//!
//! 左右声道各自独立的起止频率，支持线性/对数扫频、右声道延迟、
//! 渐入渐出和音量。样本按需计算，不预先生成整段信号。

use std::convert::Infallible;
use std::f64::consts::TAU;

use thiserror::Error;

use super::PcmSource;
use crate::audio::StreamFormat;

/// 默认渐入渐出时长（秒）
pub const DEFAULT_FADE_SECS: f64 = 0.05;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SweepError {
    #[error("Duration must be positive, got {0}")]
    InvalidDuration(f64),

    #[error("Sample rate must be positive, got {0}")]
    InvalidSampleRate(f64),

    #[error("Frequencies must be positive, got {start} -> {end}")]
    InvalidFrequency { start: f64, end: f64 },

    #[error("Start and end frequency must differ, got {0}")]
    FlatSweep(f64),

    #[error("Volume must be within 0.0..=1.0, got {0}")]
    InvalidVolume(f64),

    #[error("Right channel delay must be non-negative, got {0}")]
    InvalidDelay(f64),
}

/// 起止频率（Hz）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyRange {
    pub start: f64,
    pub end: f64,
}

impl FrequencyRange {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// 上扫频
    pub fn is_rising(&self) -> bool {
        self.end > self.start
    }

    fn validate(&self) -> Result<(), SweepError> {
        if !(self.start > 0.0 && self.end > 0.0) || !self.start.is_finite() || !self.end.is_finite()
        {
            return Err(SweepError::InvalidFrequency {
                start: self.start,
                end: self.end,
            });
        }
        if self.start == self.end {
            return Err(SweepError::FlatSweep(self.start));
        }
        Ok(())
    }
}

impl Default for FrequencyRange {
    fn default() -> Self {
        Self::new(20.0, 20000.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SweepConfig {
    /// 时长（秒）
    pub duration_secs: f64,
    pub sample_rate: f64,
    pub left: FrequencyRange,
    pub right: FrequencyRange,
    /// 右声道延迟（秒），延迟期间静音
    pub right_delay_secs: f64,
    /// 对数扫频（默认线性）
    pub logarithmic: bool,
    pub volume: f64,
    pub fade_secs: f64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            duration_secs: 10.0,
            sample_rate: 44100.0,
            left: FrequencyRange::default(),
            right: FrequencyRange::default(),
            right_delay_secs: 0.0,
            logarithmic: false,
            volume: 0.8,
            fade_secs: DEFAULT_FADE_SECS,
        }
    }
}

impl SweepConfig {
    pub fn validate(&self) -> Result<(), SweepError> {
        if !(self.duration_secs > 0.0) || !self.duration_secs.is_finite() {
            return Err(SweepError::InvalidDuration(self.duration_secs));
        }
        if !(self.sample_rate > 0.0) || !self.sample_rate.is_finite() {
            return Err(SweepError::InvalidSampleRate(self.sample_rate));
        }
        self.left.validate()?;
        self.right.validate()?;
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(SweepError::InvalidVolume(self.volume));
        }
        if !(self.right_delay_secs >= 0.0) {
            return Err(SweepError::InvalidDelay(self.right_delay_secs));
        }
        Ok(())
    }
}

/// 单声道扫频参数
#[derive(Debug, Clone, Copy)]
struct Chirp {
    f0: f64,
    /// 线性：Hz/s；对数：ln(f1/f0)/T
    k: f64,
    logarithmic: bool,
}

impl Chirp {
    fn new(range: FrequencyRange, duration: f64, logarithmic: bool) -> Self {
        let k = if logarithmic {
            (range.end / range.start).ln() / duration
        } else {
            (range.end - range.start) / duration
        };
        Self {
            f0: range.start,
            k,
            logarithmic,
        }
    }

    #[inline]
    fn value(&self, t: f64) -> f64 {
        let phase = if self.logarithmic {
            self.f0 * ((self.k * t).exp() - 1.0) / self.k
        } else {
            self.f0 * t + self.k * t * t / 2.0
        };
        (TAU * phase).sin()
    }
}

pub struct SweepGenerator {
    config: SweepConfig,
    left: Chirp,
    right: Chirp,
    total_frames: usize,
    fade_frames: usize,
    delay_frames: usize,
    position: usize,
}

impl SweepGenerator {
    pub fn new(config: SweepConfig) -> Result<Self, SweepError> {
        config.validate()?;

        let total_frames = (config.sample_rate * config.duration_secs) as usize;
        let mut fade_frames = (config.fade_secs.max(0.0) * config.sample_rate) as usize;
        if fade_frames * 2 >= total_frames {
            fade_frames = total_frames / 4;
        }
        let delay_frames = (config.right_delay_secs * config.sample_rate) as usize;

        Ok(Self {
            left: Chirp::new(config.left, config.duration_secs, config.logarithmic),
            right: Chirp::new(config.right, config.duration_secs, config.logarithmic),
            total_frames,
            fade_frames,
            delay_frames,
            position: 0,
            config,
        })
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }

    pub fn remaining(&self) -> usize {
        self.total_frames - self.position
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    /// 第 `frame` 帧的 (左, 右) 样本
    pub fn sample_at(&self, frame: usize) -> (f64, f64) {
        if frame >= self.total_frames {
            return (0.0, 0.0);
        }

        let t = frame as f64 / self.config.sample_rate;
        let gain = self.fade_gain(frame) * self.config.volume;

        let left = self.left.value(t);
        let right = if frame < self.delay_frames {
            0.0
        } else {
            self.right
                .value((t - self.config.right_delay_secs).max(0.0))
        };

        (left * gain, right * gain)
    }

    /// 渐入渐出增益，两端各 `fade_frames` 帧线性变化（端点为 0）
    fn fade_gain(&self, frame: usize) -> f64 {
        let n = self.fade_frames;
        if n == 0 {
            return 1.0;
        }

        let ramp = |j: usize| {
            if n == 1 {
                0.0
            } else {
                j as f64 / (n - 1) as f64
            }
        };

        let mut gain = 1.0;
        if frame < n {
            gain *= ramp(frame);
        }
        let tail_start = self.total_frames - n;
        if frame >= tail_start {
            gain *= 1.0 - ramp(frame - tail_start);
        }
        gain
    }
}

impl PcmSource for SweepGenerator {
    type Error = Infallible;

    fn format(&self) -> StreamFormat {
        StreamFormat::new(self.config.sample_rate, 2)
    }

    fn next_chunk(&mut self, max_frames: usize, out: &mut Vec<f64>) -> Result<usize, Infallible> {
        out.clear();
        let frames = max_frames.min(self.remaining());
        out.reserve(frames * 2);

        for frame in self.position..self.position + frames {
            let (left, right) = self.sample_at(frame);
            out.push(left);
            out.push(right);
        }
        self.position += frames;
        Ok(frames)
    }
}
