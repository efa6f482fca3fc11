//! 音频缓冲区和流格式
//!
//! 内部表示：窄精度 f32 样本
//! - Interleaved: LRLRLR...，单一序列
//! - Planar: 每声道一段连续样本，共享同一块分配 (L...L R...R)

use super::convert::ConvertError;

/// 渲染器接受的最大声道数
pub const MAX_CHANNELS: u32 = 8;

/// 样本布局
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SampleLayout {
    /// 交织：所有声道相邻
    #[default]
    Interleaved,
    /// 非交织：每声道独立连续
    Planar,
}

/// 流格式
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamFormat {
    pub sample_rate: f64,
    pub channels: u32,
}

impl StreamFormat {
    pub fn new(sample_rate: f64, channels: u32) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 采样率为有限正数且至少一个声道
    pub fn is_valid(&self) -> bool {
        self.sample_rate.is_finite() && self.sample_rate > 0.0 && self.channels > 0
    }

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 帧数对应的时长（秒）
    #[inline]
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        frames as f64 / self.sample_rate
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz {}ch", self.sample_rate, self.channels)
    }
}

/// 待渲染的音频缓冲区
///
/// 入队后不可变：字段私有，只提供只读访问。
/// 被渲染端消费后，底层 Vec 通过 `into_samples` 归还给回收池。
#[derive(Debug)]
pub struct AudioBuffer {
    format: StreamFormat,
    layout: SampleLayout,
    frames: usize,
    samples: Vec<f32>,
    /// 入队时的 flush 纪元
    epoch: u64,
}

impl AudioBuffer {
    /// 创建缓冲区，`samples.len()` 必须等于 `frames × channels`
    pub fn new(
        format: StreamFormat,
        layout: SampleLayout,
        frames: usize,
        samples: Vec<f32>,
    ) -> Result<Self, ConvertError> {
        let expected = frames * format.samples_per_frame();
        if samples.len() != expected {
            return Err(ConvertError::LengthMismatch {
                expected,
                got: samples.len(),
            });
        }

        Ok(Self {
            format,
            layout,
            frames,
            samples,
            epoch: 0,
        })
    }

    #[inline]
    pub fn format(&self) -> StreamFormat {
        self.format
    }

    #[inline]
    pub fn layout(&self) -> SampleLayout {
        self.layout
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.frames
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.format.samples_per_frame()
    }

    /// 缓冲区时长（秒）
    pub fn duration_secs(&self) -> f64 {
        self.format.frames_to_secs(self.frames)
    }

    /// 读取单个样本，与布局无关
    #[inline]
    pub fn sample(&self, frame: usize, channel: usize) -> f32 {
        match self.layout {
            SampleLayout::Interleaved => self.samples[frame * self.channels() + channel],
            SampleLayout::Planar => self.samples[channel * self.frames + frame],
        }
    }

    /// 获取单个声道的连续样本（仅 Planar 布局）
    pub fn channel(&self, channel: usize) -> Option<&[f32]> {
        if self.layout != SampleLayout::Planar || channel >= self.channels() {
            return None;
        }
        let start = channel * self.frames;
        Some(&self.samples[start..start + self.frames])
    }

    #[inline]
    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// 入队时记录的 flush 纪元
    #[inline]
    pub fn flush_epoch(&self) -> u64 {
        self.epoch
    }

    #[inline]
    pub(crate) fn stamp_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// 释放所有权，返回底层存储（用于回收）
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_validity() {
        assert!(StreamFormat::new(48000.0, 2).is_valid());
        assert!(!StreamFormat::new(0.0, 2).is_valid());
        assert!(!StreamFormat::new(-44100.0, 2).is_valid());
        assert!(!StreamFormat::new(f64::NAN, 2).is_valid());
        assert!(!StreamFormat::new(48000.0, 0).is_valid());
    }

    #[test]
    fn test_buffer_length_checked() {
        let format = StreamFormat::new(48000.0, 2);
        let err = AudioBuffer::new(format, SampleLayout::Interleaved, 4, vec![0.0; 7]).unwrap_err();
        assert!(matches!(err, ConvertError::LengthMismatch { expected: 8, got: 7 }));
    }

    #[test]
    fn test_sample_access_by_layout() {
        let format = StreamFormat::new(48000.0, 2);

        // 交织：L0 R0 L1 R1
        let interleaved =
            AudioBuffer::new(format, SampleLayout::Interleaved, 2, vec![1.0, 2.0, 3.0, 4.0])
                .unwrap();
        assert_eq!(interleaved.sample(1, 0), 3.0);
        assert_eq!(interleaved.sample(1, 1), 4.0);
        assert!(interleaved.channel(0).is_none());

        // 非交织：L0 L1 R0 R1
        let planar =
            AudioBuffer::new(format, SampleLayout::Planar, 2, vec![1.0, 3.0, 2.0, 4.0]).unwrap();
        assert_eq!(planar.sample(1, 0), 3.0);
        assert_eq!(planar.sample(0, 1), 2.0);
        assert_eq!(planar.channel(1), Some(&[2.0, 4.0][..]));
        assert!(planar.channel(2).is_none());
    }

    #[test]
    fn test_duration() {
        let format = StreamFormat::new(48000.0, 1);
        let buffer =
            AudioBuffer::new(format, SampleLayout::Interleaved, 4800, vec![0.0; 4800]).unwrap();
        assert!((buffer.duration_secs() - 0.1).abs() < 1e-12);
    }
}
