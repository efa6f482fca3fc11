//! 宿主侧音源
//!
//! 产生交织 f64 样本，供 CLI 喂给引擎

pub mod decoder;
pub mod sweep;

use crate::audio::StreamFormat;

pub use decoder::{AudioDecoder, AudioInfo, DecodeError};
pub use sweep::{FrequencyRange, SweepConfig, SweepError, SweepGenerator};

/// 分块产生交织样本的音源
pub trait PcmSource {
    type Error: std::error::Error + Send + Sync + 'static;

    fn format(&self) -> StreamFormat;

    /// 清空 `out` 并写入至多 `max_frames` 帧，返回帧数；0 表示结束
    fn next_chunk(&mut self, max_frames: usize, out: &mut Vec<f64>)
        -> Result<usize, Self::Error>;
}
