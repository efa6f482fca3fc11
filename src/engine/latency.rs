//! 延迟估计
//!
//! 排队延迟 = 排队缓冲区数 × 单个缓冲区时长。
//! 未启用、暂停或尚未收到数据时报告固定的最小值。

use super::EngineState;

/// 最小报告延迟（秒）
pub const MIN_LATENCY_SECS: f64 = 0.010;

#[derive(Debug, Default, Clone, Copy)]
pub struct LatencyEstimator {
    /// 最近一个被接受的缓冲区时长
    buffer_secs: Option<f64>,
}

impl LatencyEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录被接受的缓冲区
    pub fn record_buffer(&mut self, frames: usize, sample_rate: f64) {
        if sample_rate > 0.0 && frames > 0 {
            self.buffer_secs = Some(frames as f64 / sample_rate);
        }
    }

    pub fn reset(&mut self) {
        self.buffer_secs = None;
    }

    pub fn estimate(&self, state: EngineState, occupancy: usize) -> f64 {
        match (state, self.buffer_secs) {
            (EngineState::Enabled, Some(secs)) => occupancy as f64 * secs,
            _ => MIN_LATENCY_SECS,
        }
    }
}
