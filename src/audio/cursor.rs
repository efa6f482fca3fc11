//! 渲染端游标
//!
//! 渲染器持有 `RenderCursor`，每次回调按需拉取帧：
//! 保存未播完的缓冲区和帧偏移，跨回调继续播放。
//!
//! **绝对禁止（渲染上下文）：**
//! - 锁
//! - 分配
//! - I/O

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use super::buffer::AudioBuffer;
use super::queue::BufferQueue;
use super::stats::PlaybackStats;

/// 生产端与渲染端共享的控制状态
pub struct RenderShared {
    /// f32 增益的位模式
    gain: CachePadded<AtomicU32>,
    faulted: CachePadded<AtomicBool>,
}

impl RenderShared {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: CachePadded::new(AtomicU32::new(gain.to_bits())),
            faulted: CachePadded::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain.load(Ordering::Relaxed))
    }

    /// 渲染器报告不可恢复的故障
    #[inline]
    pub fn mark_faulted(&self) {
        self.faulted.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// 读取并清除故障标志
    #[inline]
    pub fn take_fault(&self) -> bool {
        self.faulted.swap(false, Ordering::AcqRel)
    }
}

impl Default for RenderShared {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// 渲染端拉取适配器
pub struct RenderCursor {
    queue: Arc<BufferQueue>,
    stats: Arc<PlaybackStats>,
    shared: Arc<RenderShared>,
    current: Option<AudioBuffer>,
    position: usize,
}

impl RenderCursor {
    pub fn new(
        queue: Arc<BufferQueue>,
        stats: Arc<PlaybackStats>,
        shared: Arc<RenderShared>,
    ) -> Self {
        Self {
            queue,
            stats,
            shared,
            current: None,
            position: 0,
        }
    }

    #[inline]
    pub fn shared(&self) -> &RenderShared {
        &self.shared
    }

    #[inline]
    pub fn stats(&self) -> &PlaybackStats {
        &self.stats
    }

    /// 是否持有未播完的缓冲区
    #[inline]
    pub fn has_pending_frames(&self) -> bool {
        self.current.is_some()
    }

    /// 渲染器报告故障（例如设备丢失、写入失败）
    pub fn mark_faulted(&self) {
        self.shared.mark_faulted();
    }

    /// 填充交织输出，返回有效帧数，其余补静音
    ///
    /// 缓冲区声道多于 `channels` 时截断，少于时多出的声道补零
    pub fn render_interleaved(&mut self, out: &mut [f32], channels: usize) -> usize {
        self.stats.on_render(self.queue.occupancy());
        if channels == 0 {
            return 0;
        }
        self.sync_epoch();

        let wanted = out.len() / channels;
        let gain = self.shared.gain();
        let mut written = 0;

        while written < wanted {
            if self.current.is_none() && !self.advance() {
                break;
            }
            let Some(buffer) = self.current.as_ref() else {
                break;
            };

            let frames = buffer.frames();
            let source_channels = buffer.channels();
            let n = (frames - self.position).min(wanted - written);

            for f in 0..n {
                let frame = &mut out[(written + f) * channels..(written + f + 1) * channels];
                for (ch, slot) in frame.iter_mut().enumerate() {
                    *slot = if ch < source_channels {
                        buffer.sample(self.position + f, ch) * gain
                    } else {
                        0.0
                    };
                }
            }

            written += n;
            self.position += n;
            if self.position >= frames {
                self.finish_current();
            }
        }

        out[written * channels..].fill(0.0);
        self.account(written, wanted);
        written
    }

    /// 填充逐声道输出，返回有效帧数，其余补静音
    ///
    /// 帧数取所有声道切片中最短的长度
    pub fn render_planar(&mut self, planes: &mut [&mut [f32]]) -> usize {
        self.stats.on_render(self.queue.occupancy());
        let wanted = planes.iter().map(|p| p.len()).min().unwrap_or(0);
        if wanted == 0 {
            return 0;
        }
        self.sync_epoch();

        let gain = self.shared.gain();
        let mut written = 0;

        while written < wanted {
            if self.current.is_none() && !self.advance() {
                break;
            }
            let Some(buffer) = self.current.as_ref() else {
                break;
            };

            let frames = buffer.frames();
            let source_channels = buffer.channels();
            let n = (frames - self.position).min(wanted - written);

            for (ch, plane) in planes.iter_mut().enumerate() {
                let dst = &mut plane[written..written + n];
                if ch >= source_channels {
                    dst.fill(0.0);
                    continue;
                }
                match buffer.channel(ch) {
                    Some(src) => {
                        for (d, &s) in dst.iter_mut().zip(&src[self.position..self.position + n]) {
                            *d = s * gain;
                        }
                    }
                    None => {
                        for (f, d) in dst.iter_mut().enumerate() {
                            *d = buffer.sample(self.position + f, ch) * gain;
                        }
                    }
                }
            }

            written += n;
            self.position += n;
            if self.position >= frames {
                self.finish_current();
            }
        }

        for plane in planes.iter_mut() {
            plane[written..].fill(0.0);
        }
        self.account(written, wanted);
        written
    }

    /// 手中的缓冲区早于最近一次 flush 时丢弃
    #[inline]
    fn sync_epoch(&mut self) {
        let epoch = self.queue.epoch();
        let stale = matches!(&self.current, Some(b) if b.flush_epoch() != epoch);
        if stale {
            self.drop_current();
        }
    }

    /// 取下一个属于当前纪元的缓冲区，跳过 flush 之前出队的
    #[inline]
    fn advance(&mut self) -> bool {
        while let Some(buffer) = self.queue.dequeue_for_render() {
            if buffer.flush_epoch() != self.queue.epoch() {
                self.queue.recycle(buffer.into_samples());
                self.stats.record_buffer_dropped();
                continue;
            }
            self.current = Some(buffer);
            self.position = 0;
            self.stats.record_buffer_consumed();
            return true;
        }
        false
    }

    #[inline]
    fn drop_current(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.queue.recycle(buffer.into_samples());
            self.stats.record_buffer_dropped();
        }
        self.position = 0;
    }

    #[inline]
    fn finish_current(&mut self) {
        if let Some(buffer) = self.current.take() {
            self.queue.recycle(buffer.into_samples());
        }
        self.position = 0;
    }

    #[inline]
    fn account(&self, written: usize, wanted: usize) {
        self.stats.add_frames(written, wanted - written);
        if written < wanted {
            self.stats.record_underrun();
        }
    }
}

impl Drop for RenderCursor {
    fn drop(&mut self) {
        self.finish_current();
    }
}
