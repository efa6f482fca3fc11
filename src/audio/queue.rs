//! 有界缓冲区队列
//!
//! 生产者（宿主线程）入队已转换的 `AudioBuffer`，渲染端出队播放。
//! - 满时拒绝入队，把缓冲区原样交还，从不覆盖或丢弃
//! - 出队从不阻塞，空时返回 None
//! - flush 清空队列并推进 flush 纪元，渲染端据此丢弃手中未播完的缓冲区
//!
//! 样本存储通过回收池循环使用，稳态下两端都不分配、不释放内存。

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::CachePadded;

use super::buffer::AudioBuffer;

/// 默认队列容量（缓冲区个数）
pub const DEFAULT_QUEUE_CAPACITY: usize = 3;

/// 回收池比队列多留的槽位：渲染端手中一个，生产端转换中一个
const RECYCLE_HEADROOM: usize = 2;

pub struct BufferQueue {
    slots: ArrayQueue<AudioBuffer>,
    recycled: ArrayQueue<Vec<f32>>,
    flush_epoch: CachePadded<AtomicU64>,
}

impl BufferQueue {
    /// 创建队列，容量至少为 1
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: ArrayQueue::new(capacity),
            recycled: ArrayQueue::new(capacity + RECYCLE_HEADROOM),
            flush_epoch: CachePadded::new(AtomicU64::new(0)),
        }
    }

    /// 入队；队列已满时把缓冲区交还给调用者
    ///
    /// 缓冲区被打上当前 flush 纪元。入队与 flush 都在生产端顺序调用，
    /// 因此纪元与缓冲区是否早于某次 flush 一一对应。
    #[inline]
    pub fn enqueue(&self, mut buffer: AudioBuffer) -> Result<(), AudioBuffer> {
        buffer.stamp_epoch(self.epoch());
        self.slots.push(buffer)
    }

    /// 出队最早的缓冲区（渲染端调用，不阻塞）
    #[inline]
    pub fn dequeue_for_render(&self) -> Option<AudioBuffer> {
        self.slots.pop()
    }

    /// 当前排队的缓冲区数
    #[inline]
    pub fn occupancy(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.capacity()
    }

    /// 是否还能再接受一个缓冲区
    #[inline]
    pub fn is_ready_for_more(&self) -> bool {
        !self.slots.is_full()
    }

    /// 清空队列，返回被丢弃的缓冲区数
    ///
    /// 先弹出全部缓冲区再推进纪元。渲染端取走的缓冲区若带有旧纪元，
    /// 出队时或下一次渲染开始时被丢弃，flush 返回后不会再播放。
    pub fn flush(&self) -> usize {
        let mut dropped = 0;
        while let Some(buffer) = self.slots.pop() {
            self.recycle(buffer.into_samples());
            dropped += 1;
        }
        self.flush_epoch.fetch_add(1, Ordering::AcqRel);
        dropped
    }

    /// 当前 flush 纪元
    #[inline]
    pub fn epoch(&self) -> u64 {
        self.flush_epoch.load(Ordering::Acquire)
    }

    /// 归还样本存储
    ///
    /// 池满时存储被释放；池容量按队列容量预留，正常运行不会发生。
    #[inline]
    pub fn recycle(&self, samples: Vec<f32>) {
        let _ = self.recycled.push(samples);
    }

    /// 取一块回收的存储（生产端调用）
    #[inline]
    pub fn take_recycled(&self) -> Option<Vec<f32>> {
        self.recycled.pop()
    }
}

impl Default for BufferQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("occupancy", &self.occupancy())
            .field("capacity", &self.capacity())
            .field("epoch", &self.epoch())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{SampleLayout, StreamFormat};
    use std::sync::Arc;
    use std::thread;

    fn buffer(tag: f32) -> AudioBuffer {
        let format = StreamFormat::new(48000.0, 2);
        AudioBuffer::new(format, SampleLayout::Interleaved, 2, vec![tag; 4]).unwrap()
    }

    #[test]
    fn test_fifo_order() {
        let queue = BufferQueue::new(3);
        queue.enqueue(buffer(1.0)).unwrap();
        queue.enqueue(buffer(2.0)).unwrap();

        assert_eq!(queue.dequeue_for_render().unwrap().as_slice()[0], 1.0);
        assert_eq!(queue.dequeue_for_render().unwrap().as_slice()[0], 2.0);
        assert!(queue.dequeue_for_render().is_none());
    }

    #[test]
    fn test_full_queue_hands_buffer_back() {
        let queue = BufferQueue::new(3);
        for i in 0..3 {
            queue.enqueue(buffer(i as f32)).unwrap();
        }

        assert!(!queue.is_ready_for_more());
        let rejected = queue.enqueue(buffer(9.0)).unwrap_err();
        assert_eq!(rejected.as_slice()[0], 9.0);
        assert_eq!(queue.occupancy(), 3);

        // 已排队的内容未被覆盖
        assert_eq!(queue.dequeue_for_render().unwrap().as_slice()[0], 0.0);
        assert!(queue.is_ready_for_more());
    }

    #[test]
    fn test_zero_capacity_clamped() {
        let queue = BufferQueue::new(0);
        assert_eq!(queue.capacity(), 1);
    }

    #[test]
    fn test_flush_empties_and_bumps_epoch() {
        let queue = BufferQueue::new(3);
        queue.enqueue(buffer(1.0)).unwrap();
        queue.enqueue(buffer(2.0)).unwrap();
        let epoch = queue.epoch();

        assert_eq!(queue.flush(), 2);
        assert_eq!(queue.occupancy(), 0);
        assert!(queue.dequeue_for_render().is_none());
        assert_eq!(queue.epoch(), epoch + 1);

        // flush 后的存储进入回收池
        assert!(queue.take_recycled().is_some());
        assert!(queue.take_recycled().is_some());
        assert!(queue.take_recycled().is_none());
    }

    #[test]
    fn test_enqueue_stamps_flush_epoch() {
        let queue = BufferQueue::new(3);
        queue.enqueue(buffer(1.0)).unwrap();
        let in_flight = queue.dequeue_for_render().unwrap();

        queue.flush();
        queue.enqueue(buffer(2.0)).unwrap();

        assert_ne!(in_flight.flush_epoch(), queue.epoch());
        let fresh = queue.dequeue_for_render().unwrap();
        assert_eq!(fresh.flush_epoch(), queue.epoch());
    }

    #[test]
    fn test_occupancy_bounded_under_concurrency() {
        let queue = Arc::new(BufferQueue::new(4));
        let consumer_queue = Arc::clone(&queue);

        let consumer = thread::spawn(move || {
            let mut received = 0;
            while received < 1000 {
                if let Some(b) = consumer_queue.dequeue_for_render() {
                    assert_eq!(b.as_slice()[0], received as f32);
                    received += 1;
                }
                assert!(consumer_queue.occupancy() <= 4);
            }
        });

        let mut next = 0;
        while next < 1000 {
            if queue.enqueue(buffer(next as f32)).is_ok() {
                next += 1;
            }
            assert!(queue.occupancy() <= queue.capacity());
        }

        consumer.join().unwrap();
        assert_eq!(queue.occupancy(), 0);
    }
}
