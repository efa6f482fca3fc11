//! 音频核心模块
//!
//! 包含：
//! - Buffer: 流格式和不可变音频缓冲区
//! - Convert: f64 → f32 窄化和交织/解交织
//! - Queue: 有界 lock-free 缓冲区队列
//! - Cursor: 渲染端拉取游标
//! - Stats: 播放统计

pub mod buffer;
pub mod convert;
pub mod cursor;
pub mod queue;
pub mod stats;

pub use buffer::{AudioBuffer, SampleLayout, StreamFormat, MAX_CHANNELS};
pub use convert::{ConvertError, ConvertKernel, SampleConverter};
pub use cursor::{RenderCursor, RenderShared};
pub use queue::{BufferQueue, DEFAULT_QUEUE_CAPACITY};
pub use stats::{PlaybackStats, StatsReport};
