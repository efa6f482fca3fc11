//! PCM Bridge Library
//!
//! Real-time audio output bridge: bounded buffering between a playback host
//! and a platform renderer, with format negotiation, spatial hooks,
//! device-aware configuration and latency reporting.

pub mod audio;
pub mod engine;
pub mod logging;
pub mod render;
pub mod source;
