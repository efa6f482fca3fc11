//! 音频文件解码器
//!
//! 使用 symphonia 库解码常见格式（FLAC, WAV, AIFF, MP3），
//! 输出交织 f64 样本，按请求的帧数分块返回

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units::Time;
use thiserror::Error;

use super::PcmSource;
use crate::audio::StreamFormat;

/// 解码错误
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("Failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("Unsupported audio format")]
    UnsupportedFormat,

    #[error("No audio track found")]
    NoAudioTrack,

    #[error("Failed to create decoder: {0}")]
    DecoderCreation(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Seek failed: {0}")]
    SeekFailed(String),
}

/// 音频文件信息
#[derive(Debug, Clone)]
pub struct AudioInfo {
    pub sample_rate: u32,
    pub channels: u32,
    /// 位深度（原始格式）
    pub bit_depth: Option<u32>,
    /// 总帧数（如果已知）
    pub total_frames: Option<u64>,
    pub duration_secs: Option<f64>,
    /// 格式名称（取自扩展名）
    pub format: String,
    pub codec: String,
}

impl AudioInfo {
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate as f64, self.channels)
    }
}

/// 音频文件解码器
pub struct AudioDecoder {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    info: AudioInfo,
    sample_buf: Option<SampleBuffer<f64>>,
    /// sample_buf 可容纳的帧数
    sample_buf_frames: usize,
    /// 已解码、尚未取走的交织样本
    pending: Vec<f64>,
    pending_pos: usize,
    eof: bool,
}

impl AudioDecoder {
    /// 打开音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DecodeError> {
        let path = path.as_ref();

        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|_| DecodeError::UnsupportedFormat)?;

        let reader = probed.format;
        let format_name = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|s| s.to_uppercase())
            .unwrap_or_else(|| "Unknown".to_string());

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(DecodeError::NoAudioTrack)?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let sample_rate = codec_params.sample_rate.ok_or(DecodeError::NoAudioTrack)?;
        let channels = codec_params
            .channels
            .map(|c| c.count() as u32)
            .unwrap_or(2);
        let total_frames = codec_params.n_frames;

        let codec_name = symphonia::default::get_codecs()
            .get_codec(codec_params.codec)
            .map(|c| c.short_name.to_string())
            .unwrap_or_else(|| "Unknown".to_string());

        let info = AudioInfo {
            sample_rate,
            channels,
            bit_depth: codec_params.bits_per_sample,
            total_frames,
            duration_secs: total_frames.map(|f| f as f64 / sample_rate as f64),
            format: format_name,
            codec: codec_name,
        };

        let decoder = symphonia::default::get_codecs()
            .make(codec_params, &DecoderOptions::default())
            .map_err(|e| DecodeError::DecoderCreation(e.to_string()))?;

        log::debug!(
            "Opened {}: {} {} Hz {}ch",
            path.display(),
            info.codec,
            info.sample_rate,
            info.channels
        );

        Ok(Self {
            reader,
            decoder,
            track_id,
            info,
            sample_buf: None,
            sample_buf_frames: 0,
            pending: Vec::new(),
            pending_pos: 0,
            eof: false,
        })
    }

    pub fn info(&self) -> &AudioInfo {
        &self.info
    }

    /// 解码下一个 packet 并追加到 pending；返回 false 表示文件结束
    fn decode_packet(&mut self) -> Result<bool, DecodeError> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(e)) => {
                    // 跳过损坏的帧
                    log::debug!("Skipping corrupt packet: {}", e);
                    continue;
                }
                Err(e) => return Err(DecodeError::DecodeFailed(e.to_string())),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let capacity = decoded.capacity();
            if self.sample_buf.is_none() || self.sample_buf_frames < capacity {
                self.sample_buf = Some(SampleBuffer::new(capacity as u64, *decoded.spec()));
                self.sample_buf_frames = capacity;
            }

            if let Some(buf) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                // 丢弃已读部分再追加
                self.pending.drain(..self.pending_pos);
                self.pending_pos = 0;
                self.pending.extend_from_slice(buf.samples());
            }
            return Ok(true);
        }
    }

    /// Seek 到指定时间（秒）
    pub fn seek(&mut self, time_secs: f64) -> Result<(), DecodeError> {
        let seek_to = SeekTo::Time {
            time: Time::new(time_secs as u64, time_secs.fract()),
            track_id: Some(self.track_id),
        };

        self.reader
            .seek(SeekMode::Accurate, seek_to)
            .map_err(|e| DecodeError::SeekFailed(e.to_string()))?;

        self.decoder.reset();
        self.pending.clear();
        self.pending_pos = 0;
        self.eof = false;
        Ok(())
    }

    pub fn is_eof(&self) -> bool {
        self.eof && self.pending_pos >= self.pending.len()
    }
}

impl PcmSource for AudioDecoder {
    type Error = DecodeError;

    fn format(&self) -> StreamFormat {
        self.info.stream_format()
    }

    fn next_chunk(&mut self, max_frames: usize, out: &mut Vec<f64>) -> Result<usize, DecodeError> {
        out.clear();
        let channels = self.info.channels.max(1) as usize;
        let wanted = max_frames * channels;

        while !self.eof && self.pending.len() - self.pending_pos < wanted {
            if !self.decode_packet()? {
                self.eof = true;
            }
        }

        let available = (self.pending.len() - self.pending_pos) / channels * channels;
        let take = wanted.min(available);
        out.extend_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
        self.pending_pos += take;
        Ok(take / channels)
    }
}
