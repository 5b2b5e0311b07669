//! The decoder boundary.
//!
//! A [`MediaDecoder`] binds one media asset, selects its (first) video
//! stream and produces canonical YUV420 frames at the configured target
//! resolution. The codec/container library itself lives behind this trait;
//! the in-tree implementations are [`RawFileDecoder`] for pre-scaled raw
//! assets and [`PatternDecoder`], the synthetic source used for fixtures and
//! fake-video mode.

mod pattern;
mod raw_file;

use std::time::Instant;

use kinocast_buffer::Frame;
use thiserror::Error;

pub use pattern::PatternDecoder;
pub use raw_file::RawFileDecoder;

#[derive(Debug, Error)]
pub enum DecodeError {
    /// Asset could not be bound.
    #[error("failed to open '{uri}': {source}")]
    Open {
        uri: String,
        #[source]
        source: std::io::Error,
    },
    /// Asset is malformed in a way that rules out further decoding.
    #[error("invalid asset '{uri}': {reason}")]
    InvalidAsset { uri: String, reason: String },
    /// The decoder was used before a successful `open`.
    #[error("decoder is not open")]
    NotOpen,
}

/// Per-call outcome of [`MediaDecoder::decode_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// A frame was decoded and accepted by the sink.
    Pushed,
    /// A frame was decoded but the sink refused it; the frame is dropped and
    /// counted.
    BufferFull,
    /// The asset is exhausted. Signaled once with work, sticky and cheap on
    /// every later call.
    EndOfStream,
    /// A recoverable fault; counted, the loop continues.
    TransientError,
    /// The decoder is non-functional until closed.
    FatalError,
}

/// Stream parameters negotiated during `open`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub duration_s: f64,
}

impl StreamInfo {
    pub fn frame_period_us(&self) -> i64 {
        (1_000_000.0 / self.fps.max(1.0)) as i64
    }
}

/// Where decoded frames go. The live ring, the shadow discard sink and test
/// vectors all implement this seam.
pub trait FrameSink {
    /// Offers a frame; returns it back if there is no room.
    fn offer(&mut self, frame: Frame) -> Result<(), Frame>;
}

pub trait MediaDecoder: Send {
    /// Binds the media source and computes timebase, frame rate and
    /// duration.
    fn open(&mut self) -> Result<StreamInfo, DecodeError>;

    /// Decodes the next frame into `sink`.
    fn decode_next(&mut self, sink: &mut dyn FrameSink) -> DecodeOutcome;

    fn stats(&self) -> DecodeStats;

    fn close(&mut self);
}

/// Point-in-time decoder statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DecodeStats {
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub transient_errors: u64,
    /// Exponential moving average of per-frame decode time.
    pub avg_decode_ms: f64,
}

/// Shared bookkeeping for decoder implementations.
#[derive(Debug, Default)]
pub(crate) struct StatsTracker {
    stats: DecodeStats,
}

impl StatsTracker {
    const EMA_WEIGHT: f64 = 0.1;

    pub(crate) fn snapshot(&self) -> DecodeStats {
        self.stats
    }

    pub(crate) fn record_decoded(&mut self, started: Instant) {
        let sample_ms = started.elapsed().as_secs_f64() * 1_000.0;
        self.stats.frames_decoded += 1;
        if self.stats.frames_decoded == 1 {
            self.stats.avg_decode_ms = sample_ms;
        } else {
            self.stats.avg_decode_ms +=
                Self::EMA_WEIGHT * (sample_ms - self.stats.avg_decode_ms);
        }
    }

    pub(crate) fn record_dropped(&mut self) {
        self.stats.frames_dropped += 1;
    }

    pub(crate) fn record_transient(&mut self) {
        self.stats.transient_errors += 1;
    }
}

/// Lifecycle shared by the in-tree decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecoderState {
    Closed,
    Open,
    EndOfStream,
    Failed,
}

/// Sink that accepts everything and counts it; used for shadow decode and
/// tests.
#[derive(Debug, Default)]
pub struct DiscardSink {
    pub frames: u64,
    pub last_pts_us: Option<i64>,
}

impl FrameSink for DiscardSink {
    fn offer(&mut self, frame: Frame) -> Result<(), Frame> {
        self.frames += 1;
        self.last_pts_us = Some(frame.pts_us);
        Ok(())
    }
}

/// Sink that collects frames; test helper.
#[derive(Debug, Default)]
pub struct VecSink {
    pub frames: Vec<Frame>,
}

impl FrameSink for VecSink {
    fn offer(&mut self, frame: Frame) -> Result<(), Frame> {
        self.frames.push(frame);
        Ok(())
    }
}
