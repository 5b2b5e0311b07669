//! Synthetic test-pattern source.
//!
//! Generates deterministic frames without touching any media library: a
//! moving vertical bar over a luma gradient, one frame per call at the
//! configured rate. This is the engine's fake-video mode and the workhorse
//! of the deterministic pacing fixtures.

use std::sync::Arc;
use std::time::Instant;

use kinocast_buffer::Frame;
use tracing::debug;

use crate::{
    DecodeError, DecodeOutcome, DecodeStats, DecoderState, FrameSink, MediaDecoder, StatsTracker,
    StreamInfo,
};

pub struct PatternDecoder {
    label: Arc<str>,
    width: u32,
    height: u32,
    fps: f64,
    /// Stop after this many frames; `None` runs forever.
    frame_limit: Option<u64>,
    state: DecoderState,
    next_index: u64,
    stats: StatsTracker,
}

impl PatternDecoder {
    pub fn new(label: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            label: Arc::from(label),
            width,
            height,
            fps,
            frame_limit: None,
            state: DecoderState::Closed,
            next_index: 0,
            stats: StatsTracker::default(),
        }
    }

    /// Bounds the stream to `frames` frames, after which the decoder signals
    /// end of stream.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.frame_limit = Some(frames);
        self
    }

    fn frame_period_us(&self) -> i64 {
        (1_000_000.0 / self.fps.max(1.0)) as i64
    }

    fn render(&self, index: u64) -> Frame {
        let width = self.width as usize;
        let height = self.height as usize;
        // Chroma planes stay at the neutral 128 fill; the pattern is
        // luma-only.
        let mut data = vec![128u8; Frame::yuv420_len(self.width, self.height)];

        // Luma: horizontal gradient with a moving full-height bar.
        let bar = (index as usize * 4) % width.max(1);
        for y in 0..height {
            for x in 0..width {
                let base = (x * 255 / width.max(1)) as u8;
                data[y * width + x] = if x == bar { 235 } else { base };
            }
        }

        let pts_us = index as i64 * self.frame_period_us();
        Frame {
            pts_us,
            dts_us: pts_us,
            duration_s: 1.0 / self.fps.max(1.0),
            source_uri: Arc::clone(&self.label),
            width: self.width,
            height: self.height,
            data,
        }
    }
}

impl MediaDecoder for PatternDecoder {
    fn open(&mut self) -> Result<StreamInfo, DecodeError> {
        self.state = DecoderState::Open;
        self.next_index = 0;
        let duration_s = self
            .frame_limit
            .map(|frames| frames as f64 / self.fps.max(1.0))
            .unwrap_or(f64::INFINITY);
        debug!(label = %self.label, fps = self.fps, "pattern source opened");
        Ok(StreamInfo {
            width: self.width,
            height: self.height,
            fps: self.fps,
            duration_s,
        })
    }

    fn decode_next(&mut self, sink: &mut dyn FrameSink) -> DecodeOutcome {
        match self.state {
            DecoderState::Closed => return DecodeOutcome::FatalError,
            DecoderState::Failed => return DecodeOutcome::FatalError,
            DecoderState::EndOfStream => return DecodeOutcome::EndOfStream,
            DecoderState::Open => {}
        }
        if let Some(limit) = self.frame_limit {
            if self.next_index >= limit {
                self.state = DecoderState::EndOfStream;
                debug!(label = %self.label, frames = self.next_index, "pattern source exhausted");
                return DecodeOutcome::EndOfStream;
            }
        }

        let started = Instant::now();
        let frame = self.render(self.next_index);
        match sink.offer(frame) {
            Ok(()) => {
                self.next_index += 1;
                self.stats.record_decoded(started);
                DecodeOutcome::Pushed
            }
            Err(_rejected) => {
                self.stats.record_dropped();
                DecodeOutcome::BufferFull
            }
        }
    }

    fn stats(&self) -> DecodeStats {
        self.stats.snapshot()
    }

    fn close(&mut self) {
        self.state = DecoderState::Closed;
    }
}
