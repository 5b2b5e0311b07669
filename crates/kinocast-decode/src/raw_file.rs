//! Decoder for pre-scaled raw assets: a file holding back-to-back planar
//! YUV420 frames at the target resolution. PTS is derived from the frame
//! index over the configured rate, so scaling and pixel-format conversion
//! are already settled at ingest time.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Instant;

use kinocast_buffer::Frame;
use tracing::{debug, warn};

use crate::{
    DecodeError, DecodeOutcome, DecodeStats, DecoderState, FrameSink, MediaDecoder, StatsTracker,
    StreamInfo,
};

pub struct RawFileDecoder {
    uri: Arc<str>,
    width: u32,
    height: u32,
    fps: f64,
    reader: Option<BufReader<File>>,
    state: DecoderState,
    next_index: u64,
    stats: StatsTracker,
}

impl RawFileDecoder {
    pub fn new(uri: &str, width: u32, height: u32, fps: f64) -> Self {
        Self {
            uri: Arc::from(uri),
            width,
            height,
            fps,
            reader: None,
            state: DecoderState::Closed,
            next_index: 0,
            stats: StatsTracker::default(),
        }
    }

    fn frame_len(&self) -> usize {
        Frame::yuv420_len(self.width, self.height)
    }

    fn frame_period_us(&self) -> i64 {
        (1_000_000.0 / self.fps.max(1.0)) as i64
    }
}

impl MediaDecoder for RawFileDecoder {
    fn open(&mut self) -> Result<StreamInfo, DecodeError> {
        let file = File::open(self.uri.as_ref()).map_err(|source| DecodeError::Open {
            uri: self.uri.to_string(),
            source,
        })?;
        let mut reader = BufReader::new(file);
        let byte_len = reader
            .seek(SeekFrom::End(0))
            .and_then(|len| reader.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(|source| DecodeError::Open {
                uri: self.uri.to_string(),
                source,
            })?;

        let frame_len = self.frame_len() as u64;
        if byte_len < frame_len {
            return Err(DecodeError::InvalidAsset {
                uri: self.uri.to_string(),
                reason: format!("{byte_len} bytes is shorter than one {frame_len}-byte frame"),
            });
        }
        let total_frames = byte_len / frame_len;

        self.reader = Some(reader);
        self.state = DecoderState::Open;
        self.next_index = 0;
        debug!(
            uri = %self.uri,
            frames = total_frames,
            fps = self.fps,
            "raw asset opened"
        );
        Ok(StreamInfo {
            width: self.width,
            height: self.height,
            fps: self.fps,
            duration_s: total_frames as f64 / self.fps.max(1.0),
        })
    }

    fn decode_next(&mut self, sink: &mut dyn FrameSink) -> DecodeOutcome {
        match self.state {
            DecoderState::Closed | DecoderState::Failed => return DecodeOutcome::FatalError,
            DecoderState::EndOfStream => return DecodeOutcome::EndOfStream,
            DecoderState::Open => {}
        }
        let Some(reader) = self.reader.as_mut() else {
            self.state = DecoderState::Failed;
            return DecodeOutcome::FatalError;
        };

        let started = Instant::now();
        let mut data = vec![0u8; Frame::yuv420_len(self.width, self.height)];
        match reader.read_exact(&mut data) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::UnexpectedEof => {
                self.state = DecoderState::EndOfStream;
                debug!(uri = %self.uri, frames = self.next_index, "raw asset exhausted");
                return DecodeOutcome::EndOfStream;
            }
            Err(error) if error.kind() == ErrorKind::Interrupted => {
                self.stats.record_transient();
                return DecodeOutcome::TransientError;
            }
            Err(error) => {
                warn!(uri = %self.uri, %error, "raw asset read failed");
                self.state = DecoderState::Failed;
                return DecodeOutcome::FatalError;
            }
        }

        let pts_us = self.next_index as i64 * self.frame_period_us();
        let frame = Frame {
            pts_us,
            dts_us: pts_us,
            duration_s: 1.0 / self.fps.max(1.0),
            source_uri: Arc::clone(&self.uri),
            width: self.width,
            height: self.height,
            data,
        };
        match sink.offer(frame) {
            Ok(()) => {
                self.next_index += 1;
                self.stats.record_decoded(started);
                DecodeOutcome::Pushed
            }
            Err(_rejected) => {
                // The read position has advanced, so the frame is lost;
                // callers avoid this by checking ring room first.
                self.next_index += 1;
                self.stats.record_dropped();
                DecodeOutcome::BufferFull
            }
        }
    }

    fn stats(&self) -> DecodeStats {
        self.stats.snapshot()
    }

    fn close(&mut self) {
        self.reader = None;
        self.state = DecoderState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VecSink;
    use std::io::Write;

    fn write_asset(frames: usize, width: u32, height: u32) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!(
            "kinocast-raw-{}-{frames}f.yuv",
            std::process::id()
        ));
        let mut file = File::create(&path).expect("failed to create test asset");
        for index in 0..frames {
            let data = vec![index as u8; Frame::yuv420_len(width, height)];
            file.write_all(&data).expect("failed to write test asset");
        }
        path
    }

    #[test]
    fn decodes_every_frame_then_signals_end_of_stream() {
        let path = write_asset(3, 4, 4);
        let mut decoder = RawFileDecoder::new(path.to_str().expect("path"), 4, 4, 25.0);
        let info = decoder.open().expect("failed to open raw asset");
        assert_eq!(info.width, 4);
        assert!((info.duration_s - 0.12).abs() < 1e-9);

        let mut sink = VecSink::default();
        for _ in 0..3 {
            assert_eq!(decoder.decode_next(&mut sink), DecodeOutcome::Pushed);
        }
        assert_eq!(decoder.decode_next(&mut sink), DecodeOutcome::EndOfStream);
        assert_eq!(decoder.decode_next(&mut sink), DecodeOutcome::EndOfStream);

        let pts: Vec<i64> = sink.frames.iter().map(|f| f.pts_us).collect();
        assert_eq!(pts, vec![0, 40_000, 80_000]);
        assert!(sink.frames[1].data.iter().all(|&b| b == 1));
        assert_eq!(decoder.stats().frames_decoded, 3);

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn open_fails_for_missing_asset() {
        let mut decoder = RawFileDecoder::new("/nonexistent/kinocast.yuv", 4, 4, 25.0);
        assert!(matches!(decoder.open(), Err(DecodeError::Open { .. })));
    }

    #[test]
    fn open_rejects_truncated_asset() {
        let mut path = std::env::temp_dir();
        path.push(format!("kinocast-short-{}.yuv", std::process::id()));
        std::fs::write(&path, [0u8; 4]).expect("failed to write test asset");
        let mut decoder = RawFileDecoder::new(path.to_str().expect("path"), 4, 4, 25.0);
        assert!(matches!(
            decoder.open(),
            Err(DecodeError::InvalidAsset { .. })
        ));
        std::fs::remove_file(path).ok();
    }
}
