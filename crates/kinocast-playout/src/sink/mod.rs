//! The pacing sink: the emission loop that owns wall-clock timing.
//!
//! One worker thread per channel pulls frames from the ring, converts each
//! frame's PTS into a station-time deadline and decides emit / wait / drop.
//! Encoded transport packets pass through a bounded queue into the transport
//! writer; when the queue backs up the sink stops encoding, and when it
//! overflows the oldest batch is dropped so the live edge survives.

pub mod encoder;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use kinocast_buffer::{Frame, RingConsumer};
use kinocast_core::config::{ChannelConfig, UnderflowPolicy};
use kinocast_timing::MasterClock;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::transport::TransportWriter;
use encoder::{null_packet, EncoderConfig, EncoderPipeline};

/// Bounded encoder drain on shutdown.
const MAX_FLUSH_ITERATIONS: usize = 100;
const FLUSH_SLEEP: Duration = Duration::from_millis(10);
/// Sleep while the ring is starved; chunked so stop stays responsive.
const UNDERFLOW_SLEEP: Duration = Duration::from_millis(5);
const SLEEP_CHUNK: Duration = Duration::from_millis(2);
/// Throttle for queue-overflow warnings.
const OVERFLOW_WARN_EVERY: u64 = 10;

#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub target_fps: f64,
    /// Block-wait when ahead of the deadline by more than this.
    pub early_soft_wait_us: i64,
    /// Wake this much before the deadline.
    pub wait_fudge_us: i64,
    /// Drop frames later than this.
    pub max_late_tolerance_us: i64,
    /// First-frame heuristic for PTS in an absolute vs relative timebase.
    pub same_timebase_threshold_us: i64,
    /// Busy-wait floor.
    pub min_sleep_us: u64,
    pub max_output_queue: usize,
    pub output_queue_high_water: usize,
    pub underflow_policy: UnderflowPolicy,
    pub encoder: EncoderConfig,
}

impl SinkConfig {
    pub fn from_channel(config: &ChannelConfig) -> Self {
        Self {
            target_fps: config.target_fps,
            early_soft_wait_us: 5_000,
            wait_fudge_us: 500,
            max_late_tolerance_us: 50_000,
            same_timebase_threshold_us: 1_000_000,
            min_sleep_us: 100,
            max_output_queue: config.max_output_queue,
            output_queue_high_water: config.output_queue_high_water,
            underflow_policy: config.underflow_policy,
            encoder: EncoderConfig {
                width: config.target_width,
                height: config.target_height,
                target_fps: config.target_fps,
                bitrate_kbps: config.bitrate_kbps,
                gop_size: config.gop_size,
            },
        }
    }

    fn frame_period_us(&self) -> i64 {
        (1_000_000.0 / self.target_fps.max(1.0)) as i64
    }
}

#[derive(Debug, Default)]
pub struct SinkStats {
    pub frames_sent: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub late_frames: AtomicU64,
    pub late_frame_drops: AtomicU64,
    pub encoding_errors: AtomicU64,
    pub network_errors: AtomicU64,
    pub buffer_underruns: AtomicU64,
    pub packets_dropped: AtomicU64,
    /// Frames synthesized under the underflow policy.
    pub corrections: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub late_frames: u64,
    pub late_frame_drops: u64,
    pub encoding_errors: u64,
    pub network_errors: u64,
    pub buffer_underruns: u64,
    pub packets_dropped: u64,
    pub corrections: u64,
}

impl SinkStats {
    fn snapshot(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            late_frames: self.late_frames.load(Ordering::Relaxed),
            late_frame_drops: self.late_frame_drops.load(Ordering::Relaxed),
            encoding_errors: self.encoding_errors.load(Ordering::Relaxed),
            network_errors: self.network_errors.load(Ordering::Relaxed),
            buffer_underruns: self.buffer_underruns.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            corrections: self.corrections.load(Ordering::Relaxed),
        }
    }
}

struct PacketBatch {
    bytes: Vec<u8>,
}

struct SinkShared {
    config: SinkConfig,
    clock: Arc<dyn MasterClock>,
    transport: Arc<TransportWriter>,
    stop_requested: AtomicBool,
    running: AtomicBool,
    stats: SinkStats,
    queue: Mutex<VecDeque<PacketBatch>>,
}

pub struct PacingSink {
    shared: Arc<SinkShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PacingSink {
    /// Spawns the emission worker owning `consumer`.
    pub fn start(
        channel_id: i32,
        config: SinkConfig,
        consumer: RingConsumer,
        clock: Arc<dyn MasterClock>,
        transport: Arc<TransportWriter>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(SinkShared {
            config,
            clock,
            transport,
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(true),
            stats: SinkStats::default(),
            queue: Mutex::new(VecDeque::new()),
        });
        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name(format!("kinocast-sink-{channel_id}"))
            .spawn(move || worker_loop(worker_shared, consumer))?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(join)),
        })
    }

    pub fn stats(&self) -> SinkStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the worker: it drains the encoder queue (bounded), pads the
    /// stream to a 188-byte boundary and only then is the transport closed.
    pub fn stop(&self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        if let Some(join) = self
            .worker
            .lock()
            .expect("sink worker mutex poisoned")
            .take()
        {
            let _ = join.join();
        }
        self.shared.transport.stop();
    }
}

impl Drop for PacingSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<SinkShared>, mut consumer: RingConsumer) {
    let config = &shared.config;
    let frame_period_us = config.frame_period_us();
    let mut pipeline = EncoderPipeline::new(config.encoder);
    let mut encoder_active = false;

    // Bound lazily on the first frame that is not classified as stale, so
    // decoders producing PTS in their own timebase get a robust reference.
    let mut anchor_us: Option<i64> = None;
    let mut last_emitted: Option<Frame> = None;
    // PTS the next synthesized (freeze/black) frame would carry.
    let mut synth_pts_us: i64 = 0;
    // Strict output-order latch; protects downstream monotonicity across
    // synthesized frames.
    let mut last_output_pts_us = i64::MIN;
    let mut ring_was_empty = false;

    info!("pacing sink started");
    while !shared.stop_requested.load(Ordering::Acquire) {
        let now_us = shared.clock.now_us();

        // Track the consumer; encoding restarts fresh for every new client.
        let connected = shared.transport.is_connected();
        if connected && !encoder_active {
            pipeline.reset();
            encoder_active = true;
            debug!("consumer attached, encoder reset");
        } else if !connected && encoder_active {
            encoder_active = false;
            shared.queue.lock().expect("sink queue mutex poisoned").clear();
            debug!("consumer detached, encoded output discarded");
        }

        drain_queue(&shared);

        let queue_len = shared
            .queue
            .lock()
            .expect("sink queue mutex poisoned")
            .len();
        if queue_len >= config.output_queue_high_water {
            // Encoder output is backed up; do not encode this iteration.
            sleep_checked(&shared, Duration::from_micros(config.min_sleep_us));
            continue;
        }

        let Some(head_pts_us) = consumer.peek().map(|frame| frame.pts_us) else {
            if !ring_was_empty {
                shared.stats.buffer_underruns.fetch_add(1, Ordering::Relaxed);
                ring_was_empty = true;
            }
            handle_underflow(
                &shared,
                &mut pipeline,
                encoder_active,
                anchor_us,
                &last_emitted,
                &mut synth_pts_us,
                &mut last_output_pts_us,
                now_us,
                frame_period_us,
            );
            sleep_checked(&shared, UNDERFLOW_SLEEP);
            continue;
        };
        ring_was_empty = false;

        let anchor = match anchor_us {
            Some(anchor) => anchor,
            None => {
                // Stale-frame guard: a first PTS that reads as slightly-old
                // station time is a late frame in the clock's own timebase,
                // not a fresh relative stream. Dropping it avoids binding
                // the epoch to a stale reference.
                let pts_age_us = now_us - head_pts_us;
                if pts_age_us < -config.wait_fudge_us
                    && -pts_age_us < config.same_timebase_threshold_us
                {
                    // Symmetric case: a first PTS slightly in the station
                    // future is a same-timebase frame that is early, not a
                    // fresh relative stream. Wait for its time instead of
                    // binding ahead of it.
                    shared
                        .clock
                        .wait_until_us(head_pts_us - config.wait_fudge_us, &shared.stop_requested);
                    continue;
                }
                if pts_age_us > config.max_late_tolerance_us
                    && pts_age_us < config.same_timebase_threshold_us
                {
                    if let Some(dropped) = consumer.try_pop() {
                        shared.stats.late_frame_drops.fetch_add(1, Ordering::Relaxed);
                        shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        shared.stats.late_frames.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            pts_age_ms = pts_age_us / 1000,
                            pts_us = dropped.pts_us,
                            "dropped stale frame before anchoring"
                        );
                    }
                    continue;
                }
                let anchor = now_us - head_pts_us;
                anchor_us = Some(anchor);
                synth_pts_us = head_pts_us;
                debug!(anchor_us = anchor, first_pts_us = head_pts_us, "pacing anchored");
                anchor
            }
        };

        let deadline_us = anchor + head_pts_us;
        let gap_us = now_us - deadline_us;

        if gap_us < -config.early_soft_wait_us {
            shared
                .clock
                .wait_until_us(deadline_us - config.wait_fudge_us, &shared.stop_requested);
            continue;
        }

        if gap_us > config.max_late_tolerance_us {
            if let Some(dropped) = consumer.try_pop() {
                shared.stats.late_frame_drops.fetch_add(1, Ordering::Relaxed);
                shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                shared.stats.late_frames.fetch_add(1, Ordering::Relaxed);
                debug!(
                    gap_ms = gap_us / 1000,
                    pts_us = dropped.pts_us,
                    buffered = consumer.len(),
                    "dropped late frame"
                );
            }
            continue;
        }

        // On time (or tolerably late): emit.
        let Some(frame) = consumer.try_pop() else {
            continue;
        };
        if frame.pts_us <= last_output_pts_us {
            // A synthesized frame already covered this timestamp; keep the
            // downstream PTS sequence strictly increasing.
            shared.stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        if gap_us > 0 {
            shared.stats.late_frames.fetch_add(1, Ordering::Relaxed);
        }

        if encoder_active {
            encode_into_queue(&shared, &mut pipeline, &frame);
        }
        last_output_pts_us = frame.pts_us;
        synth_pts_us = frame.pts_us + frame_period_us;
        last_emitted = Some(frame);
        shared.stats.frames_sent.fetch_add(1, Ordering::Relaxed);

        sleep_checked(&shared, Duration::from_micros(config.min_sleep_us));
    }

    // Shutdown: drain pending output (bounded), then pad the stream to a
    // 188-byte boundary before the transport goes away.
    for _ in 0..MAX_FLUSH_ITERATIONS {
        if drain_queue(&shared) == 0 {
            break;
        }
        std::thread::sleep(FLUSH_SLEEP);
    }
    if shared.transport.is_connected() {
        if let Err(error) = shared.transport.write_all(&null_packet()) {
            debug!(%error, "failed to write closing null packet");
        }
    }
    consumer.clear();
    shared.running.store(false, Ordering::Release);
    info!("pacing sink stopped");
}

fn encode_into_queue(shared: &Arc<SinkShared>, pipeline: &mut EncoderPipeline, frame: &Frame) {
    let pts_90k = frame.pts_us * 90_000 / 1_000_000;
    let result = pipeline.encode_frame(frame, pts_90k, &mut |bytes: &[u8]| {
        enqueue(shared, bytes.to_vec());
        Ok(())
    });
    if result.is_err() {
        shared.stats.encoding_errors.fetch_add(1, Ordering::Relaxed);
    }
}

fn enqueue(shared: &Arc<SinkShared>, bytes: Vec<u8>) {
    let mut queue = shared.queue.lock().expect("sink queue mutex poisoned");
    if queue.len() >= shared.config.max_output_queue {
        queue.pop_front();
        let dropped = shared.stats.packets_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % OVERFLOW_WARN_EVERY == 0 {
            warn!(total_dropped = dropped, "output queue overflow, dropping oldest");
        }
    }
    queue.push_back(PacketBatch { bytes });
}

/// Sends queued batches to the transport; returns how many were written.
fn drain_queue(shared: &Arc<SinkShared>) -> usize {
    if !shared.transport.is_connected() {
        return 0;
    }
    let mut sent = 0;
    loop {
        let batch = {
            let mut queue = shared.queue.lock().expect("sink queue mutex poisoned");
            let Some(batch) = queue.pop_front() else {
                break;
            };
            batch
        };
        match shared.transport.write_all(&batch.bytes) {
            Ok(()) => sent += 1,
            Err(TransportError::NotConnected) => break,
            Err(_) => {
                shared.stats.network_errors.fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
    sent
}

/// Underflow policy: while the ring is starved and a consumer is watching,
/// Freeze re-emits the last frame and Black emits black, both at the nominal
/// cadence; Skip emits nothing. Purely advisory to downstream smoothness.
#[allow(clippy::too_many_arguments)]
fn handle_underflow(
    shared: &Arc<SinkShared>,
    pipeline: &mut EncoderPipeline,
    encoder_active: bool,
    anchor_us: Option<i64>,
    last_emitted: &Option<Frame>,
    synth_pts_us: &mut i64,
    last_output_pts_us: &mut i64,
    now_us: i64,
    frame_period_us: i64,
) {
    if !encoder_active || shared.config.underflow_policy == UnderflowPolicy::Skip {
        return;
    }
    let Some(anchor) = anchor_us else {
        return;
    };
    let Some(reference) = last_emitted.as_ref() else {
        return;
    };
    let deadline_us = anchor + *synth_pts_us;
    if now_us < deadline_us {
        return;
    }

    let frame = match shared.config.underflow_policy {
        UnderflowPolicy::Freeze => {
            let mut frame = reference.clone();
            frame.pts_us = *synth_pts_us;
            frame.dts_us = *synth_pts_us;
            frame
        }
        UnderflowPolicy::Black => Frame::black(
            reference.width,
            reference.height,
            *synth_pts_us,
            reference.duration_s,
        ),
        UnderflowPolicy::Skip => return,
    };
    encode_into_queue(shared, pipeline, &frame);
    *last_output_pts_us = *synth_pts_us;
    *synth_pts_us += frame_period_us;
    shared.stats.corrections.fetch_add(1, Ordering::Relaxed);
}

/// Sleeps in small chunks so a stop request is observed within a couple of
/// milliseconds.
fn sleep_checked(shared: &Arc<SinkShared>, total: Duration) {
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shared.stop_requested.load(Ordering::Acquire) {
            return;
        }
        let step = remaining.min(SLEEP_CHUNK);
        std::thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Endpoint;
    use kinocast_timing::ManualClock;
    use std::net::TcpListener;

    fn test_shared(max_output_queue: usize) -> Arc<SinkShared> {
        let probe = TcpListener::bind(("127.0.0.1", 0)).expect("failed to bind probe");
        let port = probe.local_addr().expect("probe addr").port();
        drop(probe);
        let transport = TransportWriter::start(
            Endpoint::Tcp {
                bind_host: "127.0.0.1".to_string(),
                port,
            },
            990,
        )
        .expect("failed to start transport");
        let config = SinkConfig {
            target_fps: 30.0,
            early_soft_wait_us: 5_000,
            wait_fudge_us: 500,
            max_late_tolerance_us: 50_000,
            same_timebase_threshold_us: 1_000_000,
            min_sleep_us: 100,
            max_output_queue,
            output_queue_high_water: max_output_queue / 2,
            underflow_policy: UnderflowPolicy::Freeze,
            encoder: EncoderConfig {
                width: 8,
                height: 8,
                target_fps: 30.0,
                bitrate_kbps: 100,
                gop_size: 30,
            },
        };
        Arc::new(SinkShared {
            config,
            clock: Arc::new(ManualClock::new(0)),
            transport,
            stop_requested: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stats: SinkStats::default(),
            queue: Mutex::new(VecDeque::new()),
        })
    }

    #[test]
    fn queue_overflow_drops_oldest_and_counts() {
        let shared = test_shared(2);
        enqueue(&shared, vec![1u8]);
        enqueue(&shared, vec![2u8]);
        enqueue(&shared, vec![3u8]);
        let queue = shared.queue.lock().expect("sink queue mutex poisoned");
        let remaining: Vec<u8> = queue.iter().map(|batch| batch.bytes[0]).collect();
        assert_eq!(remaining, vec![2, 3]);
        assert_eq!(shared.stats.packets_dropped.load(Ordering::Relaxed), 1);
        drop(queue);
        shared.transport.stop();
    }

    #[test]
    fn drain_without_consumer_writes_nothing() {
        let shared = test_shared(8);
        enqueue(&shared, vec![1u8]);
        assert_eq!(drain_queue(&shared), 0);
        assert_eq!(
            shared
                .queue
                .lock()
                .expect("sink queue mutex poisoned")
                .len(),
            1
        );
        shared.transport.stop();
    }
}
