//! Producer slots: a decoder wrapped in a background worker.
//!
//! A slot starts in *shadow* mode (decoding to prime the codec without
//! touching the live ring) and is promoted to *live* exactly once, at which
//! point its PTS stream is rebased so the first published frame lands on the
//! timestamp the channel expects. Teardown is cooperative with a bounded
//! wait; `force_stop` is the escape hatch and is recorded as such.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kinocast_buffer::{Frame, RingProducer};
use kinocast_decode::{DecodeOutcome, FrameSink, MediaDecoder};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Marks "no frame published yet" in the shared last-PTS cell.
pub const NO_PTS: i64 = i64::MIN;

const BACKOFF_FULL: Duration = Duration::from_millis(2);
const BACKOFF_TRANSIENT: Duration = Duration::from_millis(1);
const BACKOFF_EOS: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SlotState {
    Empty = 0,
    Loading = 1,
    Ready = 2,
    Running = 3,
    TearingDown = 4,
    Stopped = 5,
    Failed = 6,
}

impl SlotState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SlotState::Loading,
            2 => SlotState::Ready,
            3 => SlotState::Running,
            4 => SlotState::TearingDown,
            5 => SlotState::Stopped,
            6 => SlotState::Failed,
            _ => SlotState::Empty,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SlotEvent {
    /// Shadow decode has primed itself; switchover may proceed.
    ShadowReady,
    /// The asset is exhausted.
    EndOfStream,
    /// The decoder became non-functional.
    Fatal { message: String },
}

pub type SlotEventCallback = Arc<dyn Fn(SlotEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownOutcome {
    pub forced: bool,
}

#[derive(Debug)]
struct SlotShared {
    state: AtomicU8,
    running: AtomicBool,
    stop_requested: AtomicBool,
    force_stop: AtomicBool,
    publish_live: AtomicBool,
    promoted: AtomicBool,
    /// PTS the first live-published frame must carry; valid once promoted.
    first_live_pts: AtomicI64,
    shadow_ready: AtomicBool,
    frames_published: AtomicU64,
    buffer_full_drops: AtomicU64,
    done: Mutex<bool>,
    done_signal: Condvar,
}

impl SlotShared {
    fn set_state(&self, next: SlotState) {
        let previous = self.state.swap(next as u8, Ordering::AcqRel);
        if previous != next as u8 {
            debug!(from = ?SlotState::from_u8(previous), to = ?next, "slot state");
        }
    }
}

#[derive(Debug)]
pub struct ProducerSlot {
    shared: Arc<SlotShared>,
    join: Option<JoinHandle<()>>,
    pub asset_uri: String,
    pub asset_id: String,
}

impl ProducerSlot {
    /// Spawns the decode worker. With `shadow` set, decoded frames go to a
    /// private discard sink until promotion; the decoder still primes
    /// itself, and readiness fires `on_event(ShadowReady)` once.
    pub fn start(
        channel_id: i32,
        asset_uri: String,
        asset_id: String,
        shadow: bool,
        decoder: Box<dyn MediaDecoder>,
        ring: Arc<Mutex<RingProducer>>,
        last_ring_pts: Arc<AtomicI64>,
        on_event: SlotEventCallback,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(SlotShared {
            state: AtomicU8::new(SlotState::Loading as u8),
            running: AtomicBool::new(true),
            stop_requested: AtomicBool::new(false),
            force_stop: AtomicBool::new(false),
            publish_live: AtomicBool::new(!shadow),
            promoted: AtomicBool::new(!shadow),
            first_live_pts: AtomicI64::new(NO_PTS),
            shadow_ready: AtomicBool::new(false),
            frames_published: AtomicU64::new(0),
            buffer_full_drops: AtomicU64::new(0),
            done: Mutex::new(false),
            done_signal: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name(format!("kinocast-decode-{channel_id}"))
            .spawn(move || {
                worker_loop(worker_shared, decoder, ring, last_ring_pts, on_event);
            })?;

        Ok(Self {
            shared,
            join: Some(join),
            asset_uri,
            asset_id,
        })
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// True once shadow mode has produced its first decoded frame. This is
    /// the gating signal for switchover.
    pub fn is_shadow_ready(&self) -> bool {
        self.shared.shadow_ready.load(Ordering::Acquire)
    }

    pub fn frames_published(&self) -> u64 {
        self.shared.frames_published.load(Ordering::Relaxed)
    }

    pub fn buffer_full_drops(&self) -> u64 {
        self.shared.buffer_full_drops.load(Ordering::Relaxed)
    }

    /// Switches the sink target from shadow to the live ring without
    /// reopening the decoder. Callable exactly once; the first published
    /// frame will carry `first_pts_us`.
    pub fn promote_to_live(&self, first_pts_us: i64) -> Result<(), EngineError> {
        if self.shared.promoted.swap(true, Ordering::AcqRel) {
            return Err(EngineError::precondition("slot already promoted to live"));
        }
        self.shared
            .first_live_pts
            .store(first_pts_us, Ordering::Release);
        self.shared.publish_live.store(true, Ordering::Release);
        debug!(first_pts_us, "slot promoted to live");
        Ok(())
    }

    /// Stops publishing immediately; the worker keeps running until torn
    /// down. Used on the outgoing live slot during switchover.
    pub fn retire(&self) {
        self.shared.publish_live.store(false, Ordering::Release);
    }

    /// Cooperative stop. The worker must observe the request and exit within
    /// `timeout`; past it the slot is force-stopped and the outcome is
    /// annotated as forced.
    pub fn request_teardown(&mut self, timeout: Duration) -> TeardownOutcome {
        let Some(join) = self.join.take() else {
            return TeardownOutcome { forced: false };
        };
        self.shared.set_state(SlotState::TearingDown);
        self.shared.stop_requested.store(true, Ordering::Release);

        let started = Instant::now();
        let mut forced = false;
        if !self.wait_done(timeout) {
            warn!(
                asset_id = %self.asset_id,
                waited_ms = started.elapsed().as_millis() as u64,
                "teardown exceeded timeout, forcing producer stop"
            );
            self.shared.force_stop.store(true, Ordering::Release);
            forced = true;
        }
        let _ = join.join();
        if self.state() != SlotState::Failed {
            self.shared.set_state(SlotState::Stopped);
        }
        info!(
            asset_id = %self.asset_id,
            forced,
            duration_ms = started.elapsed().as_millis() as u64,
            "slot torn down"
        );
        TeardownOutcome { forced }
    }

    /// Preempts the worker loop; still joins the background thread before
    /// returning.
    pub fn force_stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.force_stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
        if self.state() != SlotState::Failed {
            self.shared.set_state(SlotState::Stopped);
        }
    }

    fn wait_done(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.shared.done.lock().expect("slot done mutex poisoned");
        while !*done {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, _) = self
                .shared
                .done_signal
                .wait_timeout(done, deadline - now)
                .expect("slot done mutex poisoned");
            done = guard;
        }
        true
    }
}

impl Drop for ProducerSlot {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.force_stop();
        }
    }
}

/// Shadow-side sink: keeps the priming frame instead of dropping it, so the
/// stream can resume from it on promotion.
#[derive(Default)]
struct PrimeSink {
    primed: Option<Frame>,
    frames: u64,
}

impl FrameSink for PrimeSink {
    fn offer(&mut self, frame: Frame) -> Result<(), Frame> {
        self.primed.get_or_insert(frame);
        self.frames += 1;
        Ok(())
    }
}

/// Live-side frame sink: rebases PTS once on the first published frame and
/// pushes into the shared ring.
struct LivePublisher {
    ring: Arc<Mutex<RingProducer>>,
    last_ring_pts: Arc<AtomicI64>,
    shared: Arc<SlotShared>,
    rebase_us: Option<i64>,
}

impl FrameSink for LivePublisher {
    fn offer(&mut self, mut frame: Frame) -> Result<(), Frame> {
        let rebase = match self.rebase_us {
            Some(rebase) => rebase,
            None => {
                let target = self.shared.first_live_pts.load(Ordering::Acquire);
                let rebase = if target == NO_PTS {
                    0
                } else {
                    target - frame.pts_us
                };
                self.rebase_us = Some(rebase);
                rebase
            }
        };
        frame.pts_us += rebase;
        frame.dts_us += rebase;
        let pts_us = frame.pts_us;
        let mut ring = self.ring.lock().expect("ring producer mutex poisoned");
        ring.try_push(frame)?;
        self.last_ring_pts.store(pts_us, Ordering::Release);
        self.shared.frames_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn worker_loop(
    shared: Arc<SlotShared>,
    mut decoder: Box<dyn MediaDecoder>,
    ring: Arc<Mutex<RingProducer>>,
    last_ring_pts: Arc<AtomicI64>,
    on_event: SlotEventCallback,
) {
    match decoder.open() {
        Ok(info) => {
            debug!(
                width = info.width,
                height = info.height,
                fps = info.fps,
                "decoder opened"
            );
            shared.set_state(SlotState::Ready);
        }
        Err(error) => {
            warn!(%error, "decoder open failed");
            shared.set_state(SlotState::Failed);
            on_event(SlotEvent::Fatal {
                message: error.to_string(),
            });
            finish(&shared);
            return;
        }
    }

    shared.set_state(SlotState::Running);
    let mut live = LivePublisher {
        ring: Arc::clone(&ring),
        last_ring_pts,
        shared: Arc::clone(&shared),
        rebase_us: None,
    };
    let mut shadow = PrimeSink::default();
    let mut eos_signaled = false;

    loop {
        if shared.force_stop.load(Ordering::Acquire)
            || shared.stop_requested.load(Ordering::Acquire)
        {
            break;
        }

        let outcome = if shared.publish_live.load(Ordering::Acquire) {
            // The priming frame goes out first, so nothing decoded during
            // shadow mode is lost across the switch.
            if let Some(frame) = shadow.primed.take() {
                if let Err(frame) = live.offer(frame) {
                    shadow.primed = Some(frame);
                    std::thread::sleep(BACKOFF_FULL);
                }
                continue;
            }
            // Back off instead of decoding into a full ring; the safety
            // valve drop in the decoder stays rare.
            if ring
                .lock()
                .expect("ring producer mutex poisoned")
                .is_full()
            {
                std::thread::sleep(BACKOFF_FULL);
                continue;
            }
            decoder.decode_next(&mut live)
        } else if shared.shadow_ready.load(Ordering::Acquire) {
            // Primed: hold the stream position until promotion or teardown.
            std::thread::sleep(BACKOFF_FULL);
            continue;
        } else {
            let outcome = decoder.decode_next(&mut shadow);
            if shadow.frames > 0 {
                shared.shadow_ready.store(true, Ordering::Release);
                debug!(primed = shadow.frames, "shadow decode ready");
                on_event(SlotEvent::ShadowReady);
            }
            outcome
        };

        match outcome {
            DecodeOutcome::Pushed => {}
            DecodeOutcome::BufferFull => {
                shared.buffer_full_drops.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(BACKOFF_FULL);
            }
            DecodeOutcome::EndOfStream => {
                if !eos_signaled {
                    eos_signaled = true;
                    debug!("asset exhausted");
                    on_event(SlotEvent::EndOfStream);
                }
                std::thread::sleep(BACKOFF_EOS);
            }
            DecodeOutcome::TransientError => {
                std::thread::sleep(BACKOFF_TRANSIENT);
            }
            DecodeOutcome::FatalError => {
                warn!("decoder fatal error");
                shared.set_state(SlotState::Failed);
                on_event(SlotEvent::Fatal {
                    message: "decoder fatal error".to_string(),
                });
                break;
            }
        }
    }

    decoder.close();
    finish(&shared);
}

fn finish(shared: &Arc<SlotShared>) {
    shared.running.store(false, Ordering::Release);
    let mut done = shared.done.lock().expect("slot done mutex poisoned");
    *done = true;
    shared.done_signal.notify_all();
}
