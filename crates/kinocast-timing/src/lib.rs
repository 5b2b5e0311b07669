//! Station time for the playout engine.
//!
//! A [`MasterClock`] provides a strictly monotonic microsecond timeline and
//! the PTS-to-station mapping every pacing deadline is derived from. Two
//! implementations share the trait: [`SystemClock`] for production and
//! [`ManualClock`], a deterministically steppable clock for tests. The clock
//! is the only polymorphic seam on the per-frame path.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::debug;

/// Rate offsets are clamped to this many parts-per-million in either
/// direction.
pub const MAX_RATE_PPM: i64 = 10_000;

/// Longest single sleep inside a deadline wait, so cancellation is observed
/// within a few milliseconds.
const WAIT_CHUNK: Duration = Duration::from_millis(2);

pub trait MasterClock: Send + Sync {
    /// Current station time in microseconds. Never decreases.
    fn now_us(&self) -> i64;

    /// Station-time epoch the PTS mapping is anchored to.
    fn epoch_us(&self) -> i64;

    /// Rate offset in parts-per-million.
    fn rate_ppm(&self) -> i64;

    /// Updates the rate offset, clamped to `±MAX_RATE_PPM`. Only future
    /// mappings are affected.
    fn set_rate_ppm(&self, ppm: i64);

    /// Blocks until station time reaches `target_us` or `cancel` is raised.
    /// The cancel flag is observed at least every few milliseconds.
    fn wait_until_us(&self, target_us: i64, cancel: &AtomicBool);

    /// Maps a presentation timestamp onto station time:
    /// `epoch + pts * (1 + rate_ppm / 1e6)`. Deterministic and strictly
    /// increasing in `pts_us` for a fixed rate.
    fn pts_to_station_us(&self, pts_us: i64) -> i64 {
        apply_rate(self.epoch_us(), pts_us, self.rate_ppm())
    }

    /// Inverse of [`pts_to_station_us`](Self::pts_to_station_us), within 1 µs
    /// of rounding.
    fn station_to_pts_us(&self, station_us: i64) -> i64 {
        invert_rate(self.epoch_us(), station_us, self.rate_ppm())
    }
}

fn clamp_ppm(ppm: i64) -> i64 {
    ppm.clamp(-MAX_RATE_PPM, MAX_RATE_PPM)
}

fn apply_rate(epoch_us: i64, pts_us: i64, ppm: i64) -> i64 {
    let scaled = (pts_us as i128 * ppm as i128) / 1_000_000;
    epoch_us + pts_us + scaled as i64
}

fn invert_rate(epoch_us: i64, station_us: i64, ppm: i64) -> i64 {
    let elapsed = (station_us - epoch_us) as i128;
    (elapsed * 1_000_000 / (1_000_000 + ppm as i128)) as i64
}

/// Production clock: a monotonic `Instant` pinned to a configured epoch.
pub struct SystemClock {
    origin: Instant,
    epoch_us: i64,
    rate_ppm: AtomicI64,
    /// Latch that makes `now_us` non-decreasing even if the platform reports
    /// equal instants across threads.
    last_now_us: AtomicI64,
}

impl SystemClock {
    pub fn new(epoch_us: i64, rate_ppm: i64) -> Self {
        Self {
            origin: Instant::now(),
            epoch_us,
            rate_ppm: AtomicI64::new(clamp_ppm(rate_ppm)),
            last_now_us: AtomicI64::new(epoch_us),
        }
    }

    /// Epoch taken from the wall clock at construction time.
    pub fn with_wall_epoch(rate_ppm: i64) -> Self {
        let epoch_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        Self::new(epoch_us, rate_ppm)
    }
}

impl MasterClock for SystemClock {
    fn now_us(&self) -> i64 {
        let candidate = self.epoch_us + self.origin.elapsed().as_micros() as i64;
        let previous = self.last_now_us.fetch_max(candidate, Ordering::AcqRel);
        candidate.max(previous)
    }

    fn epoch_us(&self) -> i64 {
        self.epoch_us
    }

    fn rate_ppm(&self) -> i64 {
        self.rate_ppm.load(Ordering::Acquire)
    }

    fn set_rate_ppm(&self, ppm: i64) {
        let clamped = clamp_ppm(ppm);
        let previous = self.rate_ppm.swap(clamped, Ordering::AcqRel);
        if previous != clamped {
            debug!(from = previous, to = clamped, "clock rate updated");
        }
    }

    fn wait_until_us(&self, target_us: i64, cancel: &AtomicBool) {
        loop {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let remaining = target_us - self.now_us();
            if remaining <= 0 {
                return;
            }
            let chunk = Duration::from_micros(remaining as u64).min(WAIT_CHUNK);
            std::thread::sleep(chunk);
        }
    }
}

/// Steppable clock for deterministic tests. Time advances only through
/// [`advance_us`](ManualClock::advance_us) / [`set_us`](ManualClock::set_us);
/// waiters are woken on every step.
pub struct ManualClock {
    epoch_us: i64,
    now_us: Mutex<i64>,
    stepped: Condvar,
    rate_ppm: AtomicI64,
}

impl ManualClock {
    pub fn new(epoch_us: i64) -> Self {
        Self {
            epoch_us,
            now_us: Mutex::new(epoch_us),
            stepped: Condvar::new(),
            rate_ppm: AtomicI64::new(0),
        }
    }

    pub fn advance_us(&self, delta_us: i64) {
        let mut now = self.now_us.lock().expect("manual clock mutex poisoned");
        *now += delta_us.max(0);
        self.stepped.notify_all();
    }

    pub fn set_us(&self, value_us: i64) {
        let mut now = self.now_us.lock().expect("manual clock mutex poisoned");
        // Never step backwards; station time is monotonic by contract.
        if value_us > *now {
            *now = value_us;
        }
        self.stepped.notify_all();
    }
}

impl MasterClock for ManualClock {
    fn now_us(&self) -> i64 {
        *self.now_us.lock().expect("manual clock mutex poisoned")
    }

    fn epoch_us(&self) -> i64 {
        self.epoch_us
    }

    fn rate_ppm(&self) -> i64 {
        self.rate_ppm.load(Ordering::Acquire)
    }

    fn set_rate_ppm(&self, ppm: i64) {
        self.rate_ppm.store(clamp_ppm(ppm), Ordering::Release);
    }

    fn wait_until_us(&self, target_us: i64, cancel: &AtomicBool) {
        let mut now = self.now_us.lock().expect("manual clock mutex poisoned");
        while *now < target_us {
            if cancel.load(Ordering::Acquire) {
                return;
            }
            let (guard, _timed_out) = self
                .stepped
                .wait_timeout(now, WAIT_CHUNK)
                .expect("manual clock mutex poisoned");
            now = guard;
        }
    }
}
