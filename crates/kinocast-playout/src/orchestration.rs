//! Periodic per-channel observer.
//!
//! Ticks at the channel's frame cadence, feeds ring depth into the control
//! machine, raises edge-triggered underrun/overrun events and publishes a
//! telemetry snapshot. Events fire once per crossing, never per tick.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, select, tick, Sender};
use kinocast_buffer::RingWatch;
use kinocast_telemetry::{ChannelMetrics, MetricsStore};
use kinocast_timing::MasterClock;
use tracing::{debug, info};

use crate::control::{BackpressureEvent, ChannelControl};

struct TickShared {
    underrun_active: AtomicBool,
    overrun_active: AtomicBool,
    underrun_events: AtomicU64,
    overrun_events: AtomicU64,
    cleared_events: AtomicU64,
    ticks: AtomicU64,
}

pub struct OrchestrationLoop {
    shared: Arc<TickShared>,
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl OrchestrationLoop {
    pub fn start(
        channel_id: i32,
        target_fps: f64,
        watch: RingWatch,
        control: Arc<Mutex<ChannelControl>>,
        metrics: Arc<MetricsStore>,
        clock: Arc<dyn MasterClock>,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(TickShared {
            underrun_active: AtomicBool::new(false),
            overrun_active: AtomicBool::new(false),
            underrun_events: AtomicU64::new(0),
            overrun_events: AtomicU64::new(0),
            cleared_events: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
        });
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let period = Duration::from_secs_f64(1.0 / target_fps.max(1.0));

        let worker_shared = Arc::clone(&shared);
        let join = std::thread::Builder::new()
            .name(format!("kinocast-tick-{channel_id}"))
            .spawn(move || {
                info!(channel_id, period_ms = period.as_millis() as u64, "orchestration started");
                let ticker = tick(period);
                loop {
                    select! {
                        recv(ticker) -> _ => {
                            run_tick(channel_id, &worker_shared, &watch, &control, &metrics, &clock);
                        }
                        recv(stop_rx) -> _ => break,
                    }
                }
                info!(channel_id, "orchestration stopped");
            })?;

        Ok(Self {
            shared,
            stop_tx,
            join: Some(join),
        })
    }

    pub fn underrun_events(&self) -> u64 {
        self.shared.underrun_events.load(Ordering::Relaxed)
    }

    pub fn overrun_events(&self) -> u64 {
        self.shared.overrun_events.load(Ordering::Relaxed)
    }

    pub fn cleared_events(&self) -> u64 {
        self.shared.cleared_events.load(Ordering::Relaxed)
    }

    pub fn ticks(&self) -> u64 {
        self.shared.ticks.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        let _ = self.stop_tx.try_send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for OrchestrationLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_tick(
    channel_id: i32,
    shared: &Arc<TickShared>,
    watch: &RingWatch,
    control: &Arc<Mutex<ChannelControl>>,
    metrics: &Arc<MetricsStore>,
    clock: &Arc<dyn MasterClock>,
) {
    shared.ticks.fetch_add(1, Ordering::Relaxed);
    let depth = watch.len();
    let capacity = watch.capacity();
    let now_us = clock.now_us();

    let mut control = control.lock().expect("channel control mutex poisoned");
    control.on_buffer_depth(depth, capacity, now_us);

    if depth == 0 {
        if !shared.underrun_active.swap(true, Ordering::AcqRel) {
            shared.underrun_events.fetch_add(1, Ordering::Relaxed);
            debug!(channel_id, "buffer underrun");
            control.on_backpressure(BackpressureEvent::Underrun, now_us);
        }
    } else if shared.underrun_active.swap(false, Ordering::AcqRel) {
        shared.cleared_events.fetch_add(1, Ordering::Relaxed);
        debug!(channel_id, depth, "backpressure cleared");
        control.on_backpressure_cleared(now_us);
    }

    if capacity > 0 && depth + 1 >= capacity {
        if !shared.overrun_active.swap(true, Ordering::AcqRel) {
            shared.overrun_events.fetch_add(1, Ordering::Relaxed);
            debug!(channel_id, depth, "buffer overrun");
            control.on_backpressure(BackpressureEvent::Overrun, now_us);
        }
    } else if shared.overrun_active.swap(false, Ordering::AcqRel) {
        shared.cleared_events.fetch_add(1, Ordering::Relaxed);
        control.on_backpressure_cleared(now_us);
    }

    let snapshot = ChannelMetrics {
        state: control.telemetry_state(),
        buffer_depth_frames: depth,
        frame_gap_seconds: clock.rate_ppm() as f64 / 1e6,
        decode_failure_count: control
            .live_slot()
            .map(|slot| slot.buffer_full_drops())
            .unwrap_or(0),
        corrections_total: control.underrun_events + control.overrun_events,
    };
    drop(control);
    metrics.submit_channel_metrics(channel_id, snapshot);
}
