//! Channel control: the preview/live slot pair and the phase machine that
//! gates switchover on shadow-decode readiness.
//!
//! Every externally driven transition carries a command id plus request and
//! effective station times for provenance. Slot-removing operations hand the
//! outgoing slot back to the caller so the bounded teardown wait never runs
//! under the control lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use kinocast_buffer::RingProducer;
use kinocast_decode::MediaDecoder;
use kinocast_telemetry::ChannelState;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::slot::{ProducerSlot, SlotEventCallback, NO_PTS};

/// Bounded provenance log.
const MAX_TRANSITIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPhase {
    Idle,
    Buffering,
    Ready,
    Playing,
    Paused,
    Stopping,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureEvent {
    Underrun,
    Overrun,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub command_id: String,
    pub request_station_us: i64,
    pub effective_station_us: i64,
    pub from: ChannelPhase,
    pub to: ChannelPhase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub live_start_pts: i64,
    pub pts_contiguous: bool,
}

pub struct ChannelControl {
    channel_id: i32,
    frame_period_us: i64,
    phase: ChannelPhase,
    session_id: u64,
    wants_playback: bool,
    preview: Option<ProducerSlot>,
    live: Option<ProducerSlot>,
    ring: Arc<Mutex<RingProducer>>,
    last_ring_pts: Arc<AtomicI64>,
    low_watermark: usize,
    high_watermark: usize,
    transitions: Vec<TransitionRecord>,
    pub underrun_events: u64,
    pub overrun_events: u64,
    pub backpressure_cleared_events: u64,
}

impl ChannelControl {
    pub fn new(
        channel_id: i32,
        frame_period_us: i64,
        ring_capacity: usize,
        ring: Arc<Mutex<RingProducer>>,
        last_ring_pts: Arc<AtomicI64>,
    ) -> Self {
        // Hysteretic watermarks; crossing low demotes, crossing high
        // promotes, and the band between them is quiet.
        let low_watermark = (ring_capacity / 5).max(1);
        let high_watermark = (ring_capacity / 2).max(low_watermark + 1);
        Self {
            channel_id,
            frame_period_us,
            phase: ChannelPhase::Idle,
            session_id: 0,
            wants_playback: false,
            preview: None,
            live: None,
            ring,
            last_ring_pts,
            low_watermark,
            high_watermark,
            transitions: Vec::new(),
            underrun_events: 0,
            overrun_events: 0,
            backpressure_cleared_events: 0,
        }
    }

    pub fn phase(&self) -> ChannelPhase {
        self.phase
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    pub fn preview_slot(&self) -> Option<&ProducerSlot> {
        self.preview.as_ref()
    }

    /// Removes the preview slot, e.g. after a readiness timeout; the caller
    /// owns its teardown.
    pub fn take_preview(&mut self) -> Option<ProducerSlot> {
        self.preview.take()
    }

    pub fn live_slot(&self) -> Option<&ProducerSlot> {
        self.live.as_ref()
    }

    /// The PTS the next live stream must open with: last ring PTS plus one
    /// frame period, or zero at session start.
    pub fn expected_next_pts(&self) -> i64 {
        let last = self.last_ring_pts.load(Ordering::Acquire);
        if last == NO_PTS {
            0
        } else {
            last + self.frame_period_us
        }
    }

    pub fn begin_session(
        &mut self,
        command_id: &str,
        request_us: i64,
        effective_us: i64,
    ) -> Result<(), EngineError> {
        if self.phase != ChannelPhase::Idle {
            return Err(EngineError::precondition(format!(
                "cannot begin session in phase {:?}",
                self.phase
            )));
        }
        self.session_id += 1;
        self.transition(command_id, request_us, effective_us, ChannelPhase::Buffering);
        Ok(())
    }

    /// Installs a shadow-decoding preview slot. An already loaded preview is
    /// replaced; the outgoing slot is returned for teardown outside the
    /// control lock.
    pub fn load_preview(
        &mut self,
        asset_uri: String,
        asset_id: String,
        decoder: Box<dyn MediaDecoder>,
        on_event: SlotEventCallback,
    ) -> Result<Option<ProducerSlot>, EngineError> {
        if self.phase == ChannelPhase::Idle || self.phase == ChannelPhase::Stopping {
            return Err(EngineError::precondition(format!(
                "cannot load preview in phase {:?}",
                self.phase
            )));
        }
        let slot = ProducerSlot::start(
            self.channel_id,
            asset_uri,
            asset_id,
            true,
            decoder,
            Arc::clone(&self.ring),
            Arc::clone(&self.last_ring_pts),
            on_event,
        )
        .map_err(|error| EngineError::Internal(error.to_string()))?;
        let replaced = self.preview.replace(slot);
        if replaced.is_some() {
            debug!(channel_id = self.channel_id, "previous preview slot replaced");
        }
        Ok(replaced)
    }

    /// Atomic switchover. Preconditions: a preview slot exists and its
    /// shadow decode is ready. The preview is rebased so its first published
    /// frame lands one frame period after the last live PTS, the outgoing
    /// live slot stops publishing immediately and is handed back for
    /// teardown. The pacing sink never observes a reset.
    pub fn activate_preview_as_live(
        &mut self,
    ) -> Result<(SwitchOutcome, Option<ProducerSlot>), EngineError> {
        let Some(preview) = self.preview.as_ref() else {
            return Err(EngineError::precondition("no preview slot loaded"));
        };
        if !preview.is_shadow_ready() {
            return Err(EngineError::precondition("preview slot is not shadow-ready"));
        }

        let first_pts = self.expected_next_pts();
        let outgoing = self.live.take();
        if let Some(old) = outgoing.as_ref() {
            old.retire();
        }

        let preview = self.preview.take().expect("preview slot checked above");
        preview.promote_to_live(first_pts)?;
        info!(
            channel_id = self.channel_id,
            live_start_pts = first_pts,
            asset_id = %preview.asset_id,
            "switched to live"
        );
        self.live = Some(preview);
        self.wants_playback = true;

        Ok((
            SwitchOutcome {
                live_start_pts: first_pts,
                pts_contiguous: true,
            },
            outgoing,
        ))
    }

    /// Enters Stopping and relinquishes both slots; the caller tears them
    /// down with its timeout budget and then calls
    /// [`finish_stop`](Self::finish_stop).
    pub fn begin_stop(
        &mut self,
        command_id: &str,
        request_us: i64,
        effective_us: i64,
    ) -> Vec<ProducerSlot> {
        self.transition(command_id, request_us, effective_us, ChannelPhase::Stopping);
        self.wants_playback = false;
        let mut slots = Vec::new();
        if let Some(slot) = self.preview.take() {
            slots.push(slot);
        }
        if let Some(slot) = self.live.take() {
            slot.retire();
            slots.push(slot);
        }
        slots
    }

    pub fn finish_stop(&mut self, command_id: &str, request_us: i64, effective_us: i64) {
        self.last_ring_pts.store(NO_PTS, Ordering::Release);
        self.transition(command_id, request_us, effective_us, ChannelPhase::Idle);
    }

    /// Buffer-depth feed from the orchestration tick. Hysteretic: promotes
    /// out of Buffering only above the high watermark and demotes only at or
    /// below the low one.
    pub fn on_buffer_depth(&mut self, depth: usize, _capacity: usize, now_us: i64) {
        match self.phase {
            ChannelPhase::Buffering => {
                if depth >= self.high_watermark {
                    let next = if self.wants_playback {
                        ChannelPhase::Playing
                    } else {
                        ChannelPhase::Ready
                    };
                    self.transition("depth", now_us, now_us, next);
                }
            }
            ChannelPhase::Ready | ChannelPhase::Playing => {
                if depth <= self.low_watermark {
                    self.transition("depth", now_us, now_us, ChannelPhase::Buffering);
                }
            }
            _ => {}
        }
    }

    /// Advisory: annotates telemetry counters, never changes phase.
    pub fn on_backpressure(&mut self, event: BackpressureEvent, _now_us: i64) {
        match event {
            BackpressureEvent::Underrun => self.underrun_events += 1,
            BackpressureEvent::Overrun => self.overrun_events += 1,
        }
    }

    pub fn on_backpressure_cleared(&mut self, _now_us: i64) {
        self.backpressure_cleared_events += 1;
    }

    /// A fatal decoder error while running; only stop recovers the channel.
    pub fn on_decoder_fatal(&mut self, now_us: i64) {
        if matches!(self.phase, ChannelPhase::Idle | ChannelPhase::Stopping) {
            return;
        }
        self.transition("decoder-fatal", now_us, now_us, ChannelPhase::Error);
    }

    /// Canonical user-visible status for telemetry.
    pub fn telemetry_state(&self) -> ChannelState {
        match self.phase {
            ChannelPhase::Idle => ChannelState::Stopped,
            ChannelPhase::Buffering | ChannelPhase::Stopping => ChannelState::Buffering,
            ChannelPhase::Ready | ChannelPhase::Playing | ChannelPhase::Paused => {
                ChannelState::Ready
            }
            ChannelPhase::Error => ChannelState::Error,
        }
    }

    fn transition(
        &mut self,
        command_id: &str,
        request_us: i64,
        effective_us: i64,
        to: ChannelPhase,
    ) {
        if self.phase == to {
            return;
        }
        debug!(
            channel_id = self.channel_id,
            from = ?self.phase,
            to = ?to,
            command_id,
            "channel phase"
        );
        if self.transitions.len() >= MAX_TRANSITIONS {
            self.transitions.remove(0);
        }
        self.transitions.push(TransitionRecord {
            command_id: command_id.to_string(),
            request_station_us: request_us,
            effective_station_us: effective_us,
            from: self.phase,
            to,
        });
        self.phase = to;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotEvent;
    use kinocast_buffer::frame_ring;
    use kinocast_decode::PatternDecoder;
    use std::time::{Duration, Instant};

    const PERIOD: i64 = 33_333;

    fn control_fixture() -> (ChannelControl, kinocast_buffer::RingConsumer) {
        let (producer, consumer) = frame_ring(60);
        let ring = Arc::new(Mutex::new(producer));
        let last_pts = Arc::new(AtomicI64::new(NO_PTS));
        (
            ChannelControl::new(5, PERIOD, 60, ring, last_pts),
            consumer,
        )
    }

    fn wait_ready(control: &ChannelControl) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !control
            .preview_slot()
            .map(|slot| slot.is_shadow_ready())
            .unwrap_or(false)
        {
            assert!(Instant::now() < deadline, "shadow decode never became ready");
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn quiet_callback() -> SlotEventCallback {
        Arc::new(|_event: SlotEvent| {})
    }

    fn load(control: &mut ChannelControl, asset: &str) {
        control
            .load_preview(
                asset.to_string(),
                asset.to_string(),
                Box::new(PatternDecoder::new(asset, 8, 8, 240.0)),
                quiet_callback(),
            )
            .expect("failed to load preview");
    }

    #[test]
    fn switch_requires_ready_preview() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        let error = control.activate_preview_as_live().unwrap_err();
        assert!(matches!(error, EngineError::PreconditionViolation { .. }));
        assert_eq!(control.phase(), ChannelPhase::Buffering);
    }

    #[test]
    fn first_switch_starts_at_pts_zero() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        load(&mut control, "asset-a");
        wait_ready(&control);
        let (outcome, outgoing) = control
            .activate_preview_as_live()
            .expect("switch failed");
        assert_eq!(outcome.live_start_pts, 0);
        assert!(outcome.pts_contiguous);
        assert!(outgoing.is_none());

        let slots = control.begin_stop("stop-5", 0, 0);
        for mut slot in slots {
            slot.request_teardown(Duration::from_secs(1));
        }
        control.finish_stop("stop-5", 0, 0);
        assert_eq!(control.phase(), ChannelPhase::Idle);
    }

    #[test]
    fn midstream_switch_is_pts_contiguous() {
        let (mut control, mut consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        load(&mut control, "asset-a");
        wait_ready(&control);
        control.activate_preview_as_live().expect("first switch failed");

        // Let asset A publish some frames, remembering the boundary.
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut last_a_pts = None;
        while consumer.len() < 8 {
            assert!(Instant::now() < deadline, "asset A never filled the ring");
            std::thread::sleep(Duration::from_millis(2));
        }
        load(&mut control, "asset-b");
        wait_ready(&control);
        let (outcome, outgoing) = control
            .activate_preview_as_live()
            .expect("second switch failed");
        let mut old = outgoing.expect("no outgoing live slot");

        // Everything already in the ring is from A; drain up to the switch
        // boundary and verify contiguity.
        let mut seen = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            if let Some(frame) = consumer.try_pop() {
                let pts = frame.pts_us;
                if pts == outcome.live_start_pts {
                    break;
                }
                last_a_pts = Some(pts);
                seen.push(pts);
            } else {
                assert!(Instant::now() < deadline, "switch frame never arrived");
                std::thread::sleep(Duration::from_millis(2));
            }
        }
        let last_a = last_a_pts.expect("no frames from asset A");
        assert_eq!(outcome.live_start_pts, last_a + PERIOD);
        assert!(seen.windows(2).all(|pair| pair[1] > pair[0]));

        old.request_teardown(Duration::from_secs(1));
        let slots = control.begin_stop("stop-5", 0, 0);
        for mut slot in slots {
            slot.request_teardown(Duration::from_secs(1));
        }
    }

    #[test]
    fn double_switch_preserves_contiguity() {
        let (mut control, mut consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        for asset in ["asset-a", "asset-b", "asset-c"] {
            load(&mut control, asset);
            wait_ready(&control);
            let (_outcome, outgoing) = control
                .activate_preview_as_live()
                .expect("switch failed");
            if let Some(mut old) = outgoing {
                old.request_teardown(Duration::from_secs(1));
            }
            // Give each asset a moment to publish.
            std::thread::sleep(Duration::from_millis(30));
        }

        let mut pts = Vec::new();
        while let Some(frame) = consumer.try_pop() {
            pts.push(frame.pts_us);
        }
        assert!(pts.len() > 2);
        assert!(
            pts.windows(2).all(|pair| pair[1] > pair[0]),
            "ring PTS regressed across switches: {pts:?}"
        );

        let slots = control.begin_stop("stop-5", 0, 0);
        for mut slot in slots {
            slot.request_teardown(Duration::from_secs(1));
        }
    }

    #[test]
    fn buffer_depth_transitions_are_hysteretic() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        assert_eq!(control.phase(), ChannelPhase::Buffering);

        // Below high watermark: stays Buffering.
        control.on_buffer_depth(5, 60, 1);
        assert_eq!(control.phase(), ChannelPhase::Buffering);
        control.on_buffer_depth(30, 60, 2);
        assert_eq!(control.phase(), ChannelPhase::Ready);
        // Mid-band: no flapping.
        control.on_buffer_depth(20, 60, 3);
        assert_eq!(control.phase(), ChannelPhase::Ready);
        control.on_buffer_depth(12, 60, 4);
        assert_eq!(control.phase(), ChannelPhase::Buffering);
    }

    #[test]
    fn transitions_carry_provenance() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 100, 150)
            .expect("failed to begin session");
        let record = control.transitions().last().expect("no transition recorded");
        assert_eq!(record.command_id, "begin-5");
        assert_eq!(record.request_station_us, 100);
        assert_eq!(record.effective_station_us, 150);
        assert_eq!(record.from, ChannelPhase::Idle);
        assert_eq!(record.to, ChannelPhase::Buffering);
    }

    #[test]
    fn decoder_fatal_enters_error_until_stop() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        control.on_decoder_fatal(10);
        assert_eq!(control.phase(), ChannelPhase::Error);
        assert_eq!(control.telemetry_state(), ChannelState::Error);
        // Depth feeds must not resurrect the channel.
        control.on_buffer_depth(40, 60, 11);
        assert_eq!(control.phase(), ChannelPhase::Error);
        let _ = control.begin_stop("stop-5", 12, 12);
        control.finish_stop("stop-5", 12, 12);
        assert_eq!(control.phase(), ChannelPhase::Idle);
    }

    #[test]
    fn backpressure_is_advisory() {
        let (mut control, _consumer) = control_fixture();
        control
            .begin_session("begin-5", 0, 0)
            .expect("failed to begin session");
        let phase = control.phase();
        control.on_backpressure(BackpressureEvent::Underrun, 5);
        control.on_backpressure(BackpressureEvent::Overrun, 6);
        control.on_backpressure_cleared(7);
        assert_eq!(control.phase(), phase);
        assert_eq!(control.underrun_events, 1);
        assert_eq!(control.overrun_events, 1);
        assert_eq!(control.backpressure_cleared_events, 1);
    }
}
