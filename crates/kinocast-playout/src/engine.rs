//! The channel map and the lifecycle operations the control surface calls.
//!
//! A channel owns its ring, control machine, slots, pacing sink, transport
//! writer and orchestration tick. Teardown order is fixed: observer tick,
//! then producer slots (bounded, forced past the timeout), then the sink
//! (which drains, pads to a packet boundary and closes the transport).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::bounded;
use kinocast_buffer::frame_ring;
use kinocast_core::config::{ChannelConfig, EngineConfig};
use kinocast_core::{ChannelId, API_VERSION};
use kinocast_decode::{MediaDecoder, PatternDecoder, RawFileDecoder};
use kinocast_telemetry::{ChannelMetrics, ChannelState, MetricsStore};
use kinocast_timing::MasterClock;
use tracing::{debug, info, warn};

use crate::control::{ChannelControl, ChannelPhase, SwitchOutcome};
use crate::error::EngineError;
use crate::orchestration::OrchestrationLoop;
use crate::sink::{PacingSink, SinkConfig, SinkStatsSnapshot};
use crate::slot::{SlotEvent, SlotEventCallback, NO_PTS};
use crate::transport::{Endpoint, TransportWriter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopOutcome {
    pub forced: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewOutcome {
    pub shadow_decode_started: bool,
    pub message: String,
}

struct Channel {
    channel_id: ChannelId,
    plan_handle: String,
    config: ChannelConfig,
    control: Arc<Mutex<ChannelControl>>,
    sink: PacingSink,
    transport: Arc<TransportWriter>,
    tick: OrchestrationLoop,
}

pub struct PlayoutEngine {
    channels: Mutex<HashMap<ChannelId, Channel>>,
    clock: Arc<dyn MasterClock>,
    metrics: Arc<MetricsStore>,
    config: EngineConfig,
    channel_defaults: ChannelConfig,
}

fn command_id(prefix: &str, channel_id: ChannelId) -> String {
    format!("{prefix}-{channel_id}")
}

impl PlayoutEngine {
    pub fn new(
        clock: Arc<dyn MasterClock>,
        metrics: Arc<MetricsStore>,
        config: EngineConfig,
        channel_defaults: ChannelConfig,
    ) -> Self {
        info!(
            api_version = API_VERSION,
            rate_ppm = clock.rate_ppm(),
            "playout engine initialized"
        );
        Self {
            channels: Mutex::new(HashMap::new()),
            clock,
            metrics,
            config,
            channel_defaults,
        }
    }

    pub fn version(&self) -> &'static str {
        API_VERSION
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().expect("channels mutex poisoned").len()
    }

    pub fn channel_phase(&self, channel_id: ChannelId) -> Option<ChannelPhase> {
        let channels = self.channels.lock().expect("channels mutex poisoned");
        channels.get(&channel_id).map(|channel| {
            channel
                .control
                .lock()
                .expect("channel control mutex poisoned")
                .phase()
        })
    }

    pub fn sink_stats(&self, channel_id: ChannelId) -> Option<SinkStatsSnapshot> {
        let channels = self.channels.lock().expect("channels mutex poisoned");
        channels.get(&channel_id).map(|channel| channel.sink.stats())
    }

    pub fn is_consumer_connected(&self, channel_id: ChannelId) -> bool {
        let channels = self.channels.lock().expect("channels mutex poisoned");
        channels
            .get(&channel_id)
            .map(|channel| channel.transport.is_connected())
            .unwrap_or(false)
    }

    /// Creates the channel, primes shadow decode of the plan asset and
    /// promotes it to live. Starting an already-active channel is a success
    /// with an advisory message and no side effects.
    pub fn start_channel(
        &self,
        channel_id: ChannelId,
        plan_handle: &str,
        port: u16,
        uds_path: Option<String>,
    ) -> Result<StartOutcome, EngineError> {
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        if channels.contains_key(&channel_id) {
            debug!(channel_id, "start requested for active channel");
            return Ok(StartOutcome {
                message: format!("channel {channel_id} already active"),
            });
        }

        let config = self.channel_defaults.clone();
        let socket_path = uds_path
            .filter(|path| !path.is_empty())
            .or_else(|| config.ts_socket_path.clone())
            .or_else(|| self.config.ts_socket_path_for(channel_id));
        let endpoint = match &socket_path {
            Some(path) => Endpoint::Unix {
                path: PathBuf::from(path),
            },
            None => Endpoint::Tcp {
                bind_host: config.bind_host.clone(),
                port,
            },
        };
        info!(channel_id, plan_handle, port, ?socket_path, "starting channel");

        let (ring_producer, ring_consumer) = frame_ring(config.buffer_capacity);
        let ring = Arc::new(Mutex::new(ring_producer));
        let last_ring_pts = Arc::new(AtomicI64::new(NO_PTS));
        let watch = ring_consumer.watch();
        let control = Arc::new(Mutex::new(ChannelControl::new(
            channel_id,
            config.frame_period_us(),
            config.buffer_capacity,
            Arc::clone(&ring),
            Arc::clone(&last_ring_pts),
        )));

        let transport = TransportWriter::start(endpoint, channel_id)?;
        let sink = PacingSink::start(
            channel_id,
            SinkConfig::from_channel(&config),
            ring_consumer,
            Arc::clone(&self.clock),
            Arc::clone(&transport),
        )
        .map_err(|error| EngineError::Internal(error.to_string()))?;
        let tick = OrchestrationLoop::start(
            channel_id,
            config.target_fps,
            watch,
            Arc::clone(&control),
            Arc::clone(&self.metrics),
            Arc::clone(&self.clock),
        )
        .map_err(|error| EngineError::Internal(error.to_string()))?;

        let mut channel = Channel {
            channel_id,
            plan_handle: plan_handle.to_string(),
            config,
            control,
            sink,
            transport,
            tick,
        };

        let now = self.clock.now_us();
        {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.begin_session(&command_id("begin", channel_id), now, now)?;
        }

        if let Err(error) = self.install_live_plan(
            &mut channel,
            plan_handle,
            &command_id("start", channel_id),
        ) {
            warn!(channel_id, %error, "channel start failed, rolling back");
            self.shutdown_channel(&mut channel, "start-rollback");
            self.metrics.remove_channel(channel_id);
            return Err(error);
        }

        self.metrics.submit_channel_metrics(
            channel_id,
            ChannelMetrics {
                state: ChannelState::Buffering,
                ..ChannelMetrics::default()
            },
        );
        channels.insert(channel_id, channel);
        info!(channel_id, "channel started");
        Ok(StartOutcome {
            message: format!("channel {channel_id} started"),
        })
    }

    /// Graceful stop with a forced fallback past the teardown timeout.
    /// Unknown channels are a not-found error.
    pub fn stop_channel(&self, channel_id: ChannelId) -> Result<StopOutcome, EngineError> {
        // The map lock is held across the whole stop so a concurrent start
        // of the same channel cannot race the transport teardown.
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        let Some(mut channel) = channels.remove(&channel_id) else {
            return Err(EngineError::NotFound { channel_id });
        };

        let forced = self.shutdown_channel(&mut channel, "stop");
        self.metrics.submit_channel_metrics(
            channel_id,
            ChannelMetrics {
                state: ChannelState::Stopped,
                ..ChannelMetrics::default()
            },
        );
        self.metrics.remove_channel(channel_id);
        info!(
            channel_id,
            plan_handle = %channel.plan_handle,
            forced,
            "channel stopped"
        );
        Ok(StopOutcome {
            forced,
            message: if forced {
                format!("channel {channel_id} stopped (teardown forced after timeout)")
            } else {
                format!("channel {channel_id} stopped")
            },
        })
    }

    /// Moves the preview slot into shadow decode of `asset_path`.
    pub fn load_preview(
        &self,
        channel_id: ChannelId,
        asset_path: &str,
        asset_id: &str,
    ) -> Result<PreviewOutcome, EngineError> {
        let channels = self.channels.lock().expect("channels mutex poisoned");
        let Some(channel) = channels.get(&channel_id) else {
            return Err(EngineError::NotFound { channel_id });
        };

        let decoder = self.make_decoder(asset_path, &channel.config);
        let callback = self.slot_event_callback(channel_id, Arc::clone(&channel.control), None);
        let replaced = {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.load_preview(
                asset_path.to_string(),
                asset_id.to_string(),
                decoder,
                callback,
            )?
        };
        if let Some(mut old) = replaced {
            old.request_teardown(self.config.teardown_timeout());
        }
        info!(channel_id, asset_id, asset_path, "preview loaded");
        Ok(PreviewOutcome {
            shadow_decode_started: true,
            message: format!("preview {asset_id} loaded on channel {channel_id}"),
        })
    }

    /// Promotes the preview slot; gated on shadow readiness.
    pub fn switch_to_live(&self, channel_id: ChannelId) -> Result<SwitchOutcome, EngineError> {
        let channels = self.channels.lock().expect("channels mutex poisoned");
        let Some(channel) = channels.get(&channel_id) else {
            return Err(EngineError::NotFound { channel_id });
        };
        let (outcome, outgoing) = {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.activate_preview_as_live()?
        };
        if let Some(mut old) = outgoing {
            old.request_teardown(self.config.teardown_timeout());
        }
        Ok(outcome)
    }

    /// Replaces the running plan by restarting the producer behind the same
    /// channel: the sink, transport and any attached consumer are preserved,
    /// and the new plan opens PTS-contiguously after the old one.
    pub fn update_plan(
        &self,
        channel_id: ChannelId,
        plan_handle: &str,
    ) -> Result<StartOutcome, EngineError> {
        let mut channels = self.channels.lock().expect("channels mutex poisoned");
        let Some(channel) = channels.get_mut(&channel_id) else {
            return Err(EngineError::NotFound { channel_id });
        };

        self.install_live_plan(channel, plan_handle, &command_id("plan", channel_id))?;
        channel.plan_handle = plan_handle.to_string();
        info!(channel_id, plan_handle, "plan updated with producer restart");
        Ok(StartOutcome {
            message: format!("plan updated on channel {channel_id}"),
        })
    }

    /// Background teardown: requests a stop and logs the outcome without
    /// blocking the caller.
    pub fn request_teardown(self: &Arc<Self>, channel_id: ChannelId, reason: &str) {
        let engine = Arc::clone(self);
        let reason = reason.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("kinocast-teardown-{channel_id}"))
            .spawn(move || {
                info!(channel_id, reason = %reason, "teardown requested");
                let started = Instant::now();
                match engine.stop_channel(channel_id) {
                    Ok(outcome) => info!(
                        channel_id,
                        forced = outcome.forced,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "teardown finished"
                    ),
                    Err(error) => warn!(channel_id, %error, "teardown failed"),
                }
            });
        if let Err(error) = spawned {
            warn!(channel_id, %error, "failed to spawn teardown monitor");
        }
    }

    /// Stops every channel; used at process shutdown.
    pub fn stop_all(&self) {
        let ids: Vec<ChannelId> = {
            let channels = self.channels.lock().expect("channels mutex poisoned");
            channels.keys().copied().collect()
        };
        for channel_id in ids {
            if let Err(error) = self.stop_channel(channel_id) {
                warn!(channel_id, %error, "failed to stop channel during shutdown");
            }
        }
    }

    /// Loads `plan_handle` as a shadow preview, waits (bounded) for
    /// readiness and promotes it to live. The readiness subscription is
    /// installed before the load is triggered, and the flag is re-checked
    /// after the wait, because the event can race the subscription.
    fn install_live_plan(
        &self,
        channel: &mut Channel,
        plan_handle: &str,
        asset_id: &str,
    ) -> Result<(), EngineError> {
        let (ready_tx, ready_rx) = bounded::<()>(1);
        let decoder = self.make_decoder(plan_handle, &channel.config);
        let callback = self.slot_event_callback(
            channel.channel_id,
            Arc::clone(&channel.control),
            Some(ready_tx),
        );

        let replaced = {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.load_preview(
                plan_handle.to_string(),
                asset_id.to_string(),
                decoder,
                callback,
            )?
        };
        if let Some(mut old) = replaced {
            old.request_teardown(self.config.teardown_timeout());
        }

        let timeout = self.config.shadow_ready_timeout();
        let notified = ready_rx.recv_timeout(timeout).is_ok();
        let ready = notified || {
            // The event may have fired before the subscription observed it.
            let control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control
                .preview_slot()
                .map(|slot| slot.is_shadow_ready())
                .unwrap_or(false)
        };
        if !ready {
            // Don't leave a never-ready slot parked in the preview seat.
            let stale = {
                let mut control = channel
                    .control
                    .lock()
                    .expect("channel control mutex poisoned");
                control.take_preview()
            };
            if let Some(mut slot) = stale {
                slot.request_teardown(self.config.teardown_timeout());
            }
            return Err(EngineError::Timeout {
                what: "shadow decode readiness",
                waited_ms: timeout.as_millis() as u64,
            });
        }

        let (outcome, outgoing) = {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.activate_preview_as_live()?
        };
        if let Some(mut old) = outgoing {
            old.request_teardown(self.config.teardown_timeout());
        }
        debug!(
            channel_id = channel.channel_id,
            live_start_pts = outcome.live_start_pts,
            "plan live"
        );
        Ok(())
    }

    fn shutdown_channel(&self, channel: &mut Channel, command: &str) -> bool {
        let channel_id = channel.channel_id;
        let now = self.clock.now_us();
        // Observer first, so nothing contends for the control lock during
        // slot teardown.
        channel.tick.stop();
        let slots = {
            let mut control = channel
                .control
                .lock()
                .expect("channel control mutex poisoned");
            control.begin_stop(&command_id(command, channel_id), now, now)
        };
        let mut forced = false;
        for mut slot in slots {
            forced |= slot.request_teardown(self.config.teardown_timeout()).forced;
        }
        // The sink drains its queue, pads the stream to a 188-byte boundary
        // and closes the transport.
        channel.sink.stop();
        let done = self.clock.now_us();
        let mut control = channel
            .control
            .lock()
            .expect("channel control mutex poisoned");
        control.finish_stop(&command_id(command, channel_id), now, done);
        forced
    }

    fn make_decoder(&self, asset_uri: &str, config: &ChannelConfig) -> Box<dyn MediaDecoder> {
        if self.config.fake_video || asset_uri.starts_with("pattern:") {
            Box::new(PatternDecoder::new(
                asset_uri,
                config.target_width,
                config.target_height,
                config.target_fps,
            ))
        } else {
            Box::new(RawFileDecoder::new(
                asset_uri,
                config.target_width,
                config.target_height,
                config.target_fps,
            ))
        }
    }

    fn slot_event_callback(
        &self,
        channel_id: ChannelId,
        control: Arc<Mutex<ChannelControl>>,
        ready_tx: Option<crossbeam_channel::Sender<()>>,
    ) -> SlotEventCallback {
        let clock = Arc::clone(&self.clock);
        Arc::new(move |event: SlotEvent| match event {
            SlotEvent::ShadowReady => {
                if let Some(tx) = ready_tx.as_ref() {
                    let _ = tx.try_send(());
                }
            }
            SlotEvent::EndOfStream => {
                debug!(channel_id, "live asset reached end of stream");
            }
            SlotEvent::Fatal { message } => {
                warn!(channel_id, reason = %message, "producer slot failed");
                if let Ok(mut control) = control.lock() {
                    control.on_decoder_fatal(clock.now_us());
                }
            }
        })
    }
}

impl Drop for PlayoutEngine {
    fn drop(&mut self) {
        self.stop_all();
    }
}
