//! Per-channel telemetry snapshots.
//!
//! The store is the sink the rest of the engine writes into; an exporter
//! endpoint (HTTP or otherwise) reads [`MetricsStore::render_prometheus`]
//! when it wants the current picture. Readers always observe a consistent
//! per-channel record.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

/// Canonical user-visible channel status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Stopped,
    Buffering,
    Ready,
    Error,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelState::Stopped => "stopped",
            ChannelState::Buffering => "buffering",
            ChannelState::Ready => "ready",
            ChannelState::Error => "error",
        }
    }

    fn as_value(self) -> i64 {
        match self {
            ChannelState::Stopped => 0,
            ChannelState::Buffering => 1,
            ChannelState::Ready => 2,
            ChannelState::Error => 3,
        }
    }
}

/// One channel's snapshot, replaced wholesale on every submit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub state: ChannelState,
    pub buffer_depth_frames: usize,
    pub frame_gap_seconds: f64,
    pub decode_failure_count: u64,
    pub corrections_total: u64,
}

#[derive(Default)]
pub struct MetricsStore {
    channels: Mutex<BTreeMap<i32, ChannelMetrics>>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn submit_channel_metrics(&self, channel_id: i32, metrics: ChannelMetrics) {
        let mut channels = self.channels.lock().expect("metrics store mutex poisoned");
        channels.insert(channel_id, metrics);
    }

    pub fn remove_channel(&self, channel_id: i32) {
        let mut channels = self.channels.lock().expect("metrics store mutex poisoned");
        channels.remove(&channel_id);
    }

    pub fn channel(&self, channel_id: i32) -> Option<ChannelMetrics> {
        let channels = self.channels.lock().expect("metrics store mutex poisoned");
        channels.get(&channel_id).copied()
    }

    pub fn all(&self) -> BTreeMap<i32, ChannelMetrics> {
        self.channels
            .lock()
            .expect("metrics store mutex poisoned")
            .clone()
    }

    /// Prometheus text exposition of every channel snapshot.
    pub fn render_prometheus(&self) -> String {
        let channels = self.all();
        let mut out = String::new();
        out.push_str("# TYPE kinocast_channel_state gauge\n");
        for (id, metrics) in &channels {
            out.push_str(&format!(
                "kinocast_channel_state{{channel=\"{id}\",state=\"{}\"}} {}\n",
                metrics.state.as_str(),
                metrics.state.as_value()
            ));
        }
        out.push_str("# TYPE kinocast_channel_buffer_depth_frames gauge\n");
        for (id, metrics) in &channels {
            out.push_str(&format!(
                "kinocast_channel_buffer_depth_frames{{channel=\"{id}\"}} {}\n",
                metrics.buffer_depth_frames
            ));
        }
        out.push_str("# TYPE kinocast_channel_frame_gap_seconds gauge\n");
        for (id, metrics) in &channels {
            out.push_str(&format!(
                "kinocast_channel_frame_gap_seconds{{channel=\"{id}\"}} {}\n",
                metrics.frame_gap_seconds
            ));
        }
        out.push_str("# TYPE kinocast_channel_decode_failures_total counter\n");
        for (id, metrics) in &channels {
            out.push_str(&format!(
                "kinocast_channel_decode_failures_total{{channel=\"{id}\"}} {}\n",
                metrics.decode_failure_count
            ));
        }
        out.push_str("# TYPE kinocast_channel_corrections_total counter\n");
        for (id, metrics) in &channels {
            out.push_str(&format!(
                "kinocast_channel_corrections_total{{channel=\"{id}\"}} {}\n",
                metrics.corrections_total
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_replaces_previous_snapshot() {
        let store = MetricsStore::new();
        store.submit_channel_metrics(
            1,
            ChannelMetrics {
                state: ChannelState::Buffering,
                buffer_depth_frames: 2,
                ..ChannelMetrics::default()
            },
        );
        store.submit_channel_metrics(
            1,
            ChannelMetrics {
                state: ChannelState::Ready,
                buffer_depth_frames: 30,
                ..ChannelMetrics::default()
            },
        );
        let snapshot = store.channel(1).expect("missing channel snapshot");
        assert_eq!(snapshot.state, ChannelState::Ready);
        assert_eq!(snapshot.buffer_depth_frames, 30);
    }

    #[test]
    fn remove_drops_the_channel() {
        let store = MetricsStore::new();
        store.submit_channel_metrics(7, ChannelMetrics::default());
        store.remove_channel(7);
        assert!(store.channel(7).is_none());
        assert!(store.all().is_empty());
    }

    #[test]
    fn prometheus_rendering_lists_each_channel() {
        let store = MetricsStore::new();
        store.submit_channel_metrics(
            3,
            ChannelMetrics {
                state: ChannelState::Ready,
                buffer_depth_frames: 12,
                ..ChannelMetrics::default()
            },
        );
        let text = store.render_prometheus();
        assert!(text.contains("kinocast_channel_state{channel=\"3\",state=\"ready\"} 2"));
        assert!(text.contains("kinocast_channel_buffer_depth_frames{channel=\"3\"} 12"));
    }
}
