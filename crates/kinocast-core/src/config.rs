use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the pacing sink should emit while the frame ring is starved.
///
/// The policy is advisory: the sink honors it only while a consumer is
/// attached and pacing has been anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnderflowPolicy {
    /// Re-emit the last delivered frame at the nominal cadence.
    #[default]
    Freeze,
    /// Emit black frames at the nominal cadence.
    Black,
    /// Emit nothing until real frames return.
    Skip,
}

/// Per-channel configuration, immutable after the channel is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub target_fps: f64,
    pub target_width: u32,
    pub target_height: u32,
    pub bitrate_kbps: u32,
    pub gop_size: u32,
    #[serde(default)]
    pub underflow_policy: UnderflowPolicy,
    /// Frame ring capacity in frames.
    pub buffer_capacity: usize,
    /// Hard maximum of the encoded output queue; oldest entries are dropped
    /// beyond this.
    pub max_output_queue: usize,
    /// Above this queue depth the sink stops encoding new frames.
    pub output_queue_high_water: usize,
    /// Local stream socket path; `None` selects TCP.
    #[serde(default)]
    pub ts_socket_path: Option<String>,
    pub bind_host: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            target_fps: 30.0,
            target_width: 1920,
            target_height: 1080,
            bitrate_kbps: 4000,
            gop_size: 30,
            underflow_policy: UnderflowPolicy::Freeze,
            buffer_capacity: 60,
            max_output_queue: 64,
            output_queue_high_water: 32,
            ts_socket_path: None,
            bind_host: "0.0.0.0".to_string(),
        }
    }
}

impl ChannelConfig {
    pub fn frame_period_us(&self) -> i64 {
        (1_000_000.0 / self.target_fps.max(1.0)) as i64
    }
}

/// Process-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default master-clock rate offset in parts-per-million.
    pub rate_ppm: i64,
    /// Bounded wait for shadow-decode readiness during channel start.
    pub shadow_ready_timeout_ms: u64,
    /// Cooperative producer teardown budget before a forced stop.
    pub teardown_timeout_ms: u64,
    /// Decode synthetic test-pattern frames instead of reading assets.
    #[serde(default)]
    pub fake_video: bool,
    /// Local-socket path template; `%d` is replaced with the channel id.
    #[serde(default)]
    pub ts_socket_template: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_ppm: 0,
            shadow_ready_timeout_ms: 5_000,
            teardown_timeout_ms: 2_000,
            fake_video: false,
            ts_socket_template: None,
        }
    }
}

impl EngineConfig {
    pub fn shadow_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.shadow_ready_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// Resolves the per-channel socket path from the template, if set.
    pub fn ts_socket_path_for(&self, channel_id: i32) -> Option<String> {
        self.ts_socket_template
            .as_ref()
            .map(|template| template.replace("%d", &channel_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_period_matches_fps() {
        let config = ChannelConfig {
            target_fps: 30.0,
            ..ChannelConfig::default()
        };
        assert_eq!(config.frame_period_us(), 33_333);
    }

    #[test]
    fn socket_template_substitutes_channel_id() {
        let config = EngineConfig {
            ts_socket_template: Some("/tmp/kinocast/ch-%d.sock".to_string()),
            ..EngineConfig::default()
        };
        assert_eq!(
            config.ts_socket_path_for(7).as_deref(),
            Some("/tmp/kinocast/ch-7.sock")
        );
        let no_template = EngineConfig::default();
        assert_eq!(no_template.ts_socket_path_for(7), None);
    }
}
