//! Wire shapes for the control surface.
//!
//! Requests arrive as one JSON object per line; every response carries
//! `success` and `message` plus the operation-specific fields.

use serde::{Deserialize, Serialize};

use crate::ChannelId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    StartChannel {
        channel_id: ChannelId,
        plan_handle: String,
        port: u16,
        #[serde(default)]
        uds_path: Option<String>,
    },
    StopChannel {
        channel_id: ChannelId,
    },
    LoadPreview {
        channel_id: ChannelId,
        asset_path: String,
        asset_id: String,
    },
    SwitchToLive {
        channel_id: ChannelId,
    },
    UpdatePlan {
        channel_id: ChannelId,
        plan_handle: String,
    },
    GetVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shadow_decode_started: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pts_contiguous: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub live_start_pts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Response {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            ..Self::default()
        }
    }
}
