// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! EventSub wire types and the session pipeline.

pub mod reconcile;
pub mod seen;
pub mod session;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default EventSub WebSocket dial URL.
pub const EVENTSUB_WS_URL: &str =
    "wss://eventsub.wss.twitch.tv/ws?keepalive_timeout_seconds=600";

/// Frame envelope: metadata plus a type-dependent payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub metadata: Metadata,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub message_id: String,
    pub message_type: MessageType,
    #[serde(default)]
    pub message_timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    SessionWelcome,
    SessionKeepalive,
    SessionReconnect,
    Notification,
    Close,
    #[serde(other)]
    Unknown,
}

/// `payload.session` for welcome and reconnect frames.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub reconnect_url: Option<String>,
    #[serde(default)]
    pub keepalive_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionPayload {
    pub session: SessionInfo,
}

/// `payload` for notification frames.
#[derive(Debug, Clone, Deserialize)]
pub struct NotificationPayload {
    pub subscription: SubscriptionInfo,
    #[serde(default)]
    pub event: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionInfo {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub version: String,
}

/// Mirror of a server-side subscription record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSubscription {
    pub id: String,
    #[serde(rename = "type")]
    pub topic: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub condition: Value,
    #[serde(default)]
    pub transport: SubscriptionTransport,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriptionTransport {
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl ServerSubscription {
    /// A subscription delivering to the current session.
    pub fn is_live(&self, session_id: &str) -> bool {
        self.status == "enabled" && self.transport.session_id.as_deref() == Some(session_id)
    }
}

/// Parse an RFC-3339 frame timestamp into epoch seconds (fractional).
pub fn parse_timestamp(raw: &str) -> Option<f64> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.timestamp_micros() as f64 / 1_000_000.0)
}
