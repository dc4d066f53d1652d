use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Bus topic carrying presence transitions, partitioned by user id so events
/// for one user are totally ordered.
pub const USER_STATUS_TOPIC: &str = "user_status_events";

// WebSocket close codes used on the session wire.
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

// Close reasons. These are protocol-visible strings; clients match on them.
pub const REASON_NO_TOKEN: &str = "No token provided";
pub const REASON_INVALID_TOKEN: &str = "Invalid token";
pub const REASON_NOT_OWNED: &str = "User does not belong to this node";
pub const REASON_INTERNAL_ERROR: &str = "Internal server error";
pub const REASON_DUPLICATE_SESSION: &str = "Duplicate session";
pub const REASON_SHUTDOWN: &str = "Server shutting down";

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Online,
    Offline,
}

/// A presence transition published on the bus.
///
/// Field names are part of the wire contract, hence the camelCase rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEvent {
    pub user_id: String,
    pub action: PresenceAction,
    pub timestamp: i64,
    pub node_id: String,
}

impl PresenceEvent {
    pub fn online(user_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            action: PresenceAction::Online,
            timestamp: now_ms(),
            node_id: node_id.into(),
        }
    }

    pub fn offline(user_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            action: PresenceAction::Offline,
            timestamp: now_ms(),
            node_id: node_id.into(),
        }
    }
}

/// Frames sent from a presence node to a connected client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    Welcome {
        user_id: String,
        node_id: String,
        timestamp: i64,
    },
    Pong {
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    StatusUpdate {
        action: PresenceAction,
        timestamp: i64,
        source_node_id: String,
    },
}

/// Frames accepted from a client. Anything with an unrecognized `type` tag
/// parses as `Unknown` and is logged and ignored by the receive loop.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Ping {
        #[serde(default)]
        timestamp: Option<i64>,
    },
    #[serde(other)]
    Unknown,
}
