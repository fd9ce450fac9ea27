//! Event payloads and the durable queue envelope.

use serde::{Deserialize, Serialize};

/// Hard cap on a single serialized payload. Larger items are rejected at
/// `put` with `SdkError::TooLarge`; callers must split them.
pub const MAX_ITEM_BYTES: usize = 64 * 1024;

/// The three event streams produced by the capture front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Error,
    Session,
    Network,
}

impl ItemKind {
    pub const ALL: [ItemKind; 3] = [ItemKind::Error, ItemKind::Session, ItemKind::Network];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Error => "error",
            ItemKind::Session => "session",
            ItemKind::Network => "network",
        }
    }
}

/// Queue priority. Ordering is `Low < Medium < High < Critical` so the
/// natural `Ord` sorts ascending by urgency.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// A captured error or message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorItem {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    pub session_id: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// A session-replay event (DOM mutation, click, scroll, ...). The inner
/// payload is opaque to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEventItem {
    pub session_id: String,
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp_ms: u64,
}

/// A captured network request/response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkEventItem {
    pub session_id: String,
    pub method: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub request_data: serde_json::Value,
    #[serde(default)]
    pub response_data: serde_json::Value,
}

/// Tagged union of the three event kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Item {
    Error(ErrorItem),
    Session(SessionEventItem),
    Network(NetworkEventItem),
}

impl Item {
    pub fn kind(&self) -> ItemKind {
        match self {
            Item::Error(_) => ItemKind::Error,
            Item::Session(_) => ItemKind::Session,
            Item::Network(_) => ItemKind::Network,
        }
    }

    /// Default queue priority per kind: errors High, sessions Medium,
    /// network Low. Callers upgrade errors to Critical on explicit
    /// severity.
    pub fn default_priority(&self) -> Priority {
        match self {
            Item::Error(_) => Priority::High,
            Item::Session(_) => Priority::Medium,
            Item::Network(_) => Priority::Low,
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            Item::Error(e) => &e.session_id,
            Item::Session(s) => &s.session_id,
            Item::Network(n) => &n.session_id,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        match self {
            Item::Error(e) => e.timestamp_ms,
            Item::Session(s) => s.timestamp_ms,
            Item::Network(n) => n.timestamp_ms,
        }
    }
}

/// Queue envelope around an [`Item`].
///
/// `payload_bytes` is computed once from the serialized payload at
/// admission and is the number used for all batch and eviction
/// accounting thereafter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredItem {
    pub id: u64,
    pub kind: ItemKind,
    pub priority: Priority,
    pub created_ms: u64,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_ms: Option<u64>,
    pub payload_bytes: usize,
    pub payload: Item,
}
