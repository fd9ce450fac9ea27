//! The ingest transport contract.
//!
//! The pipeline never talks HTTP directly; the host embeds it with a
//! `Transport` implementation (fetch/XHR in a browser shell, an HTTP
//! client elsewhere). Deadlines are enforced by the callers, so
//! implementations only need to map responses onto [`IngestResponse`]
//! and failures onto [`SdkError`].

use crate::error::SdkError;
use crate::event::ItemKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One ingest region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Stable identifier used for circuit breakers and retry keys.
    pub name: String,
    pub base_url: String,
    /// Election preference; lower wins among healthy endpoints.
    pub priority: u32,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>, priority: u32) -> Self {
        Self { name: name.into(), base_url: base_url.into(), priority }
    }

    /// Capture path for a given event kind.
    pub fn capture_path(kind: ItemKind) -> &'static str {
        match kind {
            ItemKind::Error => "/api/capture/error",
            ItemKind::Session => "/api/capture/session-event",
            ItemKind::Network => "/api/capture/network-event",
        }
    }
}

/// Per-item server verdict for a submitted batch, parallel to submission
/// order.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemDisposition {
    Accepted,
    /// Idempotency key already acknowledged server-side.
    Duplicate,
    /// Server holds a different version of the same logical event.
    Conflict { server_timestamp_ms: u64 },
}

/// Successful ingest response.
///
/// An empty `dispositions` vector means every submitted item was
/// accepted.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IngestResponse {
    pub dispositions: Vec<ItemDisposition>,
    pub retry_after_ms: Option<u64>,
}

impl IngestResponse {
    /// Response accepting all `count` items.
    pub fn accepted(count: usize) -> Self {
        Self { dispositions: vec![ItemDisposition::Accepted; count], retry_after_ms: None }
    }

    pub fn disposition(&self, index: usize) -> ItemDisposition {
        self.dispositions.get(index).cloned().unwrap_or(ItemDisposition::Accepted)
    }
}

/// Host-provided ingest client.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// POST a JSON batch to the kind's capture endpoint.
    async fn post_batch(
        &self,
        endpoint: &Endpoint,
        kind: ItemKind,
        body: &serde_json::Value,
    ) -> Result<IngestResponse, SdkError>;

    /// Cheap active health probe (`GET /health`).
    async fn probe(&self, endpoint: &Endpoint) -> Result<(), SdkError>;

    /// Best-effort blocking-send primitive for page unload. No response,
    /// no retry; implementations map this onto whatever the environment
    /// offers (`sendBeacon`, keepalive fetch, a last synchronous write).
    /// Returns whether the environment accepted the payload for
    /// delivery.
    fn send_fire_and_forget(
        &self,
        endpoint: &Endpoint,
        kind: ItemKind,
        body: serde_json::Value,
    ) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_paths_match_ingest_api() {
        assert_eq!(Endpoint::capture_path(ItemKind::Error), "/api/capture/error");
        assert_eq!(Endpoint::capture_path(ItemKind::Session), "/api/capture/session-event");
        assert_eq!(Endpoint::capture_path(ItemKind::Network), "/api/capture/network-event");
    }

    #[test]
    fn accepted_response_covers_every_item() {
        let resp = IngestResponse::accepted(3);
        assert_eq!(resp.dispositions.len(), 3);
        assert_eq!(resp.disposition(1), ItemDisposition::Accepted);
        // Out-of-range lookups default to accepted.
        assert_eq!(resp.disposition(9), ItemDisposition::Accepted);
    }
}
