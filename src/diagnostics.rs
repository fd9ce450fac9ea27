//! Diagnostic event stream and the bounded debug log.
//!
//! Components report noteworthy transitions (circuit state, failover,
//! sync progress, queue pressure) through a [`DiagnosticBus`]. Emission
//! is synchronous and best-effort: events land in a bounded in-memory
//! ring retrievable at runtime, and fan out to broadcast subscribers.
//! External sinks are `tower::Service<DiagnosticEvent>` values driven by
//! [`forward_to_sink`], so delivery to a slow sink never blocks the
//! pipeline.

use crate::clock::Clock;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// Default capacity of the debug log ring.
pub const DEBUG_LOG_CAPACITY: usize = 1_000;

const BROADCAST_CAPACITY: usize = 256;

/// Events surfaced to embedders.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticEvent {
    CircuitStateChanged {
        feature: String,
        from: &'static str,
        to: &'static str,
    },
    DegradationTierChanged {
        from: &'static str,
        to: &'static str,
    },
    SyncProgress {
        phase: &'static str,
        total: usize,
        synced: usize,
        failed: usize,
        current_batch: usize,
        total_batches: usize,
        bytes_transferred: usize,
        estimated_remaining_ms: u64,
    },
    QueueFull {
        dropped: usize,
    },
    StorageDegraded {
        reason: String,
    },
    PrimaryChanged {
        from: Option<String>,
        to: String,
        cause: String,
    },
    ItemDeadLettered {
        id: u64,
        attempts: u32,
    },
}

impl DiagnosticEvent {
    /// JSON rendering used by sinks and the debug log.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DiagnosticEvent::CircuitStateChanged { feature, from, to } => {
                json!({"event": "circuit_state_changed", "feature": feature, "from": from, "to": to})
            }
            DiagnosticEvent::DegradationTierChanged { from, to } => {
                json!({"event": "degradation_tier_changed", "from": from, "to": to})
            }
            DiagnosticEvent::SyncProgress {
                phase,
                total,
                synced,
                failed,
                current_batch,
                total_batches,
                bytes_transferred,
                estimated_remaining_ms,
            } => json!({
                "event": "sync_progress",
                "phase": phase,
                "total": total,
                "synced": synced,
                "failed": failed,
                "current_batch": current_batch,
                "total_batches": total_batches,
                "bytes_transferred": bytes_transferred,
                "estimated_remaining_ms": estimated_remaining_ms,
            }),
            DiagnosticEvent::QueueFull { dropped } => {
                json!({"event": "queue_full", "dropped": dropped})
            }
            DiagnosticEvent::StorageDegraded { reason } => {
                json!({"event": "storage_degraded", "reason": reason})
            }
            DiagnosticEvent::PrimaryChanged { from, to, cause } => {
                json!({"event": "primary_changed", "from": from, "to": to, "cause": cause})
            }
            DiagnosticEvent::ItemDeadLettered { id, attempts } => {
                json!({"event": "item_dead_lettered", "id": id, "attempts": attempts})
            }
        }
    }
}

/// One entry of the debug log ring.
#[derive(Debug, Clone, PartialEq)]
pub struct DebugEntry {
    pub ts_ms: u64,
    pub message: String,
}

/// Shared diagnostic fan-out plus the debug log ring.
#[derive(Debug, Clone)]
pub struct DiagnosticBus {
    tx: broadcast::Sender<DiagnosticEvent>,
    ring: Arc<Mutex<VecDeque<DebugEntry>>>,
    ring_capacity: usize,
    clock: Arc<dyn Clock>,
}

impl DiagnosticBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEBUG_LOG_CAPACITY)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, ring_capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx, ring: Arc::new(Mutex::new(VecDeque::new())), ring_capacity, clock }
    }

    /// Emit an event: append to the ring and fan out to subscribers.
    /// Never blocks; lagging subscribers miss events.
    pub fn emit(&self, event: DiagnosticEvent) {
        self.push_entry(event.to_json().to_string());
        let _ = self.tx.send(event);
    }

    /// Append a plain message to the debug log without fanning out.
    pub fn log(&self, message: impl Into<String>) {
        self.push_entry(message.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.tx.subscribe()
    }

    /// Snapshot of the debug log, oldest first.
    pub fn debug_log(&self) -> Vec<DebugEntry> {
        self.ring
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn push_entry(&self, message: String) {
        let mut ring = self.ring.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if ring.len() == self.ring_capacity {
            ring.pop_front();
        }
        ring.push_back(DebugEntry { ts_ms: self.clock.now_millis(), message });
    }
}

/// Pump a diagnostic subscription into a `tower::Service` sink.
///
/// Sinks get the same contract the ring does: diagnostics are advisory,
/// so the pump never blocks the pipeline and never retries. Each event
/// is offered to the sink exactly once (`oneshot` drives readiness and
/// the call together); events the sink refuses, and events missed while
/// the subscription lagged, only bump a counter that is reported when
/// the stream closes. The pump ends when the owning bus is dropped.
pub async fn forward_to_sink<S>(mut rx: broadcast::Receiver<DiagnosticEvent>, sink: S)
where
    S: tower::Service<DiagnosticEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    let mut dropped: u64 = 0;
    loop {
        match rx.recv().await {
            Ok(event) => {
                if sink.clone().oneshot(event).await.is_err() {
                    dropped += 1;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => dropped += missed,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    if dropped > 0 {
        tracing::debug!(dropped, "diagnostic sink missed events");
    }
}

/// Sink that mirrors every event into an external debug ring, for hosts
/// that surface SDK diagnostics in their own tooling alongside the
/// bus-internal log.
#[derive(Debug, Clone)]
pub struct RingSink {
    entries: Arc<Mutex<VecDeque<DebugEntry>>>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl RingSink {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self { entries: Arc::new(Mutex::new(VecDeque::new())), capacity, clock }
    }

    /// Snapshot of the mirrored entries, oldest first.
    pub fn entries(&self) -> Vec<DebugEntry> {
        self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner).iter().cloned().collect()
    }
}

impl tower::Service<DiagnosticEvent> for RingSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // The ring overwrites instead of back-pressuring.
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DiagnosticEvent) -> Self::Future {
        let mut entries =
            self.entries.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(DebugEntry {
            ts_ms: self.clock.now_millis(),
            message: event.to_json().to_string(),
        });
        std::future::ready(Ok(()))
    }
}

/// Sink that narrates events through `tracing` at debug level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl tower::Service<DiagnosticEvent> for TracingSink {
    type Response = ();
    type Error = std::convert::Infallible;
    type Future = std::future::Ready<Result<(), Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: DiagnosticEvent) -> Self::Future {
        tracing::debug!(event = %event.to_json(), "diagnostic");
        std::future::ready(Ok(()))
    }
}
