#![forbid(unsafe_code)]

//! # Revi SDK delivery core
//!
//! The resilient client-side delivery pipeline of the Revi
//! error-monitoring and session-replay platform. It turns unreliable
//! conditions (offline spells, flaky backends, rate-limit storms, page
//! unloads) into an at-least-once, bounded-latency, bounded-memory
//! stream of events reaching the ingest API.
//!
//! ## What's inside
//!
//! - **Durable queue** with priority/age/size eviction and a persistent
//!   write-through backing ([`DurableStore`])
//! - **Adaptive sampling** with guaranteed error coverage floors
//!   ([`SamplingController`])
//! - **Batching** bounded by count and payload bytes ([`BatchAssembler`])
//! - **Retries** with jittered exponential backoff, attempt deadlines,
//!   and a shared time-windowed retry budget ([`RetryManager`])
//! - **Circuit breakers** per endpoint with rolling-window failure
//!   rates and graceful degradation tiers ([`CircuitBreaker`],
//!   [`CircuitManager`])
//! - **Health monitoring** with active probes, latency percentiles,
//!   and multi-region primary election ([`HealthMonitor`])
//! - **Drain loop** and **reconnect sync** orchestrating all of the
//!   above ([`DeliveryPipeline`], [`SyncCoordinator`])
//! - **Supervisor** exposing the public `capture*` / `flush` /
//!   `destroy` surface over an explicit, test-friendly [`Runtime`]
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use revi_sdk::{Config, ErrorCapture, Runtime, Supervisor};
//! # #[derive(Debug)] struct MyTransport;
//! # #[async_trait::async_trait]
//! # impl revi_sdk::Transport for MyTransport {
//! #     async fn post_batch(&self, _e: &revi_sdk::Endpoint, _k: revi_sdk::ItemKind, _b: &serde_json::Value)
//! #         -> Result<revi_sdk::IngestResponse, revi_sdk::SdkError> { Ok(revi_sdk::IngestResponse::default()) }
//! #     async fn probe(&self, _e: &revi_sdk::Endpoint) -> Result<(), revi_sdk::SdkError> { Ok(()) }
//! #     fn send_fire_and_forget(&self, _e: &revi_sdk::Endpoint, _k: revi_sdk::ItemKind, _b: serde_json::Value) -> bool { false }
//! # }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), revi_sdk::SdkError> {
//!     let config = Config::new("api-key", "https://ingest.revi.dev");
//!     let runtime = Runtime::new(config, Arc::new(MyTransport));
//!     let sdk = Supervisor::start(runtime).await?;
//!
//!     sdk.capture_error(ErrorCapture::new("checkout failed")).await;
//!     sdk.flush(None).await;
//!     sdk.destroy().await;
//!     Ok(())
//! }
//! ```

mod backoff;
mod batch;
mod cancel;
mod circuit;
mod clock;
mod config;
mod diagnostics;
mod error;
mod event;
mod health;
mod jitter;
mod pipeline;
mod retry;
mod sampling;
mod sleeper;
mod storage;
mod store;
mod supervisor;
mod sync;
mod transport;

// Re-exports
pub use backoff::Backoff;
pub use batch::{Batch, BatchAssembler, BatchLimits};
pub use cancel::AbortToken;
pub use circuit::{
    CircuitBreaker, CircuitManager, CircuitMetrics, CircuitState, DegradationTier,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{
    CircuitConfig, Config, ConflictPolicy, Environment, HealthConfig, PerformanceConfig,
    PrivacyConfig, ReplayConfig, RetryConfig, StorageConfig, SyncConfig,
};
pub use diagnostics::{
    forward_to_sink, DebugEntry, DiagnosticBus, DiagnosticEvent, RingSink, TracingSink,
    DEBUG_LOG_CAPACITY,
};
pub use error::SdkError;
pub use event::{
    ErrorItem, Item, ItemKind, NetworkEventItem, Priority, SessionEventItem, StoredItem,
    MAX_ITEM_BYTES,
};
pub use health::{FailoverRecord, HealthMetrics, HealthMonitor, HealthStatus, Trend};
pub use jitter::Jitter;
pub use pipeline::{DeliveryPipeline, PipelineConfig, TickReport};
pub use retry::{RetryManager, RetryOptions, RetryStats};
pub use sampling::{ActivityLevel, Decision, LiveRates, SamplingController, SamplingRates};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use storage::{MemoryBackend, StorageBackend};
pub use store::{DeadLetter, DurableStore, PeekFilter, SweepReport, DEAD_LETTER_MAX_BYTES};
pub use supervisor::{
    BeforeSend, Breadcrumb, ErrorCapture, NetworkCapture, Runtime, Severity, Supervisor,
};
pub use sync::{
    SyncConditions, SyncCoordinator, SyncPhase, SyncProgress, SyncReport,
};
pub use transport::{Endpoint, IngestResponse, ItemDisposition, Transport};

pub mod prelude;
