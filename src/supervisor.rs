//! Wires the pipeline together and exposes the SDK's public surface.
//!
//! The `Runtime` record replaces ambient singletons: it carries the
//! clock, sleeper, transport, storage backend, and hooks, so tests
//! construct a fresh one per case and production hosts construct one at
//! init. Producer calls (`capture_*`) never block on the network and
//! never surface errors; failures show up on the diagnostic stream and
//! in the debug log instead.

use crate::batch::{BatchAssembler, BatchLimits};
use crate::cancel::AbortToken;
use crate::circuit::{CircuitManager, CircuitMetrics, DegradationTier};
use crate::clock::{Clock, MonotonicClock};
use crate::config::Config;
use crate::diagnostics::{DebugEntry, DiagnosticBus, DiagnosticEvent};
use crate::error::SdkError;
use crate::event::{ErrorItem, Item, ItemKind, NetworkEventItem, Priority, SessionEventItem};
use crate::health::{FailoverRecord, HealthMetrics, HealthMonitor};
use crate::pipeline::{DeliveryPipeline, PipelineConfig};
use crate::retry::{RetryManager, RetryStats};
use crate::sampling::{ActivityLevel, LiveRates, SamplingController, SamplingRates};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::storage::{MemoryBackend, StorageBackend};
use crate::store::{DurableStore, PeekFilter};
use crate::sync::{SyncConditions, SyncCoordinator, SyncPhase, SyncProgress};
use crate::transport::{Endpoint, Transport};
use rand::Rng;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};

const SESSION_ID_KEY: &str = "revi.session.id";
const SESSION_STARTED_KEY: &str = "revi.session.started_ms";
const CONFIG_CACHE_KEY: &str = "revi.config.cache";

/// Sessions idle longer than this are rotated at the next capture.
const SESSION_ROTATE_MS: u64 = 30 * 60 * 1000;

/// Breadcrumb trail length.
const MAX_BREADCRUMBS: usize = 100;

/// Queue depth that triggers a background sync run.
const CRITICAL_QUEUE_WATERMARK: usize = 250;

/// Number of items pushed through the unload-safe send path.
const UNLOAD_SEND_LIMIT: usize = 25;

/// Hook run on error items after sampling; returning `None` drops the
/// event.
pub type BeforeSend = Arc<dyn Fn(ErrorItem) -> Option<ErrorItem> + Send + Sync>;

/// Severity attached to captured errors and messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

/// A captured error before enrichment.
#[derive(Debug, Clone, Default)]
pub struct ErrorCapture {
    pub message: String,
    pub stack: Option<String>,
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub severity: Severity,
    pub metadata: Value,
}

impl ErrorCapture {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), ..Self::default() }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }
}

/// A captured network request/response pair before enrichment.
#[derive(Debug, Clone, Default)]
pub struct NetworkCapture {
    pub method: String,
    pub url: String,
    pub status_code: Option<u16>,
    pub response_time_ms: Option<u64>,
    pub request_data: Value,
    pub response_data: Value,
}

/// One entry of the ambient breadcrumb trail.
#[derive(Debug, Clone, PartialEq)]
pub struct Breadcrumb {
    pub ts_ms: u64,
    pub category: String,
    pub message: String,
    pub data: Value,
}

/// Everything the supervisor needs from its host environment.
pub struct Runtime {
    pub config: Config,
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub transport: Arc<dyn Transport>,
    pub backend: Arc<dyn StorageBackend>,
    pub before_send: Option<BeforeSend>,
    /// When false, no background tasks are spawned; tests drive ticks
    /// and probes by hand.
    pub spawn_background_tasks: bool,
}

impl Runtime {
    pub fn new(config: Config, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            transport,
            backend: Arc::new(MemoryBackend::new()),
            before_send: None,
            spawn_background_tasks: true,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_before_send(mut self, hook: BeforeSend) -> Self {
        self.before_send = Some(hook);
        self
    }

    /// Disable background tasks; drains happen only via `flush` and
    /// explicit ticks.
    pub fn manual_drive(mut self) -> Self {
        self.spawn_background_tasks = false;
        self
    }
}

#[derive(Debug)]
struct SessionState {
    id: String,
    started_ms: u64,
    last_activity_ms: u64,
}

#[derive(Debug, Default)]
struct Ambient {
    user: Value,
    tags: serde_json::Map<String, Value>,
    extra: serde_json::Map<String, Value>,
    breadcrumbs: VecDeque<Breadcrumb>,
}

/// The SDK entry point.
pub struct Supervisor {
    config: Config,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn StorageBackend>,
    bus: DiagnosticBus,
    store: Arc<DurableStore>,
    sampling: Arc<SamplingController>,
    configured_rates: SamplingRates,
    retry: Arc<RetryManager>,
    circuits: Arc<CircuitManager>,
    health: Arc<HealthMonitor>,
    pipeline: Arc<DeliveryPipeline>,
    sync: Arc<SyncCoordinator>,
    session: Mutex<SessionState>,
    ambient: Mutex<Ambient>,
    before_send: Option<BeforeSend>,
    shutdown: AbortToken,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    destroyed: AtomicBool,
    caps_halved: AtomicBool,
}

impl Supervisor {
    /// Validate the configuration, restore persisted state, and wire
    /// the pipeline. A `ConfigError` here prevents start.
    pub async fn start(runtime: Runtime) -> Result<Supervisor, SdkError> {
        runtime.config.validate()?;
        let Runtime { config, clock, sleeper, transport, backend, before_send, spawn_background_tasks } =
            runtime;

        let bus = DiagnosticBus::new(clock.clone());
        let store = Arc::new(DurableStore::new(
            config.storage.clone(),
            clock.clone(),
            backend.clone(),
            bus.clone(),
        ));
        let restored = store.load().await;
        if restored > 0 {
            tracing::info!(restored, "recovered queued items from a previous session");
        }

        let configured_rates = SamplingRates {
            error: config.sample_rate,
            session: config.session_sample_rate,
            network: config.session_sample_rate,
        };
        let sampling =
            Arc::new(SamplingController::new(LiveRates::new(configured_rates), clock.clone()));
        let retry =
            Arc::new(RetryManager::new(config.retry.clone(), clock.clone(), sleeper.clone()));
        let circuits =
            Arc::new(CircuitManager::new(config.circuit.clone(), clock.clone(), bus.clone()));
        for endpoint in &config.endpoints {
            circuits.register_critical(&endpoint.name);
        }
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            config.endpoints.clone(),
            clock.clone(),
            sleeper.clone(),
            transport.clone(),
            bus.clone(),
        ));
        let assembler = Arc::new(BatchAssembler::new(BatchLimits::default()));
        let pipeline = Arc::new(DeliveryPipeline::new(
            PipelineConfig::default(),
            config.sync.conflict_policy,
            store.clone(),
            assembler,
            retry.clone(),
            circuits.clone(),
            health.clone(),
            transport.clone(),
            clock.clone(),
            sleeper.clone(),
        ));
        let sync = Arc::new(SyncCoordinator::new(
            config.sync.clone(),
            store.clone(),
            pipeline.clone(),
            health.clone(),
            backend.clone(),
            clock.clone(),
            sleeper.clone(),
            bus.clone(),
        ));

        let session = load_session(&*backend, &*clock).await;
        if let Ok(cache) = serde_json::to_string(&config) {
            if let Err(err) = backend.set(CONFIG_CACHE_KEY, &cache).await {
                tracing::debug!(%err, "could not cache effective configuration");
            }
        }

        let supervisor = Supervisor {
            config,
            clock,
            sleeper,
            transport,
            backend,
            bus,
            store,
            sampling,
            configured_rates,
            retry,
            circuits,
            health,
            pipeline,
            sync,
            session: Mutex::new(session),
            ambient: Mutex::new(Ambient::default()),
            before_send,
            shutdown: AbortToken::new(),
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            caps_halved: AtomicBool::new(false),
        };
        supervisor.adjust_for_store_health();

        if spawn_background_tasks {
            let mut tasks = supervisor
                .tasks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let pipeline = supervisor.pipeline.clone();
            let token = supervisor.shutdown.clone();
            tasks.push(tokio::spawn(async move { pipeline.run(token).await }));
            let health = supervisor.health.clone();
            let token = supervisor.shutdown.clone();
            tasks.push(tokio::spawn(async move { health.run(token).await }));
        }

        tracing::info!(
            endpoints = supervisor.config.endpoints.len(),
            durable = supervisor.store.durable(),
            "revi supervisor started"
        );
        Ok(supervisor)
    }

    /// Capture an error. Returns the queue id, or `None` when sampled
    /// out, filtered, or dropped.
    pub async fn capture_error(&self, capture: ErrorCapture) -> Option<u64> {
        if self.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        self.apply_degradation_tier();
        if self.sampling.decide(ItemKind::Error) == crate::sampling::Decision::Drop {
            return None;
        }

        let session_id = self.touch_session().await;
        let mut item = ErrorItem {
            message: capture.message,
            stack: capture.stack,
            url: capture.url,
            user_agent: capture.user_agent,
            session_id,
            timestamp_ms: self.clock.now_millis(),
            metadata: self.enrich_metadata(capture.metadata),
        };

        if let Some(hook) = &self.before_send {
            match hook(item) {
                Some(filtered) => item = filtered,
                None => return None,
            }
        }

        let priority = if capture.severity == Severity::Critical {
            Priority::Critical
        } else {
            Priority::High
        };
        self.enqueue(Item::Error(item), priority).await
    }

    /// Capture a plain message at a severity level.
    pub async fn capture_message(&self, message: impl Into<String>, level: Severity) -> Option<u64> {
        self.capture_error(ErrorCapture::new(message).with_severity(level)).await
    }

    /// Capture a session-replay event.
    pub async fn capture_session_event(&self, event_type: impl Into<String>, data: Value) -> Option<u64> {
        if self.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        self.apply_degradation_tier();
        if self.sampling.decide(ItemKind::Session) == crate::sampling::Decision::Drop {
            return None;
        }
        let session_id = self.touch_session().await;
        let item = SessionEventItem {
            session_id,
            event_type: event_type.into(),
            data,
            timestamp_ms: self.clock.now_millis(),
        };
        self.enqueue(Item::Session(item), Priority::Medium).await
    }

    /// Capture a network request/response record, applying the privacy
    /// configuration.
    pub async fn capture_network_event(&self, capture: NetworkCapture) -> Option<u64> {
        if self.destroyed.load(Ordering::SeqCst) {
            return None;
        }
        if !url_allowed(&capture.url, &self.config.privacy) {
            return None;
        }
        self.apply_degradation_tier();
        if self.sampling.decide(ItemKind::Network) == crate::sampling::Decision::Drop {
            return None;
        }
        let session_id = self.touch_session().await;
        let privacy = &self.config.privacy;
        let item = NetworkEventItem {
            session_id,
            method: capture.method,
            url: capture.url,
            status_code: capture.status_code,
            response_time_ms: capture.response_time_ms,
            timestamp_ms: self.clock.now_millis(),
            request_data: mask_sensitive(capture.request_data, privacy),
            response_data: mask_sensitive(capture.response_data, privacy),
        };
        self.enqueue(Item::Network(item), Priority::Low).await
    }

    /// Replace the ambient user context copied into new error items.
    pub fn set_user_context(&self, user: Value) {
        self.ambient().user = user;
    }

    pub fn set_tags(&self, tags: serde_json::Map<String, Value>) {
        self.ambient().tags = tags;
    }

    pub fn set_extra(&self, extra: serde_json::Map<String, Value>) {
        self.ambient().extra = extra;
    }

    /// Append a breadcrumb; the trail is bounded and oldest entries
    /// fall off.
    pub fn add_breadcrumb(
        &self,
        category: impl Into<String>,
        message: impl Into<String>,
        data: Value,
    ) {
        let crumb = Breadcrumb {
            ts_ms: self.clock.now_millis(),
            category: category.into(),
            message: message.into(),
            data,
        };
        let mut ambient = self.ambient();
        if ambient.breadcrumbs.len() == MAX_BREADCRUMBS {
            ambient.breadcrumbs.pop_front();
        }
        ambient.breadcrumbs.push_back(crumb);
    }

    /// Report observed user activity to the sampling controller.
    pub fn set_activity_level(&self, level: ActivityLevel) {
        self.sampling.set_activity(level);
    }

    /// Report the latest capture-overhead self-measurement.
    pub fn set_performance_impact(&self, impact: f64) {
        self.sampling.set_performance_impact(impact);
    }

    /// Drain the queue through a sync run. Resolves `true` when the
    /// queue fully drained before the deadline.
    pub async fn flush(&self, deadline: Option<Duration>) -> bool {
        let abort = AbortToken::new();
        let sync = self.sync.clone();
        let run_abort = abort.clone();
        let handle = tokio::spawn(async move {
            sync.run(SyncConditions::default(), run_abort).await
        });

        let completed = match deadline {
            Some(deadline) => {
                tokio::select! {
                    report = handle => matches!(report, Ok(r) if r.phase == SyncPhase::Completed),
                    _ = self.sleeper.sleep(deadline) => {
                        abort.cancel();
                        false
                    }
                }
            }
            None => matches!(handle.await, Ok(r) if r.phase == SyncPhase::Completed),
        };
        completed && self.store.size().0 == 0
    }

    /// Stop timers, persist final state, and attempt a best-effort
    /// unload-safe send of the highest-priority items.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        for task in self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner).drain(..) {
            task.abort();
        }
        self.store.sweep().await;
        self.unload_send().await;
        tracing::info!("revi supervisor destroyed");
    }

    /// Host signal: the page became hidden. Schedules an immediate
    /// drain.
    pub fn on_visibility_hidden(&self) {
        self.pipeline.kick();
    }

    /// Host signal: the page is about to unload. Fire-and-forget the
    /// most urgent items.
    pub async fn on_before_unload(&self) {
        self.unload_send().await;
    }

    /// Host signal: connectivity returned. Starts a background sync
    /// run.
    pub fn on_online(&self) {
        self.trigger_sync();
    }

    /// Host signal: the app returned to the foreground. Backlog built
    /// up while backgrounded drains through a sync run.
    pub fn on_foreground(&self) {
        self.trigger_sync();
    }

    fn trigger_sync(&self) {
        let sync = self.sync.clone();
        let abort = self.shutdown.clone();
        tokio::spawn(async move {
            sync.run(SyncConditions::default(), abort).await;
        });
    }

    /// Host signal: connectivity lost. Uploads will fail fast and queue;
    /// nothing to do beyond noting it.
    pub fn on_offline(&self) {
        tracing::info!("network offline, queueing captures locally");
        self.bus.log("network offline");
    }

    /// Subscribe to the diagnostic event stream.
    pub fn subscribe_diagnostics(&self) -> broadcast::Receiver<DiagnosticEvent> {
        self.bus.subscribe()
    }

    /// Subscribe to sync progress reports.
    pub fn subscribe_sync_progress(&self) -> watch::Receiver<SyncProgress> {
        self.sync.subscribe()
    }

    /// Snapshot of the bounded in-memory debug log.
    pub fn debug_log(&self) -> Vec<DebugEntry> {
        self.bus.debug_log()
    }

    /// `(count, bytes)` currently queued.
    pub fn queue_size(&self) -> (usize, usize) {
        self.store.size()
    }

    pub fn session_id(&self) -> String {
        self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner).id.clone()
    }

    pub fn retry_stats(&self, key: &str) -> RetryStats {
        self.retry.stats(key)
    }

    pub fn circuit_snapshot(&self) -> Vec<(String, CircuitMetrics)> {
        self.circuits.snapshot()
    }

    pub fn health_metrics(&self, endpoint: &str) -> Option<HealthMetrics> {
        self.health.metrics(endpoint)
    }

    pub fn failover_history(&self) -> Vec<FailoverRecord> {
        self.health.failover_history()
    }

    /// Attach an external diagnostic sink; events flow until `destroy`.
    pub fn attach_sink<S>(&self, sink: S)
    where
        S: tower::Service<DiagnosticEvent, Response = ()> + Send + Clone + 'static,
        S::Error: std::error::Error + Send + 'static,
        S::Future: Send + 'static,
    {
        let rx = self.bus.subscribe();
        let mut tasks = self.tasks.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        tasks.push(tokio::spawn(crate::diagnostics::forward_to_sink(rx, sink)));
    }

    async fn enqueue(&self, item: Item, priority: Priority) -> Option<u64> {
        let result = self.store.put(item, priority).await;
        self.adjust_for_store_health();
        match result {
            Ok(id) => {
                let (count, _) = self.store.size();
                if self.pipeline.under_pressure() {
                    self.pipeline.kick();
                }
                if count >= CRITICAL_QUEUE_WATERMARK && !self.destroyed.load(Ordering::SeqCst) {
                    self.trigger_sync();
                }
                Some(id)
            }
            Err(err) => {
                tracing::debug!(%err, "capture dropped");
                self.bus.log(format!("capture dropped: {err}"));
                None
            }
        }
    }

    /// Re-assert the sampling rates the current degradation tier calls
    /// for. Installing unchanged rates is free, so this runs on every
    /// capture.
    fn apply_degradation_tier(&self) {
        match self.circuits.tier() {
            DegradationTier::Emergency => self.sampling.rates().engage_floors(),
            DegradationTier::Progressive | DegradationTier::Normal => {
                self.sampling.rates().install(self.configured_rates)
            }
        }
    }

    fn adjust_for_store_health(&self) {
        if !self.store.durable() && !self.caps_halved.swap(true, Ordering::SeqCst) {
            self.store.halve_caps();
            tracing::warn!("storage degraded, queue caps halved");
        }
    }

    /// Merge ambient context into a capture's metadata.
    fn enrich_metadata(&self, metadata: Value) -> Value {
        let (user, tags, extra, crumbs) = {
            let ambient = self.ambient();
            let crumbs: Vec<Value> = ambient
                .breadcrumbs
                .iter()
                .map(|c| {
                    json!({
                        "ts_ms": c.ts_ms,
                        "category": c.category,
                        "message": c.message,
                        "data": c.data,
                    })
                })
                .collect();
            (ambient.user.clone(), ambient.tags.clone(), ambient.extra.clone(), crumbs)
        };
        json!({
            "user": user,
            "tags": tags,
            "extra": extra,
            "breadcrumbs": crumbs,
            "capture": metadata,
            "environment": match self.config.environment {
                crate::config::Environment::Development => "development",
                crate::config::Environment::Staging => "staging",
                crate::config::Environment::Production => "production",
            },
        })
    }

    /// Refresh session identity, rotating after a long idle spell.
    async fn touch_session(&self) -> String {
        let now = self.clock.now_millis();
        let rotate = {
            let mut session =
                self.session.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let idle = now.saturating_sub(session.last_activity_ms);
            session.last_activity_ms = now;
            if idle > SESSION_ROTATE_MS {
                session.id = mint_session_id();
                session.started_ms = now;
                Some((session.id.clone(), now))
            } else {
                None
            }
        };
        if let Some((id, started)) = rotate {
            tracing::debug!(session = %id, "session rotated after idle period");
            persist_session(&*self.backend, &id, started).await;
            return id;
        }
        self.session_id()
    }

    fn ambient(&self) -> std::sync::MutexGuard<'_, Ambient> {
        self.ambient.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Fire the most urgent queued items through the unload-safe send
    /// path. Accepted items are acked; everything else stays persisted
    /// for the next session.
    async fn unload_send(&self) {
        let Some(endpoint) = self.health.primary() else {
            return;
        };
        let items = self.store.peek(
            PeekFilter { kind: None, min_priority: Some(Priority::High) },
            UNLOAD_SEND_LIMIT,
        );
        if items.is_empty() {
            return;
        }
        let mut accepted: Vec<u64> = Vec::new();
        for kind in ItemKind::ALL {
            let of_kind: Vec<&crate::event::StoredItem> =
                items.iter().filter(|i| i.kind == kind).collect();
            if of_kind.is_empty() {
                continue;
            }
            let payloads: Vec<&Item> = of_kind.iter().map(|i| &i.payload).collect();
            let body = match kind {
                ItemKind::Error => json!({ "errors": payloads }),
                ItemKind::Session => json!({
                    "session_id": of_kind[0].payload.session_id(),
                    "events": payloads,
                }),
                ItemKind::Network => json!({ "events": payloads }),
            };
            if self.transport.send_fire_and_forget(&endpoint, kind, body) {
                accepted.extend(of_kind.iter().map(|i| i.id));
            }
        }
        if !accepted.is_empty() {
            self.store.ack(&accepted).await;
        }
        tracing::debug!(sent = accepted.len(), "unload-safe send finished");
    }
}

async fn load_session(backend: &dyn StorageBackend, clock: &dyn Clock) -> SessionState {
    let now = clock.now_millis();
    let stored_id = backend.get(SESSION_ID_KEY).await.ok().flatten();
    let stored_started: Option<u64> = backend
        .get(SESSION_STARTED_KEY)
        .await
        .ok()
        .flatten()
        .and_then(|text| text.parse().ok());

    match (stored_id, stored_started) {
        (Some(id), Some(started)) if now.saturating_sub(started) <= SESSION_ROTATE_MS => {
            SessionState { id, started_ms: started, last_activity_ms: now }
        }
        _ => {
            let id = mint_session_id();
            persist_session(backend, &id, now).await;
            SessionState { id, started_ms: now, last_activity_ms: now }
        }
    }
}

async fn persist_session(backend: &dyn StorageBackend, id: &str, started_ms: u64) {
    if backend.set(SESSION_ID_KEY, id).await.is_err()
        || backend.set(SESSION_STARTED_KEY, &started_ms.to_string()).await.is_err()
    {
        tracing::debug!("could not persist session identity");
    }
}

fn mint_session_id() -> String {
    let mut rng = rand::rng();
    format!("{:016x}{:016x}", rng.random::<u64>(), rng.random::<u64>())
}

/// Deny wins over allow; an empty allow list admits everything.
fn url_allowed(url: &str, privacy: &crate::config::PrivacyConfig) -> bool {
    if privacy.deny_urls.iter().any(|fragment| url.contains(fragment)) {
        return false;
    }
    if privacy.allow_urls.is_empty() {
        return true;
    }
    privacy.allow_urls.iter().any(|fragment| url.contains(fragment))
}

/// Redact sensitive keys per the privacy flags.
fn mask_sensitive(value: Value, privacy: &crate::config::PrivacyConfig) -> Value {
    match value {
        Value::Object(map) => {
            let masked = map
                .into_iter()
                .map(|(key, inner)| {
                    if should_mask(&key, privacy) {
                        (key, Value::String("[masked]".into()))
                    } else {
                        (key, mask_sensitive(inner, privacy))
                    }
                })
                .collect();
            Value::Object(masked)
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| mask_sensitive(v, privacy)).collect())
        }
        other => other,
    }
}

fn should_mask(key: &str, privacy: &crate::config::PrivacyConfig) -> bool {
    let key = key.to_ascii_lowercase();
    if privacy.mask_passwords && (key.contains("password") || key.contains("secret") || key.contains("token")) {
        return true;
    }
    if privacy.mask_credit_cards
        && (key.contains("card") || key.contains("cvv") || key.contains("pan"))
    {
        return true;
    }
    privacy.mask_inputs && (key.contains("input") || key == "value")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::SdkError;
    use crate::sleeper::InstantSleeper;
    use crate::transport::IngestResponse;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;

    /// Transport that accepts every batch and records unload sends.
    #[derive(Debug, Default)]
    struct AcceptAll {
        accept_unload: AtomicBool,
        unload_bodies: Mutex<Vec<(ItemKind, Value)>>,
    }

    #[async_trait]
    impl Transport for AcceptAll {
        async fn post_batch(
            &self,
            _endpoint: &Endpoint,
            _kind: ItemKind,
            body: &Value,
        ) -> Result<IngestResponse, SdkError> {
            let count = ["errors", "events"]
                .iter()
                .find_map(|k| body[k].as_array().map(Vec::len))
                .unwrap_or(1);
            Ok(IngestResponse::accepted(count))
        }

        async fn probe(&self, _endpoint: &Endpoint) -> Result<(), SdkError> {
            Ok(())
        }

        fn send_fire_and_forget(&self, _endpoint: &Endpoint, kind: ItemKind, body: Value) -> bool {
            self.unload_bodies
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((kind, body));
            self.accept_unload.load(Ordering::SeqCst)
        }
    }

    fn test_runtime(transport: Arc<AcceptAll>) -> (Runtime, ManualClock, Arc<MemoryBackend>) {
        let clock = ManualClock::new();
        let backend = Arc::new(MemoryBackend::new());
        let runtime = Runtime::new(
            Config::new("test-key", "https://ingest.example"),
            transport,
        )
        .with_clock(Arc::new(clock.clone()))
        .with_sleeper(Arc::new(InstantSleeper))
        .with_backend(backend.clone())
        .manual_drive();
        (runtime, clock, backend)
    }

    async fn started() -> (Supervisor, Arc<AcceptAll>, ManualClock, Arc<MemoryBackend>) {
        let transport = Arc::new(AcceptAll::default());
        let (runtime, clock, backend) = test_runtime(transport.clone());
        let supervisor = Supervisor::start(runtime).await.expect("start");
        (supervisor, transport, clock, backend)
    }

    #[tokio::test]
    async fn invalid_config_prevents_start() {
        let transport = Arc::new(AcceptAll::default());
        let (mut runtime, _clock, _backend) = test_runtime(transport);
        runtime.config.api_key = String::new();
        let result = Supervisor::start(runtime).await;
        assert!(matches!(result, Err(SdkError::Config(_))));
    }

    #[tokio::test]
    async fn captures_enqueue_with_session_and_ambient_context() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        supervisor.set_user_context(json!({"id": "u-7"}));
        supervisor.add_breadcrumb("nav", "opened /checkout", json!({}));

        let id = supervisor.capture_error(ErrorCapture::new("boom")).await;
        assert!(id.is_some());
        assert_eq!(supervisor.queue_size().0, 1);

        let items = supervisor.store.peek(PeekFilter::default(), 10);
        let Item::Error(error) = &items[0].payload else {
            panic!("expected an error item");
        };
        assert_eq!(error.session_id, supervisor.session_id());
        assert_eq!(error.metadata["user"]["id"], "u-7");
        assert_eq!(error.metadata["breadcrumbs"][0]["message"], "opened /checkout");
    }

    #[tokio::test]
    async fn critical_severity_upgrades_priority() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        supervisor
            .capture_error(ErrorCapture::new("fatal").with_severity(Severity::Critical))
            .await
            .expect("queued");
        supervisor.capture_error(ErrorCapture::new("plain")).await.expect("queued");

        let items = supervisor.store.peek(PeekFilter::default(), 10);
        assert_eq!(items[0].priority, Priority::Critical);
        assert_eq!(items[1].priority, Priority::High);
    }

    #[tokio::test]
    async fn before_send_can_drop_and_rewrite() {
        let transport = Arc::new(AcceptAll::default());
        let (runtime, _clock, _backend) = test_runtime(transport);
        let runtime = runtime.with_before_send(Arc::new(|mut item: ErrorItem| {
            if item.message.contains("secret") {
                return None;
            }
            item.message = item.message.to_uppercase();
            Some(item)
        }));
        let supervisor = Supervisor::start(runtime).await.expect("start");

        assert!(supervisor.capture_error(ErrorCapture::new("contains secret")).await.is_none());
        supervisor.capture_error(ErrorCapture::new("kept")).await.expect("queued");

        let items = supervisor.store.peek(PeekFilter::default(), 10);
        assert_eq!(items.len(), 1);
        assert!(matches!(&items[0].payload, Item::Error(e) if e.message == "KEPT"));
    }

    #[tokio::test]
    async fn deny_list_filters_network_captures() {
        let transport = Arc::new(AcceptAll::default());
        let (mut runtime, _clock, _backend) = test_runtime(transport);
        runtime.config.privacy.deny_urls = vec!["internal.example".into()];
        let supervisor = Supervisor::start(runtime).await.expect("start");

        let denied = supervisor
            .capture_network_event(NetworkCapture {
                method: "GET".into(),
                url: "https://internal.example/admin".into(),
                ..Default::default()
            })
            .await;
        assert!(denied.is_none());

        let allowed = supervisor
            .capture_network_event(NetworkCapture {
                method: "GET".into(),
                url: "https://api.example/v1".into(),
                ..Default::default()
            })
            .await;
        assert!(allowed.is_some());
    }

    #[tokio::test]
    async fn sensitive_fields_are_masked() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        supervisor
            .capture_network_event(NetworkCapture {
                method: "POST".into(),
                url: "https://api.example/login".into(),
                request_data: json!({"password": "hunter2", "user": "jo", "card_number": "4111"}),
                ..Default::default()
            })
            .await
            .expect("queued");

        let items = supervisor.store.peek(PeekFilter::default(), 10);
        let Item::Network(network) = &items[0].payload else {
            panic!("expected a network item");
        };
        assert_eq!(network.request_data["password"], "[masked]");
        assert_eq!(network.request_data["card_number"], "[masked]");
        assert_eq!(network.request_data["user"], "jo");
    }

    #[tokio::test]
    async fn breadcrumb_trail_is_bounded() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        for i in 0..150 {
            supervisor.add_breadcrumb("tick", format!("crumb {i}"), json!({}));
        }
        let ambient = supervisor.ambient();
        assert_eq!(ambient.breadcrumbs.len(), MAX_BREADCRUMBS);
        assert_eq!(ambient.breadcrumbs.front().expect("front").message, "crumb 50");
    }

    #[tokio::test]
    async fn flush_drains_the_queue() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        for i in 0..5 {
            supervisor.capture_error(ErrorCapture::new(format!("e{i}"))).await.expect("queued");
        }
        assert_eq!(supervisor.queue_size().0, 5);

        let drained = supervisor.flush(None).await;
        assert!(drained);
        assert_eq!(supervisor.queue_size().0, 0);
    }

    #[tokio::test]
    async fn destroy_sends_urgent_items_and_acks_when_accepted() {
        let (supervisor, transport, _clock, _backend) = started().await;
        transport.accept_unload.store(true, Ordering::SeqCst);
        for i in 0..5 {
            supervisor.capture_error(ErrorCapture::new(format!("e{i}"))).await.expect("queued");
        }

        supervisor.destroy().await;
        assert_eq!(supervisor.queue_size().0, 0, "accepted items were acked");
        let sent = transport.unload_bodies.lock().expect("bodies").clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["errors"].as_array().expect("errors").len(), 5);

        // After destroy, captures become no-ops.
        assert!(supervisor.capture_error(ErrorCapture::new("late")).await.is_none());
    }

    #[tokio::test]
    async fn destroy_keeps_items_when_environment_rejects_the_send() {
        let (supervisor, transport, _clock, backend) = started().await;
        transport.accept_unload.store(false, Ordering::SeqCst);
        for i in 0..5 {
            supervisor.capture_error(ErrorCapture::new(format!("e{i}"))).await.expect("queued");
        }

        supervisor.destroy().await;
        assert_eq!(supervisor.queue_size().0, 5, "items stay for the next session");
        let keys = backend.keys("revi.queue.item:").await.expect("keys");
        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn session_identity_survives_restart() {
        let transport = Arc::new(AcceptAll::default());
        let (runtime, _clock, backend) = test_runtime(transport.clone());
        let first = Supervisor::start(runtime).await.expect("start");
        let session = first.session_id();
        first.destroy().await;

        let clock = ManualClock::new();
        let runtime = Runtime::new(Config::new("test-key", "https://ingest.example"), transport)
            .with_clock(Arc::new(clock))
            .with_sleeper(Arc::new(InstantSleeper))
            .with_backend(backend)
            .manual_drive();
        let second = Supervisor::start(runtime).await.expect("start");
        assert_eq!(second.session_id(), session);
    }

    #[tokio::test]
    async fn session_rotates_after_a_long_idle_spell() {
        let (supervisor, _transport, clock, _backend) = started().await;
        supervisor.capture_error(ErrorCapture::new("first")).await.expect("queued");
        let before = supervisor.session_id();

        clock.advance(SESSION_ROTATE_MS + 1);
        supervisor.capture_error(ErrorCapture::new("second")).await.expect("queued");
        assert_ne!(supervisor.session_id(), before);
    }

    #[tokio::test]
    async fn emergency_tier_drops_sampling_to_the_floors() {
        let (supervisor, _transport, _clock, _backend) = started().await;
        // The lone endpoint is a critical feature; opening its breaker
        // puts the whole SDK in emergency mode.
        let breaker = supervisor.circuits.breaker("primary");
        for _ in 0..10 {
            breaker.record_error(&SdkError::Server { status: 500 }, 5);
        }

        let _ = supervisor.capture_error(ErrorCapture::new("during the storm")).await;
        assert_eq!(supervisor.sampling.rates().in_force(), SamplingRates::floors());
    }

    #[tokio::test]
    async fn config_cache_is_persisted_on_start() {
        let (_supervisor, _transport, _clock, backend) = started().await;
        let cached = backend.get(CONFIG_CACHE_KEY).await.expect("get").expect("cached");
        let config: Config = serde_json::from_str(&cached).expect("parse");
        assert_eq!(config.api_key, "test-key");
    }
}
