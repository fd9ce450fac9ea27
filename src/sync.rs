//! Drains the durable queue after reconnect, foreground, backlog
//! pressure, or an explicit flush.
//!
//! A sync run checks the queue out in priority order, packs batches
//! sized to the observed network and battery conditions, and pushes
//! them through the delivery pipeline's upload path with bounded
//! concurrency. Progress streams to subscribers after every wave;
//! cancellation is cooperative between batches and partially-acked
//! batches stay acked.

use crate::batch::Batch;
use crate::cancel::AbortToken;
use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::diagnostics::{DiagnosticBus, DiagnosticEvent};
use crate::event::{ItemKind, Priority, StoredItem};
use crate::health::HealthMonitor;
use crate::pipeline::DeliveryPipeline;
use crate::sleeper::Sleeper;
use crate::store::{DurableStore, PeekFilter};
use crate::storage::StorageBackend;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const LAST_SYNC_KEY: &str = "revi.sync.last_ms";

/// Network quality below which waves are throttled.
const THROTTLE_QUALITY: f64 = 0.3;
const THROTTLE_PAUSE_MS: u64 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPhase {
    #[default]
    Preparing,
    Syncing,
    Completed,
    Failed,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Preparing => "preparing",
            SyncPhase::Syncing => "syncing",
            SyncPhase::Completed => "completed",
            SyncPhase::Failed => "failed",
        }
    }
}

/// Progress report streamed to subscribers during a run.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub total: usize,
    pub synced: usize,
    pub failed: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub bytes_transferred: usize,
    pub estimated_remaining_ms: u64,
}

/// Terminal summary of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub phase: SyncPhase,
    pub synced: usize,
    pub failed: usize,
}

/// Observed device conditions feeding the adaptive batch size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncConditions {
    /// 0 = unusable network, 1 = excellent.
    pub network_quality: f64,
    /// 0 = critically low battery, 1 = full or charging.
    pub battery: f64,
}

impl Default for SyncConditions {
    fn default() -> Self {
        Self { network_quality: 1.0, battery: 1.0 }
    }
}

/// Coordinates one queue drain from `preparing` to a terminal phase.
#[derive(Debug)]
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<DurableStore>,
    pipeline: Arc<DeliveryPipeline>,
    health: Arc<HealthMonitor>,
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    bus: DiagnosticBus,
    progress_tx: watch::Sender<SyncProgress>,
    run_lock: tokio::sync::Mutex<()>,
}

impl SyncCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SyncConfig,
        store: Arc<DurableStore>,
        pipeline: Arc<DeliveryPipeline>,
        health: Arc<HealthMonitor>,
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        bus: DiagnosticBus,
    ) -> Self {
        let (progress_tx, _) = watch::channel(SyncProgress::default());
        Self {
            config,
            store,
            pipeline,
            health,
            backend,
            clock,
            sleeper,
            bus,
            progress_tx,
            run_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to progress reports. The receiver always holds the
    /// latest report.
    pub fn subscribe(&self) -> watch::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    /// Completion time of the last successful run, if any.
    pub async fn last_sync_ms(&self) -> Option<u64> {
        match self.backend.get(LAST_SYNC_KEY).await {
            Ok(Some(text)) => text.parse().ok(),
            _ => None,
        }
    }

    /// Execute one sync run. Runs are serialized; a second caller waits
    /// for the first to finish, then drains whatever is left.
    pub async fn run(&self, conditions: SyncConditions, abort: AbortToken) -> SyncReport {
        let _guard = self.run_lock.lock().await;
        let started_ms = self.clock.now_millis();

        let mut progress = SyncProgress { phase: SyncPhase::Preparing, ..Default::default() };
        self.publish(progress);

        let Some(_endpoint) = self.health.primary() else {
            progress.phase = SyncPhase::Failed;
            self.publish(progress);
            return SyncReport { phase: SyncPhase::Failed, synced: 0, failed: 0 };
        };

        let (count, _) = self.store.size();
        let snapshot = self.store.checkout(PeekFilter::default(), count);
        if snapshot.is_empty() {
            self.finish_success(&mut progress, started_ms).await;
            return SyncReport { phase: SyncPhase::Completed, synced: 0, failed: 0 };
        }

        progress.total = snapshot.len();
        let batch_size = self.adaptive_batch_size(conditions);
        let mut pending = plan_batches(snapshot, batch_size, self.pipeline_max_bytes());
        progress.total_batches = pending.len();
        progress.phase = SyncPhase::Syncing;
        self.publish(progress);
        tracing::info!(
            total = progress.total,
            batches = progress.total_batches,
            batch_size,
            "sync run started"
        );

        let mut terminal_failure = false;
        while !pending.is_empty() {
            if abort.is_cancelled() {
                terminal_failure = true;
                break;
            }
            if self.clock.now_millis().saturating_sub(started_ms) > self.config.max_duration_ms {
                tracing::warn!("sync run exceeded its time bound");
                terminal_failure = true;
                break;
            }

            // Refresh the primary each wave so a mid-run failover takes
            // effect within one batch cycle.
            let Some(endpoint) = self.health.primary() else {
                terminal_failure = true;
                break;
            };

            let wave_len = pending.len().min(self.config.max_concurrent_batches);
            let wave: Vec<(ItemKind, Batch)> = pending.drain(..wave_len).collect();
            let uploads = futures::future::join_all(wave.iter().map(|(kind, batch)| {
                self.pipeline.upload_batch(&endpoint, *kind, batch, Some(abort.clone()))
            }))
            .await;

            for upload in uploads {
                progress.synced += upload.acked.len();
                progress.failed += upload.failed;
                progress.bytes_transferred += upload.bytes;
                progress.current_batch += 1;
            }
            progress.estimated_remaining_ms = estimate_remaining(
                self.clock.now_millis().saturating_sub(started_ms),
                progress.synced + progress.failed,
                progress.total,
            );
            self.publish(progress);

            if conditions.network_quality < THROTTLE_QUALITY {
                self.sleeper.sleep(Duration::from_millis(THROTTLE_PAUSE_MS)).await;
            }
        }

        // Hand back anything never attempted.
        let unattempted: Vec<u64> =
            pending.iter().flat_map(|(_, batch)| batch.ids()).collect();
        if !unattempted.is_empty() {
            self.store.release(&unattempted, false);
        }

        if terminal_failure || progress.failed > 0 {
            progress.phase = SyncPhase::Failed;
            self.publish(progress);
            tracing::warn!(
                synced = progress.synced,
                failed = progress.failed,
                "sync run failed"
            );
            SyncReport { phase: SyncPhase::Failed, synced: progress.synced, failed: progress.failed }
        } else {
            let synced = progress.synced;
            self.finish_success(&mut progress, started_ms).await;
            SyncReport { phase: SyncPhase::Completed, synced, failed: 0 }
        }
    }

    async fn finish_success(&self, progress: &mut SyncProgress, _started_ms: u64) {
        progress.phase = SyncPhase::Completed;
        progress.estimated_remaining_ms = 0;
        self.publish(*progress);
        let now = self.clock.now_millis();
        if let Err(err) = self.backend.set(LAST_SYNC_KEY, &now.to_string()).await {
            tracing::debug!(%err, "could not persist last sync time");
        }
        tracing::info!(synced = progress.synced, "sync run completed");
    }

    fn publish(&self, progress: SyncProgress) {
        let _ = self.progress_tx.send(progress);
        self.bus.emit(DiagnosticEvent::SyncProgress {
            phase: progress.phase.as_str(),
            total: progress.total,
            synced: progress.synced,
            failed: progress.failed,
            current_batch: progress.current_batch,
            total_batches: progress.total_batches,
            bytes_transferred: progress.bytes_transferred,
            estimated_remaining_ms: progress.estimated_remaining_ms,
        });
    }

    fn adaptive_batch_size(&self, conditions: SyncConditions) -> usize {
        let scaled = self.config.base_batch as f64
            * conditions.network_quality.clamp(0.0, 1.0)
            * conditions.battery.clamp(0.0, 1.0);
        (scaled as usize).clamp(self.config.min_batch, self.config.max_batch)
    }

    fn pipeline_max_bytes(&self) -> usize {
        crate::batch::BatchLimits::default().max_bytes
    }
}

/// Order a queue snapshot critical→low and chunk it into same-kind
/// batches bounded by `batch_size` and `max_bytes`.
fn plan_batches(
    mut snapshot: Vec<StoredItem>,
    batch_size: usize,
    max_bytes: usize,
) -> Vec<(ItemKind, Batch)> {
    snapshot.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

    let mut batches = Vec::new();
    let mut current: Vec<StoredItem> = Vec::new();
    let mut current_bytes = 0usize;
    let mut current_key: Option<(Priority, ItemKind)> = None;

    let flush =
        |batches: &mut Vec<(ItemKind, Batch)>, items: &mut Vec<StoredItem>, bytes: &mut usize| {
            if let Some(kind) = items.first().map(|i| i.kind) {
                batches.push((
                    kind,
                    Batch { items: std::mem::take(items), bytes: *bytes, oversize: false },
                ));
                *bytes = 0;
            }
        };

    for item in snapshot {
        let key = (item.priority, item.kind);
        let boundary = current_key != Some(key)
            || current.len() >= batch_size
            || current_bytes + item.payload_bytes > max_bytes;
        if boundary && !current.is_empty() {
            flush(&mut batches, &mut current, &mut current_bytes);
        }
        if item.payload_bytes > max_bytes {
            // A single huge item travels alone.
            let bytes = item.payload_bytes;
            batches.push((item.kind, Batch { items: vec![item], bytes, oversize: true }));
            current_key = None;
            continue;
        }
        current_key = Some(key);
        current_bytes += item.payload_bytes;
        current.push(item);
    }
    flush(&mut batches, &mut current, &mut current_bytes);
    batches
}

fn estimate_remaining(elapsed_ms: u64, done: usize, total: usize) -> u64 {
    if done == 0 || total <= done {
        return 0;
    }
    let per_item = elapsed_ms as f64 / done as f64;
    (per_item * (total - done) as f64) as u64
}
