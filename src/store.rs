//! Durable queue of captured events.
//!
//! The in-memory index is the working set and the single source of
//! truth for ordering; the [`StorageBackend`] is a write-through copy
//! rebuilt into the index on startup. When the backing store fails the
//! queue keeps running memory-only and reports `durable() == false` so
//! the supervisor can shrink the caps.
//!
//! Item states are mutually exclusive: queued (in the index), in-flight
//! (checked out by a drain), acknowledged (removed), dead-lettered, or
//! evicted. Only the pipeline and the sync coordinator ack or evict;
//! producers only put.

use crate::clock::Clock;
use crate::config::StorageConfig;
use crate::diagnostics::{DiagnosticBus, DiagnosticEvent};
use crate::error::SdkError;
use crate::event::{Item, ItemKind, Priority, StoredItem, MAX_ITEM_BYTES};
use crate::storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const INDEX_KEY: &str = "revi.queue.index";
const ITEM_KEY_PREFIX: &str = "revi.queue.item:";
const DEAD_LETTER_KEY: &str = "revi.queue.deadletter";

/// Cap on the persisted dead-letter ring.
pub const DEAD_LETTER_MAX_BYTES: usize = 1024 * 1024;

/// Filter for [`DurableStore::peek`] and [`DurableStore::checkout`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PeekFilter {
    pub kind: Option<ItemKind>,
    pub min_priority: Option<Priority>,
}

impl PeekFilter {
    pub fn kind(kind: ItemKind) -> Self {
        Self { kind: Some(kind), min_priority: None }
    }

    fn matches(&self, item: &StoredItem) -> bool {
        self.kind.map_or(true, |k| item.kind == k)
            && self.min_priority.map_or(true, |p| item.priority >= p)
    }
}

/// An item that exceeded the attempt limit, parked out of the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: u64,
    pub kind: ItemKind,
    pub attempts: u32,
    pub dead_ms: u64,
    pub payload: Item,
}

/// Outcome of a [`DurableStore::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted_by_age: usize,
    pub evicted_by_cap: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexRecord {
    next_id: u64,
    entries: Vec<IndexEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexEntry {
    id: u64,
    kind: ItemKind,
    priority: Priority,
}

#[derive(Debug)]
struct StoreInner {
    caps: StorageConfig,
    items: BTreeMap<u64, StoredItem>,
    next_id: u64,
    bytes: usize,
    durable: bool,
    in_flight: HashSet<u64>,
    dead_letter: VecDeque<DeadLetter>,
    dead_letter_bytes: usize,
}

/// Append-only persistent queue with age/size eviction.
#[derive(Debug)]
pub struct DurableStore {
    clock: Arc<dyn Clock>,
    backend: Arc<dyn StorageBackend>,
    bus: DiagnosticBus,
    inner: Mutex<StoreInner>,
}

impl DurableStore {
    pub fn new(
        caps: StorageConfig,
        clock: Arc<dyn Clock>,
        backend: Arc<dyn StorageBackend>,
        bus: DiagnosticBus,
    ) -> Self {
        Self {
            clock,
            backend,
            bus,
            inner: Mutex::new(StoreInner {
                caps,
                items: BTreeMap::new(),
                next_id: 1,
                bytes: 0,
                durable: true,
                in_flight: HashSet::new(),
                dead_letter: VecDeque::new(),
                dead_letter_bytes: 0,
            }),
        }
    }

    /// Rebuild the in-memory index from the backing store. Returns the
    /// number of items recovered.
    pub async fn load(&self) -> usize {
        let index = match self.backend.get(INDEX_KEY).await {
            Ok(Some(text)) => match serde_json::from_str::<IndexRecord>(&text) {
                Ok(index) => index,
                Err(err) => {
                    self.bus.log(format!("queue index unreadable, starting empty: {err}"));
                    return 0;
                }
            },
            Ok(None) => return 0,
            Err(err) => {
                self.degrade(&err);
                return 0;
            }
        };

        let mut recovered = Vec::new();
        for entry in &index.entries {
            let key = format!("{ITEM_KEY_PREFIX}{}", entry.id);
            match self.backend.get(&key).await {
                Ok(Some(text)) => match serde_json::from_str::<StoredItem>(&text) {
                    Ok(item) => recovered.push(item),
                    Err(err) => {
                        self.bus.log(format!("dropping unreadable queued item {}: {err}", entry.id))
                    }
                },
                Ok(None) => {}
                Err(err) => {
                    self.degrade(&err);
                    break;
                }
            }
        }

        let dead = match self.backend.get(DEAD_LETTER_KEY).await {
            Ok(Some(text)) => serde_json::from_str::<Vec<DeadLetter>>(&text).unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut inner = self.lock();
        let max_seen = recovered.iter().map(|i| i.id).max().unwrap_or(0);
        inner.next_id = index.next_id.max(max_seen + 1).max(inner.next_id);
        for item in recovered {
            inner.bytes += item.payload_bytes;
            inner.items.insert(item.id, item);
        }
        inner.dead_letter_bytes =
            dead.iter().map(|d| serde_json::to_string(d).map(|s| s.len()).unwrap_or(0)).sum();
        inner.dead_letter = dead.into();
        let count = inner.items.len();
        drop(inner);

        tracing::debug!(count, "queue restored from backing store");
        count
    }

    /// Persist one item and return its assigned id. Runs eviction when
    /// the caps are exceeded so producers can never grow the queue
    /// unboundedly.
    pub async fn put(&self, payload: Item, priority: Priority) -> Result<u64, SdkError> {
        let serialized = serde_json::to_string(&payload)
            .map_err(|err| SdkError::Storage(format!("serialize payload: {err}")))?;
        let payload_bytes = serialized.len();
        if payload_bytes > MAX_ITEM_BYTES {
            return Err(SdkError::TooLarge { bytes: payload_bytes, limit: MAX_ITEM_BYTES });
        }

        let now = self.clock.now_millis();
        let (item, evicted, index_snapshot, durable) = {
            let mut inner = self.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            let item = StoredItem {
                id,
                kind: payload.kind(),
                priority,
                created_ms: now,
                attempt_count: 0,
                last_attempt_ms: None,
                payload_bytes,
                payload,
            };
            inner.bytes += payload_bytes;
            inner.items.insert(id, item.clone());
            let evicted = evict_over_caps(&mut inner);
            (item, evicted, snapshot_index(&inner), inner.durable)
        };

        if !evicted.is_empty() {
            self.bus.emit(DiagnosticEvent::QueueFull { dropped: evicted.len() });
        }

        if durable {
            let item_json = serde_json::to_string(&item)
                .map_err(|err| SdkError::Storage(format!("serialize item: {err}")))?;
            let key = format!("{ITEM_KEY_PREFIX}{}", item.id);
            if let Err(err) = self.write_through(&key, &item_json, &index_snapshot, &evicted).await
            {
                self.degrade(&err);
            }
        }

        Ok(item.id)
    }

    /// Read without consuming, ordered by `(priority desc, id asc)`,
    /// skipping items already checked out.
    pub fn peek(&self, filter: PeekFilter, limit: usize) -> Vec<StoredItem> {
        let inner = self.lock();
        select_ordered(&inner, filter, limit)
    }

    /// Like [`peek`](Self::peek) but marks the returned items in-flight
    /// so a concurrent drain cannot pick them up.
    pub fn checkout(&self, filter: PeekFilter, limit: usize) -> Vec<StoredItem> {
        let mut inner = self.lock();
        let selected = select_ordered(&inner, filter, limit);
        for item in &selected {
            inner.in_flight.insert(item.id);
        }
        selected
    }

    /// Return checked-out items to the queue, optionally recording a
    /// failed attempt.
    pub fn release(&self, ids: &[u64], record_attempt: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        for id in ids {
            inner.in_flight.remove(id);
            if record_attempt {
                if let Some(item) = inner.items.get_mut(id) {
                    item.attempt_count += 1;
                    item.last_attempt_ms = Some(now);
                }
            }
        }
    }

    /// Remove items permanently after a confirmed upload.
    pub async fn ack(&self, ids: &[u64]) {
        let (index_snapshot, durable) = {
            let mut inner = self.lock();
            for id in ids {
                inner.in_flight.remove(id);
                if let Some(item) = inner.items.remove(id) {
                    inner.bytes -= item.payload_bytes;
                }
            }
            (snapshot_index(&inner), inner.durable)
        };

        if durable {
            if let Err(err) = self.remove_items(ids, &index_snapshot).await {
                self.degrade(&err);
            }
        }
    }

    /// `(count, bytes)` of queued items (in-flight included).
    pub fn size(&self) -> (usize, usize) {
        let inner = self.lock();
        (inner.items.len(), inner.bytes)
    }

    /// Creation time of the oldest queued item.
    pub fn oldest_ms(&self) -> Option<u64> {
        let inner = self.lock();
        inner.items.values().map(|i| i.created_ms).min()
    }

    /// Evict items past `max_age_ms`, then drop oldest lowest-priority
    /// items until the queue is back under its caps.
    pub async fn sweep(&self) -> SweepReport {
        let now = self.clock.now_millis();
        let (report, removed, index_snapshot, durable) = {
            let mut inner = self.lock();
            let cutoff = now.saturating_sub(inner.caps.max_age_ms);
            let expired: Vec<u64> = inner
                .items
                .values()
                .filter(|i| i.created_ms < cutoff && !inner.in_flight.contains(&i.id))
                .map(|i| i.id)
                .collect();
            for id in &expired {
                if let Some(item) = inner.items.remove(id) {
                    inner.bytes -= item.payload_bytes;
                }
            }
            let capped = evict_over_caps(&mut inner);
            let report =
                SweepReport { evicted_by_age: expired.len(), evicted_by_cap: capped.len() };
            let mut removed = expired;
            removed.extend(capped);
            (report, removed, snapshot_index(&inner), inner.durable)
        };

        if report.evicted_by_cap > 0 {
            self.bus.emit(DiagnosticEvent::QueueFull { dropped: report.evicted_by_cap });
        }
        if report != SweepReport::default() {
            tracing::info!(
                by_age = report.evicted_by_age,
                by_cap = report.evicted_by_cap,
                "queue sweep evicted items"
            );
        }

        if durable && !removed.is_empty() {
            if let Err(err) = self.remove_items(&removed, &index_snapshot).await {
                self.degrade(&err);
            }
        }

        report
    }

    /// Park items that exceeded the attempt limit. They leave the main
    /// queue and land in the bounded dead-letter ring.
    pub async fn dead_letter(&self, items: Vec<StoredItem>) {
        if items.is_empty() {
            return;
        }
        let now = self.clock.now_millis();
        let parked: Vec<(u64, u32)> = items.iter().map(|i| (i.id, i.attempt_count)).collect();
        let ids: Vec<u64> = parked.iter().map(|(id, _)| *id).collect();
        let (ring_json, index_snapshot, durable) = {
            let mut inner = self.lock();
            for item in items {
                inner.in_flight.remove(&item.id);
                if let Some(removed) = inner.items.remove(&item.id) {
                    inner.bytes -= removed.payload_bytes;
                }
                let letter = DeadLetter {
                    id: item.id,
                    kind: item.kind,
                    attempts: item.attempt_count,
                    dead_ms: now,
                    payload: item.payload,
                };
                let letter_bytes =
                    serde_json::to_string(&letter).map(|s| s.len()).unwrap_or(0);
                inner.dead_letter_bytes += letter_bytes;
                inner.dead_letter.push_back(letter);
                while inner.dead_letter_bytes > DEAD_LETTER_MAX_BYTES {
                    match inner.dead_letter.pop_front() {
                        Some(oldest) => {
                            let freed =
                                serde_json::to_string(&oldest).map(|s| s.len()).unwrap_or(0);
                            inner.dead_letter_bytes =
                                inner.dead_letter_bytes.saturating_sub(freed);
                        }
                        None => break,
                    }
                }
            }
            let ring: Vec<&DeadLetter> = inner.dead_letter.iter().collect();
            let ring_json = serde_json::to_string(&ring).unwrap_or_else(|_| "[]".into());
            (ring_json, snapshot_index(&inner), inner.durable)
        };

        for (id, attempts) in parked {
            tracing::warn!(id, attempts, "item moved to dead-letter area");
            self.bus.emit(DiagnosticEvent::ItemDeadLettered { id, attempts });
        }

        if durable {
            if let Err(err) = self.remove_items(&ids, &index_snapshot).await {
                self.degrade(&err);
            }
            if let Err(err) = self.backend.set(DEAD_LETTER_KEY, &ring_json).await {
                self.degrade(&err);
            }
        }
    }

    /// Snapshot of the dead-letter ring, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letter.iter().cloned().collect()
    }

    /// Whether writes still reach the persistent backing.
    pub fn durable(&self) -> bool {
        self.lock().durable
    }

    /// Shrink the queue caps; used by the supervisor after the store
    /// degrades to memory-only.
    pub fn halve_caps(&self) {
        let mut inner = self.lock();
        inner.caps.max_items = (inner.caps.max_items / 2).max(1);
        inner.caps.max_bytes = (inner.caps.max_bytes / 2).max(1);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn degrade(&self, err: &SdkError) {
        let mut inner = self.lock();
        if inner.durable {
            inner.durable = false;
            drop(inner);
            tracing::warn!(%err, "storage backend failed, queue degraded to memory-only");
            self.bus.emit(DiagnosticEvent::StorageDegraded { reason: err.to_string() });
        }
    }

    async fn write_through(
        &self,
        item_key: &str,
        item_json: &str,
        index: &IndexRecord,
        evicted: &[u64],
    ) -> Result<(), SdkError> {
        self.backend.set(item_key, item_json).await?;
        for id in evicted {
            self.backend.remove(&format!("{ITEM_KEY_PREFIX}{id}")).await?;
        }
        self.persist_index(index).await
    }

    async fn remove_items(&self, ids: &[u64], index: &IndexRecord) -> Result<(), SdkError> {
        for id in ids {
            self.backend.remove(&format!("{ITEM_KEY_PREFIX}{id}")).await?;
        }
        self.persist_index(index).await
    }

    async fn persist_index(&self, index: &IndexRecord) -> Result<(), SdkError> {
        let text = serde_json::to_string(index)
            .map_err(|err| SdkError::Storage(format!("serialize index: {err}")))?;
        self.backend.set(INDEX_KEY, &text).await
    }
}

fn snapshot_index(inner: &StoreInner) -> IndexRecord {
    IndexRecord {
        next_id: inner.next_id,
        entries: inner
            .items
            .values()
            .map(|i| IndexEntry { id: i.id, kind: i.kind, priority: i.priority })
            .collect(),
    }
}

fn select_ordered(inner: &StoreInner, filter: PeekFilter, limit: usize) -> Vec<StoredItem> {
    let mut selected: Vec<&StoredItem> = inner
        .items
        .values()
        .filter(|i| filter.matches(i))
        .filter(|i| !inner.in_flight.contains(&i.id))
        .collect();
    selected.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
    selected.into_iter().take(limit).cloned().collect()
}

/// Drop oldest lowest-priority items until count and bytes fit the caps.
/// Returns evicted ids.
fn evict_over_caps(inner: &mut StoreInner) -> Vec<u64> {
    let mut evicted = Vec::new();
    while inner.items.len() > inner.caps.max_items || inner.bytes > inner.caps.max_bytes {
        let victim = inner
            .items
            .values()
            .filter(|i| !inner.in_flight.contains(&i.id))
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)))
            .map(|i| i.id);
        match victim {
            Some(id) => {
                if let Some(item) = inner.items.remove(&id) {
                    inner.bytes -= item.payload_bytes;
                }
                evicted.push(id);
            }
            None => break,
        }
    }
    evicted
}
