//! Groups queued items into upload batches bounded by count and bytes.

use crate::event::{ItemKind, StoredItem};
use std::collections::HashMap;
use std::sync::Mutex;

/// Hard batch bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_count: usize,
    pub max_bytes: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self { max_count: 50, max_bytes: 512 * 1024 }
    }
}

/// One upload unit. `oversize` marks a batch holding a single item that
/// exceeds `max_bytes` on its own; such batches get a tighter upload
/// timeout and shrink the stream's preferred batch size.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub items: Vec<StoredItem>,
    pub bytes: usize,
    pub oversize: bool,
}

impl Batch {
    pub fn ids(&self) -> Vec<u64> {
        self.items.iter().map(|i| i.id).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Stateful assembler: remembers a per-stream preferred size that
/// shrinks when oversize uploads are observed and creeps back up on
/// success.
#[derive(Debug)]
pub struct BatchAssembler {
    limits: BatchLimits,
    preferred: Mutex<HashMap<ItemKind, usize>>,
}

impl BatchAssembler {
    pub fn new(limits: BatchLimits) -> Self {
        Self { limits, preferred: Mutex::new(HashMap::new()) }
    }

    pub fn limits(&self) -> BatchLimits {
        self.limits
    }

    /// Pack a snapshot into batches, preserving input order.
    pub fn assemble(&self, kind: ItemKind, snapshot: Vec<StoredItem>) -> Vec<Batch> {
        let count_cap = self.preferred_count(kind);
        let mut batches = Vec::new();
        let mut current = Batch { items: Vec::new(), bytes: 0, oversize: false };

        for item in snapshot {
            if item.payload_bytes > self.limits.max_bytes {
                if !current.is_empty() {
                    batches.push(std::mem::replace(
                        &mut current,
                        Batch { items: Vec::new(), bytes: 0, oversize: false },
                    ));
                }
                let bytes = item.payload_bytes;
                batches.push(Batch { items: vec![item], bytes, oversize: true });
                continue;
            }

            let would_overflow = current.len() >= count_cap
                || current.bytes + item.payload_bytes > self.limits.max_bytes;
            if would_overflow && !current.is_empty() {
                batches.push(std::mem::replace(
                    &mut current,
                    Batch { items: Vec::new(), bytes: 0, oversize: false },
                ));
            }
            current.bytes += item.payload_bytes;
            current.items.push(item);
        }

        if !current.is_empty() {
            batches.push(current);
        }
        batches
    }

    /// Halve the preferred size for a stream after an oversize upload.
    pub fn note_oversize(&self, kind: ItemKind) {
        let mut preferred =
            self.preferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let current = *preferred.get(&kind).unwrap_or(&self.limits.max_count);
        preferred.insert(kind, (current / 2).max(1));
    }

    /// Let the preferred size recover after a clean upload.
    pub fn note_success(&self, kind: ItemKind) {
        let mut preferred =
            self.preferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(current) = preferred.get(&kind).copied() {
            let grown = (current + (current / 4).max(1)).min(self.limits.max_count);
            if grown == self.limits.max_count {
                preferred.remove(&kind);
            } else {
                preferred.insert(kind, grown);
            }
        }
    }

    fn preferred_count(&self, kind: ItemKind) -> usize {
        let preferred =
            self.preferred.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        *preferred.get(&kind).unwrap_or(&self.limits.max_count)
    }
}
