//! Persistent key-value backing for the durable queue.
//!
//! The backing is best-effort: browser storage, a file, or nothing at
//! all. When writes start failing the store degrades to memory-only
//! rather than surfacing errors to producers.

use crate::error::SdkError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Best-effort persistent key-value area.
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, SdkError>;
    async fn set(&self, key: &str, value: &str) -> Result<(), SdkError>;
    async fn remove(&self, key: &str) -> Result<(), SdkError>;
    /// Keys under a prefix, in lexicographic order.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SdkError>;
}

/// In-memory backend used in tests and as the degraded fallback.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    map: Arc<Mutex<BTreeMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys; test helper.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, SdkError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), SdkError> {
        self.map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), SdkError> {
        self.map.lock().unwrap_or_else(std::sync::PoisonError::into_inner).remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, SdkError> {
        Ok(self
            .map
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
