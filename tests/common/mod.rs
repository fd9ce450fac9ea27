//! Shared test doubles for the integration suite.
#![allow(dead_code)] // each test binary uses a different slice of the harness

use async_trait::async_trait;
use revi_sdk::{
    Endpoint, IngestResponse, ItemKind, ManualClock, SdkError, Transport,
};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// One recorded `post_batch` call.
#[derive(Debug, Clone)]
pub struct RecordedPost {
    pub kind: ItemKind,
    pub body: Value,
}

impl RecordedPost {
    /// Number of items carried in the body.
    pub fn item_count(&self) -> usize {
        ["errors", "events"]
            .iter()
            .find_map(|key| self.body[*key].as_array().map(Vec::len))
            .unwrap_or(1)
    }
}

/// Scripted ingest transport.
///
/// `post_batch` pops scripted results (accepting everything once the
/// script runs dry), `probe` pops per-endpoint `(latency_ms, ok)` pairs
/// advancing the shared manual clock, and the unload path records
/// bodies and answers with a switchable accept flag.
#[derive(Debug)]
pub struct FakeTransport {
    clock: ManualClock,
    results: Mutex<VecDeque<Result<IngestResponse, SdkError>>>,
    posts: Mutex<Vec<RecordedPost>>,
    probes: Mutex<HashMap<String, VecDeque<(u64, bool)>>>,
    accept_unload: AtomicBool,
    unload_bodies: Mutex<Vec<RecordedPost>>,
}

impl FakeTransport {
    pub fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            results: Mutex::new(VecDeque::new()),
            posts: Mutex::new(Vec::new()),
            probes: Mutex::new(HashMap::new()),
            accept_unload: AtomicBool::new(false),
            unload_bodies: Mutex::new(Vec::new()),
        }
    }

    pub fn push_result(&self, result: Result<IngestResponse, SdkError>) {
        self.results.lock().expect("results").push_back(result);
    }

    pub fn push_probe(&self, endpoint: &str, latency_ms: u64, ok: bool) {
        self.probes
            .lock()
            .expect("probes")
            .entry(endpoint.to_string())
            .or_default()
            .push_back((latency_ms, ok));
    }

    pub fn push_probes(&self, endpoint: &str, latency_ms: u64, ok: bool, n: usize) {
        for _ in 0..n {
            self.push_probe(endpoint, latency_ms, ok);
        }
    }

    pub fn posts(&self) -> Vec<RecordedPost> {
        self.posts.lock().expect("posts").clone()
    }

    pub fn set_accept_unload(&self, accept: bool) {
        self.accept_unload.store(accept, Ordering::SeqCst);
    }

    pub fn unload_bodies(&self) -> Vec<RecordedPost> {
        self.unload_bodies.lock().expect("unload").clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn post_batch(
        &self,
        _endpoint: &Endpoint,
        kind: ItemKind,
        body: &Value,
    ) -> Result<IngestResponse, SdkError> {
        let recorded = RecordedPost { kind, body: body.clone() };
        let count = recorded.item_count();
        self.posts.lock().expect("posts").push(recorded);
        self.results
            .lock()
            .expect("results")
            .pop_front()
            .unwrap_or_else(|| Ok(IngestResponse::accepted(count)))
    }

    async fn probe(&self, endpoint: &Endpoint) -> Result<(), SdkError> {
        let (latency_ms, ok) = self
            .probes
            .lock()
            .expect("probes")
            .get_mut(&endpoint.name)
            .and_then(|queue| queue.pop_front())
            .unwrap_or((5, true));
        self.clock.advance(latency_ms);
        if ok {
            Ok(())
        } else {
            Err(SdkError::Network("probe failed".into()))
        }
    }

    fn send_fire_and_forget(&self, _endpoint: &Endpoint, kind: ItemKind, body: Value) -> bool {
        self.unload_bodies.lock().expect("unload").push(RecordedPost { kind, body });
        self.accept_unload.load(Ordering::SeqCst)
    }
}
