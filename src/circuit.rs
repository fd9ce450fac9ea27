//! Per-feature circuit breakers with a rolling failure-rate window, and
//! the manager that composes them into degradation tiers.
//!
//! All transitions happen inside the recording functions; there is no
//! external write path into breaker state. Failure weights come from the
//! error taxonomy: timeouts count half, rate limiting and terminal
//! client errors count zero.

use crate::clock::Clock;
use crate::config::CircuitConfig;
use crate::diagnostics::{DiagnosticBus, DiagnosticEvent};
use crate::error::SdkError;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Dwell below the 20% threshold required to leave emergency mode.
const EMERGENCY_EXIT_DWELL_MS: u64 = 60_000;

/// Fraction of open critical features that triggers emergency mode.
const EMERGENCY_THRESHOLD: f64 = 0.4;

/// Fraction of open critical features that triggers progressive
/// degradation.
const PROGRESSIVE_THRESHOLD: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

/// Snapshot of one breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitMetrics {
    pub requests: u64,
    pub failures: u64,
    pub successes: u64,
    pub failure_rate: f64,
    pub avg_latency_ms: f64,
    pub state: CircuitState,
    pub opened_at_ms: Option<u64>,
    pub next_retry_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Observation {
    ts_ms: u64,
    weight: f64,
    latency_ms: u64,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window: VecDeque<Observation>,
    opened_at_ms: Option<u64>,
    next_retry_ms: Option<u64>,
    recovery_ms: u64,
    half_open_successes: u32,
    half_open_admitted: u32,
    requests: u64,
    failures: u64,
    successes: u64,
}

/// State machine `closed → open → half-open → closed` for one feature.
#[derive(Debug)]
pub struct CircuitBreaker {
    feature: String,
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    bus: DiagnosticBus,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        feature: impl Into<String>,
        config: CircuitConfig,
        clock: Arc<dyn Clock>,
        bus: DiagnosticBus,
    ) -> Self {
        let recovery_ms = config.recovery_time_ms;
        Self {
            feature: feature.into(),
            config,
            clock,
            bus,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::new(),
                opened_at_ms: None,
                next_retry_ms: None,
                recovery_ms,
                half_open_successes: 0,
                half_open_admitted: 0,
                requests: 0,
                failures: 0,
                successes: 0,
            }),
        }
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    /// Gate a request. From open, flips to half-open once the recovery
    /// deadline passes and admits this caller as a probe.
    pub fn try_admit(&self) -> Result<(), SdkError> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let next_retry = inner.next_retry_ms.unwrap_or(0);
                if now >= next_retry {
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    inner.half_open_admitted = 1;
                    Ok(())
                } else {
                    Err(SdkError::CircuitOpen {
                        feature: self.feature.clone(),
                        retry_in_ms: next_retry - now,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_admitted < self.config.success_threshold {
                    inner.half_open_admitted += 1;
                    Ok(())
                } else {
                    Err(SdkError::CircuitOpen { feature: self.feature.clone(), retry_in_ms: 0 })
                }
            }
        }
    }

    /// Record a successful operation.
    pub fn record_success(&self, latency_ms: u64) {
        self.record(0.0, latency_ms, true);
    }

    /// Record a failed operation, weighted by the error taxonomy.
    /// Synthetic outcomes (`CircuitOpen`, `Cancelled`) are ignored.
    pub fn record_error(&self, err: &SdkError, latency_ms: u64) {
        if let Some(weight) = err.circuit_weight() {
            self.record(weight, latency_ms, false);
        }
    }

    /// Run `op` through the breaker, recording latency and outcome.
    pub async fn execute<T, Fut, Op>(&self, op: Op) -> Result<T, SdkError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SdkError>>,
    {
        self.try_admit()?;
        let started = self.clock.now_millis();
        let result = op().await;
        let latency_ms = self.clock.now_millis().saturating_sub(started);
        match &result {
            Ok(_) => self.record_success(latency_ms),
            Err(err) => self.record_error(err, latency_ms),
        }
        result
    }

    /// Like [`execute`](Self::execute), but an open circuit routes to
    /// `fallback` instead of surfacing `CircuitOpen`.
    pub async fn execute_or_else<T, Fut, Op, Fb>(&self, op: Op, fallback: Fb) -> Result<T, SdkError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SdkError>>,
        Fb: FnOnce(SdkError) -> Result<T, SdkError>,
    {
        match self.try_admit() {
            Ok(()) => {
                let started = self.clock.now_millis();
                let result = op().await;
                let latency_ms = self.clock.now_millis().saturating_sub(started);
                match &result {
                    Ok(_) => self.record_success(latency_ms),
                    Err(err) => self.record_error(err, latency_ms),
                }
                result
            }
            Err(rejection) => fallback(rejection),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let now = self.clock.now_millis();
        let inner = self.lock();
        let (rate, avg_latency) = window_stats(&inner.window, now, self.config.window_ms);
        CircuitMetrics {
            requests: inner.requests,
            failures: inner.failures,
            successes: inner.successes,
            failure_rate: rate,
            avg_latency_ms: avg_latency,
            state: inner.state,
            opened_at_ms: inner.opened_at_ms,
            next_retry_ms: inner.next_retry_ms,
        }
    }

    fn record(&self, weight: f64, latency_ms: u64, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        inner.requests += 1;
        if success {
            inner.successes += 1;
        } else if weight > 0.0 {
            inner.failures += 1;
        }
        inner.window.push_back(Observation { ts_ms: now, weight, latency_ms });
        prune(&mut inner.window, now, self.config.window_ms);

        match inner.state {
            CircuitState::Closed => {
                let (rate, _) = window_stats(&inner.window, now, self.config.window_ms);
                if inner.window.len() >= self.config.min_requests
                    && rate >= self.config.max_failure_rate
                {
                    inner.recovery_ms = self.config.recovery_time_ms;
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                if !success && weight > 0.0 {
                    // Failed probe: back to open with a longer recovery.
                    inner.recovery_ms =
                        (inner.recovery_ms * 2).min(self.config.max_recovery_time_ms);
                    self.open(&mut inner, now);
                } else {
                    inner.half_open_successes += 1;
                    if inner.half_open_successes >= self.config.success_threshold {
                        inner.window.clear();
                        inner.opened_at_ms = None;
                        inner.next_retry_ms = None;
                        inner.recovery_ms = self.config.recovery_time_ms;
                        self.transition(&mut inner, CircuitState::Closed, now);
                    }
                }
            }
            CircuitState::Open => {
                // A straggler from before the trip; keep the observation,
                // no transition.
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: u64) {
        inner.opened_at_ms = Some(now);
        inner.next_retry_ms = Some(now + inner.recovery_ms);
        self.transition(inner, CircuitState::Open, now);
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState, _now: u64) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        if to == CircuitState::HalfOpen {
            inner.half_open_successes = 0;
            inner.half_open_admitted = 0;
        }
        match to {
            CircuitState::Open => tracing::error!(
                feature = %self.feature,
                recovery_ms = inner.recovery_ms,
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(feature = %self.feature, "circuit breaker half-open")
            }
            CircuitState::Closed => {
                tracing::info!(feature = %self.feature, "circuit breaker closed")
            }
        }
        self.bus.emit(DiagnosticEvent::CircuitStateChanged {
            feature: self.feature.clone(),
            from: from.as_str(),
            to: to.as_str(),
        });
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn prune(window: &mut VecDeque<Observation>, now: u64, window_ms: u64) {
    let cutoff = now.saturating_sub(window_ms);
    while window.front().is_some_and(|o| o.ts_ms < cutoff) {
        window.pop_front();
    }
}

fn window_stats(window: &VecDeque<Observation>, now: u64, window_ms: u64) -> (f64, f64) {
    let cutoff = now.saturating_sub(window_ms);
    let live: Vec<&Observation> = window.iter().filter(|o| o.ts_ms >= cutoff).collect();
    if live.is_empty() {
        return (0.0, 0.0);
    }
    let weight_sum: f64 = live.iter().map(|o| o.weight).sum();
    let latency_sum: u64 = live.iter().map(|o| o.latency_ms).sum();
    (weight_sum / live.len() as f64, latency_sum as f64 / live.len() as f64)
}

/// Degradation tier derived from the fraction of open critical features.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DegradationTier {
    #[default]
    Normal,
    /// 20–40% of critical features open: pause low-priority streams.
    Progressive,
    /// ≥40% open: sampling floors, stretched drain interval, only
    /// essential traffic.
    Emergency,
}

impl DegradationTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationTier::Normal => "normal",
            DegradationTier::Progressive => "progressive",
            DegradationTier::Emergency => "emergency",
        }
    }
}

#[derive(Debug)]
struct ManagerInner {
    breakers: HashMap<String, Arc<CircuitBreaker>>,
    critical: HashSet<String>,
    tier: DegradationTier,
    below_since_ms: Option<u64>,
}

/// Composes per-feature breakers and derives the global degradation
/// tier. Breakers are created lazily on first use and live for the
/// supervisor's lifetime.
#[derive(Debug)]
pub struct CircuitManager {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    bus: DiagnosticBus,
    inner: Mutex<ManagerInner>,
}

impl CircuitManager {
    pub fn new(config: CircuitConfig, clock: Arc<dyn Clock>, bus: DiagnosticBus) -> Self {
        Self {
            config,
            clock,
            bus,
            inner: Mutex::new(ManagerInner {
                breakers: HashMap::new(),
                critical: HashSet::new(),
                tier: DegradationTier::Normal,
                below_since_ms: None,
            }),
        }
    }

    /// Fetch or lazily create the breaker for a feature.
    pub fn breaker(&self, feature: &str) -> Arc<CircuitBreaker> {
        let mut inner = self.lock();
        if let Some(existing) = inner.breakers.get(feature) {
            return existing.clone();
        }
        let breaker = Arc::new(CircuitBreaker::new(
            feature,
            self.config.clone(),
            self.clock.clone(),
            self.bus.clone(),
        ));
        inner.breakers.insert(feature.to_string(), breaker.clone());
        breaker
    }

    /// Mark a feature as critical for tier evaluation (creates its
    /// breaker if needed).
    pub fn register_critical(&self, feature: &str) {
        self.breaker(feature);
        self.lock().critical.insert(feature.to_string());
    }

    /// Current tier, re-evaluated against breaker states. Pipelines call
    /// this after recording outcomes so tier changes track observations.
    pub fn tier(&self) -> DegradationTier {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        let critical_total = inner.critical.len();
        let open_fraction = if critical_total == 0 {
            0.0
        } else {
            let open = inner
                .critical
                .iter()
                .filter_map(|f| inner.breakers.get(f))
                .filter(|b| b.state() == CircuitState::Open)
                .count();
            open as f64 / critical_total as f64
        };

        let target = if open_fraction >= EMERGENCY_THRESHOLD {
            DegradationTier::Emergency
        } else if open_fraction >= PROGRESSIVE_THRESHOLD {
            DegradationTier::Progressive
        } else {
            DegradationTier::Normal
        };

        let current = inner.tier;
        let next = if current == DegradationTier::Emergency && target != DegradationTier::Emergency
        {
            // Hysteresis: emergency mode only lifts after a sustained
            // spell below the progressive threshold.
            if open_fraction < PROGRESSIVE_THRESHOLD {
                match inner.below_since_ms {
                    Some(since) if now.saturating_sub(since) >= EMERGENCY_EXIT_DWELL_MS => {
                        inner.below_since_ms = None;
                        DegradationTier::Normal
                    }
                    Some(_) => DegradationTier::Emergency,
                    None => {
                        inner.below_since_ms = Some(now);
                        DegradationTier::Emergency
                    }
                }
            } else {
                inner.below_since_ms = None;
                DegradationTier::Emergency
            }
        } else {
            if target == DegradationTier::Emergency {
                inner.below_since_ms = None;
            }
            target
        };

        if next != current {
            inner.tier = next;
            drop(inner);
            tracing::warn!(from = current.as_str(), to = next.as_str(), "degradation tier changed");
            self.bus.emit(DiagnosticEvent::DegradationTierChanged {
                from: current.as_str(),
                to: next.as_str(),
            });
            return next;
        }
        next
    }

    /// Snapshot of all breakers, sorted by feature name.
    pub fn snapshot(&self) -> Vec<(String, CircuitMetrics)> {
        let inner = self.lock();
        let mut entries: Vec<(String, CircuitMetrics)> =
            inner.breakers.iter().map(|(name, b)| (name.clone(), b.metrics())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
