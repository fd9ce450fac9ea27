//! Endpoint health monitoring and multi-region primary election.
//!
//! Each registered endpoint gets a bounded probe/outcome history over a
//! sliding window. Active probes run on a timer; passive signals from
//! the delivery pipeline feed the same window. Election picks the
//! lowest-priority-value healthy region; switching away from a sick
//! primary needs it unhealthy for `failure_threshold` consecutive
//! checks, and any switch target must have been healthy for
//! `recovery_threshold` consecutive checks.

use crate::cancel::AbortToken;
use crate::clock::Clock;
use crate::config::HealthConfig;
use crate::diagnostics::{DiagnosticBus, DiagnosticEvent};
use crate::sleeper::Sleeper;
use crate::transport::{Endpoint, Transport};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const FAILOVER_HISTORY_CAP: usize = 50;
const TREND_WINDOWS: usize = 3;
const TREND_SLACK: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Snapshot of one endpoint's health.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthMetrics {
    pub status: HealthStatus,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub availability: f64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub uptime_ms: u64,
    pub downtime_ms: u64,
    pub trend: Trend,
    pub confidence: f64,
}

/// One recorded primary change.
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverRecord {
    pub ts_ms: u64,
    pub from: Option<String>,
    pub to: String,
    pub cause: String,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    ts_ms: u64,
    ok: bool,
    latency_ms: u64,
}

#[derive(Debug)]
struct EndpointHealth {
    endpoint: Endpoint,
    samples: VecDeque<Sample>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    status: HealthStatus,
    healthy_checks: u32,
    unhealthy_checks: u32,
    p95_history: VecDeque<u64>,
    uptime_ms: u64,
    downtime_ms: u64,
    last_record_ms: Option<u64>,
}

impl EndpointHealth {
    fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            samples: VecDeque::new(),
            consecutive_failures: 0,
            consecutive_successes: 0,
            status: HealthStatus::Unknown,
            healthy_checks: 0,
            unhealthy_checks: 0,
            p95_history: VecDeque::new(),
            uptime_ms: 0,
            downtime_ms: 0,
            last_record_ms: None,
        }
    }
}

#[derive(Debug)]
struct MonitorInner {
    endpoints: Vec<EndpointHealth>,
    primary: Option<String>,
    failovers: VecDeque<FailoverRecord>,
}

/// Periodic active probing plus passive outcome recording per endpoint.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    transport: Arc<dyn Transport>,
    bus: DiagnosticBus,
    inner: Mutex<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(
        config: HealthConfig,
        endpoints: Vec<Endpoint>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        transport: Arc<dyn Transport>,
        bus: DiagnosticBus,
    ) -> Self {
        Self {
            config,
            clock,
            sleeper,
            transport,
            bus,
            inner: Mutex::new(MonitorInner {
                endpoints: endpoints.into_iter().map(EndpointHealth::new).collect(),
                primary: None,
                failovers: VecDeque::new(),
            }),
        }
    }

    /// Probe loop; runs until the shutdown token fires.
    pub async fn run(&self, shutdown: AbortToken) {
        let interval =
            Duration::from_millis(self.config.interval_ms.max(crate::config::MIN_HEALTH_INTERVAL_MS));
        while !shutdown.is_cancelled() {
            self.check_all().await;
            self.sleeper.sleep(interval).await;
        }
    }

    /// One probe pass over every endpoint, followed by election.
    pub async fn check_all(&self) {
        let endpoints: Vec<Endpoint> =
            self.lock().endpoints.iter().map(|e| e.endpoint.clone()).collect();

        for endpoint in endpoints {
            let started = self.clock.now_millis();
            let outcome = tokio::time::timeout(
                Duration::from_millis(self.config.timeout_ms),
                self.transport.probe(&endpoint),
            )
            .await;
            let (ok, latency_ms) = match outcome {
                Ok(Ok(())) => (true, self.clock.now_millis().saturating_sub(started)),
                Ok(Err(_)) => (false, self.clock.now_millis().saturating_sub(started)),
                Err(_) => (false, self.config.timeout_ms),
            };
            self.record_result(&endpoint.name, ok, latency_ms);
            self.finish_check(&endpoint.name);
        }

        self.elect_primary();
    }

    /// Passive signal from production traffic; feeds the same window as
    /// active probes but does not count as a check boundary.
    pub fn record_result(&self, endpoint: &str, ok: bool, latency_ms: u64) {
        let now = self.clock.now_millis();
        let window_ms = self.config.window_ms;
        let mut inner = self.lock();
        let Some(eh) = inner.endpoints.iter_mut().find(|e| e.endpoint.name == endpoint) else {
            return;
        };

        if let Some(last) = eh.last_record_ms {
            let delta = now.saturating_sub(last);
            if ok {
                eh.uptime_ms += delta;
            } else {
                eh.downtime_ms += delta;
            }
        }
        eh.last_record_ms = Some(now);

        eh.samples.push_back(Sample { ts_ms: now, ok, latency_ms });
        let cutoff = now.saturating_sub(window_ms);
        while eh.samples.front().is_some_and(|s| s.ts_ms < cutoff) {
            eh.samples.pop_front();
        }

        if ok {
            eh.consecutive_successes += 1;
            eh.consecutive_failures = 0;
        } else {
            eh.consecutive_failures += 1;
            eh.consecutive_successes = 0;
        }
    }

    /// Health metrics for one endpoint.
    pub fn metrics(&self, endpoint: &str) -> Option<HealthMetrics> {
        let inner = self.lock();
        let eh = inner.endpoints.iter().find(|e| e.endpoint.name == endpoint)?;
        Some(self.metrics_for(eh))
    }

    /// Currently elected primary endpoint, falling back to the most
    /// preferred configured endpoint before any election has happened.
    pub fn primary(&self) -> Option<Endpoint> {
        let inner = self.lock();
        if let Some(name) = &inner.primary {
            if let Some(eh) = inner.endpoints.iter().find(|e| &e.endpoint.name == name) {
                return Some(eh.endpoint.clone());
            }
        }
        inner.endpoints.iter().min_by_key(|e| e.endpoint.priority).map(|e| e.endpoint.clone())
    }

    /// Recorded primary changes, oldest first.
    pub fn failover_history(&self) -> Vec<FailoverRecord> {
        self.lock().failovers.iter().cloned().collect()
    }

    /// Close a check boundary for an endpoint: classify, update status
    /// streaks, snapshot p95 for trend detection.
    fn finish_check(&self, endpoint: &str) {
        let mut inner = self.lock();
        let config = self.config.clone();
        let now = self.clock.now_millis();
        let Some(eh) = inner.endpoints.iter_mut().find(|e| e.endpoint.name == endpoint) else {
            return;
        };

        let status = classify(eh, &config, now);
        eh.status = status;
        match status {
            HealthStatus::Healthy => {
                eh.healthy_checks += 1;
                eh.unhealthy_checks = 0;
            }
            HealthStatus::Unhealthy => {
                eh.unhealthy_checks += 1;
                eh.healthy_checks = 0;
            }
            HealthStatus::Degraded | HealthStatus::Unknown => {
                eh.healthy_checks = 0;
                eh.unhealthy_checks = 0;
            }
        }

        let p95 = percentile(&latencies(eh, now, config.window_ms), 0.95);
        eh.p95_history.push_back(p95);
        while eh.p95_history.len() > TREND_WINDOWS {
            eh.p95_history.pop_front();
        }
    }

    fn elect_primary(&self) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();

        let current = inner.primary.clone();
        let current_state = current.as_ref().and_then(|name| {
            inner
                .endpoints
                .iter()
                .find(|e| &e.endpoint.name == name)
                .map(|e| (e.status, e.unhealthy_checks, e.endpoint.priority))
        });

        // Eligible switch targets: healthy long enough, best priority
        // first.
        let mut candidates: Vec<(&EndpointHealth, u32)> = inner
            .endpoints
            .iter()
            .filter(|e| e.status == HealthStatus::Healthy)
            .filter(|e| e.healthy_checks >= self.config.recovery_threshold)
            .map(|e| (e, e.endpoint.priority))
            .collect();
        candidates.sort_by_key(|(_, priority)| *priority);
        let candidate = candidates.first().map(|(e, _)| e.endpoint.name.clone());
        drop(candidates);

        let decision = match (&current, current_state) {
            // No primary yet: elect the best candidate, or the most
            // preferred configured endpoint while everything is still
            // unknown.
            (None, _) | (Some(_), None) => candidate
                .or_else(|| {
                    inner
                        .endpoints
                        .iter()
                        .min_by_key(|e| e.endpoint.priority)
                        .map(|e| e.endpoint.name.clone())
                })
                .filter(|next| current.as_ref() != Some(next))
                .map(|next| (next, "initial")),
            (Some(current_name), Some((status, unhealthy_checks, current_priority))) => {
                let candidate_entry = candidate
                    .as_ref()
                    .and_then(|c| inner.endpoints.iter().find(|e| &e.endpoint.name == c));
                match candidate_entry {
                    Some(cand) if &cand.endpoint.name != current_name => {
                        let primary_failed = status == HealthStatus::Unhealthy
                            && (unhealthy_checks >= self.config.failure_threshold
                                || consecutive_failures_of(&inner, current_name)
                                    >= self.config.failure_threshold);
                        if primary_failed {
                            Some((cand.endpoint.name.clone(), "unhealthy"))
                        } else if cand.endpoint.priority < current_priority
                            && status != HealthStatus::Unknown
                        {
                            // A more preferred region recovered.
                            Some((cand.endpoint.name.clone(), "recovered"))
                        } else {
                            None
                        }
                    }
                    _ => None,
                }
            }
        };

        if let Some((next, cause)) = decision {
            let record = FailoverRecord {
                ts_ms: now,
                from: current.clone(),
                to: next.clone(),
                cause: cause.to_string(),
            };
            if inner.failovers.len() == FAILOVER_HISTORY_CAP {
                inner.failovers.pop_front();
            }
            inner.failovers.push_back(record);
            inner.primary = Some(next.clone());
            drop(inner);
            tracing::warn!(from = ?current, to = %next, cause, "primary region changed");
            self.bus.emit(DiagnosticEvent::PrimaryChanged { from: current, to: next, cause: cause.to_string() });
        }
    }

    fn metrics_for(&self, eh: &EndpointHealth) -> HealthMetrics {
        let now = self.clock.now_millis();
        let lat = latencies(eh, now, self.config.window_ms);
        let live: Vec<&Sample> = eh
            .samples
            .iter()
            .filter(|s| s.ts_ms >= now.saturating_sub(self.config.window_ms))
            .collect();
        let availability = if live.is_empty() {
            0.0
        } else {
            live.iter().filter(|s| s.ok).count() as f64 / live.len() as f64
        };

        HealthMetrics {
            status: eh.status,
            p50_ms: percentile(&lat, 0.50),
            p95_ms: percentile(&lat, 0.95),
            p99_ms: percentile(&lat, 0.99),
            availability,
            consecutive_failures: eh.consecutive_failures,
            consecutive_successes: eh.consecutive_successes,
            uptime_ms: eh.uptime_ms,
            downtime_ms: eh.downtime_ms,
            trend: trend(&eh.p95_history),
            confidence: (live.len() as f64 / self.config.min_samples as f64).min(1.0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn consecutive_failures_of(inner: &MonitorInner, name: &str) -> u32 {
    inner
        .endpoints
        .iter()
        .find(|e| e.endpoint.name == name)
        .map(|e| e.consecutive_failures)
        .unwrap_or(0)
}

fn latencies(eh: &EndpointHealth, now: u64, window_ms: u64) -> Vec<u64> {
    let cutoff = now.saturating_sub(window_ms);
    let mut lat: Vec<u64> =
        eh.samples.iter().filter(|s| s.ts_ms >= cutoff).map(|s| s.latency_ms).collect();
    lat.sort_unstable();
    lat
}

fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}

fn trend(p95_history: &VecDeque<u64>) -> Trend {
    if p95_history.len() < TREND_WINDOWS {
        return Trend::Stable;
    }
    let first = p95_history.front().copied().unwrap_or(0) as f64;
    let last = p95_history.back().copied().unwrap_or(0) as f64;
    if last < first * (1.0 - TREND_SLACK) {
        Trend::Improving
    } else if last > first * (1.0 + TREND_SLACK) {
        Trend::Degrading
    } else {
        Trend::Stable
    }
}

fn classify(eh: &EndpointHealth, config: &HealthConfig, now: u64) -> HealthStatus {
    let cutoff = now.saturating_sub(config.window_ms);
    let live: Vec<&Sample> = eh.samples.iter().filter(|s| s.ts_ms >= cutoff).collect();
    if live.len() < config.min_samples {
        return HealthStatus::Unknown;
    }
    let success_rate = live.iter().filter(|s| s.ok).count() as f64 / live.len() as f64;
    if success_rate < 0.7 || eh.consecutive_failures >= config.failure_threshold {
        return HealthStatus::Unhealthy;
    }
    let mut lat: Vec<u64> = live.iter().map(|s| s.latency_ms).collect();
    lat.sort_unstable();
    if success_rate < 0.95 || percentile(&lat, 0.95) > config.degradation_threshold_ms {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}
