//! Per-key retry loop with jittered exponential backoff, attempt
//! deadlines, a shared time-windowed retry budget, and process-wide
//! rate-limit honouring.
//!
//! The budget is the storm brake: first attempts are always free, every
//! retry withdraws one token from a bucket refilled each window, and an
//! empty bucket surfaces the last error immediately. Critical uploads
//! may overdraw by 10%. A `Retry-After` hint from any key gates every
//! key until it expires.

use crate::backoff::Backoff;
use crate::cancel::AbortToken;
use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::SdkError;
use crate::event::Priority;
use crate::jitter::Jitter;
use crate::sleeper::Sleeper;
use crate::transport::IngestResponse;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Fractional overdraw allowed for critical-priority retries.
const CRITICAL_OVERAGE: f64 = 0.10;

/// Per-key retry statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub avg_delay_ms: f64,
    /// Number of backoff delays folded into `avg_delay_ms`.
    pub delay_samples: u64,
    pub budget_used: u64,
    pub last_success_ms: Option<u64>,
    pub last_failure_ms: Option<u64>,
}

impl RetryStats {
    fn record_delay(&mut self, delay_ms: u64) {
        let total = self.avg_delay_ms * self.delay_samples as f64 + delay_ms as f64;
        self.delay_samples += 1;
        self.avg_delay_ms = total / self.delay_samples as f64;
    }
}

/// Options for one [`RetryManager::execute`] call.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    pub priority: Priority,
    /// First-attempt deadline; later attempts grow by the configured
    /// multiplier. Zero means "use the configured default".
    pub timeout: Duration,
    pub payload_bytes: Option<usize>,
    /// Calls sharing a dedup key share one in-flight attempt loop.
    pub dedup_key: Option<String>,
    pub abort: Option<AbortToken>,
}

impl RetryOptions {
    pub fn new(priority: Priority, timeout: Duration) -> Self {
        Self { priority, timeout, ..Self::default() }
    }
}

type SharedResult = Option<Result<IngestResponse, SdkError>>;

#[derive(Debug)]
struct BudgetState {
    window_start_ms: u64,
    used: u32,
}

#[derive(Debug)]
struct RetryInner {
    budget: BudgetState,
    rate_limited_until_ms: u64,
    stats: HashMap<String, RetryStats>,
    in_flight: HashMap<String, watch::Receiver<SharedResult>>,
}

/// Shared retry executor for all upload keys.
#[derive(Debug)]
pub struct RetryManager {
    config: RetryConfig,
    backoff: Backoff,
    jitter: Jitter,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    inner: Mutex<RetryInner>,
}

impl RetryManager {
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        let backoff = Backoff::exponential(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        );
        let jitter = if config.jitter_ratio == 0.0 {
            Jitter::None
        } else {
            Jitter::full(config.jitter_ratio)
        };
        Self {
            config,
            backoff,
            jitter,
            clock,
            sleeper,
            inner: Mutex::new(RetryInner {
                budget: BudgetState { window_start_ms: 0, used: 0 },
                rate_limited_until_ms: 0,
                stats: HashMap::new(),
                in_flight: HashMap::new(),
            }),
        }
    }

    /// Run `op` under the retry policy for `key`.
    pub async fn execute<Op, Fut>(
        &self,
        key: &str,
        mut op: Op,
        opts: RetryOptions,
    ) -> Result<IngestResponse, SdkError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<IngestResponse, SdkError>>,
    {
        let registration = match &opts.dedup_key {
            Some(dedup_key) => match self.join_or_register(dedup_key) {
                Registration::Joined(rx) => return await_shared(rx).await,
                Registration::Registered(tx) => Some((dedup_key.clone(), tx)),
            },
            None => None,
        };

        let result = self.attempt_loop(key, &mut op, &opts).await;

        if let Some((dedup_key, tx)) = registration {
            let _ = tx.send(Some(result.clone()));
            self.lock().in_flight.remove(&dedup_key);
        }
        result
    }

    /// Effective retry tuning.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Snapshot the statistics for one key.
    pub fn stats(&self, key: &str) -> RetryStats {
        self.lock().stats.get(key).cloned().unwrap_or_default()
    }

    /// Remaining tokens in the current budget window.
    pub fn budget_remaining(&self) -> u32 {
        let mut inner = self.lock();
        let now = self.clock.now_millis();
        refill(&mut inner.budget, now, self.config.budget_window_ms);
        self.config.retry_budget.saturating_sub(inner.budget.used)
    }

    /// When the process-wide rate-limit gate lifts, if engaged.
    pub fn rate_limited_until(&self) -> Option<u64> {
        let until = self.lock().rate_limited_until_ms;
        (until > self.clock.now_millis()).then_some(until)
    }

    async fn attempt_loop<Op, Fut>(
        &self,
        key: &str,
        op: &mut Op,
        opts: &RetryOptions,
    ) -> Result<IngestResponse, SdkError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<IngestResponse, SdkError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let base_timeout_ms = if opts.timeout.is_zero() {
            self.config.timeout_ms
        } else {
            opts.timeout.as_millis() as u64
        };

        let mut attempts_made = 0u64;
        let mut budget_spent = 0u64;
        let mut delays: Vec<u64> = Vec::new();
        let mut last_err = SdkError::Cancelled;

        for attempt in 1..=max_attempts {
            if opts.abort.as_ref().is_some_and(AbortToken::is_cancelled) {
                last_err = SdkError::Cancelled;
                break;
            }

            self.wait_for_rate_limit_gate().await;

            let timeout_ms = (base_timeout_ms as f64
                * self.config.timeout_multiplier.powi(attempt as i32 - 1))
                as u64;
            let started_ms = self.clock.now_millis();
            attempts_made += 1;

            let outcome = match tokio::time::timeout(Duration::from_millis(timeout_ms), op()).await
            {
                Ok(result) => result,
                Err(_) => Err(SdkError::Timeout {
                    elapsed_ms: self
                        .clock
                        .now_millis()
                        .saturating_sub(started_ms)
                        .max(timeout_ms),
                    timeout_ms,
                }),
            };

            match outcome {
                Ok(response) => {
                    self.finish(key, attempts_made, budget_spent, &delays, true);
                    return Ok(response);
                }
                Err(err) => {
                    if let SdkError::RateLimited { retry_after_ms } = &err {
                        self.engage_rate_limit_gate(retry_after_ms.unwrap_or(self.config.base_delay_ms));
                    }

                    let out_of_attempts = attempt == max_attempts;
                    if !err.is_retryable() || out_of_attempts {
                        last_err = err;
                        break;
                    }
                    if !self.try_consume_budget(opts.priority) {
                        tracing::warn!(key, "retry budget exhausted, surfacing last error");
                        last_err = err;
                        break;
                    }
                    budget_spent += 1;

                    let delay = self.jitter.apply(self.backoff.delay(attempt));
                    delays.push(delay.as_millis() as u64);
                    tracing::debug!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, backing off"
                    );
                    last_err = err;
                    self.sleeper.sleep(delay).await;
                }
            }
        }

        self.finish(key, attempts_made, budget_spent, &delays, false);
        Err(last_err)
    }

    async fn wait_for_rate_limit_gate(&self) {
        let now = self.clock.now_millis();
        let until = self.lock().rate_limited_until_ms;
        if until > now {
            self.sleeper.sleep(Duration::from_millis(until - now)).await;
        }
    }

    fn engage_rate_limit_gate(&self, hint_ms: u64) {
        let until = self.clock.now_millis() + hint_ms;
        let mut inner = self.lock();
        if until > inner.rate_limited_until_ms {
            inner.rate_limited_until_ms = until;
            drop(inner);
            tracing::info!(hint_ms, "rate limited, suspending all retries");
        }
    }

    fn try_consume_budget(&self, priority: Priority) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        refill(&mut inner.budget, now, self.config.budget_window_ms);

        let cap = if priority == Priority::Critical {
            self.config.retry_budget
                + (self.config.retry_budget as f64 * CRITICAL_OVERAGE).ceil() as u32
        } else {
            self.config.retry_budget
        };
        if inner.budget.used < cap {
            inner.budget.used += 1;
            true
        } else {
            false
        }
    }

    fn finish(
        &self,
        key: &str,
        attempts_made: u64,
        budget_spent: u64,
        delays: &[u64],
        success: bool,
    ) {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        let stats = inner.stats.entry(key.to_string()).or_default();
        stats.total_attempts += attempts_made;
        stats.budget_used += budget_spent;
        for delay in delays {
            stats.record_delay(*delay);
        }
        if success {
            stats.last_success_ms = Some(now);
            if attempts_made > 1 {
                stats.successful_retries += 1;
            }
        } else {
            stats.last_failure_ms = Some(now);
            if attempts_made > 1 {
                stats.failed_retries += 1;
            }
        }
    }

    fn join_or_register(&self, dedup_key: &str) -> Registration {
        let mut inner = self.lock();
        if let Some(rx) = inner.in_flight.get(dedup_key) {
            return Registration::Joined(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        inner.in_flight.insert(dedup_key.to_string(), rx);
        Registration::Registered(tx)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RetryInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

enum Registration {
    Joined(watch::Receiver<SharedResult>),
    Registered(watch::Sender<SharedResult>),
}

async fn await_shared(
    mut rx: watch::Receiver<SharedResult>,
) -> Result<IngestResponse, SdkError> {
    loop {
        let current = rx.borrow().clone();
        if let Some(result) = current {
            return result;
        }
        if rx.changed().await.is_err() {
            let last = rx.borrow().clone();
            return last.unwrap_or(Err(SdkError::Cancelled));
        }
    }
}

fn refill(budget: &mut BudgetState, now: u64, window_ms: u64) {
    if now.saturating_sub(budget.window_start_ms) >= window_ms {
        budget.window_start_ms = now;
        budget.used = 0;
    }
}
