//! Adaptive sampling decisions for candidate events.
//!
//! The effective rate per kind is `base × f(activity) × g(impact) ×
//! h(error_frequency)`: more activity raises it, observed performance
//! impact lowers it, and an error storm damps it logarithmically. Floors
//! guarantee minimum coverage (errors never sample below 0.25). The
//! decision itself is O(1) and touches nothing but counters.

use crate::clock::Clock;
use crate::event::ItemKind;
use arc_swap::ArcSwap;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

const ERROR_FREQUENCY_WINDOW_MS: u64 = 60_000;

/// Error candidates per minute above which the logarithmic damping
/// engages.
const ERROR_BURST_PER_MINUTE: f64 = 60.0;

/// Observed level of user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivityLevel {
    Idle,
    Low,
    #[default]
    Medium,
    High,
}

/// Base sample rates per kind; live-swappable under degradation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingRates {
    pub error: f64,
    pub session: f64,
    pub network: f64,
}

impl SamplingRates {
    /// The guaranteed minimum coverage per kind.
    pub const fn floors() -> Self {
        Self { error: 0.25, session: 0.01, network: 0.0 }
    }

    pub fn rate(&self, kind: ItemKind) -> f64 {
        match kind {
            ItemKind::Error => self.error,
            ItemKind::Session => self.session,
            ItemKind::Network => self.network,
        }
    }
}

impl Default for SamplingRates {
    fn default() -> Self {
        Self { error: 1.0, session: 1.0, network: 1.0 }
    }
}

/// Shared handle to the base rates in force.
///
/// Every capture reads the rates, so reads must stay lock-free; the
/// degradation controller replaces the whole set at once when a tier
/// change calls for it. Installing an unchanged set is free, which lets
/// callers re-assert the current tier on every capture without churn.
#[derive(Debug, Clone)]
pub struct LiveRates {
    current: Arc<ArcSwap<SamplingRates>>,
}

impl LiveRates {
    pub fn new(initial: SamplingRates) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    /// The rates in force right now.
    pub fn in_force(&self) -> SamplingRates {
        **self.current.load()
    }

    /// Put a new set of rates in force. No-op when nothing changed.
    pub fn install(&self, rates: SamplingRates) {
        if self.in_force() != rates {
            self.current.store(Arc::new(rates));
        }
    }

    /// Emergency degradation: every stream falls to its guaranteed
    /// minimum coverage.
    pub fn engage_floors(&self) {
        self.install(SamplingRates::floors());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Drop,
}

#[derive(Debug, Default)]
struct SamplingInner {
    activity: ActivityLevel,
    performance_impact: f64,
    error_times: VecDeque<u64>,
    accepted: u64,
    dropped: u64,
}

/// Decides whether a candidate event is admitted to the queue.
#[derive(Debug)]
pub struct SamplingController {
    rates: LiveRates,
    clock: Arc<dyn Clock>,
    inner: Mutex<SamplingInner>,
}

impl SamplingController {
    pub fn new(rates: LiveRates, clock: Arc<dyn Clock>) -> Self {
        Self { rates, clock, inner: Mutex::new(SamplingInner::default()) }
    }

    /// Live handle to the base rates; the degradation controller swaps
    /// reduced rates in through it.
    pub fn rates(&self) -> LiveRates {
        self.rates.clone()
    }

    pub fn set_activity(&self, level: ActivityLevel) {
        self.lock().activity = level;
    }

    /// Latest self-measured capture overhead, in `[0, 1]`.
    pub fn set_performance_impact(&self, impact: f64) {
        self.lock().performance_impact = impact.clamp(0.0, 1.0);
    }

    /// Accept/drop decision using the process RNG.
    pub fn decide(&self, kind: ItemKind) -> Decision {
        self.decide_with_rng(kind, &mut rand::rng())
    }

    /// Accept/drop decision with a caller-provided RNG (seeded in tests).
    pub fn decide_with_rng<R: Rng>(&self, kind: ItemKind, rng: &mut R) -> Decision {
        let rate = self.effective_rate(kind);
        let decision =
            if rng.random::<f64>() < rate { Decision::Accept } else { Decision::Drop };

        let mut inner = self.lock();
        match decision {
            Decision::Accept => inner.accepted += 1,
            Decision::Drop => inner.dropped += 1,
        }
        decision
    }

    /// The current effective rate for a kind, floors applied.
    pub fn effective_rate(&self, kind: ItemKind) -> f64 {
        let base = self.rates.in_force().rate(kind);
        let now = self.clock.now_millis();

        let mut inner = self.lock();
        if kind == ItemKind::Error {
            inner.error_times.push_back(now);
        }
        let cutoff = now.saturating_sub(ERROR_FREQUENCY_WINDOW_MS);
        while inner.error_times.front().is_some_and(|t| *t < cutoff) {
            inner.error_times.pop_front();
        }
        let frequency = inner.error_times.len() as f64;
        let activity = inner.activity;
        let impact = inner.performance_impact;
        drop(inner);

        let effective =
            base * activity_factor(activity) * impact_factor(impact) * frequency_factor(frequency);
        effective.clamp(floor(kind), 1.0)
    }

    /// `(accepted, dropped)` counters since start.
    pub fn counters(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.accepted, inner.dropped)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SamplingInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn floor(kind: ItemKind) -> f64 {
    SamplingRates::floors().rate(kind)
}

/// Increasing in activity.
fn activity_factor(level: ActivityLevel) -> f64 {
    match level {
        ActivityLevel::Idle => 0.5,
        ActivityLevel::Low => 0.75,
        ActivityLevel::Medium => 1.0,
        ActivityLevel::High => 1.25,
    }
}

/// Decreasing as the measured capture overhead rises.
fn impact_factor(impact: f64) -> f64 {
    (1.0 - 0.75 * impact).max(0.0)
}

/// Logarithmic damping once errors per minute exceed the burst
/// threshold; unity below it.
fn frequency_factor(per_minute: f64) -> f64 {
    if per_minute <= ERROR_BURST_PER_MINUTE {
        1.0
    } else {
        1.0 / (1.0 + (per_minute / ERROR_BURST_PER_MINUTE).ln())
    }
}
