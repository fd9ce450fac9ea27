//! SDK configuration surface.
//!
//! All knobs are plain data so the effective configuration can be cached
//! under `revi.config.cache` and replayed on an offline start. Hooks
//! (`before_send`) live on the runtime, not here. Constructors take the
//! two mandatory values; everything else defaults. `validate` runs once
//! at init and a failure prevents start.

use crate::error::SdkError;
use crate::transport::Endpoint;
use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_ITEMS: usize = 10_000;
pub const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;
pub const DEFAULT_MAX_AGE_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Staging,
    #[default]
    Production,
}

/// Retry loop tuning (see `RetryManager`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    /// Tokens refilled every `budget_window_ms`, shared across all keys.
    pub retry_budget: u32,
    pub budget_window_ms: u64,
    /// First-attempt deadline; grows by `timeout_multiplier` per attempt.
    pub timeout_ms: u64,
    pub timeout_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ratio: 0.3,
            retry_budget: 100,
            budget_window_ms: 60_000,
            timeout_ms: 10_000,
            timeout_multiplier: 1.25,
        }
    }
}

/// Circuit breaker tuning (see `CircuitBreaker`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub window_ms: u64,
    pub min_requests: usize,
    pub max_failure_rate: f64,
    pub recovery_time_ms: u64,
    pub max_recovery_time_ms: u64,
    pub success_threshold: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            min_requests: 10,
            max_failure_rate: 0.5,
            recovery_time_ms: 30_000,
            max_recovery_time_ms: 300_000,
            success_threshold: 3,
        }
    }
}

/// Health probe tuning (see `HealthMonitor`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub window_ms: u64,
    pub min_samples: usize,
    pub failure_threshold: u32,
    pub recovery_threshold: u32,
    pub degradation_threshold_ms: u64,
}

pub const MIN_HEALTH_INTERVAL_MS: u64 = 5_000;

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 5_000,
            window_ms: 300_000,
            min_samples: 5,
            failure_threshold: 3,
            recovery_threshold: 2,
            degradation_threshold_ms: 2_000,
        }
    }
}

/// Durable queue caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub max_items: usize,
    pub max_bytes: usize,
    pub max_age_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_items: DEFAULT_MAX_ITEMS,
            max_bytes: DEFAULT_MAX_BYTES,
            max_age_ms: DEFAULT_MAX_AGE_MS,
        }
    }
}

/// Sync coordinator tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub base_batch: usize,
    pub min_batch: usize,
    pub max_batch: usize,
    pub max_concurrent_batches: usize,
    pub max_duration_ms: u64,
    pub conflict_policy: ConflictPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_batch: 50,
            min_batch: 10,
            max_batch: 50,
            max_concurrent_batches: 3,
            max_duration_ms: 5 * 60 * 1000,
            conflict_policy: ConflictPolicy::TimestampWins,
        }
    }
}

/// How version conflicts reported by the server are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    ClientWins,
    ServerWins,
    #[default]
    TimestampWins,
}

/// Input redaction and URL filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivacyConfig {
    pub mask_inputs: bool,
    pub mask_passwords: bool,
    pub mask_credit_cards: bool,
    /// When non-empty, only URLs containing one of these fragments are
    /// captured. Deny wins over allow.
    pub allow_urls: Vec<String>,
    pub deny_urls: Vec<String>,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            mask_inputs: false,
            mask_passwords: true,
            mask_credit_cards: true,
            allow_urls: Vec::new(),
            deny_urls: Vec::new(),
        }
    }
}

/// Performance probes to enable in the capture front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub capture_web_vitals: bool,
    pub resource_timing: bool,
    pub navigation_timing: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self { capture_web_vitals: true, resource_timing: false, navigation_timing: true }
    }
}

/// Session replay redaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplayConfig {
    pub enabled: bool,
    pub mask_all_inputs: bool,
    pub mask_all_text: bool,
    pub block_selector: Option<String>,
    pub mask_selector: Option<String>,
}

/// Effective SDK configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub api_key: String,
    /// One entry per region; single-region setups have exactly one.
    pub endpoints: Vec<Endpoint>,
    pub environment: Environment,
    pub sample_rate: f64,
    pub session_sample_rate: f64,
    pub privacy: PrivacyConfig,
    pub performance: PerformanceConfig,
    pub replay: ReplayConfig,
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub health: HealthConfig,
    pub storage: StorageConfig,
    pub sync: SyncConfig,
}

impl Config {
    /// Single-region configuration with defaults everywhere else.
    pub fn new(api_key: impl Into<String>, api_url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            endpoints: vec![Endpoint::new("primary", api_url, 0)],
            environment: Environment::default(),
            sample_rate: 1.0,
            session_sample_rate: 1.0,
            privacy: PrivacyConfig::default(),
            performance: PerformanceConfig::default(),
            replay: ReplayConfig::default(),
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            health: HealthConfig::default(),
            storage: StorageConfig::default(),
            sync: SyncConfig::default(),
        }
    }

    /// Multi-region configuration; order defines election preference.
    pub fn with_regions(
        api_key: impl Into<String>,
        regions: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        let endpoints = regions
            .into_iter()
            .enumerate()
            .map(|(i, (name, url))| Endpoint::new(name, url, i as u32))
            .collect();
        Self { endpoints, ..Self::new(api_key, "") }
    }

    /// Validate the configuration. Called once at init; any error
    /// prevents the supervisor from starting.
    pub fn validate(&self) -> Result<(), SdkError> {
        if self.api_key.trim().is_empty() {
            return Err(SdkError::Config("api_key must not be empty".into()));
        }
        if self.endpoints.is_empty() {
            return Err(SdkError::Config("at least one ingest endpoint is required".into()));
        }
        for endpoint in &self.endpoints {
            if endpoint.base_url.trim().is_empty() {
                return Err(SdkError::Config(format!(
                    "endpoint {} has an empty base_url",
                    endpoint.name
                )));
            }
        }
        for (name, rate) in
            [("sample_rate", self.sample_rate), ("session_sample_rate", self.session_sample_rate)]
        {
            if !(0.0..=1.0).contains(&rate) {
                return Err(SdkError::Config(format!("{name} must be within 0..=1, got {rate}")));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(SdkError::Config("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_ratio) {
            return Err(SdkError::Config("retry.jitter_ratio must be within 0..=1".into()));
        }
        if !(0.0..=1.0).contains(&self.circuit.max_failure_rate) {
            return Err(SdkError::Config("circuit.max_failure_rate must be within 0..=1".into()));
        }
        if self.health.interval_ms < MIN_HEALTH_INTERVAL_MS {
            return Err(SdkError::Config(format!(
                "health.interval_ms must be at least {MIN_HEALTH_INTERVAL_MS}"
            )));
        }
        if self.sync.min_batch == 0 || self.sync.min_batch > self.sync.max_batch {
            return Err(SdkError::Config(
                "sync.min_batch must be > 0 and <= sync.max_batch".into(),
            ));
        }
        if self.storage.max_items == 0 || self.storage.max_bytes == 0 {
            return Err(SdkError::Config("storage caps must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::new("key", "https://ingest.example");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_api_key_is_rejected() {
        let config = Config::new("  ", "https://ingest.example");
        assert!(matches!(config.validate(), Err(SdkError::Config(_))));
    }

    #[test]
    fn out_of_range_sample_rate_is_rejected() {
        let mut config = Config::new("key", "https://ingest.example");
        config.sample_rate = 1.5;
        assert!(matches!(config.validate(), Err(SdkError::Config(_))));
    }

    #[test]
    fn probe_interval_floor_is_enforced() {
        let mut config = Config::new("key", "https://ingest.example");
        config.health.interval_ms = 1_000;
        assert!(matches!(config.validate(), Err(SdkError::Config(_))));
    }

    #[test]
    fn multi_region_preserves_order_as_priority() {
        let config = Config::with_regions(
            "key",
            [
                ("us-east".to_string(), "https://us.ingest.example".to_string()),
                ("eu-west".to_string(), "https://eu.ingest.example".to_string()),
            ],
        );
        assert_eq!(config.endpoints.len(), 2);
        assert_eq!(config.endpoints[0].priority, 0);
        assert_eq!(config.endpoints[1].priority, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_round_trips_for_the_cache() {
        let config = Config::new("key", "https://ingest.example");
        let text = serde_json::to_string(&config).expect("serialize");
        let back: Config = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, config);
    }
}
