//! Error taxonomy for the delivery pipeline.
//!
//! Every failure surfaced by the transport, storage, or policy layers is
//! classified into one `SdkError` variant. Classification drives three
//! decisions: whether the retry loop may try again, how heavily the
//! failure counts toward a circuit breaker's failure rate, and whether a
//! queued item should be dropped as unprocessable.

use thiserror::Error;

/// Unified error type for the delivery pipeline.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SdkError {
    /// Unreachable host, DNS, TLS, or aborted connection.
    #[error("network failure: {0}")]
    Network(String),

    /// The attempt deadline elapsed.
    #[error("timed out after {elapsed_ms} ms (limit {timeout_ms} ms)")]
    Timeout { elapsed_ms: u64, timeout_ms: u64 },

    /// Retryable HTTP status: any 5xx, plus 408 and 425.
    #[error("server error (status {status})")]
    Server { status: u16 },

    /// 429 with an optional `Retry-After` hint in milliseconds.
    #[error("rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    /// Terminal 4xx. The offending item is dropped, not retried.
    #[error("client error (status {status})")]
    Client { status: u16 },

    /// Serialized payload exceeds the single-item limit.
    #[error("payload too large ({bytes} bytes, limit {limit})")]
    TooLarge { bytes: usize, limit: usize },

    /// Synthetic rejection by an open circuit breaker. Not an operation
    /// failure; never recorded back into the breaker.
    #[error("circuit open for {feature}, retry in {retry_in_ms} ms")]
    CircuitOpen { feature: String, retry_in_ms: u64 },

    /// Cooperative cancellation. Propagates, never counts as failure.
    #[error("cancelled")]
    Cancelled,

    /// Persistent backing unavailable; the store degrades to memory-only.
    #[error("storage failure: {0}")]
    Storage(String),

    /// Invalid configuration detected at init; prevents start.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SdkError {
    /// Classify an HTTP response status into an error.
    ///
    /// Callers pass any `Retry-After` hint already converted to millis;
    /// it is only meaningful for 429.
    pub fn from_status(status: u16, retry_after_ms: Option<u64>) -> Option<SdkError> {
        match status {
            200..=299 => None,
            429 => Some(SdkError::RateLimited { retry_after_ms }),
            408 | 425 => Some(SdkError::Server { status }),
            500..=599 => Some(SdkError::Server { status }),
            _ => Some(SdkError::Client { status }),
        }
    }

    /// Whether the retry loop may attempt again after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SdkError::Network(_)
                | SdkError::Timeout { .. }
                | SdkError::Server { .. }
                | SdkError::RateLimited { .. }
        )
    }

    /// Weight of this outcome in a circuit breaker's rolling failure rate,
    /// or `None` when the outcome must not be recorded at all.
    ///
    /// Timeouts count at half weight; rate limiting and terminal client
    /// errors are recorded as zero-weight requests so they show in request
    /// counts without opening the circuit.
    pub fn circuit_weight(&self) -> Option<f64> {
        match self {
            SdkError::Network(_) | SdkError::Server { .. } | SdkError::Storage(_) => Some(1.0),
            SdkError::Timeout { .. } => Some(0.5),
            SdkError::RateLimited { .. } | SdkError::Client { .. } | SdkError::TooLarge { .. } => {
                Some(0.0)
            }
            SdkError::CircuitOpen { .. } | SdkError::Cancelled | SdkError::Config(_) => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, SdkError::RateLimited { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, SdkError::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SdkError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, SdkError::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_classify_to_none() {
        assert_eq!(SdkError::from_status(200, None), None);
        assert_eq!(SdkError::from_status(204, None), None);
    }

    #[test]
    fn retryable_statuses_match_contract() {
        for status in [408u16, 425, 500, 502, 503, 504] {
            let err = SdkError::from_status(status, None).expect("classified");
            assert!(err.is_retryable(), "status {status} should be retryable");
        }
        let limited = SdkError::from_status(429, Some(5_000)).expect("classified");
        assert!(limited.is_retryable());
        assert_eq!(limited, SdkError::RateLimited { retry_after_ms: Some(5_000) });
    }

    #[test]
    fn terminal_statuses_are_client_errors() {
        for status in [400u16, 401, 403, 404, 413, 422] {
            let err = SdkError::from_status(status, None).expect("classified");
            assert_eq!(err, SdkError::Client { status });
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn circuit_weights_follow_taxonomy() {
        assert_eq!(SdkError::Network("dns".into()).circuit_weight(), Some(1.0));
        assert_eq!(SdkError::Server { status: 503 }.circuit_weight(), Some(1.0));
        assert_eq!(
            SdkError::Timeout { elapsed_ms: 5_100, timeout_ms: 5_000 }.circuit_weight(),
            Some(0.5)
        );
        assert_eq!(SdkError::RateLimited { retry_after_ms: None }.circuit_weight(), Some(0.0));
        assert_eq!(SdkError::Client { status: 401 }.circuit_weight(), Some(0.0));
        assert_eq!(
            SdkError::CircuitOpen { feature: "ingest".into(), retry_in_ms: 30_000 }
                .circuit_weight(),
            None
        );
        assert_eq!(SdkError::Cancelled.circuit_weight(), None);
    }

    #[test]
    fn display_includes_key_fields() {
        let err = SdkError::Timeout { elapsed_ms: 5_100, timeout_ms: 5_000 };
        let msg = err.to_string();
        assert!(msg.contains("5100"));
        assert!(msg.contains("5000"));
    }
}
