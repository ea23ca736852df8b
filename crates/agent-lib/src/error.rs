//! Error taxonomy for the monitoring core
//!
//! None of these are fatal to the process except [`BusError`] raised while
//! constructing the event bus at startup.

use crate::models::MetricKind;
use thiserror::Error;

/// Failure to acquire a snapshot from a metric source
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("{metric} source unavailable: {reason}")]
    Unavailable { metric: MetricKind, reason: String },

    #[error("{metric} sample timed out after {timeout_ms}ms")]
    Timeout { metric: MetricKind, timeout_ms: u64 },
}

impl SourceError {
    pub fn unavailable(metric: MetricKind, reason: impl Into<String>) -> Self {
        SourceError::Unavailable {
            metric,
            reason: reason.into(),
        }
    }
}

/// Failure to produce a baseline from the learning window
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BaselineError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientData { needed: u64, have: u64 },
}

/// Failure reported by the external analysis engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("analysis engine unavailable: {0}")]
    Unavailable(String),

    #[error("analysis engine timed out after {0}s")]
    Timeout(u64),
}

impl EngineError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }
}

/// Event bus errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("event bus is closed")]
    Closed,

    #[error("invalid event bus configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = SourceError::unavailable(MetricKind::Load, "missing /proc/loadavg");
        assert_eq!(
            err.to_string(),
            "load source unavailable: missing /proc/loadavg"
        );

        let err = BaselineError::InsufficientData { needed: 10, have: 3 };
        assert!(err.to_string().contains("need 10 samples, have 3"));

        assert!(EngineError::Timeout(30).is_timeout());
        assert!(!EngineError::Unavailable("down".into()).is_timeout());
    }
}
