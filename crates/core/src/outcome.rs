use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a stage failure, driving the retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Network faults, 5xx responses, timeouts. Retried with backoff.
    Transient,
    /// External rate limiting. Retried at the reset instant without
    /// consuming retry budget.
    RateLimit,
    /// Bad input or schema mismatch. Never retried automatically.
    Validation,
    /// Unrecoverable (e.g. missing dependency). Dead-lettered immediately.
    Fatal,
}

impl FailureClass {
    /// Return the snake_case wire form of the failure class.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::RateLimit => "rate_limit",
            Self::Validation => "validation",
            Self::Fatal => "fatal",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure a stage handler may raise.
///
/// Anything a handler raises that is not one of these is wrapped as
/// [`FailureClass::Transient`] at the executor boundary.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// Network fault, upstream 5xx, or other retryable condition.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The external service rejected the call for rate reasons (e.g. an
    /// HTTP 429). `reset_at` carries the service's reset hint (a
    /// `Retry-After` header) when one was given; without it the retry
    /// policy falls back to its base delay.
    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        reset_at: Option<DateTime<Utc>>,
    },

    /// The item's data cannot be processed as-is.
    #[error("validation failure: {0}")]
    Validation(String),

    /// Unrecoverable failure.
    #[error("fatal failure: {0}")]
    Fatal(String),

    /// An external-service quota was exhausted; carries the service name and
    /// the estimated reset instant so partial progress can be parked.
    #[error("quota exhausted for {service}, resets at {reset_at}")]
    QuotaExhausted {
        service: String,
        reset_at: DateTime<Utc>,
    },
}

impl StageError {
    /// The failure class this error maps to. `QuotaExhausted` takes the
    /// dedicated quota path and has no class.
    #[must_use]
    pub fn class(&self) -> Option<FailureClass> {
        match self {
            Self::Transient(_) => Some(FailureClass::Transient),
            Self::RateLimited { .. } => Some(FailureClass::RateLimit),
            Self::Validation(_) => Some(FailureClass::Validation),
            Self::Fatal(_) => Some(FailureClass::Fatal),
            Self::QuotaExhausted { .. } => None,
        }
    }
}

/// Normalized result of one stage execution, produced by the stage executor
/// and consumed by the worker's outcome mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageOutcome {
    /// Stage finished; `summary` is persisted under the stage key.
    Done { summary: serde_json::Value },
    /// Stage failed with a classified error. For `RateLimit` failures,
    /// `retry_at` is the externally reported reset instant, when known.
    Failed {
        class: FailureClass,
        reason: String,
        details: serde_json::Value,
        retry_at: Option<DateTime<Utc>>,
    },
    /// Quota exhausted mid-stage; partial output (if any) is preserved and
    /// the item parks until `reset_at`.
    QuotaExceeded {
        service: String,
        reset_at: DateTime<Utc>,
        partial: Option<serde_json::Value>,
    },
    /// Stage yielded with partial output. With `continue_next` the pipeline
    /// advances as on success; without it the item waits for an external
    /// wake and re-runs the same stage.
    Partial {
        summary: serde_json::Value,
        continue_next: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_classes() {
        assert_eq!(
            StageError::Transient("x".into()).class(),
            Some(FailureClass::Transient)
        );
        assert_eq!(
            StageError::RateLimited {
                message: "x".into(),
                reset_at: None,
            }
            .class(),
            Some(FailureClass::RateLimit)
        );
        assert_eq!(
            StageError::RateLimited {
                message: "429".into(),
                reset_at: Some(Utc::now() + chrono::Duration::seconds(30)),
            }
            .class(),
            Some(FailureClass::RateLimit)
        );
        assert_eq!(
            StageError::Validation("x".into()).class(),
            Some(FailureClass::Validation)
        );
        assert_eq!(
            StageError::Fatal("x".into()).class(),
            Some(FailureClass::Fatal)
        );
        assert_eq!(
            StageError::QuotaExhausted {
                service: "vision".into(),
                reset_at: Utc::now(),
            }
            .class(),
            None
        );
    }

    #[test]
    fn outcome_serde_roundtrip() {
        let outcome = StageOutcome::QuotaExceeded {
            service: "vision".into(),
            reset_at: Utc::now(),
            partial: Some(serde_json::json!({"images_analyzed": 2})),
        };
        let json = serde_json::to_string(&outcome).unwrap();
        let back: StageOutcome = serde_json::from_str(&json).unwrap();
        assert!(matches!(back, StageOutcome::QuotaExceeded { .. }));
    }

    #[test]
    fn failure_class_display() {
        assert_eq!(FailureClass::Transient.to_string(), "transient");
        assert_eq!(FailureClass::RateLimit.to_string(), "rate_limit");
    }
}
