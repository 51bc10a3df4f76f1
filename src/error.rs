//! Error types for the RabbitMQ cluster operator

use std::time::Duration;
use thiserror::Error;

/// Result type alias for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

/// Errors that can occur while reconciling a RabbitmqCluster
#[derive(Error, Debug)]
pub enum OperatorError {
    /// The user-declared spec failed validation
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Optimistic-concurrency collision, the object changed since it was read
    #[error("conflict: {0}")]
    Conflict(String),

    /// Platform API timeout or unavailability
    #[error("transient platform error: {0}")]
    Transient(String),

    /// Live state cannot be repaired without manual intervention
    #[error("irrecoverable state: {0}")]
    IrrecoverableState(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// How the dispatcher should treat a failed pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Re-run right away with a fresh read
    Immediate,
    /// Re-run after an exponential backoff delay
    Backoff,
    /// Wait for the next change notification or resync
    AwaitChange,
}

impl OperatorError {
    /// Condition reason surfaced on the `ReconcileSuccess` condition
    pub fn reason(&self) -> &'static str {
        match self {
            OperatorError::InvalidSpec(_) => "InvalidSpec",
            OperatorError::Conflict(_) => "Conflict",
            OperatorError::Transient(_) => "TransientPlatformError",
            OperatorError::IrrecoverableState(_) => "IrrecoverableState",
            OperatorError::Serialization(_) => "SerializationError",
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            OperatorError::Conflict(_) => RetryPolicy::Immediate,
            OperatorError::Transient(_) | OperatorError::Serialization(_) => RetryPolicy::Backoff,
            OperatorError::InvalidSpec(_) | OperatorError::IrrecoverableState(_) => {
                RetryPolicy::AwaitChange
            }
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.retry_policy() != RetryPolicy::AwaitChange
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict(_))
    }
}

impl From<kube::Error> for OperatorError {
    fn from(err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) if ae.code == 409 => OperatorError::Conflict(ae.message.clone()),
            kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => {
                OperatorError::InvalidSpec(ae.message.clone())
            }
            _ => OperatorError::Transient(err.to_string()),
        }
    }
}

/// Exponential backoff bounded by a ceiling.
///
/// `attempt` starts at 1 for the first failure.
pub fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(2u32.saturating_pow(exponent)).min(ceiling)
}
