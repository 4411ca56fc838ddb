use serde::Serialize;
use thiserror::Error;

use crate::domain::repositories::exchange_client::ExchangeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorSeverity {
    Minor,
    Moderate,
    Critical,
}

/// Failure taxonomy shared by the delivery pipeline and the dispatcher.
///
/// Handlers report these; only the orchestrator decides whether a failure is
/// retried (via [`DispatchError::is_retryable`]) or becomes terminal.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("Duplicate delivery for alert {alert_id} (prior delivery {prior_delivery_id})")]
    DuplicateDelivery {
        alert_id: String,
        prior_delivery_id: i64,
    },

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("No tradable account available: {0}")]
    AccountUnavailable(String),

    #[error("Exchange temporarily unavailable: {0}")]
    ExchangeTransient(String),

    #[error("Exchange rejected request ({code}): {message}")]
    ExchangeRejected { code: String, message: String },

    #[error("Internal failure: {0}")]
    InternalFailure(String),
}

impl DispatchError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::AccountUnavailable(_)
                | DispatchError::ExchangeTransient(_)
                | DispatchError::InternalFailure(_)
        )
    }

    /// Stable machine-readable code, safe to return to callers
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::AuthenticationFailure(_) => "authentication_failure",
            DispatchError::DuplicateDelivery { .. } => "duplicate_delivery",
            DispatchError::ValidationFailure(_) => "validation_failure",
            DispatchError::AccountUnavailable(_) => "account_unavailable",
            DispatchError::ExchangeTransient(_) => "exchange_transient",
            DispatchError::ExchangeRejected { .. } => "exchange_rejected",
            DispatchError::InternalFailure(_) => "internal_failure",
        }
    }

    /// Message without internal detail
    pub fn public_message(&self) -> &'static str {
        match self {
            DispatchError::AuthenticationFailure(_) => "Authentication failed",
            DispatchError::DuplicateDelivery { .. } => "Duplicate alert ignored",
            DispatchError::ValidationFailure(_) => "Invalid alert payload",
            DispatchError::AccountUnavailable(_) => "No trading account available",
            DispatchError::ExchangeTransient(_) => "Exchange temporarily unavailable",
            DispatchError::ExchangeRejected { .. } => "Order rejected by exchange",
            DispatchError::InternalFailure(_) => "Internal error",
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            DispatchError::DuplicateDelivery { .. } => ErrorSeverity::Minor,
            DispatchError::ValidationFailure(_)
            | DispatchError::AccountUnavailable(_)
            | DispatchError::ExchangeTransient(_)
            | DispatchError::ExchangeRejected { .. } => ErrorSeverity::Moderate,
            DispatchError::AuthenticationFailure(_) | DispatchError::InternalFailure(_) => {
                ErrorSeverity::Critical
            }
        }
    }
}

impl From<ExchangeError> for DispatchError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::Auth(msg) => DispatchError::AuthenticationFailure(msg),
            ExchangeError::Validation(msg) => DispatchError::ValidationFailure(msg),
            ExchangeError::RateLimited(msg) => {
                DispatchError::ExchangeTransient(format!("rate limited: {}", msg))
            }
            ExchangeError::Unavailable(msg) => DispatchError::ExchangeTransient(msg),
            ExchangeError::Rejected { code, message } => {
                DispatchError::ExchangeRejected { code, message }
            }
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
