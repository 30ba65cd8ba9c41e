//! Admission-control error types

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LimiterError {
    #[error("invalid argument {name}: {message}")]
    InvalidArgument { name: String, message: String },

    #[error("invalid timeout: {millis}ms exceeds the supported maximum")]
    InvalidTimeout { millis: u128 },

    #[error("admission rejected for {resource}: wait queue is full")]
    Rejected { resource: String },

    #[error("timed out waiting for a permit")]
    TimedOut,

    #[error("acquisition canceled")]
    Canceled,

    #[error("limiter has been disposed")]
    Disposed,
}

impl LimiterError {
    /// Shorthand for an argument validation failure
    pub fn invalid_argument(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl UserFacingError for LimiterError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::Rejected { .. } => Some("The backend is saturated; shed load or retry later."),
            Self::TimedOut => Some("Increase the timeout or the partition's pool size."),
            Self::InvalidArgument { .. } | Self::InvalidTimeout { .. } => {
                Some("Check the permit count and timeout passed to the limiter.")
            }
            Self::Canceled | Self::Disposed => None,
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, Self::Rejected { .. } | Self::TimedOut)
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self {
            Self::InvalidArgument { .. } => "limiter.invalid_argument",
            Self::InvalidTimeout { .. } => "limiter.invalid_timeout",
            Self::Rejected { .. } => "limiter.rejected",
            Self::TimedOut => "limiter.timed_out",
            Self::Canceled => "limiter.canceled",
            Self::Disposed => "limiter.disposed",
        })
    }
}
