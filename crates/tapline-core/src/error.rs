//! # Error Types
//!
//! The closed error taxonomy surfaced to the consumer, plus field-level
//! validation errors.
//!
//! ## Error Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Error Flow                                    │
//! │                                                                         │
//! │  reqwest error ──┐                                                      │
//! │  HTTP status ────┤                                                      │
//! │  SDK fault ──────┼──► Failure ──► classify() ──► ErrorReason ──► state │
//! │  token fault ────┤     (failure.rs)  (classify.rs)  (this file)         │
//! │  busy reader ────┘                                                      │
//! │                                                                         │
//! │  Cashier input ──► validation.rs ──► FieldError ──► field error slots  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ErrorReason` values are produced by [`crate::classify::classify`] only.

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Reason
// =============================================================================

/// Actionable classification of any failure crossing a component boundary.
///
/// Every presentation boundary matches this exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ErrorReason {
    /// Low-level transport fault (timeout, DNS, refused connection, socket).
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Backend answered 404.
    #[error("Resource not found")]
    NotFound,

    /// Backend answered 401.
    #[error("Access denied")]
    AccessDenied,

    /// Backend answered 503.
    #[error("Service unavailable")]
    ServiceUnavailable,

    /// The intent came back in a state the protocol step cannot accept.
    #[error("Payment error: {}", detail(.0))]
    PaymentError(Option<String>),

    /// Fault reported by the reader hardware or its SDK.
    #[error("Terminal error: {}", detail(.0))]
    TerminalError(Option<String>),

    /// Backend or connection-token provisioning failure.
    #[error("API error: {}", detail(.0))]
    ApiError(Option<String>),

    /// A reader connection could not be started.
    #[error("Failed to connect to reader")]
    ReaderConnectionError,

    /// A discovery cycle could not be started.
    #[error("Error while discovering readers")]
    ReaderDiscoveryError,

    /// Anything the classifier has no specific rule for.
    #[error("Unknown error: {}", detail(.0))]
    Unknown(Option<String>),
}

fn detail(message: &Option<String>) -> &str {
    message.as_deref().unwrap_or("no details")
}

impl ErrorReason {
    /// Free-form detail carried by the variant, if any.
    pub fn message(&self) -> Option<&str> {
        match self {
            ErrorReason::NetworkError(message) => Some(message),
            ErrorReason::PaymentError(message)
            | ErrorReason::TerminalError(message)
            | ErrorReason::ApiError(message)
            | ErrorReason::Unknown(message) => message.as_deref(),
            ErrorReason::NotFound
            | ErrorReason::AccessDenied
            | ErrorReason::ServiceUnavailable
            | ErrorReason::ReaderConnectionError
            | ErrorReason::ReaderDiscoveryError => None,
        }
    }

    /// Dialog title a front end would show for this reason.
    pub fn title(&self) -> &'static str {
        match self {
            ErrorReason::TerminalError(_) => "Terminal error",
            ErrorReason::ApiError(_) => "Server error",
            ErrorReason::NetworkError(_)
            | ErrorReason::NotFound
            | ErrorReason::AccessDenied
            | ErrorReason::ServiceUnavailable
            | ErrorReason::PaymentError(_)
            | ErrorReason::ReaderConnectionError
            | ErrorReason::ReaderDiscoveryError
            | ErrorReason::Unknown(_) => "Something went wrong",
        }
    }
}

// =============================================================================
// Field Errors
// =============================================================================

/// Input validation failures for the amount and reference fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldError {
    #[error("Amount is required")]
    EmptyAmount,

    #[error("Amount is not a valid number")]
    InvalidAmount,

    #[error("Amount is too small")]
    TooSmall,

    #[error("Amount is too big")]
    TooBig,

    #[error("Reference number is required")]
    EmptyReference,

    #[error("Reference number must be at most 20 digits")]
    InvalidReference,
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            ErrorReason::NetworkError("Timeout".into()).to_string(),
            "Network error: Timeout"
        );
        assert_eq!(
            ErrorReason::TerminalError(None).to_string(),
            "Terminal error: no details"
        );
        assert_eq!(ErrorReason::NotFound.to_string(), "Resource not found");
    }

    #[test]
    fn test_message_and_title() {
        let reason = ErrorReason::ApiError(Some("bad amount".into()));
        assert_eq!(reason.message(), Some("bad amount"));
        assert_eq!(reason.title(), "Server error");
        assert_eq!(ErrorReason::AccessDenied.message(), None);
    }
}
