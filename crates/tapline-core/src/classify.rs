//! # Error Classifier
//!
//! Total, pure mapping from [`Failure`] to [`ErrorReason`].
//!
//! ## Rules (first match wins)
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  #  Failure                           ErrorReason                       │
//! │  ─  ────────────────────────────────  ────────────────────────────────  │
//! │  1  Terminal(fault)                   TerminalError(fault.message)      │
//! │  2  ConnectionToken { message }       ApiError(message)                 │
//! │  2a Payment { message }               PaymentError(message)             │
//! │  2b ConnectInFlight                   ReaderConnectionError             │
//! │  2c DiscoveryInProgress               ReaderDiscoveryError              │
//! │  3  Http { 404 }                      NotFound                          │
//! │     Http { 401 }                      AccessDenied                      │
//! │     Http { 503 }                      ServiceUnavailable                │
//! │     Http { other }                    ApiError(body or message)         │
//! │  4  Transport { kind, message }       NetworkError(message or default)  │
//! │  5  Other { message }                 Unknown(message)                  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! No logging, no retries, no side effects.

use crate::error::ErrorReason;
use crate::failure::Failure;

/// Classifies a boundary failure.
///
/// ```rust
/// use tapline_core::{classify, ErrorReason, Failure, TransportFaultKind};
///
/// let reason = classify(&Failure::transport(TransportFaultKind::Timeout, None));
/// assert_eq!(reason, ErrorReason::NetworkError("Timeout".into()));
/// ```
pub fn classify(failure: &Failure) -> ErrorReason {
    match failure {
        Failure::Terminal(fault) => ErrorReason::TerminalError(Some(fault.message.clone())),
        Failure::ConnectionToken { message } => ErrorReason::ApiError(Some(message.clone())),
        Failure::Payment { message } => ErrorReason::PaymentError(Some(message.clone())),
        Failure::ConnectInFlight => ErrorReason::ReaderConnectionError,
        Failure::DiscoveryInProgress => ErrorReason::ReaderDiscoveryError,
        Failure::Http {
            status,
            body,
            message,
        } => match status {
            404 => ErrorReason::NotFound,
            401 => ErrorReason::AccessDenied,
            503 => ErrorReason::ServiceUnavailable,
            _ => ErrorReason::ApiError(Some(
                body.clone()
                    .filter(|b| !b.is_empty())
                    .unwrap_or_else(|| message.clone()),
            )),
        },
        Failure::Transport { kind, message } => ErrorReason::NetworkError(
            message
                .clone()
                .unwrap_or_else(|| kind.fallback_message().to_string()),
        ),
        Failure::Other { message } => ErrorReason::Unknown(message.clone()),
    }
}

impl From<&Failure> for ErrorReason {
    fn from(failure: &Failure) -> Self {
        classify(failure)
    }
}

impl From<Failure> for ErrorReason {
    fn from(failure: Failure) -> Self {
        classify(&failure)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::{TerminalErrorCode, TransportFaultKind};

    #[test]
    fn test_http_statuses() {
        assert_eq!(classify(&Failure::http(404, None, "x")), ErrorReason::NotFound);
        assert_eq!(classify(&Failure::http(401, None, "x")), ErrorReason::AccessDenied);
        assert_eq!(
            classify(&Failure::http(503, None, "x")),
            ErrorReason::ServiceUnavailable
        );
    }

    #[test]
    fn test_other_http_status_prefers_body() {
        let with_body = Failure::http(400, Some("amount must be positive".into()), "Bad Request");
        assert_eq!(
            classify(&with_body),
            ErrorReason::ApiError(Some("amount must be positive".into()))
        );

        let without_body = Failure::http(500, None, "Internal Server Error");
        assert_eq!(
            classify(&without_body),
            ErrorReason::ApiError(Some("Internal Server Error".into()))
        );

        let empty_body = Failure::http(502, Some(String::new()), "Bad Gateway");
        assert_eq!(
            classify(&empty_body),
            ErrorReason::ApiError(Some("Bad Gateway".into()))
        );
    }

    #[test]
    fn test_transport_faults() {
        assert_eq!(
            classify(&Failure::transport(TransportFaultKind::Timeout, None)),
            ErrorReason::NetworkError("Timeout".into())
        );
        assert_eq!(
            classify(&Failure::transport(
                TransportFaultKind::UnknownHost,
                Some("no such host: backend.local".into())
            )),
            ErrorReason::NetworkError("no such host: backend.local".into())
        );
        assert_eq!(
            classify(&Failure::transport(TransportFaultKind::ConnectionRefused, None)),
            ErrorReason::NetworkError("Connection error".into())
        );
        assert_eq!(
            classify(&Failure::transport(TransportFaultKind::Socket, None)),
            ErrorReason::NetworkError("Socket error".into())
        );
    }

    #[test]
    fn test_terminal_and_token_faults() {
        let fault = Failure::terminal(TerminalErrorCode::ReaderCommunicationError, "lost link");
        assert_eq!(
            classify(&fault),
            ErrorReason::TerminalError(Some("lost link".into()))
        );
        assert_eq!(
            classify(&Failure::connection_token("Creating connection token failed")),
            ErrorReason::ApiError(Some("Creating connection token failed".into()))
        );
    }

    #[test]
    fn test_session_faults() {
        assert_eq!(
            classify(&Failure::payment("intent not capturable")),
            ErrorReason::PaymentError(Some("intent not capturable".into()))
        );
        assert_eq!(classify(&Failure::ConnectInFlight), ErrorReason::ReaderConnectionError);
        assert_eq!(classify(&Failure::DiscoveryInProgress), ErrorReason::ReaderDiscoveryError);
    }

    #[test]
    fn test_unknown_is_catch_all() {
        assert_eq!(
            classify(&Failure::other(Some("boom".into()))),
            ErrorReason::Unknown(Some("boom".into()))
        );
        assert_eq!(classify(&Failure::other(None)), ErrorReason::Unknown(None));
    }

    #[test]
    fn test_conversions() {
        let reason: ErrorReason = Failure::http(401, None, "Unauthorized").into();
        assert_eq!(reason, ErrorReason::AccessDenied);
    }
}
