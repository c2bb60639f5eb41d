//! # Boundary Failures
//!
//! Raw failures as they arrive from the network and the reader SDK, before
//! classification. Nothing outside the reader session and the backend
//! gateway should ever hold one of these for long: they are converted into
//! [`crate::ErrorReason`] at the component boundary.
//!
//! ## Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Source                         Failure variant                         │
//! │  ─────────────────────────────  ─────────────────────────────────────   │
//! │  Reader SDK callback failure    Terminal(TerminalFault)                 │
//! │  Connection token provisioning  ConnectionToken { message }             │
//! │  Intent in an unusable state    Payment { message }                     │
//! │  Backend non-2xx response       Http { status, body, message }          │
//! │  Socket / DNS / timeout         Transport { kind, message }             │
//! │  Second connect while pending   ConnectInFlight                         │
//! │  Second discovery while active  DiscoveryInProgress                     │
//! │  Anything else                  Other { message }                       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use thiserror::Error;

// =============================================================================
// Terminal Faults
// =============================================================================

/// Error codes reported by the reader SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminalErrorCode {
    NotInitialized,
    AlreadyInitialized,
    NotConnectedToReader,
    AlreadyConnectedToReader,
    ReaderBusy,
    ReaderCommunicationError,
    ConnectionTokenProviderError,
    CardReadTimedOut,
    DeclinedByReader,
    Canceled,
    UnexpectedSdkError,
}

impl fmt::Display for TerminalErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            TerminalErrorCode::NotInitialized => "not_initialized",
            TerminalErrorCode::AlreadyInitialized => "already_initialized",
            TerminalErrorCode::NotConnectedToReader => "not_connected_to_reader",
            TerminalErrorCode::AlreadyConnectedToReader => "already_connected_to_reader",
            TerminalErrorCode::ReaderBusy => "reader_busy",
            TerminalErrorCode::ReaderCommunicationError => "reader_communication_error",
            TerminalErrorCode::ConnectionTokenProviderError => "connection_token_provider_error",
            TerminalErrorCode::CardReadTimedOut => "card_read_timed_out",
            TerminalErrorCode::DeclinedByReader => "declined_by_reader",
            TerminalErrorCode::Canceled => "canceled",
            TerminalErrorCode::UnexpectedSdkError => "unexpected_sdk_error",
        };
        f.write_str(code)
    }
}

/// A failure delivered through an SDK failure callback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct TerminalFault {
    pub code: TerminalErrorCode,
    pub message: String,
}

impl TerminalFault {
    pub fn new(code: TerminalErrorCode, message: impl Into<String>) -> Self {
        TerminalFault {
            code,
            message: message.into(),
        }
    }
}

// =============================================================================
// Transport Faults
// =============================================================================

/// Kinds of low-level network faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFaultKind {
    Timeout,
    UnknownHost,
    ConnectionRefused,
    Socket,
}

impl TransportFaultKind {
    /// Message used when the underlying error carried none.
    pub fn fallback_message(&self) -> &'static str {
        match self {
            TransportFaultKind::Timeout => "Timeout",
            TransportFaultKind::UnknownHost => "Unknown host",
            TransportFaultKind::ConnectionRefused => "Connection error",
            TransportFaultKind::Socket => "Socket error",
        }
    }
}

// =============================================================================
// Failure
// =============================================================================

/// Any failure raised below the core components.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Failure {
    #[error("Terminal fault: {0}")]
    Terminal(TerminalFault),

    #[error("Connection token failure: {message}")]
    ConnectionToken { message: String },

    #[error("Payment failure: {message}")]
    Payment { message: String },

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        body: Option<String>,
        message: String,
    },

    #[error("Transport failure ({kind:?}): {}", .message.as_deref().unwrap_or(.kind.fallback_message()))]
    Transport {
        kind: TransportFaultKind,
        message: Option<String>,
    },

    #[error("A reader connection is already in progress")]
    ConnectInFlight,

    #[error("Reader discovery is already running")]
    DiscoveryInProgress,

    #[error("{}", .message.as_deref().unwrap_or("Unknown failure"))]
    Other { message: Option<String> },
}

impl Failure {
    pub fn terminal(code: TerminalErrorCode, message: impl Into<String>) -> Self {
        Failure::Terminal(TerminalFault::new(code, message))
    }

    pub fn connection_token(message: impl Into<String>) -> Self {
        Failure::ConnectionToken {
            message: message.into(),
        }
    }

    pub fn payment(message: impl Into<String>) -> Self {
        Failure::Payment {
            message: message.into(),
        }
    }

    pub fn http(status: u16, body: Option<String>, message: impl Into<String>) -> Self {
        Failure::Http {
            status,
            body,
            message: message.into(),
        }
    }

    pub fn transport(kind: TransportFaultKind, message: Option<String>) -> Self {
        Failure::Transport { kind, message }
    }

    pub fn other(message: Option<String>) -> Self {
        Failure::Other { message }
    }
}

impl From<TerminalFault> for Failure {
    fn from(fault: TerminalFault) -> Self {
        Failure::Terminal(fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_display() {
        let fault = Failure::terminal(TerminalErrorCode::ReaderBusy, "busy");
        assert_eq!(fault.to_string(), "Terminal fault: reader_busy: busy");

        let timeout = Failure::transport(TransportFaultKind::Timeout, None);
        assert!(timeout.to_string().contains("Timeout"));

        assert_eq!(Failure::other(None).to_string(), "Unknown failure");
    }
}
