//! # Session Error Types
//!
//! Errors raised by the terminal crate itself, as opposed to the classified
//! [`ErrorReason`] values that describe reader and backend failures.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Session Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Configuration  │  │    Commands     │  │     Classified          │ │
//! │  │                 │  │                 │  │                         │ │
//! │  │  InvalidConfig  │  │  Busy           │  │  Reader(ErrorReason)    │ │
//! │  │  InvalidUrl     │  │  InvalidInput   │  │  Payment(PaymentError)  │ │
//! │  │  ConfigLoad/Save│  │  NotInitialized │  │                         │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use tapline_core::{ErrorReason, FieldError};

use crate::orchestrator::PaymentError;

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Long-running session activities that exclude one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Discovery,
    Connect,
    Payment,
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Activity::Discovery => write!(f, "discovery"),
            Activity::Connect => write!(f, "connect"),
            Activity::Payment => write!(f, "payment"),
        }
    }
}

/// Error type for configuration and controller commands.
#[derive(Debug, Error)]
pub enum SessionError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Invalid terminal configuration.
    #[error("Invalid terminal configuration: {0}")]
    InvalidConfig(String),

    /// Invalid backend URL.
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),

    /// Failed to load config file.
    #[error("Failed to load config: {0}")]
    ConfigLoadFailed(String),

    /// Failed to save config file.
    #[error("Failed to save config: {0}")]
    ConfigSaveFailed(String),

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// A command was rejected because a conflicting activity is running.
    #[error("Cannot start {command} while {active} is in progress")]
    Busy { command: Activity, active: Activity },

    /// Payment requested with invalid form input.
    #[error("Invalid payment input (amount: {amount:?}, reference: {reference:?})")]
    InvalidInput {
        amount: Option<FieldError>,
        reference: Option<FieldError>,
    },

    /// Command issued before the session was initialized.
    #[error("Session is not initialized")]
    NotInitialized,

    // =========================================================================
    // Classified Errors
    // =========================================================================
    /// A reader or backend failure, already classified.
    #[error(transparent)]
    Reader(#[from] ErrorReason),

    /// A payment transaction failed at one of its steps.
    #[error(transparent)]
    Payment(#[from] PaymentError),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::InvalidUrl(err.to_string())
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(err: toml::de::Error) -> Self {
        SessionError::ConfigLoadFailed(err.to_string())
    }
}

impl From<toml::ser::Error> for SessionError {
    fn from(err: toml::ser::Error) -> Self {
        SessionError::ConfigSaveFailed(err.to_string())
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl SessionError {
    /// Returns true if this error indicates a configuration problem.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            SessionError::InvalidConfig(_)
                | SessionError::InvalidUrl(_)
                | SessionError::ConfigLoadFailed(_)
                | SessionError::ConfigSaveFailed(_)
        )
    }

    /// Returns the classified reason, if this error carries one.
    pub fn reason(&self) -> Option<&ErrorReason> {
        match self {
            SessionError::Reader(reason) => Some(reason),
            SessionError::Payment(err) => Some(&err.reason),
            _ => None,
        }
    }
}
