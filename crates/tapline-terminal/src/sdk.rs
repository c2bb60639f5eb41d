//! # Terminal SDK Boundary
//!
//! Callback-style traits modelling the card reader SDK. Everything behind
//! these traits is hardware or vendor code; [`crate::session::ReaderSession`]
//! is the only component that calls them.
//!
//! ## Callback Shapes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  SDK shape                          Wrapped by ReaderSession as         │
//! │  ─────────────────────────────────  ─────────────────────────────────   │
//! │  Completion<T> (called once)        oneshot ──► async fn -> Result      │
//! │  ReadersCallback (called per cycle) mpsc ────► DiscoveryStream          │
//! │  TerminalListener (long-lived)      watch ───► status receivers         │
//! │  Cancelable (returned by discover)  drop guard, cancelled exactly once  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tapline_core::{
    ConnectionStatus, Failure, PaymentIntent, PaymentStatus, Reader, TerminalFault,
};

use crate::error::SessionError;

/// Single-shot result callback.
pub type Completion<T> = Box<dyn FnOnce(Result<T, TerminalFault>) + Send + 'static>;

/// Invoked with the full candidate list after every discovery cycle.
pub type ReadersCallback = Box<dyn Fn(Vec<Reader>) + Send + Sync + 'static>;

// =============================================================================
// Configuration Passed to the SDK
// =============================================================================

/// How readers are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryMethod {
    /// Readers registered to the merchant account, reached over the internet.
    #[default]
    Internet,

    /// Nearby readers found over Bluetooth.
    BluetoothScan,
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryMethod::Internet => write!(f, "internet"),
            DiscoveryMethod::BluetoothScan => write!(f, "bluetooth_scan"),
        }
    }
}

impl std::str::FromStr for DiscoveryMethod {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "internet" => Ok(DiscoveryMethod::Internet),
            "bluetooth_scan" | "bluetooth" => Ok(DiscoveryMethod::BluetoothScan),
            other => Err(SessionError::InvalidConfig(format!(
                "Unknown discovery method: '{}'. Valid options: internet, bluetooth_scan",
                other
            ))),
        }
    }
}

/// Parameters of one discovery request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Scan duration in seconds; 0 scans until cancelled.
    pub timeout_secs: u32,
    pub method: DiscoveryMethod,
    /// Ask the SDK for simulated readers instead of real hardware.
    pub simulated: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            timeout_secs: 0,
            method: DiscoveryMethod::Internet,
            simulated: true,
        }
    }
}

/// Parameters of an internet reader connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Refuse to take over a reader another client is connected to.
    pub fail_if_in_use: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            fail_if_in_use: true,
        }
    }
}

/// Host environment handed to the SDK at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformContext {
    pub application_name: String,
}

impl Default for PlatformContext {
    fn default() -> Self {
        PlatformContext {
            application_name: env!("CARGO_PKG_NAME").to_string(),
        }
    }
}

// =============================================================================
// Traits
// =============================================================================

/// Supplies connection tokens whenever the SDK needs to authorize a session.
#[async_trait]
pub trait ConnectionTokenProvider: Send + Sync {
    async fn fetch_connection_token(&self) -> Result<String, Failure>;
}

/// Long-lived event sink registered at initialization.
pub trait TerminalListener: Send + Sync {
    fn on_connection_status_change(&self, status: ConnectionStatus);

    fn on_payment_status_change(&self, status: PaymentStatus);

    fn on_unexpected_reader_disconnect(&self, reader: Reader);
}

/// Handle to an operation that can be stopped early.
pub trait Cancelable: Send + Sync {
    fn cancel(&self, done: Completion<()>);
}

/// The card reader SDK.
///
/// Every asynchronous call reports through its completion exactly once.
/// Dropping a completion without calling it is treated as an SDK fault by
/// the session.
pub trait TerminalSdk: Send + Sync {
    fn is_initialized(&self) -> bool;

    fn initialize(
        &self,
        context: &PlatformContext,
        token_provider: Arc<dyn ConnectionTokenProvider>,
        listener: Arc<dyn TerminalListener>,
    ) -> Result<(), TerminalFault>;

    /// Starts scanning. `on_update` fires after every cycle; `done` fires
    /// once when the scan ends on its own or fails.
    fn discover_readers(
        &self,
        config: &DiscoveryConfig,
        on_update: ReadersCallback,
        done: Completion<()>,
    ) -> Box<dyn Cancelable>;

    fn connect_internet_reader(
        &self,
        reader: &Reader,
        config: &ConnectionConfig,
        done: Completion<Reader>,
    );

    /// Drops the connected reader. Succeeds when nothing is connected.
    fn disconnect_reader(&self, done: Completion<()>);

    fn retrieve_payment_intent(&self, client_secret: &str, done: Completion<PaymentIntent>);

    fn collect_payment_method(&self, intent: PaymentIntent, done: Completion<PaymentIntent>);

    fn process_payment(&self, intent: PaymentIntent, done: Completion<PaymentIntent>);
}
