//! # Domain Types
//!
//! Core domain types shared by the reader session, the payment orchestrator
//! and the session controller.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │     Reader      │   │ PaymentIntentRef│   │  PaymentIntent  │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  serial_number  │   │  id             │   │  id             │       │
//! │  │  label?         │   │  client_secret  │   │  amount         │       │
//! │  │  ip_address?    │   │  (backend)      │   │  status         │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │ConnectionStatus │   │  PaymentStatus  │   │ PaymentProgress │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  NotConnected   │   │  NotReady       │   │  Preparing      │       │
//! │  │  Connecting     │   │  Ready          │   │  InProgress     │       │
//! │  │  Connected      │   │  Processing     │   │  Completed      │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `ConnectionStatus` and `PaymentStatus` mirror the hardware and are only
//! ever written by the reader session. `PaymentProgress` is the
//! orchestrator's own phase marker and lives for one transaction attempt.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::money::Money;

// =============================================================================
// Reader
// =============================================================================

/// A payment terminal found by a discovery cycle.
///
/// Identity is the serial number. Readers are immutable once discovered; a
/// later discovery cycle replaces the whole candidate list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reader {
    /// Unique hardware serial number.
    pub serial_number: String,

    /// Human-readable label assigned in the merchant dashboard.
    pub label: Option<String>,

    /// Network address, present for internet-connected readers.
    pub ip_address: Option<String>,
}

impl Reader {
    /// Creates a reader with only a serial number.
    pub fn new(serial_number: impl Into<String>) -> Self {
        Reader {
            serial_number: serial_number.into(),
            label: None,
            ip_address: None,
        }
    }

    /// Sets the label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the network address.
    pub fn with_ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    /// Label if present, otherwise the serial number.
    pub fn display_name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.serial_number)
    }
}

// =============================================================================
// Connection Status
// =============================================================================

/// Connection state between the SDK and a reader.
///
/// ```text
///  NotConnected ──connect()──► Connecting ──success──► Connected
///       ▲                           │                      │
///       └─────────failure───────────┘                      │
///       └──────────────unexpected disconnect───────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    NotConnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::NotConnected => write!(f, "not_connected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
        }
    }
}

// =============================================================================
// Payment Status
// =============================================================================

/// Hardware readiness to take a payment. Read-only to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    NotReady,
    Ready,
    Processing,
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::NotReady => write!(f, "not_ready"),
            PaymentStatus::Ready => write!(f, "ready"),
            PaymentStatus::Processing => write!(f, "processing"),
        }
    }
}

// =============================================================================
// Payment Progress
// =============================================================================

/// Phase marker emitted by the payment orchestrator.
///
/// Always emitted in declaration order within one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentProgress {
    /// Intent is being created and the card collected.
    PreparingPayment,
    /// Card collected, the reader is processing the charge.
    PaymentInProgress,
    /// Charge processed and captured by the backend.
    PaymentCompleted,
}

impl PaymentProgress {
    /// Returns true for the terminal success phase.
    pub fn is_completed(&self) -> bool {
        matches!(self, PaymentProgress::PaymentCompleted)
    }
}

// =============================================================================
// Payment Intents
// =============================================================================

/// Backend-issued handle for a pending charge.
///
/// Created by the backend, handed to the reader session to retrieve the
/// hardware-usable [`PaymentIntent`], and referenced again at capture time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntentRef {
    /// Backend identifier (`pi_...`).
    pub id: String,

    /// Client secret the SDK uses to fetch the intent.
    pub client_secret: String,
}

/// Lifecycle of an intent as reported by the reader SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresCapture,
    Succeeded,
    Canceled,
}

/// Hardware-side view of a payment intent, enriched step by step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    /// Same identifier as the backend's [`PaymentIntentRef::id`].
    pub id: String,

    /// Amount in minor units.
    pub amount: Money,

    /// Lowercase ISO currency code.
    pub currency: String,

    /// Current lifecycle status.
    pub status: IntentStatus,
}

impl PaymentIntent {
    /// Returns true once the reader has processed the charge.
    pub fn is_ready_for_capture(&self) -> bool {
        matches!(self.status, IntentStatus::RequiresCapture | IntentStatus::Succeeded)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
