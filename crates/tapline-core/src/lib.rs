//! # tapline-core: Pure Domain Logic for Tapline
//!
//! This crate holds everything about a card-present payment that can be
//! expressed without touching the network or the reader hardware.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tapline Architecture                             │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 SessionController (tapline-terminal)            │   │
//! │  │   request_discovery, select_reader, request_payment, ...        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        PaymentOrchestrator ──► ReaderSession ──► BackendGateway │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tapline-core (THIS CRATE) ★                     │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  failure  │  │ classify  │  │ validation│  │   │
//! │  │   │  Reader   │  │  Failure  │  │ Failure ─►│  │  amount   │  │   │
//! │  │   │  Intent   │  │  Terminal │  │ ErrorRea- │  │  reference│  │   │
//! │  │   │  Progress │  │  Fault    │  │ son       │  │  number   │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO NETWORK • NO HARDWARE • PURE FUNCTIONS            │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Reader, connection/payment status, intents, progress
//! - [`money`] - Minor-unit amounts and decimal input conversion
//! - [`error`] - The closed [`ErrorReason`] taxonomy and field errors
//! - [`failure`] - Typed failures raised at the network and SDK boundaries
//! - [`classify`] - Total mapping from [`Failure`] to [`ErrorReason`]
//! - [`validation`] - Amount and reference number input rules
//!
//! ## Example Usage
//!
//! ```rust
//! use tapline_core::classify::classify;
//! use tapline_core::{ErrorReason, Failure};
//!
//! let reason = classify(&Failure::http(404, None, "Not Found"));
//! assert_eq!(reason, ErrorReason::NotFound);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod classify;
pub mod error;
pub mod failure;
pub mod money;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use classify::classify;
pub use error::{ErrorReason, FieldError};
pub use failure::{Failure, TerminalErrorCode, TerminalFault, TransportFaultKind};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Currency charged when nothing else is configured.
pub const DEFAULT_CURRENCY: &str = "czk";

/// Smallest amount (in major units) a cashier may enter.
pub const MIN_AMOUNT: f64 = 20.0;

/// Largest amount (in major units) a cashier may enter.
pub const MAX_AMOUNT: f64 = 50000.0;

/// Maximum length of a merchant reference number.
pub const MAX_REFERENCE_LENGTH: usize = 20;
