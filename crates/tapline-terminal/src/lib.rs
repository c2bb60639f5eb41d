//! # tapline-terminal: Reader Session & Payment Orchestration for Tapline
//!
//! This crate drives a card reader through its SDK and a merchant backend
//! over HTTP: reader discovery, connection, and card-present payments.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Terminal Architecture                            │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                 SessionController (state machine)                │  │
//! │  │                                                                  │  │
//! │  │  Holds SessionState, enforces the busy policy and error slot     │  │
//! │  └──────────────┬──────────────────────────────┬────────────────────┘  │
//! │                 │ payments                     │ discovery / connect    │
//! │                 ▼                              ▼                        │
//! │  ┌────────────────────────┐      ┌───────────────────────────────┐     │
//! │  │  PaymentOrchestrator   │─────►│        ReaderSession          │     │
//! │  │                        │      │                               │     │
//! │  │  create ► retrieve ►   │      │  Sole owner of the SDK handle │     │
//! │  │  collect ► process ►   │      │  callbacks ► oneshot / watch  │     │
//! │  │  capture               │      │  / DiscoveryStream            │     │
//! │  └───────────┬────────────┘      └───────────────┬───────────────┘     │
//! │              ▼                                   ▼                      │
//! │  ┌────────────────────────┐      ┌───────────────────────────────┐     │
//! │  │   BackendGateway       │      │         TerminalSdk           │     │
//! │  │   HttpBackend (reqwest)│      │   SimulatedTerminal (memory)  │     │
//! │  │   StubBackend (memory) │      │   or a vendor SDK binding     │     │
//! │  └────────────────────────┘      └───────────────────────────────┘     │
//! │                                                                         │
//! │  Every failure leaving ReaderSession, PaymentOrchestrator or the       │
//! │  controller is a classified tapline_core::ErrorReason.                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`backend`] - Merchant backend trait, HTTP client, in-memory stub
//! - [`config`] - Terminal configuration (backend URL, discovery, currency)
//! - [`controller`] - `SessionController` and `SessionState`
//! - [`discovery`] - Cancellable reader discovery stream
//! - [`error`] - Session error types
//! - [`orchestrator`] - Payment transaction protocol
//! - [`sdk`] - Callback-style reader SDK boundary traits
//! - [`session`] - `ReaderSession`, the SDK owner
//! - [`simulator`] - In-memory reader SDK
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tapline_terminal::{
//!     HttpBackend, PlatformContext, SessionController, SimulatedTerminal, TerminalConfig,
//! };
//!
//! let config = TerminalConfig::load_or_default(None);
//! let backend = Arc::new(HttpBackend::try_new(&config.backend.url)?);
//! let controller =
//!     SessionController::from_config(Arc::new(SimulatedTerminal::new()), backend, &config);
//!
//! controller.initialize(&PlatformContext::default())?;
//! controller.request_discovery()?;
//! // ... wait for readers, then:
//! controller.select_reader("SIM-WPE-0001").await?;
//! controller.set_amount("250.00");
//! controller.set_reference("1024");
//! controller.request_payment().await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod backend;
pub mod config;
pub mod controller;
pub mod discovery;
pub mod error;
pub mod orchestrator;
pub mod sdk;
pub mod session;
pub mod simulator;

// =============================================================================
// Re-exports
// =============================================================================

pub use backend::{BackendCall, BackendCalls, BackendGateway, HttpBackend, StubBackend};
pub use config::{
    BackendSettings, ConnectionSettings, DiscoverySettings, PaymentSettings, TerminalConfig,
};
pub use controller::{SessionController, SessionState};
pub use discovery::{DiscoveryCanceller, DiscoveryStream};
pub use error::{Activity, SessionError, SessionResult};
pub use orchestrator::{PaymentError, PaymentOrchestrator, PaymentStage};
pub use sdk::{
    Cancelable, Completion, ConnectionConfig, ConnectionTokenProvider, DiscoveryConfig,
    DiscoveryMethod, PlatformContext, ReadersCallback, TerminalListener, TerminalSdk,
};
pub use session::ReaderSession;
pub use simulator::{SimulatedStep, SimulatedTerminal, SimulatorCalls};
