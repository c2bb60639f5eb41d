//! # Session Controller
//!
//! Consumer-facing state machine. Holds one [`SessionState`], turns cashier
//! commands into reader session and payment orchestrator calls, and folds
//! their results and the session's status channels back into the state.
//!
//! ## Command Policy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Command             While connect running     While payment running    │
//! │  ──────────────────  ────────────────────────  ──────────────────────   │
//! │  request_discovery   Busy                      Busy                     │
//! │  select_reader       Busy                      Busy                     │
//! │  request_payment     Busy                      Busy                     │
//! │                                                                         │
//! │  A new discovery always replaces the previous one, which is cancelled  │
//! │  first. Connect and payment may run while a discovery is scanning.     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Error Slot
//!
//! `last_error` holds a single classified error. While it is set, newer
//! errors are logged and dropped until [`SessionController::acknowledge_error`]
//! clears the slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tapline_core::money::convert_amount;
use tapline_core::validation::{validate_amount, validate_reference_number};
use tapline_core::{
    ConnectionStatus, ErrorReason, FieldError, PaymentProgress, PaymentStatus, Reader,
};

use crate::backend::{lock, BackendGateway};
use crate::config::TerminalConfig;
use crate::discovery::{DiscoveryCanceller, DiscoveryStream};
use crate::error::{Activity, SessionError, SessionResult};
use crate::orchestrator::PaymentOrchestrator;
use crate::sdk::{ConnectionConfig, DiscoveryConfig, PlatformContext, TerminalSdk};
use crate::session::ReaderSession;

// =============================================================================
// Session State
// =============================================================================

/// Snapshot of everything a cashier-facing surface renders.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SessionState {
    pub is_loading: bool,
    pub payment_progress: Option<PaymentProgress>,
    pub connection: ConnectionStatus,
    pub payment_status: PaymentStatus,
    pub connected_reader: Option<Reader>,
    pub discovered_readers: Vec<Reader>,
    pub amount_input: String,
    pub reference_input: String,
    pub amount_error: Option<FieldError>,
    pub reference_error: Option<FieldError>,
    pub last_error: Option<ErrorReason>,
    /// Set once the last payment completed.
    pub show_success: bool,
    /// A reader is connected and can take a payment.
    pub payment_ready: bool,
}

type SharedState = Arc<watch::Sender<SessionState>>;

/// Stores `reason` unless an unacknowledged error is already shown.
fn record_error(state: &SharedState, reason: ErrorReason) {
    state.send_modify(|s| store_error(s, reason));
}

fn store_error(s: &mut SessionState, reason: ErrorReason) {
    if s.last_error.is_none() {
        s.last_error = Some(reason);
    } else {
        warn!(shown = ?s.last_error, dropped = %reason, "Unacknowledged error pending, dropping new one");
    }
}

// =============================================================================
// Controller
// =============================================================================

struct ActiveDiscovery {
    canceller: DiscoveryCanceller,
    task: JoinHandle<()>,
}

impl ActiveDiscovery {
    fn stop(self) {
        self.canceller.cancel();
        self.task.abort();
    }
}

/// Clears the busy marker when a connect or payment ends, however it ends.
struct ActivityGuard<'a> {
    busy: &'a Mutex<Option<Activity>>,
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        *lock(self.busy) = None;
    }
}

/// Owns the session state and sequences cashier commands.
pub struct SessionController {
    session: Arc<ReaderSession>,
    orchestrator: PaymentOrchestrator,
    state: SharedState,
    busy: Mutex<Option<Activity>>,
    discovery: Mutex<Option<ActiveDiscovery>>,
    /// Bumped whenever a discovery starts or stops; a follower whose
    /// generation is no longer current leaves the state alone.
    discovery_generation: Arc<AtomicU64>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    discovery_config: DiscoveryConfig,
    connection_config: ConnectionConfig,
    currency: String,
}

impl SessionController {
    pub fn new(
        session: Arc<ReaderSession>,
        backend: Arc<dyn BackendGateway>,
        config: &TerminalConfig,
    ) -> Self {
        SessionController {
            orchestrator: PaymentOrchestrator::new(session.clone(), backend),
            session,
            state: Arc::new(watch::channel(SessionState::default()).0),
            busy: Mutex::new(None),
            discovery: Mutex::new(None),
            discovery_generation: Arc::new(AtomicU64::new(0)),
            forwarders: Mutex::new(Vec::new()),
            discovery_config: config.discovery_config(),
            connection_config: config.connection_config(),
            currency: config.currency().to_string(),
        }
    }

    /// Builds the reader session from `config` and wraps it.
    pub fn from_config(
        sdk: Arc<dyn TerminalSdk>,
        backend: Arc<dyn BackendGateway>,
        config: &TerminalConfig,
    ) -> Self {
        let session = Arc::new(
            ReaderSession::new(sdk, backend.clone()).with_connect_timeout(config.connect_timeout()),
        );
        Self::new(session, backend, config)
    }

    /// Observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// The underlying reader session, for callers that want the raw streams.
    pub fn session(&self) -> &Arc<ReaderSession> {
        &self.session
    }

    pub fn orchestrator(&self) -> &PaymentOrchestrator {
        &self.orchestrator
    }

    fn update(&self, f: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(f);
    }

    fn begin(&self, command: Activity) -> SessionResult<ActivityGuard<'_>> {
        let mut busy = lock(&self.busy);
        if let Some(active) = *busy {
            warn!(%command, %active, "Rejecting command, session is busy");
            return Err(SessionError::Busy { command, active });
        }
        *busy = Some(command);
        Ok(ActivityGuard { busy: &self.busy })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initializes the reader session and starts mirroring its status
    /// channels into the state. Must be called inside a tokio runtime.
    pub fn initialize(&self, context: &PlatformContext) -> SessionResult<()> {
        if let Err(reason) = self.session.initialize(context) {
            record_error(&self.state, reason.clone());
            return Err(reason.into());
        }

        let mut forwarders = lock(&self.forwarders);
        if forwarders.is_empty() {
            forwarders.push(forward(
                self.state.clone(),
                self.session.connection_status(),
                |s, status| {
                    s.connection = status;
                    s.payment_ready = status == ConnectionStatus::Connected;
                },
            ));
            forwarders.push(forward(
                self.state.clone(),
                self.session.payment_status(),
                |s, status| s.payment_status = status,
            ));
            forwarders.push(forward(
                self.state.clone(),
                self.session.connected_reader(),
                |s, reader| s.connected_reader = reader,
            ));
        }
        Ok(())
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Starts a discovery, cancelling the previous one first.
    pub fn request_discovery(&self) -> SessionResult<()> {
        if !self.session.is_initialized() {
            return Err(SessionError::NotInitialized);
        }
        if let Some(active) = *lock(&self.busy) {
            warn!(%active, "Rejecting discovery, session is busy");
            return Err(SessionError::Busy {
                command: Activity::Discovery,
                active,
            });
        }

        let mut current = lock(&self.discovery);
        if let Some(previous) = current.take() {
            debug!("Replacing active discovery");
            previous.stop();
        }

        let generation = self.discovery_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.update(|s| s.is_loading = true);
        let readers = self.session.discover_readers(&self.discovery_config);
        let canceller = readers.canceller();
        let task = tokio::spawn(follow_discovery(
            readers,
            self.state.clone(),
            self.discovery_generation.clone(),
            generation,
        ));
        *current = Some(ActiveDiscovery { canceller, task });
        Ok(())
    }

    /// Stops the active discovery, if any.
    pub fn stop_discovery(&self) {
        if let Some(active) = lock(&self.discovery).take() {
            self.discovery_generation.fetch_add(1, Ordering::SeqCst);
            active.stop();
            if lock(&self.busy).is_none() {
                self.update(|s| s.is_loading = false);
            }
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to a reader from the last discovered set.
    ///
    /// An unknown serial number is ignored and leaves the state untouched.
    pub async fn select_reader(&self, serial_number: &str) -> SessionResult<()> {
        let reader = self
            .state
            .borrow()
            .discovered_readers
            .iter()
            .find(|r| r.serial_number == serial_number)
            .cloned();
        let Some(reader) = reader else {
            warn!(serial = serial_number, "Selected reader is not among discovered readers");
            return Ok(());
        };

        let _busy = self.begin(Activity::Connect)?;
        self.update(|s| s.is_loading = true);

        match self.session.connect(&reader, &self.connection_config).await {
            Ok(connected) => {
                self.update(|s| {
                    s.connection = ConnectionStatus::Connected;
                    s.connected_reader = Some(connected);
                    s.payment_ready = true;
                    s.is_loading = false;
                });
                Ok(())
            }
            Err(reason) => {
                self.update(|s| s.is_loading = false);
                record_error(&self.state, reason.clone());
                Err(reason.into())
            }
        }
    }

    // =========================================================================
    // Payment Form
    // =========================================================================

    pub fn set_amount(&self, text: impl Into<String>) {
        let text = text.into();
        let error = validate_amount(&text);
        self.update(|s| {
            s.amount_input = text;
            s.amount_error = error;
        });
    }

    pub fn set_reference(&self, text: impl Into<String>) {
        let text = text.into();
        let error = validate_reference_number(&text);
        self.update(|s| {
            s.reference_input = text;
            s.reference_error = error;
        });
    }

    /// Validates the form and runs a payment with it.
    ///
    /// Resolves when the transaction ends. Progress is visible in the state
    /// while it runs.
    pub async fn request_payment(&self) -> SessionResult<()> {
        let (amount_input, reference_input) = {
            let state = self.state.borrow();
            (state.amount_input.clone(), state.reference_input.clone())
        };

        let amount_error = validate_amount(&amount_input);
        let reference_error = validate_reference_number(&reference_input);
        if amount_error.is_some() || reference_error.is_some() {
            self.update(|s| {
                s.amount_error = amount_error;
                s.reference_error = reference_error;
            });
            return Err(SessionError::InvalidInput {
                amount: amount_error,
                reference: reference_error,
            });
        }
        let amount = convert_amount(&amount_input).map_err(|err| SessionError::InvalidInput {
            amount: Some(err),
            reference: None,
        })?;

        let _busy = self.begin(Activity::Payment)?;
        self.update(|s| {
            s.is_loading = true;
            s.payment_progress = None;
            s.show_success = false;
        });

        let mut progress =
            self.orchestrator
                .start_payment(amount, self.currency.clone(), reference_input);
        while let Some(event) = progress.next().await {
            match event {
                Ok(step) => self.update(|s| {
                    s.payment_progress = Some(step);
                    s.show_success = step.is_completed();
                }),
                Err(err) => {
                    self.update(|s| {
                        s.is_loading = false;
                        s.show_success = false;
                    });
                    record_error(&self.state, err.reason.clone());
                    return Err(err.into());
                }
            }
        }

        info!(%amount, currency = %self.currency, "Payment finished");
        self.update(|s| s.is_loading = false);
        Ok(())
    }

    // =========================================================================
    // Acknowledgements
    // =========================================================================

    /// Clears the error slot so the next error can be shown.
    pub fn acknowledge_error(&self) {
        self.update(|s| s.last_error = None);
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(active) = lock(&self.discovery).take() {
            active.stop();
        }
        for task in lock(&self.forwarders).drain(..) {
            task.abort();
        }
    }
}

// =============================================================================
// Background Tasks
// =============================================================================

async fn follow_discovery(
    mut readers: DiscoveryStream,
    state: SharedState,
    live: Arc<AtomicU64>,
    generation: u64,
) {
    let mut waiting = true;
    while let Some(update) = readers.next().await {
        waiting = false;
        match update {
            Ok(found) => apply_if_current(&state, &live, generation, |s| {
                s.discovered_readers = found;
                s.is_loading = false;
            }),
            Err(reason) => apply_if_current(&state, &live, generation, |s| {
                s.is_loading = false;
                store_error(s, reason);
            }),
        }
    }
    if waiting {
        apply_if_current(&state, &live, generation, |s| s.is_loading = false);
    }
}

/// Applies a discovery update unless a newer discovery has started since.
///
/// The generation is checked under the watch lock, so a replaced follower
/// cannot write after its successor has.
fn apply_if_current(
    state: &SharedState,
    live: &AtomicU64,
    generation: u64,
    f: impl FnOnce(&mut SessionState),
) {
    state.send_if_modified(|s| {
        if live.load(Ordering::SeqCst) != generation {
            debug!(generation, "Dropping update from replaced discovery");
            return false;
        }
        f(s);
        true
    });
}

/// Mirrors a session status channel into the state.
fn forward<T, F>(state: SharedState, mut rx: watch::Receiver<T>, apply: F) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(&mut SessionState, T) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let value = rx.borrow_and_update().clone();
            state.send_modify(|s| apply(s, value));
            if rx.changed().await.is_err() {
                break;
            }
        }
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
