//! # Reader Session
//!
//! Sole owner of the terminal SDK handle. Turns the SDK's callbacks into
//! async results, status channels and discovery streams, and classifies
//! every failure before it leaves.
//!
//! ## Connection State Machine
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   NotConnected ──connect()──► Connecting ──ok──► Connected              │
//! │        ▲                          │                  │                  │
//! │        └────────── failure ───────┘                  │                  │
//! │        └────────── unexpected disconnect ────────────┘                  │
//! │                                                                         │
//! │   Only one connect may be in flight; a second one is rejected with     │
//! │   ReaderConnectionError. Only one discovery may be active; a second    │
//! │   one yields ReaderDiscoveryError.                                     │
//! │                                                                         │
//! │   A connect that times out keeps the lock until the SDK settles it; a  │
//! │   reader that connects late is disconnected again.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use tapline_core::{
    classify, ConnectionStatus, ErrorReason, Failure, PaymentIntent, PaymentIntentRef,
    PaymentStatus, Reader, TerminalErrorCode, TerminalFault,
};

use crate::backend::BackendGateway;
use crate::discovery::{DiscoveryEvent, DiscoveryStream};
use crate::sdk::{
    Completion, ConnectionConfig, ConnectionTokenProvider, DiscoveryConfig, PlatformContext,
    ReadersCallback, TerminalListener, TerminalSdk,
};

// =============================================================================
// SDK Plumbing
// =============================================================================

/// Status channels fed by the SDK listener.
///
/// `Connected` is published by the session together with the reader, never
/// by the listener. While a timed-out connect is still running in the SDK,
/// its status events are dropped.
struct StatusChannels {
    connection: watch::Sender<ConnectionStatus>,
    payment: watch::Sender<PaymentStatus>,
    reader: watch::Sender<Option<Reader>>,
    abandoned_connect: AtomicBool,
}

impl StatusChannels {
    fn set_disconnected(&self) {
        self.reader.send_replace(None);
        self.connection.send_replace(ConnectionStatus::NotConnected);
    }
}

impl TerminalListener for StatusChannels {
    fn on_connection_status_change(&self, status: ConnectionStatus) {
        if self.abandoned_connect.load(Ordering::SeqCst) {
            debug!(%status, "Ignoring status from abandoned connect");
            return;
        }
        debug!(%status, "Connection status changed");
        if status != ConnectionStatus::Connected {
            self.connection.send_replace(status);
        }
    }

    fn on_payment_status_change(&self, status: PaymentStatus) {
        if self.abandoned_connect.load(Ordering::SeqCst) {
            debug!(%status, "Ignoring payment status from abandoned connect");
            return;
        }
        debug!(%status, "Payment status changed");
        self.payment.send_replace(status);
    }

    fn on_unexpected_reader_disconnect(&self, reader: Reader) {
        warn!(serial = %reader.serial_number, "Reader disconnected unexpectedly");
        self.set_disconnected();
    }
}

/// Connection tokens straight from the backend; any failure is tagged as a
/// token failure.
struct BackendTokenProvider {
    backend: Arc<dyn BackendGateway>,
}

#[async_trait]
impl ConnectionTokenProvider for BackendTokenProvider {
    async fn fetch_connection_token(&self) -> Result<String, Failure> {
        self.backend
            .get_connection_token()
            .await
            .map_err(|failure| match failure {
                Failure::ConnectionToken { .. } => failure,
                other => Failure::connection_token(other.to_string()),
            })
    }
}

type Pending<T> = oneshot::Receiver<Result<T, TerminalFault>>;

/// Hands an SDK completion to a oneshot receiver.
fn completion_channel<T: Send + 'static>() -> (Completion<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    let done: Completion<T> = Box::new(move |result| {
        let _ = tx.send(result);
    });
    (done, rx)
}

fn settle<T>(received: Result<Result<T, TerminalFault>, oneshot::error::RecvError>) -> Result<T, Failure> {
    match received {
        Ok(result) => result.map_err(Failure::from),
        Err(_) => Err(Failure::terminal(
            TerminalErrorCode::UnexpectedSdkError,
            "SDK dropped a callback without completing it",
        )),
    }
}

/// Awaits a single-shot SDK completion.
async fn completion<T, F>(start: F) -> Result<T, Failure>
where
    T: Send + 'static,
    F: FnOnce(Completion<T>),
{
    let (done, rx) = completion_channel();
    start(done);
    settle(rx.await)
}

/// SDK faults raised by the token provider become token failures.
fn tag_token_fault(failure: Failure) -> Failure {
    match failure {
        Failure::Terminal(fault) if fault.code == TerminalErrorCode::ConnectionTokenProviderError => {
            Failure::connection_token(fault.message)
        }
        other => other,
    }
}

// =============================================================================
// Reader Session
// =============================================================================

/// Owns the SDK lifecycle for one process.
pub struct ReaderSession {
    sdk: Arc<dyn TerminalSdk>,
    backend: Arc<dyn BackendGateway>,
    status: Arc<StatusChannels>,
    connect_lock: Arc<Mutex<()>>,
    discovery_active: Arc<AtomicBool>,
    connect_timeout: Option<Duration>,
}

impl ReaderSession {
    pub fn new(sdk: Arc<dyn TerminalSdk>, backend: Arc<dyn BackendGateway>) -> Self {
        ReaderSession {
            sdk,
            backend,
            status: Arc::new(StatusChannels {
                connection: watch::channel(ConnectionStatus::NotConnected).0,
                payment: watch::channel(PaymentStatus::NotReady).0,
                reader: watch::channel(None).0,
                abandoned_connect: AtomicBool::new(false),
            }),
            connect_lock: Arc::new(Mutex::new(())),
            discovery_active: Arc::new(AtomicBool::new(false)),
            connect_timeout: None,
        }
    }

    /// Bounds every connect attempt.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Initializes the SDK once. Later calls succeed without side effects.
    pub fn initialize(&self, context: &PlatformContext) -> Result<(), ErrorReason> {
        if self.sdk.is_initialized() {
            debug!("Terminal already initialized");
            return Ok(());
        }

        let provider = Arc::new(BackendTokenProvider {
            backend: self.backend.clone(),
        });

        self.sdk
            .initialize(context, provider, self.status.clone())
            .map_err(|fault| {
                warn!(error = %fault, "Terminal initialization failed");
                classify(&fault.into())
            })?;

        info!(app = %context.application_name, "Terminal initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.sdk.is_initialized()
    }

    fn ensure_initialized(&self) -> Result<(), Failure> {
        if self.sdk.is_initialized() {
            Ok(())
        } else {
            Err(Failure::terminal(
                TerminalErrorCode::NotInitialized,
                "Terminal SDK is not initialized",
            ))
        }
    }

    // =========================================================================
    // Observables
    // =========================================================================

    pub fn connection_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.connection.subscribe()
    }

    pub fn payment_status(&self) -> watch::Receiver<PaymentStatus> {
        self.status.payment.subscribe()
    }

    pub fn connected_reader(&self) -> watch::Receiver<Option<Reader>> {
        self.status.reader.subscribe()
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Starts a discovery cycle.
    ///
    /// Scanning begins immediately and stops when the returned stream is
    /// cancelled, dropped, fails or ends. Calling again after that starts a
    /// fresh scan.
    pub fn discover_readers(&self, config: &DiscoveryConfig) -> DiscoveryStream {
        if let Err(failure) = self.ensure_initialized() {
            return DiscoveryStream::failed(classify(&failure));
        }
        if self.discovery_active.swap(true, Ordering::SeqCst) {
            warn!("Discovery requested while another discovery is active");
            return DiscoveryStream::failed(classify(&Failure::DiscoveryInProgress));
        }

        info!(method = %config.method, simulated = config.simulated, "Discovering readers");

        let (tx, rx) = mpsc::unbounded_channel();
        let updates = tx.clone();
        let on_update: ReadersCallback = Box::new(move |readers| {
            debug!(count = readers.len(), "Discovered readers");
            let _ = updates.send(DiscoveryEvent::Readers(readers));
        });
        let done: Completion<()> = Box::new(move |result| {
            let event = match result {
                Ok(()) => {
                    debug!("Discovery finished");
                    DiscoveryEvent::Finished
                }
                Err(fault) => {
                    if fault.code != TerminalErrorCode::Canceled {
                        warn!(error = %fault, "Failed to discover readers");
                    }
                    DiscoveryEvent::Failed(classify(&fault.into()))
                }
            };
            let _ = tx.send(event);
        });

        let cancelable = self.sdk.discover_readers(config, on_update, done);
        DiscoveryStream::new(rx, cancelable, self.discovery_active.clone())
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to `reader`. Single attempt, no retry.
    pub async fn connect(
        &self,
        reader: &Reader,
        config: &ConnectionConfig,
    ) -> Result<Reader, ErrorReason> {
        self.try_connect(reader, config).await.map_err(|failure| {
            warn!(serial = %reader.serial_number, error = %failure, "Failed to connect to reader");
            classify(&failure)
        })
    }

    async fn try_connect(&self, reader: &Reader, config: &ConnectionConfig) -> Result<Reader, Failure> {
        let in_flight = self
            .connect_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Failure::ConnectInFlight)?;
        self.ensure_initialized()?;

        info!(serial = %reader.serial_number, "Connecting to reader");
        let (done, mut pending) = completion_channel();
        self.sdk.connect_internet_reader(reader, config, done);

        let outcome = match self.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut pending).await {
                Ok(received) => settle(received),
                Err(_) => {
                    self.abandon_connect(pending, in_flight);
                    return Err(Failure::terminal(
                        TerminalErrorCode::ReaderCommunicationError,
                        format!("Timed out after {}s connecting to reader", limit.as_secs()),
                    ));
                }
            },
            None => settle(pending.await),
        };

        match outcome {
            Ok(connected) => {
                info!(serial = %connected.serial_number, "Connected to reader");
                self.status.reader.send_replace(Some(connected.clone()));
                self.status.connection.send_replace(ConnectionStatus::Connected);
                Ok(connected)
            }
            Err(failure) => {
                self.status.set_disconnected();
                Err(tag_token_fault(failure))
            }
        }
    }

    /// Waits out a timed-out connect in the background.
    ///
    /// The connect lock stays held until the SDK reports back, and a reader
    /// that connects late is disconnected again. Status stays
    /// `NotConnected` throughout.
    fn abandon_connect(
        &self,
        pending: Pending<Reader>,
        in_flight: OwnedMutexGuard<()>,
    ) {
        self.status.abandoned_connect.store(true, Ordering::SeqCst);
        self.status.set_disconnected();

        let sdk = self.sdk.clone();
        let status = self.status.clone();
        tokio::spawn(async move {
            let _in_flight = in_flight;
            if let Ok(Ok(late)) = pending.await {
                warn!(serial = %late.serial_number, "Reader connected after timeout, disconnecting");
                let (done, disconnected) = completion_channel();
                sdk.disconnect_reader(done);
                if let Err(failure) = settle(disconnected.await) {
                    warn!(error = %failure, "Failed to disconnect late reader");
                }
            }
            status.abandoned_connect.store(false, Ordering::SeqCst);
            status.set_disconnected();
            status.payment.send_replace(PaymentStatus::NotReady);
            debug!("Abandoned connect settled");
        });
    }

    // =========================================================================
    // Payment Steps
    // =========================================================================

    /// Fetches the hardware-usable intent for a backend intent.
    pub async fn retrieve_payment_intent(
        &self,
        intent: &PaymentIntentRef,
    ) -> Result<PaymentIntent, ErrorReason> {
        debug!(intent_id = %intent.id, "Retrieving payment intent");
        self.payment_step("retrieve payment intent", |sdk, done| {
            sdk.retrieve_payment_intent(&intent.client_secret, done)
        })
        .await
    }

    /// Waits for the customer to present a card.
    pub async fn collect_payment_method(
        &self,
        intent: PaymentIntent,
    ) -> Result<PaymentIntent, ErrorReason> {
        debug!(intent_id = %intent.id, "Collecting payment method");
        self.payment_step("collect payment method", move |sdk, done| {
            sdk.collect_payment_method(intent, done)
        })
        .await
    }

    /// Authorizes the charge on the reader.
    pub async fn process_payment(&self, intent: PaymentIntent) -> Result<PaymentIntent, ErrorReason> {
        debug!(intent_id = %intent.id, "Processing payment");
        self.payment_step("process payment", move |sdk, done| {
            sdk.process_payment(intent, done)
        })
        .await
    }

    async fn payment_step<F>(&self, step: &'static str, start: F) -> Result<PaymentIntent, ErrorReason>
    where
        F: FnOnce(&dyn TerminalSdk, Completion<PaymentIntent>),
    {
        let result = match self.ensure_initialized() {
            Ok(()) => completion(|done| start(self.sdk.as_ref(), done)).await,
            Err(failure) => Err(failure),
        };

        result.map_err(|failure| {
            warn!(step, error = %failure, "Payment step failed");
            classify(&failure)
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, StubBackend};
    use crate::simulator::{SimulatedStep, SimulatedTerminal};
    use futures_util::StreamExt;
    use tapline_core::IntentStatus;

    fn session() -> (Arc<SimulatedTerminal>, Arc<StubBackend>, ReaderSession) {
        let sim = Arc::new(SimulatedTerminal::new().with_cycle_interval(Duration::from_millis(10)));
        let backend = Arc::new(StubBackend::new());
        let session = ReaderSession::new(sim.clone(), backend.clone());
        (sim, backend, session)
    }

    fn ready_session() -> (Arc<SimulatedTerminal>, Arc<StubBackend>, ReaderSession) {
        let (sim, backend, session) = session();
        session.initialize(&PlatformContext::default()).unwrap();
        (sim, backend, session)
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (sim, _, session) = session();
        session.initialize(&PlatformContext::default()).unwrap();
        session.initialize(&PlatformContext::default()).unwrap();
        assert_eq!(sim.calls().initialize, 1);
    }

    #[tokio::test]
    async fn test_initialize_failure_is_classified() {
        let (sim, _, session) = session();
        sim.fail_next(
            SimulatedStep::Initialize,
            TerminalFault::new(TerminalErrorCode::UnexpectedSdkError, "no location"),
        );
        assert_eq!(
            session.initialize(&PlatformContext::default()),
            Err(ErrorReason::TerminalError(Some("no location".into())))
        );
    }

    #[tokio::test]
    async fn test_calls_before_initialize_fail() {
        let (_, _, session) = session();
        let err = session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorReason::TerminalError(_)));

        let mut discovery = session.discover_readers(&DiscoveryConfig::default());
        assert!(matches!(
            discovery.next().await,
            Some(Err(ErrorReason::TerminalError(_)))
        ));
    }

    #[tokio::test]
    async fn test_connect_success_updates_status() {
        let (_, backend, session) = ready_session();
        let status = session.connection_status();
        let reader = session.connected_reader();

        session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap();

        assert_eq!(*status.borrow(), ConnectionStatus::Connected);
        assert_eq!(
            reader.borrow().as_ref().map(|r| r.serial_number.clone()),
            Some("SIM-WPE-0001".to_string())
        );
        assert_eq!(*session.payment_status().borrow(), PaymentStatus::Ready);
        assert_eq!(backend.calls().connection_token, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_forces_not_connected() {
        let (sim, _, session) = ready_session();
        sim.fail_next(
            SimulatedStep::Connect,
            TerminalFault::new(TerminalErrorCode::ReaderBusy, "in use"),
        );

        let err = session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap_err();

        assert_eq!(err, ErrorReason::TerminalError(Some("in use".into())));
        assert_eq!(*session.connection_status().borrow(), ConnectionStatus::NotConnected);
        assert!(session.connected_reader().borrow().is_none());
    }

    #[tokio::test]
    async fn test_token_failure_is_api_error() {
        let (_, backend, session) = ready_session();
        backend.fail_next(BackendCall::ConnectionToken, Failure::http(500, None, "boom"));

        let err = session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorReason::ApiError(Some(_))));
    }

    #[tokio::test]
    async fn test_concurrent_connect_is_rejected() {
        let sim = Arc::new(SimulatedTerminal::new().with_step_delay(Duration::from_millis(50)));
        let session = Arc::new(ReaderSession::new(sim.clone(), Arc::new(StubBackend::new())));
        session.initialize(&PlatformContext::default()).unwrap();

        let first = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = session
            .connect(&Reader::new("SIM-S700-0002"), &ConnectionConfig::default())
            .await;
        assert_eq!(second, Err(ErrorReason::ReaderConnectionError));

        assert!(first.await.unwrap().is_ok());
        assert_eq!(sim.calls().connect, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout() {
        let sim = Arc::new(SimulatedTerminal::new().with_step_delay(Duration::from_secs(30)));
        let session = ReaderSession::new(sim.clone(), Arc::new(StubBackend::new()))
            .with_connect_timeout(Some(Duration::from_secs(5)));
        session.initialize(&PlatformContext::default()).unwrap();

        let err = session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ErrorReason::TerminalError(_)));
        assert_eq!(*session.connection_status().borrow(), ConnectionStatus::NotConnected);

        // The SDK connect is still running, so the lock is still held.
        let second = session
            .connect(&Reader::new("SIM-S700-0002"), &ConnectionConfig::default())
            .await;
        assert_eq!(second, Err(ErrorReason::ReaderConnectionError));

        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(*session.connection_status().borrow(), ConnectionStatus::NotConnected);
        assert_eq!(*session.payment_status().borrow(), PaymentStatus::NotReady);
        assert!(session.connected_reader().borrow().is_none());
        assert!(sim.connected_reader().is_none());
        assert_eq!(sim.calls().connect, 1);
        assert_eq!(sim.calls().disconnect, 1);
        assert!(session.connect_lock.try_lock().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_within_timeout_succeeds() {
        let sim = Arc::new(SimulatedTerminal::new().with_step_delay(Duration::from_secs(2)));
        let session = ReaderSession::new(sim.clone(), Arc::new(StubBackend::new()))
            .with_connect_timeout(Some(Duration::from_secs(5)));
        session.initialize(&PlatformContext::default()).unwrap();

        let reader = session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap();
        assert_eq!(reader.serial_number, "SIM-WPE-0001");
        assert_eq!(*session.connection_status().borrow(), ConnectionStatus::Connected);
        assert_eq!(sim.calls().disconnect, 0);
    }

    #[tokio::test]
    async fn test_unexpected_disconnect() {
        let (sim, _, session) = ready_session();
        session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap();

        sim.simulate_disconnect();

        assert_eq!(*session.connection_status().borrow(), ConnectionStatus::NotConnected);
        assert!(session.connected_reader().borrow().is_none());
    }

    #[tokio::test]
    async fn test_discovery_cancel_exactly_once() {
        let (sim, _, session) = ready_session();

        let mut discovery = session.discover_readers(&DiscoveryConfig::default());
        let readers = discovery.next().await.unwrap().unwrap();
        assert_eq!(readers.len(), 2);

        discovery.cancel();
        discovery.cancel();
        drop(discovery);
        assert_eq!(sim.calls().cancel_discovery, 1);

        let mut again = session.discover_readers(&DiscoveryConfig::default());
        assert!(again.next().await.unwrap().is_ok());
        drop(again);
        assert_eq!(sim.calls().discover, 2);
        assert_eq!(sim.calls().cancel_discovery, 2);
    }

    #[tokio::test]
    async fn test_second_discovery_is_rejected() {
        let (sim, _, session) = ready_session();

        let _first = session.discover_readers(&DiscoveryConfig::default());
        let mut second = session.discover_readers(&DiscoveryConfig::default());

        assert_eq!(
            second.next().await,
            Some(Err(ErrorReason::ReaderDiscoveryError))
        );
        assert_eq!(sim.calls().discover, 1);
    }

    #[tokio::test]
    async fn test_discovery_failure_ends_stream() {
        let (sim, _, session) = ready_session();
        sim.fail_next(
            SimulatedStep::Discover,
            TerminalFault::new(TerminalErrorCode::ReaderCommunicationError, "offline"),
        );

        let mut discovery = session.discover_readers(&DiscoveryConfig::default());
        assert_eq!(
            discovery.next().await,
            Some(Err(ErrorReason::TerminalError(Some("offline".into()))))
        );
        assert_eq!(discovery.next().await, None);
        assert_eq!(sim.calls().cancel_discovery, 1);
    }

    #[tokio::test]
    async fn test_payment_steps() {
        let (_, _, session) = ready_session();
        session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap();

        let intent_ref = PaymentIntentRef {
            id: "pi_9".into(),
            client_secret: "pi_9_secret_x".into(),
        };
        let intent = session.retrieve_payment_intent(&intent_ref).await.unwrap();
        assert_eq!(intent.id, "pi_9");

        let intent = session.collect_payment_method(intent).await.unwrap();
        assert_eq!(intent.status, IntentStatus::RequiresConfirmation);

        let intent = session.process_payment(intent).await.unwrap();
        assert!(intent.is_ready_for_capture());
    }
}
