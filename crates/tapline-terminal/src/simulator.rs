//! # Simulated Terminal
//!
//! An in-memory [`TerminalSdk`] standing in for reader hardware.
//!
//! ## Behaviour
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       SimulatedTerminal                                 │
//! │                                                                         │
//! │  discover  ──► readers ──► (cycle_interval) ──► readers ──► ...         │
//! │                 until cancelled, or until timeout_secs elapses          │
//! │                                                                         │
//! │  connect   ──► Connecting ──► fetch token ──► Connected + Ready         │
//! │                                                                         │
//! │  retrieve  ──► RequiresPaymentMethod                                    │
//! │  collect   ──► RequiresConfirmation                                     │
//! │  process   ──► Processing ──► RequiresCapture ──► Ready                 │
//! │                                                                         │
//! │  fail_next(step, fault) makes the next call of that step fail.         │
//! │  simulate_disconnect() drops the reader as hardware would.             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Completions always run on a spawned tokio task, never inline, so callers
//! see the same asynchrony a real SDK has.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

use tapline_core::{
    ConnectionStatus, IntentStatus, Money, PaymentIntent, PaymentStatus, Reader,
    TerminalErrorCode, TerminalFault, DEFAULT_CURRENCY,
};

use crate::backend::lock;
use crate::sdk::{
    Cancelable, Completion, ConnectionConfig, ConnectionTokenProvider, DiscoveryConfig,
    PlatformContext, ReadersCallback, TerminalListener, TerminalSdk,
};

/// SDK operations a fault can be injected into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimulatedStep {
    Initialize,
    Discover,
    Connect,
    RetrievePaymentIntent,
    CollectPaymentMethod,
    ProcessPayment,
}

/// How often each SDK entry point was invoked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimulatorCalls {
    pub initialize: usize,
    pub discover: usize,
    pub cancel_discovery: usize,
    pub connect: usize,
    pub disconnect: usize,
    pub retrieve: usize,
    pub collect: usize,
    pub process: usize,
}

#[derive(Default)]
struct SimState {
    initialized: bool,
    token_provider: Option<Arc<dyn ConnectionTokenProvider>>,
    listener: Option<Arc<dyn TerminalListener>>,
    connected: Option<Reader>,
    faults: HashMap<SimulatedStep, TerminalFault>,
    calls: SimulatorCalls,
}

impl SimState {
    fn notify(&self, f: impl FnOnce(&dyn TerminalListener)) {
        if let Some(listener) = &self.listener {
            f(listener.as_ref());
        }
    }
}

/// In-memory terminal SDK.
pub struct SimulatedTerminal {
    readers: Vec<Reader>,
    cycle_interval: Duration,
    step_delay: Duration,
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTerminal {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTerminal {
    /// Creates a simulator offering two internet readers.
    pub fn new() -> Self {
        SimulatedTerminal {
            readers: vec![
                Reader::new("SIM-WPE-0001")
                    .with_label("Simulated WisePOS E")
                    .with_ip_address("192.168.1.21"),
                Reader::new("SIM-S700-0002")
                    .with_label("Simulated S700")
                    .with_ip_address("192.168.1.22"),
            ],
            cycle_interval: Duration::from_secs(1),
            step_delay: Duration::ZERO,
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// Replaces the readers reported by every discovery cycle.
    #[must_use]
    pub fn with_readers(mut self, readers: Vec<Reader>) -> Self {
        self.readers = readers;
        self
    }

    /// Sets the pause between discovery cycles.
    #[must_use]
    pub fn with_cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = interval;
        self
    }

    /// Sets an artificial latency applied to every hardware step.
    #[must_use]
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Makes the next call of `step` fail with `fault`.
    pub fn fail_next(&self, step: SimulatedStep, fault: TerminalFault) {
        lock(&self.state).faults.insert(step, fault);
    }

    pub fn calls(&self) -> SimulatorCalls {
        lock(&self.state).calls
    }

    pub fn connected_reader(&self) -> Option<Reader> {
        lock(&self.state).connected.clone()
    }

    /// Drops the connected reader and reports it as an unexpected disconnect.
    pub fn simulate_disconnect(&self) {
        let mut state = lock(&self.state);
        if let Some(reader) = state.connected.take() {
            debug!(serial = %reader.serial_number, "Simulating unexpected reader disconnect");
            state.notify(|l| {
                l.on_unexpected_reader_disconnect(reader);
                l.on_connection_status_change(ConnectionStatus::NotConnected);
                l.on_payment_status_change(PaymentStatus::NotReady);
            });
        }
    }

    fn spawn_step<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.step_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            fut.await;
        });
    }

    /// Shared precondition checks for the payment steps.
    fn check_payment_step(
        state: &mut SimState,
        step: SimulatedStep,
    ) -> Result<(), TerminalFault> {
        if !state.initialized {
            return Err(not_initialized());
        }
        if state.connected.is_none() {
            return Err(TerminalFault::new(
                TerminalErrorCode::NotConnectedToReader,
                "No reader is connected",
            ));
        }
        match state.faults.remove(&step) {
            Some(fault) => Err(fault),
            None => Ok(()),
        }
    }
}

fn not_initialized() -> TerminalFault {
    TerminalFault::new(
        TerminalErrorCode::NotInitialized,
        "Terminal SDK is not initialized",
    )
}

fn unexpected_status(intent: &PaymentIntent, expected: IntentStatus) -> TerminalFault {
    TerminalFault::new(
        TerminalErrorCode::UnexpectedSdkError,
        format!(
            "Intent {} is {:?}, expected {:?}",
            intent.id, intent.status, expected
        ),
    )
}

impl TerminalSdk for SimulatedTerminal {
    fn is_initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    fn initialize(
        &self,
        context: &PlatformContext,
        token_provider: Arc<dyn ConnectionTokenProvider>,
        listener: Arc<dyn TerminalListener>,
    ) -> Result<(), TerminalFault> {
        let mut state = lock(&self.state);
        state.calls.initialize += 1;

        if let Some(fault) = state.faults.remove(&SimulatedStep::Initialize) {
            return Err(fault);
        }
        if state.initialized {
            return Err(TerminalFault::new(
                TerminalErrorCode::AlreadyInitialized,
                "Terminal SDK is already initialized",
            ));
        }

        debug!(app = %context.application_name, "Simulated terminal initialized");
        state.initialized = true;
        state.token_provider = Some(token_provider);
        state.listener = Some(listener);
        Ok(())
    }

    fn discover_readers(
        &self,
        config: &DiscoveryConfig,
        on_update: ReadersCallback,
        done: Completion<()>,
    ) -> Box<dyn Cancelable> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());
        let handle = Box::new(SimulatedDiscovery {
            state: self.state.clone(),
            cancelled: cancelled.clone(),
            stop: stop.clone(),
        });

        let precheck = {
            let mut state = lock(&self.state);
            state.calls.discover += 1;
            if !state.initialized {
                Err(not_initialized())
            } else {
                state
                    .faults
                    .remove(&SimulatedStep::Discover)
                    .map_or(Ok(()), Err)
            }
        };

        let readers = self.readers.clone();
        let interval = self.cycle_interval;
        let scan_for = (config.timeout_secs > 0)
            .then(|| Duration::from_secs(u64::from(config.timeout_secs)));

        tokio::spawn(async move {
            if let Err(fault) = precheck {
                done(Err(fault));
                return;
            }

            let started = tokio::time::Instant::now();
            loop {
                if cancelled.load(Ordering::SeqCst) {
                    break;
                }
                on_update(readers.clone());

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop.notified() => break,
                }

                if scan_for.is_some_and(|limit| started.elapsed() >= limit) {
                    done(Ok(()));
                    return;
                }
            }

            done(Err(TerminalFault::new(
                TerminalErrorCode::Canceled,
                "Discovery was canceled",
            )));
        });

        handle
    }

    fn connect_internet_reader(
        &self,
        reader: &Reader,
        config: &ConnectionConfig,
        done: Completion<Reader>,
    ) {
        let (precheck, provider, listener) = {
            let mut state = lock(&self.state);
            state.calls.connect += 1;
            let precheck = if !state.initialized {
                Err(not_initialized())
            } else {
                state
                    .faults
                    .remove(&SimulatedStep::Connect)
                    .map_or(Ok(()), Err)
            };
            (precheck, state.token_provider.clone(), state.listener.clone())
        };

        let known = self
            .readers
            .iter()
            .any(|r| r.serial_number == reader.serial_number);
        let reader = reader.clone();
        let fail_if_in_use = config.fail_if_in_use;
        let state = self.state.clone();

        if precheck.is_ok() {
            if let Some(listener) = &listener {
                listener.on_connection_status_change(ConnectionStatus::Connecting);
            }
        }

        self.spawn_step(async move {
            let failed = |fault: TerminalFault, done: Completion<Reader>| {
                if let Some(listener) = &listener {
                    listener.on_connection_status_change(ConnectionStatus::NotConnected);
                }
                done(Err(fault));
            };

            if let Err(fault) = precheck {
                // Not initialized: no listener events.
                if fault.code == TerminalErrorCode::NotInitialized {
                    done(Err(fault));
                } else {
                    failed(fault, done);
                }
                return;
            }

            let token = match &provider {
                Some(provider) => provider.fetch_connection_token().await,
                None => {
                    failed(not_initialized(), done);
                    return;
                }
            };
            if let Err(failure) = token {
                failed(
                    TerminalFault::new(
                        TerminalErrorCode::ConnectionTokenProviderError,
                        failure.to_string(),
                    ),
                    done,
                );
                return;
            }

            if !known {
                failed(
                    TerminalFault::new(
                        TerminalErrorCode::ReaderCommunicationError,
                        format!("Reader {} is not reachable", reader.serial_number),
                    ),
                    done,
                );
                return;
            }

            debug!(serial = %reader.serial_number, fail_if_in_use, "Simulated reader connected");
            lock(&state).connected = Some(reader.clone());
            if let Some(listener) = &listener {
                listener.on_connection_status_change(ConnectionStatus::Connected);
                listener.on_payment_status_change(PaymentStatus::Ready);
            }
            done(Ok(reader));
        });
    }

    fn disconnect_reader(&self, done: Completion<()>) {
        let mut state = lock(&self.state);
        state.calls.disconnect += 1;
        if let Some(reader) = state.connected.take() {
            debug!(serial = %reader.serial_number, "Simulated reader disconnected");
            state.notify(|l| {
                l.on_connection_status_change(ConnectionStatus::NotConnected);
                l.on_payment_status_change(PaymentStatus::NotReady);
            });
        }
        drop(state);
        done(Ok(()));
    }

    fn retrieve_payment_intent(&self, client_secret: &str, done: Completion<PaymentIntent>) {
        let precheck = {
            let mut state = lock(&self.state);
            state.calls.retrieve += 1;
            Self::check_payment_step(&mut state, SimulatedStep::RetrievePaymentIntent)
        };

        // Client secrets are shaped `{intent_id}_secret_{random}`.
        let result = precheck.and_then(|()| match client_secret.split_once("_secret_") {
            Some((id, _)) if !id.is_empty() => Ok(PaymentIntent {
                id: id.to_string(),
                amount: Money::default(),
                currency: DEFAULT_CURRENCY.to_string(),
                status: IntentStatus::RequiresPaymentMethod,
            }),
            _ => Err(TerminalFault::new(
                TerminalErrorCode::UnexpectedSdkError,
                "Malformed client secret",
            )),
        });

        self.spawn_step(async move { done(result) });
    }

    fn collect_payment_method(&self, intent: PaymentIntent, done: Completion<PaymentIntent>) {
        let precheck = {
            let mut state = lock(&self.state);
            state.calls.collect += 1;
            Self::check_payment_step(&mut state, SimulatedStep::CollectPaymentMethod)
        };

        let result = precheck.and_then(|()| {
            if intent.status != IntentStatus::RequiresPaymentMethod {
                return Err(unexpected_status(&intent, IntentStatus::RequiresPaymentMethod));
            }
            Ok(PaymentIntent {
                status: IntentStatus::RequiresConfirmation,
                ..intent
            })
        });

        self.spawn_step(async move { done(result) });
    }

    fn process_payment(&self, intent: PaymentIntent, done: Completion<PaymentIntent>) {
        let (precheck, listener) = {
            let mut state = lock(&self.state);
            state.calls.process += 1;
            let precheck = Self::check_payment_step(&mut state, SimulatedStep::ProcessPayment);
            (precheck, state.listener.clone())
        };

        let result = precheck.and_then(|()| {
            if intent.status != IntentStatus::RequiresConfirmation {
                return Err(unexpected_status(&intent, IntentStatus::RequiresConfirmation));
            }
            Ok(PaymentIntent {
                status: IntentStatus::RequiresCapture,
                ..intent
            })
        });

        if let Some(listener) = &listener {
            listener.on_payment_status_change(PaymentStatus::Processing);
        }

        self.spawn_step(async move {
            if let Some(listener) = &listener {
                listener.on_payment_status_change(PaymentStatus::Ready);
            }
            done(result);
        });
    }
}

// =============================================================================
// Discovery Handle
// =============================================================================

struct SimulatedDiscovery {
    state: Arc<Mutex<SimState>>,
    cancelled: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl Cancelable for SimulatedDiscovery {
    fn cancel(&self, done: Completion<()>) {
        lock(&self.state).calls.cancel_discovery += 1;
        self.cancelled.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        done(Ok(()));
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tapline_core::Failure;
    use tokio::sync::{mpsc, oneshot};

    struct StaticToken;

    #[async_trait]
    impl ConnectionTokenProvider for StaticToken {
        async fn fetch_connection_token(&self) -> Result<String, Failure> {
            Ok("pst_test".into())
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl TerminalListener for Recorder {
        fn on_connection_status_change(&self, status: ConnectionStatus) {
            lock(&self.events).push(format!("connection:{status}"));
        }
        fn on_payment_status_change(&self, status: PaymentStatus) {
            lock(&self.events).push(format!("payment:{status}"));
        }
        fn on_unexpected_reader_disconnect(&self, reader: Reader) {
            lock(&self.events).push(format!("disconnect:{}", reader.serial_number));
        }
    }

    fn initialized() -> (SimulatedTerminal, Arc<Recorder>) {
        let sim = SimulatedTerminal::new();
        let recorder = Arc::new(Recorder::default());
        sim.initialize(&PlatformContext::default(), Arc::new(StaticToken), recorder.clone())
            .unwrap();
        (sim, recorder)
    }

    async fn connect(sim: &SimulatedTerminal, serial: &str) -> Result<Reader, TerminalFault> {
        let (tx, rx) = oneshot::channel();
        sim.connect_internet_reader(
            &Reader::new(serial),
            &ConnectionConfig::default(),
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn test_initialize_twice_fails() {
        let (sim, recorder) = initialized();
        let err = sim
            .initialize(&PlatformContext::default(), Arc::new(StaticToken), recorder)
            .unwrap_err();
        assert_eq!(err.code, TerminalErrorCode::AlreadyInitialized);
    }

    #[tokio::test]
    async fn test_connect_emits_status_events() {
        let (sim, recorder) = initialized();
        let reader = connect(&sim, "SIM-WPE-0001").await.unwrap();
        assert_eq!(reader.serial_number, "SIM-WPE-0001");
        assert_eq!(sim.connected_reader(), Some(reader));

        let events = lock(&recorder.events).clone();
        assert_eq!(
            events,
            vec!["connection:connecting", "connection:connected", "payment:ready"]
        );

        sim.simulate_disconnect();
        assert!(sim.connected_reader().is_none());
        assert!(lock(&recorder.events).contains(&"disconnect:SIM-WPE-0001".to_string()));
    }

    #[tokio::test]
    async fn test_disconnect_reader() {
        let (sim, recorder) = initialized();
        connect(&sim, "SIM-WPE-0001").await.unwrap();
        lock(&recorder.events).clear();

        let (tx, rx) = oneshot::channel();
        sim.disconnect_reader(Box::new(move |r| {
            let _ = tx.send(r);
        }));
        rx.await.unwrap().unwrap();

        assert!(sim.connected_reader().is_none());
        assert_eq!(sim.calls().disconnect, 1);
        assert_eq!(
            lock(&recorder.events).clone(),
            vec!["connection:not_connected", "payment:not_ready"]
        );
    }

    #[tokio::test]
    async fn test_unknown_reader_fails() {
        let (sim, _) = initialized();
        let err = connect(&sim, "NOPE").await.unwrap_err();
        assert_eq!(err.code, TerminalErrorCode::ReaderCommunicationError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_cycles_until_cancelled() {
        let (sim, _) = initialized();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        let handle = sim.discover_readers(
            &DiscoveryConfig::default(),
            Box::new(move |readers| {
                let _ = tx.send(readers);
            }),
            Box::new(move |r| {
                let _ = done_tx.send(r);
            }),
        );

        assert_eq!(rx.recv().await.unwrap().len(), 2);
        assert_eq!(rx.recv().await.unwrap().len(), 2);

        handle.cancel(Box::new(|_| {}));
        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.unwrap_err().code, TerminalErrorCode::Canceled);
        assert_eq!(sim.calls().cancel_discovery, 1);
    }

    #[tokio::test]
    async fn test_payment_steps_require_connection() {
        let (sim, _) = initialized();
        let (tx, rx) = oneshot::channel();
        sim.retrieve_payment_intent(
            "pi_1_secret_x",
            Box::new(move |r| {
                let _ = tx.send(r);
            }),
        );
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.code, TerminalErrorCode::NotConnectedToReader);
    }
}
