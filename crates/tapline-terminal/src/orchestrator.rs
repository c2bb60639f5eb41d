//! # Payment Orchestrator
//!
//! Drives one card-present transaction from intent creation to capture and
//! reports progress as a stream.
//!
//! ## Transaction Protocol
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   emit PreparingPayment                                                 │
//! │     │                                                                   │
//! │     ├─► backend.create_payment_intent ───────────► CreateIntent         │
//! │     ├─► session.retrieve_payment_intent ─────────► RetrieveIntent       │
//! │     ├─► session.collect_payment_method ──────────► CollectPaymentMethod │
//! │     │                                                                   │
//! │   emit PaymentInProgress                                                │
//! │     │                                                                   │
//! │     ├─► session.process_payment ─────────────────► ProcessPayment       │
//! │     ├─► backend.capture_payment_intent ──────────► Capture              │
//! │     │                                               (charged, not       │
//! │   emit PaymentCompleted                              captured!)         │
//! │                                                                         │
//! │   Steps run strictly in order. The first failure is classified once,   │
//! │   emitted as PaymentError { stage, reason } and ends the stream.       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use tapline_core::{
    classify, ErrorReason, Failure, IntentStatus, Money, PaymentIntent, PaymentProgress,
};

use crate::backend::BackendGateway;
use crate::session::ReaderSession;

// =============================================================================
// Payment Error
// =============================================================================

/// The protocol step a transaction failed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentStage {
    CreateIntent,
    RetrieveIntent,
    CollectPaymentMethod,
    ProcessPayment,
    Capture,
}

impl fmt::Display for PaymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match self {
            PaymentStage::CreateIntent => "create_intent",
            PaymentStage::RetrieveIntent => "retrieve_intent",
            PaymentStage::CollectPaymentMethod => "collect_payment_method",
            PaymentStage::ProcessPayment => "process_payment",
            PaymentStage::Capture => "capture",
        };
        f.write_str(stage)
    }
}

/// A failed transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Payment failed at {stage}: {reason}")]
pub struct PaymentError {
    pub stage: PaymentStage,
    pub reason: ErrorReason,
}

impl PaymentError {
    /// True when the reader charged the card but the backend never captured
    /// the intent. Such a transaction needs manual reconciliation.
    pub fn requires_reconciliation(&self) -> bool {
        self.stage == PaymentStage::Capture
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs payment transactions against one reader session and backend.
#[derive(Clone)]
pub struct PaymentOrchestrator {
    session: Arc<ReaderSession>,
    backend: Arc<dyn BackendGateway>,
}

impl PaymentOrchestrator {
    pub fn new(session: Arc<ReaderSession>, backend: Arc<dyn BackendGateway>) -> Self {
        PaymentOrchestrator { session, backend }
    }

    /// Starts a transaction.
    ///
    /// Nothing happens until the stream is polled. On success the stream
    /// yields `PreparingPayment`, `PaymentInProgress` and `PaymentCompleted`
    /// and ends; on failure it yields the progress reached so far, then a
    /// single error, then ends. Dropping the stream abandons the transaction
    /// before the next step starts.
    pub fn start_payment(
        &self,
        amount: Money,
        currency: impl Into<String>,
        reference_number: impl Into<String>,
    ) -> BoxStream<'static, Result<PaymentProgress, PaymentError>> {
        let transaction = Transaction {
            session: self.session.clone(),
            backend: self.backend.clone(),
            amount,
            currency: currency.into(),
            reference_number: reference_number.into(),
        };

        stream::unfold(
            (Phase::Begin, transaction),
            |(phase, transaction)| async move {
                match phase {
                    Phase::Begin => {
                        info!(
                            amount = %transaction.amount,
                            currency = %transaction.currency,
                            reference = %transaction.reference_number,
                            "Starting payment"
                        );
                        Some((Ok(PaymentProgress::PreparingPayment), (Phase::Prepare, transaction)))
                    }
                    Phase::Prepare => match transaction.prepare().await {
                        Ok(intent) => Some((
                            Ok(PaymentProgress::PaymentInProgress),
                            (Phase::Charge(intent), transaction),
                        )),
                        Err(err) => Some((Err(transaction.failed(err)), (Phase::Done, transaction))),
                    },
                    Phase::Charge(intent) => match transaction.charge(intent).await {
                        Ok(()) => Some((Ok(PaymentProgress::PaymentCompleted), (Phase::Done, transaction))),
                        Err(err) => Some((Err(transaction.failed(err)), (Phase::Done, transaction))),
                    },
                    Phase::Done => None,
                }
            },
        )
        .boxed()
    }
}

// =============================================================================
// Transaction Steps
// =============================================================================

enum Phase {
    Begin,
    Prepare,
    Charge(PaymentIntent),
    Done,
}

struct Transaction {
    session: Arc<ReaderSession>,
    backend: Arc<dyn BackendGateway>,
    amount: Money,
    currency: String,
    reference_number: String,
}

impl Transaction {
    /// Create, retrieve and collect.
    async fn prepare(&self) -> Result<PaymentIntent, PaymentError> {
        if !self.amount.is_positive() {
            return Err(backend_failure(
                PaymentStage::CreateIntent,
                Failure::payment(format!("Amount must be positive, got {}", self.amount)),
            ));
        }

        let intent_ref = self
            .backend
            .create_payment_intent(self.amount, &self.currency, &self.reference_number)
            .await
            .map_err(|failure| backend_failure(PaymentStage::CreateIntent, failure))?;
        debug!(intent_id = %intent_ref.id, "Payment intent created");

        let intent = self
            .session
            .retrieve_payment_intent(&intent_ref)
            .await
            .map_err(|reason| at(PaymentStage::RetrieveIntent, reason))?;

        let intent = self
            .session
            .collect_payment_method(intent)
            .await
            .map_err(|reason| at(PaymentStage::CollectPaymentMethod, reason))?;
        debug!(intent_id = %intent.id, "Payment method collected");

        Ok(intent)
    }

    /// Process and capture.
    async fn charge(&self, intent: PaymentIntent) -> Result<(), PaymentError> {
        let intent = self
            .session
            .process_payment(intent)
            .await
            .map_err(|reason| at(PaymentStage::ProcessPayment, reason))?;

        if !intent.is_ready_for_capture() {
            return Err(backend_failure(
                PaymentStage::ProcessPayment,
                Failure::payment(unexpected_status(&intent)),
            ));
        }

        self.backend
            .capture_payment_intent(&intent.id)
            .await
            .map_err(|failure| backend_failure(PaymentStage::Capture, failure))?;

        info!(intent_id = %intent.id, amount = %self.amount, "Payment captured");
        Ok(())
    }

    fn failed(&self, err: PaymentError) -> PaymentError {
        if err.requires_reconciliation() {
            error!(
                stage = %err.stage,
                reason = %err.reason,
                reference = %self.reference_number,
                "Card charged but capture failed, reconciliation required"
            );
        } else {
            warn!(stage = %err.stage, reason = %err.reason, "Payment failed");
        }
        err
    }
}

fn at(stage: PaymentStage, reason: ErrorReason) -> PaymentError {
    PaymentError { stage, reason }
}

fn backend_failure(stage: PaymentStage, failure: Failure) -> PaymentError {
    at(stage, classify(&failure))
}

fn unexpected_status(intent: &PaymentIntent) -> String {
    let status = match intent.status {
        IntentStatus::RequiresPaymentMethod => "requires_payment_method",
        IntentStatus::RequiresConfirmation => "requires_confirmation",
        IntentStatus::RequiresCapture => "requires_capture",
        IntentStatus::Succeeded => "succeeded",
        IntentStatus::Canceled => "canceled",
    };
    format!("Intent {} is {} after processing", intent.id, status)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendCall, StubBackend};
    use crate::sdk::{ConnectionConfig, PlatformContext};
    use crate::simulator::{SimulatedStep, SimulatedTerminal};
    use tapline_core::{Reader, TerminalErrorCode, TerminalFault};

    async fn connected() -> (Arc<SimulatedTerminal>, Arc<StubBackend>, PaymentOrchestrator) {
        let sim = Arc::new(SimulatedTerminal::new());
        let backend = Arc::new(StubBackend::new());
        let session = Arc::new(ReaderSession::new(sim.clone(), backend.clone()));
        session.initialize(&PlatformContext::default()).unwrap();
        session
            .connect(&Reader::new("SIM-WPE-0001"), &ConnectionConfig::default())
            .await
            .unwrap();
        (sim, backend.clone(), PaymentOrchestrator::new(session, backend))
    }

    async fn run(
        orchestrator: &PaymentOrchestrator,
        amount: i64,
    ) -> Vec<Result<PaymentProgress, PaymentError>> {
        orchestrator
            .start_payment(Money::from_minor(amount), "czk", "123")
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_successful_payment_order() {
        let (sim, backend, orchestrator) = connected().await;

        let events = run(&orchestrator, 2000).await;

        assert_eq!(
            events,
            vec![
                Ok(PaymentProgress::PreparingPayment),
                Ok(PaymentProgress::PaymentInProgress),
                Ok(PaymentProgress::PaymentCompleted),
            ]
        );
        assert_eq!(backend.calls().capture, 1);
        assert_eq!(backend.captured(), vec!["pi_stub_1".to_string()]);
        assert_eq!(sim.calls().process, 1);
    }

    #[tokio::test]
    async fn test_capture_runs_before_completed() {
        let (sim, backend, orchestrator) = connected().await;
        let mut progress = orchestrator.start_payment(Money::from_minor(2000), "czk", "123");

        assert_eq!(progress.next().await, Some(Ok(PaymentProgress::PreparingPayment)));

        assert_eq!(progress.next().await, Some(Ok(PaymentProgress::PaymentInProgress)));
        assert_eq!(sim.calls().collect, 1);
        assert_eq!(sim.calls().process, 0);
        assert_eq!(backend.calls().capture, 0);

        assert_eq!(progress.next().await, Some(Ok(PaymentProgress::PaymentCompleted)));
        assert_eq!(sim.calls().process, 1);
        assert_eq!(backend.calls().capture, 1);

        assert_eq!(progress.next().await, None);
        assert_eq!(backend.calls().capture, 1);
    }

    #[tokio::test]
    async fn test_retrieve_failure_stops_sequence() {
        let (sim, backend, orchestrator) = connected().await;
        sim.fail_next(
            SimulatedStep::RetrievePaymentIntent,
            TerminalFault::new(TerminalErrorCode::ReaderCommunicationError, "lost"),
        );

        let events = run(&orchestrator, 2000).await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], Ok(PaymentProgress::PreparingPayment));
        assert_eq!(
            events[1],
            Err(PaymentError {
                stage: PaymentStage::RetrieveIntent,
                reason: ErrorReason::TerminalError(Some("lost".into())),
            })
        );
        assert_eq!(sim.calls().collect, 0);
        assert_eq!(sim.calls().process, 0);
        assert_eq!(backend.calls().capture, 0);
    }

    #[tokio::test]
    async fn test_create_intent_failure_is_classified() {
        let (sim, backend, orchestrator) = connected().await;
        backend.fail_next(BackendCall::CreateIntent, Failure::http(401, None, "Unauthorized"));

        let events = run(&orchestrator, 2000).await;

        assert_eq!(events.len(), 2);
        let err = events[1].clone().unwrap_err();
        assert_eq!(err.stage, PaymentStage::CreateIntent);
        assert_eq!(err.reason, ErrorReason::AccessDenied);
        assert_eq!(sim.calls().retrieve, 0);
    }

    #[tokio::test]
    async fn test_process_failure_after_in_progress() {
        let (sim, backend, orchestrator) = connected().await;
        sim.fail_next(
            SimulatedStep::ProcessPayment,
            TerminalFault::new(TerminalErrorCode::DeclinedByReader, "declined"),
        );

        let events = run(&orchestrator, 2000).await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[1], Ok(PaymentProgress::PaymentInProgress));
        let err = events[2].clone().unwrap_err();
        assert_eq!(err.stage, PaymentStage::ProcessPayment);
        assert!(!err.requires_reconciliation());
        assert_eq!(backend.calls().capture, 0);
    }

    #[tokio::test]
    async fn test_capture_failure_requires_reconciliation() {
        let (_, backend, orchestrator) = connected().await;
        backend.fail_next(
            BackendCall::Capture,
            Failure::http(503, None, "Service Unavailable"),
        );

        let events = run(&orchestrator, 2000).await;

        let err = events.last().cloned().unwrap().unwrap_err();
        assert_eq!(err.stage, PaymentStage::Capture);
        assert_eq!(err.reason, ErrorReason::ServiceUnavailable);
        assert!(err.requires_reconciliation());
        assert!(!events.contains(&Ok(PaymentProgress::PaymentCompleted)));
    }

    #[tokio::test]
    async fn test_non_positive_amount_never_reaches_backend() {
        let (_, backend, orchestrator) = connected().await;

        let events = run(&orchestrator, 0).await;

        let err = events[1].clone().unwrap_err();
        assert_eq!(err.stage, PaymentStage::CreateIntent);
        assert!(matches!(err.reason, ErrorReason::PaymentError(Some(_))));
        assert_eq!(backend.calls().create_intent, 0);
    }

    #[tokio::test]
    async fn test_payment_without_reader() {
        let sim = Arc::new(SimulatedTerminal::new());
        let backend = Arc::new(StubBackend::new());
        let session = Arc::new(ReaderSession::new(sim, backend.clone()));
        session.initialize(&PlatformContext::default()).unwrap();
        let orchestrator = PaymentOrchestrator::new(session, backend);

        let events = run(&orchestrator, 2000).await;

        let err = events[1].clone().unwrap_err();
        assert_eq!(err.stage, PaymentStage::RetrieveIntent);
        assert!(matches!(err.reason, ErrorReason::TerminalError(_)));
    }
}
