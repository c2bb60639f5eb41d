//! # Backend Gateway
//!
//! The merchant backend issues connection tokens and creates and captures
//! payment intents. [`HttpBackend`] talks to it over form-encoded POSTs;
//! [`StubBackend`] is an in-memory stand-in for offline runs and tests.
//!
//! ## Routes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  POST /connection_token          ─► { "secret": "pst_..." }             │
//! │  POST /create_payment_intent     ─► { "intent": "pi_...",               │
//! │       amount, currency,               "secret": "pi_..._secret_..." }   │
//! │       referenceNumber                                                   │
//! │  POST /capture_payment_intent    ─► any 2xx body                        │
//! │       payment_intent_id                                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Failure Mapping
//! ```text
//! reqwest timeout            ─► Failure::Transport { Timeout }
//! reqwest connect (DNS)      ─► Failure::Transport { UnknownHost }
//! reqwest connect (other)    ─► Failure::Transport { ConnectionRefused }
//! other request error        ─► Failure::Transport { Socket }
//! non-2xx status             ─► Failure::Http { status, body }
//! undecodable success body   ─► Failure::Other
//! any token failure          ─► Failure::ConnectionToken
//! ```

use std::collections::HashMap;
use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use tapline_core::{Failure, Money, PaymentIntentRef, TransportFaultKind};

use crate::error::{SessionError, SessionResult};

// =============================================================================
// Gateway Trait
// =============================================================================

/// Operations the payment flow needs from the merchant backend.
#[async_trait]
pub trait BackendGateway: Send + Sync {
    /// Issues a short-lived connection token for the reader SDK.
    async fn get_connection_token(&self) -> Result<String, Failure>;

    /// Creates a pending charge.
    async fn create_payment_intent(
        &self,
        amount: Money,
        currency: &str,
        reference_number: &str,
    ) -> Result<PaymentIntentRef, Failure>;

    /// Finalizes a charge the reader has processed.
    async fn capture_payment_intent(&self, intent_id: &str) -> Result<(), Failure>;
}

// =============================================================================
// HTTP Backend
// =============================================================================

#[derive(Debug, Deserialize)]
struct ConnectionTokenResponse {
    secret: String,
}

#[derive(Debug, Deserialize)]
struct CreatedIntentResponse {
    intent: String,
    secret: String,
}

/// [`BackendGateway`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    connection_token_url: Url,
    create_intent_url: Url,
    capture_intent_url: Url,
    timeout: Option<Duration>,
}

impl HttpBackend {
    /// Builds a client for the backend rooted at `base_url`.
    pub fn try_new(base_url: &str) -> SessionResult<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        if !matches!(base.scheme(), "http" | "https") {
            return Err(SessionError::InvalidUrl(format!(
                "Backend URL must start with http:// or https://, got: {}",
                base_url
            )));
        }

        Ok(HttpBackend {
            client: Client::new(),
            connection_token_url: base.join("connection_token")?,
            create_intent_url: base.join("create_payment_intent")?,
            capture_intent_url: base.join("capture_payment_intent")?,
            timeout: None,
        })
    }

    /// Sets a timeout for every request.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn post_form(&self, url: &Url, form: &[(&str, &str)]) -> Result<reqwest::Response, Failure> {
        let mut req = self.client.post(url.clone()).form(form);
        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        let response = req.send().await.map_err(failure_from_reqwest)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.ok().filter(|b| !b.is_empty());
        let message = status
            .canonical_reason()
            .unwrap_or("Unexpected status")
            .to_string();
        warn!(url = %url, status = status.as_u16(), "Backend returned an error status");
        Err(Failure::http(status.as_u16(), body, message))
    }
}

#[async_trait]
impl BackendGateway for HttpBackend {
    async fn get_connection_token(&self) -> Result<String, Failure> {
        let fetch = async {
            let response = self.post_form(&self.connection_token_url, &[]).await?;
            response
                .json::<ConnectionTokenResponse>()
                .await
                .map_err(failure_from_reqwest)
        };

        match fetch.await {
            Ok(token) => {
                debug!("Connection token issued");
                Ok(token.secret)
            }
            Err(failure) => {
                warn!(error = %failure, "Creating connection token failed");
                Err(Failure::connection_token(format!(
                    "Creating connection token failed: {}",
                    failure
                )))
            }
        }
    }

    async fn create_payment_intent(
        &self,
        amount: Money,
        currency: &str,
        reference_number: &str,
    ) -> Result<PaymentIntentRef, Failure> {
        let amount = amount.minor().to_string();
        let response = self
            .post_form(
                &self.create_intent_url,
                &[
                    ("amount", amount.as_str()),
                    ("currency", currency),
                    ("referenceNumber", reference_number),
                ],
            )
            .await?;

        let created = response
            .json::<CreatedIntentResponse>()
            .await
            .map_err(failure_from_reqwest)?;

        info!(intent_id = %created.intent, amount = %amount, currency, "Payment intent created");
        Ok(PaymentIntentRef {
            id: created.intent,
            client_secret: created.secret,
        })
    }

    async fn capture_payment_intent(&self, intent_id: &str) -> Result<(), Failure> {
        self.post_form(&self.capture_intent_url, &[("payment_intent_id", intent_id)])
            .await?;
        info!(intent_id, "Payment intent captured");
        Ok(())
    }
}

/// Maps a reqwest error onto the boundary failure type.
pub(crate) fn failure_from_reqwest(err: reqwest::Error) -> Failure {
    let message = Some(err.to_string());

    if err.is_decode() {
        return Failure::other(Some(format!("Malformed backend response: {}", err)));
    }

    if let Some(status) = err.status() {
        let message = status.canonical_reason().unwrap_or("Unexpected status");
        return Failure::http(status.as_u16(), None, message);
    }

    let kind = if err.is_timeout() {
        TransportFaultKind::Timeout
    } else if err.is_connect() {
        if looks_like_dns_failure(&err) {
            TransportFaultKind::UnknownHost
        } else {
            TransportFaultKind::ConnectionRefused
        }
    } else {
        TransportFaultKind::Socket
    };

    Failure::transport(kind, message)
}

fn looks_like_dns_failure(err: &reqwest::Error) -> bool {
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string().to_lowercase();
        if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
            return true;
        }
        source = cause.source();
    }
    false
}

// =============================================================================
// Stub Backend
// =============================================================================

/// Which stub operation a queued failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendCall {
    ConnectionToken,
    CreateIntent,
    Capture,
}

/// Call counters of a [`StubBackend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendCalls {
    pub connection_token: usize,
    pub create_intent: usize,
    pub capture: usize,
}

/// In-memory [`BackendGateway`].
///
/// Issues `pi_stub_N` intents with `{id}_secret_{random}` client secrets so the
/// simulated reader can resolve them, and records every capture.
#[derive(Debug, Default)]
pub struct StubBackend {
    failures: Mutex<HashMap<BackendCall, Failure>>,
    captured: Mutex<Vec<String>>,
    token_calls: AtomicUsize,
    create_calls: AtomicUsize,
    capture_calls: AtomicUsize,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next call of `call` fail with `failure`.
    pub fn fail_next(&self, call: BackendCall, failure: Failure) {
        lock(&self.failures).insert(call, failure);
    }

    /// Intent ids captured so far, in order.
    pub fn captured(&self) -> Vec<String> {
        lock(&self.captured).clone()
    }

    pub fn calls(&self) -> BackendCalls {
        BackendCalls {
            connection_token: self.token_calls.load(Ordering::SeqCst),
            create_intent: self.create_calls.load(Ordering::SeqCst),
            capture: self.capture_calls.load(Ordering::SeqCst),
        }
    }

    fn take_failure(&self, call: BackendCall) -> Option<Failure> {
        lock(&self.failures).remove(&call)
    }
}

#[async_trait]
impl BackendGateway for StubBackend {
    async fn get_connection_token(&self) -> Result<String, Failure> {
        self.token_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.take_failure(BackendCall::ConnectionToken) {
            return Err(Failure::connection_token(failure.to_string()));
        }
        Ok(format!("pst_stub_{}", uuid::Uuid::new_v4().simple()))
    }

    async fn create_payment_intent(
        &self,
        amount: Money,
        currency: &str,
        reference_number: &str,
    ) -> Result<PaymentIntentRef, Failure> {
        let n = self.create_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(failure) = self.take_failure(BackendCall::CreateIntent) {
            return Err(failure);
        }

        let id = format!("pi_stub_{}", n);
        debug!(intent_id = %id, %amount, currency, reference_number, "Stub intent created");
        Ok(PaymentIntentRef {
            client_secret: format!("{}_secret_{}", id, uuid::Uuid::new_v4().simple()),
            id,
        })
    }

    async fn capture_payment_intent(&self, intent_id: &str) -> Result<(), Failure> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.take_failure(BackendCall::Capture) {
            return Err(failure);
        }
        lock(&self.captured).push(intent_id.to_string());
        Ok(())
    }
}

/// Locks a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tapline_core::{classify, ErrorReason};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_connection_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connection_token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "secret": "pst_123" })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::try_new(&server.uri()).unwrap();
        assert_eq!(backend.get_connection_token().await.unwrap(), "pst_123");
    }

    #[tokio::test]
    async fn test_connection_token_failure_is_tagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/connection_token"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let backend = HttpBackend::try_new(&server.uri()).unwrap();
        let failure = backend.get_connection_token().await.unwrap_err();
        assert!(matches!(failure, Failure::ConnectionToken { .. }));
        assert!(matches!(classify(&failure), ErrorReason::ApiError(Some(_))));
    }

    #[tokio::test]
    async fn test_create_payment_intent_sends_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create_payment_intent"))
            .and(body_string_contains("amount=2000"))
            .and(body_string_contains("currency=czk"))
            .and(body_string_contains("referenceNumber=123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "intent": "pi_1",
                "secret": "pi_1_secret_abc",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = HttpBackend::try_new(&server.uri()).unwrap();
        let intent = backend
            .create_payment_intent(Money::from_minor(2000), "czk", "123")
            .await
            .unwrap();

        assert_eq!(intent.id, "pi_1");
        assert_eq!(intent.client_secret, "pi_1_secret_abc");
    }

    #[tokio::test]
    async fn test_error_statuses_classify() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/create_payment_intent"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/capture_payment_intent"))
            .respond_with(ResponseTemplate::new(400).set_body_string("intent already captured"))
            .mount(&server)
            .await;

        let backend = HttpBackend::try_new(&server.uri()).unwrap();

        let failure = backend
            .create_payment_intent(Money::from_minor(2000), "czk", "1")
            .await
            .unwrap_err();
        assert_eq!(classify(&failure), ErrorReason::AccessDenied);

        let failure = backend.capture_payment_intent("pi_1").await.unwrap_err();
        assert_eq!(
            classify(&failure),
            ErrorReason::ApiError(Some("intent already captured".into()))
        );
    }

    #[tokio::test]
    async fn test_timeout_maps_to_transport() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/capture_payment_intent"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let backend = HttpBackend::try_new(&server.uri())
            .unwrap()
            .with_timeout(Duration::from_millis(50));

        let failure = backend.capture_payment_intent("pi_1").await.unwrap_err();
        assert!(matches!(
            failure,
            Failure::Transport {
                kind: TransportFaultKind::Timeout,
                ..
            }
        ));
        assert!(matches!(classify(&failure), ErrorReason::NetworkError(_)));
    }

    #[tokio::test]
    async fn test_refused_connection_is_network_error() {
        let server = MockServer::start().await;
        let uri = server.uri();
        drop(server);

        let backend = HttpBackend::try_new(&uri).unwrap();
        let failure = backend.capture_payment_intent("pi_1").await.unwrap_err();
        assert!(matches!(failure, Failure::Transport { .. }));
        assert!(matches!(classify(&failure), ErrorReason::NetworkError(_)));
    }

    #[test]
    fn test_base_url_with_path() {
        let backend = HttpBackend::try_new("https://pay.example.com/api").unwrap();
        assert_eq!(
            backend.create_intent_url.as_str(),
            "https://pay.example.com/api/create_payment_intent"
        );
        assert!(HttpBackend::try_new("ftp://pay.example.com").is_err());
    }

    #[tokio::test]
    async fn test_stub_backend() {
        let backend = StubBackend::new();
        let intent = backend
            .create_payment_intent(Money::from_minor(2000), "czk", "1")
            .await
            .unwrap();
        assert!(intent.client_secret.starts_with("pi_stub_1_secret_"));

        backend.fail_next(BackendCall::Capture, Failure::http(503, None, "down"));
        assert!(backend.capture_payment_intent(&intent.id).await.is_err());
        backend.capture_payment_intent(&intent.id).await.unwrap();

        assert_eq!(backend.captured(), vec!["pi_stub_1".to_string()]);
        assert_eq!(backend.calls().capture, 2);
    }
}
