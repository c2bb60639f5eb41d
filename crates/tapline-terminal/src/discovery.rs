//! # Discovery Stream
//!
//! A reader discovery request as a [`Stream`] of full candidate lists.
//!
//! ## Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  SDK on_update ──┐                                                      │
//! │                  ├──► mpsc ──► DiscoveryStream ──► Ok(Vec<Reader>) ...  │
//! │  SDK done ───────┘                          └────► Err(reason), end     │
//! │                                                                         │
//! │  The SDK scan is cancelled exactly once, on the first of:               │
//! │    • explicit cancel()       • stream failure or end                    │
//! │    • stream dropped (subscriber gone or replaced)                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, warn};

use tapline_core::{ErrorReason, Reader};

use crate::backend::lock;
use crate::sdk::Cancelable;

/// Messages fed into a discovery stream by the SDK callbacks.
#[derive(Debug)]
pub(crate) enum DiscoveryEvent {
    Readers(Vec<Reader>),
    Failed(ErrorReason),
    Finished,
}

/// Releases the SDK scan at most once.
struct DiscoveryGuard {
    cancelable: Option<Box<dyn Cancelable>>,
    active: Option<Arc<AtomicBool>>,
    released: bool,
}

impl DiscoveryGuard {
    fn release(&mut self) {
        self.released = true;
        if let Some(cancelable) = self.cancelable.take() {
            debug!("Cancelling reader discovery");
            cancelable.cancel(Box::new(|result| {
                if let Err(fault) = result {
                    warn!(error = %fault, "Failed to cancel reader discovery");
                }
            }));
        }
        if let Some(active) = self.active.take() {
            active.store(false, Ordering::SeqCst);
        }
    }
}

/// Live sequence of discovered reader lists.
///
/// Each item replaces the previous candidate list. The stream ends after
/// the first error, or when the SDK reports the scan finished.
pub struct DiscoveryStream {
    inner: UnboundedReceiverStream<DiscoveryEvent>,
    guard: Arc<Mutex<DiscoveryGuard>>,
}

impl DiscoveryStream {
    pub(crate) fn new(
        rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
        cancelable: Box<dyn Cancelable>,
        active: Arc<AtomicBool>,
    ) -> Self {
        DiscoveryStream {
            inner: UnboundedReceiverStream::new(rx),
            guard: Arc::new(Mutex::new(DiscoveryGuard {
                cancelable: Some(cancelable),
                active: Some(active),
                released: false,
            })),
        }
    }

    /// A stream that yields `reason` once and ends without touching the SDK.
    pub(crate) fn failed(reason: ErrorReason) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(DiscoveryEvent::Failed(reason));
        DiscoveryStream {
            inner: UnboundedReceiverStream::new(rx),
            guard: Arc::new(Mutex::new(DiscoveryGuard {
                cancelable: None,
                active: None,
                released: false,
            })),
        }
    }

    /// Stops the scan. Further calls are no-ops; the stream ends.
    pub fn cancel(&mut self) {
        lock(&self.guard).release();
    }

    /// A handle that stops this scan from elsewhere, e.g. while another task
    /// is polling the stream.
    pub fn canceller(&self) -> DiscoveryCanceller {
        DiscoveryCanceller {
            guard: self.guard.clone(),
        }
    }
}

impl Stream for DiscoveryStream {
    type Item = Result<Vec<Reader>, ErrorReason>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if lock(&self.guard).released {
            return Poll::Ready(None);
        }

        let item = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(DiscoveryEvent::Readers(readers)) => return Poll::Ready(Some(Ok(readers))),
            Some(DiscoveryEvent::Failed(reason)) => Some(Err(reason)),
            Some(DiscoveryEvent::Finished) | None => None,
        };

        lock(&self.guard).release();
        Poll::Ready(item)
    }
}

impl Drop for DiscoveryStream {
    fn drop(&mut self) {
        lock(&self.guard).release();
    }
}

/// Detached cancel handle of a [`DiscoveryStream`].
#[derive(Clone)]
pub struct DiscoveryCanceller {
    guard: Arc<Mutex<DiscoveryGuard>>,
}

impl DiscoveryCanceller {
    /// Same as [`DiscoveryStream::cancel`].
    pub fn cancel(&self) {
        lock(&self.guard).release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sdk::Completion;
    use futures_util::StreamExt;

    #[derive(Default)]
    struct CountingCancel {
        count: Arc<Mutex<usize>>,
    }

    impl Cancelable for CountingCancel {
        fn cancel(&self, done: Completion<()>) {
            *lock(&self.count) += 1;
            done(Ok(()));
        }
    }

    fn stream() -> (
        mpsc::UnboundedSender<DiscoveryEvent>,
        DiscoveryStream,
        Arc<Mutex<usize>>,
        Arc<AtomicBool>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CountingCancel::default();
        let count = cancel.count.clone();
        let active = Arc::new(AtomicBool::new(true));
        (tx, DiscoveryStream::new(rx, Box::new(cancel), active.clone()), count, active)
    }

    #[tokio::test]
    async fn test_double_cancel_cancels_once() {
        let (_tx, mut discovery, count, active) = stream();
        discovery.cancel();
        discovery.cancel();
        drop(discovery);

        assert_eq!(*lock(&count), 1);
        assert!(!active.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_cancels_once() {
        let (tx, mut discovery, count, _) = stream();
        tx.send(DiscoveryEvent::Readers(vec![Reader::new("A")])).unwrap();

        let first = discovery.next().await.unwrap().unwrap();
        assert_eq!(first[0].serial_number, "A");
        drop(discovery);

        assert_eq!(*lock(&count), 1);
    }

    #[tokio::test]
    async fn test_failure_ends_stream_and_cancels() {
        let (tx, mut discovery, count, _) = stream();
        tx.send(DiscoveryEvent::Failed(ErrorReason::TerminalError(Some("scan failed".into()))))
            .unwrap();
        tx.send(DiscoveryEvent::Readers(vec![Reader::new("late")])).unwrap();

        assert!(discovery.next().await.unwrap().is_err());
        assert!(discovery.next().await.is_none());
        assert_eq!(*lock(&count), 1);

        drop(discovery);
        assert_eq!(*lock(&count), 1);
    }

    #[tokio::test]
    async fn test_canceller_ends_stream() {
        let (tx, mut discovery, count, active) = stream();
        let canceller = discovery.canceller();
        canceller.cancel();
        tx.send(DiscoveryEvent::Readers(vec![Reader::new("late")])).unwrap();

        assert!(discovery.next().await.is_none());
        assert!(!active.load(Ordering::SeqCst));
        discovery.cancel();
        canceller.cancel();
        assert_eq!(*lock(&count), 1);
    }

    #[tokio::test]
    async fn test_failed_stream_never_cancels() {
        let mut discovery = DiscoveryStream::failed(ErrorReason::ReaderDiscoveryError);
        assert_eq!(
            discovery.next().await,
            Some(Err(ErrorReason::ReaderDiscoveryError))
        );
        assert_eq!(discovery.next().await, None);
    }
}
