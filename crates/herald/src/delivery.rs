//! Delivery tracking.
//!
//! Every enqueued record gets a [`DeliveryHandle`]. The [`DeliveryTracker`]
//! keeps the sending half of a oneshot channel per pending record and
//! removes it when the record resolves, so a second resolution of the same
//! id finds nothing and is ignored.

use crate::error::DeliveryError;
use crate::record::{Acknowledgment, Destination, RecordId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Final state of a record.
pub type DeliveryOutcome = Result<Acknowledgment, DeliveryError>;

/// Result of [`DeliveryHandle::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Record was still queued and will never be sent.
    Removed,
    /// Record is part of a batch on the wire; it resolves normally.
    InFlight,
    /// Record already reached a terminal state.
    AlreadyResolved,
}

/// Something that can pull a queued record back out.
pub(crate) trait CancelRecord: Send + Sync {
    fn cancel(&self, id: RecordId) -> CancelOutcome;
}

/// Pending records and the channels that resolve them.
#[derive(Default)]
pub struct DeliveryTracker {
    pending: Mutex<HashMap<RecordId, oneshot::Sender<DeliveryOutcome>>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`, returning the receiving end of its outcome.
    pub fn register(&self, id: RecordId) -> oneshot::Receiver<DeliveryOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        rx
    }

    /// Resolve `id`. Returns false if it was already resolved or unknown.
    pub fn resolve(&self, id: RecordId, outcome: DeliveryOutcome) -> bool {
        let sender = self.pending.lock().remove(&id);
        match sender {
            Some(tx) => {
                // The caller may have dropped its handle; the record is
                // resolved either way.
                let _ = tx.send(outcome);
                true
            }
            None => {
                debug!(record_id = %id, "Ignoring resolution of already resolved record");
                false
            }
        }
    }

    pub fn acknowledge(&self, ack: Acknowledgment) -> bool {
        self.resolve(ack.record_id, Ok(ack))
    }

    pub fn fail(&self, id: RecordId, error: DeliveryError) -> bool {
        self.resolve(id, Err(error))
    }

    /// Stop tracking `id` without resolving it. Used when enqueue fails
    /// after registration.
    pub fn forget(&self, id: RecordId) {
        self.pending.lock().remove(&id);
    }

    pub fn is_pending(&self, id: RecordId) -> bool {
        self.pending.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Fail every pending record. Returns how many were resolved.
    pub fn fail_all(&self, error: DeliveryError) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }
}

/// Caller's view of one record's delivery.
///
/// Await the handle directly, or use [`wait`](Self::wait) for a bounded
/// wait that can be repeated. The terminal outcome is returned once; later
/// calls get [`DeliveryError::AlreadyObserved`].
pub struct DeliveryHandle {
    record_id: RecordId,
    destination: Destination,
    receiver: Option<oneshot::Receiver<DeliveryOutcome>>,
    canceller: Arc<dyn CancelRecord>,
}

impl DeliveryHandle {
    pub(crate) fn new(
        record_id: RecordId,
        destination: Destination,
        receiver: oneshot::Receiver<DeliveryOutcome>,
        canceller: Arc<dyn CancelRecord>,
    ) -> Self {
        Self {
            record_id,
            destination,
            receiver: Some(receiver),
            canceller,
        }
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Wait up to `timeout` for the outcome.
    ///
    /// On timeout the record stays pending and the handle can be waited
    /// again.
    pub async fn wait(&mut self, timeout: Duration) -> DeliveryOutcome {
        match tokio::time::timeout(timeout, &mut *self).await {
            Ok(outcome) => outcome,
            Err(_) => Err(DeliveryError::Timeout(timeout)),
        }
    }

    /// Outcome if already resolved, without waiting.
    pub fn try_result(&mut self) -> Option<DeliveryOutcome> {
        let receiver = match self.receiver.as_mut() {
            Some(rx) => rx,
            None => return Some(Err(DeliveryError::AlreadyObserved)),
        };

        let outcome = match receiver.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return None,
            Err(oneshot::error::TryRecvError::Closed) => Err(DeliveryError::Shutdown),
        };
        self.receiver = None;
        Some(outcome)
    }

    /// Withdraw the record if it has not been sent yet.
    pub fn cancel(&self) -> CancelOutcome {
        self.canceller.cancel(self.record_id)
    }
}

impl Future for DeliveryHandle {
    type Output = DeliveryOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let receiver = match self.receiver.as_mut() {
            Some(rx) => rx,
            None => return Poll::Ready(Err(DeliveryError::AlreadyObserved)),
        };

        let outcome = match Pin::new(receiver).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            // Sender dropped without resolving: the producer went away.
            Poll::Ready(Err(_)) => Err(DeliveryError::Shutdown),
        };
        self.receiver = None;
        Poll::Ready(outcome)
    }
}

impl std::fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("record_id", &self.record_id)
            .field("destination", &self.destination)
            .field("observed", &self.receiver.is_none())
            .finish()
    }
}
