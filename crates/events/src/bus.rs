//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus distributes committed envelopes to consumers: the ledger read model,
//! the signal dispatcher, anything that wants to observe stock movements. The
//! event store stays the source of truth; the bus is for distribution only.
//!
//! Delivery is at-least-once and consumers must be idempotent. A read model that
//! misses messages can always be rebuilt by replaying the store.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics). A subscription is meant to be drained by a
/// single thread, typically a `ProjectionWorker`.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Transport-agnostic pub/sub contract.
///
/// ```text
/// Command → Event Store (append) → Event Bus (publish) → Consumers
///                                                          ├─ LedgerStockProjection
///                                                          └─ SignalDispatcher
/// ```
///
/// `publish()` is only called after the append committed, so a failed publish
/// never loses data; the dispatcher surfaces it and the caller may republish.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
