//! Notification delivery for domain signals.
//!
//! Delivery is fire-and-forget: a failing sink is logged and skipped, it never
//! fails the ledger or order operation that raised the signal.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use stockflow_events::{DomainSignal, Notification, NotificationPriority};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification sink unavailable: {0}")]
    Unavailable(String),

    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// Where notifications go (email, chat, queue...). Implementations live with
/// the embedding application; this crate ships an in-memory and a log sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError>;
}

impl<S> NotificationSink for Arc<S>
where
    S: NotificationSink + ?Sized,
{
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        (**self).notify(notification)
    }
}

/// Keeps every notification; for tests and inspection.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    received: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Notification> {
        self.received.lock().map(|v| v.clone()).unwrap_or_default()
    }

    /// Received notifications of one kind (`DomainSignal::kind`).
    pub fn of_kind(&self, kind: &str) -> Vec<Notification> {
        self.received().into_iter().filter(|n| n.kind == kind).collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, notification: &Notification) -> Result<(), NotificationError> {
        self.received
            .lock()
            .map_err(|_| NotificationError::Unavailable("lock poisoned".to_string()))?
            .push(notification.clone());
        Ok(())
    }
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, n: &Notification) -> Result<(), NotificationError> {
        match n.priority {
            NotificationPriority::High | NotificationPriority::Urgent => {
                warn!(kind = %n.kind, priority = ?n.priority, data = %n.data, "{}: {}", n.title, n.message)
            }
            _ => info!(kind = %n.kind, priority = ?n.priority, data = %n.data, "{}: {}", n.title, n.message),
        }
        Ok(())
    }
}

/// Fans signals out to the configured sinks.
#[derive(Clone, Default)]
pub struct SignalDispatcher {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl core::fmt::Debug for SignalDispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SignalDispatcher").field("sinks", &self.sinks.len()).finish()
    }
}

impl SignalDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn emit(&self, signal: &DomainSignal) {
        let notification = signal.to_notification();
        for sink in &self.sinks {
            if let Err(err) = sink.notify(&notification) {
                warn!(kind = signal.kind(), error = %err, "notification delivery failed");
            }
        }
    }

    pub fn emit_all(&self, signals: &[DomainSignal]) {
        for s in signals {
            self.emit(s);
        }
    }
}

#[cfg(test)]
mod tests {
    use stockflow_core::AggregateId;

    use super::*;

    struct Broken;

    impl NotificationSink for Broken {
        fn notify(&self, _: &Notification) -> Result<(), NotificationError> {
            Err(NotificationError::Unavailable("smtp down".to_string()))
        }
    }

    #[test]
    fn failing_sink_does_not_stop_delivery() {
        let memory = Arc::new(InMemoryNotificationSink::new());
        let dispatcher = SignalDispatcher::new()
            .with_sink(Arc::new(Broken))
            .with_sink(memory.clone());

        dispatcher.emit(&DomainSignal::OrderAllocated {
            order_id: AggregateId::new(),
            allocated: 5,
            shortfall: 5,
            complete: false,
        });

        let got = memory.of_kind("order_allocated");
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].priority, NotificationPriority::High);
    }
}
