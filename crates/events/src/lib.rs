//! Event mechanics and domain signals.
//!
//! - `Event` / `EventEnvelope`: the unit appended to and published from a stream
//! - `EventBus`: fan-out of committed envelopes to read models and dispatchers
//! - `DomainSignal` / `Notification`: typed side effects of ledger and order operations

pub mod bus;
pub mod envelope;
pub mod event;
pub mod handler;
pub mod in_memory_bus;
pub mod signal;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use signal::{DomainSignal, Notification, NotificationPriority};
