//! Append-only event store boundary.
//!
//! Every inventory record, sales order and purchase order is one stream.
//! The store is authoritative; read models and signals are derived from it.

pub mod in_memory;
pub mod postgres;
pub mod query;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use query::{EventFilter, Pagination};
pub use r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};
