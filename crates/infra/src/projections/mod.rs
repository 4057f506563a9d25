//! Projection implementations (read model builders).
//!
//! Projections consume published envelopes and build query-optimized views.
//! They are rebuildable from the event store and idempotent under
//! at-least-once delivery.

pub mod ledger_stock;

pub use ledger_stock::{LedgerProjectionError, LedgerStockProjection, LedgerStockView};
