use chrono::{DateTime, Utc};

/// A domain event.
///
/// Events are:
/// - **immutable** (a recorded movement is never edited)
/// - **versioned** (schema evolution)
/// - **append-only** (corrections are new events, not rewrites)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "inventory.record.movement_recorded").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
