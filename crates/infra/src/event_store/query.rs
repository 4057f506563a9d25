//! Filtered reads over the event store.
//!
//! Movement history, demand history and ledger discovery are all scans over
//! committed events; this module holds the filter and pagination types they use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stockflow_core::AggregateId;

use crate::event_store::StoredEvent;

/// Pagination parameters for history queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Maximum number of rows to return.
    pub limit: u32,
    /// Offset (0-based).
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    pub fn new(limit: Option<u32>, offset: Option<u32>) -> Self {
        Self {
            limit: limit.unwrap_or(50).min(1000),
            offset: offset.unwrap_or(0),
        }
    }

    /// Cut one page out of `rows`, reporting whether more follow.
    pub fn page<T>(&self, rows: Vec<T>) -> (Vec<T>, bool) {
        let total = rows.len();
        let start = (self.offset as usize).min(total);
        let end = start.saturating_add(self.limit as usize).min(total);
        let has_more = end < total;
        let page = rows.into_iter().skip(start).take(end - start).collect();
        (page, has_more)
    }
}

/// Filter criteria for event scans. Every set field must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub aggregate_id: Option<AggregateId>,
    /// e.g. "inventory.record"
    pub aggregate_type: Option<String>,
    /// e.g. "inventory.record.movement_recorded"
    pub event_type: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub occurred_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_event_type(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Default::default()
        }
    }

    pub fn between(mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        self.occurred_after = from;
        self.occurred_before = to;
        self
    }

    pub fn matches(&self, event: &StoredEvent) -> bool {
        self.aggregate_id.is_none_or(|id| event.aggregate_id == id)
            && self
                .aggregate_type
                .as_deref()
                .is_none_or(|t| event.aggregate_type == t)
            && self.event_type.as_deref().is_none_or(|t| event.event_type == t)
            && self.occurred_after.is_none_or(|from| event.occurred_at >= from)
            && self.occurred_before.is_none_or(|to| event.occurred_at < to)
    }
}

/// Stable ordering for scans: time, then stream position.
pub(crate) fn sort_for_scan(events: &mut [StoredEvent]) {
    events.sort_by(|a, b| {
        a.occurred_at
            .cmp(&b.occurred_at)
            .then(a.aggregate_id.cmp(&b.aggregate_id))
            .then(a.sequence_number.cmp(&b.sequence_number))
    });
}
