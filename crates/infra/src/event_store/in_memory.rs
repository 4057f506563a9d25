use std::collections::HashMap;
use std::sync::RwLock;

use stockflow_core::{AggregateId, ExpectedVersion};

use super::query::{EventFilter, sort_for_scan};
use super::r#trait::{EventStore, EventStoreError, StoredEvent, UncommittedEvent, validate_batch};

/// In-memory append-only event store.
///
/// Intended for tests/dev and single-process use. The version check and the
/// append happen under one write lock, so same-stream writers serialize.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Vec<StoredEvent>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current_version(stream: &[StoredEvent]) -> u64 {
        stream.last().map(|e| e.sequence_number).unwrap_or(0)
    }

    /// Number of streams currently held.
    pub fn stream_count(&self) -> usize {
        self.streams.read().map(|s| s.len()).unwrap_or(0)
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<UncommittedEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let (aggregate_id, aggregate_type) = validate_batch(&events)?;

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let stream = streams.entry(aggregate_id).or_default();
        let current = Self::current_version(stream);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "stream {aggregate_id}: expected {expected_version:?}, found {current}"
            )));
        }

        if let Some(existing) = stream.first() {
            if existing.aggregate_type != aggregate_type {
                return Err(EventStoreError::AggregateTypeMismatch(format!(
                    "stream aggregate_type is '{}', attempted append with '{}'",
                    existing.aggregate_type, aggregate_type
                )));
            }
        }

        let mut next = current + 1;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            let stored = StoredEvent {
                event_id: e.event_id,
                aggregate_id: e.aggregate_id,
                aggregate_type: e.aggregate_type,
                sequence_number: next,
                event_type: e.event_type,
                event_version: e.event_version,
                occurred_at: e.occurred_at,
                payload: e.payload,
            };
            next += 1;
            stream.push(stored.clone());
            committed.push(stored);
        }

        Ok(committed)
    }

    fn load_stream(&self, aggregate_id: AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        Ok(streams.get(&aggregate_id).cloned().unwrap_or_default())
    }

    fn load_events(&self, filter: &EventFilter) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut events: Vec<StoredEvent> = {
            let streams = self
                .streams
                .read()
                .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

            match filter.aggregate_id {
                Some(id) => streams
                    .get(&id)
                    .map(|s| s.iter().filter(|e| filter.matches(e)).cloned().collect())
                    .unwrap_or_default(),
                None => streams
                    .values()
                    .flat_map(|s| s.iter())
                    .filter(|e| filter.matches(e))
                    .cloned()
                    .collect(),
            }
        };

        sort_for_scan(&mut events);
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn uncommitted(aggregate_id: AggregateId, event_type: &str) -> UncommittedEvent {
        UncommittedEvent {
            event_id: Uuid::now_v7(),
            aggregate_id,
            aggregate_type: "inventory.record".to_string(),
            event_type: event_type.to_string(),
            event_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn stale_expected_version_is_a_concurrency_error() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a")], ExpectedVersion::Exact(0))
            .unwrap();
        let err = store
            .append(vec![uncommitted(id, "b")], ExpectedVersion::Exact(0))
            .unwrap_err();

        assert!(matches!(err, EventStoreError::Concurrency(_)));
        assert_eq!(store.load_stream(id).unwrap().len(), 1);
    }

    #[test]
    fn sequence_numbers_continue_per_stream() {
        let store = InMemoryEventStore::new();
        let id = AggregateId::new();

        store
            .append(vec![uncommitted(id, "a"), uncommitted(id, "b")], ExpectedVersion::Exact(0))
            .unwrap();
        let committed = store
            .append(vec![uncommitted(id, "c")], ExpectedVersion::Exact(2))
            .unwrap();

        assert_eq!(committed[0].sequence_number, 3);
    }

    #[test]
    fn mixed_stream_batches_are_rejected() {
        let store = InMemoryEventStore::new();
        let err = store
            .append(
                vec![uncommitted(AggregateId::new(), "a"), uncommitted(AggregateId::new(), "a")],
                ExpectedVersion::Any,
            )
            .unwrap_err();
        assert!(matches!(err, EventStoreError::InvalidAppend(_)));
    }

    #[test]
    fn load_events_filters_across_streams() {
        let store = InMemoryEventStore::new();
        for _ in 0..3 {
            let id = AggregateId::new();
            store
                .append(vec![uncommitted(id, "keep"), uncommitted(id, "skip")], ExpectedVersion::Exact(0))
                .unwrap();
        }

        let rows = store.load_events(&EventFilter::for_event_type("keep")).unwrap();
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|e| e.event_type == "keep"));
        assert_eq!(store.stream_count(), 3);
    }
}
