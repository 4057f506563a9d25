//! Command execution pipeline.
//!
//! ```text
//! Command
//!   ↓
//! 1. Load the stream from the store
//!   ↓
//! 2. Rehydrate the aggregate
//!   ↓
//! 3. Decide events (`handle`, pure)
//!   ↓
//! 4. Append with `ExpectedVersion::Exact(loaded version)`
//!   ↓
//! 5. Publish committed envelopes
//! ```
//!
//! A concurrency failure at step 4 means another writer committed to the same
//! stream in between. The dispatcher then starts again from step 1 with fresh
//! state, up to `max_retries` times, before surfacing
//! `DispatchError::ConcurrencyConflict`. Because the command is re-decided
//! against the reloaded state, a reservation that fit before the conflict but
//! no longer fits fails with `InsufficientStock` instead of over-reserving.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use stockflow_core::{Aggregate, AggregateId, DomainError, ExpectedVersion};

use crate::event_bus::EnvelopeBus;
use crate::event_store::{EventStore, EventStoreError, StoredEvent, UncommittedEvent};

/// Default number of reload-and-retry rounds after a concurrency conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Error surfaced by every engine operation.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Malformed or out-of-range request; rejected before any mutation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Not enough stock for the movement or reservation.
    #[error("insufficient stock: {0}")]
    InsufficientStock(String),

    /// Order or purchase order not in an eligible lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Stream contention outlasted the configured retries.
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    /// Historical payloads could not be read back into the aggregate's event type.
    #[error("failed to deserialize stored event: {0}")]
    Deserialize(String),

    #[error("event store failure: {0}")]
    Store(EventStoreError),

    /// Publication failed after a successful append (events are durable).
    #[error("event publication failed: {0}")]
    Publish(String),

    /// A workflow failed and reversing its applied movements failed too; the
    /// ledger keeps the unreversed movements until corrected.
    #[error("{cause}; reversing applied movements failed: {compensation}")]
    Compensation {
        cause: Box<DispatchError>,
        compensation: Box<DispatchError>,
    },
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::ConcurrencyConflict(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InsufficientStock(msg) => DispatchError::InsufficientStock(msg),
            DomainError::InvalidState(msg) => DispatchError::InvalidState(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::NotFound(msg) => DispatchError::NotFound(msg),
            DomainError::Conflict(msg) => DispatchError::ConcurrencyConflict(msg),
        }
    }
}

/// Result of a dispatched command: the aggregate after the commit and the
/// events that were committed (empty for a no-op).
#[derive(Debug, Clone)]
pub struct Dispatched<A> {
    pub state: A,
    pub events: Vec<StoredEvent>,
}

/// Events decided against a loaded state, not yet committed.
#[derive(Debug, Clone)]
pub struct Decision<A: Aggregate> {
    pub state: A,
    expected: ExpectedVersion,
    pub events: Vec<A::Event>,
}

impl<A: Aggregate> Decision<A> {
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }

    /// Stream version the decision was made against.
    pub fn expected_version(&self) -> ExpectedVersion {
        self.expected
    }
}

impl<A> Dispatched<A> {
    pub fn is_noop(&self) -> bool {
        self.events.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.events.last().map(|e| e.sequence_number).unwrap_or(0)
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// Generic over the store and bus so tests run on `InMemoryEventStore` /
/// `InMemoryEventBus` and production on Postgres.
#[derive(Debug)]
pub struct CommandDispatcher<S, B> {
    store: S,
    bus: B,
    max_retries: u32,
}

impl<S, B> CommandDispatcher<S, B> {
    pub fn new(store: S, bus: B) -> Self {
        Self {
            store,
            bus,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bus)
    }
}

impl<S, B> CommandDispatcher<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Rehydrate an aggregate from its stream (an empty instance if the stream is unknown).
    pub fn load<A>(&self, aggregate_id: AggregateId, make_aggregate: impl FnOnce(AggregateId) -> A) -> Result<A, DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok(aggregate)
    }

    /// Dispatch a fixed command, retrying on concurrency conflicts.
    pub fn dispatch<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        command: A::Command,
        make_aggregate: impl Fn(AggregateId) -> A,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stockflow_events::Event + Serialize + DeserializeOwned,
    {
        self.dispatch_with(aggregate_id, aggregate_type, make_aggregate, |_| Ok(Some(command.clone())))
    }

    /// Dispatch a command built from the freshly loaded state.
    ///
    /// `decide` runs once per attempt, after every reload, so commands whose
    /// content depends on current state (e.g. "reserve what is available")
    /// are recomputed when a concurrent writer got there first. Returning
    /// `Ok(None)` commits nothing.
    pub fn dispatch_with<A, F>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        make_aggregate: impl Fn(AggregateId) -> A,
        mut decide: F,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: stockflow_events::Event + Serialize + DeserializeOwned,
        F: FnMut(&A) -> Result<Option<A::Command>, DispatchError>,
    {
        let mut attempt = 0u32;
        loop {
            let (aggregate, expected) = self.load_versioned(aggregate_id, &make_aggregate)?;

            let Some(command) = decide(&aggregate)? else {
                return Ok(Dispatched {
                    state: aggregate,
                    events: Vec::new(),
                });
            };

            let events = aggregate.handle(&command)?;
            let decision = Decision {
                state: aggregate,
                expected,
                events,
            };

            match self.commit(aggregate_id, aggregate_type, decision) {
                Err(DispatchError::ConcurrencyConflict(msg)) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(%aggregate_id, aggregate_type, attempt, reason = %msg, "append conflict, retrying");
                }
                Err(DispatchError::ConcurrencyConflict(msg)) => {
                    return Err(DispatchError::ConcurrencyConflict(format!(
                        "{msg} (gave up after {attempt} retries)"
                    )));
                }
                other => return other,
            }
        }
    }

    /// Load, rehydrate and decide without committing.
    ///
    /// For workflows that must do other writes between deciding and
    /// committing (e.g. ledger movements for an order shipment). The
    /// returned decision commits only if the stream has not moved since.
    pub fn decide<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: impl Fn(AggregateId) -> A,
        command: &A::Command,
    ) -> Result<Decision<A>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Event: DeserializeOwned,
    {
        let (aggregate, expected) = self.load_versioned(aggregate_id, &make_aggregate)?;
        let events = aggregate.handle(command)?;
        Ok(Decision {
            state: aggregate,
            expected,
            events,
        })
    }

    /// Append a decision's events at the version it was decided against,
    /// then publish them. No retry: a moved stream is `ConcurrencyConflict`.
    pub fn commit<A>(
        &self,
        aggregate_id: AggregateId,
        aggregate_type: &str,
        decision: Decision<A>,
    ) -> Result<Dispatched<A>, DispatchError>
    where
        A: Aggregate,
        A::Event: stockflow_events::Event + Serialize,
    {
        let Decision {
            state: mut aggregate,
            expected,
            events,
        } = decision;

        if events.is_empty() {
            return Ok(Dispatched {
                state: aggregate,
                events: Vec::new(),
            });
        }

        let uncommitted = events
            .iter()
            .map(|ev| UncommittedEvent::from_typed(aggregate_id, aggregate_type, Uuid::now_v7(), ev))
            .collect::<Result<Vec<_>, _>>()?;

        let committed = self.store.append(uncommitted, expected)?;
        for ev in &events {
            aggregate.apply(ev);
        }
        for stored in &committed {
            self.bus
                .publish(stored.to_envelope())
                .map_err(|e| DispatchError::Publish(format!("{e:?}")))?;
        }
        debug!(%aggregate_id, aggregate_type, committed = committed.len(), "command committed");

        Ok(Dispatched {
            state: aggregate,
            events: committed,
        })
    }

    fn load_versioned<A>(
        &self,
        aggregate_id: AggregateId,
        make_aggregate: &impl Fn(AggregateId) -> A,
    ) -> Result<(A, ExpectedVersion), DispatchError>
    where
        A: Aggregate,
        A::Event: DeserializeOwned,
    {
        let history = self.store.load_stream(aggregate_id)?;
        validate_loaded_stream(aggregate_id, &history)?;
        let expected = ExpectedVersion::Exact(stream_version(&history));

        let mut aggregate = make_aggregate(aggregate_id);
        apply_history(&mut aggregate, &history)?;
        Ok((aggregate, expected))
    }
}

fn stream_version(stream: &[StoredEvent]) -> u64 {
    stream.last().map(|e| e.sequence_number).unwrap_or(0)
}

fn validate_loaded_stream(aggregate_id: AggregateId, stream: &[StoredEvent]) -> Result<(), DispatchError> {
    let mut last = 0u64;
    for (idx, e) in stream.iter().enumerate() {
        if e.aggregate_id != aggregate_id {
            return Err(DispatchError::Store(EventStoreError::Storage(format!(
                "loaded stream contains wrong aggregate_id at index {idx}"
            ))));
        }
        if e.sequence_number <= last {
            return Err(DispatchError::Store(EventStoreError::Storage(format!(
                "non-monotonic sequence_number in loaded stream (last={last}, found={})",
                e.sequence_number
            ))));
        }
        last = e.sequence_number;
    }
    Ok(())
}

fn apply_history<A>(aggregate: &mut A, history: &[StoredEvent]) -> Result<(), DispatchError>
where
    A: Aggregate,
    A::Event: DeserializeOwned,
{
    for stored in history {
        let ev: A::Event = serde_json::from_value(stored.payload.clone())
            .map_err(|e| DispatchError::Deserialize(format!("{} #{}: {e}", stored.event_type, stored.sequence_number)))?;
        aggregate.apply(&ev);
    }
    Ok(())
}
