//! Event bus wiring.
//!
//! The bus abstraction lives in `stockflow-events`. Infra publishes serialized
//! envelopes (`JsonEnvelope`); `EnvelopeBus` names that bound once so engine
//! code doesn't repeat it.

use serde_json::Value as JsonValue;

use stockflow_events::{EventBus, EventEnvelope, InMemoryEventBus};

/// Envelope as published by the dispatcher: payload still in JSON form.
pub type JsonEnvelope = EventEnvelope<JsonValue>;

/// Bus carrying committed, serialized events.
pub trait EnvelopeBus: EventBus<JsonEnvelope> {}

impl<B> EnvelopeBus for B where B: EventBus<JsonEnvelope> {}

/// In-process bus for `JsonEnvelope`s.
pub type InMemoryEnvelopeBus = InMemoryEventBus<JsonEnvelope>;
