use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use thiserror::Error;

use stockflow_core::{AggregateId, ProductId, WarehouseId};
use stockflow_events::EventEnvelope;
use stockflow_inventory::{InventoryEvent, InventoryId, ReorderThresholds, StockLevels};

use crate::read_model::ReadStore;
use crate::services::INVENTORY_AGGREGATE;

/// Queryable stock view of one inventory record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerStockView {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    pub levels: StockLevels,
    pub thresholds: ReorderThresholds,
    pub average_cost: Decimal,
    pub last_movement_at: Option<DateTime<Utc>>,
}

impl LedgerStockView {
    pub fn is_low_stock(&self) -> bool {
        self.levels.available <= self.thresholds.reorder_point
    }
}

#[derive(Debug, Error)]
pub enum LedgerProjectionError {
    #[error("failed to deserialize inventory event: {0}")]
    Deserialize(String),

    #[error("event for {found} published on stream {stream}")]
    StreamMismatch { stream: AggregateId, found: InventoryId },

    #[error("movement for unknown record {0}")]
    UnknownRecord(InventoryId),

    #[error("non-monotonic sequence number (last={last}, found={found})")]
    NonMonotonicSequence { last: u64, found: u64 },
}

/// Stock-level projection over the inventory record streams.
///
/// Consumes published JSON envelopes; envelopes of other aggregate types are
/// skipped. Idempotent for at-least-once delivery: envelopes at or below the
/// per-stream cursor are ignored.
#[derive(Debug)]
pub struct LedgerStockProjection<S>
where
    S: ReadStore<InventoryId, LedgerStockView>,
{
    store: S,
    cursors: RwLock<HashMap<AggregateId, u64>>,
}

impl<S> LedgerStockProjection<S>
where
    S: ReadStore<InventoryId, LedgerStockView>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            cursors: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, inventory_id: &InventoryId) -> Option<LedgerStockView> {
        self.store.get(inventory_id)
    }

    pub fn list(&self) -> Vec<LedgerStockView> {
        self.store.list()
    }

    /// Records at or below their reorder point.
    pub fn low_stock(&self) -> Vec<LedgerStockView> {
        self.store.list().into_iter().filter(|v| v.is_low_stock()).collect()
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), LedgerProjectionError> {
        if envelope.aggregate_type() != INVENTORY_AGGREGATE {
            return Ok(());
        }

        let aggregate_id = envelope.aggregate_id();
        let seq = envelope.sequence_number();

        let Ok(mut cursors) = self.cursors.write() else {
            return Ok(());
        };
        let last = cursors.get(&aggregate_id).copied().unwrap_or(0);

        if seq <= last {
            return Ok(());
        }
        if seq != last + 1 {
            return Err(LedgerProjectionError::NonMonotonicSequence { last, found: seq });
        }

        let event: InventoryEvent = serde_json::from_value(envelope.payload().clone())
            .map_err(|e| LedgerProjectionError::Deserialize(e.to_string()))?;

        match event {
            InventoryEvent::RecordOpened(e) => {
                ensure_stream(aggregate_id, e.inventory_id)?;
                self.store.upsert(
                    e.inventory_id,
                    LedgerStockView {
                        inventory_id: e.inventory_id,
                        product_id: e.product_id,
                        warehouse_id: e.warehouse_id,
                        location: e.location,
                        levels: StockLevels::default(),
                        thresholds: e.thresholds,
                        average_cost: Decimal::ZERO,
                        last_movement_at: None,
                    },
                );
            }
            InventoryEvent::ThresholdsUpdated(e) => {
                ensure_stream(aggregate_id, e.inventory_id)?;
                let mut view = self.existing(e.inventory_id)?;
                view.thresholds = e.thresholds;
                self.store.upsert(e.inventory_id, view);
            }
            InventoryEvent::MovementRecorded(e) => {
                let m = e.movement;
                ensure_stream(aggregate_id, m.inventory_id)?;
                let mut view = self.existing(m.inventory_id)?;
                view.levels.in_transit += m.in_transit_delta;
                view.levels.on_hand = m.quantity_after;
                view.levels.available = m.available_after;
                view.levels.reserved = m.reserved_after;
                view.average_cost = e.average_cost_after;
                view.last_movement_at = Some(m.timestamp);
                self.store.upsert(m.inventory_id, view);
            }
            InventoryEvent::InboundScheduled(e) => {
                ensure_stream(aggregate_id, e.inventory_id)?;
                let mut view = self.existing(e.inventory_id)?;
                view.levels.in_transit += e.quantity;
                self.store.upsert(e.inventory_id, view);
            }
        }

        cursors.insert(aggregate_id, seq);
        Ok(())
    }

    /// Clear the view and replay the given envelopes in stream order.
    pub fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<(), LedgerProjectionError> {
        if let Ok(mut cursors) = self.cursors.write() {
            cursors.clear();
        }
        self.store.clear();

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| (e.aggregate_id(), e.sequence_number()));

        for env in &envs {
            self.apply_envelope(env)?;
        }
        Ok(())
    }

    fn existing(&self, inventory_id: InventoryId) -> Result<LedgerStockView, LedgerProjectionError> {
        self.store
            .get(&inventory_id)
            .ok_or(LedgerProjectionError::UnknownRecord(inventory_id))
    }
}

fn ensure_stream(stream: AggregateId, inventory_id: InventoryId) -> Result<(), LedgerProjectionError> {
    if inventory_id.0 != stream {
        return Err(LedgerProjectionError::StreamMismatch {
            stream,
            found: inventory_id,
        });
    }
    Ok(())
}
