//! Ledger store and movement log operations.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use stockflow_core::{ProductId, UserId, WarehouseId};
use stockflow_events::DomainSignal;
use stockflow_inventory::{
    InventoryCommand, InventoryEvent, InventoryId, InventoryRecord, Movement, MovementRecorded, MovementReference,
    MovementType, RecordMovement, ReorderThresholds, ReverseMovement, ScheduleInbound, StockLevels, UpsertRecord,
    replay,
};

use super::{Engine, INVENTORY_AGGREGATE, inventory_record};
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::{EventFilter, EventStore, Pagination, StoredEvent};

/// Key and thresholds of a ledger record to create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecordSpec {
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    #[serde(default)]
    pub thresholds: ReorderThresholds,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRequest {
    pub inventory_id: InventoryId,
    pub movement_type: MovementType,
    /// Signed; see [`MovementType::validate_quantity`].
    pub quantity: i64,
    pub unit_cost: Option<Decimal>,
    pub reference: MovementReference,
    pub performed_by: Option<UserId>,
}

/// Movement history query. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementFilter {
    pub inventory_id: Option<InventoryId>,
    pub product_id: Option<ProductId>,
    pub warehouse_id: Option<WarehouseId>,
    /// Empty means every type.
    pub movement_types: Vec<MovementType>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub page: Option<Pagination>,
}

impl MovementFilter {
    fn matches(&self, m: &Movement) -> bool {
        self.product_id.is_none_or(|p| m.product_id == p)
            && self.warehouse_id.is_none_or(|w| m.warehouse_id == w)
            && (self.movement_types.is_empty() || self.movement_types.contains(&m.movement_type))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovementHistory {
    pub movements: Vec<Movement>,
    pub has_more: bool,
}

/// Stock levels rebuilt from the movement log next to the live snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub inventory_id: InventoryId,
    pub snapshot: StockLevels,
    pub replayed: StockLevels,
    pub movements: usize,
}

impl ReplayReport {
    /// In-transit stock is not part of the log and is not compared.
    pub fn is_consistent(&self) -> bool {
        self.snapshot.on_hand == self.replayed.on_hand
            && self.snapshot.available == self.replayed.available
            && self.snapshot.reserved == self.replayed.reserved
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub outbound: Movement,
    pub inbound: Movement,
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Create the record for (product, warehouse, location) or merge new thresholds.
    ///
    /// Quantities never change here; stock only moves through movements.
    pub fn upsert_ledger_record(&self, spec: LedgerRecordSpec) -> Result<InventoryRecord, DispatchError> {
        let inventory_id = InventoryId::for_position(spec.product_id, spec.warehouse_id, spec.location.as_deref());
        let out = self.dispatcher.dispatch(
            inventory_id.0,
            INVENTORY_AGGREGATE,
            InventoryCommand::UpsertRecord(UpsertRecord {
                inventory_id,
                product_id: spec.product_id,
                warehouse_id: spec.warehouse_id,
                location: spec.location,
                thresholds: spec.thresholds,
                occurred_at: self.now(),
            }),
            inventory_record,
        )?;

        if !out.is_noop() {
            info!(%inventory_id, product_id = %spec.product_id, warehouse_id = %spec.warehouse_id, "ledger record upserted");
        }
        Ok(out.state)
    }

    pub fn inventory_record(&self, inventory_id: InventoryId) -> Result<InventoryRecord, DispatchError> {
        let record = self.dispatcher.load(inventory_id.0, inventory_record)?;
        if !record.is_created() {
            return Err(DispatchError::NotFound(format!("inventory record {inventory_id}")));
        }
        Ok(record)
    }

    /// All records of a product, in record id order.
    pub fn records_for_product(&self, product_id: ProductId) -> Result<Vec<InventoryRecord>, DispatchError> {
        let mut records: Vec<InventoryRecord> = self
            .all_records()?
            .into_iter()
            .filter(|r| r.product_id() == Some(product_id))
            .collect();
        records.sort_by_key(|r| r.id_typed());
        Ok(records)
    }

    /// Every opened record, rehydrated from its stream.
    pub fn all_records(&self) -> Result<Vec<InventoryRecord>, DispatchError> {
        let opened = self.dispatcher.store().load_events(&EventFilter {
            aggregate_type: Some(INVENTORY_AGGREGATE.to_string()),
            event_type: Some("inventory.record.opened".to_string()),
            ..Default::default()
        })?;

        let mut records = Vec::with_capacity(opened.len());
        for e in opened {
            records.push(self.dispatcher.load(e.aggregate_id, inventory_record)?);
        }
        Ok(records)
    }

    /// Record one movement atomically against its record.
    pub fn record_movement(&self, request: MovementRequest) -> Result<Movement, DispatchError> {
        let (_, recorded) = self.apply_movement(request)?;
        Ok(recorded.movement)
    }

    /// Increase in-transit stock for goods ordered but not yet received.
    pub fn schedule_inbound(
        &self,
        inventory_id: InventoryId,
        quantity: i64,
        reference: MovementReference,
    ) -> Result<InventoryRecord, DispatchError> {
        let out = self.dispatcher.dispatch(
            inventory_id.0,
            INVENTORY_AGGREGATE,
            InventoryCommand::ScheduleInbound(ScheduleInbound {
                inventory_id,
                quantity,
                reference,
                occurred_at: self.now(),
            }),
            inventory_record,
        )?;
        debug!(%inventory_id, quantity, in_transit = out.state.quantity_in_transit(), "inbound scheduled");
        Ok(out.state)
    }

    /// Move stock between two records at the source's average cost.
    ///
    /// If the destination leg fails the source leg is reversed; a failed
    /// reversal is reported as [`DispatchError::Compensation`].
    pub fn transfer_stock(
        &self,
        from: InventoryId,
        to: InventoryId,
        quantity: i64,
        performed_by: Option<UserId>,
    ) -> Result<TransferOutcome, DispatchError> {
        if from == to {
            return Err(DispatchError::Validation("cannot transfer to the same record".to_string()));
        }
        if quantity <= 0 {
            return Err(DispatchError::Validation("transfer quantity must be positive".to_string()));
        }
        let source = self.inventory_record(from)?;
        self.inventory_record(to)?;

        let reference = MovementReference::new("transfer", Uuid::now_v7());
        let unit_cost = Some(source.average_cost());

        let (_, outbound) = self.apply_movement(MovementRequest {
            inventory_id: from,
            movement_type: MovementType::Transfer,
            quantity: -quantity,
            unit_cost: None,
            reference: reference.clone(),
            performed_by,
        })?;

        let inbound = match self.apply_movement(MovementRequest {
            inventory_id: to,
            movement_type: MovementType::Transfer,
            quantity,
            unit_cost,
            reference,
            performed_by,
        }) {
            Ok((_, m)) => m,
            Err(err) => return Err(self.rolled_back(err, std::slice::from_ref(&outbound))),
        };

        info!(%from, %to, quantity, "stock transferred");
        Ok(TransferOutcome {
            outbound: outbound.movement,
            inbound: inbound.movement,
        })
    }

    /// Movements in time order.
    pub fn movement_history(&self, filter: &MovementFilter) -> Result<MovementHistory, DispatchError> {
        let events = self.dispatcher.store().load_events(&EventFilter {
            aggregate_id: filter.inventory_id.map(|id| id.0),
            aggregate_type: Some(INVENTORY_AGGREGATE.to_string()),
            event_type: Some(InventoryEvent::MOVEMENT_RECORDED.to_string()),
            occurred_after: filter.from,
            occurred_before: filter.to,
        })?;

        let mut movements = Vec::new();
        for stored in &events {
            let m = decode_movement(stored)?;
            if filter.matches(&m) {
                movements.push(m);
            }
        }
        movements.sort_by_key(|m| m.timestamp);

        Ok(match filter.page {
            Some(page) => {
                let (movements, has_more) = page.page(movements);
                MovementHistory { movements, has_more }
            }
            None => MovementHistory {
                movements,
                has_more: false,
            },
        })
    }

    /// Rebuild a record's levels from its movement log and compare with the snapshot.
    pub fn replay_ledger(&self, inventory_id: InventoryId) -> Result<ReplayReport, DispatchError> {
        let record = self.inventory_record(inventory_id)?;
        let history = self.dispatcher.store().load_stream(inventory_id.0)?;

        let mut movements = Vec::new();
        for stored in history.iter().filter(|e| e.event_type == InventoryEvent::MOVEMENT_RECORDED) {
            movements.push(decode_movement(stored)?);
        }
        let replayed = replay(&movements)?;

        let report = ReplayReport {
            inventory_id,
            snapshot: record.levels(),
            replayed,
            movements: movements.len(),
        };
        if !report.is_consistent() {
            warn!(%inventory_id, snapshot = ?report.snapshot, replayed = ?report.replayed, "ledger replay mismatch");
        }
        Ok(report)
    }

    /// Reserve as much of `wanted` as is available right now. Returns the
    /// reservation movement, or `None` when nothing was available.
    pub(crate) fn reserve_up_to(
        &self,
        inventory_id: InventoryId,
        wanted: i64,
        reference: &MovementReference,
    ) -> Result<Option<MovementRecorded>, DispatchError> {
        if wanted <= 0 {
            return Ok(None);
        }
        let movement_id = Uuid::now_v7();
        let occurred_at = self.now();

        let out = self
            .dispatcher
            .dispatch_with(inventory_id.0, INVENTORY_AGGREGATE, inventory_record, |record| {
                if !record.is_created() {
                    return Err(DispatchError::NotFound(format!("inventory record {inventory_id}")));
                }
                let reserved = record.quantity_available().min(wanted);
                if reserved <= 0 {
                    return Ok(None);
                }
                Ok(Some(InventoryCommand::RecordMovement(RecordMovement {
                    inventory_id,
                    movement_id,
                    movement_type: MovementType::Reservation,
                    quantity: reserved,
                    unit_cost: None,
                    reference: reference.clone(),
                    performed_by: None,
                    occurred_at,
                })))
            })?;

        if out.is_noop() {
            return Ok(None);
        }
        let recorded = committed_movement(&out.events)?;
        self.after_movement(&out.state, &recorded.movement);
        Ok(Some(recorded))
    }

    pub(crate) fn apply_movement(
        &self,
        request: MovementRequest,
    ) -> Result<(InventoryRecord, MovementRecorded), DispatchError> {
        let inventory_id = request.inventory_id;
        let out = self.dispatcher.dispatch(
            inventory_id.0,
            INVENTORY_AGGREGATE,
            InventoryCommand::RecordMovement(RecordMovement {
                inventory_id,
                movement_id: Uuid::now_v7(),
                movement_type: request.movement_type,
                quantity: request.quantity,
                unit_cost: request.unit_cost,
                reference: request.reference,
                performed_by: request.performed_by,
                occurred_at: self.now(),
            }),
            inventory_record,
        )?;

        let recorded = committed_movement(&out.events)?;
        self.after_movement(&out.state, &recorded.movement);
        Ok((out.state, recorded))
    }

    /// Cancel `original` with one reversal movement on its record.
    pub(crate) fn reverse_movement(&self, original: &MovementRecorded) -> Result<MovementRecorded, DispatchError> {
        let inventory_id = original.movement.inventory_id;
        let out = self.dispatcher.dispatch(
            inventory_id.0,
            INVENTORY_AGGREGATE,
            InventoryCommand::ReverseMovement(ReverseMovement {
                inventory_id,
                movement_id: Uuid::now_v7(),
                original: original.clone(),
                reference: MovementReference::new("compensation", &original.movement.reference.reference_id),
                occurred_at: self.now(),
            }),
            inventory_record,
        )?;

        let recorded = committed_movement(&out.events)?;
        debug!(
            %inventory_id,
            reverses = %original.movement.movement_id,
            movement_type = %recorded.movement.movement_type,
            "movement reversed"
        );
        self.after_movement(&out.state, &recorded.movement);
        Ok(recorded)
    }

    /// Reverse applied movements, newest first. Every reversal is attempted;
    /// the first failure is returned.
    pub(crate) fn undo(&self, applied: &[MovementRecorded]) -> Result<(), DispatchError> {
        let mut first_failure = None;
        for original in applied.iter().rev() {
            if let Err(err) = self.reverse_movement(original) {
                error!(
                    inventory_id = %original.movement.inventory_id,
                    movement_id = %original.movement.movement_id,
                    error = %err,
                    "reversal failed; movement left in the ledger"
                );
                first_failure.get_or_insert(err);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    /// Undo `applied` after `cause`; the error to return to the caller.
    pub(crate) fn rolled_back(&self, cause: DispatchError, applied: &[MovementRecorded]) -> DispatchError {
        match self.undo(applied) {
            Ok(()) => cause,
            Err(compensation) => DispatchError::Compensation {
                cause: Box::new(cause),
                compensation: Box::new(compensation),
            },
        }
    }

    fn after_movement(&self, record: &InventoryRecord, m: &Movement) {
        debug!(
            inventory_id = %m.inventory_id,
            movement_type = %m.movement_type,
            quantity = m.quantity,
            on_hand = m.quantity_after,
            available = m.available_after,
            "movement recorded"
        );
        self.emit(DomainSignal::StockLevelChanged {
            inventory_id: m.inventory_id.0,
            product_id: m.product_id,
            warehouse_id: m.warehouse_id,
            movement_type: m.movement_type.to_string(),
            quantity: m.quantity,
            quantity_on_hand: m.quantity_after,
            quantity_available: m.available_after,
        });
        if record.is_low_stock() {
            self.emit(DomainSignal::LowStock {
                inventory_id: m.inventory_id.0,
                product_id: m.product_id,
                warehouse_id: m.warehouse_id,
                quantity_available: m.available_after,
                reorder_point: record.thresholds().reorder_point,
            });
        }
    }
}

fn decode_recorded(stored: &StoredEvent) -> Result<MovementRecorded, DispatchError> {
    let event: InventoryEvent = serde_json::from_value(stored.payload.clone())
        .map_err(|e| DispatchError::Deserialize(format!("{} #{}: {e}", stored.event_type, stored.sequence_number)))?;
    match event {
        InventoryEvent::MovementRecorded(e) => Ok(e),
        _ => Err(DispatchError::Deserialize(format!(
            "{} #{} is not a movement",
            stored.event_type, stored.sequence_number
        ))),
    }
}

fn decode_movement(stored: &StoredEvent) -> Result<Movement, DispatchError> {
    decode_recorded(stored).map(|e| e.movement)
}

/// The single movement a movement command committed.
fn committed_movement(events: &[StoredEvent]) -> Result<MovementRecorded, DispatchError> {
    events
        .iter()
        .rev()
        .find(|e| e.event_type == InventoryEvent::MOVEMENT_RECORDED)
        .ok_or_else(|| DispatchError::InvariantViolation("movement command committed no movement".to_string()))
        .and_then(decode_recorded)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::config::EngineConfig;
    use crate::event_bus::InMemoryEnvelopeBus;
    use crate::event_store::InMemoryEventStore;
    use crate::notifications::{InMemoryNotificationSink, SignalDispatcher};

    type TestEngine = Engine<InMemoryEventStore, InMemoryEnvelopeBus>;

    fn engine() -> (TestEngine, Arc<InMemoryNotificationSink>) {
        let sink = Arc::new(InMemoryNotificationSink::new());
        let engine = Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), EngineConfig::default())
            .with_signals(SignalDispatcher::new().with_sink(sink.clone()));
        (engine, sink)
    }

    fn open(engine: &TestEngine, reorder_point: i64) -> InventoryRecord {
        engine
            .upsert_ledger_record(LedgerRecordSpec {
                product_id: ProductId::new(),
                warehouse_id: WarehouseId::new(),
                location: None,
                thresholds: ReorderThresholds {
                    reorder_point,
                    reorder_quantity: 50,
                    max_stock_level: None,
                },
            })
            .unwrap()
    }

    fn request(id: InventoryId, movement_type: MovementType, quantity: i64, unit_cost: Option<Decimal>) -> MovementRequest {
        MovementRequest {
            inventory_id: id,
            movement_type,
            quantity,
            unit_cost,
            reference: MovementReference::new("adjustment", "test"),
            performed_by: None,
        }
    }

    #[test]
    fn upsert_is_idempotent_and_keeps_quantities() {
        let (engine, _) = engine();
        let record = open(&engine, 5);
        let id = record.id_typed();
        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 10, Some(dec!(2))))
            .unwrap();

        let again = engine
            .upsert_ledger_record(LedgerRecordSpec {
                product_id: record.product_id().unwrap(),
                warehouse_id: record.warehouse_id().unwrap(),
                location: None,
                thresholds: ReorderThresholds {
                    reorder_point: 8,
                    reorder_quantity: 50,
                    max_stock_level: None,
                },
            })
            .unwrap();

        assert_eq!(again.id_typed(), id);
        assert_eq!(again.quantity_on_hand(), 10);
        assert_eq!(again.thresholds().reorder_point, 8);
    }

    #[test]
    fn inbound_movements_update_weighted_average_cost() {
        let (engine, _) = engine();
        let id = open(&engine, 0).id_typed();

        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 10, Some(dec!(4))))
            .unwrap();
        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 10, Some(dec!(6))))
            .unwrap();

        assert_eq!(engine.inventory_record(id).unwrap().average_cost(), dec!(5));
    }

    #[test]
    fn outbound_beyond_available_is_rejected_without_a_movement() {
        let (engine, _) = engine();
        let id = open(&engine, 0).id_typed();
        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 3, None))
            .unwrap();

        let err = engine
            .record_movement(request(id, MovementType::AdjustmentOut, -4, None))
            .unwrap_err();
        assert!(matches!(err, DispatchError::InsufficientStock(_)));

        let history = engine
            .movement_history(&MovementFilter {
                inventory_id: Some(id),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(history.movements.len(), 1);
    }

    #[test]
    fn low_stock_signal_fires_at_reorder_point() {
        let (engine, sink) = engine();
        let id = open(&engine, 5).id_typed();

        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 10, None))
            .unwrap();
        assert!(sink.of_kind("low_stock").is_empty());

        engine
            .record_movement(request(id, MovementType::AdjustmentOut, -5, None))
            .unwrap();
        assert_eq!(sink.of_kind("low_stock").len(), 1);
        assert_eq!(sink.of_kind("stock_level_changed").len(), 2);
    }

    #[test]
    fn reserve_up_to_takes_what_is_available() {
        let (engine, _) = engine();
        let id = open(&engine, 0).id_typed();
        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 4, None))
            .unwrap();

        let reference = MovementReference::new("order", "SO-1");
        let reserved = engine.reserve_up_to(id, 10, &reference).unwrap().unwrap();
        assert_eq!(reserved.movement.quantity, 4);
        assert!(engine.reserve_up_to(id, 10, &reference).unwrap().is_none());

        let record = engine.inventory_record(id).unwrap();
        assert_eq!(record.quantity_reserved(), 4);
        assert_eq!(record.quantity_available(), 0);
        assert_eq!(record.quantity_on_hand(), 4);
    }

    #[test]
    fn transfer_moves_stock_at_source_cost() {
        let (engine, _) = engine();
        let from = open(&engine, 0).id_typed();
        let to = open(&engine, 0).id_typed();
        engine
            .record_movement(request(from, MovementType::AdjustmentIn, 10, Some(dec!(3))))
            .unwrap();

        let outcome = engine.transfer_stock(from, to, 4, None).unwrap();
        assert_eq!(outcome.outbound.quantity, -4);
        assert_eq!(outcome.inbound.quantity, 4);

        assert_eq!(engine.inventory_record(from).unwrap().quantity_on_hand(), 6);
        let dest = engine.inventory_record(to).unwrap();
        assert_eq!(dest.quantity_available(), 4);
        assert_eq!(dest.average_cost(), dec!(3));
    }

    #[test]
    fn transfer_to_unknown_record_moves_nothing() {
        let (engine, _) = engine();
        let from = open(&engine, 0).id_typed();
        engine
            .record_movement(request(from, MovementType::AdjustmentIn, 10, None))
            .unwrap();

        let missing = InventoryId::for_position(ProductId::new(), WarehouseId::new(), None);
        let err = engine.transfer_stock(from, missing, 4, None).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
        assert_eq!(engine.inventory_record(from).unwrap().quantity_on_hand(), 10);
    }

    #[test]
    fn history_filters_by_type_and_replay_matches_snapshot() {
        let (engine, _) = engine();
        let id = open(&engine, 0).id_typed();
        engine
            .record_movement(request(id, MovementType::AdjustmentIn, 10, Some(dec!(1))))
            .unwrap();
        engine
            .record_movement(request(id, MovementType::Reservation, 6, None))
            .unwrap();
        engine
            .record_movement(request(id, MovementType::Sale, -4, None))
            .unwrap();
        engine
            .schedule_inbound(id, 20, MovementReference::new("purchase_order", "PO-1"))
            .unwrap();

        let sales = engine
            .movement_history(&MovementFilter {
                movement_types: vec![MovementType::Sale],
                ..Default::default()
            })
            .unwrap();
        assert_eq!(sales.movements.len(), 1);
        assert_eq!(sales.movements[0].quantity_after, 6);

        let report = engine.replay_ledger(id).unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.movements, 3);
        assert_eq!(report.snapshot.in_transit, 20);
        assert_eq!(
            report.replayed,
            StockLevels {
                on_hand: 6,
                available: 4,
                reserved: 2,
                in_transit: 0
            }
        );
    }

    #[test]
    fn history_pages_in_time_order() {
        let (engine, _) = engine();
        let id = open(&engine, 0).id_typed();
        for q in 1..=3 {
            engine
                .record_movement(request(id, MovementType::AdjustmentIn, q, None))
                .unwrap();
        }

        let page = engine
            .movement_history(&MovementFilter {
                page: Some(Pagination { limit: 2, offset: 0 }),
                ..Default::default()
            })
            .unwrap();
        assert!(page.has_more);
        assert_eq!(page.movements.iter().map(|m| m.quantity).collect::<Vec<_>>(), vec![1, 2]);
    }
}
