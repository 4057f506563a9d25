//! Fulfillment workflow: pick lists, shipments and returns.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use stockflow_core::{ProductId, WarehouseId};
use stockflow_events::DomainSignal;
use stockflow_inventory::{InventoryId, Movement, MovementReference, MovementType};
use stockflow_sales::{
    RecordReturn, RecordShipment, ReturnCondition, ReturnLine, SalesOrder, SalesOrderCommand, SalesOrderEvent,
    SalesOrderId, ShipmentLine, ShipmentMeta,
};

use super::{Engine, MovementRequest, SALES_ORDER_AGGREGATE, sales_order};
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickGrouping {
    /// One group per (warehouse, location), for walking the shelves.
    ByLocation,
    /// One group per order, in the order given.
    ByOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickLine {
    pub order_id: SalesOrderId,
    pub line_no: u32,
    pub product_id: ProductId,
    pub inventory_id: InventoryId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    /// Reserved and not yet shipped.
    pub quantity: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickGroup {
    pub warehouse_id: Option<WarehouseId>,
    pub location: Option<String>,
    pub order_id: Option<SalesOrderId>,
    pub lines: Vec<PickLine>,
}

impl PickGroup {
    pub fn total_quantity(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PickList {
    pub grouping: PickGrouping,
    pub groups: Vec<PickGroup>,
}

impl PickList {
    pub fn total_quantity(&self) -> i64 {
        self.groups.iter().map(PickGroup::total_quantity).sum()
    }
}

#[derive(Debug, Clone)]
pub struct ShipmentOutcome {
    pub order: SalesOrder,
    pub shipment_id: String,
    pub shipped_quantity: i64,
    pub fully_shipped: bool,
    pub movements: Vec<Movement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLineOutcome {
    pub line_no: u32,
    pub product_id: ProductId,
    pub restocked: i64,
    pub not_restocked: i64,
}

#[derive(Debug, Clone)]
pub struct ReturnOutcome {
    pub order: SalesOrder,
    pub return_id: String,
    pub lines: Vec<ReturnLineOutcome>,
    pub movements: Vec<Movement>,
}

impl ReturnOutcome {
    pub fn restocked(&self) -> i64 {
        self.lines.iter().map(|l| l.restocked).sum()
    }

    pub fn not_restocked(&self) -> i64 {
        self.lines.iter().map(|l| l.not_restocked).sum()
    }
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Reserved, unshipped stock of the given orders. Read only.
    pub fn generate_pick_list(
        &self,
        order_ids: &[SalesOrderId],
        grouping: PickGrouping,
    ) -> Result<PickList, DispatchError> {
        let mut lines = Vec::new();
        for order_id in order_ids {
            let order = self.sales_order(*order_id)?;
            for item in order.items() {
                for a in item.allocations.iter().filter(|a| a.quantity > a.shipped) {
                    lines.push(PickLine {
                        order_id: *order_id,
                        line_no: item.line_no,
                        product_id: item.product_id,
                        inventory_id: a.inventory_id,
                        warehouse_id: a.warehouse_id,
                        location: a.location.clone(),
                        quantity: a.quantity - a.shipped,
                    });
                }
            }
        }

        let groups = match grouping {
            PickGrouping::ByLocation => {
                let mut by_location: BTreeMap<(WarehouseId, Option<String>), Vec<PickLine>> = BTreeMap::new();
                for line in lines {
                    by_location
                        .entry((line.warehouse_id, line.location.clone()))
                        .or_default()
                        .push(line);
                }
                by_location
                    .into_iter()
                    .map(|((warehouse_id, location), lines)| PickGroup {
                        warehouse_id: Some(warehouse_id),
                        location,
                        order_id: None,
                        lines,
                    })
                    .collect()
            }
            PickGrouping::ByOrder => order_ids
                .iter()
                .map(|order_id| PickGroup {
                    warehouse_id: None,
                    location: None,
                    order_id: Some(*order_id),
                    lines: lines.iter().filter(|l| l.order_id == *order_id).cloned().collect(),
                })
                .filter(|g| !g.lines.is_empty())
                .collect(),
        };

        Ok(PickList { grouping, groups })
    }

    /// Ship reserved stock: one `sale` movement per allocation drawn, valued
    /// at the record's average cost.
    ///
    /// Quantities above an item's remaining ordered quantity are rejected
    /// before any stock moves.
    pub fn process_shipment(
        &self,
        order_id: SalesOrderId,
        lines: Vec<ShipmentLine>,
        meta: ShipmentMeta,
    ) -> Result<ShipmentOutcome, DispatchError> {
        let shipment_id = format!("SHP-{}", Uuid::now_v7().simple());
        let reference = MovementReference::new("shipment", &shipment_id);
        let command = SalesOrderCommand::RecordShipment(RecordShipment {
            order_id,
            shipment_id: shipment_id.clone(),
            lines,
            meta,
            occurred_at: self.now(),
        });

        let (out, movements) =
            self.run_with_movements(order_id.0, SALES_ORDER_AGGREGATE, sales_order, &command, |_, events| {
                events
                    .iter()
                    .flat_map(|e| match e {
                        SalesOrderEvent::ShipmentRecorded(s) => s.portions.clone(),
                        _ => Vec::new(),
                    })
                    .map(|p| MovementRequest {
                        inventory_id: p.inventory_id,
                        movement_type: MovementType::Sale,
                        quantity: -p.quantity,
                        unit_cost: None,
                        reference: reference.clone(),
                        performed_by: None,
                    })
                    .collect()
            })?;

        let shipped_quantity: i64 = movements.iter().map(|m| -m.quantity).sum();
        let fully_shipped = out.state.is_fully_shipped();
        info!(%order_id, %shipment_id, shipped_quantity, fully_shipped, "shipment processed");
        self.emit(DomainSignal::ShipmentProcessed {
            order_id: order_id.0,
            shipment_id: shipment_id.clone(),
            quantity: shipped_quantity,
            fully_shipped,
        });

        Ok(ShipmentOutcome {
            order: out.state,
            shipment_id,
            shipped_quantity,
            fully_shipped,
            movements,
        })
    }

    /// Take back shipped units. Resellable goods flagged restockable go back
    /// on the shelf as `return` movements; the rest is recorded only.
    pub fn process_return(
        &self,
        order_id: SalesOrderId,
        lines: Vec<ReturnLine>,
        condition: ReturnCondition,
        restockable: bool,
        reason: Option<String>,
    ) -> Result<ReturnOutcome, DispatchError> {
        let return_id = format!("RET-{}", Uuid::now_v7().simple());
        let reference = MovementReference::new("return", &return_id);
        let command = SalesOrderCommand::RecordReturn(RecordReturn {
            order_id,
            return_id: return_id.clone(),
            lines,
            condition,
            restockable,
            reason,
            occurred_at: self.now(),
        });

        let (out, movements) =
            self.run_with_movements(order_id.0, SALES_ORDER_AGGREGATE, sales_order, &command, |_, events| {
                events
                    .iter()
                    .flat_map(|e| match e {
                        SalesOrderEvent::ReturnRecorded(r) => r.portions.clone(),
                        _ => Vec::new(),
                    })
                    .filter(|p| p.restocked)
                    .map(|p| MovementRequest {
                        inventory_id: p.inventory_id,
                        movement_type: MovementType::Return,
                        quantity: p.quantity,
                        unit_cost: None,
                        reference: reference.clone(),
                        performed_by: None,
                    })
                    .collect()
            })?;

        let mut per_line: BTreeMap<u32, ReturnLineOutcome> = BTreeMap::new();
        for stored in &out.events {
            let event: SalesOrderEvent = serde_json::from_value(stored.payload.clone())
                .map_err(|e| DispatchError::Deserialize(format!("{} #{}: {e}", stored.event_type, stored.sequence_number)))?;
            let SalesOrderEvent::ReturnRecorded(recorded) = event else {
                continue;
            };
            for p in recorded.portions {
                let line = per_line.entry(p.line_no).or_insert(ReturnLineOutcome {
                    line_no: p.line_no,
                    product_id: p.product_id,
                    restocked: 0,
                    not_restocked: 0,
                });
                if p.restocked {
                    line.restocked += p.quantity;
                } else {
                    line.not_restocked += p.quantity;
                }
            }
        }

        let outcome = ReturnOutcome {
            order: out.state,
            return_id,
            lines: per_line.into_values().collect(),
            movements,
        };
        info!(
            %order_id,
            return_id = %outcome.return_id,
            restocked = outcome.restocked(),
            not_restocked = outcome.not_restocked(),
            "return processed"
        );
        self.emit(DomainSignal::ReturnProcessed {
            order_id: order_id.0,
            restocked: outcome.restocked(),
            not_restocked: outcome.not_restocked(),
        });
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use stockflow_core::CustomerId;
    use stockflow_inventory::ReorderThresholds;
    use stockflow_sales::{NewOrderItem, SalesOrderStatus};

    use super::*;
    use crate::config::EngineConfig;
    use crate::event_bus::InMemoryEnvelopeBus;
    use crate::event_store::InMemoryEventStore;
    use crate::services::{AllocateOptions, LedgerRecordSpec, NewOrder};

    type TestEngine = Engine<InMemoryEventStore, InMemoryEnvelopeBus>;

    struct Fixture {
        engine: TestEngine,
        record: InventoryId,
        order_id: SalesOrderId,
    }

    /// One record with `on_hand` units and an allocated order for `ordered`.
    fn allocated_order(on_hand: i64, ordered: i64, location: Option<&str>) -> Fixture {
        let engine = Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), EngineConfig::default());
        let product = ProductId::new();
        let warehouse = WarehouseId::new();
        let record = engine
            .upsert_ledger_record(LedgerRecordSpec {
                product_id: product,
                warehouse_id: warehouse,
                location: location.map(str::to_string),
                thresholds: ReorderThresholds::default(),
            })
            .unwrap()
            .id_typed();
        engine
            .record_movement(MovementRequest {
                inventory_id: record,
                movement_type: MovementType::AdjustmentIn,
                quantity: on_hand,
                unit_cost: Some(dec!(2)),
                reference: MovementReference::new("adjustment", "opening"),
                performed_by: None,
            })
            .unwrap();
        let order_id = engine
            .place_order(NewOrder {
                customer_id: Some(CustomerId::new()),
                warehouse_id: warehouse,
                items: vec![NewOrderItem {
                    product_id: product,
                    quantity: ordered,
                    unit_price: dec!(7),
                }],
            })
            .unwrap()
            .id_typed();
        engine.allocate(order_id, AllocateOptions::default()).unwrap();
        Fixture {
            engine,
            record,
            order_id,
        }
    }

    #[test]
    fn pick_list_groups_by_location() {
        let f = allocated_order(10, 4, Some("A-01"));
        let list = f.engine.generate_pick_list(&[f.order_id], PickGrouping::ByLocation).unwrap();

        assert_eq!(list.groups.len(), 1);
        assert_eq!(list.groups[0].location.as_deref(), Some("A-01"));
        assert_eq!(list.total_quantity(), 4);

        let by_order = f.engine.generate_pick_list(&[f.order_id], PickGrouping::ByOrder).unwrap();
        assert_eq!(by_order.groups[0].order_id, Some(f.order_id));
    }

    #[test]
    fn shipment_consumes_reserved_stock() {
        let f = allocated_order(10, 4, None);
        let outcome = f
            .engine
            .process_shipment(f.order_id, vec![ShipmentLine { line_no: 1, quantity: 3 }], ShipmentMeta::default())
            .unwrap();

        assert_eq!(outcome.shipped_quantity, 3);
        assert!(!outcome.fully_shipped);
        assert_eq!(outcome.order.status(), SalesOrderStatus::PartiallyShipped);

        let record = f.engine.inventory_record(f.record).unwrap();
        assert_eq!(record.quantity_on_hand(), 7);
        assert_eq!(record.quantity_reserved(), 1);
        assert_eq!(record.quantity_available(), 6);

        let rest = f
            .engine
            .process_shipment(f.order_id, vec![ShipmentLine { line_no: 1, quantity: 1 }], ShipmentMeta::default())
            .unwrap();
        assert!(rest.fully_shipped);
        assert_eq!(rest.order.status(), SalesOrderStatus::Shipped);
    }

    #[test]
    fn shipped_units_are_valued_at_average_cost() {
        let f = allocated_order(10, 4, None);
        let outcome = f
            .engine
            .process_shipment(f.order_id, vec![ShipmentLine { line_no: 1, quantity: 4 }], ShipmentMeta::default())
            .unwrap();
        assert_eq!(outcome.movements[0].unit_cost, Some(dec!(2)));

        let product = f.engine.inventory_record(f.record).unwrap().product_id().unwrap();
        let now = f.engine.now();
        let sales = f
            .engine
            .sales_history(product, now - chrono::Duration::days(1), now + chrono::Duration::days(1))
            .unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].quantity, 4);
        assert_eq!(sales[0].value, dec!(8));
    }

    #[test]
    fn damaged_return_is_recorded_without_restock() {
        let f = allocated_order(10, 4, None);
        f.engine
            .process_shipment(f.order_id, vec![ShipmentLine { line_no: 1, quantity: 4 }], ShipmentMeta::default())
            .unwrap();

        let outcome = f
            .engine
            .process_return(
                f.order_id,
                vec![ReturnLine { line_no: 1, quantity: 1 }],
                ReturnCondition::Damaged,
                true,
                Some("crushed box".to_string()),
            )
            .unwrap();

        assert_eq!(outcome.restocked(), 0);
        assert_eq!(outcome.not_restocked(), 1);
        assert!(outcome.movements.is_empty());
        assert_eq!(f.engine.inventory_record(f.record).unwrap().quantity_on_hand(), 6);
    }

    #[test]
    fn release_returns_reservations_to_available() {
        let f = allocated_order(10, 4, None);
        let order = f.engine.release_allocation(f.order_id).unwrap();

        assert_eq!(order.status(), SalesOrderStatus::Pending);
        let record = f.engine.inventory_record(f.record).unwrap();
        assert_eq!(record.quantity_available(), 10);
        assert_eq!(record.quantity_reserved(), 0);
    }
}
