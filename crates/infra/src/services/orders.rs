//! Sales order lifecycle: placing, backorders, releasing and cancelling.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stockflow_core::{AggregateId, CustomerId, WarehouseId};
use stockflow_events::DomainSignal;
use stockflow_inventory::{MovementReference, MovementType};
use stockflow_sales::{
    BackorderLine, CancelOrder, LinkBackorder, NewOrderItem, PlaceOrder, ReleaseAllocations, SalesOrder,
    SalesOrderCommand, SalesOrderEvent, SalesOrderId, SalesOrderStatus,
};

use super::{Engine, MovementRequest, SALES_ORDER_AGGREGATE, sales_order};
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    pub customer_id: Option<CustomerId>,
    pub warehouse_id: WarehouseId,
    pub items: Vec<NewOrderItem>,
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    pub fn place_order(&self, order: NewOrder) -> Result<SalesOrder, DispatchError> {
        self.place(order, None)
    }

    pub fn sales_order(&self, order_id: SalesOrderId) -> Result<SalesOrder, DispatchError> {
        let order = self.dispatcher.load(order_id.0, sales_order)?;
        if !order.is_created() {
            return Err(DispatchError::NotFound(format!("sales order {order_id}")));
        }
        Ok(order)
    }

    /// Create a backorder for unallocated quantity of `order_id` and link it.
    ///
    /// `lines` defaults to every line's full unallocated remainder.
    pub fn create_backorder(
        &self,
        order_id: SalesOrderId,
        lines: Option<Vec<BackorderLine>>,
    ) -> Result<SalesOrder, DispatchError> {
        let original = self.sales_order(order_id)?;
        let lines: Vec<BackorderLine> = match lines {
            Some(lines) => lines,
            None => original
                .unallocated_items()
                .map(|(item, short)| BackorderLine {
                    line_no: item.line_no,
                    quantity: short,
                })
                .collect(),
        };
        if lines.is_empty() {
            return Err(DispatchError::Validation(format!("order {order_id} has nothing to backorder")));
        }

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = original
                .item(line.line_no)
                .ok_or_else(|| DispatchError::Validation(format!("unknown order line {}", line.line_no)))?;
            if line.quantity <= 0 || line.quantity > item.remaining_to_allocate() {
                return Err(DispatchError::Validation(format!(
                    "line {}: cannot backorder {} of {} unallocated",
                    line.line_no,
                    line.quantity,
                    item.remaining_to_allocate()
                )));
            }
            items.push(NewOrderItem {
                product_id: item.product_id,
                quantity: line.quantity,
                unit_price: item.unit_price,
            });
        }
        let warehouse_id = original
            .warehouse_id()
            .ok_or_else(|| DispatchError::InvariantViolation(format!("order {order_id} has no warehouse")))?;

        let backorder = self.place(
            NewOrder {
                customer_id: original.customer_id(),
                warehouse_id,
                items,
            },
            Some(order_id),
        )?;
        let backorder_id = backorder.id_typed();

        let linked = self.dispatcher.dispatch(
            order_id.0,
            SALES_ORDER_AGGREGATE,
            SalesOrderCommand::LinkBackorder(LinkBackorder {
                order_id,
                backorder_id,
                lines: lines.clone(),
                occurred_at: self.now(),
            }),
            sales_order,
        );
        if let Err(err) = linked {
            // The backorder is still pending; withdraw it.
            if let Err(cancel_err) = self.dispatcher.dispatch(
                backorder_id.0,
                SALES_ORDER_AGGREGATE,
                SalesOrderCommand::CancelOrder(CancelOrder {
                    order_id: backorder_id,
                    reason: Some("backorder link failed".to_string()),
                    occurred_at: self.now(),
                }),
                sales_order,
            ) {
                warn!(%backorder_id, error = %cancel_err, "could not cancel unlinked backorder");
            }
            return Err(err);
        }

        let quantity: i64 = lines.iter().map(|l| l.quantity).sum();
        info!(%order_id, %backorder_id, quantity, "backorder created");
        self.emit(DomainSignal::BackorderCreated {
            order_id: order_id.0,
            backorder_id: backorder_id.0,
            quantity,
        });
        Ok(backorder)
    }

    /// Hand every unshipped reservation of the order back to available stock.
    pub fn release_allocation(&self, order_id: SalesOrderId) -> Result<SalesOrder, DispatchError> {
        self.sales_order(order_id)?;
        let reference = MovementReference::new("sales_order", order_id);

        let (out, movements) = self.run_with_movements(
            order_id.0,
            SALES_ORDER_AGGREGATE,
            sales_order,
            &SalesOrderCommand::ReleaseAllocations(ReleaseAllocations {
                order_id,
                occurred_at: self.now(),
            }),
            |_, events| {
                events
                    .iter()
                    .flat_map(|e| match e {
                        SalesOrderEvent::AllocationsReleased(r) => r.portions.clone(),
                        _ => Vec::new(),
                    })
                    .map(|p| MovementRequest {
                        inventory_id: p.inventory_id,
                        movement_type: MovementType::Release,
                        quantity: -p.quantity,
                        unit_cost: None,
                        reference: reference.clone(),
                        performed_by: None,
                    })
                    .collect()
            },
        )?;

        if !movements.is_empty() {
            let released: i64 = movements.iter().map(|m| -m.quantity).sum();
            info!(%order_id, released, "allocations released");
        }
        Ok(out.state)
    }

    /// Cancel an order that has shipped nothing, releasing its reservations first.
    pub fn cancel_order(&self, order_id: SalesOrderId, reason: Option<String>) -> Result<SalesOrder, DispatchError> {
        let order = self.sales_order(order_id)?;
        if order.items().iter().any(|i| i.quantity_shipped > 0) || order.status() == SalesOrderStatus::Cancelled {
            return Err(DispatchError::InvalidState(format!(
                "order {order_id} cannot be cancelled in status {:?}",
                order.status()
            )));
        }

        if order.items().iter().any(|i| i.reserved_unshipped() > 0) {
            self.release_allocation(order_id)?;
        }

        let out = self.dispatcher.dispatch(
            order_id.0,
            SALES_ORDER_AGGREGATE,
            SalesOrderCommand::CancelOrder(CancelOrder {
                order_id,
                reason,
                occurred_at: self.now(),
            }),
            sales_order,
        )?;
        info!(%order_id, "order cancelled");
        Ok(out.state)
    }

    fn place(&self, order: NewOrder, backorder_of: Option<SalesOrderId>) -> Result<SalesOrder, DispatchError> {
        let order_id = SalesOrderId::new(AggregateId::new());
        let out = self.dispatcher.dispatch(
            order_id.0,
            SALES_ORDER_AGGREGATE,
            SalesOrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                customer_id: order.customer_id,
                warehouse_id: order.warehouse_id,
                items: order.items,
                backorder_of,
                occurred_at: self.now(),
            }),
            sales_order,
        )?;
        info!(%order_id, items = out.state.items().len(), backorder_of = ?backorder_of, "order placed");
        Ok(out.state)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use stockflow_core::ProductId;

    use super::*;
    use crate::config::EngineConfig;
    use crate::event_bus::InMemoryEnvelopeBus;
    use crate::event_store::InMemoryEventStore;

    fn engine() -> Engine<InMemoryEventStore, InMemoryEnvelopeBus> {
        Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), EngineConfig::default())
    }

    fn order_of(quantities: &[i64]) -> NewOrder {
        NewOrder {
            customer_id: Some(CustomerId::new()),
            warehouse_id: WarehouseId::new(),
            items: quantities
                .iter()
                .map(|q| NewOrderItem {
                    product_id: ProductId::new(),
                    quantity: *q,
                    unit_price: dec!(9.99),
                })
                .collect(),
        }
    }

    #[test]
    fn unknown_order_is_not_found() {
        let err = engine().sales_order(SalesOrderId::new(AggregateId::new())).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn standalone_backorder_carries_the_unallocated_remainder() {
        let engine = engine();
        let order = engine.place_order(order_of(&[4, 6])).unwrap();

        let backorder = engine
            .create_backorder(
                order.id_typed(),
                Some(vec![BackorderLine {
                    line_no: 2,
                    quantity: 6,
                }]),
            )
            .unwrap();

        assert_eq!(backorder.backorder_of(), Some(order.id_typed()));
        assert_eq!(backorder.items().len(), 1);
        assert_eq!(backorder.items()[0].quantity, 6);
        assert_eq!(backorder.items()[0].product_id, order.items()[1].product_id);

        let original = engine.sales_order(order.id_typed()).unwrap();
        assert_eq!(original.backorders(), &[backorder.id_typed()]);
        assert_eq!(original.items()[1].remaining_to_allocate(), 0);
        assert_eq!(original.items()[0].remaining_to_allocate(), 4);
    }

    #[test]
    fn backorder_beyond_unallocated_is_rejected_before_placing() {
        let engine = engine();
        let order = engine.place_order(order_of(&[3])).unwrap();

        let err = engine
            .create_backorder(
                order.id_typed(),
                Some(vec![BackorderLine {
                    line_no: 1,
                    quantity: 4,
                }]),
            )
            .unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
        assert!(engine.sales_order(order.id_typed()).unwrap().backorders().is_empty());
    }

    #[test]
    fn pending_order_can_be_cancelled_once() {
        let engine = engine();
        let order = engine.place_order(order_of(&[2])).unwrap();

        let cancelled = engine.cancel_order(order.id_typed(), Some("customer request".to_string())).unwrap();
        assert_eq!(cancelled.status(), SalesOrderStatus::Cancelled);

        let err = engine.cancel_order(order.id_typed(), None).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidState(_)));
    }
}
