//! Allocation engine: reserve ledger stock against an order's lines.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use stockflow_core::{ProductId, WarehouseId};
use stockflow_events::DomainSignal;
use stockflow_inventory::{InventoryRecord, MovementRecorded, MovementReference};
use stockflow_sales::{
    BackorderLine, LineAllocation, RecordAllocation, SalesOrderCommand, SalesOrderId, SalesOrderStatus,
};

use super::{Engine, SALES_ORDER_AGGREGATE, sales_order};
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocateOptions {
    /// Keep what could be reserved when stock runs short.
    pub allow_partial: bool,
    /// Put the shortfall on a linked backorder.
    pub create_backorder: bool,
}

impl Default for AllocateOptions {
    fn default() -> Self {
        Self {
            allow_partial: true,
            create_backorder: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLine {
    pub line_no: u32,
    pub product_id: ProductId,
    pub requested: i64,
    pub allocated: i64,
    pub shortfall: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub order_id: SalesOrderId,
    pub lines: Vec<AllocationLine>,
    /// True only if every line was fully reserved.
    pub allocation_complete: bool,
    pub backorder_id: Option<SalesOrderId>,
}

impl AllocationResult {
    pub fn allocated(&self) -> i64 {
        self.lines.iter().map(|l| l.allocated).sum()
    }

    pub fn shortfall(&self) -> i64 {
        self.lines.iter().map(|l| l.shortfall).sum()
    }
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Reserve stock for every line of a pending order.
    ///
    /// Records are tried in a fixed order: the order's warehouse, then the
    /// configured warehouse priority, then by record id.
    pub fn allocate(&self, order_id: SalesOrderId, options: AllocateOptions) -> Result<AllocationResult, DispatchError> {
        let order = self.sales_order(order_id)?;
        if order.status() != SalesOrderStatus::Pending {
            return Err(DispatchError::InvalidState(format!(
                "order {order_id} is {:?}; only pending orders can be allocated",
                order.status()
            )));
        }

        let reference = MovementReference::new("sales_order", order_id);
        let mut reserved: Vec<MovementRecorded> = Vec::new();
        let mut allocations: Vec<LineAllocation> = Vec::new();
        let mut lines = Vec::new();

        for item in order.items() {
            let requested = item.remaining_to_allocate();
            if requested <= 0 {
                continue;
            }

            let mut left = requested;
            let candidates = match self.allocation_candidates(item.product_id, order.warehouse_id()) {
                Ok(c) => c,
                Err(err) => return Err(self.rolled_back(err, &reserved)),
            };

            for record in candidates {
                if left == 0 {
                    break;
                }
                let inventory_id = record.id_typed();
                let Some(warehouse_id) = record.warehouse_id() else {
                    continue;
                };
                let reservation = match self.reserve_up_to(inventory_id, left, &reference) {
                    Ok(Some(reservation)) => reservation,
                    Ok(None) => continue,
                    Err(err) => return Err(self.rolled_back(err, &reserved)),
                };
                let got = reservation.movement.quantity;
                debug!(%order_id, line_no = item.line_no, %inventory_id, got, "reserved");
                reserved.push(reservation);
                allocations.push(LineAllocation {
                    line_no: item.line_no,
                    inventory_id,
                    warehouse_id,
                    location: record.location().map(str::to_string),
                    quantity: got,
                });
                left -= got;
            }

            lines.push(AllocationLine {
                line_no: item.line_no,
                product_id: item.product_id,
                requested,
                allocated: requested - left,
                shortfall: left,
            });
        }

        if lines.is_empty() {
            return Err(DispatchError::InvalidState(format!(
                "order {order_id} has nothing left to allocate"
            )));
        }

        let shortfall: i64 = lines.iter().map(|l| l.shortfall).sum();
        if shortfall > 0 && !options.allow_partial {
            let cause = DispatchError::InsufficientStock(format!(
                "order {order_id} is short {shortfall} units and partial allocation is not allowed"
            ));
            return Err(self.rolled_back(cause, &reserved));
        }

        if !allocations.is_empty() {
            let recorded = self.dispatcher.dispatch(
                order_id.0,
                SALES_ORDER_AGGREGATE,
                SalesOrderCommand::RecordAllocation(RecordAllocation {
                    order_id,
                    allocations,
                    occurred_at: self.now(),
                }),
                sales_order,
            );
            match recorded {
                Ok(_) => {}
                Err(err @ DispatchError::Publish(_)) => return Err(err),
                Err(err) => return Err(self.rolled_back(err, &reserved)),
            }
        }

        let mut result = AllocationResult {
            order_id,
            allocation_complete: shortfall == 0,
            lines,
            backorder_id: None,
        };

        if options.create_backorder && shortfall > 0 {
            let backorder_lines = result
                .lines
                .iter()
                .filter(|l| l.shortfall > 0)
                .map(|l| BackorderLine {
                    line_no: l.line_no,
                    quantity: l.shortfall,
                })
                .collect();
            // The allocation stands on its own; a failed backorder is reported, not rolled back.
            match self.create_backorder(order_id, Some(backorder_lines)) {
                Ok(backorder) => result.backorder_id = Some(backorder.id_typed()),
                Err(err) => warn!(%order_id, error = %err, "backorder creation failed"),
            }
        }

        info!(
            %order_id,
            allocated = result.allocated(),
            shortfall,
            complete = result.allocation_complete,
            "order allocated"
        );
        self.emit(DomainSignal::OrderAllocated {
            order_id: order_id.0,
            allocated: result.allocated(),
            shortfall,
            complete: result.allocation_complete,
        });
        Ok(result)
    }

    fn allocation_candidates(
        &self,
        product_id: ProductId,
        home: Option<WarehouseId>,
    ) -> Result<Vec<InventoryRecord>, DispatchError> {
        let priority = &self.config.allocation.warehouse_priority;
        let rank = |w: Option<WarehouseId>| match w {
            Some(w) if Some(w) == home => 0,
            Some(w) => priority.iter().position(|p| *p == w).map_or(usize::MAX, |i| i + 1),
            None => usize::MAX,
        };

        let mut records: Vec<InventoryRecord> = self
            .records_for_product(product_id)?
            .into_iter()
            .filter(|r| r.quantity_available() > 0)
            .collect();
        records.sort_by_key(|r| (rank(r.warehouse_id()), r.id_typed()));
        Ok(records)
    }
}
