use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError, ProductId, WarehouseId};
use stockflow_events::Event;
use stockflow_inventory::InventoryId;

/// Sales order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SalesOrderId(pub AggregateId);

impl SalesOrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for SalesOrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Sales order status lifecycle.
///
/// `pending → partially_allocated | allocated → partially_shipped → shipped → returned`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SalesOrderStatus {
    Pending,
    PartiallyAllocated,
    Allocated,
    PartiallyShipped,
    Shipped,
    Returned,
    Cancelled,
}

/// Condition reported for returned goods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnCondition {
    New,
    Good,
    Damaged,
    Defective,
}

impl ReturnCondition {
    pub fn is_resellable(&self) -> bool {
        matches!(self, ReturnCondition::New | ReturnCondition::Good)
    }
}

/// Stock reserved for an order item on one inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAllocation {
    pub inventory_id: InventoryId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    pub quantity: i64,
    pub shipped: i64,
    pub returned: i64,
}

/// Order item with its fulfillment counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderItem {
    pub line_no: u32,
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Decimal,
    pub quantity_allocated: i64,
    pub quantity_shipped: i64,
    pub quantity_returned: i64,
    /// Quantity handed to a linked backorder; no longer owed by this order.
    pub quantity_backordered: i64,
    pub allocations: Vec<ItemAllocation>,
}

impl OrderItem {
    pub fn remaining_to_allocate(&self) -> i64 {
        self.quantity - self.quantity_allocated - self.quantity_backordered
    }

    pub fn remaining_to_ship(&self) -> i64 {
        self.quantity - self.quantity_shipped - self.quantity_backordered
    }

    /// Allocated but not yet shipped.
    pub fn reserved_unshipped(&self) -> i64 {
        self.quantity_allocated - self.quantity_shipped
    }

    pub fn returnable(&self) -> i64 {
        self.quantity_shipped - self.quantity_returned
    }

    pub fn line_total(&self) -> Decimal {
        self.unit_price * Decimal::from(self.quantity)
    }
}

/// Aggregate root: SalesOrder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SalesOrder {
    id: SalesOrderId,
    customer_id: Option<CustomerId>,
    warehouse_id: Option<WarehouseId>,
    status: SalesOrderStatus,
    items: Vec<OrderItem>,
    backorder_of: Option<SalesOrderId>,
    backorders: Vec<SalesOrderId>,
    placed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl SalesOrder {
    /// Create an empty, not-yet-placed aggregate instance for rehydration.
    pub fn empty(id: SalesOrderId) -> Self {
        Self {
            id,
            customer_id: None,
            warehouse_id: None,
            status: SalesOrderStatus::Pending,
            items: Vec::new(),
            backorder_of: None,
            backorders: Vec::new(),
            placed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> SalesOrderId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn status(&self) -> SalesOrderStatus {
        self.status
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn item(&self, line_no: u32) -> Option<&OrderItem> {
        self.items.iter().find(|i| i.line_no == line_no)
    }

    pub fn backorder_of(&self) -> Option<SalesOrderId> {
        self.backorder_of
    }

    pub fn backorders(&self) -> &[SalesOrderId] {
        &self.backorders
    }

    pub fn placed_at(&self) -> Option<DateTime<Utc>> {
        self.placed_at
    }

    pub fn total_value(&self) -> Decimal {
        self.items.iter().map(OrderItem::line_total).sum()
    }

    /// Items with unallocated quantity, as (item, shortfall).
    pub fn unallocated_items(&self) -> impl Iterator<Item = (&OrderItem, i64)> {
        self.items
            .iter()
            .map(|i| (i, i.remaining_to_allocate()))
            .filter(|(_, short)| *short > 0)
    }

    pub fn is_fully_allocated(&self) -> bool {
        self.items.iter().all(|i| i.remaining_to_allocate() == 0)
    }

    pub fn is_fully_shipped(&self) -> bool {
        self.items.iter().all(|i| i.remaining_to_ship() == 0)
    }

    fn accepts_shipments(&self) -> bool {
        matches!(
            self.status,
            SalesOrderStatus::PartiallyAllocated
                | SalesOrderStatus::Allocated
                | SalesOrderStatus::PartiallyShipped
        )
    }

    fn derive_status(&self) -> SalesOrderStatus {
        let any_shipped = self.items.iter().any(|i| i.quantity_shipped > 0);
        let any_allocated = self.items.iter().any(|i| i.quantity_allocated > 0);

        if any_shipped && self.is_fully_shipped() {
            SalesOrderStatus::Shipped
        } else if any_shipped {
            SalesOrderStatus::PartiallyShipped
        } else if any_allocated && self.is_fully_allocated() {
            SalesOrderStatus::Allocated
        } else if any_allocated {
            SalesOrderStatus::PartiallyAllocated
        } else {
            SalesOrderStatus::Pending
        }
    }
}

impl AggregateRoot for SalesOrder {
    type Id = SalesOrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Requested item of a new order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrderItem {
    pub product_id: ProductId,
    pub quantity: i64,
    pub unit_price: Decimal,
}

/// Command: PlaceOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: SalesOrderId,
    pub customer_id: Option<CustomerId>,
    pub warehouse_id: WarehouseId,
    pub items: Vec<NewOrderItem>,
    /// Set when this order is the backorder of another one.
    pub backorder_of: Option<SalesOrderId>,
    pub occurred_at: DateTime<Utc>,
}

/// Reservation made for one line on one inventory record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAllocation {
    pub line_no: u32,
    pub inventory_id: InventoryId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    pub quantity: i64,
}

/// Command: RecordAllocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAllocation {
    pub order_id: SalesOrderId,
    pub allocations: Vec<LineAllocation>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentLine {
    pub line_no: u32,
    pub quantity: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentMeta {
    pub carrier: Option<String>,
    pub tracking_number: Option<String>,
}

/// Command: RecordShipment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordShipment {
    pub order_id: SalesOrderId,
    pub shipment_id: String,
    pub lines: Vec<ShipmentLine>,
    pub meta: ShipmentMeta,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnLine {
    pub line_no: u32,
    pub quantity: i64,
}

/// Command: RecordReturn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReturn {
    pub order_id: SalesOrderId,
    pub return_id: String,
    pub lines: Vec<ReturnLine>,
    pub condition: ReturnCondition,
    pub restockable: bool,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: LinkBackorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkBackorder {
    pub order_id: SalesOrderId,
    pub backorder_id: SalesOrderId,
    /// Unallocated quantity moved to the backorder, per line.
    pub lines: Vec<BackorderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Quantity of one order line carried by a backorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackorderLine {
    pub line_no: u32,
    pub quantity: i64,
}

/// Command: ReleaseAllocations (give back every unshipped reservation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseAllocations {
    pub order_id: SalesOrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: SalesOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderCommand {
    PlaceOrder(PlaceOrder),
    RecordAllocation(RecordAllocation),
    RecordShipment(RecordShipment),
    RecordReturn(RecordReturn),
    LinkBackorder(LinkBackorder),
    ReleaseAllocations(ReleaseAllocations),
    CancelOrder(CancelOrder),
}

/// Event: OrderPlaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: SalesOrderId,
    pub customer_id: Option<CustomerId>,
    pub warehouse_id: WarehouseId,
    pub items: Vec<NewOrderItem>,
    pub backorder_of: Option<SalesOrderId>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: AllocationRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecorded {
    pub order_id: SalesOrderId,
    pub allocations: Vec<LineAllocation>,
    pub occurred_at: DateTime<Utc>,
}

/// Shipped quantity drawn from one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShippedPortion {
    pub line_no: u32,
    pub product_id: ProductId,
    pub inventory_id: InventoryId,
    pub quantity: i64,
}

/// Event: ShipmentRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecorded {
    pub order_id: SalesOrderId,
    pub shipment_id: String,
    pub meta: ShipmentMeta,
    pub portions: Vec<ShippedPortion>,
    pub occurred_at: DateTime<Utc>,
}

/// Returned quantity credited back to one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnedPortion {
    pub line_no: u32,
    pub product_id: ProductId,
    pub inventory_id: InventoryId,
    pub quantity: i64,
    pub restocked: bool,
}

/// Event: ReturnRecorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRecorded {
    pub order_id: SalesOrderId,
    pub return_id: String,
    pub condition: ReturnCondition,
    pub reason: Option<String>,
    pub portions: Vec<ReturnedPortion>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: BackorderLinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackorderLinked {
    pub order_id: SalesOrderId,
    pub backorder_id: SalesOrderId,
    pub lines: Vec<BackorderLine>,
    pub occurred_at: DateTime<Utc>,
}

/// Reservation handed back for one allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedPortion {
    pub line_no: u32,
    pub inventory_id: InventoryId,
    pub quantity: i64,
}

/// Event: AllocationsReleased.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationsReleased {
    pub order_id: SalesOrderId,
    pub portions: Vec<ReleasedPortion>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: SalesOrderId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SalesOrderEvent {
    OrderPlaced(OrderPlaced),
    AllocationRecorded(AllocationRecorded),
    ShipmentRecorded(ShipmentRecorded),
    ReturnRecorded(ReturnRecorded),
    BackorderLinked(BackorderLinked),
    AllocationsReleased(AllocationsReleased),
    OrderCancelled(OrderCancelled),
}

impl Event for SalesOrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SalesOrderEvent::OrderPlaced(_) => "sales.order.placed",
            SalesOrderEvent::AllocationRecorded(_) => "sales.order.allocation_recorded",
            SalesOrderEvent::ShipmentRecorded(_) => "sales.order.shipment_recorded",
            SalesOrderEvent::ReturnRecorded(_) => "sales.order.return_recorded",
            SalesOrderEvent::BackorderLinked(_) => "sales.order.backorder_linked",
            SalesOrderEvent::AllocationsReleased(_) => "sales.order.allocations_released",
            SalesOrderEvent::OrderCancelled(_) => "sales.order.cancelled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SalesOrderEvent::OrderPlaced(e) => e.occurred_at,
            SalesOrderEvent::AllocationRecorded(e) => e.occurred_at,
            SalesOrderEvent::ShipmentRecorded(e) => e.occurred_at,
            SalesOrderEvent::ReturnRecorded(e) => e.occurred_at,
            SalesOrderEvent::BackorderLinked(e) => e.occurred_at,
            SalesOrderEvent::AllocationsReleased(e) => e.occurred_at,
            SalesOrderEvent::OrderCancelled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for SalesOrder {
    type Command = SalesOrderCommand;
    type Event = SalesOrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            SalesOrderEvent::OrderPlaced(e) => {
                self.id = e.order_id;
                self.customer_id = e.customer_id;
                self.warehouse_id = Some(e.warehouse_id);
                self.backorder_of = e.backorder_of;
                self.placed_at = Some(e.occurred_at);
                self.items = e
                    .items
                    .iter()
                    .enumerate()
                    .map(|(idx, item)| OrderItem {
                        line_no: idx as u32 + 1,
                        product_id: item.product_id,
                        quantity: item.quantity,
                        unit_price: item.unit_price,
                        quantity_allocated: 0,
                        quantity_shipped: 0,
                        quantity_returned: 0,
                        quantity_backordered: 0,
                        allocations: Vec::new(),
                    })
                    .collect();
                self.status = SalesOrderStatus::Pending;
                self.created = true;
            }
            SalesOrderEvent::AllocationRecorded(e) => {
                for a in &e.allocations {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == a.line_no) {
                        item.quantity_allocated += a.quantity;
                        item.allocations.push(ItemAllocation {
                            inventory_id: a.inventory_id,
                            warehouse_id: a.warehouse_id,
                            location: a.location.clone(),
                            quantity: a.quantity,
                            shipped: 0,
                            returned: 0,
                        });
                    }
                }
                self.status = self.derive_status();
            }
            SalesOrderEvent::ShipmentRecorded(e) => {
                for p in &e.portions {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == p.line_no) {
                        item.quantity_shipped += p.quantity;
                        if let Some(a) = item
                            .allocations
                            .iter_mut()
                            .find(|a| a.inventory_id == p.inventory_id && a.quantity > a.shipped)
                        {
                            a.shipped += p.quantity;
                        }
                    }
                }
                self.status = self.derive_status();
            }
            SalesOrderEvent::ReturnRecorded(e) => {
                for p in &e.portions {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == p.line_no) {
                        item.quantity_returned += p.quantity;
                        if let Some(a) = item
                            .allocations
                            .iter_mut()
                            .find(|a| a.inventory_id == p.inventory_id && a.shipped > a.returned)
                        {
                            a.returned += p.quantity;
                        }
                    }
                }
                let all_returned = self.items.iter().all(|i| i.quantity_returned == i.quantity_shipped);
                if self.status == SalesOrderStatus::Shipped && all_returned {
                    self.status = SalesOrderStatus::Returned;
                }
            }
            SalesOrderEvent::BackorderLinked(e) => {
                self.backorders.push(e.backorder_id);
                for line in &e.lines {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == line.line_no) {
                        item.quantity_backordered += line.quantity;
                    }
                }
                self.status = self.derive_status();
            }
            SalesOrderEvent::AllocationsReleased(e) => {
                for p in &e.portions {
                    if let Some(item) = self.items.iter_mut().find(|i| i.line_no == p.line_no) {
                        item.quantity_allocated -= p.quantity;
                        if let Some(a) = item
                            .allocations
                            .iter_mut()
                            .find(|a| a.inventory_id == p.inventory_id && a.quantity > a.shipped)
                        {
                            a.quantity -= p.quantity;
                        }
                        item.allocations.retain(|a| a.quantity > 0);
                    }
                }
                self.status = self.derive_status();
            }
            SalesOrderEvent::OrderCancelled(_) => {
                self.status = SalesOrderStatus::Cancelled;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            SalesOrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            SalesOrderCommand::RecordAllocation(cmd) => self.handle_allocation(cmd),
            SalesOrderCommand::RecordShipment(cmd) => self.handle_shipment(cmd),
            SalesOrderCommand::RecordReturn(cmd) => self.handle_return(cmd),
            SalesOrderCommand::LinkBackorder(cmd) => self.handle_link_backorder(cmd),
            SalesOrderCommand::ReleaseAllocations(cmd) => self.handle_release(cmd),
            SalesOrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl SalesOrder {
    fn ensure_order_id(&self, order_id: SalesOrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self, order_id: SalesOrderId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("sales order {order_id}")));
        }
        self.ensure_order_id(order_id)
    }

    fn item_or_validation(&self, line_no: u32) -> Result<&OrderItem, DomainError> {
        self.item(line_no)
            .ok_or_else(|| DomainError::validation(format!("order has no line {line_no}")))
    }

    /// Sum requested quantities per line, rejecting non-positive ones.
    fn totals_per_line(
        lines: impl IntoIterator<Item = (u32, i64)>,
    ) -> Result<Vec<(u32, i64)>, DomainError> {
        let mut totals: Vec<(u32, i64)> = Vec::new();
        for (line_no, quantity) in lines {
            if quantity <= 0 {
                return Err(DomainError::validation(format!(
                    "line {line_no}: quantity must be positive"
                )));
            }
            match totals.iter_mut().find(|(l, _)| *l == line_no) {
                Some((_, q)) => *q += quantity,
                None => totals.push((line_no, quantity)),
            }
        }
        if totals.is_empty() {
            return Err(DomainError::validation("at least one line is required"));
        }
        Ok(totals)
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("sales order already exists"));
        }
        self.ensure_order_id(cmd.order_id)?;

        if cmd.items.is_empty() {
            return Err(DomainError::validation("order must have at least one item"));
        }
        for item in &cmd.items {
            if item.quantity <= 0 {
                return Err(DomainError::validation("quantity must be positive"));
            }
            if item.unit_price.is_sign_negative() {
                return Err(DomainError::validation("unit_price cannot be negative"));
            }
        }
        if cmd.backorder_of == Some(cmd.order_id) {
            return Err(DomainError::validation("an order cannot be its own backorder"));
        }

        Ok(vec![SalesOrderEvent::OrderPlaced(OrderPlaced {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id,
            warehouse_id: cmd.warehouse_id,
            items: cmd.items.clone(),
            backorder_of: cmd.backorder_of,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_allocation(&self, cmd: &RecordAllocation) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if self.status != SalesOrderStatus::Pending {
            return Err(DomainError::invalid_state(format!(
                "only pending orders can be allocated (status: {:?})",
                self.status
            )));
        }
        // A pending order can owe nothing when backorders took every unit.
        if self.is_fully_allocated() {
            return Err(DomainError::invalid_state("order has nothing left to allocate"));
        }

        let allocations: Vec<LineAllocation> =
            cmd.allocations.iter().filter(|a| a.quantity != 0).cloned().collect();
        if allocations.is_empty() {
            return Ok(Vec::new());
        }

        let totals = Self::totals_per_line(allocations.iter().map(|a| (a.line_no, a.quantity)))?;
        for (line_no, total) in totals {
            let item = self.item_or_validation(line_no)?;
            if total > item.remaining_to_allocate() {
                return Err(DomainError::validation(format!(
                    "line {line_no}: allocating {total} exceeds remaining {}",
                    item.remaining_to_allocate()
                )));
            }
        }

        Ok(vec![SalesOrderEvent::AllocationRecorded(AllocationRecorded {
            order_id: cmd.order_id,
            allocations,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_shipment(&self, cmd: &RecordShipment) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if cmd.shipment_id.trim().is_empty() {
            return Err(DomainError::validation("shipment_id cannot be empty"));
        }

        let totals = Self::totals_per_line(cmd.lines.iter().map(|l| (l.line_no, l.quantity)))?;

        // Quantity checks come first so an over-shipment is always a validation error.
        for (line_no, total) in &totals {
            let item = self.item_or_validation(*line_no)?;
            if *total > item.remaining_to_ship() {
                return Err(DomainError::validation(format!(
                    "line {line_no}: shipping {total} exceeds remaining ordered quantity {}",
                    item.remaining_to_ship()
                )));
            }
        }

        if !self.accepts_shipments() {
            return Err(DomainError::invalid_state(format!(
                "order cannot ship in status {:?}",
                self.status
            )));
        }

        let mut portions = Vec::new();
        for (line_no, total) in totals {
            let item = self.item_or_validation(line_no)?;
            if total > item.reserved_unshipped() {
                return Err(DomainError::insufficient_stock(format!(
                    "line {line_no}: shipping {total} but only {} allocated",
                    item.reserved_unshipped()
                )));
            }

            // Draw from allocations in the order they were made.
            let mut left = total;
            for a in &item.allocations {
                if left == 0 {
                    break;
                }
                let take = (a.quantity - a.shipped).min(left);
                if take > 0 {
                    portions.push(ShippedPortion {
                        line_no,
                        product_id: item.product_id,
                        inventory_id: a.inventory_id,
                        quantity: take,
                    });
                    left -= take;
                }
            }
        }

        Ok(vec![SalesOrderEvent::ShipmentRecorded(ShipmentRecorded {
            order_id: cmd.order_id,
            shipment_id: cmd.shipment_id.clone(),
            meta: cmd.meta.clone(),
            portions,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_return(&self, cmd: &RecordReturn) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        let totals = Self::totals_per_line(cmd.lines.iter().map(|l| (l.line_no, l.quantity)))?;
        let restocked = cmd.restockable && cmd.condition.is_resellable();

        let mut portions = Vec::new();
        for (line_no, total) in totals {
            let item = self.item_or_validation(line_no)?;
            if total > item.returnable() {
                return Err(DomainError::validation(format!(
                    "line {line_no}: returning {total} exceeds shipped quantity {}",
                    item.returnable()
                )));
            }

            let mut left = total;
            for a in &item.allocations {
                if left == 0 {
                    break;
                }
                let take = (a.shipped - a.returned).min(left);
                if take > 0 {
                    portions.push(ReturnedPortion {
                        line_no,
                        product_id: item.product_id,
                        inventory_id: a.inventory_id,
                        quantity: take,
                        restocked,
                    });
                    left -= take;
                }
            }
        }

        Ok(vec![SalesOrderEvent::ReturnRecorded(ReturnRecorded {
            order_id: cmd.order_id,
            return_id: cmd.return_id.clone(),
            condition: cmd.condition,
            reason: cmd.reason.clone(),
            portions,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_link_backorder(&self, cmd: &LinkBackorder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if cmd.backorder_id == cmd.order_id {
            return Err(DomainError::validation("an order cannot be its own backorder"));
        }
        if self.backorders.contains(&cmd.backorder_id) {
            return Ok(Vec::new());
        }
        if matches!(self.status, SalesOrderStatus::Cancelled | SalesOrderStatus::Returned) {
            return Err(DomainError::invalid_state(format!(
                "cannot backorder a {:?} order",
                self.status
            )));
        }

        let mut lines = Vec::with_capacity(cmd.lines.len());
        for line in &cmd.lines {
            if line.quantity <= 0 {
                return Err(DomainError::validation("backorder quantity must be positive"));
            }
            let item = self
                .items
                .iter()
                .find(|i| i.line_no == line.line_no)
                .ok_or_else(|| DomainError::validation(format!("unknown order line {}", line.line_no)))?;
            let already: i64 = lines
                .iter()
                .filter(|l: &&BackorderLine| l.line_no == line.line_no)
                .map(|l| l.quantity)
                .sum();
            if already + line.quantity > item.remaining_to_allocate() {
                return Err(DomainError::validation(format!(
                    "line {} has only {} unallocated",
                    line.line_no,
                    item.remaining_to_allocate()
                )));
            }
            lines.push(*line);
        }

        Ok(vec![SalesOrderEvent::BackorderLinked(BackorderLinked {
            order_id: cmd.order_id,
            backorder_id: cmd.backorder_id,
            lines,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_release(&self, cmd: &ReleaseAllocations) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if matches!(
            self.status,
            SalesOrderStatus::Shipped | SalesOrderStatus::Returned | SalesOrderStatus::Cancelled
        ) {
            return Err(DomainError::invalid_state(format!(
                "order has nothing to release in status {:?}",
                self.status
            )));
        }

        let portions: Vec<ReleasedPortion> = self
            .items
            .iter()
            .flat_map(|item| {
                item.allocations
                    .iter()
                    .filter(|a| a.quantity > a.shipped)
                    .map(move |a| ReleasedPortion {
                        line_no: item.line_no,
                        inventory_id: a.inventory_id,
                        quantity: a.quantity - a.shipped,
                    })
            })
            .collect();

        if portions.is_empty() {
            return Ok(Vec::new());
        }

        Ok(vec![SalesOrderEvent::AllocationsReleased(AllocationsReleased {
            order_id: cmd.order_id,
            portions,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<SalesOrderEvent>, DomainError> {
        self.ensure_created(cmd.order_id)?;

        if self.status != SalesOrderStatus::Pending {
            return Err(DomainError::invalid_state(
                "only pending orders without allocations can be cancelled",
            ));
        }

        Ok(vec![SalesOrderEvent::OrderCancelled(OrderCancelled {
            order_id: cmd.order_id,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use stockflow_events::execute;

    use super::*;

    fn test_order_id() -> SalesOrderId {
        SalesOrderId::new(AggregateId::new())
    }

    fn test_inventory_id() -> InventoryId {
        InventoryId::new(AggregateId::new())
    }

    fn test_time() -> DateTime<Utc> {
        Utc::now()
    }

    fn placed_order(quantities: &[i64]) -> SalesOrder {
        let order_id = test_order_id();
        let mut order = SalesOrder::empty(order_id);
        let cmd = PlaceOrder {
            order_id,
            customer_id: Some(CustomerId::new()),
            warehouse_id: WarehouseId::new(),
            items: quantities
                .iter()
                .map(|q| NewOrderItem {
                    product_id: ProductId::new(),
                    quantity: *q,
                    unit_price: dec!(12.50),
                })
                .collect(),
            backorder_of: None,
            occurred_at: test_time(),
        };
        execute(&mut order, &SalesOrderCommand::PlaceOrder(cmd)).unwrap();
        order
    }

    fn allocate(order: &mut SalesOrder, line_no: u32, inventory_id: InventoryId, quantity: i64) {
        let cmd = RecordAllocation {
            order_id: order.id_typed(),
            allocations: vec![LineAllocation {
                line_no,
                inventory_id,
                warehouse_id: WarehouseId::new(),
                location: None,
                quantity,
            }],
            occurred_at: test_time(),
        };
        execute(order, &SalesOrderCommand::RecordAllocation(cmd)).unwrap();
    }

    fn ship(order: &SalesOrder, line_no: u32, quantity: i64) -> Result<Vec<SalesOrderEvent>, DomainError> {
        order.handle(&SalesOrderCommand::RecordShipment(RecordShipment {
            order_id: order.id_typed(),
            shipment_id: "SHP-1".to_string(),
            lines: vec![ShipmentLine { line_no, quantity }],
            meta: ShipmentMeta::default(),
            occurred_at: test_time(),
        }))
    }

    #[test]
    fn place_order_numbers_lines_from_one() {
        let order = placed_order(&[3, 4]);
        assert_eq!(order.status(), SalesOrderStatus::Pending);
        assert_eq!(order.items()[0].line_no, 1);
        assert_eq!(order.items()[1].line_no, 2);
        assert_eq!(order.total_value(), dec!(87.50));
    }

    #[test]
    fn place_order_rejects_empty_items() {
        let order_id = test_order_id();
        let order = SalesOrder::empty(order_id);
        let err = order
            .handle(&SalesOrderCommand::PlaceOrder(PlaceOrder {
                order_id,
                customer_id: None,
                warehouse_id: WarehouseId::new(),
                items: vec![],
                backorder_of: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn partial_allocation_moves_to_partially_allocated() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 5);

        assert_eq!(order.status(), SalesOrderStatus::PartiallyAllocated);
        let shortfalls: Vec<i64> = order.unallocated_items().map(|(_, s)| s).collect();
        assert_eq!(shortfalls, vec![5]);
    }

    #[test]
    fn allocated_order_cannot_be_allocated_again() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 10);
        assert_eq!(order.status(), SalesOrderStatus::Allocated);

        let err = order
            .handle(&SalesOrderCommand::RecordAllocation(RecordAllocation {
                order_id: order.id_typed(),
                allocations: vec![],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        match err {
            DomainError::InvalidState(msg) if msg.contains("only pending orders") => {}
            other => panic!("expected InvalidState, got {other:?}"),
        }
    }

    #[test]
    fn over_shipment_is_validation_error() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 10);

        let err = ship(&order, 1, 11).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn shipping_unallocated_units_is_insufficient_stock() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 4);

        let err = ship(&order, 1, 6).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
    }

    #[test]
    fn shipment_draws_from_allocations_in_order() {
        let mut order = placed_order(&[10]);
        let first = test_inventory_id();
        let second = test_inventory_id();
        let cmd = RecordAllocation {
            order_id: order.id_typed(),
            allocations: vec![
                LineAllocation {
                    line_no: 1,
                    inventory_id: first,
                    warehouse_id: WarehouseId::new(),
                    location: None,
                    quantity: 6,
                },
                LineAllocation {
                    line_no: 1,
                    inventory_id: second,
                    warehouse_id: WarehouseId::new(),
                    location: None,
                    quantity: 4,
                },
            ],
            occurred_at: test_time(),
        };
        execute(&mut order, &SalesOrderCommand::RecordAllocation(cmd)).unwrap();

        let events = ship(&order, 1, 8).unwrap();
        match &events[0] {
            SalesOrderEvent::ShipmentRecorded(e) => {
                let split: Vec<(InventoryId, i64)> =
                    e.portions.iter().map(|p| (p.inventory_id, p.quantity)).collect();
                assert_eq!(split, vec![(first, 6), (second, 2)]);
            }
            _ => panic!("Expected ShipmentRecorded event"),
        }

        order.apply(&events[0]);
        assert_eq!(order.status(), SalesOrderStatus::PartiallyShipped);
        let events = ship(&order, 1, 2).unwrap();
        order.apply(&events[0]);
        assert_eq!(order.status(), SalesOrderStatus::Shipped);
    }

    #[test]
    fn return_beyond_shipped_is_rejected() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 10);
        let events = ship(&order, 1, 3).unwrap();
        order.apply(&events[0]);

        let err = order
            .handle(&SalesOrderCommand::RecordReturn(RecordReturn {
                order_id: order.id_typed(),
                return_id: "RMA-1".to_string(),
                lines: vec![ReturnLine { line_no: 1, quantity: 4 }],
                condition: ReturnCondition::Good,
                restockable: true,
                reason: None,
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn damaged_returns_are_not_restocked() {
        let mut order = placed_order(&[2]);
        allocate(&mut order, 1, test_inventory_id(), 2);
        let events = ship(&order, 1, 2).unwrap();
        order.apply(&events[0]);

        let cmd = SalesOrderCommand::RecordReturn(RecordReturn {
            order_id: order.id_typed(),
            return_id: "RMA-2".to_string(),
            lines: vec![ReturnLine { line_no: 1, quantity: 2 }],
            condition: ReturnCondition::Damaged,
            restockable: true,
            reason: Some("crushed box".to_string()),
            occurred_at: test_time(),
        });
        let events = execute(&mut order, &cmd).unwrap();

        match &events[0] {
            SalesOrderEvent::ReturnRecorded(e) => assert!(e.portions.iter().all(|p| !p.restocked)),
            _ => panic!("Expected ReturnRecorded event"),
        }
        assert_eq!(order.status(), SalesOrderStatus::Returned);
    }

    #[test]
    fn release_returns_order_to_pending() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 7);

        let cmd = SalesOrderCommand::ReleaseAllocations(ReleaseAllocations {
            order_id: order.id_typed(),
            occurred_at: test_time(),
        });
        let events = execute(&mut order, &cmd).unwrap();

        match &events[0] {
            SalesOrderEvent::AllocationsReleased(e) => assert_eq!(e.portions[0].quantity, 7),
            _ => panic!("Expected AllocationsReleased event"),
        }
        assert_eq!(order.status(), SalesOrderStatus::Pending);
        assert!(order.items()[0].allocations.is_empty());

        let cmd = SalesOrderCommand::CancelOrder(CancelOrder {
            order_id: order.id_typed(),
            reason: None,
            occurred_at: test_time(),
        });
        execute(&mut order, &cmd).unwrap();
        assert_eq!(order.status(), SalesOrderStatus::Cancelled);
    }

    #[test]
    fn linking_a_backorder_twice_is_a_no_op() {
        let mut order = placed_order(&[10]);
        let backorder_id = test_order_id();
        let cmd = SalesOrderCommand::LinkBackorder(LinkBackorder {
            order_id: order.id_typed(),
            backorder_id,
            lines: vec![BackorderLine { line_no: 1, quantity: 4 }],
            occurred_at: test_time(),
        });
        execute(&mut order, &cmd).unwrap();
        assert!(order.handle(&cmd).unwrap().is_empty());
        assert_eq!(order.backorders(), &[backorder_id]);
        assert_eq!(order.items()[0].quantity_backordered, 4);
        assert_eq!(order.items()[0].remaining_to_allocate(), 6);
    }

    #[test]
    fn backordered_remainder_lets_the_original_order_complete() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 5);
        assert_eq!(order.status(), SalesOrderStatus::PartiallyAllocated);

        let cmd = SalesOrderCommand::LinkBackorder(LinkBackorder {
            order_id: order.id_typed(),
            backorder_id: test_order_id(),
            lines: vec![BackorderLine { line_no: 1, quantity: 5 }],
            occurred_at: test_time(),
        });
        execute(&mut order, &cmd).unwrap();
        assert_eq!(order.status(), SalesOrderStatus::Allocated);

        for event in ship(&order, 1, 5).unwrap() {
            order.apply(&event);
        }
        assert_eq!(order.status(), SalesOrderStatus::Shipped);
    }

    #[test]
    fn fully_backordered_order_cannot_be_allocated() {
        let mut order = placed_order(&[10]);
        let cmd = SalesOrderCommand::LinkBackorder(LinkBackorder {
            order_id: order.id_typed(),
            backorder_id: test_order_id(),
            lines: vec![BackorderLine { line_no: 1, quantity: 10 }],
            occurred_at: test_time(),
        });
        execute(&mut order, &cmd).unwrap();
        assert_eq!(order.status(), SalesOrderStatus::Pending);

        let err = order
            .handle(&SalesOrderCommand::RecordAllocation(RecordAllocation {
                order_id: order.id_typed(),
                allocations: vec![LineAllocation {
                    line_no: 1,
                    inventory_id: test_inventory_id(),
                    warehouse_id: WarehouseId::new(),
                    location: None,
                    quantity: 1,
                }],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidState(_)));
    }

    #[test]
    fn backorder_cannot_exceed_unallocated_quantity() {
        let mut order = placed_order(&[10]);
        allocate(&mut order, 1, test_inventory_id(), 8);

        let err = order
            .handle(&SalesOrderCommand::LinkBackorder(LinkBackorder {
                order_id: order.id_typed(),
                backorder_id: test_order_id(),
                lines: vec![BackorderLine { line_no: 1, quantity: 3 }],
                occurred_at: test_time(),
            }))
            .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }
}
