use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError, ProductId, UserId, WarehouseId};
use stockflow_events::Event;

use crate::movement::{
    Movement, MovementReference, MovementType, StockLevels, unwound_average_cost, weighted_average_cost,
};

const INVENTORY_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c_2a7e_4b0d_5e93_a1c8_0d2f_7b64_c915);

/// Inventory record identifier: one per (product, warehouse, location).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryId(pub AggregateId);

impl InventoryId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }

    /// Deterministic id for a stocking position, so upserts need no lookup.
    pub fn for_position(product_id: ProductId, warehouse_id: WarehouseId, location: Option<&str>) -> Self {
        let key = format!("{}|{}|{}", product_id, warehouse_id, location.unwrap_or(""));
        Self(AggregateId::derived(&INVENTORY_NAMESPACE, &key))
    }
}

impl core::fmt::Display for InventoryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Replenishment thresholds for a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderThresholds {
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub max_stock_level: Option<i64>,
}

impl ReorderThresholds {
    fn validate(&self) -> Result<(), DomainError> {
        if self.reorder_point < 0 || self.reorder_quantity < 0 {
            return Err(DomainError::validation("reorder thresholds cannot be negative"));
        }
        if let Some(max) = self.max_stock_level {
            if max <= 0 {
                return Err(DomainError::validation("max stock level must be positive"));
            }
        }
        Ok(())
    }
}

/// Aggregate root: InventoryRecord (stock of one product at one warehouse/location).
///
/// Quantities only change through `MovementRecorded`; the stream of those
/// events is the movement log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InventoryRecord {
    id: InventoryId,
    product_id: Option<ProductId>,
    warehouse_id: Option<WarehouseId>,
    location: Option<String>,
    levels: StockLevels,
    thresholds: ReorderThresholds,
    average_cost: Decimal,
    last_movement_at: Option<DateTime<Utc>>,
    /// Latest movement not cancelled by an exact reversal.
    last_movement_id: Option<Uuid>,
    movement_count: u64,
    version: u64,
    created: bool,
}

impl InventoryRecord {
    /// Create an empty, not-yet-opened aggregate instance for rehydration.
    pub fn empty(id: InventoryId) -> Self {
        Self {
            id,
            product_id: None,
            warehouse_id: None,
            location: None,
            levels: StockLevels::default(),
            thresholds: ReorderThresholds::default(),
            average_cost: Decimal::ZERO,
            last_movement_at: None,
            last_movement_id: None,
            movement_count: 0,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> InventoryId {
        self.id
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn product_id(&self) -> Option<ProductId> {
        self.product_id
    }

    pub fn warehouse_id(&self) -> Option<WarehouseId> {
        self.warehouse_id
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn levels(&self) -> StockLevels {
        self.levels
    }

    pub fn quantity_on_hand(&self) -> i64 {
        self.levels.on_hand
    }

    pub fn quantity_available(&self) -> i64 {
        self.levels.available
    }

    pub fn quantity_reserved(&self) -> i64 {
        self.levels.reserved
    }

    pub fn quantity_in_transit(&self) -> i64 {
        self.levels.in_transit
    }

    pub fn thresholds(&self) -> ReorderThresholds {
        self.thresholds
    }

    pub fn average_cost(&self) -> Decimal {
        self.average_cost
    }

    pub fn last_movement_at(&self) -> Option<DateTime<Utc>> {
        self.last_movement_at
    }

    pub fn movement_count(&self) -> u64 {
        self.movement_count
    }

    /// Available quantity is at or below the reorder point.
    pub fn is_low_stock(&self) -> bool {
        self.created && self.levels.available <= self.thresholds.reorder_point
    }
}

impl AggregateRoot for InventoryRecord {
    type Id = InventoryId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: UpsertRecord (create the record or merge new thresholds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertRecord {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    pub thresholds: ReorderThresholds,
    pub occurred_at: DateTime<Utc>,
}

/// Command: RecordMovement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMovement {
    pub inventory_id: InventoryId,
    pub movement_id: Uuid,
    pub movement_type: MovementType,
    pub quantity: i64,
    pub unit_cost: Option<Decimal>,
    pub reference: MovementReference,
    pub performed_by: Option<UserId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReverseMovement (cancel an earlier movement of this record exactly).
///
/// The reversal is a single movement: levels, in-transit stock and average
/// cost go back to what the original changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseMovement {
    pub inventory_id: InventoryId,
    pub movement_id: Uuid,
    pub original: MovementRecorded,
    pub reference: MovementReference,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ScheduleInbound (stock ordered from a supplier, not yet received).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleInbound {
    pub inventory_id: InventoryId,
    pub quantity: i64,
    pub reference: MovementReference,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryCommand {
    UpsertRecord(UpsertRecord),
    RecordMovement(RecordMovement),
    ReverseMovement(ReverseMovement),
    ScheduleInbound(ScheduleInbound),
}

/// Event: RecordOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOpened {
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub location: Option<String>,
    pub thresholds: ReorderThresholds,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ThresholdsUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdsUpdated {
    pub inventory_id: InventoryId,
    pub thresholds: ReorderThresholds,
    pub occurred_at: DateTime<Utc>,
}

/// Event: MovementRecorded (one row of the movement log).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementRecorded {
    pub movement: Movement,
    #[serde(default)]
    pub average_cost_before: Decimal,
    pub average_cost_after: Decimal,
    /// Latest movement in effect before this one. A reversal of the latest
    /// movement carries the movement the record rewinds to.
    #[serde(default)]
    pub preceding_movement_id: Option<Uuid>,
}

/// Event: InboundScheduled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundScheduled {
    pub inventory_id: InventoryId,
    pub quantity: i64,
    pub reference: MovementReference,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryEvent {
    RecordOpened(RecordOpened),
    ThresholdsUpdated(ThresholdsUpdated),
    MovementRecorded(MovementRecorded),
    InboundScheduled(InboundScheduled),
}

impl InventoryEvent {
    pub const MOVEMENT_RECORDED: &'static str = "inventory.record.movement_recorded";

    pub fn movement(&self) -> Option<&Movement> {
        match self {
            InventoryEvent::MovementRecorded(e) => Some(&e.movement),
            _ => None,
        }
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        match self {
            InventoryEvent::RecordOpened(_) => "inventory.record.opened",
            InventoryEvent::ThresholdsUpdated(_) => "inventory.record.thresholds_updated",
            InventoryEvent::MovementRecorded(_) => Self::MOVEMENT_RECORDED,
            InventoryEvent::InboundScheduled(_) => "inventory.record.inbound_scheduled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            InventoryEvent::RecordOpened(e) => e.occurred_at,
            InventoryEvent::ThresholdsUpdated(e) => e.occurred_at,
            InventoryEvent::MovementRecorded(e) => e.movement.timestamp,
            InventoryEvent::InboundScheduled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for InventoryRecord {
    type Command = InventoryCommand;
    type Event = InventoryEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            InventoryEvent::RecordOpened(e) => {
                self.id = e.inventory_id;
                self.product_id = Some(e.product_id);
                self.warehouse_id = Some(e.warehouse_id);
                self.location = e.location.clone();
                self.thresholds = e.thresholds;
                self.created = true;
            }
            InventoryEvent::ThresholdsUpdated(e) => {
                self.thresholds = e.thresholds;
            }
            InventoryEvent::MovementRecorded(e) => {
                let m = &e.movement;
                self.levels.in_transit += m.in_transit_delta;
                self.levels.on_hand = m.quantity_after;
                self.levels.available = m.available_after;
                self.levels.reserved = m.reserved_after;
                self.average_cost = e.average_cost_after;
                self.last_movement_at = Some(m.timestamp);
                self.last_movement_id = match m.reverses {
                    Some(reversed) if self.last_movement_id == Some(reversed) => e.preceding_movement_id,
                    _ => Some(m.movement_id),
                };
                self.movement_count += 1;
            }
            InventoryEvent::InboundScheduled(e) => {
                self.levels.in_transit += e.quantity;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            InventoryCommand::UpsertRecord(cmd) => self.handle_upsert(cmd),
            InventoryCommand::RecordMovement(cmd) => self.handle_movement(cmd),
            InventoryCommand::ReverseMovement(cmd) => self.handle_reverse(cmd),
            InventoryCommand::ScheduleInbound(cmd) => self.handle_schedule_inbound(cmd),
        }
    }
}

impl InventoryRecord {
    fn ensure_inventory_id(&self, inventory_id: InventoryId) -> Result<(), DomainError> {
        if self.id != inventory_id {
            return Err(DomainError::invariant("inventory_id mismatch"));
        }
        Ok(())
    }

    fn ensure_created(&self) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found(format!("inventory record {}", self.id)));
        }
        Ok(())
    }

    fn handle_upsert(&self, cmd: &UpsertRecord) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_inventory_id(cmd.inventory_id)?;
        cmd.thresholds.validate()?;

        if !self.created {
            return Ok(vec![InventoryEvent::RecordOpened(RecordOpened {
                inventory_id: cmd.inventory_id,
                product_id: cmd.product_id,
                warehouse_id: cmd.warehouse_id,
                location: cmd.location.clone(),
                thresholds: cmd.thresholds,
                occurred_at: cmd.occurred_at,
            })]);
        }

        if self.product_id != Some(cmd.product_id) || self.warehouse_id != Some(cmd.warehouse_id) {
            return Err(DomainError::invariant("record belongs to another product or warehouse"));
        }
        if self.thresholds == cmd.thresholds {
            return Ok(Vec::new());
        }

        Ok(vec![InventoryEvent::ThresholdsUpdated(ThresholdsUpdated {
            inventory_id: cmd.inventory_id,
            thresholds: cmd.thresholds,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_movement(&self, cmd: &RecordMovement) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_inventory_id(cmd.inventory_id)?;

        if matches!(cmd.movement_type, MovementType::Unship | MovementType::InboundReversal) {
            return Err(DomainError::validation(format!(
                "{} movements only come from reversing an earlier movement",
                cmd.movement_type
            )));
        }
        if let Some(cost) = cmd.unit_cost {
            if cost.is_sign_negative() {
                return Err(DomainError::validation("unit cost cannot be negative"));
            }
        }

        let (product_id, warehouse_id) = self.position()?;
        let next = self.levels.apply(cmd.movement_type, cmd.quantity)?;

        let average_cost_after = match cmd.unit_cost {
            Some(cost) if cmd.movement_type.is_costed_inbound(cmd.quantity) => {
                weighted_average_cost(self.average_cost, self.levels.on_hand, cost, cmd.quantity)
            }
            _ => self.average_cost,
        };
        // Sales leave at the current average cost unless the caller priced them.
        let unit_cost = match cmd.movement_type {
            MovementType::Sale => cmd.unit_cost.or(Some(self.average_cost)),
            _ => cmd.unit_cost,
        };

        self.movement_recorded(
            Movement {
                movement_id: cmd.movement_id,
                inventory_id: cmd.inventory_id,
                product_id,
                warehouse_id,
                movement_type: cmd.movement_type,
                quantity: cmd.quantity,
                unit_cost,
                reference: cmd.reference.clone(),
                performed_by: cmd.performed_by,
                timestamp: cmd.occurred_at,
                quantity_after: next.on_hand,
                available_after: next.available,
                reserved_after: next.reserved,
                in_transit_delta: next.in_transit - self.levels.in_transit,
                reverses: None,
            },
            average_cost_after,
            self.last_movement_id,
        )
    }

    fn handle_reverse(&self, cmd: &ReverseMovement) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_inventory_id(cmd.inventory_id)?;

        let original = &cmd.original.movement;
        if original.inventory_id != self.id {
            return Err(DomainError::invariant(format!(
                "movement {} belongs to record {}",
                original.movement_id, original.inventory_id
            )));
        }

        let (product_id, warehouse_id) = self.position()?;
        let (movement_type, quantity) = original.movement_type.reversal(original.quantity);
        let mut next = self.levels.apply(movement_type, quantity)?;
        next.in_transit = (self.levels.in_transit - original.in_transit_delta).max(0);

        // Nothing still in effect came after the original: rewind to its prior average.
        let rewinds = self.last_movement_id == Some(original.movement_id);
        let average_cost_after = match (movement_type, original.unit_cost) {
            _ if rewinds => cmd.original.average_cost_before,
            (MovementType::InboundReversal, Some(cost)) => {
                unwound_average_cost(self.average_cost, self.levels.on_hand, cost, -quantity)
            }
            (_, Some(cost)) if movement_type.is_costed_inbound(quantity) => {
                weighted_average_cost(self.average_cost, self.levels.on_hand, cost, quantity)
            }
            _ => self.average_cost,
        };

        self.movement_recorded(
            Movement {
                movement_id: cmd.movement_id,
                inventory_id: cmd.inventory_id,
                product_id,
                warehouse_id,
                movement_type,
                quantity,
                unit_cost: original.unit_cost,
                reference: cmd.reference.clone(),
                performed_by: original.performed_by,
                timestamp: cmd.occurred_at,
                quantity_after: next.on_hand,
                available_after: next.available,
                reserved_after: next.reserved,
                in_transit_delta: next.in_transit - self.levels.in_transit,
                reverses: Some(original.movement_id),
            },
            average_cost_after,
            if rewinds {
                cmd.original.preceding_movement_id
            } else {
                self.last_movement_id
            },
        )
    }

    fn position(&self) -> Result<(ProductId, WarehouseId), DomainError> {
        match (self.product_id, self.warehouse_id) {
            (Some(p), Some(w)) => Ok((p, w)),
            _ => Err(DomainError::invariant("opened record without product or warehouse")),
        }
    }

    fn movement_recorded(
        &self,
        movement: Movement,
        average_cost_after: Decimal,
        preceding_movement_id: Option<Uuid>,
    ) -> Result<Vec<InventoryEvent>, DomainError> {
        Ok(vec![InventoryEvent::MovementRecorded(MovementRecorded {
            movement,
            average_cost_before: self.average_cost,
            average_cost_after,
            preceding_movement_id,
        })])
    }

    fn handle_schedule_inbound(&self, cmd: &ScheduleInbound) -> Result<Vec<InventoryEvent>, DomainError> {
        self.ensure_created()?;
        self.ensure_inventory_id(cmd.inventory_id)?;

        if cmd.quantity <= 0 {
            return Err(DomainError::validation("inbound quantity must be positive"));
        }

        Ok(vec![InventoryEvent::InboundScheduled(InboundScheduled {
            inventory_id: cmd.inventory_id,
            quantity: cmd.quantity,
            reference: cmd.reference.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
