//! Inventory ledger domain (event-sourced).
//!
//! One `InventoryRecord` stream per (product, warehouse, location). Every quantity
//! change is a `MovementRecorded` event, so the stream doubles as the movement log.
//! Pure domain logic: no IO, no storage.

pub mod movement;
pub mod record;

pub use movement::{
    Movement, MovementReference, MovementType, StockLevels, replay, unwound_average_cost, weighted_average_cost,
};
pub use record::{
    InboundScheduled, InventoryCommand, InventoryEvent, InventoryId, InventoryRecord,
    MovementRecorded, RecordMovement, RecordOpened, ReorderThresholds, ReverseMovement, ScheduleInbound,
    ThresholdsUpdated, UpsertRecord,
};
