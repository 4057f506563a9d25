//! Sales orders domain module (event-sourced).
//!
//! Order items accumulate allocated, shipped and returned quantities; the
//! aggregate decides how a shipment or return is split across the inventory
//! records an item was allocated from. Pure domain logic, no IO.

pub mod order;

pub use order::{
    AllocationRecorded, AllocationsReleased, BackorderLine, BackorderLinked, CancelOrder, ItemAllocation,
    LineAllocation, LinkBackorder, NewOrderItem, OrderCancelled, OrderItem, OrderPlaced,
    PlaceOrder, RecordAllocation, RecordReturn, RecordShipment, ReleaseAllocations,
    ReleasedPortion, ReturnCondition, ReturnLine, ReturnRecorded, ReturnedPortion, SalesOrder,
    SalesOrderCommand, SalesOrderEvent, SalesOrderId, SalesOrderStatus, ShipmentLine,
    ShipmentMeta, ShipmentRecorded, ShippedPortion,
};
