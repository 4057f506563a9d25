//! Typed side effects of ledger and order operations.
//!
//! Services emit a `DomainSignal` after a successful commit; a dispatcher in the
//! infrastructure layer turns it into a `Notification` for whatever sink is
//! configured. Delivery is fire-and-forget.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

use stockflow_core::{AggregateId, ProductId, WarehouseId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    Urgent,
}

/// What a notification sink receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
    pub priority: NotificationPriority,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainSignal {
    StockLevelChanged {
        inventory_id: AggregateId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        movement_type: String,
        quantity: i64,
        quantity_on_hand: i64,
        quantity_available: i64,
    },
    LowStock {
        inventory_id: AggregateId,
        product_id: ProductId,
        warehouse_id: WarehouseId,
        quantity_available: i64,
        reorder_point: i64,
    },
    OrderAllocated {
        order_id: AggregateId,
        allocated: i64,
        shortfall: i64,
        complete: bool,
    },
    BackorderCreated {
        order_id: AggregateId,
        backorder_id: AggregateId,
        quantity: i64,
    },
    ShipmentProcessed {
        order_id: AggregateId,
        shipment_id: String,
        quantity: i64,
        fully_shipped: bool,
    },
    ReturnProcessed {
        order_id: AggregateId,
        restocked: i64,
        not_restocked: i64,
    },
    PurchaseOrdersGenerated {
        order_count: usize,
        total_value: Decimal,
        error_count: usize,
    },
}

impl DomainSignal {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainSignal::StockLevelChanged { .. } => "stock_level_changed",
            DomainSignal::LowStock { .. } => "low_stock",
            DomainSignal::OrderAllocated { .. } => "order_allocated",
            DomainSignal::BackorderCreated { .. } => "backorder_created",
            DomainSignal::ShipmentProcessed { .. } => "shipment_processed",
            DomainSignal::ReturnProcessed { .. } => "return_processed",
            DomainSignal::PurchaseOrdersGenerated { .. } => "purchase_orders_generated",
        }
    }

    pub fn to_notification(&self) -> Notification {
        let (title, message, priority) = match self {
            DomainSignal::StockLevelChanged {
                movement_type,
                quantity,
                quantity_on_hand,
                ..
            } => (
                "Stock level changed".to_string(),
                format!("{movement_type} of {quantity}; on hand now {quantity_on_hand}"),
                NotificationPriority::Low,
            ),
            DomainSignal::LowStock {
                quantity_available,
                reorder_point,
                ..
            } => (
                "Low stock".to_string(),
                format!("available {quantity_available} is at or below reorder point {reorder_point}"),
                if *quantity_available <= 0 {
                    NotificationPriority::Urgent
                } else {
                    NotificationPriority::High
                },
            ),
            DomainSignal::OrderAllocated {
                allocated,
                shortfall,
                complete,
                ..
            } => (
                if *complete {
                    "Order allocated".to_string()
                } else {
                    "Order partially allocated".to_string()
                },
                format!("allocated {allocated}, shortfall {shortfall}"),
                if *complete {
                    NotificationPriority::Normal
                } else {
                    NotificationPriority::High
                },
            ),
            DomainSignal::BackorderCreated { quantity, .. } => (
                "Backorder created".to_string(),
                format!("backorder for {quantity} unit(s)"),
                NotificationPriority::Normal,
            ),
            DomainSignal::ShipmentProcessed {
                shipment_id,
                quantity,
                fully_shipped,
                ..
            } => (
                "Shipment processed".to_string(),
                format!(
                    "shipment {shipment_id} sent {quantity} unit(s){}",
                    if *fully_shipped { "; order fully shipped" } else { "" }
                ),
                NotificationPriority::Normal,
            ),
            DomainSignal::ReturnProcessed {
                restocked,
                not_restocked,
                ..
            } => (
                "Return processed".to_string(),
                format!("{restocked} restocked, {not_restocked} not restockable"),
                NotificationPriority::Normal,
            ),
            DomainSignal::PurchaseOrdersGenerated {
                order_count,
                total_value,
                error_count,
            } => (
                "Purchase orders generated".to_string(),
                format!("{order_count} order(s) totalling {total_value}; {error_count} item(s) skipped"),
                if *error_count > 0 {
                    NotificationPriority::High
                } else {
                    NotificationPriority::Normal
                },
            ),
        };

        Notification {
            kind: self.kind().to_string(),
            title,
            message,
            data: serde_json::to_value(self).unwrap_or_else(|_| json!({ "type": self.kind() })),
            priority,
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn low_stock_at_zero_is_urgent() {
        let signal = DomainSignal::LowStock {
            inventory_id: AggregateId::new(),
            product_id: ProductId::new(),
            warehouse_id: WarehouseId::new(),
            quantity_available: 0,
            reorder_point: 10,
        };
        let n = signal.to_notification();
        assert_eq!(n.kind, "low_stock");
        assert_eq!(n.priority, NotificationPriority::Urgent);
        assert_eq!(n.data["type"], "low_stock");
        assert_eq!(n.data["reorder_point"], 10);
    }

    #[test]
    fn procurement_summary_carries_totals() {
        let n = DomainSignal::PurchaseOrdersGenerated {
            order_count: 2,
            total_value: dec!(150.50),
            error_count: 0,
        }
        .to_notification();
        assert!(n.message.contains("2 order(s)"));
        assert!(n.message.contains("150.50"));
        assert_eq!(n.priority, NotificationPriority::Normal);
    }
}
