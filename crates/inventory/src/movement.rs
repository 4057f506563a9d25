//! Movements: the immutable rows of the movement log and the rules that turn a
//! signed quantity into a change of stock levels.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::{DomainError, ProductId, UserId, WarehouseId};

use crate::record::InventoryId;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementType {
    /// Goods received from a supplier (inbound, consumes in-transit).
    Purchase,
    /// Goods shipped to a customer (reserved → gone).
    Sale,
    AdjustmentIn,
    AdjustmentOut,
    /// Customer return put back on the shelf.
    Return,
    /// Leg of a transfer between two records; the sign gives the direction.
    Transfer,
    /// available → reserved, on-hand untouched.
    Reservation,
    /// reserved → available, on-hand untouched.
    Release,
    /// Shipped units back on the shelf under their reservation (undoes a sale).
    Unship,
    /// Received units taken back out (undoes a costed inbound movement).
    InboundReversal,
}

impl MovementType {
    pub const ALL: [MovementType; 10] = [
        MovementType::Purchase,
        MovementType::Sale,
        MovementType::AdjustmentIn,
        MovementType::AdjustmentOut,
        MovementType::Return,
        MovementType::Transfer,
        MovementType::Reservation,
        MovementType::Release,
        MovementType::Unship,
        MovementType::InboundReversal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Purchase => "purchase",
            MovementType::Sale => "sale",
            MovementType::AdjustmentIn => "adjustment_in",
            MovementType::AdjustmentOut => "adjustment_out",
            MovementType::Return => "return",
            MovementType::Transfer => "transfer",
            MovementType::Reservation => "reservation",
            MovementType::Release => "release",
            MovementType::Unship => "unship",
            MovementType::InboundReversal => "inbound_reversal",
        }
    }

    /// Check that the signed quantity points the way this movement type moves stock.
    pub fn validate_quantity(&self, quantity: i64) -> Result<(), DomainError> {
        let ok = match self {
            MovementType::Purchase
            | MovementType::AdjustmentIn
            | MovementType::Return
            | MovementType::Reservation
            | MovementType::Unship => quantity > 0,
            MovementType::Sale
            | MovementType::AdjustmentOut
            | MovementType::Release
            | MovementType::InboundReversal => quantity < 0,
            MovementType::Transfer => quantity != 0,
        };
        if ok {
            Ok(())
        } else {
            Err(DomainError::validation(format!(
                "quantity {quantity} has the wrong sign for a {} movement",
                self.as_str()
            )))
        }
    }

    /// The single movement that cancels a movement of this type and `quantity`.
    pub fn reversal(&self, quantity: i64) -> (MovementType, i64) {
        match self {
            MovementType::Reservation => (MovementType::Release, -quantity),
            MovementType::Release => (MovementType::Reservation, -quantity),
            MovementType::Sale => (MovementType::Unship, -quantity),
            MovementType::Unship => (MovementType::Sale, -quantity),
            MovementType::Purchase | MovementType::AdjustmentIn => (MovementType::InboundReversal, -quantity),
            MovementType::Transfer if quantity > 0 => (MovementType::InboundReversal, -quantity),
            MovementType::Transfer => (MovementType::Transfer, -quantity),
            MovementType::Return => (MovementType::AdjustmentOut, -quantity),
            MovementType::AdjustmentOut | MovementType::InboundReversal => (MovementType::AdjustmentIn, -quantity),
        }
    }

    /// Whether a movement of this type with `quantity` brings new units in at a cost.
    pub fn is_costed_inbound(&self, quantity: i64) -> bool {
        quantity > 0
            && matches!(
                self,
                MovementType::Purchase | MovementType::AdjustmentIn | MovementType::Transfer
            )
    }
}

impl core::fmt::Display for MovementType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for MovementType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown movement type: {s}")))
    }
}

/// What caused a movement (order, receipt, adjustment, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MovementReference {
    pub reference_type: String,
    pub reference_id: String,
}

impl MovementReference {
    pub fn new(reference_type: impl Into<String>, reference_id: impl ToString) -> Self {
        Self {
            reference_type: reference_type.into(),
            reference_id: reference_id.to_string(),
        }
    }
}

/// Stock quantities of one inventory record.
///
/// `on_hand == available + reserved` always holds for levels produced by
/// [`StockLevels::apply`]. In-transit stock is tracked alongside but is not
/// part of on-hand.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevels {
    pub on_hand: i64,
    pub available: i64,
    pub reserved: i64,
    pub in_transit: i64,
}

impl StockLevels {
    pub fn is_consistent(&self) -> bool {
        self.on_hand == self.available + self.reserved
            && self.on_hand >= 0
            && self.available >= 0
            && self.reserved >= 0
            && self.in_transit >= 0
    }

    /// Levels after a movement, or `InsufficientStock` if any quantity would go negative.
    pub fn apply(&self, movement_type: MovementType, quantity: i64) -> Result<StockLevels, DomainError> {
        movement_type.validate_quantity(quantity)?;

        let mut next = *self;
        match movement_type {
            MovementType::Purchase => {
                next.on_hand += quantity;
                next.available += quantity;
                next.in_transit = (next.in_transit - quantity).max(0);
            }
            MovementType::AdjustmentIn
            | MovementType::Return
            | MovementType::AdjustmentOut
            | MovementType::Transfer
            | MovementType::InboundReversal => {
                next.on_hand += quantity;
                next.available += quantity;
            }
            MovementType::Sale | MovementType::Unship => {
                next.on_hand += quantity;
                next.reserved += quantity;
            }
            MovementType::Reservation | MovementType::Release => {
                next.available -= quantity;
                next.reserved += quantity;
            }
        }

        if next.available < 0 {
            return Err(DomainError::insufficient_stock(format!(
                "{} of {} needs {} available, have {}",
                movement_type,
                quantity.abs(),
                self.available - next.available,
                self.available
            )));
        }
        if next.reserved < 0 {
            return Err(DomainError::insufficient_stock(format!(
                "{} of {} exceeds reserved quantity {}",
                movement_type,
                quantity.abs(),
                self.reserved
            )));
        }
        if next.on_hand < 0 {
            return Err(DomainError::insufficient_stock(format!(
                "{} of {} exceeds on-hand quantity {}",
                movement_type,
                quantity.abs(),
                self.on_hand
            )));
        }

        Ok(next)
    }
}

/// Average cost after taking back `quantity` units that came in at `unit_cost`,
/// leaving `remaining` on hand. Floored at zero; unchanged when nothing remains.
pub fn unwound_average_cost(average_cost: Decimal, on_hand: i64, unit_cost: Decimal, quantity: i64) -> Decimal {
    let remaining = on_hand - quantity;
    if remaining <= 0 {
        return average_cost;
    }
    let value = average_cost * Decimal::from(on_hand) - unit_cost * Decimal::from(quantity);
    (value / Decimal::from(remaining)).max(Decimal::ZERO)
}

/// Weighted-average unit cost after receiving `quantity` units at `unit_cost`.
pub fn weighted_average_cost(
    average_cost: Decimal,
    on_hand: i64,
    unit_cost: Decimal,
    quantity: i64,
) -> Decimal {
    let total = on_hand + quantity;
    if total <= 0 {
        return average_cost;
    }
    let old_value = average_cost * Decimal::from(on_hand.max(0));
    let new_value = unit_cost * Decimal::from(quantity);
    (old_value + new_value) / Decimal::from(total)
}

/// One immutable row of the movement log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub movement_id: Uuid,
    pub inventory_id: InventoryId,
    pub product_id: ProductId,
    pub warehouse_id: WarehouseId,
    pub movement_type: MovementType,
    /// Signed quantity (see [`MovementType::validate_quantity`]).
    pub quantity: i64,
    pub unit_cost: Option<Decimal>,
    pub reference: MovementReference,
    pub performed_by: Option<UserId>,
    pub timestamp: DateTime<Utc>,
    /// On-hand quantity after this movement.
    pub quantity_after: i64,
    pub available_after: i64,
    pub reserved_after: i64,
    /// Change of in-transit stock: a purchase consumes scheduled units, its
    /// reversal puts them back.
    #[serde(default)]
    pub in_transit_delta: i64,
    /// Movement this one cancels, for reversals.
    #[serde(default)]
    pub reverses: Option<Uuid>,
}

/// Rebuild on-hand / available / reserved from movements alone.
///
/// Every movement's recorded snapshot is checked against the recomputed level;
/// a mismatch means the log and the ledger disagree. In-transit quantity is not
/// part of the movement log and comes back as zero.
pub fn replay<'a>(movements: impl IntoIterator<Item = &'a Movement>) -> Result<StockLevels, DomainError> {
    let mut levels = StockLevels::default();
    for m in movements {
        levels = levels.apply(m.movement_type, m.quantity).map_err(|e| {
            DomainError::invariant(format!("movement {} cannot be replayed: {e}", m.movement_id))
        })?;
        levels.in_transit = 0;

        if levels.on_hand != m.quantity_after
            || levels.available != m.available_after
            || levels.reserved != m.reserved_after
        {
            return Err(DomainError::invariant(format!(
                "movement {} snapshot ({}/{}/{}) differs from replay ({}/{}/{})",
                m.movement_id,
                m.quantity_after,
                m.available_after,
                m.reserved_after,
                levels.on_hand,
                levels.available,
                levels.reserved
            )));
        }
    }
    Ok(levels)
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn levels(on_hand: i64, available: i64, reserved: i64) -> StockLevels {
        StockLevels {
            on_hand,
            available,
            reserved,
            in_transit: 0,
        }
    }

    #[test]
    fn reservation_moves_available_to_reserved() {
        let next = levels(10, 10, 0).apply(MovementType::Reservation, 4).unwrap();
        assert_eq!(next, levels(10, 6, 4));
        assert!(next.is_consistent());
    }

    #[test]
    fn sale_consumes_reserved_stock() {
        let next = levels(10, 6, 4).apply(MovementType::Sale, -3).unwrap();
        assert_eq!(next, levels(7, 6, 1));
    }

    #[test]
    fn sale_beyond_reserved_is_insufficient_stock() {
        let err = levels(10, 10, 0).apply(MovementType::Sale, -1).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientStock(_)));
    }

    #[test]
    fn adjustment_out_cannot_take_reserved_units() {
        let err = levels(10, 2, 8).apply(MovementType::AdjustmentOut, -3).unwrap_err();
        match err {
            DomainError::InsufficientStock(msg) if msg.contains("have 2") => {}
            other => panic!("expected InsufficientStock, got {other:?}"),
        }
    }

    #[test]
    fn wrong_sign_is_validation_error() {
        let err = levels(0, 0, 0).apply(MovementType::Purchase, -5).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(MovementType::Transfer.validate_quantity(0).is_err());
    }

    #[test]
    fn purchase_consumes_in_transit_saturating() {
        let mut start = levels(0, 0, 0);
        start.in_transit = 5;
        let next = start.apply(MovementType::Purchase, 8).unwrap();
        assert_eq!(next.in_transit, 0);
        assert_eq!(next.on_hand, 8);
    }

    #[test]
    fn each_reversal_is_one_movement_restoring_the_levels() {
        let start = levels(20, 10, 10);
        for (movement_type, quantity) in [
            (MovementType::Reservation, 3),
            (MovementType::Release, -3),
            (MovementType::Sale, -3),
            (MovementType::Return, 3),
            (MovementType::AdjustmentIn, 3),
            (MovementType::AdjustmentOut, -3),
            (MovementType::Transfer, -3),
            (MovementType::Transfer, 3),
            (MovementType::Purchase, 3),
        ] {
            let after = start.apply(movement_type, quantity).unwrap();
            let (reversal, back) = movement_type.reversal(quantity);
            assert_eq!(after.apply(reversal, back).unwrap(), start, "{movement_type}");
        }
    }

    #[test]
    fn unship_restores_reserved_without_touching_available() {
        let next = levels(7, 0, 7).apply(MovementType::Unship, 4).unwrap();
        assert_eq!(next, levels(11, 0, 11));
    }

    #[test]
    fn unwinding_a_receipt_recovers_the_prior_average() {
        // 10 @ 4.00 + 10 @ 8.00 = 20 @ 6.00; take the 8.00 units back out.
        assert_eq!(unwound_average_cost(dec!(6.00), 20, dec!(8.00), 10), dec!(4.00));
        assert_eq!(unwound_average_cost(dec!(6.00), 10, dec!(8.00), 10), dec!(6.00));
    }

    #[test]
    fn weighted_average_blends_old_and_new_cost() {
        // 10 @ 2.00 + 10 @ 4.00 = 20 @ 3.00
        assert_eq!(weighted_average_cost(dec!(2.00), 10, dec!(4.00), 10), dec!(3.00));
        assert_eq!(weighted_average_cost(dec!(0), 0, dec!(7.5), 4), dec!(7.5));
    }

    #[test]
    fn movement_type_parses_from_wire_name() {
        for t in MovementType::ALL {
            assert_eq!(t.as_str().parse::<MovementType>().unwrap(), t);
        }
        assert!("teleport".parse::<MovementType>().is_err());
    }
}
