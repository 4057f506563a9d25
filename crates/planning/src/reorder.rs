//! Reorder analysis: urgency classification and suggested quantities.

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::{Deserialize, Serialize};

/// Tunables of the reorder analysis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReorderPolicy {
    /// Multiplier on lead-time demand for the suggested reorder point.
    pub safety_factor: f64,
    /// Days of demand a suggested order should cover.
    pub coverage_days: u32,
    pub urgent_days_of_stock: f64,
    /// Reported days of stock when there is no demand.
    pub days_of_stock_sentinel: f64,
}

impl Default for ReorderPolicy {
    fn default() -> Self {
        Self {
            safety_factor: 1.5,
            coverage_days: 30,
            urgent_days_of_stock: 3.0,
            days_of_stock_sentinel: 999.0,
        }
    }
}

/// Where the daily demand rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandSource {
    Forecast,
    History,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderInput {
    pub quantity_available: i64,
    /// Ordered from suppliers and not yet received.
    #[serde(default)]
    pub quantity_in_transit: i64,
    pub reorder_point: i64,
    pub reorder_quantity: i64,
    pub max_stock_level: Option<i64>,
    pub average_cost: Decimal,
    pub lead_time_days: u32,
    pub daily_demand_rate: f64,
    pub demand_source: DemandSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Stockout,
    UrgentReorder,
    Reorder,
    Overstock,
    Ok,
}

impl Recommendation {
    /// Whether procurement should act on it.
    pub fn needs_purchase(&self) -> bool {
        matches!(
            self,
            Recommendation::Stockout | Recommendation::UrgentReorder | Recommendation::Reorder
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReorderRecommendation {
    pub recommendation: Recommendation,
    pub daily_demand_rate: f64,
    pub demand_source: DemandSource,
    pub days_of_stock: f64,
    pub lead_time_demand: f64,
    pub suggested_reorder_point: i64,
    pub suggested_order_quantity: i64,
    pub estimated_order_value: Decimal,
}

fn ceil_to_i64(x: f64) -> i64 {
    if x.is_finite() && x > 0.0 {
        x.ceil() as i64
    } else {
        0
    }
}

/// Classify one record by its inventory position: available stock plus what
/// is already in transit. Inbound orders therefore count against a new one.
pub fn analyze_reorder(input: &ReorderInput, policy: &ReorderPolicy) -> ReorderRecommendation {
    let rate = if input.daily_demand_rate.is_finite() {
        input.daily_demand_rate.max(0.0)
    } else {
        0.0
    };
    let available = input.quantity_available + input.quantity_in_transit.max(0);

    let days_of_stock = if rate > 0.0 {
        available as f64 / rate
    } else {
        policy.days_of_stock_sentinel
    };

    let lead_time_demand = rate * f64::from(input.lead_time_days);
    let suggested_reorder_point = ceil_to_i64(lead_time_demand * policy.safety_factor);
    let suggested_order_quantity = input
        .reorder_quantity
        .max(ceil_to_i64(rate * f64::from(policy.coverage_days)));

    let recommendation = if available <= 0 {
        Recommendation::Stockout
    } else if (available as f64) <= suggested_reorder_point as f64 * 0.5
        || days_of_stock <= policy.urgent_days_of_stock
    {
        Recommendation::UrgentReorder
    } else if available <= input.reorder_point.max(suggested_reorder_point) {
        Recommendation::Reorder
    } else if input.max_stock_level.is_some_and(|max| available > max) {
        Recommendation::Overstock
    } else {
        Recommendation::Ok
    };

    let estimated_order_value =
        Decimal::from_i64(suggested_order_quantity).unwrap_or(Decimal::ZERO) * input.average_cost;

    ReorderRecommendation {
        recommendation,
        daily_demand_rate: rate,
        demand_source: input.demand_source,
        days_of_stock,
        lead_time_demand,
        suggested_reorder_point,
        suggested_order_quantity,
        estimated_order_value,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use super::*;

    fn input(available: i64, rate: f64) -> ReorderInput {
        ReorderInput {
            quantity_available: available,
            quantity_in_transit: 0,
            reorder_point: 10,
            reorder_quantity: 50,
            max_stock_level: Some(500),
            average_cost: dec!(2.50),
            lead_time_days: 7,
            daily_demand_rate: rate,
            demand_source: DemandSource::Forecast,
        }
    }

    #[test]
    fn suggested_values_follow_lead_time_and_coverage() {
        let r = analyze_reorder(&input(100, 4.0), &ReorderPolicy::default());
        // 4/day * 7 days = 28; * 1.5 = 42
        assert_eq!(r.suggested_reorder_point, 42);
        // max(50, 4 * 30 = 120)
        assert_eq!(r.suggested_order_quantity, 120);
        assert_eq!(r.estimated_order_value, dec!(300.00));
        assert!((r.days_of_stock - 25.0).abs() < 1e-9);
        assert_eq!(r.recommendation, Recommendation::Ok);
    }

    #[test]
    fn configured_quantity_wins_when_larger() {
        let r = analyze_reorder(&input(100, 1.0), &ReorderPolicy::default());
        assert_eq!(r.suggested_order_quantity, 50);
    }

    #[test]
    fn classification_ladder() {
        let policy = ReorderPolicy::default();
        // ROP 42 → urgent at ≤ 21
        assert_eq!(analyze_reorder(&input(20, 4.0), &policy).recommendation, Recommendation::UrgentReorder);
        // 3 days of stock or less is urgent even above half the ROP
        assert_eq!(analyze_reorder(&input(30, 10.0), &policy).recommendation, Recommendation::UrgentReorder);
        assert_eq!(analyze_reorder(&input(40, 4.0), &policy).recommendation, Recommendation::Reorder);
        assert_eq!(analyze_reorder(&input(600, 4.0), &policy).recommendation, Recommendation::Overstock);
    }

    #[test]
    fn in_transit_stock_counts_toward_the_position() {
        let policy = ReorderPolicy::default();
        let short = input(8, 0.0);
        assert_eq!(analyze_reorder(&short, &policy).recommendation, Recommendation::Reorder);

        let covered = ReorderInput {
            quantity_in_transit: 50,
            ..short
        };
        let r = analyze_reorder(&covered, &policy);
        assert_eq!(r.recommendation, Recommendation::Ok);
        assert!(!r.recommendation.needs_purchase());

        let empty_shelf = ReorderInput {
            quantity_in_transit: 50,
            ..input(0, 0.0)
        };
        assert_eq!(analyze_reorder(&empty_shelf, &policy).recommendation, Recommendation::Ok);
    }

    #[test]
    fn no_demand_uses_sentinel_days_of_stock() {
        let r = analyze_reorder(&input(30, 0.0), &ReorderPolicy::default());
        assert_eq!(r.days_of_stock, 999.0);
        assert_eq!(r.suggested_reorder_point, 0);
        // Still below the configured reorder point? No: 30 > 10.
        assert_eq!(r.recommendation, Recommendation::Ok);

        let r = analyze_reorder(&input(8, 0.0), &ReorderPolicy::default());
        assert_eq!(r.recommendation, Recommendation::Reorder);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: zero available stock is a stockout whatever the other fields say.
        #[test]
        fn zero_available_is_always_stockout(
            reorder_point in 0i64..1_000,
            reorder_quantity in 0i64..1_000,
            max_stock_level in prop::option::of(1i64..1_000),
            lead_time_days in 0u32..120,
            rate in 0.0f64..500.0,
        ) {
            let r = analyze_reorder(
                &ReorderInput {
                    quantity_available: 0,
                    quantity_in_transit: 0,
                    reorder_point,
                    reorder_quantity,
                    max_stock_level,
                    average_cost: dec!(1),
                    lead_time_days,
                    daily_demand_rate: rate,
                    demand_source: DemandSource::History,
                },
                &ReorderPolicy::default(),
            );
            prop_assert_eq!(r.recommendation, Recommendation::Stockout);
            prop_assert!(r.suggested_order_quantity >= reorder_quantity);
        }
    }
}
