//! Demand analysis and forecasting over the ledger's sale movements.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use stockflow_core::ProductId;
use stockflow_inventory::MovementType;
use stockflow_planning::{DemandForecast, DemandPattern, PlanningError, SaleRecord, analyze_demand, daily_series, forecast_demand};

use super::{Engine, MovementFilter};
use crate::command_dispatcher::DispatchError;
use crate::event_bus::EnvelopeBus;
use crate::event_store::EventStore;

/// Forecast of one product, summed over every warehouse it is stocked in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductForecast {
    pub product_id: ProductId,
    pub generated_at: DateTime<Utc>,
    pub forecast: DemandForecast,
}

impl From<PlanningError> for DispatchError {
    fn from(value: PlanningError) -> Self {
        match value {
            PlanningError::InvalidInput(msg) => DispatchError::Validation(msg),
        }
    }
}

impl<S, B> Engine<S, B>
where
    S: EventStore,
    B: EnvelopeBus,
{
    /// Sales of a product between `from` and `to` (both inclusive), one row
    /// per `sale` movement with a positive quantity. Sales cancelled by an
    /// `unship` reversal are left out. Values are at the unit cost recorded
    /// on the sale.
    pub fn sales_history(
        &self,
        product_id: ProductId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SaleRecord>, DispatchError> {
        let history = self.movement_history(&MovementFilter {
            product_id: Some(product_id),
            movement_types: vec![MovementType::Sale, MovementType::Unship],
            from: Some(from),
            ..Default::default()
        })?;
        let reversed: BTreeSet<Uuid> = history.movements.iter().filter_map(|m| m.reverses).collect();

        Ok(history
            .movements
            .into_iter()
            .filter(|m| m.movement_type == MovementType::Sale && !reversed.contains(&m.movement_id))
            .filter(|m| m.timestamp >= from && m.timestamp <= to)
            .map(|m| {
                let quantity = -m.quantity;
                SaleRecord {
                    product_id,
                    occurred_at: m.timestamp,
                    quantity,
                    value: m.unit_cost.map_or(Decimal::ZERO, |c| c * Decimal::from(quantity)),
                }
            })
            .collect())
    }

    /// Demand pattern over the trailing `window_days` (configured default if `None`).
    pub fn analyze_demand_pattern(
        &self,
        product_id: ProductId,
        window_days: Option<u32>,
    ) -> Result<DemandPattern, DispatchError> {
        let window_days = window_days.unwrap_or(self.config.forecast.window_days);
        if window_days == 0 {
            return Err(DispatchError::Validation("window_days must be positive".to_string()));
        }
        let now = self.now();
        let sales = self.sales_history(product_id, now - Duration::days(i64::from(window_days)), now)?;
        let pattern = analyze_demand(product_id, &daily_series(&sales), window_days)?;
        debug!(%product_id, window_days, active_days = pattern.active_days, "demand analysed");
        Ok(pattern)
    }

    pub fn forecast_product_demand(
        &self,
        product_id: ProductId,
        horizon_days: Option<u32>,
    ) -> Result<ProductForecast, DispatchError> {
        let horizon_days = horizon_days.unwrap_or(self.config.forecast.horizon_days);
        let confidence = self
            .config
            .confidence_level()
            .map_err(|e| DispatchError::Validation(e.to_string()))?;

        let pattern = self.analyze_demand_pattern(product_id, None)?;
        let forecast = forecast_demand(pattern, horizon_days, confidence)?;
        Ok(ProductForecast {
            product_id,
            generated_at: self.now(),
            forecast,
        })
    }

    /// Forecast every product that has a ledger record. Products whose
    /// forecast fails are logged and skipped.
    pub fn forecast_all(&self, horizon_days: Option<u32>) -> Result<Vec<ProductForecast>, DispatchError> {
        let products: BTreeSet<ProductId> = self.all_records()?.iter().filter_map(|r| r.product_id()).collect();

        let mut forecasts = Vec::with_capacity(products.len());
        for product_id in products {
            match self.forecast_product_demand(product_id, horizon_days) {
                Ok(f) => forecasts.push(f),
                Err(err @ DispatchError::Validation(_)) => return Err(err),
                Err(err) => warn!(%product_id, error = %err, "forecast skipped"),
            }
        }
        Ok(forecasts)
    }

    /// Average daily sales over the trailing `days`, used when no forecast
    /// signal exists.
    pub(crate) fn historical_daily_rate(&self, product_id: ProductId, days: u32) -> Result<f64, DispatchError> {
        if days == 0 {
            return Ok(0.0);
        }
        let now = self.now();
        let sold: i64 = self
            .sales_history(product_id, now - Duration::days(i64::from(days)), now)?
            .iter()
            .map(|s| s.quantity)
            .sum();
        Ok(sold as f64 / f64::from(days))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use stockflow_core::WarehouseId;
    use stockflow_inventory::{InventoryId, MovementReference, ReorderThresholds};
    use stockflow_planning::DemandClassification;

    use super::*;
    use crate::collaborators::FixedClock;
    use crate::config::EngineConfig;
    use crate::event_bus::InMemoryEnvelopeBus;
    use crate::event_store::InMemoryEventStore;
    use crate::services::{LedgerRecordSpec, MovementRequest};

    type TestEngine = Engine<InMemoryEventStore, InMemoryEnvelopeBus>;

    fn engine_at(clock: Arc<FixedClock>, window_days: u32) -> TestEngine {
        let mut config = EngineConfig::default();
        config.forecast.window_days = window_days;
        Engine::new(InMemoryEventStore::new(), InMemoryEnvelopeBus::new(), config).with_clock(clock)
    }

    fn movement(engine: &TestEngine, id: InventoryId, movement_type: MovementType, quantity: i64) {
        engine
            .record_movement(MovementRequest {
                inventory_id: id,
                movement_type,
                quantity,
                unit_cost: None,
                reference: MovementReference::new("test", "forecast"),
                performed_by: None,
            })
            .unwrap();
    }

    /// Sells `per_day` units on each of `days` consecutive days; the clock
    /// ends on the last sale.
    fn sell_daily(engine: &TestEngine, clock: &FixedClock, product_id: ProductId, days: i64, per_day: i64) {
        let id = engine
            .upsert_ledger_record(LedgerRecordSpec {
                product_id,
                warehouse_id: WarehouseId::new(),
                location: None,
                thresholds: ReorderThresholds::default(),
            })
            .unwrap()
            .id_typed();
        movement(engine, id, MovementType::AdjustmentIn, days * per_day);
        for day in 0..days {
            if day > 0 {
                clock.advance(Duration::days(1));
            }
            movement(engine, id, MovementType::Reservation, per_day);
            movement(engine, id, MovementType::Sale, -per_day);
        }
    }

    #[test]
    fn flat_daily_sales_forecast_rate_times_horizon() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let engine = engine_at(clock.clone(), 30);
        let product = ProductId::new();
        sell_daily(&engine, &clock, product, 30, 5);

        let pattern = engine.analyze_demand_pattern(product, None).unwrap();
        assert_eq!(pattern.active_days, 30);
        assert_eq!(pattern.total_quantity, 150);
        assert_eq!(pattern.classification, DemandClassification::Stable);

        let f = engine.forecast_product_demand(product, Some(30)).unwrap();
        assert!((f.forecast.forecast_demand - 150.0).abs() < 1e-9);
        assert!((f.forecast.lower_bound - 150.0).abs() < 1e-9);
        assert!((f.forecast.upper_bound - 150.0).abs() < 1e-9);
    }

    #[test]
    fn product_without_sales_forecasts_zero() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let engine = engine_at(clock, 90);

        let f = engine.forecast_product_demand(ProductId::new(), None).unwrap();
        assert_eq!(f.forecast.pattern.active_days, 0);
        assert_eq!(f.forecast.forecast_demand, 0.0);
    }

    #[test]
    fn history_excludes_sales_outside_the_window() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let engine = engine_at(clock.clone(), 90);
        let product = ProductId::new();
        sell_daily(&engine, &clock, product, 10, 2);

        let now = engine.now();
        let last_three = engine.sales_history(product, now - Duration::days(2), now).unwrap();
        assert_eq!(last_three.len(), 3);
        assert!(last_three.iter().all(|s| s.quantity == 2));
        assert!((engine.historical_daily_rate(product, 10).unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn forecast_all_covers_each_stocked_product_once() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let engine = engine_at(clock.clone(), 30);
        let product = ProductId::new();
        sell_daily(&engine, &clock, product, 3, 1);
        sell_daily(&engine, &clock, product, 3, 1);

        let all = engine.forecast_all(None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].product_id, product);
        assert_eq!(all[0].forecast.pattern.total_quantity, 6);
    }
}
