//! Demand pattern analysis over sale history.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use stockflow_core::ProductId;

use crate::error::PlanningError;
use crate::stats::{coefficient_of_variation, linear_regression, mean};

/// Minimum number of daily points before a trend is estimated.
pub const MIN_TREND_POINTS: usize = 7;
/// Minimum number of daily points before seasonality is estimated.
pub const MIN_SEASONALITY_POINTS: usize = 14;

const TREND_SLOPE_THRESHOLD: f64 = 0.1;
const TREND_STRENGTH_THRESHOLD: f64 = 0.3;

/// One sale taken from the movement log (quantity as a positive number).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRecord {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
    pub quantity: i64,
    pub value: Decimal,
}

/// Sales of one product on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyDemand {
    pub date: NaiveDate,
    pub quantity: i64,
    pub value: Decimal,
    pub transactions: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub trend: Trend,
    pub slope: f64,
    /// R² of the fit.
    pub strength: f64,
}

impl TrendAnalysis {
    pub fn stable() -> Self {
        Self {
            trend: Trend::Stable,
            slope: 0.0,
            strength: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DemandClassification {
    SlowMoving,
    Sporadic,
    Irregular,
    Growing,
    Declining,
    Stable,
    Regular,
}

impl DemandClassification {
    /// Forecast multiplier applied on top of the trend-adjusted base demand.
    pub fn forecast_multiplier(&self) -> f64 {
        match self {
            DemandClassification::SlowMoving => 0.8,
            DemandClassification::Sporadic => 0.7,
            DemandClassification::Irregular => 1.2,
            DemandClassification::Growing => 1.1,
            DemandClassification::Declining => 0.9,
            DemandClassification::Stable | DemandClassification::Regular => 1.0,
        }
    }
}

/// Computed view of a product's historical sales behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandPattern {
    pub product_id: ProductId,
    pub window_days: u32,
    pub total_quantity: i64,
    pub total_value: Decimal,
    pub active_days: usize,
    /// Total quantity over the whole window.
    pub average_daily_demand: f64,
    /// Total quantity over days that had sales.
    pub actual_average_daily_demand: f64,
    /// Coefficient of variation of the daily quantities.
    pub demand_variability: f64,
    pub trend: TrendAnalysis,
    pub seasonality_score: f64,
    pub classification: DemandClassification,
}

/// Aggregate sale records into a date-ordered daily series.
pub fn daily_series<'a>(records: impl IntoIterator<Item = &'a SaleRecord>) -> Vec<DailyDemand> {
    let mut days: BTreeMap<NaiveDate, DailyDemand> = BTreeMap::new();
    for r in records {
        let date = r.occurred_at.date_naive();
        let day = days.entry(date).or_insert_with(|| DailyDemand {
            date,
            quantity: 0,
            value: Decimal::ZERO,
            transactions: 0,
        });
        day.quantity += r.quantity;
        day.value += r.value;
        day.transactions += 1;
    }
    days.into_values().collect()
}

fn analyze_trend(quantities: &[f64]) -> TrendAnalysis {
    if quantities.len() < MIN_TREND_POINTS {
        return TrendAnalysis::stable();
    }

    let fit = linear_regression(quantities);
    let trend = if fit.slope.abs() > TREND_SLOPE_THRESHOLD && fit.r_squared > TREND_STRENGTH_THRESHOLD {
        if fit.slope > 0.0 {
            Trend::Increasing
        } else {
            Trend::Decreasing
        }
    } else {
        Trend::Stable
    };

    TrendAnalysis {
        trend,
        slope: fit.slope,
        strength: fit.r_squared,
    }
}

fn seasonality_score(series: &[DailyDemand]) -> f64 {
    if series.len() < MIN_SEASONALITY_POINTS {
        return 0.0;
    }

    let mut by_weekday: [(f64, u32); 7] = [(0.0, 0); 7];
    for day in series {
        let idx = day.date.weekday().num_days_from_monday() as usize;
        by_weekday[idx].0 += day.quantity as f64;
        by_weekday[idx].1 += 1;
    }

    let averages: Vec<f64> = by_weekday
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(sum, n)| sum / f64::from(*n))
        .collect();

    coefficient_of_variation(&averages).min(1.0)
}

fn classify(
    average_daily_demand: f64,
    active_days: usize,
    variability: f64,
    trend: Trend,
) -> DemandClassification {
    if average_daily_demand < 0.1 {
        DemandClassification::SlowMoving
    } else if active_days < 7 {
        DemandClassification::Sporadic
    } else if variability > 1.5 {
        DemandClassification::Irregular
    } else if trend == Trend::Increasing {
        DemandClassification::Growing
    } else if trend == Trend::Decreasing {
        DemandClassification::Declining
    } else if variability < 0.3 {
        DemandClassification::Stable
    } else {
        DemandClassification::Regular
    }
}

/// Derive the demand pattern of one product from its daily series.
pub fn analyze_demand(
    product_id: ProductId,
    series: &[DailyDemand],
    window_days: u32,
) -> Result<DemandPattern, PlanningError> {
    if window_days == 0 {
        return Err(PlanningError::InvalidInput("window_days must be positive".to_string()));
    }

    let quantities: Vec<f64> = series.iter().map(|d| d.quantity as f64).collect();
    let total_quantity: i64 = series.iter().map(|d| d.quantity).sum();
    let total_value: Decimal = series.iter().map(|d| d.value).sum();
    let active_days = series.len();

    let average_daily_demand = total_quantity as f64 / f64::from(window_days);
    let actual_average_daily_demand = if active_days == 0 {
        0.0
    } else {
        mean(&quantities)
    };
    let demand_variability = coefficient_of_variation(&quantities);
    let trend = analyze_trend(&quantities);
    let seasonality_score = seasonality_score(series);

    Ok(DemandPattern {
        product_id,
        window_days,
        total_quantity,
        total_value,
        active_days,
        average_daily_demand,
        actual_average_daily_demand,
        demand_variability,
        trend,
        seasonality_score,
        classification: classify(average_daily_demand, active_days, demand_variability, trend.trend),
    })
}
