//! Forward-looking demand forecast with confidence bounds.

use serde::{Deserialize, Serialize};

use stockflow_core::ProductId;

use crate::demand::DemandPattern;
use crate::error::PlanningError;

/// Trend strength (R²) above which the slope adjusts the forecast.
const TREND_ADJUSTMENT_STRENGTH: f64 = 0.3;
/// Share of `slope × horizon` added to the base forecast.
const TREND_ADJUSTMENT_FACTOR: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[serde(rename = "90")]
    Ninety,
    #[serde(rename = "95")]
    NinetyFive,
    #[serde(rename = "99")]
    NinetyNine,
}

impl ConfidenceLevel {
    pub fn z_score(&self) -> f64 {
        match self {
            ConfidenceLevel::Ninety => 1.64,
            ConfidenceLevel::NinetyFive => 1.96,
            ConfidenceLevel::NinetyNine => 2.58,
        }
    }

    pub fn from_percent(percent: u8) -> Result<Self, PlanningError> {
        match percent {
            90 => Ok(ConfidenceLevel::Ninety),
            95 => Ok(ConfidenceLevel::NinetyFive),
            99 => Ok(ConfidenceLevel::NinetyNine),
            other => Err(PlanningError::InvalidInput(format!(
                "unsupported confidence level {other}% (use 90, 95 or 99)"
            ))),
        }
    }

    pub fn percent(&self) -> u8 {
        match self {
            ConfidenceLevel::Ninety => 90,
            ConfidenceLevel::NinetyFive => 95,
            ConfidenceLevel::NinetyNine => 99,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandForecast {
    pub product_id: ProductId,
    pub horizon_days: u32,
    pub forecast_demand: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub confidence: ConfidenceLevel,
    pub pattern: DemandPattern,
}

impl DemandForecast {
    /// Forecast demand per day over the horizon.
    pub fn daily_rate(&self) -> f64 {
        if self.horizon_days == 0 {
            return 0.0;
        }
        self.forecast_demand / f64::from(self.horizon_days)
    }
}

pub fn forecast_demand(
    pattern: DemandPattern,
    horizon_days: u32,
    confidence: ConfidenceLevel,
) -> Result<DemandForecast, PlanningError> {
    if horizon_days == 0 {
        return Err(PlanningError::InvalidInput("horizon_days must be positive".to_string()));
    }

    let horizon = f64::from(horizon_days);
    let mut forecast = pattern.average_daily_demand * horizon;

    if pattern.trend.strength > TREND_ADJUSTMENT_STRENGTH {
        forecast += pattern.trend.slope * horizon * TREND_ADJUSTMENT_FACTOR;
    }

    forecast = (forecast * pattern.classification.forecast_multiplier()).max(0.0);

    let standard_error = pattern.demand_variability * pattern.average_daily_demand * horizon.sqrt();
    let margin = confidence.z_score() * standard_error;

    Ok(DemandForecast {
        product_id: pattern.product_id,
        horizon_days,
        forecast_demand: forecast,
        lower_bound: (forecast - margin).max(0.0),
        upper_bound: forecast + margin,
        confidence,
        pattern,
    })
}
