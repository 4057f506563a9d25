//! `stockflow-planning`
//!
//! Demand forecasting and reorder analysis as pure numeric functions over
//! already-materialized rows (sale history, stock levels). Nothing here reads
//! a store or mutates domain state; the infrastructure services feed it.

pub mod demand;
pub mod error;
pub mod forecast;
pub mod reorder;
pub mod stats;

pub use demand::{
    DailyDemand, DemandClassification, DemandPattern, SaleRecord, Trend, TrendAnalysis,
    analyze_demand, daily_series,
};
pub use error::PlanningError;
pub use forecast::{ConfidenceLevel, DemandForecast, forecast_demand};
pub use reorder::{
    DemandSource, Recommendation, ReorderInput, ReorderPolicy, ReorderRecommendation,
    analyze_reorder,
};
