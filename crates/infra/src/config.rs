//! Engine configuration.
//!
//! Precedence (lowest first):
//! 1. Defaults in code (`#[serde(default)]` on every section)
//! 2. Optional file `config/stockflow.{toml,yaml,json}`
//! 3. Environment variables `STOCKFLOW__<SECTION>__<KEY>`, e.g.
//!    `STOCKFLOW__DISPATCH__MAX_RETRIES=8` or
//!    `STOCKFLOW__ALLOCATION__WAREHOUSE_PRIORITY=<uuid>,<uuid>`

use config::{Config, ConfigBuilder, ConfigError, Environment, File, builder::DefaultState};
use serde::{Deserialize, Serialize};

use stockflow_core::WarehouseId;
use stockflow_planning::{ConfidenceLevel, ReorderPolicy};

use crate::command_dispatcher::DEFAULT_MAX_RETRIES;

pub const DEFAULT_CONFIG_FILE: &str = "config/stockflow";
pub const ENV_PREFIX: &str = "STOCKFLOW";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Reload-and-retry rounds after an append conflict.
    pub max_retries: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocationConfig {
    /// Warehouses tried after the order's own warehouse, in this order.
    pub warehouse_priority: Vec<WarehouseId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub window_days: u32,
    pub horizon_days: u32,
    /// 90, 95 or 99.
    pub confidence: u8,
    /// Trailing window of the historical rate used when no forecast exists.
    pub history_fallback_days: u32,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            window_days: 90,
            horizon_days: 30,
            confidence: 95,
            history_fallback_days: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReorderConfig {
    pub safety_factor: f64,
    pub coverage_days: u32,
    pub urgent_days_of_stock: f64,
    /// Used when the supplier directory has no lead time for a product.
    pub default_lead_time_days: u32,
    pub days_of_stock_sentinel: f64,
}

impl Default for ReorderConfig {
    fn default() -> Self {
        let policy = ReorderPolicy::default();
        Self {
            safety_factor: policy.safety_factor,
            coverage_days: policy.coverage_days,
            urgent_days_of_stock: policy.urgent_days_of_stock,
            default_lead_time_days: 7,
            days_of_stock_sentinel: policy.days_of_stock_sentinel,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcurementConfig {
    /// Create generated purchase orders approved instead of pending approval.
    pub auto_approve: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub allocation: AllocationConfig,
    pub forecast: ForecastConfig,
    pub reorder: ReorderConfig,
    pub procurement: ProcurementConfig,
}

impl EngineConfig {
    /// Load from `config/stockflow.*` (optional) and `STOCKFLOW__*` variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Like [`EngineConfig::load`] with another file stem.
    pub fn load_from(file_stem: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(file_stem).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("allocation.warehouse_priority")
                    .try_parsing(true),
            );
        Self::build(builder)
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let cfg: EngineConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.forecast.window_days == 0 {
            return Err(ConfigError::Message("forecast.window_days must be positive".into()));
        }
        if self.forecast.horizon_days == 0 {
            return Err(ConfigError::Message("forecast.horizon_days must be positive".into()));
        }
        if self.forecast.history_fallback_days == 0 {
            return Err(ConfigError::Message("forecast.history_fallback_days must be positive".into()));
        }
        self.confidence_level()?;
        if !(self.reorder.safety_factor.is_finite() && self.reorder.safety_factor > 0.0) {
            return Err(ConfigError::Message("reorder.safety_factor must be positive".into()));
        }
        Ok(())
    }

    pub fn confidence_level(&self) -> Result<ConfidenceLevel, ConfigError> {
        ConfidenceLevel::from_percent(self.forecast.confidence).map_err(|e| ConfigError::Message(e.to_string()))
    }

    pub fn reorder_policy(&self) -> ReorderPolicy {
        ReorderPolicy {
            safety_factor: self.reorder.safety_factor,
            coverage_days: self.reorder.coverage_days,
            urgent_days_of_stock: self.reorder.urgent_days_of_stock,
            days_of_stock_sentinel: self.reorder.days_of_stock_sentinel,
        }
    }
}

#[cfg(test)]
mod tests {
    use config::FileFormat;

    use super::*;

    fn from_toml(toml: &str) -> Result<EngineConfig, ConfigError> {
        EngineConfig::build(Config::builder().add_source(File::from_str(toml, FileFormat::Toml)))
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = from_toml("").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.dispatch.max_retries, 5);
        assert_eq!(cfg.forecast.window_days, 90);
        assert_eq!(cfg.forecast.horizon_days, 30);
        assert_eq!(cfg.reorder.default_lead_time_days, 7);
        assert_eq!(cfg.reorder_policy(), ReorderPolicy::default());
        assert!(!cfg.procurement.auto_approve);
    }

    #[test]
    fn file_values_override_defaults_per_key() {
        let warehouse = WarehouseId::new();
        let cfg = from_toml(&format!(
            r#"
            [forecast]
            confidence = 99

            [allocation]
            warehouse_priority = ["{warehouse}"]

            [procurement]
            auto_approve = true
            "#
        ))
        .unwrap();

        assert_eq!(cfg.confidence_level().unwrap(), ConfidenceLevel::NinetyNine);
        assert_eq!(cfg.forecast.window_days, 90);
        assert_eq!(cfg.allocation.warehouse_priority, vec![warehouse]);
        assert!(cfg.procurement.auto_approve);
    }

    #[test]
    fn unsupported_confidence_is_rejected() {
        assert!(from_toml("[forecast]\nconfidence = 80").is_err());
        assert!(from_toml("[forecast]\nwindow_days = 0").is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cfg = EngineConfig::load_from("config/definitely-not-there").unwrap();
        assert_eq!(cfg.forecast.confidence, 95);
    }
}
