//! Engine-recognized configuration surface.
//!
//! Mirrors the teacher crate's layered `serde` + `toml` config structs
//! (see `vault`/`scrapers` modules' `*Config` types) but scoped to exactly
//! what §6 of the design says the core recognizes: `execution.*`,
//! `fees.*`, `session_defaults.*`, plus opaque passthrough tables for
//! `clickhouse.*` and `services.*` that the core itself never reads but
//! must round-trip for adapters loading the same file.

use serde::{Deserialize, Serialize};
use toml::Value;

use crate::engine::account::{FeeSchedule, MarginPolicy};
use crate::engine::queue::OverflowPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub enable_margin_call_checks: bool,
    pub enable_forced_liquidation: bool,
    pub enable_market_impact: bool,
    pub market_impact_bps: f64,
    pub maintenance_margin_bp: f64,
    pub intraday_leverage: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enable_margin_call_checks: false,
            enable_forced_liquidation: false,
            enable_market_impact: false,
            market_impact_bps: 0.0,
            maintenance_margin_bp: 2500.0,
            intraday_leverage: 4.0,
        }
    }
}

impl ExecutionConfig {
    pub fn margin_policy(&self) -> MarginPolicy {
        MarginPolicy {
            margin_enabled: self.intraday_leverage > 2.0,
            buying_power_multiplier: if self.intraday_leverage > 2.0 {
                self.intraday_leverage
            } else {
                2.0
            },
            maintenance_margin_requirement: self.maintenance_margin_bp / 10_000.0,
            margin_call_enabled: self.enable_margin_call_checks,
            forced_liquidation_enabled: self.enable_forced_liquidation,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FeesConfig {
    pub per_order_commission: f64,
    pub per_share_commission: f64,
    pub sec_fee_per_million: f64,
    pub taf_fee_per_share: f64,
    pub finra_taf_cap: f64,
    pub taker_fee_per_share: f64,
}

impl Default for FeesConfig {
    fn default() -> Self {
        let d = FeeSchedule::default();
        Self {
            per_order_commission: d.per_order_commission,
            per_share_commission: d.per_share_commission,
            sec_fee_per_million: d.sec_fee_per_million,
            taf_fee_per_share: d.finra_taf_per_share,
            finra_taf_cap: d.finra_taf_cap,
            taker_fee_per_share: d.taker_fee_per_share,
        }
    }
}

impl From<FeesConfig> for FeeSchedule {
    fn from(c: FeesConfig) -> Self {
        FeeSchedule {
            per_order_commission: c.per_order_commission,
            per_share_commission: c.per_share_commission,
            sec_fee_per_million: c.sec_fee_per_million,
            finra_taf_per_share: c.taf_fee_per_share,
            finra_taf_cap: c.finra_taf_cap,
            taker_fee_per_share: c.taker_fee_per_share,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverflowPolicyConfig {
    Block,
    DropOldest,
    DropNewest,
}

impl From<OverflowPolicyConfig> for OverflowPolicy {
    fn from(c: OverflowPolicyConfig) -> Self {
        match c {
            OverflowPolicyConfig::Block => OverflowPolicy::Block,
            OverflowPolicyConfig::DropOldest => OverflowPolicy::DropOldest,
            OverflowPolicyConfig::DropNewest => OverflowPolicy::DropNewest,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionDefaultsConfig {
    pub queue_capacity: usize,
    pub overflow_policy: OverflowPolicyConfig,
    pub initial_capital: f64,
    pub speed_factor: f64,
}

impl Default for SessionDefaultsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 65_536,
            overflow_policy: OverflowPolicyConfig::Block,
            initial_capital: 100_000.0,
            speed_factor: 0.0,
        }
    }
}

/// Top-level configuration file shape. `clickhouse` and `services` are
/// kept as opaque `toml::Value` tables: the core never reads them, but
/// round-trips them so a single config file can be shared with the
/// protocol adapters that do.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution: ExecutionConfig,
    pub fees: FeesConfig,
    pub session_defaults: SessionDefaultsConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clickhouse: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub services: Option<Value>,
}

impl EngineConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = EngineConfig::default();
        let s = cfg.to_toml_string().unwrap();
        let parsed = EngineConfig::from_toml_str(&s).unwrap();
        assert_eq!(parsed.session_defaults.initial_capital, 100_000.0);
    }

    #[test]
    fn passthrough_tables_survive_round_trip() {
        let toml_src = r#"
            [clickhouse]
            host = "localhost"
            port = 9000

            [services]
            bind_address = "0.0.0.0:8080"
        "#;
        let cfg = EngineConfig::from_toml_str(toml_src).unwrap();
        assert!(cfg.clickhouse.is_some());
        assert!(cfg.services.is_some());
    }

    #[test]
    fn config_round_trips_through_a_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");

        let mut cfg = EngineConfig::default();
        cfg.execution.intraday_leverage = 3.0;
        std::fs::write(&path, cfg.to_toml_string().unwrap()).unwrap();

        let loaded = EngineConfig::from_toml_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.execution.intraday_leverage, 3.0);
    }

    #[test]
    fn execution_config_derives_margin_policy() {
        let cfg = ExecutionConfig {
            intraday_leverage: 4.0,
            enable_margin_call_checks: true,
            ..ExecutionConfig::default()
        };
        let policy = cfg.margin_policy();
        assert!(policy.margin_enabled);
        assert_eq!(policy.buying_power_multiplier, 4.0);
        assert!(policy.margin_call_enabled);
    }
}
