// =============================================================================
// Global Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the relay engine. Global options (§6.4) live
// here; persistence uses the same atomic tmp + rename pattern the rest of
// this codebase uses so that adding new fields never breaks loading an older
// config file, and so a crash mid-write never corrupts the file on disk.
// =============================================================================

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::{EffectiveUserConfig, TradingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_risk_percent() -> f64 {
    0.20
}

fn default_max_position_usdt() -> f64 {
    50_000.0
}

fn default_max_daily_loss_usdt() -> f64 {
    2_000.0
}

fn default_max_dca_per_symbol() -> u32 {
    3
}

fn default_dca_risk_multiplier() -> f64 {
    2.0
}

fn default_fixed_leverage() -> u32 {
    20
}

fn default_allowed_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "XRPUSDT".to_string(),
        "SOLUSDT".to_string(),
    ]
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_worker_pool_size() -> usize {
    10
}

fn default_reconciler_pool_size() -> usize {
    4
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    15
}

fn default_ws_backoff_cap_secs() -> u64 {
    60
}

fn default_ws_max_reconnect_attempts() -> u32 {
    20
}

fn default_session_timezone() -> String {
    "UTC".to_string()
}

// =============================================================================
// GlobalConfig
// =============================================================================

/// Global options recognized by the engine (§6.4). Every field has a serde
/// default so that older JSON files missing new fields still deserialise.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    // --- Operational mode ---------------------------------------------------
    #[serde(default)]
    pub trading_mode: TradingMode,

    // --- Multi-user mode ------------------------------------------------------
    /// When `false`, all per-user overrides are ignored and a single-user
    /// profile (this config) is used for every dispatch.
    #[serde(default = "default_true")]
    pub multi_user_mode: bool,

    // --- Risk defaults (overridable per user) --------------------------------
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,
    #[serde(default = "default_max_position_usdt")]
    pub max_position_usdt: f64,
    #[serde(default = "default_max_daily_loss_usdt")]
    pub max_daily_loss_usdt: f64,
    #[serde(default = "default_max_dca_per_symbol")]
    pub max_dca_per_symbol: u32,
    #[serde(default = "default_dca_risk_multiplier")]
    pub dca_risk_multiplier: f64,
    #[serde(default = "default_fixed_leverage")]
    pub fixed_leverage: u32,
    #[serde(default = "default_allowed_symbols")]
    pub allowed_symbols: Vec<String>,

    // --- Global-only options --------------------------------------------------
    #[serde(default = "default_symbol")]
    pub default_symbol: String,
    #[serde(default = "default_true")]
    pub dedup_enabled: bool,
    #[serde(default = "default_true")]
    pub auto_trade_enabled: bool,

    // --- Exchange endpoints ----------------------------------------------------
    #[serde(default)]
    pub exchange_base_url: String,
    #[serde(default)]
    pub exchange_ws_url: String,

    // --- Worker pools, timeouts, backoff ----------------------------------------
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
    #[serde(default = "default_reconciler_pool_size")]
    pub reconciler_pool_size: usize,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_ws_backoff_cap_secs")]
    pub ws_backoff_cap_secs: u64,
    #[serde(default = "default_ws_max_reconnect_attempts")]
    pub ws_max_reconnect_attempts: u32,

    /// IANA timezone name used to compute the "session day" boundary for
    /// the daily-loss circuit breaker and the daily cleanup/report jobs.
    #[serde(default = "default_session_timezone")]
    pub session_timezone: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::Paused,
            multi_user_mode: true,
            risk_percent: default_risk_percent(),
            max_position_usdt: default_max_position_usdt(),
            max_daily_loss_usdt: default_max_daily_loss_usdt(),
            max_dca_per_symbol: default_max_dca_per_symbol(),
            dca_risk_multiplier: default_dca_risk_multiplier(),
            fixed_leverage: default_fixed_leverage(),
            allowed_symbols: default_allowed_symbols(),
            default_symbol: default_symbol(),
            dedup_enabled: true,
            auto_trade_enabled: true,
            exchange_base_url: String::new(),
            exchange_ws_url: String::new(),
            worker_pool_size: default_worker_pool_size(),
            reconciler_pool_size: default_reconciler_pool_size(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
            ws_backoff_cap_secs: default_ws_backoff_cap_secs(),
            ws_max_reconnect_attempts: default_ws_max_reconnect_attempts(),
            session_timezone: default_session_timezone(),
        }
    }
}

impl GlobalConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read global config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse global config from {}", path.display()))?;

        info!(
            path = %path.display(),
            trading_mode = %config.trading_mode,
            multi_user_mode = config.multi_user_mode,
            "global config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise global config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "global config saved (atomic)");
        Ok(())
    }

    /// The default `EffectiveUserConfig` used when `multi_user_mode` is
    /// `false`, or as the base every per-user override is resolved against.
    pub fn base_user_config(&self) -> EffectiveUserConfig {
        EffectiveUserConfig {
            risk_percent: self.risk_percent,
            max_position_notional: self.max_position_usdt,
            max_daily_loss: self.max_daily_loss_usdt,
            max_dca_per_symbol: self.max_dca_per_symbol,
            dca_risk_multiplier: self.dca_risk_multiplier,
            leverage: self.fixed_leverage,
            allowed_symbols: self.allowed_symbols.iter().cloned().collect::<HashSet<_>>(),
            auto_trade_enabled: self.auto_trade_enabled,
        }
    }
}

// =============================================================================
// Per-user overrides (DB-backed via UserStore) — §6.4
// =============================================================================

/// A subset of `GlobalConfig` a single user may override. `defaultSymbol`
/// and `dedupEnabled` are deliberately absent: the spec marks them
/// global-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfigOverride {
    pub risk_percent: Option<f64>,
    pub max_position_notional: Option<f64>,
    pub max_daily_loss: Option<f64>,
    pub max_dca_per_symbol: Option<u32>,
    pub dca_risk_multiplier: Option<f64>,
    pub leverage: Option<u32>,
    pub allowed_symbols: Option<Vec<String>>,
    pub auto_trade_enabled: Option<bool>,
}

/// Resolve "user override if set, else global default" field-by-field.
pub fn resolve_effective_config(
    global: &GlobalConfig,
    over: Option<&UserConfigOverride>,
) -> EffectiveUserConfig {
    let base = global.base_user_config();
    let Some(o) = over else { return base };

    EffectiveUserConfig {
        risk_percent: o.risk_percent.unwrap_or(base.risk_percent),
        max_position_notional: o.max_position_notional.unwrap_or(base.max_position_notional),
        max_daily_loss: o.max_daily_loss.unwrap_or(base.max_daily_loss),
        max_dca_per_symbol: o.max_dca_per_symbol.unwrap_or(base.max_dca_per_symbol),
        dca_risk_multiplier: o.dca_risk_multiplier.unwrap_or(base.dca_risk_multiplier),
        leverage: o.leverage.unwrap_or(base.leverage),
        allowed_symbols: o
            .allowed_symbols
            .as_ref()
            .map(|v| v.iter().cloned().collect::<HashSet<_>>())
            .unwrap_or(base.allowed_symbols),
        auto_trade_enabled: o.auto_trade_enabled.unwrap_or(base.auto_trade_enabled),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = GlobalConfig::default();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert!(cfg.multi_user_mode);
        assert_eq!(cfg.allowed_symbols.len(), 5);
        assert_eq!(cfg.allowed_symbols[0], "BTCUSDT");
        assert_eq!(cfg.default_symbol, "BTCUSDT");
        assert!((cfg.risk_percent - 0.20).abs() < f64::EPSILON);
        assert!((cfg.max_daily_loss_usdt - 2000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.fixed_leverage, 20);
        assert_eq!(cfg.worker_pool_size, 10);
        assert_eq!(cfg.reconciler_pool_size, 4);
        assert_eq!(cfg.ws_max_reconnect_attempts, 20);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: GlobalConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Paused);
        assert!(cfg.dedup_enabled);
        assert_eq!(cfg.max_dca_per_symbol, 3);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "trading_mode": "Live", "risk_percent": 0.5 }"#;
        let cfg: GlobalConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.trading_mode, TradingMode::Live);
        assert!((cfg.risk_percent - 0.5).abs() < f64::EPSILON);
        assert_eq!(cfg.fixed_leverage, 20);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = GlobalConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: GlobalConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.allowed_symbols, cfg2.allowed_symbols);
        assert_eq!(cfg.max_dca_per_symbol, cfg2.max_dca_per_symbol);
        assert_eq!(cfg.trading_mode, cfg2.trading_mode);
    }

    #[test]
    fn override_resolution_falls_back_to_global() {
        let global = GlobalConfig::default();
        let over = UserConfigOverride {
            risk_percent: Some(0.10),
            ..Default::default()
        };
        let effective = resolve_effective_config(&global, Some(&over));
        assert!((effective.risk_percent - 0.10).abs() < f64::EPSILON);
        assert!((effective.max_daily_loss - global.max_daily_loss_usdt).abs() < f64::EPSILON);
        assert_eq!(effective.leverage, global.fixed_leverage);
    }

    #[test]
    fn no_override_yields_base_config() {
        let global = GlobalConfig::default();
        let effective = resolve_effective_config(&global, None);
        assert!((effective.risk_percent - global.risk_percent).abs() < f64::EPSILON);
        assert_eq!(effective.allowed_symbols.len(), global.allowed_symbols.len());
    }
}
