// =============================================================================
// Runtime Configuration — hot-reloadable engine settings with atomic save
// =============================================================================
//
// Central configuration hub for the Meridian engine. Every tunable parameter
// lives here so the engine can be reconfigured at runtime without a restart.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::ExecutionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_account_value() -> f64 {
    1_000_000.0
}

fn default_risk_per_trade() -> f64 {
    0.01
}

fn default_max_position_risk() -> f64 {
    0.01
}

fn default_max_exposure_pct() -> f64 {
    0.15
}

fn default_max_daily_loss() -> f64 {
    0.03
}

fn default_max_drawdown() -> f64 {
    0.15
}

fn default_min_rr() -> f64 {
    1.5
}

fn default_safe_reset_min_rr() -> f64 {
    2.0
}

fn default_min_move() -> f64 {
    0.02
}

fn default_max_stop_distance() -> f64 {
    0.02
}

fn default_max_concurrent_positions() -> u32 {
    1
}

fn default_max_instrument_share() -> f64 {
    // 100% while a single position is allowed; drop to 0.30 when raising
    // max_concurrent_positions.
    1.0
}

fn default_max_position_value() -> f64 {
    150_000.0
}

fn default_max_signal_age_secs() -> u64 {
    120
}

fn default_entry_timeout_secs() -> u64 {
    30
}

fn default_exit_verify_retries() -> u32 {
    3
}

fn default_exit_verify_window_secs() -> u64 {
    60
}

fn default_pending_ttl_minutes() -> i64 {
    45
}

fn default_volume_factor() -> f64 {
    1.2
}

fn default_volume_lookback() -> usize {
    20
}

fn default_candle_history_len() -> usize {
    100
}

fn default_price_ttl_secs() -> u64 {
    10
}

fn default_idempotency_ttl_hours() -> i64 {
    24
}

fn default_idempotency_capacity() -> usize {
    100_000
}

fn default_trading_zone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_golden_windows() -> Vec<String> {
    vec!["09:30-11:30".to_string(), "13:30-15:00".to_string()]
}

fn default_session_cutoff() -> String {
    "15:15".to_string()
}

fn default_nse_hours() -> SessionWindow {
    SessionWindow {
        open: "09:00".to_string(),
        close: "15:30".to_string(),
    }
}

fn default_mcx_hours() -> SessionWindow {
    SessionWindow {
        open: "09:00".to_string(),
        close: "23:30".to_string(),
    }
}

fn default_trail_stages() -> Vec<TrailStage> {
    vec![
        TrailStage { trigger_r: 1.0, stop_r: 0.0 },
        TrailStage { trigger_r: 1.5, stop_r: 0.5 },
        TrailStage { trigger_r: 2.0, stop_r: 1.0 },
    ]
}

fn default_exit_slippage_ticks() -> u32 {
    1
}

fn default_tick_size() -> f64 {
    0.05
}

fn default_lot_size() -> i64 {
    1
}

fn default_tp1_exit_fraction() -> f64 {
    0.5
}

fn default_risk_monitor_interval_secs() -> u64 {
    5
}

fn default_verify_poll_interval_secs() -> u64 {
    2
}

fn default_broker_failure_trip_count() -> u32 {
    3
}

fn default_broker_failure_window_secs() -> u64 {
    60
}

fn default_pivot_service_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_kv_snapshot_path() -> String {
    "meridian_kv.json".to_string()
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

// =============================================================================
// Sub-structures
// =============================================================================

/// Wall-clock open/close of an exchange session, "HH:MM" in the trading zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub open: String,
    pub close: String,
}

/// One stage of the R-multiple trailing ladder: when favorable excursion
/// reaches `trigger_r` R-units, the stop moves to `stop_r` R-units from entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrailStage {
    pub trigger_r: f64,
    pub stop_r: f64,
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration for the Meridian engine.
///
/// Every field has a serde default so that older JSON files missing new fields
/// will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Operational mode ----------------------------------------------------

    /// Execution mode: paper, live, or silent.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Starting account value for the session.
    #[serde(default = "default_account_value")]
    pub account_value: f64,

    // --- Per-signal validation ----------------------------------------------

    /// Minimum |target1 - entry| / entry.
    #[serde(default = "default_min_move")]
    pub min_move: f64,

    /// Maximum |entry - stop| / entry.
    #[serde(default = "default_max_stop_distance")]
    pub max_stop_distance: f64,

    /// Minimum risk/reward ratio.
    #[serde(default = "default_min_rr")]
    pub min_rr: f64,

    /// Stricter R:R applied while safe-reset mode is on.
    #[serde(default = "default_safe_reset_min_rr")]
    pub safe_reset_min_rr: f64,

    /// When on, `safe_reset_min_rr` replaces `min_rr`.
    #[serde(default)]
    pub safe_reset: bool,

    // --- Portfolio gates -----------------------------------------------------

    /// Risked capital per trade as a fraction of account value.
    #[serde(default = "default_risk_per_trade")]
    pub risk_per_trade: f64,

    /// Maximum per-trade risk: |entry - stop| * size <= this * account.
    #[serde(default = "default_max_position_risk")]
    pub max_position_risk: f64,

    /// Maximum total exposure across open positions as a fraction of account.
    #[serde(default = "default_max_exposure_pct")]
    pub max_exposure_pct: f64,

    /// Daily realized+unrealized loss that trips the circuit breaker.
    #[serde(default = "default_max_daily_loss")]
    pub max_daily_loss: f64,

    /// Drawdown from session peak that trips the circuit breaker.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown: f64,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    /// Maximum share of total exposure a single instrument may hold.
    #[serde(default = "default_max_instrument_share")]
    pub max_instrument_share: f64,

    /// Cap on size * entry for any single position.
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,

    /// Consecutive broker failures within the window that trip the breaker.
    #[serde(default = "default_broker_failure_trip_count")]
    pub broker_failure_trip_count: u32,

    #[serde(default = "default_broker_failure_window_secs")]
    pub broker_failure_window_secs: u64,

    // --- Ingress -------------------------------------------------------------

    /// Drop signals older than this.
    #[serde(default = "default_max_signal_age_secs")]
    pub max_signal_age_secs: u64,

    /// Watchlist TTL for a pending signal awaiting confirmation.
    #[serde(default = "default_pending_ttl_minutes")]
    pub pending_ttl_minutes: i64,

    #[serde(default = "default_idempotency_ttl_hours")]
    pub idempotency_ttl_hours: i64,

    #[serde(default = "default_idempotency_capacity")]
    pub idempotency_capacity: usize,

    // --- Entry confirmation --------------------------------------------------

    /// Candle volume must exceed the tail mean by this factor.
    #[serde(default = "default_volume_factor")]
    pub volume_factor: f64,

    /// Number of prior candles in the volume mean.
    #[serde(default = "default_volume_lookback")]
    pub volume_lookback: usize,

    #[serde(default = "default_candle_history_len")]
    pub candle_history_len: usize,

    // --- Execution -----------------------------------------------------------

    /// Entry order cancelled and the trade FAILED if unfilled after this.
    #[serde(default = "default_entry_timeout_secs")]
    pub entry_timeout_secs: u64,

    #[serde(default = "default_exit_verify_retries")]
    pub exit_verify_retries: u32,

    #[serde(default = "default_exit_verify_window_secs")]
    pub exit_verify_window_secs: u64,

    /// Ticks added beyond the touch when pricing spread-aware exit limits.
    #[serde(default = "default_exit_slippage_ticks")]
    pub exit_slippage_ticks: u32,

    #[serde(default = "default_tick_size")]
    pub default_tick_size: f64,

    #[serde(default = "default_lot_size")]
    pub default_lot_size: i64,

    /// Fraction of the position closed at TARGET1 on the paper path.
    #[serde(default = "default_tp1_exit_fraction")]
    pub tp1_exit_fraction: f64,

    #[serde(default = "default_verify_poll_interval_secs")]
    pub verify_poll_interval_secs: u64,

    // --- Trailing ladder -----------------------------------------------------

    #[serde(default = "default_trail_stages")]
    pub trail_stages: Vec<TrailStage>,

    // --- Sessions & windows --------------------------------------------------

    /// IANA zone for all wall-clock windows.
    #[serde(default = "default_trading_zone")]
    pub trading_zone: String,

    #[serde(default = "default_nse_hours")]
    pub nse_hours: SessionWindow,

    #[serde(default = "default_mcx_hours")]
    pub mcx_hours: SessionWindow,

    /// Intraday "HH:MM-HH:MM" intervals during which entries are permitted.
    #[serde(default = "default_golden_windows")]
    pub golden_windows: Vec<String>,

    /// Wall-clock time at which any open position is force-closed.
    #[serde(default = "default_session_cutoff")]
    pub session_cutoff: String,

    // --- Collaborators -------------------------------------------------------

    #[serde(default = "default_pivot_service_url")]
    pub pivot_service_url: String,

    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,

    #[serde(default = "default_risk_monitor_interval_secs")]
    pub risk_monitor_interval_secs: u64,

    #[serde(default = "default_kv_snapshot_path")]
    pub kv_snapshot_path: String,

    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserialises via defaults")
    }
}

impl RuntimeConfig {
    /// Effective minimum R:R, honoring safe-reset mode.
    pub fn effective_min_rr(&self) -> f64 {
        if self.safe_reset {
            self.safe_reset_min_rr
        } else {
            self.min_rr
        }
    }

    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read runtime config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse runtime config from {}", path.display()))?;

        info!(
            path = %path.display(),
            mode = %config.mode,
            account_value = config.account_value,
            "runtime config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise runtime config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "runtime config saved (atomic)");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_spec_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.mode, ExecutionMode::Paper);
        assert!((cfg.account_value - 1_000_000.0).abs() < f64::EPSILON);
        assert!((cfg.min_move - 0.02).abs() < f64::EPSILON);
        assert!((cfg.max_stop_distance - 0.02).abs() < f64::EPSILON);
        assert!((cfg.min_rr - 1.5).abs() < f64::EPSILON);
        assert!((cfg.max_daily_loss - 0.03).abs() < f64::EPSILON);
        assert!((cfg.max_drawdown - 0.15).abs() < f64::EPSILON);
        assert_eq!(cfg.max_concurrent_positions, 1);
        assert_eq!(cfg.max_signal_age_secs, 120);
        assert_eq!(cfg.entry_timeout_secs, 30);
        assert_eq!(cfg.exit_verify_retries, 3);
        assert_eq!(cfg.trading_zone, "Asia/Kolkata");
        assert_eq!(cfg.nse_hours.open, "09:00");
        assert_eq!(cfg.nse_hours.close, "15:30");
        assert_eq!(cfg.mcx_hours.close, "23:30");
    }

    #[test]
    fn trail_ladder_defaults() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.trail_stages.len(), 3);
        assert!((cfg.trail_stages[0].trigger_r - 1.0).abs() < f64::EPSILON);
        assert!((cfg.trail_stages[0].stop_r - 0.0).abs() < f64::EPSILON);
        assert!((cfg.trail_stages[2].trigger_r - 2.0).abs() < f64::EPSILON);
        assert!((cfg.trail_stages[2].stop_r - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn safe_reset_raises_min_rr() {
        let mut cfg = RuntimeConfig::default();
        assert!((cfg.effective_min_rr() - 1.5).abs() < f64::EPSILON);
        cfg.safe_reset = true;
        assert!((cfg.effective_min_rr() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "mode": "live", "accountValue": 2000000.0 }"#;
        // Field names are snake_case in this file's serde layout; the camel
        // variant must not override anything.
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap_or_default();
        assert!((cfg.min_rr - 1.5).abs() < f64::EPSILON);

        let json = r#"{ "mode": "live", "account_value": 2000000.0 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.mode, ExecutionMode::Live);
        assert!((cfg.account_value - 2_000_000.0).abs() < f64::EPSILON);
        assert_eq!(cfg.max_concurrent_positions, 1);
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RuntimeConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RuntimeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.mode, cfg2.mode);
        assert_eq!(cfg.golden_windows, cfg2.golden_windows);
        assert_eq!(cfg.trail_stages.len(), cfg2.trail_stages.len());
    }

    #[test]
    fn atomic_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut cfg = RuntimeConfig::default();
        cfg.safe_reset = true;
        cfg.save(&path).unwrap();

        let loaded = RuntimeConfig::load(&path).unwrap();
        assert!(loaded.safe_reset);
        assert!((loaded.effective_min_rr() - 2.0).abs() < f64::EPSILON);
    }
}
