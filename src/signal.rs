// =============================================================================
// Signal and result records — the engine's upstream input and downstream output
// =============================================================================
//
// `StrategySignal` is parsed tolerantly: unknown fields are ignored and every
// optional field carries a serde default, so producers can evolve their schema
// without breaking ingestion. Once parsed, a signal is never mutated; the
// watchlist wraps it in a `PendingSignal` that carries the working state.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Severity};

// ---------------------------------------------------------------------------
// StrategySignal (input)
// ---------------------------------------------------------------------------

/// Raw action emitted by the strategy. `Buy`/`Bullish` and `Sell`/`Bearish`
/// are synonyms at the execution layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Bullish,
    Bearish,
}

impl SignalAction {
    pub fn direction(&self) -> Direction {
        match self {
            Self::Buy | Self::Bullish => Direction::Bullish,
            Self::Sell | Self::Bearish => Direction::Bearish,
        }
    }
}

/// A strategy signal as consumed from the signal topic.
///
/// Only the fields the engine uses are typed; the schema is tolerant to
/// unknown fields by construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategySignal {
    #[serde(default)]
    pub signal_id: Option<String>,

    /// Opaque instrument id; may carry `exchange:type:code`.
    pub scrip_code: String,

    #[serde(default)]
    pub company_name: String,

    pub signal: SignalAction,

    pub entry_price: f64,
    pub stop_loss: f64,

    pub target1: f64,
    #[serde(default)]
    pub target2: Option<f64>,
    #[serde(default)]
    pub target3: Option<f64>,

    /// Strategy confidence in [0, 1].
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub ml_confidence: Option<f64>,
    #[serde(default)]
    pub volatility: Option<f64>,
    #[serde(default)]
    pub microstructure_liquidity: Option<f64>,
    #[serde(default)]
    pub position_size_multiplier: Option<f64>,

    #[serde(default)]
    pub exchange: Option<String>,
    #[serde(default)]
    pub exchange_type: Option<String>,

    // Execution-instrument overrides: the signal instrument and the traded
    // instrument may differ (equity signal executed via an option).
    #[serde(default)]
    pub order_scrip_code: Option<String>,
    #[serde(default)]
    pub order_exchange: Option<String>,
    #[serde(default)]
    pub order_exchange_type: Option<String>,
    #[serde(default)]
    pub order_limit_price_entry: Option<f64>,
    #[serde(default)]
    pub order_limit_price_exit: Option<f64>,
    #[serde(default)]
    pub order_tick_size: Option<f64>,
    #[serde(default)]
    pub order_lot_size: Option<i64>,

    /// Producer time, milliseconds since epoch.
    pub timestamp: i64,
}

impl StrategySignal {
    pub fn direction(&self) -> Direction {
        self.signal.direction()
    }

    /// Deduplication key: `signalId` when present, else `scripCode|timestamp`.
    pub fn idempotency_key(&self) -> String {
        match &self.signal_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}|{}", self.scrip_code, self.timestamp),
        }
    }

    pub fn produced_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.timestamp).unwrap_or_else(Utc::now)
    }
}

// ---------------------------------------------------------------------------
// PendingSignal — watchlist entry awaiting entry confirmation
// ---------------------------------------------------------------------------

/// A signal admitted to the watchlist, carrying the working metadata the entry
/// state machine accumulates across candles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingSignal {
    pub signal: StrategySignal,
    pub direction: Direction,
    pub admitted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub validation_attempts: u32,
    #[serde(default)]
    pub last_rejection_reason: Option<String>,
    /// Window start of the candle that breached the daily pivot, once seen.
    #[serde(default)]
    pub breach_candle_start_ms: Option<i64>,
    /// Risk/reward computed at the most recent READY evaluation.
    #[serde(default)]
    pub potential_rr: Option<f64>,
    /// Entry price carried on the signal at admission time.
    pub signal_price: f64,
}

impl PendingSignal {
    pub fn new(signal: StrategySignal, now: DateTime<Utc>, ttl: chrono::Duration) -> Self {
        let direction = signal.direction();
        let signal_price = signal.entry_price;
        Self {
            signal,
            direction,
            admitted_at: now,
            expires_at: now + ttl,
            validation_attempts: 0,
            last_rejection_reason: None,
            breach_candle_start_ms: None,
            potential_rr: None,
            signal_price,
        }
    }

    pub fn scrip_code(&self) -> &str {
        &self.signal.scrip_code
    }
}

// ---------------------------------------------------------------------------
// RiskEvent (output)
// ---------------------------------------------------------------------------

/// Emitted on every risk refusal and on limit-threshold crossings. Never
/// stored in the core; downstream consumers own retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskEvent {
    pub event_id: String,
    /// Taxonomy code, e.g. `RISK_DAILY_LOSS`, `INGEST_STALE`.
    pub event_type: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default)]
    pub current_value: Option<f64>,
    #[serde(default)]
    pub limit_value: Option<f64>,
    #[serde(default)]
    pub threshold_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Policy scope the event is keyed by: wallet id or instrument.
    pub scope: String,
}

impl RiskEvent {
    pub fn new(event_type: &str, severity: Severity, scope: &str, message: String) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.to_string(),
            severity,
            message,
            current_value: None,
            limit_value: None,
            threshold_percent: None,
            timestamp: Utc::now(),
            scope: scope.to_string(),
        }
    }

    pub fn with_values(mut self, current: f64, limit: f64) -> Self {
        self.current_value = Some(current);
        self.limit_value = Some(limit);
        if limit.abs() > f64::EPSILON {
            self.threshold_percent = Some((current / limit) * 100.0);
        }
        self
    }
}

// ---------------------------------------------------------------------------
// TradeResult (output)
// ---------------------------------------------------------------------------

/// Immutable record of a completed trade, published to the results topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResult {
    pub trade_id: String,
    pub scrip_code: String,
    pub company_name: String,
    pub direction: Direction,
    pub strategy_name: String,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub position_size: i64,
    pub pnl: f64,
    /// PnL in units of the initial risk `R = |entry - initialStop|`.
    pub r_multiple: f64,
    pub exit_reason: String,
    pub duration_minutes: i64,
    pub max_favorable_excursion: f64,
    pub max_adverse_excursion: f64,
}
