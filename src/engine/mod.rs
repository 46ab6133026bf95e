// =============================================================================
// Engine — the single-writer position lifecycle core
// =============================================================================
//
// Everything that mutates the active trade, the portfolio, or the watchlist
// slot flows through one serialized event stream consumed by the
// `PositionManager` task. Market data, order verification, admin actions, and
// the periodic risk check are all just variants on that stream.
// =============================================================================

pub mod manager;
pub mod trade;

pub use manager::PositionManager;
pub use trade::{ActiveTrade, ExecutionParams, ExitReason, TradeStatus};

use crate::broker::verifier::OrderVerificationResult;
use crate::market_data::Candle;
use crate::types::ExecutionMode;

/// The manager's input alphabet.
#[derive(Debug)]
pub enum EngineEvent {
    /// A new (or refreshed) 1-minute candle.
    Candle(Candle),
    /// A trade tick — drives excursion tracking between candles.
    Tick { scrip_code: String, last_rate: f64 },
    /// An order verification resolved.
    Verification(OrderVerificationResult),
    /// Operator action from the admin surface.
    Admin(AdminCommand),
    /// Periodic risk sweep (unrealized P&L, breaker thresholds, expiry).
    RiskCheck,
}

#[derive(Debug, Clone)]
pub enum AdminCommand {
    TripBreaker { reason: String },
    ResetBreaker,
    ForceClose { trade_id: String, reason: String },
    SetMode(ExecutionMode),
    AcknowledgeExitFailure { trade_id: String },
}
