// =============================================================================
// Active Trade — the position record and its stop/target/trail state machine
// =============================================================================
//
// Life-cycle:
//   WaitingForEntry -> PendingFill -> Active -> PartialExit -> Completed
//                          |             \______________________/
//                          v                        |
//                        Failed                 Cancelled
//
// All transitions happen under the position manager's single-writer
// discipline; this module is the pure state — no I/O, no clocks beyond the
// timestamps it is handed.
//
// Trailing is an R-multiple ladder: favorable excursion measured in units of
// the initial risk advances the stage, and each stage pins the stop at a
// configured R-offset from entry. The stop only ever moves toward profit and
// the stage never decreases.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::Instrument;
use crate::market_data::Candle;
use crate::runtime_config::TrailStage;
use crate::types::Direction;

// ---------------------------------------------------------------------------
// Status and exit reasons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    WaitingForEntry,
    PendingFill,
    Active,
    PartialExit,
    Completed,
    Failed,
    Cancelled,
}

impl TradeStatus {
    /// States that occupy the single-active-trade slot.
    pub fn occupies_slot(&self) -> bool {
        matches!(self, Self::PendingFill | Self::Active | Self::PartialExit)
    }

    /// States in which bars drive exits.
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Active | Self::PartialExit)
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WaitingForEntry => "WAITING_FOR_ENTRY",
            Self::PendingFill => "PENDING_FILL",
            Self::Active => "ACTIVE",
            Self::PartialExit => "PARTIAL_EXIT",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    Target1,
    Target2,
    EndOfSession,
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::StopLoss => "STOP_LOSS",
            Self::Target1 => "TARGET1",
            Self::Target2 => "TARGET2",
            Self::EndOfSession => "END_OF_SESSION",
            Self::Manual => "MANUAL",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Execution parameters (typed — replaces the metadata map)
// ---------------------------------------------------------------------------

/// The instrument the orders are routed to plus any price overrides the
/// signal supplied. The signal instrument and execution instrument may differ
/// (an equity signal executed via its option).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionParams {
    pub instrument: Instrument,
    pub limit_price_entry: Option<f64>,
    pub limit_price_exit: Option<f64>,
}

/// An exit order in flight, waiting for verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingExit {
    pub reason: ExitReason,
    /// The level the exit was decided at (stop, target, or session close).
    pub exit_level: f64,
    pub quantity: i64,
    /// A partial exit leaves the remainder running.
    pub is_partial: bool,
}

/// Exit trigger computed from a bar.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitTrigger {
    pub reason: ExitReason,
    pub level: f64,
}

// ---------------------------------------------------------------------------
// ActiveTrade
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTrade {
    pub trade_id: String,
    pub signal_id: Option<String>,
    pub scrip_code: String,
    pub company_name: String,
    pub direction: Direction,
    pub strategy_name: String,
    pub signal_time: DateTime<Utc>,
    pub entry_time: Option<DateTime<Utc>>,

    /// Requested at submission, replaced by the actual fill.
    pub entry_price: f64,
    pub position_size: i64,

    /// Stop at entry time — the R unit for trailing and the r-multiple.
    pub initial_stop: f64,
    pub stop_loss: f64,
    pub target1: f64,
    pub target2: Option<f64>,
    pub target3: Option<f64>,
    pub target1_hit: bool,
    pub target2_hit: bool,
    pub trailing_stop: Option<f64>,
    pub trail_stage: u8,

    pub high_since_entry: f64,
    pub low_since_entry: f64,

    pub status: TradeStatus,
    pub execution: ExecutionParams,

    pub entry_order_id: Option<String>,
    pub exit_order_id: Option<String>,
    pub pending_exit: Option<PendingExit>,
    pub exit_reason: Option<ExitReason>,
    pub exit_price: f64,
    pub exit_time: Option<DateTime<Utc>>,

    pub exit_failure_reason: Option<String>,
    pub exit_attempts: u32,
    pub first_exit_attempt_at: Option<DateTime<Utc>>,
    /// Exit retries exhausted; an operator must acknowledge before the engine
    /// tries again.
    pub exit_escalated: bool,

    /// PnL booked by partial exits so far.
    pub realized_pnl: f64,
    pub closed_qty: i64,
}

impl ActiveTrade {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scrip_code: String,
        company_name: String,
        direction: Direction,
        strategy_name: String,
        signal_time: DateTime<Utc>,
        entry_price: f64,
        position_size: i64,
        stop_loss: f64,
        target1: f64,
        target2: Option<f64>,
        target3: Option<f64>,
        execution: ExecutionParams,
    ) -> Self {
        Self {
            trade_id: uuid::Uuid::new_v4().to_string(),
            signal_id: None,
            scrip_code,
            company_name,
            direction,
            strategy_name,
            signal_time,
            entry_time: None,
            entry_price,
            position_size,
            initial_stop: stop_loss,
            stop_loss,
            target1,
            target2,
            target3,
            target1_hit: false,
            target2_hit: false,
            trailing_stop: None,
            trail_stage: 0,
            high_since_entry: entry_price,
            low_since_entry: entry_price,
            status: TradeStatus::WaitingForEntry,
            execution,
            entry_order_id: None,
            exit_order_id: None,
            pending_exit: None,
            exit_reason: None,
            exit_price: 0.0,
            exit_time: None,
            exit_failure_reason: None,
            exit_attempts: 0,
            first_exit_attempt_at: None,
            exit_escalated: false,
            realized_pnl: 0.0,
            closed_qty: 0,
        }
    }

    /// Initial risk per unit — the R the trail ladder is denominated in.
    pub fn r_unit(&self) -> f64 {
        (self.entry_price - self.initial_stop).abs()
    }

    /// Signed pnl of a quantity closed at `price`.
    pub fn pnl_at(&self, price: f64, quantity: i64) -> f64 {
        self.direction.sign() * (price - self.entry_price) * quantity as f64
    }

    /// PnL expressed in R units; zero when the stop was degenerate.
    pub fn r_multiple(&self, total_pnl: f64) -> f64 {
        let total_qty = self.position_size + self.closed_qty;
        let risk = self.r_unit() * total_qty as f64;
        if risk.abs() < f64::EPSILON {
            return 0.0;
        }
        total_pnl / risk
    }

    /// Adopt the actual entry fill: filled quantity and average price are
    /// authoritative from here on.
    pub fn apply_entry_fill(&mut self, filled_qty: i64, avg_price: f64, at: DateTime<Utc>) {
        self.position_size = filled_qty;
        if avg_price > 0.0 {
            self.entry_price = avg_price;
        }
        self.entry_time = Some(at);
        self.high_since_entry = self.entry_price;
        self.low_since_entry = self.entry_price;
        self.status = TradeStatus::Active;
    }

    // -------------------------------------------------------------------------
    // Per-bar evolution
    // -------------------------------------------------------------------------

    /// Fold a bar into the excursion extremes.
    pub fn observe_bar(&mut self, bar: &Candle) {
        if !self.status.is_managed() {
            return;
        }
        if bar.high > self.high_since_entry {
            self.high_since_entry = bar.high;
        }
        if bar.low < self.low_since_entry {
            self.low_since_entry = bar.low;
        }
    }

    /// Advance the trail ladder from the current excursion. The stage is
    /// monotonic and the stop only moves toward profit. Returns `true` when
    /// the stop moved.
    pub fn advance_trail(&mut self, stages: &[TrailStage]) -> bool {
        if !self.status.is_managed() || stages.is_empty() {
            return false;
        }
        let r = self.r_unit();
        if r < f64::EPSILON {
            return false;
        }

        let excursion_r = match self.direction {
            Direction::Bullish => (self.high_since_entry - self.entry_price) / r,
            Direction::Bearish => (self.entry_price - self.low_since_entry) / r,
        };

        let mut moved = false;
        for (idx, stage) in stages.iter().enumerate() {
            let stage_no = (idx + 1) as u8;
            if excursion_r < stage.trigger_r || stage_no <= self.trail_stage {
                continue;
            }

            let candidate = match self.direction {
                Direction::Bullish => self.entry_price + stage.stop_r * r,
                Direction::Bearish => self.entry_price - stage.stop_r * r,
            };

            let improved = match self.direction {
                Direction::Bullish => candidate > self.stop_loss,
                Direction::Bearish => candidate < self.stop_loss,
            };
            if improved {
                self.stop_loss = candidate;
                self.trailing_stop = Some(candidate);
                moved = true;
            }
            self.trail_stage = stage_no;
        }
        moved
    }

    /// Detect an exit on this bar. The tie-break is conservative: when both
    /// the stop and a target lie inside the bar's range, the stop wins.
    pub fn check_exit(&self, bar: &Candle) -> Option<ExitTrigger> {
        if !self.status.is_managed() {
            return None;
        }

        let stop_hit = match self.direction {
            Direction::Bullish => bar.low <= self.stop_loss,
            Direction::Bearish => bar.high >= self.stop_loss,
        };
        if stop_hit {
            return Some(ExitTrigger {
                reason: ExitReason::StopLoss,
                level: self.stop_loss,
            });
        }

        // After a partial TP1 the remainder runs for target2 (when present).
        if self.status == TradeStatus::PartialExit {
            if let Some(t2) = self.target2 {
                let t2_hit = match self.direction {
                    Direction::Bullish => bar.high >= t2,
                    Direction::Bearish => bar.low <= t2,
                };
                if t2_hit {
                    return Some(ExitTrigger {
                        reason: ExitReason::Target2,
                        level: t2,
                    });
                }
            }
            return None;
        }

        let t1_hit = match self.direction {
            Direction::Bullish => bar.high >= self.target1,
            Direction::Bearish => bar.low <= self.target1,
        };
        if t1_hit && !self.target1_hit {
            return Some(ExitTrigger {
                reason: ExitReason::Target1,
                level: self.target1,
            });
        }

        None
    }

    // -------------------------------------------------------------------------
    // Exit bookkeeping
    // -------------------------------------------------------------------------

    /// Book a verified partial exit: quantity leaves the position, pnl is
    /// accumulated, the stop moves to breakeven, and the remainder keeps
    /// running in `PartialExit`.
    pub fn apply_partial_exit_fill(&mut self, filled_qty: i64, avg_price: f64) -> f64 {
        let qty = filled_qty.min(self.position_size);
        let pnl = self.pnl_at(avg_price, qty);
        self.position_size -= qty;
        self.closed_qty += qty;
        self.realized_pnl += pnl;
        self.target1_hit = true;
        // Stop to breakeven, never backward past a trail that already
        // advanced beyond it.
        self.stop_loss = match self.direction {
            Direction::Bullish => self.stop_loss.max(self.entry_price),
            Direction::Bearish => self.stop_loss.min(self.entry_price),
        };
        self.trailing_stop = Some(self.stop_loss);
        self.trail_stage = self.trail_stage.max(1);
        self.status = TradeStatus::PartialExit;
        self.pending_exit = None;
        self.exit_order_id = None;
        pnl
    }

    /// Book a verified full exit and return the pnl of this final fill.
    pub fn apply_exit_fill(
        &mut self,
        reason: ExitReason,
        filled_qty: i64,
        avg_price: f64,
        at: DateTime<Utc>,
    ) -> f64 {
        let qty = if filled_qty > 0 { filled_qty } else { self.position_size };
        let pnl = self.pnl_at(avg_price, qty.min(self.position_size));
        self.realized_pnl += pnl;
        self.closed_qty += qty.min(self.position_size);
        self.position_size = 0;
        if reason == ExitReason::Target1 {
            self.target1_hit = true;
        }
        if reason == ExitReason::Target2 {
            self.target2_hit = true;
        }
        self.exit_reason = Some(reason);
        self.exit_price = avg_price;
        self.exit_time = Some(at);
        self.status = TradeStatus::Completed;
        self.pending_exit = None;
        pnl
    }

    /// Maximum favorable / adverse excursion in price terms.
    pub fn excursions(&self) -> (f64, f64) {
        match self.direction {
            Direction::Bullish => (
                self.high_since_entry - self.entry_price,
                self.entry_price - self.low_since_entry,
            ),
            Direction::Bearish => (
                self.entry_price - self.low_since_entry,
                self.high_since_entry - self.entry_price,
            ),
        }
    }
}
