// =============================================================================
// Portfolio State — account value, exposure, and the circuit-breaker latch
// =============================================================================
//
// Mutated only under the position manager's single-writer discipline; the
// risk monitor and admin surface read snapshots. `peak_value` is monotonic
// non-decreasing within a session and resets on session roll.
// =============================================================================

use std::collections::HashMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioState {
    pub account_value: f64,
    pub peak_value: f64,
    pub daily_realized_pnl: f64,
    pub session_date: NaiveDate,
    pub session_start_value: f64,
    pub open_positions_count: u32,
    pub exposure_by_instrument: HashMap<String, f64>,
    pub exposure_by_strategy: HashMap<String, f64>,
    pub circuit_breaker_tripped: bool,
    pub circuit_breaker_reason: Option<String>,
}

impl PortfolioState {
    pub fn new(account_value: f64, session_date: NaiveDate) -> Self {
        Self {
            account_value,
            peak_value: account_value,
            daily_realized_pnl: 0.0,
            session_date,
            session_start_value: account_value,
            open_positions_count: 0,
            exposure_by_instrument: HashMap::new(),
            exposure_by_strategy: HashMap::new(),
            circuit_breaker_tripped: false,
            circuit_breaker_reason: None,
        }
    }

    /// Total notional across open positions.
    pub fn total_exposure(&self) -> f64 {
        self.exposure_by_instrument.values().sum()
    }

    /// Drawdown from the session peak as a fraction of the peak.
    pub fn drawdown(&self) -> f64 {
        if self.peak_value <= 0.0 {
            return 0.0;
        }
        ((self.peak_value - self.account_value) / self.peak_value).max(0.0)
    }

    /// Session loss (realized plus the supplied unrealized) as a fraction of
    /// the session-start account value. Positive means losing.
    pub fn session_loss_fraction(&self, unrealized_pnl: f64) -> f64 {
        if self.session_start_value <= 0.0 {
            return 0.0;
        }
        (-(self.daily_realized_pnl + unrealized_pnl) / self.session_start_value).max(0.0)
    }

    /// Record an entry fill: exposure appears, position count rises.
    pub fn apply_entry(&mut self, scrip_code: &str, strategy: &str, notional: f64) {
        *self
            .exposure_by_instrument
            .entry(scrip_code.to_string())
            .or_insert(0.0) += notional;
        *self
            .exposure_by_strategy
            .entry(strategy.to_string())
            .or_insert(0.0) += notional;
        self.open_positions_count += 1;

        info!(
            scrip = %scrip_code,
            notional,
            exposure = self.total_exposure(),
            open = self.open_positions_count,
            "portfolio entry applied"
        );
    }

    /// Release part of a position's exposure without closing it (partial
    /// exit). Realized pnl from the closed portion is booked immediately.
    pub fn apply_partial_exit(
        &mut self,
        scrip_code: &str,
        strategy: &str,
        released_notional: f64,
        pnl: f64,
    ) {
        self.release_exposure(scrip_code, strategy, released_notional);
        self.book_pnl(pnl);
    }

    /// Record a full exit: exposure released, pnl booked, count drops.
    pub fn apply_exit(&mut self, scrip_code: &str, strategy: &str, pnl: f64) {
        self.exposure_by_instrument.remove(scrip_code);
        self.exposure_by_strategy.remove(strategy);
        self.open_positions_count = self.open_positions_count.saturating_sub(1);
        self.book_pnl(pnl);

        info!(
            scrip = %scrip_code,
            pnl,
            account_value = self.account_value,
            daily_realized = self.daily_realized_pnl,
            "portfolio exit applied"
        );
    }

    fn release_exposure(&mut self, scrip_code: &str, strategy: &str, notional: f64) {
        if let Some(v) = self.exposure_by_instrument.get_mut(scrip_code) {
            *v = (*v - notional).max(0.0);
        }
        if let Some(v) = self.exposure_by_strategy.get_mut(strategy) {
            *v = (*v - notional).max(0.0);
        }
    }

    fn book_pnl(&mut self, pnl: f64) {
        self.daily_realized_pnl += pnl;
        self.account_value += pnl;
        if self.account_value > self.peak_value {
            self.peak_value = self.account_value;
        }
    }

    pub fn trip_breaker(&mut self, reason: String) {
        if !self.circuit_breaker_tripped {
            warn!(reason = %reason, "circuit breaker tripped");
        }
        self.circuit_breaker_tripped = true;
        self.circuit_breaker_reason = Some(reason);
    }

    pub fn reset_breaker(&mut self) {
        if self.circuit_breaker_tripped {
            info!("circuit breaker reset");
        }
        self.circuit_breaker_tripped = false;
        self.circuit_breaker_reason = None;
    }

    /// Roll to a new session date: daily counters reset, peak re-anchors,
    /// the breaker clears.
    pub fn roll_session(&mut self, date: NaiveDate) {
        if date == self.session_date {
            return;
        }
        info!(
            old = %self.session_date,
            new = %date,
            "session rolled — resetting daily portfolio counters"
        );
        self.session_date = date;
        self.session_start_value = self.account_value;
        self.peak_value = self.account_value;
        self.daily_realized_pnl = 0.0;
        self.reset_breaker();
    }
}
