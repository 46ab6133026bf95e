// =============================================================================
// Risk Policy — per-signal validation and portfolio gates
// =============================================================================
//
// Per-signal rules run twice: once at ingress against the signal's own
// levels, and again just before entry submission against the current price.
// Portfolio gates run only at submission. Every refusal emits a RiskEvent;
// limits also emit threshold-crossing events at 70% (WARNING) and 90%
// (CRITICAL).
//
// Broker failures are tracked in a sliding window; three within sixty
// seconds trip the circuit breaker even though a single failure never does.
// =============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::portfolio::PortfolioState;
use crate::runtime_config::RuntimeConfig;
use crate::signal::RiskEvent;
use crate::types::{Direction, Severity};

/// Relative slack on the stop-distance cap, absorbing producer rounding of
/// stop levels (a stop published as "2.02%" of entry must not bounce off the
/// 2% cap).
const STOP_DISTANCE_SLACK: f64 = 1.02;

/// Threshold fractions for crossing events.
const WARN_THRESHOLD: f64 = 0.70;
const CRITICAL_THRESHOLD: f64 = 0.90;

pub struct RiskPolicy {
    events: mpsc::UnboundedSender<RiskEvent>,
    broker_failures: Mutex<VecDeque<DateTime<Utc>>>,
}

impl RiskPolicy {
    pub fn new(events: mpsc::UnboundedSender<RiskEvent>) -> Self {
        Self {
            events,
            broker_failures: Mutex::new(VecDeque::new()),
        }
    }

    fn emit(&self, event: RiskEvent) {
        let _ = self.events.send(event);
    }

    fn refuse(&self, scope: &str, err: &EngineError, severity: Severity) {
        self.emit(RiskEvent::new(err.code(), severity, scope, err.to_string()));
    }

    // -------------------------------------------------------------------------
    // Per-signal validation
    // -------------------------------------------------------------------------

    /// Validate a signal's levels. `entry` is the signal entry at ingress and
    /// the current price at re-validation before submission.
    pub fn validate_signal(
        &self,
        config: &RuntimeConfig,
        scrip_code: &str,
        direction: Direction,
        entry: f64,
        stop_loss: f64,
        target1: f64,
    ) -> Result<(), EngineError> {
        if entry <= 0.0 {
            let err = EngineError::ValidationDirection(format!("non-positive entry {entry}"));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        // Direction consistency: stop < entry < target for bullish, reversed
        // for bearish.
        let ordered = match direction {
            Direction::Bullish => stop_loss < entry && entry < target1,
            Direction::Bearish => target1 < entry && entry < stop_loss,
        };
        if !ordered {
            let err = EngineError::ValidationDirection(format!(
                "{direction} levels inconsistent: stop={stop_loss} entry={entry} target={target1}"
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        let move_frac = (target1 - entry).abs() / entry;
        if move_frac < config.min_move {
            let err = EngineError::ValidationMinMove(format!(
                "{:.2}% move below the {:.2}% minimum",
                move_frac * 100.0,
                config.min_move * 100.0
            ));
            self.refuse(scrip_code, &err, Severity::Info);
            return Err(err);
        }

        let stop_frac = (entry - stop_loss).abs() / entry;
        if stop_frac > config.max_stop_distance * STOP_DISTANCE_SLACK {
            let err = EngineError::ValidationStopTooFar(format!(
                "{:.2}% stop beyond the {:.2}% maximum",
                stop_frac * 100.0,
                config.max_stop_distance * 100.0
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        let stop_dist = (entry - stop_loss).abs().max(f64::EPSILON);
        let rr = (target1 - entry).abs() / stop_dist;
        let min_rr = config.effective_min_rr();
        if rr < min_rr {
            let err = EngineError::ValidationMinRr(format!(
                "R:R {rr:.2} below the {min_rr:.2} minimum"
            ));
            self.refuse(scrip_code, &err, Severity::Info);
            return Err(err);
        }

        debug!(
            scrip = %scrip_code,
            %direction,
            move_pct = move_frac * 100.0,
            stop_pct = stop_frac * 100.0,
            rr,
            "signal passed validation"
        );
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Portfolio gates
    // -------------------------------------------------------------------------

    /// Size-independent gates: circuit breaker and concurrent position count.
    /// Checked before the sizer runs.
    pub fn check_entry_pregates(
        &self,
        config: &RuntimeConfig,
        portfolio: &PortfolioState,
        scrip_code: &str,
    ) -> Result<(), EngineError> {
        if portfolio.circuit_breaker_tripped {
            let reason = portfolio
                .circuit_breaker_reason
                .clone()
                .unwrap_or_else(|| "tripped".to_string());
            let err = EngineError::RiskCircuitBreaker(reason);
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        if portfolio.open_positions_count >= config.max_concurrent_positions {
            let err = EngineError::RiskBlocked(format!(
                "{} open positions at the {} cap",
                portfolio.open_positions_count, config.max_concurrent_positions
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        Ok(())
    }

    /// Size-dependent gates, checked after the sizer: per-trade risk,
    /// portfolio exposure, and instrument concentration.
    pub fn check_entry_sized(
        &self,
        config: &RuntimeConfig,
        portfolio: &PortfolioState,
        scrip_code: &str,
        entry: f64,
        stop_loss: f64,
        size: i64,
    ) -> Result<(), EngineError> {
        let account = portfolio.account_value;
        let trade_risk = (entry - stop_loss).abs() * size as f64;
        let risk_limit = config.max_position_risk * account;

        if trade_risk > risk_limit {
            let err = EngineError::RiskBlocked(format!(
                "per-trade risk {trade_risk:.2} above limit {risk_limit:.2}"
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }
        self.emit_threshold("RISK_PER_TRADE", scrip_code, trade_risk, risk_limit);

        let candidate_notional = entry * size as f64;
        let exposure = portfolio.total_exposure() + candidate_notional;
        let exposure_limit = config.max_exposure_pct * account;

        if exposure > exposure_limit {
            let err = EngineError::RiskBlocked(format!(
                "exposure {exposure:.2} above limit {exposure_limit:.2}"
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }
        self.emit_threshold("RISK_EXPOSURE", scrip_code, exposure, exposure_limit);

        let instrument_exposure = portfolio
            .exposure_by_instrument
            .get(scrip_code)
            .copied()
            .unwrap_or(0.0)
            + candidate_notional;
        let share = if exposure > 0.0 {
            instrument_exposure / exposure
        } else {
            0.0
        };
        if share > config.max_instrument_share {
            let err = EngineError::RiskBlocked(format!(
                "instrument share {:.1}% above the {:.1}% cap",
                share * 100.0,
                config.max_instrument_share * 100.0
            ));
            self.refuse(scrip_code, &err, Severity::Warning);
            return Err(err);
        }

        Ok(())
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    /// Reason the breaker should trip given the current portfolio and
    /// unrealized pnl, or `None` while within limits. Emits threshold events
    /// on the way up.
    pub fn evaluate_breaker(
        &self,
        config: &RuntimeConfig,
        portfolio: &PortfolioState,
        unrealized_pnl: f64,
    ) -> Option<String> {
        let loss = portfolio.session_loss_fraction(unrealized_pnl);
        self.emit_threshold("RISK_DAILY_LOSS", "wallet", loss, config.max_daily_loss);
        if loss >= config.max_daily_loss {
            return Some(format!(
                "daily loss {:.2}% at the {:.2}% limit",
                loss * 100.0,
                config.max_daily_loss * 100.0
            ));
        }

        let drawdown = portfolio.drawdown();
        self.emit_threshold("RISK_DRAWDOWN", "wallet", drawdown, config.max_drawdown);
        if drawdown >= config.max_drawdown {
            return Some(format!(
                "drawdown {:.2}% at the {:.2}% limit",
                drawdown * 100.0,
                config.max_drawdown * 100.0
            ));
        }

        None
    }

    fn emit_threshold(&self, event_type: &str, scope: &str, current: f64, limit: f64) {
        if limit <= 0.0 || current >= limit {
            return;
        }
        let fraction = current / limit;
        let severity = if fraction >= CRITICAL_THRESHOLD {
            Severity::Critical
        } else if fraction >= WARN_THRESHOLD {
            Severity::Warning
        } else {
            return;
        };

        self.emit(
            RiskEvent::new(
                event_type,
                severity,
                scope,
                format!("{event_type} at {:.0}% of limit", fraction * 100.0),
            )
            .with_values(current, limit),
        );
    }

    // -------------------------------------------------------------------------
    // Broker failure tracking
    // -------------------------------------------------------------------------

    /// Record a broker failure. Returns `true` when the failure count within
    /// the configured window reaches the trip threshold.
    pub fn record_broker_failure(&self, config: &RuntimeConfig, now: DateTime<Utc>) -> bool {
        let window = chrono::Duration::seconds(config.broker_failure_window_secs as i64);
        let mut failures = self.broker_failures.lock();
        failures.push_back(now);
        while let Some(&front) = failures.front() {
            if now - front > window {
                failures.pop_front();
            } else {
                break;
            }
        }
        let tripped = failures.len() as u32 >= config.broker_failure_trip_count;
        if tripped {
            warn!(
                count = failures.len(),
                window_secs = config.broker_failure_window_secs,
                "consecutive broker failures at trip threshold"
            );
        }
        tripped
    }

    /// A broker success resets the consecutive-failure streak.
    pub fn record_broker_success(&self) {
        self.broker_failures.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn policy() -> (RiskPolicy, mpsc::UnboundedReceiver<RiskEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RiskPolicy::new(tx), rx)
    }

    fn portfolio() -> PortfolioState {
        PortfolioState::new(1_000_000.0, NaiveDate::from_ymd_opt(2026, 8, 3).unwrap())
    }

    fn cfg() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn scenario_stop_too_far_rejected() {
        let (p, mut rx) = policy();
        // entry=7.90, stop=7.70 => 2.53% distance.
        let err = p
            .validate_signal(&cfg(), "114311", Direction::Bullish, 7.90, 7.70, 8.20)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_STOP_TOO_FAR");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, "VALIDATION_STOP_TOO_FAR");
        assert_eq!(event.severity, Severity::Warning);
    }

    #[test]
    fn scenario_signal_stop_at_two_point_oh_two_percent_passes() {
        let (p, _rx) = policy();
        // entry=7.90, stop=7.74 — published as a 2.02% stop. Producer
        // rounding must not bounce off the 2% cap.
        assert!(p
            .validate_signal(&cfg(), "114311", Direction::Bullish, 7.90, 7.74, 8.20)
            .is_ok());
    }

    #[test]
    fn scenario_poor_rr_rejected() {
        let (p, _rx) = policy();
        // entry=10.00, stop=9.50, target=10.50 => R:R 1.0.
        let err = p
            .validate_signal(&cfg(), "x", Direction::Bullish, 10.00, 9.50, 10.50)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_MIN_RR");
    }

    #[test]
    fn boundary_min_move_exactly_two_percent_passes() {
        let (p, _rx) = policy();
        // entry=100, target=102 => exactly 2% move; stop=98.7 => 1.3% and RR ~1.54.
        assert!(p
            .validate_signal(&cfg(), "x", Direction::Bullish, 100.0, 98.7, 102.0)
            .is_ok());
    }

    #[test]
    fn boundary_rr_exactly_one_point_five_passes() {
        let (p, _rx) = policy();
        // stop 1.0 below, target 1.5 above => RR exactly 1.5. Move 1.5% fails
        // min_move though, so scale: entry=100, stop=98, target=103 => RR 1.5, move 3%.
        assert!(p
            .validate_signal(&cfg(), "x", Direction::Bullish, 100.0, 98.0, 103.0)
            .is_ok());
    }

    #[test]
    fn safe_reset_raises_rr_floor() {
        let (p, _rx) = policy();
        let mut config = cfg();
        config.safe_reset = true;
        // RR 1.5 no longer clears the 2.0 floor.
        let err = p
            .validate_signal(&config, "x", Direction::Bullish, 100.0, 98.0, 103.0)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_MIN_RR");
    }

    #[test]
    fn direction_inconsistency_rejected() {
        let (p, _rx) = policy();
        let err = p
            .validate_signal(&cfg(), "x", Direction::Bearish, 100.0, 98.0, 103.0)
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_DIRECTION");
    }

    #[test]
    fn breaker_blocks_pregates() {
        let (p, mut rx) = policy();
        let mut port = portfolio();
        port.trip_breaker("daily loss".into());

        let err = p.check_entry_pregates(&cfg(), &port, "x").unwrap_err();
        assert_eq!(err.code(), "RISK_CIRCUIT_BREAKER");
        assert_eq!(rx.try_recv().unwrap().event_type, "RISK_CIRCUIT_BREAKER");
    }

    #[test]
    fn position_cap_blocks_second_entry() {
        let (p, _rx) = policy();
        let mut port = portfolio();
        port.apply_entry("114311", "s", 78_000.0);

        let err = p.check_entry_pregates(&cfg(), &port, "500325").unwrap_err();
        assert_eq!(err.code(), "RISK_BLOCKED");
    }

    #[test]
    fn per_trade_risk_gate() {
        let (p, _rx) = policy();
        let port = portfolio();
        // risk = 0.16 * 100_000 = 16_000 > 1% of 1M.
        let err = p
            .check_entry_sized(&cfg(), &port, "x", 7.90, 7.74, 100_000)
            .unwrap_err();
        assert_eq!(err.code(), "RISK_BLOCKED");
        // A sane size passes.
        assert!(p
            .check_entry_sized(&cfg(), &port, "x", 7.90, 7.74, 10_000)
            .is_ok());
    }

    #[test]
    fn exposure_gate_and_threshold_events() {
        let (p, mut rx) = policy();
        let port = portfolio();
        // Exposure limit is 150k; 120k is an 80% crossing.
        assert!(p
            .check_entry_sized(&cfg(), &port, "x", 12.0, 11.9, 10_000)
            .is_ok());
        let mut saw_exposure_warning = false;
        while let Ok(ev) = rx.try_recv() {
            if ev.event_type == "RISK_EXPOSURE" {
                assert_eq!(ev.severity, Severity::Warning);
                saw_exposure_warning = true;
            }
        }
        assert!(saw_exposure_warning);

        // 160k breaches the cap outright.
        let err = p
            .check_entry_sized(&cfg(), &port, "x", 16.0, 15.9, 10_000)
            .unwrap_err();
        assert_eq!(err.code(), "RISK_BLOCKED");
    }

    #[test]
    fn breaker_evaluation_daily_loss() {
        let (p, _rx) = policy();
        let mut port = portfolio();
        port.apply_entry("a", "s", 10_000.0);
        port.apply_exit("a", "s", -31_000.0);

        let reason = p.evaluate_breaker(&cfg(), &port, 0.0);
        assert!(reason.unwrap().contains("daily loss"));
    }

    #[test]
    fn breaker_counts_unrealized() {
        let (p, _rx) = policy();
        let mut port = portfolio();
        port.apply_entry("a", "s", 10_000.0);
        port.apply_exit("a", "s", -15_000.0);

        assert!(p.evaluate_breaker(&cfg(), &port, 0.0).is_none());
        assert!(p.evaluate_breaker(&cfg(), &port, -16_000.0).is_some());
    }

    #[test]
    fn broker_failures_trip_within_window() {
        let (p, _rx) = policy();
        let config = cfg();
        let t0 = Utc::now();

        assert!(!p.record_broker_failure(&config, t0));
        assert!(!p.record_broker_failure(&config, t0 + chrono::Duration::seconds(10)));
        assert!(p.record_broker_failure(&config, t0 + chrono::Duration::seconds(20)));
    }

    #[test]
    fn broker_failures_age_out_and_reset() {
        let (p, _rx) = policy();
        let config = cfg();
        let t0 = Utc::now();

        assert!(!p.record_broker_failure(&config, t0));
        assert!(!p.record_broker_failure(&config, t0 + chrono::Duration::seconds(10)));
        // Third failure arrives after the first aged out.
        assert!(!p.record_broker_failure(&config, t0 + chrono::Duration::seconds(75)));

        p.record_broker_success();
        assert!(!p.record_broker_failure(&config, t0 + chrono::Duration::seconds(80)));
    }
}
