// =============================================================================
// Position Sizer — risk-based quantity with confidence and liquidity scaling
// =============================================================================
//
// Base size risks a fixed fraction of the account between entry and stop,
// then three multipliers apply in order: model confidence, microstructure
// liquidity, and the signal's own multiplier. The result is capped by the
// per-position notional limit and rounded down to the instrument lot.
// =============================================================================

use tracing::debug;

use crate::runtime_config::RuntimeConfig;
use crate::signal::StrategySignal;

/// Bounds on the microstructure multiplier.
const MICRO_MIN: f64 = 0.5;
const MICRO_MAX: f64 = 1.5;

/// Bounds on the signal-provided multiplier.
const SIGNAL_MULT_MIN: f64 = 0.5;
const SIGNAL_MULT_MAX: f64 = 2.0;

pub struct PositionSizer;

impl PositionSizer {
    /// Quantity for a trade entered at `entry` with `stop_loss`, using the
    /// signal's confidence and liquidity fields. Returns 0 when the trade is
    /// unsizeable (degenerate stop, notional cap below one lot).
    pub fn size(
        config: &RuntimeConfig,
        signal: &StrategySignal,
        account_value: f64,
        entry: f64,
        stop_loss: f64,
        lot_size: i64,
    ) -> i64 {
        let stop_distance = (entry - stop_loss).abs();
        if stop_distance <= f64::EPSILON || entry <= 0.0 || account_value <= 0.0 {
            return 0;
        }

        let base_risk = account_value * config.risk_per_trade;
        let raw = (base_risk / stop_distance).floor();

        // Confidence: 0.5x at zero confidence, 1.0x at full.
        let confidence = signal
            .ml_confidence
            .unwrap_or(signal.confidence)
            .clamp(0.0, 1.0);
        let confidence_mult = 0.5 + 0.5 * confidence;

        // Microstructure: liquid books size up, toxic ones size down.
        let micro_mult = signal
            .microstructure_liquidity
            .map(|liq| (MICRO_MIN + liq).clamp(MICRO_MIN, MICRO_MAX))
            .unwrap_or(1.0);

        let signal_mult = signal
            .position_size_multiplier
            .map(|m| m.clamp(SIGNAL_MULT_MIN, SIGNAL_MULT_MAX))
            .unwrap_or(1.0);

        let mut size = (raw * confidence_mult * micro_mult * signal_mult).floor();

        // Notional cap.
        let max_by_value = (config.max_position_value / entry).floor();
        if size > max_by_value {
            size = max_by_value;
        }

        // Lot rounding, never negative.
        let lot = lot_size.max(1);
        let mut qty = size.max(0.0) as i64;
        qty -= qty % lot;

        debug!(
            scrip = %signal.scrip_code,
            raw,
            confidence_mult,
            micro_mult,
            signal_mult,
            qty,
            "position sized"
        );

        qty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::SignalAction;
    use chrono::Utc;

    fn signal() -> StrategySignal {
        StrategySignal {
            signal_id: Some("s".into()),
            scrip_code: "114311".into(),
            company_name: "TEST".into(),
            signal: SignalAction::Buy,
            entry_price: 7.90,
            stop_loss: 7.74,
            target1: 8.20,
            target2: None,
            target3: None,
            confidence: 0.8,
            ml_confidence: None,
            volatility: None,
            microstructure_liquidity: None,
            position_size_multiplier: None,
            exchange: None,
            exchange_type: None,
            order_scrip_code: None,
            order_exchange: None,
            order_exchange_type: None,
            order_limit_price_entry: None,
            order_limit_price_exit: None,
            order_tick_size: None,
            order_lot_size: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn cfg() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    #[test]
    fn base_risk_drives_size() {
        // base risk 10_000, stop distance 0.16 => raw 62_500; confidence 0.8
        // => 0.9x => 56_250; notional cap 150_000/7.90 = 18_987 binds.
        let qty = PositionSizer::size(&cfg(), &signal(), 1_000_000.0, 7.90, 7.74, 1);
        assert_eq!(qty, 18_987);
    }

    #[test]
    fn confidence_scales_down() {
        let mut sig = signal();
        sig.ml_confidence = Some(0.0);
        let full = PositionSizer::size(&cfg(), &signal(), 100_000.0, 7.90, 7.74, 1);
        let half = PositionSizer::size(&cfg(), &sig, 100_000.0, 7.90, 7.74, 1);
        // 0.5x multiplier vs 0.9x.
        assert!(half < full);
        assert!((half as f64 / (100_000.0 * 0.01 / 0.16)) - 0.5 < 0.01);
    }

    #[test]
    fn microstructure_and_signal_multipliers_clamp() {
        let mut sig = signal();
        sig.ml_confidence = Some(1.0);
        sig.microstructure_liquidity = Some(5.0); // clamps to 1.5
        sig.position_size_multiplier = Some(10.0); // clamps to 2.0
        let qty = PositionSizer::size(&cfg(), &sig, 100_000.0, 100.0, 99.0, 1);
        // base 1000; 1.0 * 1.5 * 2.0 = 3000, capped at 150_000/100 = 1500.
        assert_eq!(qty, 1500);
    }

    #[test]
    fn lot_rounding_rounds_down() {
        let mut sig = signal();
        sig.ml_confidence = Some(1.0);
        let qty = PositionSizer::size(&cfg(), &sig, 100_000.0, 100.0, 99.0, 75);
        assert_eq!(qty % 75, 0);
        assert!(qty <= 1000);
        assert!(qty > 0);
    }

    #[test]
    fn degenerate_stop_sizes_zero() {
        assert_eq!(
            PositionSizer::size(&cfg(), &signal(), 100_000.0, 7.90, 7.90, 1),
            0
        );
    }

    #[test]
    fn lot_bigger_than_size_yields_zero() {
        let qty = PositionSizer::size(&cfg(), &signal(), 1_000.0, 100.0, 99.0, 75);
        // base risk 10 / 1.0 = 10 shares, below one lot of 75.
        assert_eq!(qty, 0);
    }
}
