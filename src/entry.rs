// =============================================================================
// Entry Evaluator — breach/reclaim, volume, and pattern confirmation
// =============================================================================
//
// Stateless over its inputs: the caller owns the breach flag on the pending
// signal and the candle history. Four predicates must hold on one candle for
// READY:
//
//   1. Golden window  — the candle's wall-clock lies in an entry window.
//   2. Pivot retest   — a recorded breach of the daily pivot followed by a
//                       close back across it (breach and reclaim may be the
//                       same candle when both conditions hold on it).
//   3. Volume         — candle volume above the tail-N prior mean by the
//                       configured factor; insufficient history passes.
//   4. Pattern        — engulfing of the previous candle in the trade
//                       direction.
//
// READY yields the confirmation stop/target and the risk/reward used to rank
// candidates.
// =============================================================================

use serde::Serialize;

use crate::market_data::Candle;
use crate::pivots::PivotLevels;
use crate::signal::PendingSignal;
use crate::types::Direction;

/// Guard against division by a degenerate stop distance.
const MIN_STOP_DISTANCE: f64 = 1e-6;

/// Stop offset applied beyond the confirmation candle's extreme.
const STOP_BUFFER: f64 = 0.001;

/// Computed at READY: the prices the trade would be entered with.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryReadiness {
    /// Close of the confirmation candle — the working entry price.
    pub confirm_price: f64,
    pub stop_loss: f64,
    pub target: f64,
    pub potential_rr: f64,
}

/// Outcome of evaluating one candle against one pending signal.
#[derive(Debug, Clone)]
pub struct EntryEvaluation {
    /// This candle breached the daily pivot (caller records it on the
    /// pending signal).
    pub breach_now: bool,
    pub ready: Option<EntryReadiness>,
    /// Why the signal is not ready, for the decision log.
    pub reject: Option<&'static str>,
}

impl EntryEvaluation {
    fn not_ready(breach_now: bool, reason: &'static str) -> Self {
        Self {
            breach_now,
            ready: None,
            reject: Some(reason),
        }
    }
}

pub struct EntryEvaluator {
    pub volume_factor: f64,
    pub volume_lookback: usize,
}

impl EntryEvaluator {
    pub fn new(volume_factor: f64, volume_lookback: usize) -> Self {
        Self {
            volume_factor,
            volume_lookback,
        }
    }

    /// Evaluate `candle` for `pending`.
    ///
    /// `prev_candle` is the candle immediately before this one,
    /// `volume_mean` the `(mean, count)` of prior-candle volumes, and
    /// `in_golden_window` whether the candle's wall-clock permits entries.
    pub fn evaluate(
        &self,
        pending: &PendingSignal,
        candle: &Candle,
        prev_candle: Option<&Candle>,
        levels: &PivotLevels,
        volume_mean: Option<(f64, usize)>,
        in_golden_window: bool,
    ) -> EntryEvaluation {
        let direction = pending.direction;
        let pivot = levels.pivot;

        // Breach is tracked even outside golden windows so a retest seen at
        // 11:40 still counts for a 13:35 reclaim.
        let breach_now = match direction {
            Direction::Bullish => candle.low <= pivot,
            Direction::Bearish => candle.high >= pivot,
        };

        if !in_golden_window {
            return EntryEvaluation::not_ready(breach_now, "outside golden window");
        }

        // Pivot retest: breach then reclaim.
        let breach_recorded = pending.breach_candle_start_ms.is_some() || breach_now;
        if !breach_recorded {
            return EntryEvaluation::not_ready(breach_now, "no pivot breach yet");
        }

        let reclaim = match direction {
            Direction::Bullish => candle.close > pivot,
            Direction::Bearish => candle.close < pivot,
        };
        if !reclaim {
            return EntryEvaluation::not_ready(breach_now, "pivot not reclaimed");
        }

        // Volume profile: neutral pass on insufficient history.
        if let Some((mean, count)) = volume_mean {
            if count >= self.volume_lookback && candle.volume <= mean * self.volume_factor {
                return EntryEvaluation::not_ready(breach_now, "volume below profile");
            }
        }

        // Candle pattern: engulfing in the trade direction.
        let Some(prev) = prev_candle else {
            return EntryEvaluation::not_ready(breach_now, "no previous candle");
        };
        if !Self::is_engulfing(prev, candle, direction) {
            return EntryEvaluation::not_ready(breach_now, "no engulfing pattern");
        }

        // All four predicates hold — compute the entry levels.
        let stop_loss = match direction {
            Direction::Bullish => candle.low * (1.0 - STOP_BUFFER),
            Direction::Bearish => candle.high * (1.0 + STOP_BUFFER),
        };

        let Some(target) = levels.next_logical_pivot(candle.close, direction) else {
            return EntryEvaluation::not_ready(breach_now, "no pivot target beyond close");
        };

        let stop_distance = (candle.close - stop_loss).abs().max(MIN_STOP_DISTANCE);
        let potential_rr = (target - candle.close).abs() / stop_distance;

        EntryEvaluation {
            breach_now,
            ready: Some(EntryReadiness {
                confirm_price: candle.close,
                stop_loss,
                target,
                potential_rr,
            }),
            reject: None,
        }
    }

    fn is_engulfing(prev: &Candle, curr: &Candle, direction: Direction) -> bool {
        match direction {
            Direction::Bullish => {
                prev.is_bearish()
                    && curr.is_bullish()
                    && curr.close >= prev.open
                    && curr.open <= prev.close
            }
            Direction::Bearish => {
                prev.is_bullish()
                    && curr.is_bearish()
                    && curr.close <= prev.open
                    && curr.open >= prev.close
            }
        }
    }
}

/// Pick the best READY candidate: largest risk/reward, ties broken by earliest
/// admission, then lexicographic scrip code.
pub fn select_best(
    mut candidates: Vec<(PendingSignal, EntryReadiness)>,
) -> Option<(PendingSignal, EntryReadiness)> {
    candidates.sort_by(|(a_sig, a), (b_sig, b)| {
        b.potential_rr
            .partial_cmp(&a.potential_rr)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a_sig.admitted_at.cmp(&b_sig.admitted_at))
            .then(a_sig.scrip_code().cmp(b_sig.scrip_code()))
    });
    candidates.into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pivots::sample_levels;
    use crate::signal::{SignalAction, StrategySignal};
    use chrono::Utc;

    fn candle(start_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            scrip_code: "114311".into(),
            window_start_ms: start_ms,
            window_end_ms: start_ms + 60_000,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    fn pending(action: SignalAction) -> PendingSignal {
        let sig = StrategySignal {
            signal_id: Some("s".into()),
            scrip_code: "114311".into(),
            company_name: "TEST".into(),
            signal: action,
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
        };
        PendingSignal::new(sig, Utc::now(), chrono::Duration::minutes(45))
    }

    fn evaluator() -> EntryEvaluator {
        EntryEvaluator::new(1.2, 20)
    }

    /// The valid-bullish-entry scenario: breach and reclaim on the same
    /// candle, engulfing, volume 1.3x the mean.
    #[test]
    fn bullish_breach_reclaim_same_candle_goes_ready() {
        let levels = PivotLevels {
            pivot: 7.75,
            support: [7.65, 7.50, 7.35, 7.15],
            resistance: [8.20, 8.45, 8.70, 9.00],
        };
        let prev = candle(0, 7.87, 7.92, 7.82, 7.855, 1000.0); // bearish, engulfable
        let curr = candle(60_000, 7.85, 7.91, 7.72, 7.88, 1300.0); // low breaches 7.75, closes above

        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 20)),
            true,
        );

        assert!(eval.breach_now);
        let ready = eval.ready.expect("should be READY");
        assert!((ready.confirm_price - 7.88).abs() < 1e-9);
        assert!((ready.stop_loss - 7.72 * 0.999).abs() < 1e-9);
        assert!((ready.target - 8.20).abs() < 1e-9);
        assert!(ready.potential_rr > 1.5);
    }

    #[test]
    fn reclaim_without_breach_is_not_ready() {
        let levels = sample_levels(7.75);
        let prev = candle(0, 7.90, 7.92, 7.82, 7.84, 1000.0);
        // Low never touches the pivot.
        let curr = candle(60_000, 7.85, 7.91, 7.80, 7.88, 1300.0);

        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 20)),
            true,
        );
        assert!(!eval.breach_now);
        assert!(eval.ready.is_none());
        assert_eq!(eval.reject, Some("no pivot breach yet"));
    }

    #[test]
    fn recorded_breach_carries_across_candles() {
        let levels = PivotLevels {
            pivot: 7.75,
            support: [7.65, 7.50, 7.35, 7.15],
            resistance: [8.20, 8.45, 8.70, 9.00],
        };
        let mut p = pending(SignalAction::Buy);
        p.breach_candle_start_ms = Some(0);

        let prev = candle(60_000, 7.87, 7.92, 7.82, 7.855, 1000.0);
        let curr = candle(120_000, 7.85, 7.91, 7.80, 7.88, 1300.0); // no breach this candle

        let eval = evaluator().evaluate(&p, &curr, Some(&prev), &levels, Some((1000.0, 20)), true);
        assert!(eval.ready.is_some());
    }

    #[test]
    fn volume_below_profile_rejects() {
        let levels = sample_levels(7.75);
        let prev = candle(0, 7.90, 7.92, 7.82, 7.84, 1000.0);
        let curr = candle(60_000, 7.85, 7.91, 7.72, 7.88, 1100.0); // 1.1x < 1.2x

        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 20)),
            true,
        );
        assert_eq!(eval.reject, Some("volume below profile"));
    }

    #[test]
    fn short_history_passes_volume_neutrally() {
        let levels = PivotLevels {
            pivot: 7.75,
            support: [7.65, 7.50, 7.35, 7.15],
            resistance: [8.20, 8.45, 8.70, 9.00],
        };
        let prev = candle(0, 7.87, 7.92, 7.82, 7.855, 1000.0);
        let curr = candle(60_000, 7.85, 7.91, 7.72, 7.88, 500.0);

        // Only 5 prior candles — below the 20 lookback.
        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 5)),
            true,
        );
        assert!(eval.ready.is_some());
    }

    #[test]
    fn no_engulfing_rejects() {
        let levels = sample_levels(7.75);
        // Previous candle bullish — a bullish engulfing needs a bearish prev.
        let prev = candle(0, 7.80, 7.92, 7.78, 7.90, 1000.0);
        let curr = candle(60_000, 7.85, 7.91, 7.72, 7.88, 1300.0);

        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 20)),
            true,
        );
        assert_eq!(eval.reject, Some("no engulfing pattern"));
    }

    #[test]
    fn outside_golden_window_still_records_breach() {
        let levels = sample_levels(7.75);
        let curr = candle(60_000, 7.85, 7.91, 7.72, 7.88, 1300.0);

        let eval = evaluator().evaluate(
            &pending(SignalAction::Buy),
            &curr,
            None,
            &levels,
            None,
            false,
        );
        assert!(eval.breach_now);
        assert!(eval.ready.is_none());
        assert_eq!(eval.reject, Some("outside golden window"));
    }

    #[test]
    fn bearish_symmetry() {
        let levels = PivotLevels {
            pivot: 7.75,
            support: [7.40, 7.20, 7.00, 6.80],
            resistance: [7.90, 8.05, 8.20, 8.45],
        };
        let prev = candle(0, 7.70, 7.76, 7.68, 7.74, 1000.0); // bullish
        // High breaches the pivot from below, closes back under, engulfing.
        let curr = candle(60_000, 7.75, 7.78, 7.62, 7.65, 1400.0);

        let eval = evaluator().evaluate(
            &pending(SignalAction::Sell),
            &curr,
            Some(&prev),
            &levels,
            Some((1000.0, 20)),
            true,
        );
        assert!(eval.breach_now);
        let ready = eval.ready.expect("bearish READY");
        assert!((ready.stop_loss - 7.78 * 1.001).abs() < 1e-9);
        assert!((ready.target - 7.40).abs() < 1e-9);
    }

    #[test]
    fn best_candidate_by_rr_then_admission_then_scrip() {
        let mk = |scrip: &str, rr: f64, admitted_offset: i64| {
            let mut p = pending(SignalAction::Buy);
            p.signal.scrip_code = scrip.to_string();
            p.admitted_at = Utc::now() + chrono::Duration::seconds(admitted_offset);
            let r = EntryReadiness {
                confirm_price: 7.88,
                stop_loss: 7.72,
                target: 8.20,
                potential_rr: rr,
            };
            (p, r)
        };

        let best = select_best(vec![mk("b", 2.0, 0), mk("a", 3.0, 10)]).unwrap();
        assert_eq!(best.0.scrip_code(), "a");

        // Equal RR: earlier admission wins.
        let best = select_best(vec![mk("b", 2.0, 10), mk("a", 2.0, 0)]).unwrap();
        assert_eq!(best.0.scrip_code(), "a");

        // Equal RR and admission bucket: lexicographic scrip.
        let t = Utc::now();
        let mut c1 = mk("b", 2.0, 0);
        let mut c2 = mk("a", 2.0, 0);
        c1.0.admitted_at = t;
        c2.0.admitted_at = t;
        let best = select_best(vec![c1, c2]).unwrap();
        assert_eq!(best.0.scrip_code(), "a");
    }
}
