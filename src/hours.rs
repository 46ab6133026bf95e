// =============================================================================
// Trading Hours Gate — per-exchange sessions and golden entry windows
// =============================================================================
//
// All windows are wall-clock in the configured trading zone (default
// Asia/Kolkata); callers pass UTC instants and conversion happens here.
// Exchange inference falls back to a commodity-name heuristic only when the
// signal carries no explicit exchange field.
// =============================================================================

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::warn;

use crate::runtime_config::RuntimeConfig;
use crate::types::Exchange;

/// Instrument name fragments that route to the commodity exchange when the
/// signal does not name one.
const COMMODITY_HINTS: &[&str] = &[
    "GOLD", "SILVER", "CRUDE", "NATURALGAS", "NATGAS", "COPPER", "ZINC", "NICKEL", "LEAD",
    "ALUMINIUM",
];

/// A half-open wall-clock interval `[start, end)` within one trading day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ClockWindow {
    pub fn contains(&self, t: NaiveTime) -> bool {
        t >= self.start && t < self.end
    }
}

/// Parse `"HH:MM"`; bad input yields `None`.
fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

/// Parse `"HH:MM-HH:MM"`.
fn parse_window(s: &str) -> Option<ClockWindow> {
    let (a, b) = s.split_once('-')?;
    Some(ClockWindow {
        start: parse_hhmm(a)?,
        end: parse_hhmm(b)?,
    })
}

/// Snapshot of the gate for the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HoursStatus {
    pub zone: String,
    pub local_time: String,
    pub session_date: NaiveDate,
    pub nse_open: bool,
    pub mcx_open: bool,
    pub in_golden_window: bool,
    pub past_session_cutoff: bool,
}

/// Per-exchange open/close windows plus the golden entry windows, all resolved
/// at construction so the hot path does no string parsing.
#[derive(Debug, Clone)]
pub struct TradingHoursGate {
    zone: Tz,
    nse: ClockWindow,
    mcx: ClockWindow,
    golden: Vec<ClockWindow>,
    cutoff: NaiveTime,
}

impl TradingHoursGate {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let zone: Tz = config.trading_zone.parse().unwrap_or_else(|_| {
            warn!(zone = %config.trading_zone, "unknown trading zone — falling back to Asia/Kolkata");
            chrono_tz::Asia::Kolkata
        });

        let fallback_nse = ClockWindow {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(15, 30, 0).unwrap(),
        };
        let fallback_mcx = ClockWindow {
            start: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(23, 30, 0).unwrap(),
        };

        let nse = parse_hhmm(&config.nse_hours.open)
            .zip(parse_hhmm(&config.nse_hours.close))
            .map(|(start, end)| ClockWindow { start, end })
            .unwrap_or(fallback_nse);

        let mcx = parse_hhmm(&config.mcx_hours.open)
            .zip(parse_hhmm(&config.mcx_hours.close))
            .map(|(start, end)| ClockWindow { start, end })
            .unwrap_or(fallback_mcx);

        let golden: Vec<ClockWindow> = config
            .golden_windows
            .iter()
            .filter_map(|s| {
                let w = parse_window(s);
                if w.is_none() {
                    warn!(window = %s, "unparseable golden window — skipped");
                }
                w
            })
            .collect();

        let cutoff = parse_hhmm(&config.session_cutoff)
            .unwrap_or_else(|| NaiveTime::from_hms_opt(15, 15, 0).unwrap());

        Self {
            zone,
            nse,
            mcx,
            golden,
            cutoff,
        }
    }

    fn local_time(&self, now: DateTime<Utc>) -> NaiveTime {
        now.with_timezone(&self.zone).time()
    }

    /// Is `exchange` inside its trading session at the given instant?
    /// BSE shares the NSE equity window.
    pub fn is_open(&self, exchange: Exchange, now: DateTime<Utc>) -> bool {
        let t = self.local_time(now);
        match exchange {
            Exchange::Nse | Exchange::Bse => self.nse.contains(t),
            Exchange::Mcx => self.mcx.contains(t),
        }
    }

    /// Entries are only evaluated inside a golden window. An empty list means
    /// no restriction.
    pub fn in_golden_window(&self, now: DateTime<Utc>) -> bool {
        if self.golden.is_empty() {
            return true;
        }
        let t = self.local_time(now);
        self.golden.iter().any(|w| w.contains(t))
    }

    /// Past the end-of-session force-close cutoff?
    pub fn past_cutoff(&self, now: DateTime<Utc>) -> bool {
        self.local_time(now) >= self.cutoff
    }

    /// Trading date in the configured zone (sessions never cross local
    /// midnight for the supported exchanges' entry windows).
    pub fn session_date(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.zone).date_naive()
    }

    /// Resolve the exchange for a signal: explicit field wins, then the
    /// commodity-name heuristic, then NSE.
    pub fn infer_exchange(explicit: Option<&str>, company_name: &str) -> Exchange {
        if let Some(code) = explicit {
            if let Some(ex) = Exchange::parse(code) {
                return ex;
            }
        }
        let upper = company_name.to_uppercase();
        if COMMODITY_HINTS.iter().any(|hint| upper.contains(hint)) {
            return Exchange::Mcx;
        }
        Exchange::Nse
    }

    pub fn status(&self, now: DateTime<Utc>) -> HoursStatus {
        HoursStatus {
            zone: self.zone.name().to_string(),
            local_time: now.with_timezone(&self.zone).format("%H:%M:%S").to_string(),
            session_date: self.session_date(now),
            nse_open: self.is_open(Exchange::Nse, now),
            mcx_open: self.is_open(Exchange::Mcx, now),
            in_golden_window: self.in_golden_window(now),
            past_session_cutoff: self.past_cutoff(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDateTime, TimeZone};

    fn gate() -> TradingHoursGate {
        TradingHoursGate::from_config(&RuntimeConfig::default())
    }

    /// Build a UTC instant from an IST wall-clock string.
    fn ist(s: &str) -> DateTime<Utc> {
        let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap();
        chrono_tz::Asia::Kolkata
            .from_local_datetime(&naive)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn nse_window_boundaries() {
        let g = gate();
        assert!(!g.is_open(Exchange::Nse, ist("2026-08-03 08:59")));
        assert!(g.is_open(Exchange::Nse, ist("2026-08-03 09:00")));
        assert!(g.is_open(Exchange::Nse, ist("2026-08-03 15:29")));
        assert!(!g.is_open(Exchange::Nse, ist("2026-08-03 15:30")));
    }

    #[test]
    fn mcx_trades_into_the_evening() {
        let g = gate();
        assert!(g.is_open(Exchange::Mcx, ist("2026-08-03 21:00")));
        assert!(!g.is_open(Exchange::Nse, ist("2026-08-03 21:00")));
    }

    #[test]
    fn golden_windows_gate_entries() {
        let g = gate();
        assert!(g.in_golden_window(ist("2026-08-03 10:15")));
        assert!(!g.in_golden_window(ist("2026-08-03 12:00")));
        assert!(g.in_golden_window(ist("2026-08-03 14:00")));
    }

    #[test]
    fn cutoff_closes_the_session() {
        let g = gate();
        assert!(!g.past_cutoff(ist("2026-08-03 15:14")));
        assert!(g.past_cutoff(ist("2026-08-03 15:15")));
    }

    #[test]
    fn exchange_inference_prefers_explicit() {
        assert_eq!(
            TradingHoursGate::infer_exchange(Some("M"), "RELIANCE"),
            Exchange::Mcx
        );
        assert_eq!(
            TradingHoursGate::infer_exchange(None, "GOLDPETAL AUG FUT"),
            Exchange::Mcx
        );
        assert_eq!(
            TradingHoursGate::infer_exchange(None, "RELIANCE"),
            Exchange::Nse
        );
        // Unparseable explicit field falls through to the heuristic.
        assert_eq!(
            TradingHoursGate::infer_exchange(Some("??"), "CRUDEOIL SEP"),
            Exchange::Mcx
        );
    }

    #[test]
    fn session_date_is_local() {
        let g = gate();
        // 20:00 UTC is past midnight IST.
        let late = ist("2026-08-04 01:35");
        assert_eq!(g.session_date(late), NaiveDate::from_ymd_opt(2026, 8, 4).unwrap());
    }
}
