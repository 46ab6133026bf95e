// =============================================================================
// Pivot Client — daily pivot levels fetched per (instrument, session date)
// =============================================================================
//
// Levels come from the pivot service over HTTP with a hard 2 s deadline and
// are cached for the rest of the session; the cache is pruned whenever a new
// session date shows up. Unavailability is a deferral, not a drop: callers
// keep the pending signal and retry on the next candle.
// =============================================================================

use std::collections::HashMap;

use anyhow::Context;
use chrono::NaiveDate;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::types::Direction;

/// Daily pivot ladder for one instrument and session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PivotLevels {
    pub pivot: f64,
    pub support: [f64; 4],
    pub resistance: [f64; 4],
}

impl PivotLevels {
    /// The next pivot level a move from `close` would logically run into:
    /// the nearest resistance above for bullish trades, the nearest support
    /// below for bearish ones. The daily pivot itself participates.
    pub fn next_logical_pivot(&self, close: f64, direction: Direction) -> Option<f64> {
        match direction {
            Direction::Bullish => {
                let mut candidates: Vec<f64> = self
                    .resistance
                    .iter()
                    .copied()
                    .chain(std::iter::once(self.pivot))
                    .filter(|&level| level > close)
                    .collect();
                candidates.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                candidates.first().copied()
            }
            Direction::Bearish => {
                let mut candidates: Vec<f64> = self
                    .support
                    .iter()
                    .copied()
                    .chain(std::iter::once(self.pivot))
                    .filter(|&level| level < close)
                    .collect();
                candidates.sort_by(|a, b| b.partial_cmp(a).unwrap_or(std::cmp::Ordering::Equal));
                candidates.first().copied()
            }
        }
    }
}

/// Wire shape returned by the pivot service.
#[derive(Debug, Deserialize)]
struct PivotResponse {
    pivot: f64,
    support1: f64,
    support2: f64,
    support3: f64,
    support4: f64,
    resistance1: f64,
    resistance2: f64,
    resistance3: f64,
    resistance4: f64,
}

impl From<PivotResponse> for PivotLevels {
    fn from(r: PivotResponse) -> Self {
        Self {
            pivot: r.pivot,
            support: [r.support1, r.support2, r.support3, r.support4],
            resistance: [r.resistance1, r.resistance2, r.resistance3, r.resistance4],
        }
    }
}

pub struct PivotClient {
    http: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<(String, NaiveDate), PivotLevels>>,
}

impl PivotClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(2))
            .build()
            .expect("failed to build pivot http client");

        Self {
            http,
            base_url: base_url.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Cached levels for `(scrip, session_date)`, fetching on miss.
    pub async fn levels(
        &self,
        scrip_code: &str,
        session_date: NaiveDate,
        current_price: f64,
        direction: Direction,
    ) -> Result<PivotLevels, EngineError> {
        let key = (scrip_code.to_string(), session_date);
        if let Some(levels) = self.cache.read().get(&key) {
            return Ok(*levels);
        }

        let levels = self
            .fetch(scrip_code, current_price, direction)
            .await
            .map_err(|e| {
                warn!(scrip = %scrip_code, error = %e, "pivot fetch failed");
                EngineError::PivotUnavailable(format!("{scrip_code}: {e}"))
            })?;

        let mut cache = self.cache.write();
        // A new session date invalidates every older entry.
        cache.retain(|(_, date), _| *date == session_date);
        cache.insert(key, levels);
        debug!(scrip = %scrip_code, date = %session_date, pivot = levels.pivot, "pivot levels cached");

        Ok(levels)
    }

    async fn fetch(
        &self,
        scrip_code: &str,
        current_price: f64,
        direction: Direction,
    ) -> anyhow::Result<PivotLevels> {
        let url = format!(
            "{}/api/pivots/calculate-targets/{}?currentPrice={}&signalType={}",
            self.base_url, scrip_code, current_price, direction
        );

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .context("pivot service request failed")?;

        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("pivot service returned {status}");
        }

        let body: PivotResponse = resp
            .json()
            .await
            .context("failed to parse pivot response")?;

        Ok(body.into())
    }

    /// Seed the cache directly (session warmup and tests).
    pub fn seed(&self, scrip_code: &str, session_date: NaiveDate, levels: PivotLevels) {
        self.cache
            .write()
            .insert((scrip_code.to_string(), session_date), levels);
    }

    pub fn cached(&self, scrip_code: &str, session_date: NaiveDate) -> Option<PivotLevels> {
        self.cache
            .read()
            .get(&(scrip_code.to_string(), session_date))
            .copied()
    }
}

#[cfg(test)]
pub(crate) fn sample_levels(pivot: f64) -> PivotLevels {
    PivotLevels {
        pivot,
        support: [pivot - 0.10, pivot - 0.25, pivot - 0.40, pivot - 0.60],
        resistance: [pivot + 0.15, pivot + 0.30, pivot + 0.45, pivot + 0.70],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_pivot_bullish_picks_nearest_above() {
        let levels = sample_levels(7.75);
        // close between P and R1.
        let target = levels.next_logical_pivot(7.88, Direction::Bullish).unwrap();
        assert!((target - 7.90).abs() < 1e-9);
        // close above R1 goes to R2.
        let target = levels.next_logical_pivot(7.92, Direction::Bullish).unwrap();
        assert!((target - 8.05).abs() < 1e-9);
    }

    #[test]
    fn next_pivot_bearish_picks_nearest_below() {
        let levels = sample_levels(7.75);
        let target = levels.next_logical_pivot(7.70, Direction::Bearish).unwrap();
        assert!((target - 7.65).abs() < 1e-9);
    }

    #[test]
    fn next_pivot_includes_the_daily_pivot_itself() {
        let levels = sample_levels(7.75);
        // Bullish close below P: P is the nearest level above.
        let target = levels.next_logical_pivot(7.60, Direction::Bullish).unwrap();
        assert!((target - 7.75).abs() < 1e-9);
    }

    #[test]
    fn next_pivot_none_beyond_the_ladder() {
        let levels = sample_levels(7.75);
        assert!(levels.next_logical_pivot(9.00, Direction::Bullish).is_none());
        assert!(levels.next_logical_pivot(6.00, Direction::Bearish).is_none());
    }

    #[test]
    fn wire_shape_parses() {
        let json = r#"{
            "pivot": 7.75,
            "support1": 7.65, "support2": 7.50, "support3": 7.35, "support4": 7.15,
            "resistance1": 7.90, "resistance2": 8.05, "resistance3": 8.20, "resistance4": 8.45
        }"#;
        let resp: PivotResponse = serde_json::from_str(json).unwrap();
        let levels: PivotLevels = resp.into();
        assert!((levels.pivot - 7.75).abs() < 1e-9);
        assert!((levels.resistance[3] - 8.45).abs() < 1e-9);
    }

    #[test]
    fn seed_and_cached() {
        let client = PivotClient::new("http://localhost:9");
        let date = NaiveDate::from_ymd_opt(2026, 8, 3).unwrap();
        client.seed("114311", date, sample_levels(7.75));
        assert!(client.cached("114311", date).is_some());
        assert!(client.cached("114311", date.succ_opt().unwrap()).is_none());
    }
}
