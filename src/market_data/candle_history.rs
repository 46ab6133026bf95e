// =============================================================================
// Candle History — bounded per-instrument ring of 1-minute candles
// =============================================================================
//
// Candles are strictly ordered per instrument by window start. An incoming
// candle older than the last stored one is late and dropped; one with the
// same window start replaces the stored candle (in-progress update). The ring
// is trimmed to `max_len` on every append.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single 1-minute OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub scrip_code: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Outcome of offering a candle to the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// New candle appended — callers should process it.
    Appended,
    /// Same window start as the stored tail — replaced in place.
    Replaced,
    /// Older than the last processed window — dropped.
    DroppedLate,
}

/// Thread-safe per-instrument candle rings.
pub struct CandleHistory {
    rings: RwLock<HashMap<String, VecDeque<Candle>>>,
    max_len: usize,
}

impl CandleHistory {
    pub fn new(max_len: usize) -> Self {
        Self {
            rings: RwLock::new(HashMap::new()),
            max_len: max_len.max(2),
        }
    }

    /// Offer a candle, enforcing per-instrument ordering.
    pub fn push(&self, candle: Candle) -> PushOutcome {
        let mut map = self.rings.write();
        let ring = map
            .entry(candle.scrip_code.clone())
            .or_insert_with(|| VecDeque::with_capacity(self.max_len));

        if let Some(last) = ring.back() {
            if candle.window_start_ms < last.window_start_ms {
                debug!(
                    scrip = %candle.scrip_code,
                    incoming = candle.window_start_ms,
                    last = last.window_start_ms,
                    "late candle dropped"
                );
                return PushOutcome::DroppedLate;
            }
            if candle.window_start_ms == last.window_start_ms {
                ring.pop_back();
                ring.push_back(candle);
                return PushOutcome::Replaced;
            }
        }

        ring.push_back(candle);
        while ring.len() > self.max_len {
            ring.pop_front();
        }
        PushOutcome::Appended
    }

    /// Seed an empty ring with historical candles (watchlist admission
    /// preload). Existing candles take precedence — a non-empty ring is left
    /// untouched.
    pub fn preload(&self, scrip_code: &str, mut candles: Vec<Candle>) {
        let mut map = self.rings.write();
        let ring = map
            .entry(scrip_code.to_string())
            .or_insert_with(VecDeque::new);
        if !ring.is_empty() {
            return;
        }
        candles.sort_by_key(|c| c.window_start_ms);
        for c in candles.into_iter() {
            ring.push_back(c);
        }
        while ring.len() > self.max_len {
            ring.pop_front();
        }
    }

    /// Last `count` candles, oldest first.
    pub fn recent(&self, scrip_code: &str, count: usize) -> Vec<Candle> {
        let map = self.rings.read();
        match map.get(scrip_code) {
            Some(ring) => {
                let start = ring.len().saturating_sub(count);
                ring.iter().skip(start).cloned().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn last(&self, scrip_code: &str) -> Option<Candle> {
        self.rings.read().get(scrip_code).and_then(|r| r.back().cloned())
    }

    pub fn len(&self, scrip_code: &str) -> usize {
        self.rings.read().get(scrip_code).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, scrip_code: &str) -> bool {
        self.len(scrip_code) == 0
    }

    /// Mean volume of up to `count` candles strictly before the given window
    /// start. `None` when no prior candles exist.
    pub fn prior_volume_mean(
        &self,
        scrip_code: &str,
        before_window_start_ms: i64,
        count: usize,
    ) -> Option<(f64, usize)> {
        let map = self.rings.read();
        let ring = map.get(scrip_code)?;

        let volumes: Vec<f64> = ring
            .iter()
            .rev()
            .filter(|c| c.window_start_ms < before_window_start_ms)
            .take(count)
            .map(|c| c.volume)
            .collect();

        if volumes.is_empty() {
            return None;
        }
        let mean = volumes.iter().sum::<f64>() / volumes.len() as f64;
        Some((mean, volumes.len()))
    }

    /// The candle immediately before the given window start, if stored.
    pub fn previous(&self, scrip_code: &str, window_start_ms: i64) -> Option<Candle> {
        let map = self.rings.read();
        let ring = map.get(scrip_code)?;
        ring.iter()
            .rev()
            .find(|c| c.window_start_ms < window_start_ms)
            .cloned()
    }
}

#[cfg(test)]
pub(crate) fn sample_candle(scrip: &str, start_ms: i64, close: f64, volume: f64) -> Candle {
    Candle {
        scrip_code: scrip.to_string(),
        window_start_ms: start_ms,
        window_end_ms: start_ms + 60_000,
        open: close - 0.05,
        high: close + 0.10,
        low: close - 0.10,
        close,
        volume,
    }
}
