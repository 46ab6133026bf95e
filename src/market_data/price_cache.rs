// =============================================================================
// Price Cache — last trade and best bid/ask per instrument, TTL-bounded
// =============================================================================
//
// Every tick update is mirrored into the KV store under
// `orderbook:{scripCode}:latest` so external tooling reads the same snapshot
// the engine trades on. Reads past the TTL return `None`; callers that need a
// fresh quote surface MARKET_DATA_STALE.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::kv::{orderbook_key, KvStore};

/// The KV-mirrored quote snapshot (stable layout).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderbookSnapshot {
    pub best_bid: f64,
    pub best_ask: f64,
    pub last_rate: f64,
    pub ts: i64,
}

#[derive(Debug, Clone)]
struct QuoteEntry {
    last_rate: f64,
    best_bid: f64,
    best_ask: f64,
    updated_at: DateTime<Utc>,
}

pub struct PriceCache {
    quotes: RwLock<HashMap<String, QuoteEntry>>,
    ttl: Duration,
    kv: Arc<KvStore>,
}

impl PriceCache {
    pub fn new(ttl: Duration, kv: Arc<KvStore>) -> Self {
        Self {
            quotes: RwLock::new(HashMap::new()),
            ttl,
            kv,
        }
    }

    /// Record a tick. Zero/negative bid or ask falls back to the last rate so
    /// thin instruments still produce a usable snapshot.
    pub fn update_tick(
        &self,
        scrip_code: &str,
        last_rate: f64,
        best_bid: f64,
        best_ask: f64,
        now: DateTime<Utc>,
    ) {
        if last_rate <= 0.0 {
            return;
        }
        let bid = if best_bid > 0.0 { best_bid } else { last_rate };
        let ask = if best_ask > 0.0 { best_ask } else { last_rate };

        self.quotes.write().insert(
            scrip_code.to_string(),
            QuoteEntry {
                last_rate,
                best_bid: bid,
                best_ask: ask,
                updated_at: now,
            },
        );

        self.kv.put(
            &orderbook_key(scrip_code),
            &OrderbookSnapshot {
                best_bid: bid,
                best_ask: ask,
                last_rate,
                ts: now.timestamp_millis(),
            },
        );
    }

    fn fresh(&self, scrip_code: &str, now: DateTime<Utc>) -> Option<QuoteEntry> {
        let map = self.quotes.read();
        let entry = map.get(scrip_code)?;
        if now - entry.updated_at > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    /// Last traded price, `None` when never seen or stale.
    pub fn last_trade(&self, scrip_code: &str, now: DateTime<Utc>) -> Option<f64> {
        self.fresh(scrip_code, now).map(|e| e.last_rate)
    }

    /// Best bid/ask, `None` when stale.
    pub fn quote(&self, scrip_code: &str, now: DateTime<Utc>) -> Option<(f64, f64)> {
        self.fresh(scrip_code, now).map(|e| (e.best_bid, e.best_ask))
    }

    /// Age of the stored quote regardless of TTL, for staleness reporting.
    pub fn age(&self, scrip_code: &str, now: DateTime<Utc>) -> Option<Duration> {
        let map = self.quotes.read();
        map.get(scrip_code).map(|e| now - e.updated_at)
    }
}
