// =============================================================================
// Market-Data Ingress — tick and 1-minute candle consumers
// =============================================================================
//
// Ticks feed the price cache (and its KV mirror); candles feed the history
// ring and, when they advance the instrument's window, the engine's event
// stream. Both consumers commit after the update lands, so a crash replays
// the tail — every downstream structure is last-writer-wins or ordered-drop,
// which makes the replay harmless.
//
// `run_tick_ws_bridge` is the external edge: it pipes a JSON tick feed from a
// WebSocket endpoint onto the bus, reconnection handled by the caller.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::bus::{Record, TopicConsumer, TopicPublisher, TOPIC_MARKET_DATA};
use crate::engine::EngineEvent;
use crate::market_data::candle_history::{Candle, CandleHistory, PushOutcome};
use crate::market_data::price_cache::PriceCache;

// ---------------------------------------------------------------------------
// Wire records
// ---------------------------------------------------------------------------

/// A per-tick record from the `market-data` topic, reduced to the fields the
/// engine consumes. Producers disagree on the instrument field name, so both
/// are accepted; everything else is tolerated and ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickRecord {
    #[serde(alias = "token")]
    pub scrip_code: serde_json::Value,
    #[serde(default)]
    pub last_rate: f64,
    #[serde(default)]
    pub bid_rate: f64,
    #[serde(default)]
    pub offer_rate: f64,
}

impl TickRecord {
    /// The instrument id arrives as either a number or a string.
    pub fn scrip(&self) -> String {
        match &self.scrip_code {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

fn parse_tick(record: &Record) -> Result<TickRecord> {
    serde_json::from_value(record.payload.clone()).context("failed to parse tick record")
}

fn parse_candle(record: &Record) -> Result<Candle> {
    serde_json::from_value(record.payload.clone()).context("failed to parse candle record")
}

// ---------------------------------------------------------------------------
// Consumers
// ---------------------------------------------------------------------------

/// Consume the `market-data` topic partition. Runs until the bus closes.
pub async fn run_tick_consumer(
    mut consumer: impl TopicConsumer,
    price_cache: Arc<PriceCache>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
) -> Result<()> {
    loop {
        let record = consumer.next().await.context("tick consumer poll failed")?;

        match parse_tick(&record) {
            Ok(tick) => {
                let scrip = tick.scrip();
                price_cache.update_tick(
                    &scrip,
                    tick.last_rate,
                    tick.bid_rate,
                    tick.offer_rate,
                    Utc::now(),
                );
                if tick.last_rate > 0.0 {
                    let _ = engine_tx.send(EngineEvent::Tick {
                        scrip_code: scrip,
                        last_rate: tick.last_rate,
                    });
                }
            }
            Err(e) => {
                // Malformed ticks are non-retryable; drop and move on.
                warn!(offset = record.offset, error = %e, "unparseable tick dropped");
            }
        }

        consumer.commit(&record).await.context("tick commit failed")?;
    }
}

/// Consume the `candles-1m` topic partition. Only candles that advance or
/// refresh the instrument's current window reach the engine; late ones die in
/// the history ring.
pub async fn run_candle_consumer(
    mut consumer: impl TopicConsumer,
    history: Arc<CandleHistory>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
) -> Result<()> {
    loop {
        let record = consumer.next().await.context("candle consumer poll failed")?;

        match parse_candle(&record) {
            Ok(candle) => match history.push(candle.clone()) {
                PushOutcome::Appended | PushOutcome::Replaced => {
                    let _ = engine_tx.send(EngineEvent::Candle(candle));
                }
                PushOutcome::DroppedLate => {
                    debug!(
                        scrip = %candle.scrip_code,
                        window_start = candle.window_start_ms,
                        "late candle not forwarded"
                    );
                }
            },
            Err(e) => {
                warn!(offset = record.offset, error = %e, "unparseable candle dropped");
            }
        }

        consumer.commit(&record).await.context("candle commit failed")?;
    }
}

// ---------------------------------------------------------------------------
// WebSocket bridge
// ---------------------------------------------------------------------------

/// Connect to an external tick feed and republish every JSON frame onto the
/// `market-data` topic. Returns when the stream ends or errors so the caller
/// can reconnect with backoff.
pub async fn run_tick_ws_bridge(
    url: &str,
    bus: Arc<dyn TopicPublisher>,
) -> Result<()> {
    info!(url = %url, "connecting to tick feed WebSocket");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to tick feed WebSocket")?;

    info!(url = %url, "tick feed WebSocket connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(msg)) => {
                if let tokio_tungstenite::tungstenite::Message::Text(text) = msg {
                    match serde_json::from_str::<serde_json::Value>(&text) {
                        Ok(payload) => {
                            let key = payload
                                .get("scripCode")
                                .or_else(|| payload.get("token"))
                                .map(|v| match v {
                                    serde_json::Value::String(s) => s.clone(),
                                    other => other.to_string(),
                                });
                            if let Err(e) = bus
                                .publish(TOPIC_MARKET_DATA, key.as_deref(), payload)
                                .await
                            {
                                warn!(error = %e, "failed to publish bridged tick");
                            }
                        }
                        Err(e) => warn!(error = %e, "unparseable frame on tick feed"),
                    }
                }
                // Ping/pong/binary frames are handled by tungstenite.
            }
            Some(Err(e)) => {
                warn!(error = %e, "tick feed WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("tick feed WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::memory::InMemoryBus;
    use crate::kv::KvStore;
    use serde_json::json;

    fn tick_json() -> serde_json::Value {
        json!({
            "token": 114311,
            "lastRate": 7.88,
            "bidRate": 7.85,
            "offerRate": 7.90,
            "high": 7.95,
            "low": 7.70,
            "open": 7.80,
            "previousClose": 7.75,
            "time": 1754030000000i64
        })
    }

    fn candle_json(start_ms: i64, close: f64) -> serde_json::Value {
        json!({
            "scripCode": "114311",
            "windowStartMs": start_ms,
            "windowEndMs": start_ms + 60_000,
            "open": close - 0.02,
            "high": close + 0.03,
            "low": close - 0.05,
            "close": close,
            "volume": 1500.0
        })
    }

    #[tokio::test]
    async fn ticks_update_cache_and_reach_engine() {
        let bus = InMemoryBus::new(1);
        bus.publish(TOPIC_MARKET_DATA, Some("114311"), tick_json())
            .await
            .unwrap();

        let kv = Arc::new(KvStore::ephemeral());
        let cache = Arc::new(PriceCache::new(chrono::Duration::seconds(10), kv));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer = bus.subscribe(TOPIC_MARKET_DATA, 0).unwrap();
        let cache2 = cache.clone();
        let handle = tokio::spawn(async move {
            let _ = run_tick_consumer(consumer, cache2, tx).await;
        });

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            EngineEvent::Tick { scrip_code, last_rate } => {
                assert_eq!(scrip_code, "114311");
                assert!((last_rate - 7.88).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(cache.last_trade("114311", Utc::now()), Some(7.88));
        handle.abort();
    }

    #[tokio::test]
    async fn late_candles_are_not_forwarded() {
        let bus = InMemoryBus::new(1);
        bus.publish("candles-1m", Some("114311"), candle_json(120_000, 7.90))
            .await
            .unwrap();
        bus.publish("candles-1m", Some("114311"), candle_json(60_000, 7.85))
            .await
            .unwrap();
        bus.publish("candles-1m", Some("114311"), candle_json(180_000, 7.95))
            .await
            .unwrap();

        let history = Arc::new(CandleHistory::new(100));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let consumer = bus.subscribe("candles-1m", 0).unwrap();
        let h2 = history.clone();
        let handle = tokio::spawn(async move {
            let _ = run_candle_consumer(consumer, h2, tx).await;
        });

        let mut forwarded = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let EngineEvent::Candle(c) = event {
                forwarded.push(c.window_start_ms);
            }
        }
        assert_eq!(forwarded, vec![120_000, 180_000]);
        assert_eq!(history.len("114311"), 2);
        handle.abort();
    }

    #[test]
    fn tick_record_accepts_string_or_number_token() {
        let t: TickRecord = serde_json::from_value(tick_json()).unwrap();
        assert_eq!(t.scrip(), "114311");

        let t: TickRecord =
            serde_json::from_value(json!({"scripCode": "GOLD24AUG", "lastRate": 1.0})).unwrap();
        assert_eq!(t.scrip(), "GOLD24AUG");
    }
}
