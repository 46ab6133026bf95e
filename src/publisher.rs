// =============================================================================
// Result Publisher — trade, P&L, and risk events onto the output topics
// =============================================================================
//
// Downstream consumption is at-least-once, so everything published here is
// keyed for idempotent handling: results by trade id (with a local dedup set
// so a retried exit never publishes twice), risk events by policy scope.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{
    TopicPublisher, TOPIC_PROFIT_LOSS, TOPIC_RISK_EVENTS, TOPIC_TRADE_ENTRIES, TOPIC_TRADE_RESULTS,
};
use crate::engine::trade::ActiveTrade;
use crate::signal::{RiskEvent, TradeResult};

/// Event types on the `profit-loss` topic.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PnlEventType {
    TradeEntry,
    TradeExit,
    PortfolioUpdate,
}

pub struct ResultPublisher {
    bus: Arc<dyn TopicPublisher>,
    published_results: Mutex<HashSet<String>>,
}

impl ResultPublisher {
    pub fn new(bus: Arc<dyn TopicPublisher>) -> Self {
        Self {
            bus,
            published_results: Mutex::new(HashSet::new()),
        }
    }

    /// Emit the entry record and its P&L event once the entry fill is
    /// verified.
    pub async fn publish_entry(&self, trade: &ActiveTrade, signal_id: Option<&str>) {
        let entry = json!({
            "scripCode": trade.scrip_code,
            "direction": trade.direction,
            "entryPrice": trade.entry_price,
            "stopLoss": trade.stop_loss,
            "takeProfit": trade.target1,
            "quantity": trade.position_size,
            "orderId": trade.entry_order_id,
            "strategyId": trade.strategy_name,
            "signalId": signal_id,
            "entryTime": trade.entry_time,
        });
        self.publish(TOPIC_TRADE_ENTRIES, &trade.scrip_code, entry).await;

        let pnl_event = json!({
            "eventType": PnlEventType::TradeEntry,
            "tradeId": trade.trade_id,
            "scripCode": trade.scrip_code,
            "entryPrice": trade.entry_price,
            "quantity": trade.position_size,
            "timestamp": Utc::now(),
        });
        self.publish(TOPIC_PROFIT_LOSS, &trade.trade_id, pnl_event).await;
    }

    /// Emit the immutable trade result and the TRADE_EXIT P&L event. Keyed by
    /// trade id; a repeat publish for the same trade is dropped locally.
    pub async fn publish_result(&self, result: &TradeResult) {
        if !self.published_results.lock().insert(result.trade_id.clone()) {
            debug!(trade_id = %result.trade_id, "duplicate result suppressed");
            return;
        }

        let payload = match serde_json::to_value(result) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unserializable trade result");
                return;
            }
        };
        self.publish(TOPIC_TRADE_RESULTS, &result.trade_id, payload).await;

        let roi = if result.entry_price > 0.0 && result.position_size != 0 {
            result.pnl / (result.entry_price * result.position_size.abs() as f64)
        } else {
            0.0
        };
        let pnl_event = json!({
            "eventType": PnlEventType::TradeExit,
            "tradeId": result.trade_id,
            "scripCode": result.scrip_code,
            "entryPrice": result.entry_price,
            "exitPrice": result.exit_price,
            "pnl": result.pnl,
            "roi": roi,
            "durationMinutes": result.duration_minutes,
            "timestamp": Utc::now(),
        });
        self.publish(TOPIC_PROFIT_LOSS, &result.trade_id, pnl_event).await;

        info!(
            trade_id = %result.trade_id,
            pnl = result.pnl,
            r_multiple = result.r_multiple,
            reason = %result.exit_reason,
            "trade result published"
        );
    }

    /// Periodic portfolio snapshot onto `profit-loss`.
    pub async fn publish_portfolio_update(&self, account_value: f64, daily_realized: f64) {
        let event = json!({
            "eventType": PnlEventType::PortfolioUpdate,
            "accountValue": account_value,
            "dailyRealizedPnl": daily_realized,
            "timestamp": Utc::now(),
        });
        self.publish(TOPIC_PROFIT_LOSS, "portfolio", event).await;
    }

    pub async fn publish_risk_event(&self, event: &RiskEvent) {
        let payload = match serde_json::to_value(event) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "unserializable risk event");
                return;
            }
        };
        self.publish(TOPIC_RISK_EVENTS, &event.scope, payload).await;
    }

    async fn publish(&self, topic: &str, key: &str, payload: serde_json::Value) {
        if let Err(e) = self.bus.publish(topic, Some(key), payload).await {
            warn!(topic, key, error = %e, "publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Instrument;
    use crate::bus::memory::InMemoryBus;
    use crate::engine::trade::{ActiveTrade, ExecutionParams, ExitReason};
    use crate::types::{Direction, Exchange, Segment, Severity};

    fn bus() -> Arc<InMemoryBus> {
        Arc::new(InMemoryBus::new(1))
    }

    fn result(trade_id: &str) -> TradeResult {
        TradeResult {
            trade_id: trade_id.into(),
            scrip_code: "114311".into(),
            company_name: "TEST".into(),
            direction: Direction::Bullish,
            strategy_name: "pivot-retest".into(),
            entry_price: 7.88,
            entry_time: Utc::now(),
            exit_price: 8.20,
            exit_time: Utc::now(),
            position_size: 100,
            pnl: 32.0,
            r_multiple: 1.88,
            exit_reason: ExitReason::Target1.to_string(),
            duration_minutes: 12,
            max_favorable_excursion: 0.34,
            max_adverse_excursion: 0.05,
        }
    }

    #[tokio::test]
    async fn result_publishes_to_both_topics() {
        let bus = bus();
        let publisher = ResultPublisher::new(bus.clone());
        publisher.publish_result(&result("t-1")).await;

        assert_eq!(bus.depth(TOPIC_TRADE_RESULTS), 1);
        assert_eq!(bus.depth(TOPIC_PROFIT_LOSS), 1);
    }

    #[tokio::test]
    async fn duplicate_result_suppressed() {
        let bus = bus();
        let publisher = ResultPublisher::new(bus.clone());
        publisher.publish_result(&result("t-1")).await;
        publisher.publish_result(&result("t-1")).await;
        publisher.publish_result(&result("t-2")).await;

        assert_eq!(bus.depth(TOPIC_TRADE_RESULTS), 2);
    }

    #[tokio::test]
    async fn entry_publishes_entry_and_pnl_event() {
        let bus = bus();
        let publisher = ResultPublisher::new(bus.clone());

        let mut trade = ActiveTrade::new(
            "114311".into(),
            "TEST".into(),
            Direction::Bullish,
            "pivot-retest".into(),
            Utc::now(),
            7.88,
            100,
            7.71,
            8.20,
            None,
            None,
            ExecutionParams {
                instrument: Instrument {
                    scrip_code: "114311".into(),
                    exchange: Exchange::Nse,
                    segment: Segment::Cash,
                    tick_size: 0.05,
                    lot_size: 1,
                },
                limit_price_entry: None,
                limit_price_exit: None,
            },
        );
        trade.apply_entry_fill(100, 7.88, Utc::now());
        publisher.publish_entry(&trade, Some("sig-1")).await;

        assert_eq!(bus.depth(TOPIC_TRADE_ENTRIES), 1);
        assert_eq!(bus.depth(TOPIC_PROFIT_LOSS), 1);
    }

    #[tokio::test]
    async fn risk_event_lands_on_topic() {
        let bus = bus();
        let publisher = ResultPublisher::new(bus.clone());
        publisher
            .publish_risk_event(&RiskEvent::new(
                "RISK_DAILY_LOSS",
                Severity::Warning,
                "wallet",
                "at 70%".into(),
            ))
            .await;
        assert_eq!(bus.depth(TOPIC_RISK_EVENTS), 1);
    }
}
