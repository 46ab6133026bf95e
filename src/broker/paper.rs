// =============================================================================
// Paper Broker — virtual wallet execution against the live price cache
// =============================================================================
//
// Fills are synthetic: limit orders fill at their limit price, market orders
// at the last trade. `fill_fraction` in the wallet settings produces partial
// fills for reconciliation drills — the remainder stays open until cancelled,
// exactly as a real book would leave it.
//
// Every order and position snapshot lands in the KV store under the
// `virtual:` key layout so the paper wallet survives a restart.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::kv::{virtual_order_key, virtual_position_key, KvStore, VIRTUAL_SETTINGS_KEY};
use crate::market_data::PriceCache;

use super::{Broker, BrokerError, Instrument, Order, OrderSide, OrderState, OrderStatusReport};

/// Persisted wallet settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualSettings {
    pub capital: f64,
    /// Fraction of the requested quantity that fills immediately, in (0, 1].
    pub fill_fraction: f64,
}

impl Default for VirtualSettings {
    fn default() -> Self {
        Self {
            capital: 1_000_000.0,
            fill_fraction: 1.0,
        }
    }
}

/// Persisted order snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualOrder {
    pub order_id: String,
    pub scrip_code: String,
    pub side: OrderSide,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub avg_price: f64,
    pub state: OrderState,
    pub created_at: i64,
}

/// Persisted net position snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VirtualPosition {
    pub scrip_code: String,
    /// Signed quantity: positive long, negative short.
    pub quantity: i64,
    pub avg_price: f64,
}

pub struct PaperBroker {
    kv: Arc<KvStore>,
    prices: Arc<PriceCache>,
    // Serializes fill + position bookkeeping.
    write_lock: Mutex<()>,
}

impl PaperBroker {
    pub fn new(kv: Arc<KvStore>, prices: Arc<PriceCache>) -> Self {
        if kv.get::<VirtualSettings>(VIRTUAL_SETTINGS_KEY).is_none() {
            kv.put(VIRTUAL_SETTINGS_KEY, &VirtualSettings::default());
        }
        Self {
            kv,
            prices,
            write_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> VirtualSettings {
        self.kv
            .get(VIRTUAL_SETTINGS_KEY)
            .unwrap_or_default()
    }

    pub fn update_settings(&self, settings: &VirtualSettings) {
        self.kv.put(VIRTUAL_SETTINGS_KEY, settings);
    }

    fn fill_price(&self, instrument: &Instrument, order: &Order) -> Option<f64> {
        match order.limit_price() {
            Some(p) => Some(p),
            None => self.prices.last_trade(&instrument.scrip_code, Utc::now()),
        }
    }

    fn apply_fill(&self, scrip_code: &str, side: OrderSide, qty: i64, price: f64) {
        let key = virtual_position_key(scrip_code);
        let mut pos: VirtualPosition = self.kv.get(&key).unwrap_or(VirtualPosition {
            scrip_code: scrip_code.to_string(),
            quantity: 0,
            avg_price: 0.0,
        });

        let signed = match side {
            OrderSide::Buy => qty,
            OrderSide::Sell => -qty,
        };
        let new_qty = pos.quantity + signed;

        // Average price only re-weights while adding to the same side.
        if pos.quantity.signum() == signed.signum() || pos.quantity == 0 {
            let total = pos.quantity.abs() + qty;
            if total > 0 {
                pos.avg_price = (pos.avg_price * pos.quantity.abs() as f64 + price * qty as f64)
                    / total as f64;
            }
        } else if new_qty == 0 {
            pos.avg_price = 0.0;
        }
        pos.quantity = new_qty;

        if pos.quantity == 0 {
            self.kv.remove(&key);
        } else {
            self.kv.put(&key, &pos);
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn place_order(
        &self,
        instrument: &Instrument,
        order: &Order,
    ) -> Result<String, BrokerError> {
        let _guard = self.write_lock.lock();

        let Some(price) = self.fill_price(instrument, order) else {
            return Err(BrokerError::Rejected(format!(
                "no market price for {}",
                instrument.scrip_code
            )));
        };

        let settings = self.settings();
        let requested = order.quantity();
        if requested <= 0 {
            return Err(BrokerError::Rejected("non-positive quantity".into()));
        }
        if price * requested as f64 > settings.capital {
            return Err(BrokerError::Rejected(format!(
                "notional {:.2} exceeds wallet capital {:.2}",
                price * requested as f64,
                settings.capital
            )));
        }

        let filled = ((requested as f64) * settings.fill_fraction.clamp(0.0, 1.0)).floor() as i64;
        let state = if filled >= requested {
            OrderState::Filled
        } else if filled > 0 {
            OrderState::PartiallyFilled
        } else {
            OrderState::Pending
        };

        let order_id = Uuid::new_v4().to_string();
        let snapshot = VirtualOrder {
            order_id: order_id.clone(),
            scrip_code: instrument.scrip_code.clone(),
            side: order.side(),
            requested_qty: requested,
            filled_qty: filled.min(requested),
            avg_price: price,
            state,
            created_at: Utc::now().timestamp_millis(),
        };
        self.kv.put(&virtual_order_key(&order_id), &snapshot);

        if snapshot.filled_qty > 0 {
            self.apply_fill(
                &instrument.scrip_code,
                order.side(),
                snapshot.filled_qty,
                price,
            );
        }

        info!(
            order_id = %order_id,
            scrip = %instrument.scrip_code,
            side = %order.side(),
            requested,
            filled = snapshot.filled_qty,
            price,
            "paper order placed"
        );
        Ok(order_id)
    }

    async fn modify_order(&self, order_id: &str, new_limit_price: f64) -> Result<(), BrokerError> {
        let _guard = self.write_lock.lock();
        let key = virtual_order_key(order_id);
        let Some(mut order) = self.kv.get::<VirtualOrder>(&key) else {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        };
        if order.state.is_terminal() {
            return Err(BrokerError::Rejected("order already terminal".into()));
        }
        order.avg_price = new_limit_price;
        self.kv.put(&key, &order);
        debug!(order_id, new_limit_price, "paper order re-priced");
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError> {
        let _guard = self.write_lock.lock();
        let key = virtual_order_key(order_id);
        let Some(mut order) = self.kv.get::<VirtualOrder>(&key) else {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        };
        if order.state.is_terminal() {
            return Ok(());
        }
        order.state = OrderState::Cancelled;
        self.kv.put(&key, &order);
        info!(order_id, filled = order.filled_qty, "paper order cancelled");
        Ok(())
    }

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, BrokerError> {
        let Some(order) = self.kv.get::<VirtualOrder>(&virtual_order_key(order_id)) else {
            return Err(BrokerError::UnknownOrder(order_id.to_string()));
        };
        Ok(OrderStatusReport {
            order_id: order.order_id,
            state: order.state,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Exchange, Segment};

    fn setup() -> (PaperBroker, Arc<KvStore>, Arc<PriceCache>) {
        let kv = Arc::new(KvStore::ephemeral());
        let prices = Arc::new(PriceCache::new(chrono::Duration::seconds(10), kv.clone()));
        (PaperBroker::new(kv.clone(), prices.clone()), kv, prices)
    }

    fn instrument() -> Instrument {
        Instrument {
            scrip_code: "114311".into(),
            exchange: Exchange::Nse,
            segment: Segment::Cash,
            tick_size: 0.05,
            lot_size: 1,
        }
    }

    #[tokio::test]
    async fn market_order_fills_at_last_trade() {
        let (broker, _kv, prices) = setup();
        prices.update_tick("114311", 7.88, 7.85, 7.90, Utc::now());

        let id = broker
            .place_order(
                &instrument(),
                &Order::Market {
                    side: OrderSide::Buy,
                    quantity: 100,
                },
            )
            .await
            .unwrap();

        let status = broker.order_status(&id).await.unwrap();
        assert_eq!(status.state, OrderState::Filled);
        assert_eq!(status.filled_qty, 100);
        assert!((status.avg_price - 7.88).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_order_without_price_rejected() {
        let (broker, _kv, _prices) = setup();
        let err = broker
            .place_order(
                &instrument(),
                &Order::Market {
                    side: OrderSide::Buy,
                    quantity: 100,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[tokio::test]
    async fn limit_order_fills_at_limit() {
        let (broker, _kv, _prices) = setup();
        let id = broker
            .place_order(
                &instrument(),
                &Order::Limit {
                    side: OrderSide::Sell,
                    quantity: 60,
                    limit_price: 8.20,
                },
            )
            .await
            .unwrap();
        let status = broker.order_status(&id).await.unwrap();
        assert!((status.avg_price - 8.20).abs() < 1e-9);
    }

    #[tokio::test]
    async fn partial_fill_fraction_and_cancel_remainder() {
        let (broker, kv, prices) = setup();
        prices.update_tick("114311", 7.88, 7.85, 7.90, Utc::now());
        broker.update_settings(&VirtualSettings {
            capital: 1_000_000.0,
            fill_fraction: 0.6,
        });

        let id = broker
            .place_order(
                &instrument(),
                &Order::Market {
                    side: OrderSide::Buy,
                    quantity: 100,
                },
            )
            .await
            .unwrap();

        let status = broker.order_status(&id).await.unwrap();
        assert_eq!(status.state, OrderState::PartiallyFilled);
        assert_eq!(status.filled_qty, 60);

        broker.cancel_order(&id).await.unwrap();
        let status = broker.order_status(&id).await.unwrap();
        assert_eq!(status.state, OrderState::Cancelled);
        assert_eq!(status.filled_qty, 60);

        // Position reflects the partial fill only.
        let pos: VirtualPosition = kv.get(&virtual_position_key("114311")).unwrap();
        assert_eq!(pos.quantity, 60);
    }

    #[tokio::test]
    async fn round_trip_flattens_position() {
        let (broker, kv, prices) = setup();
        prices.update_tick("114311", 7.88, 7.85, 7.90, Utc::now());

        broker
            .place_order(
                &instrument(),
                &Order::Market { side: OrderSide::Buy, quantity: 100 },
            )
            .await
            .unwrap();
        broker
            .place_order(
                &instrument(),
                &Order::Limit {
                    side: OrderSide::Sell,
                    quantity: 100,
                    limit_price: 8.20,
                },
            )
            .await
            .unwrap();

        assert!(kv
            .get::<VirtualPosition>(&virtual_position_key("114311"))
            .is_none());
    }

    #[tokio::test]
    async fn cancel_unknown_order_errors() {
        let (broker, _kv, _prices) = setup();
        assert!(matches!(
            broker.cancel_order("missing").await.unwrap_err(),
            BrokerError::UnknownOrder(_)
        ));
    }
}
