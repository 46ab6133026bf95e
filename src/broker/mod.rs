// =============================================================================
// Broker Adapter — order model, trait seam, and retry policy
// =============================================================================
//
// The engine speaks to every broker through the `Broker` trait: place, modify,
// cancel, and status. Orders are a sum type — the variant carries exactly the
// prices it needs, nothing is optional-by-convention. Transient failures
// (transport, timeout) are retried at most three times with exponential
// backoff; rejections are not.
// =============================================================================

pub mod paisa;
pub mod paper;
pub mod verifier;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::types::{Exchange, Segment};

/// Backoff schedule for transient broker failures.
const RETRY_BACKOFF_MS: [u64; 3] = [250, 1_000, 4_000];

// ---------------------------------------------------------------------------
// Order model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// The instrument an order is routed to — the execution instrument, which may
/// differ from the signal instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instrument {
    pub scrip_code: String,
    pub exchange: Exchange,
    pub segment: Segment,
    pub tick_size: f64,
    pub lot_size: i64,
}

/// An order is exactly one of these shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum Order {
    Market {
        side: OrderSide,
        quantity: i64,
    },
    Limit {
        side: OrderSide,
        quantity: i64,
        limit_price: f64,
    },
    StopLimit {
        side: OrderSide,
        quantity: i64,
        trigger_price: f64,
        limit_price: f64,
    },
}

impl Order {
    pub fn side(&self) -> OrderSide {
        match self {
            Self::Market { side, .. } | Self::Limit { side, .. } | Self::StopLimit { side, .. } => {
                *side
            }
        }
    }

    pub fn quantity(&self) -> i64 {
        match self {
            Self::Market { quantity, .. }
            | Self::Limit { quantity, .. }
            | Self::StopLimit { quantity, .. } => *quantity,
        }
    }

    pub fn limit_price(&self) -> Option<f64> {
        match self {
            Self::Market { .. } => None,
            Self::Limit { limit_price, .. } | Self::StopLimit { limit_price, .. } => {
                Some(*limit_price)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderState {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    /// No further fills can arrive in this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusReport {
    pub order_id: String,
    pub state: OrderState,
    pub filled_qty: i64,
    pub avg_price: f64,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// The broker refused the order — not retryable.
    #[error("broker rejected: {0}")]
    Rejected(String),

    /// The call exceeded its deadline.
    #[error("broker timeout: {0}")]
    Timeout(String),

    /// Transport-level failure (connection, 5xx).
    #[error("broker transport error: {0}")]
    Transport(String),

    /// Authentication failed or the token could not be refreshed.
    #[error("broker auth error: {0}")]
    Auth(String),

    #[error("unknown order: {0}")]
    UnknownOrder(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Transport(_))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Broker: Send + Sync {
    /// Submit an order, returning the broker's opaque order id.
    async fn place_order(&self, instrument: &Instrument, order: &Order)
        -> Result<String, BrokerError>;

    /// Re-price a working order.
    async fn modify_order(&self, order_id: &str, new_limit_price: f64)
        -> Result<(), BrokerError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), BrokerError>;

    async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, BrokerError>;
}

/// Place an order, retrying transient failures on the 250ms/1s/4s schedule.
/// Rejections and auth failures surface immediately.
pub async fn place_with_retry(
    broker: &dyn Broker,
    instrument: &Instrument,
    order: &Order,
) -> Result<String, BrokerError> {
    let mut last_err: Option<BrokerError> = None;

    for (attempt, backoff_ms) in std::iter::once(&0u64)
        .chain(RETRY_BACKOFF_MS.iter())
        .enumerate()
    {
        if *backoff_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(*backoff_ms)).await;
        }

        match broker.place_order(instrument, order).await {
            Ok(order_id) => return Ok(order_id),
            Err(e) if e.is_transient() => {
                warn!(
                    scrip = %instrument.scrip_code,
                    attempt,
                    error = %e,
                    "transient broker failure — will retry"
                );
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_err.unwrap_or_else(|| BrokerError::Transport("retries exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct FlakyBroker {
        failures_before_success: Mutex<u32>,
        transient: bool,
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn place_order(
            &self,
            _instrument: &Instrument,
            _order: &Order,
        ) -> Result<String, BrokerError> {
            let mut left = self.failures_before_success.lock();
            if *left > 0 {
                *left -= 1;
                return if self.transient {
                    Err(BrokerError::Transport("flaky".into()))
                } else {
                    Err(BrokerError::Rejected("margin".into()))
                };
            }
            Ok("ord-1".into())
        }

        async fn modify_order(&self, _: &str, _: f64) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn cancel_order(&self, _: &str) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn order_status(&self, order_id: &str) -> Result<OrderStatusReport, BrokerError> {
            Ok(OrderStatusReport {
                order_id: order_id.into(),
                state: OrderState::Filled,
                filled_qty: 1,
                avg_price: 1.0,
            })
        }
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

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let broker = Arc::new(FlakyBroker {
            failures_before_success: Mutex::new(2),
            transient: true,
        });
        let order = Order::Market {
            side: OrderSide::Buy,
            quantity: 10,
        };
        let id = place_with_retry(broker.as_ref(), &instrument(), &order)
            .await
            .unwrap();
        assert_eq!(id, "ord-1");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let broker = FlakyBroker {
            failures_before_success: Mutex::new(10),
            transient: true,
        };
        let order = Order::Market {
            side: OrderSide::Buy,
            quantity: 10,
        };
        let err = place_with_retry(&broker, &instrument(), &order)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rejections_surface_immediately() {
        let broker = FlakyBroker {
            failures_before_success: Mutex::new(1),
            transient: false,
        };
        let order = Order::Limit {
            side: OrderSide::Sell,
            quantity: 10,
            limit_price: 8.20,
        };
        let err = place_with_retry(&broker, &instrument(), &order)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Rejected(_)));
    }

    #[test]
    fn order_accessors() {
        let o = Order::StopLimit {
            side: OrderSide::Sell,
            quantity: 75,
            trigger_price: 7.75,
            limit_price: 7.70,
        };
        assert_eq!(o.side(), OrderSide::Sell);
        assert_eq!(o.quantity(), 75);
        assert_eq!(o.limit_price(), Some(7.70));
        assert_eq!(
            Order::Market { side: OrderSide::Buy, quantity: 1 }.limit_price(),
            None
        );
    }

    #[test]
    fn order_serde_is_tagged() {
        let o = Order::Limit {
            side: OrderSide::Buy,
            quantity: 10,
            limit_price: 7.90,
        };
        let json = serde_json::to_value(&o).unwrap();
        assert_eq!(json["type"], "LIMIT");
        assert_eq!(json["side"], "BUY");
    }
}
