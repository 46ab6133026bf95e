// =============================================================================
// Order Verifier — reconciles broker fills back into position state
// =============================================================================
//
// Every submitted order is tracked until it resolves. Resolution produces an
// `OrderVerificationResult` delivered exactly once into the position
// manager's event stream — the verifier never touches trade state directly.
//
// Partial-fill policy: the actual filled quantity is authoritative. At the
// deadline the remainder is cancelled; an entry with any fill succeeds at the
// filled quantity (the manager logs the WARNING), an entry with no fill is a
// failure and the trade goes FAILED.
//
// On shutdown, outstanding verifications are persisted to the KV store so
// the next start can reconcile them instead of orphaning broker orders.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::EngineEvent;
use crate::kv::{pending_verification_key, KvStore};

use super::{Broker, BrokerError, OrderState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderPurpose {
    Entry,
    Exit,
}

/// Emitted exactly once per tracked order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderVerificationResult {
    pub success: bool,
    pub order_id: String,
    pub trade_id: String,
    pub purpose: OrderPurpose,
    pub requested_qty: i64,
    pub filled_qty: i64,
    pub avg_price: f64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackedOrder {
    order_id: String,
    trade_id: String,
    purpose: OrderPurpose,
    requested_qty: i64,
    deadline: DateTime<Utc>,
}

pub struct OrderVerifier {
    broker: Arc<dyn Broker>,
    engine_tx: mpsc::UnboundedSender<EngineEvent>,
    tracked: Mutex<HashMap<String, TrackedOrder>>,
}

impl OrderVerifier {
    pub fn new(broker: Arc<dyn Broker>, engine_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            broker,
            engine_tx,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Track an order until it resolves or `timeout` passes.
    pub fn track(
        &self,
        order_id: &str,
        trade_id: &str,
        purpose: OrderPurpose,
        requested_qty: i64,
        timeout: Duration,
        now: DateTime<Utc>,
    ) {
        let order = TrackedOrder {
            order_id: order_id.to_string(),
            trade_id: trade_id.to_string(),
            purpose,
            requested_qty,
            deadline: now + timeout,
        };
        debug!(order_id, trade_id, ?purpose, requested_qty, "order tracked for verification");
        self.tracked.lock().insert(order_id.to_string(), order);
    }

    pub fn outstanding(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Poll every tracked order once. Separated from `run` so tests drive it
    /// deterministically.
    pub async fn poll_once(&self, now: DateTime<Utc>) {
        let snapshot: Vec<TrackedOrder> = self.tracked.lock().values().cloned().collect();

        for order in snapshot {
            let status = match self.broker.order_status(&order.order_id).await {
                Ok(s) => s,
                Err(BrokerError::UnknownOrder(_)) => {
                    self.resolve(
                        &order,
                        false,
                        0,
                        0.0,
                        "order unknown to broker".to_string(),
                    );
                    continue;
                }
                Err(e) if e.is_transient() => {
                    debug!(order_id = %order.order_id, error = %e, "status poll transient failure");
                    continue;
                }
                Err(e) => {
                    warn!(order_id = %order.order_id, error = %e, "status poll failed");
                    continue;
                }
            };

            match status.state {
                OrderState::Filled => {
                    self.resolve(
                        &order,
                        true,
                        status.filled_qty,
                        status.avg_price,
                        "filled".to_string(),
                    );
                }
                OrderState::Rejected => {
                    self.resolve(&order, false, 0, 0.0, "rejected by broker".to_string());
                }
                OrderState::Cancelled => {
                    if status.filled_qty > 0 {
                        self.resolve(
                            &order,
                            true,
                            status.filled_qty,
                            status.avg_price,
                            format!(
                                "cancelled with partial fill {}/{}",
                                status.filled_qty, order.requested_qty
                            ),
                        );
                    } else {
                        self.resolve(&order, false, 0, 0.0, "cancelled unfilled".to_string());
                    }
                }
                OrderState::Pending | OrderState::PartiallyFilled => {
                    if now < order.deadline {
                        continue;
                    }
                    // Deadline passed: cancel the remainder, then settle on
                    // whatever actually filled.
                    if let Err(e) = self.broker.cancel_order(&order.order_id).await {
                        warn!(order_id = %order.order_id, error = %e, "cancel at deadline failed");
                    }
                    if status.filled_qty > 0 && order.purpose == OrderPurpose::Entry {
                        self.resolve(
                            &order,
                            true,
                            status.filled_qty,
                            status.avg_price,
                            format!(
                                "partial fill {}/{} adopted, remainder cancelled",
                                status.filled_qty, order.requested_qty
                            ),
                        );
                    } else {
                        self.resolve(
                            &order,
                            false,
                            status.filled_qty,
                            status.avg_price,
                            "timed out before fill".to_string(),
                        );
                    }
                }
            }
        }
    }

    /// Remove the order and emit its result. The removal gate makes emission
    /// exactly-once even if two polls race.
    fn resolve(
        &self,
        order: &TrackedOrder,
        success: bool,
        filled_qty: i64,
        avg_price: f64,
        message: String,
    ) {
        if self.tracked.lock().remove(&order.order_id).is_none() {
            return;
        }

        info!(
            order_id = %order.order_id,
            trade_id = %order.trade_id,
            purpose = ?order.purpose,
            success,
            filled_qty,
            avg_price,
            message = %message,
            "order verification resolved"
        );

        let _ = self.engine_tx.send(EngineEvent::Verification(OrderVerificationResult {
            success,
            order_id: order.order_id.clone(),
            trade_id: order.trade_id.clone(),
            purpose: order.purpose,
            requested_qty: order.requested_qty,
            filled_qty,
            avg_price,
            message,
        }));
    }

    /// Poll forever at `interval`. Spawned once at startup.
    pub async fn run(self: Arc<Self>, interval: std::time::Duration) {
        info!(interval_secs = interval.as_secs(), "order verifier started");
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            self.poll_once(Utc::now()).await;
        }
    }

    /// Persist outstanding verifications for next-start reconciliation.
    pub fn persist_outstanding(&self, kv: &KvStore) {
        let tracked = self.tracked.lock();
        for order in tracked.values() {
            kv.put(&pending_verification_key(&order.order_id), order);
        }
        if !tracked.is_empty() {
            info!(count = tracked.len(), "outstanding verifications persisted");
        }
    }

    /// Reload verifications persisted by a previous run.
    pub fn restore_outstanding(&self, kv: &KvStore) {
        let keys = kv.keys_with_prefix("verify:pending:");
        let mut restored = 0usize;
        for key in keys {
            if let Some(order) = kv.get::<TrackedOrder>(&key) {
                self.tracked.lock().insert(order.order_id.clone(), order);
                restored += 1;
            }
            kv.remove(&key);
        }
        if restored > 0 {
            info!(count = restored, "outstanding verifications restored from snapshot");
        }
    }
}
