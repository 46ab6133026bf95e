// =============================================================================
// Signal Ingress — from topic record to watchlist admission
// =============================================================================
//
// One worker per topic partition; within a partition records are handled in
// offset order. The pipeline is: parse, dedup, age gate, trading-hours gate,
// per-signal risk validation, admit. Every drop is terminal and committed;
// only infrastructure failures leave the offset uncommitted so the record
// redelivers — which is safe because admission is idempotent under the dedup
// cache.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::bus::{Record, TopicConsumer};
use crate::error::EngineError;
use crate::hours::TradingHoursGate;
use crate::idempotency::IdempotencyCache;
use crate::risk::RiskPolicy;
use crate::signal::{PendingSignal, RiskEvent, StrategySignal};
use crate::types::Severity;

pub struct SignalIngress {
    state: Arc<AppState>,
    risk: Arc<RiskPolicy>,
    idempotency: Arc<IdempotencyCache>,
    events: mpsc::UnboundedSender<RiskEvent>,
}

impl SignalIngress {
    pub fn new(
        state: Arc<AppState>,
        risk: Arc<RiskPolicy>,
        idempotency: Arc<IdempotencyCache>,
        events: mpsc::UnboundedSender<RiskEvent>,
    ) -> Self {
        Self {
            state,
            risk,
            idempotency,
            events,
        }
    }

    fn emit(&self, code: &str, severity: Severity, scope: &str, message: String) {
        let _ = self
            .events
            .send(RiskEvent::new(code, severity, scope, message));
    }

    /// Consume one partition until the bus closes. The commit happens after
    /// the record reached a terminal outcome (admitted or dropped); a crash
    /// in between redelivers, and the dedup cache absorbs the replay.
    pub async fn run(&self, mut consumer: impl TopicConsumer, partition: u32) -> Result<()> {
        info!(partition, "signal ingress worker started");
        loop {
            let record = consumer
                .next()
                .await
                .context("signal consumer poll failed")?;

            match self.handle_record(&record, Utc::now()) {
                Ok(scrip) => {
                    debug!(partition, offset = record.offset, scrip = %scrip, "signal admitted");
                }
                Err(e) => {
                    debug!(partition, offset = record.offset, code = e.code(), "signal dropped");
                }
            }

            consumer
                .commit(&record)
                .await
                .context("signal commit failed")?;
        }
    }

    /// Run one record through the admission pipeline. Returns the admitted
    /// instrument, or the terminal drop reason.
    pub fn handle_record(&self, record: &Record, now: DateTime<Utc>) -> Result<String, EngineError> {
        // 1. Parse — non-retryable on failure.
        let signal: StrategySignal =
            serde_json::from_value(record.payload.clone()).map_err(|e| {
                let err = EngineError::IngestParse(e.to_string());
                warn!(offset = record.offset, error = %e, "unparseable signal dropped");
                self.emit(err.code(), Severity::Warning, "ingress", err.to_string());
                err
            })?;

        let scrip = signal.scrip_code.clone();

        // 2. Idempotency.
        let key = signal.idempotency_key();
        if self.idempotency.check_and_insert(&key, now) {
            let err = EngineError::IngestDuplicate(key);
            self.emit(err.code(), Severity::Info, &scrip, err.to_string());
            return Err(err);
        }

        // 3. Age gate.
        let config = self.state.runtime_config.read().clone();
        let age = now - signal.produced_at();
        if age > Duration::seconds(config.max_signal_age_secs as i64) {
            let err = EngineError::IngestStale(format!(
                "{}s old (max {}s)",
                age.num_seconds(),
                config.max_signal_age_secs
            ));
            self.emit(err.code(), Severity::Info, &scrip, err.to_string());
            return Err(err);
        }

        // 4. Trading hours for the signal's exchange.
        let exchange =
            TradingHoursGate::infer_exchange(signal.exchange.as_deref(), &signal.company_name);
        if !self.state.hours.is_open(exchange, now) {
            let err = EngineError::IngestOutOfHours(format!("{exchange} session closed"));
            self.emit(err.code(), Severity::Info, &scrip, err.to_string());
            return Err(err);
        }

        // 5. Per-signal risk validation (the policy emits its own detailed
        // event; this one records the ingress outcome).
        if let Err(inner) = self.risk.validate_signal(
            &config,
            &scrip,
            signal.direction(),
            signal.entry_price,
            signal.stop_loss,
            signal.target1,
        ) {
            let err = EngineError::IngestRiskReject(inner.code().to_string());
            self.emit(err.code(), Severity::Info, &scrip, inner.to_string());
            return Err(err);
        }

        // 6. Admit (newer replaces older per instrument) and preload candle
        // history when the ring is empty.
        let pending = PendingSignal::new(
            signal,
            now,
            Duration::minutes(config.pending_ttl_minutes),
        );
        let replaced = self.state.watchlist.admit(pending).is_some();

        if self.state.candle_history.is_empty(&scrip) {
            // The live candle topic backfills the ring; until then the
            // volume gate passes neutrally.
            debug!(scrip = %scrip, "no candle history yet for admitted signal");
        }

        info!(
            scrip = %scrip,
            replaced,
            pending = self.state.watchlist.len(),
            "signal admitted to watchlist"
        );
        self.state.increment_version();

        Ok(scrip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::RuntimeConfig;
    use chrono::TimeZone;
    use serde_json::json;

    fn setup() -> (SignalIngress, Arc<AppState>, mpsc::UnboundedReceiver<RiskEvent>) {
        let mut config = RuntimeConfig::default();
        config.kv_snapshot_path = String::new();
        let (engine_tx, _engine_rx) = mpsc::unbounded_channel();
        let state = Arc::new(AppState::new(config, engine_tx));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let risk = Arc::new(RiskPolicy::new(events_tx.clone()));
        let idempotency = Arc::new(IdempotencyCache::new(Duration::hours(24), 100_000));

        (
            SignalIngress::new(state.clone(), risk, idempotency, events_tx),
            state,
            events_rx,
        )
    }

    /// 10:15 IST on a weekday — inside the NSE session.
    fn session_now() -> DateTime<Utc> {
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2026, 8, 3, 10, 15, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record(payload: serde_json::Value) -> Record {
        Record {
            topic: "trading-signals-v2".into(),
            partition: 0,
            offset: 0,
            key: None,
            payload,
            published_at: Utc::now(),
        }
    }

    fn valid_payload(now: DateTime<Utc>) -> serde_json::Value {
        json!({
            "signalId": "sig-1",
            "scripCode": "114311",
            "companyName": "GRANULES",
            "signal": "BUY",
            "entryPrice": 7.90,
            "stopLoss": 7.74,
            "target1": 8.20,
            "confidence": 0.8,
            "exchange": "N",
            "timestamp": now.timestamp_millis()
        })
    }

    #[test]
    fn valid_signal_is_admitted() {
        let (ingress, state, _events) = setup();
        let now = session_now();

        let scrip = ingress.handle_record(&record(valid_payload(now)), now).unwrap();
        assert_eq!(scrip, "114311");
        assert_eq!(state.watchlist.len(), 1);

        let pending = state.watchlist.for_scrip("114311").unwrap();
        assert!(pending.expires_at > pending.admitted_at);
    }

    /// Idempotency invariant: redelivering the same signal does not change
    /// state.
    #[test]
    fn redelivery_is_dropped_as_duplicate() {
        let (ingress, state, _events) = setup();
        let now = session_now();

        ingress.handle_record(&record(valid_payload(now)), now).unwrap();
        let version_after_first = state.current_state_version();

        let err = ingress
            .handle_record(&record(valid_payload(now)), now)
            .unwrap_err();
        assert_eq!(err.code(), "INGEST_DUPLICATE");
        assert_eq!(state.watchlist.len(), 1);
        assert_eq!(state.current_state_version(), version_after_first);
    }

    #[test]
    fn unparseable_record_dropped() {
        let (ingress, state, mut events) = setup();
        let now = session_now();

        let err = ingress
            .handle_record(&record(json!({"not": "a signal"})), now)
            .unwrap_err();
        assert_eq!(err.code(), "INGEST_PARSE");
        assert!(state.watchlist.is_empty());

        let ev = events.try_recv().unwrap();
        assert_eq!(ev.event_type, "INGEST_PARSE");
        assert_eq!(ev.severity, Severity::Warning);
    }

    #[test]
    fn stale_signal_dropped() {
        let (ingress, _state, _events) = setup();
        let now = session_now();

        let mut payload = valid_payload(now);
        payload["timestamp"] = json!((now - Duration::seconds(121)).timestamp_millis());
        payload["signalId"] = json!("sig-stale");

        let err = ingress.handle_record(&record(payload), now).unwrap_err();
        assert_eq!(err.code(), "INGEST_STALE");
    }

    #[test]
    fn out_of_hours_dropped() {
        let (ingress, _state, _events) = setup();
        // 03:00 IST — before the open.
        let now = chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2026, 8, 3, 3, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let err = ingress
            .handle_record(&record(valid_payload(now)), now)
            .unwrap_err();
        assert_eq!(err.code(), "INGEST_OUT_OF_HOURS");
    }

    #[test]
    fn commodity_heuristic_uses_mcx_session() {
        let (ingress, state, _events) = setup();
        // 21:00 IST — NSE closed, MCX open.
        let now = chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2026, 8, 3, 21, 0, 0)
            .unwrap()
            .with_timezone(&Utc);

        let mut payload = valid_payload(now);
        payload["companyName"] = json!("CRUDEOIL 25AUG FUT");
        payload["scripCode"] = json!("217001");
        payload["signalId"] = json!("sig-mcx");
        payload.as_object_mut().unwrap().remove("exchange");

        ingress.handle_record(&record(payload), now).unwrap();
        assert!(state.watchlist.for_scrip("217001").is_some());
    }

    #[test]
    fn risk_reject_dropped_with_reason() {
        let (ingress, state, mut events) = setup();
        let now = session_now();

        // Stop 2.53% away: VALIDATION_STOP_TOO_FAR.
        let mut payload = valid_payload(now);
        payload["stopLoss"] = json!(7.70);
        payload["signalId"] = json!("sig-wide-stop");

        let err = ingress.handle_record(&record(payload), now).unwrap_err();
        assert_eq!(err.code(), "INGEST_RISK_REJECT");
        assert!(state.watchlist.is_empty());

        let codes: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.event_type)
            .collect();
        assert!(codes.contains(&"VALIDATION_STOP_TOO_FAR".to_string()));
        assert!(codes.contains(&"INGEST_RISK_REJECT".to_string()));
    }

    #[test]
    fn newer_signal_replaces_older_for_instrument() {
        let (ingress, state, _events) = setup();
        let now = session_now();

        ingress.handle_record(&record(valid_payload(now)), now).unwrap();

        let mut newer = valid_payload(now);
        newer["signalId"] = json!("sig-2");
        newer["entryPrice"] = json!(7.95);
        newer["stopLoss"] = json!(7.80);
        newer["target1"] = json!(8.25);
        ingress.handle_record(&record(newer), now).unwrap();

        assert_eq!(state.watchlist.len(), 1);
        let pending = state.watchlist.for_scrip("114311").unwrap();
        assert!((pending.signal.entry_price - 7.95).abs() < 1e-9);
    }
}
