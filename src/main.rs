// =============================================================================
// Meridian — intraday signal-to-position execution engine
// =============================================================================
//
// The engine starts in paper mode for safety. Live execution requires broker
// credentials in the environment and an explicit mode switch via the admin
// API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod bus;
mod engine;
mod entry;
mod error;
mod hours;
mod idempotency;
mod ingress;
mod kv;
mod market_data;
mod pivots;
mod portfolio;
mod publisher;
mod risk;
mod runtime_config;
mod signal;
mod sizing;
mod types;
mod watchlist;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::paisa::PaisaClient;
use crate::broker::paper::PaperBroker;
use crate::broker::verifier::OrderVerifier;
use crate::broker::Broker;
use crate::bus::memory::InMemoryBus;
use crate::bus::{TOPIC_CANDLES_1M, TOPIC_MARKET_DATA, TOPIC_SIGNALS, TOPIC_SIGNALS_LEGACY};
use crate::engine::{EngineEvent, PositionManager};
use crate::idempotency::IdempotencyCache;
use crate::ingress::SignalIngress;
use crate::publisher::ResultPublisher;
use crate::risk::RiskPolicy;
use crate::runtime_config::RuntimeConfig;
use crate::types::ExecutionMode;

const CONFIG_PATH: &str = "meridian_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Execution Engine — Starting Up           ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: force paper mode on startup; live is an explicit admin action.
    config.mode = ExecutionMode::Paper;

    if let Ok(url) = std::env::var("MERIDIAN_PIVOT_URL") {
        config.pivot_service_url = url;
    }

    info!(
        mode = %config.mode,
        account_value = config.account_value,
        zone = %config.trading_zone,
        "engine starting in SAFE mode (paper)"
    );

    // ── 2. Shared state & event stream ───────────────────────────────────
    let (engine_tx, engine_rx) = tokio::sync::mpsc::unbounded_channel::<EngineEvent>();
    let state = Arc::new(AppState::new(config.clone(), engine_tx.clone()));

    // ── 3. Bus ───────────────────────────────────────────────────────────
    let partitions: u32 = std::env::var("MERIDIAN_BUS_PARTITIONS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(4);
    let bus = Arc::new(InMemoryBus::new(partitions));

    // ── 4. Brokers ───────────────────────────────────────────────────────
    let paper_broker: Arc<dyn Broker> =
        Arc::new(PaperBroker::new(state.kv.clone(), state.price_cache.clone()));

    let live_broker: Option<Arc<dyn Broker>> = match (
        std::env::var("MERIDIAN_BROKER_CLIENT_CODE"),
        std::env::var("MERIDIAN_BROKER_PIN"),
        std::env::var("MERIDIAN_BROKER_TOTP_SECRET_HEX"),
        std::env::var("MERIDIAN_BROKER_URL"),
    ) {
        (Ok(client_code), Ok(pin), Ok(totp_secret), Ok(url)) => {
            info!(url = %url, "live broker adapter configured");
            Some(Arc::new(PaisaClient::new(client_code, pin, totp_secret, url)))
        }
        _ => {
            info!("no live broker credentials — live mode will route to paper");
            None
        }
    };

    // ── 5. Verifier, publisher, risk policy ─────────────────────────────
    let verifier_broker = live_broker.clone().unwrap_or_else(|| paper_broker.clone());
    let verifier = Arc::new(OrderVerifier::new(verifier_broker, engine_tx.clone()));
    verifier.restore_outstanding(&state.kv);

    let publisher = Arc::new(ResultPublisher::new(bus.clone()));

    let (risk_events_tx, mut risk_events_rx) = tokio::sync::mpsc::unbounded_channel();
    let risk = Arc::new(RiskPolicy::new(risk_events_tx.clone()));

    // Risk-event pump: every emitted event lands in the diagnostics ring,
    // the SSE feed, and the risk-events topic.
    {
        let pump_state = state.clone();
        let pump_publisher = publisher.clone();
        tokio::spawn(async move {
            while let Some(event) = risk_events_rx.recv().await {
                pump_state.push_risk_event(event.clone());
                pump_publisher.publish_risk_event(&event).await;
            }
        });
    }

    // ── 6. Position manager (single writer) ──────────────────────────────
    let manager = PositionManager::new(
        state.clone(),
        paper_broker,
        live_broker,
        verifier.clone(),
        publisher.clone(),
        risk.clone(),
        risk_events_tx.clone(),
    );
    tokio::spawn(manager.run(engine_rx));

    // ── 7. Order verifier poller ─────────────────────────────────────────
    {
        let poll = std::time::Duration::from_secs(config.verify_poll_interval_secs.max(1));
        tokio::spawn(verifier.clone().run(poll));
    }

    // ── 8. Signal ingress workers (one per partition per topic) ─────────
    let idempotency = Arc::new(IdempotencyCache::new(
        chrono::Duration::hours(config.idempotency_ttl_hours),
        config.idempotency_capacity,
    ));
    for topic in [TOPIC_SIGNALS, TOPIC_SIGNALS_LEGACY] {
        for partition in 0..bus.partition_count() {
            let consumer = match bus.subscribe(topic, partition) {
                Ok(c) => c,
                Err(e) => {
                    error!(topic, partition, error = %e, "failed to subscribe signal consumer");
                    continue;
                }
            };
            let ingress = SignalIngress::new(
                state.clone(),
                risk.clone(),
                idempotency.clone(),
                risk_events_tx.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = ingress.run(consumer, partition).await {
                    error!(topic, partition, error = %e, "signal ingress worker stopped");
                }
            });
        }
    }

    // ── 9. Market-data consumers ─────────────────────────────────────────
    for partition in 0..bus.partition_count() {
        if let Ok(consumer) = bus.subscribe(TOPIC_MARKET_DATA, partition) {
            let cache = state.price_cache.clone();
            let tx = engine_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = market_data::feed::run_tick_consumer(consumer, cache, tx).await {
                    error!(partition, error = %e, "tick consumer stopped");
                }
            });
        }
        if let Ok(consumer) = bus.subscribe(TOPIC_CANDLES_1M, partition) {
            let history = state.candle_history.clone();
            let tx = engine_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = market_data::feed::run_candle_consumer(consumer, history, tx).await
                {
                    error!(partition, error = %e, "candle consumer stopped");
                }
            });
        }
    }

    // ── 10. Optional WebSocket tick bridge ───────────────────────────────
    if let Ok(feed_url) = std::env::var("MERIDIAN_TICK_FEED_URL") {
        let bridge_bus = bus.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::feed::run_tick_ws_bridge(&feed_url, bridge_bus.clone()).await
                {
                    error!(error = %e, "tick feed bridge error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    // ── 11. Periodic risk monitor ────────────────────────────────────────
    {
        let tx = engine_tx.clone();
        let interval_secs = config.risk_monitor_interval_secs.max(1);
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            loop {
                ticker.tick().await;
                if tx.send(EngineEvent::RiskCheck).is_err() {
                    break;
                }
            }
        });
    }

    // ── 12. Admin API server ─────────────────────────────────────────────
    {
        let api_state = state.clone();
        let bind_addr =
            std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
        tokio::spawn(async move {
            let app = api::rest::router(api_state);
            match tokio::net::TcpListener::bind(&bind_addr).await {
                Ok(listener) => {
                    info!(addr = %bind_addr, "admin API listening");
                    if let Err(e) = axum::serve(listener, app).await {
                        error!(error = %e, "admin API server failed");
                    }
                }
                Err(e) => error!(addr = %bind_addr, error = %e, "failed to bind admin API"),
            }
        });
    }

    info!("all subsystems running. Press Ctrl+C to stop.");

    // ── 13. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Give outstanding verifications a grace period to resolve, then persist
    // whatever is left for next-start reconciliation.
    let grace = std::time::Duration::from_secs(config.shutdown_grace_secs);
    let deadline = tokio::time::Instant::now() + grace;
    while verifier.outstanding() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    verifier.persist_outstanding(&state.kv);

    if let Err(e) = state.kv.persist() {
        error!(error = %e, "failed to persist kv snapshot on shutdown");
    }
    if let Err(e) = state.runtime_config.read().save(CONFIG_PATH) {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("meridian shut down complete.");
    Ok(())
}
