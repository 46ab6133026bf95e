// =============================================================================
// Central Application State — Meridian execution engine
// =============================================================================
//
// The single source of truth the admin surface and SSE feed read from. The
// position manager task is the only writer of `active_trade`, `portfolio`,
// and the watchlist slot; every other field is either owned by its subsystem
// (interior mutability) or append-only diagnostics.
//
// Thread safety:
//   - AtomicU64 for lock-free version tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystems that manage their own interior mutability.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

use crate::engine::trade::ActiveTrade;
use crate::engine::EngineEvent;
use crate::hours::TradingHoursGate;
use crate::kv::KvStore;
use crate::market_data::{CandleHistory, PriceCache};
use crate::pivots::PivotClient;
use crate::portfolio::PortfolioState;
use crate::runtime_config::RuntimeConfig;
use crate::signal::RiskEvent;
use crate::watchlist::PendingWatchlist;

/// Maximum risk events retained for the admin surface.
const MAX_RECENT_RISK_EVENTS: usize = 100;

/// Capacity of the SSE broadcast channel. Slow consumers drop updates.
const STREAM_CHANNEL_CAPACITY: usize = 256;

pub struct AppState {
    // ── Version tracking ────────────────────────────────────────────────
    /// Incremented on every meaningful state mutation; the SSE feed and
    /// dashboards key off it.
    pub state_version: AtomicU64,

    // ── Configuration ───────────────────────────────────────────────────
    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub hours: TradingHoursGate,

    // ── Storage & market data ───────────────────────────────────────────
    pub kv: Arc<KvStore>,
    pub price_cache: Arc<PriceCache>,
    pub candle_history: Arc<CandleHistory>,
    pub pivots: Arc<PivotClient>,

    // ── Signal pipeline ─────────────────────────────────────────────────
    pub watchlist: Arc<PendingWatchlist>,

    // ── Position & portfolio (written only by the manager task) ────────
    pub portfolio: RwLock<PortfolioState>,
    pub active_trade: RwLock<Option<ActiveTrade>>,
    pub completed_trades: RwLock<Vec<ActiveTrade>>,

    // ── Diagnostics ─────────────────────────────────────────────────────
    pub recent_risk_events: RwLock<Vec<RiskEvent>>,

    // ── Plumbing ────────────────────────────────────────────────────────
    pub engine_tx: mpsc::UnboundedSender<EngineEvent>,
    /// Position and order updates for the SSE stream.
    pub stream_tx: broadcast::Sender<serde_json::Value>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig, engine_tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        let kv = if config.kv_snapshot_path.is_empty() {
            Arc::new(KvStore::ephemeral())
        } else {
            Arc::new(KvStore::with_snapshot(&config.kv_snapshot_path))
        };

        let hours = TradingHoursGate::from_config(&config);
        let session_date = hours.session_date(Utc::now());

        let price_cache = Arc::new(PriceCache::new(
            Duration::seconds(config.price_ttl_secs as i64),
            kv.clone(),
        ));
        let candle_history = Arc::new(CandleHistory::new(config.candle_history_len));
        let pivots = Arc::new(PivotClient::new(config.pivot_service_url.clone()));
        let portfolio = PortfolioState::new(config.account_value, session_date);

        let (stream_tx, _) = broadcast::channel(STREAM_CHANNEL_CAPACITY);

        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            hours,
            kv,
            price_cache,
            candle_history,
            pivots,
            watchlist: Arc::new(PendingWatchlist::new()),
            portfolio: RwLock::new(portfolio),
            active_trade: RwLock::new(None),
            completed_trades: RwLock::new(Vec::new()),
            recent_risk_events: RwLock::new(Vec::new()),
            engine_tx,
            stream_tx,
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Diagnostics ─────────────────────────────────────────────────────

    /// Record a risk event in the bounded ring and push it to the SSE feed.
    pub fn push_risk_event(&self, event: RiskEvent) {
        if let Ok(v) = serde_json::to_value(&event) {
            self.stream("riskEvent", v);
        }
        let mut events = self.recent_risk_events.write();
        events.push(event);
        while events.len() > MAX_RECENT_RISK_EVENTS {
            events.remove(0);
        }
        drop(events);
        self.increment_version();
    }

    /// Push a typed update onto the SSE stream. Lagging receivers miss
    /// updates rather than blocking the engine.
    pub fn stream(&self, kind: &str, payload: serde_json::Value) {
        let _ = self.stream_tx.send(serde_json::json!({
            "kind": kind,
            "stateVersion": self.current_state_version(),
            "payload": payload,
        }));
    }

    /// Push the current active-trade snapshot to the SSE stream.
    pub fn stream_position(&self) {
        let snapshot = self.active_trade.read().clone();
        if let Ok(v) = serde_json::to_value(&snapshot) {
            self.stream("position", v);
        }
    }

    // ── Snapshot builders (admin surface) ──────────────────────────────

    pub fn portfolio_overview(&self) -> PortfolioOverview {
        let portfolio = self.portfolio.read();
        let active = self.active_trade.read();
        let completed = self.completed_trades.read();

        let unrealized = active
            .as_ref()
            .filter(|t| t.status.is_managed())
            .and_then(|t| {
                self.price_cache
                    .last_trade(&t.scrip_code, Utc::now())
                    .map(|ltp| t.pnl_at(ltp, t.position_size))
            })
            .unwrap_or(0.0);

        PortfolioOverview {
            account_value: portfolio.account_value,
            peak_value: portfolio.peak_value,
            daily_realized_pnl: portfolio.daily_realized_pnl,
            unrealized_pnl: unrealized,
            total_exposure: portfolio.total_exposure(),
            open_positions_count: portfolio.open_positions_count,
            completed_today: completed.len(),
            circuit_breaker_tripped: portfolio.circuit_breaker_tripped,
            circuit_breaker_reason: portfolio.circuit_breaker_reason.clone(),
            session_date: portfolio.session_date.to_string(),
            state_version: self.current_state_version(),
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }
}

/// Portfolio summary for `GET /api/v1/portfolio`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioOverview {
    pub account_value: f64,
    pub peak_value: f64,
    pub daily_realized_pnl: f64,
    pub unrealized_pnl: f64,
    pub total_exposure: f64,
    pub open_positions_count: u32,
    pub completed_today: usize,
    pub circuit_breaker_tripped: bool,
    pub circuit_breaker_reason: Option<String>,
    pub session_date: String,
    pub state_version: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Severity;

    fn state() -> Arc<AppState> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = RuntimeConfig::default();
        config.kv_snapshot_path = String::new(); // ephemeral in tests
        Arc::new(AppState::new(config, tx))
    }

    #[test]
    fn version_increments() {
        let s = state();
        let v0 = s.current_state_version();
        s.increment_version();
        assert_eq!(s.current_state_version(), v0 + 1);
    }

    #[test]
    fn risk_event_ring_is_bounded() {
        let s = state();
        for i in 0..150 {
            s.push_risk_event(RiskEvent::new(
                "RISK_TEST",
                Severity::Info,
                "wallet",
                format!("event {i}"),
            ));
        }
        assert_eq!(s.recent_risk_events.read().len(), MAX_RECENT_RISK_EVENTS);
    }

    #[test]
    fn stream_delivers_to_subscribers() {
        let s = state();
        let mut rx = s.stream_tx.subscribe();
        s.stream("position", serde_json::json!({"ok": true}));
        let update = rx.try_recv().unwrap();
        assert_eq!(update["kind"], "position");
        assert_eq!(update["payload"]["ok"], true);
    }

    #[test]
    fn portfolio_overview_defaults() {
        let s = state();
        let overview = s.portfolio_overview();
        assert!((overview.account_value - 1_000_000.0).abs() < 1e-9);
        assert_eq!(overview.open_positions_count, 0);
        assert!(!overview.circuit_breaker_tripped);
    }
}
