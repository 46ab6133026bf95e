// =============================================================================
// Position Manager — single writer of the trade lifecycle
// =============================================================================
//
// One task owns the open position. Candles, ticks, verification results, and
// admin commands arrive on a serialized event stream; every mutation of the
// active trade, the portfolio, and the watchlist slot happens here and only
// here. The order verifier and risk monitor never write state — they send
// events.
//
// Per candle, the manager first lets an open position evaluate its exits;
// only when the slot is free does the entry pipeline run: evaluate the
// watchlist, pick the best READY candidate by risk/reward, pass the risk
// gates, size, submit, and clear the watchlist.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::broker::verifier::{OrderPurpose, OrderVerificationResult, OrderVerifier};
use crate::broker::{place_with_retry, Broker, Instrument, Order, OrderSide};
use crate::entry::{select_best, EntryEvaluator, EntryReadiness};
use crate::error::EngineError;
use crate::hours::TradingHoursGate;
use crate::market_data::Candle;
use crate::publisher::ResultPublisher;
use crate::risk::RiskPolicy;
use crate::runtime_config::RuntimeConfig;
use crate::signal::{PendingSignal, RiskEvent, TradeResult};
use crate::sizing::PositionSizer;
use crate::types::{round_to_tick, Direction, ExecutionMode, Segment, Severity};

use super::trade::{ActiveTrade, ExecutionParams, ExitReason, ExitTrigger, PendingExit, TradeStatus};
use super::{AdminCommand, EngineEvent};

/// Strategy label stamped on trades this engine opens.
const STRATEGY_NAME: &str = "pivot-retest";

pub struct PositionManager {
    state: Arc<AppState>,
    paper_broker: Arc<dyn Broker>,
    live_broker: Option<Arc<dyn Broker>>,
    verifier: Arc<OrderVerifier>,
    publisher: Arc<ResultPublisher>,
    risk: Arc<RiskPolicy>,
    events: mpsc::UnboundedSender<RiskEvent>,
    evaluator: EntryEvaluator,
}

impl PositionManager {
    pub fn new(
        state: Arc<AppState>,
        paper_broker: Arc<dyn Broker>,
        live_broker: Option<Arc<dyn Broker>>,
        verifier: Arc<OrderVerifier>,
        publisher: Arc<ResultPublisher>,
        risk: Arc<RiskPolicy>,
        events: mpsc::UnboundedSender<RiskEvent>,
    ) -> Self {
        let config = state.runtime_config.read();
        let evaluator = EntryEvaluator::new(config.volume_factor, config.volume_lookback);
        drop(config);

        Self {
            state,
            paper_broker,
            live_broker,
            verifier,
            publisher,
            risk,
            events,
            evaluator,
        }
    }

    /// The broker the current execution mode routes to. Silent behaves like
    /// paper with notifications suppressed downstream.
    fn broker_for(&self, mode: ExecutionMode) -> Arc<dyn Broker> {
        match mode {
            ExecutionMode::Live => self
                .live_broker
                .clone()
                .unwrap_or_else(|| self.paper_broker.clone()),
            ExecutionMode::Paper | ExecutionMode::Silent => self.paper_broker.clone(),
        }
    }

    fn emit(&self, event: RiskEvent) {
        let _ = self.events.send(event);
    }

    /// Consume the event stream until it closes.
    pub async fn run(mut self, mut events_rx: mpsc::UnboundedReceiver<EngineEvent>) {
        info!("position manager started");
        while let Some(event) = events_rx.recv().await {
            self.handle_event(event).await;
        }
        self.emit(RiskEvent::new(
            EngineError::Shutdown.code(),
            Severity::Info,
            "wallet",
            "position manager event stream closed".to_string(),
        ));
        info!("position manager event stream closed");
    }

    pub async fn handle_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Candle(candle) => self.on_candle(candle).await,
            EngineEvent::Tick { scrip_code, last_rate } => self.on_tick(&scrip_code, last_rate),
            EngineEvent::Verification(result) => self.on_verification(result).await,
            EngineEvent::Admin(command) => self.on_admin(command).await,
            EngineEvent::RiskCheck => self.on_risk_check().await,
        }
    }

    // =========================================================================
    // Candles
    // =========================================================================

    async fn on_candle(&mut self, candle: Candle) {
        let config = self.state.runtime_config.read().clone();
        let candle_time = DateTime::from_timestamp_millis(candle.window_start_ms)
            .unwrap_or_else(Utc::now);
        let now = Utc::now();

        // Housekeeping: session roll and watchlist expiry.
        let session_date = self.state.hours.session_date(candle_time);
        self.state.portfolio.write().roll_session(session_date);
        self.expire_watchlist(now);

        let slot_taken = self
            .state
            .active_trade
            .read()
            .as_ref()
            .map(|t| t.status.occupies_slot())
            .unwrap_or(false);

        if slot_taken {
            self.on_position_bar(&config, &candle, candle_time, now).await;
            return;
        }

        self.evaluate_entries(&config, &candle, candle_time, session_date, now)
            .await;
    }

    fn expire_watchlist(&self, now: DateTime<Utc>) {
        for expired in self.state.watchlist.expire_older_than(now) {
            self.emit(RiskEvent::new(
                "EXPIRED",
                Severity::Info,
                expired.scrip_code(),
                format!(
                    "pending signal expired after {} validation attempts",
                    expired.validation_attempts
                ),
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Open-position path
    // -------------------------------------------------------------------------

    async fn on_position_bar(
        &mut self,
        config: &RuntimeConfig,
        candle: &Candle,
        candle_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        let Some(mut trade) = self.state.active_trade.read().clone() else {
            return;
        };
        if trade.scrip_code != candle.scrip_code || !trade.status.is_managed() {
            return;
        }

        trade.observe_bar(candle);
        if trade.advance_trail(&config.trail_stages) {
            info!(
                trade_id = %trade.trade_id,
                stage = trade.trail_stage,
                stop = trade.stop_loss,
                "trailing stop advanced"
            );
        }

        // An exit already in flight: wait for its verification.
        if trade.pending_exit.is_some() {
            self.store_trade(trade);
            return;
        }
        // Escalated exit failures wait for operator acknowledgment.
        if trade.exit_escalated {
            self.store_trade(trade);
            return;
        }

        let trigger = if self.state.hours.past_cutoff(candle_time) {
            Some(ExitTrigger {
                reason: ExitReason::EndOfSession,
                level: candle.close,
            })
        } else {
            trade.check_exit(candle)
        };

        if let Some(trigger) = trigger {
            let partial = trigger.reason == ExitReason::Target1
                && config.mode != ExecutionMode::Live
                && trade.target2.is_some()
                && config.tp1_exit_fraction < 1.0;
            let quantity = if partial {
                ((trade.position_size as f64 * config.tp1_exit_fraction).floor() as i64)
                    .clamp(1, trade.position_size)
            } else {
                trade.position_size
            };
            let is_partial = partial && quantity < trade.position_size;

            self.submit_exit(config, &mut trade, trigger, quantity, is_partial, now)
                .await;
        }

        self.store_trade(trade);
    }

    /// Build and place the exit order, register verification, and track the
    /// retry window. Exit failures escalate after the configured attempts.
    async fn submit_exit(
        &mut self,
        config: &RuntimeConfig,
        trade: &mut ActiveTrade,
        trigger: ExitTrigger,
        quantity: i64,
        is_partial: bool,
        now: DateTime<Utc>,
    ) {
        // Restart the attempt window when the previous failure burst is old.
        if let Some(first) = trade.first_exit_attempt_at {
            if now - first > Duration::seconds(config.exit_verify_window_secs as i64) {
                trade.exit_attempts = 0;
                trade.first_exit_attempt_at = None;
            }
        }

        let order = self.build_exit_order(config, trade, trigger.level, quantity, now);
        let broker = self.broker_for(config.mode);

        info!(
            trade_id = %trade.trade_id,
            reason = %trigger.reason,
            level = trigger.level,
            quantity,
            is_partial,
            "submitting exit order"
        );

        if trade.first_exit_attempt_at.is_none() {
            trade.first_exit_attempt_at = Some(now);
        }
        trade.exit_attempts += 1;

        match place_with_retry(broker.as_ref(), &trade.execution.instrument, &order).await {
            Ok(order_id) => {
                trade.exit_order_id = Some(order_id.clone());
                trade.pending_exit = Some(PendingExit {
                    reason: trigger.reason,
                    exit_level: trigger.level,
                    quantity,
                    is_partial,
                });
                self.verifier.track(
                    &order_id,
                    &trade.trade_id,
                    OrderPurpose::Exit,
                    quantity,
                    Duration::seconds(config.entry_timeout_secs as i64),
                    now,
                );
            }
            Err(e) => {
                warn!(trade_id = %trade.trade_id, error = %e, "exit placement failed");
                trade.exit_failure_reason = Some(e.to_string());
                self.note_broker_failure(config, now);
                self.maybe_escalate_exit(config, trade);
            }
        }
    }

    fn maybe_escalate_exit(&self, config: &RuntimeConfig, trade: &mut ActiveTrade) {
        if trade.exit_attempts >= config.exit_verify_retries && !trade.exit_escalated {
            trade.exit_escalated = true;
            self.emit(RiskEvent::new(
                EngineError::VerifyFail(String::new()).code(),
                Severity::Critical,
                &trade.scrip_code,
                format!(
                    "exit failed {} times for trade {} — operator acknowledgment required",
                    trade.exit_attempts, trade.trade_id
                ),
            ));
        }
    }

    // -------------------------------------------------------------------------
    // Entry pipeline
    // -------------------------------------------------------------------------

    async fn evaluate_entries(
        &mut self,
        config: &RuntimeConfig,
        candle: &Candle,
        candle_time: DateTime<Utc>,
        session_date: chrono::NaiveDate,
        now: DateTime<Utc>,
    ) {
        let Some(pending) = self.state.watchlist.for_scrip(&candle.scrip_code) else {
            return;
        };

        // Pivot levels are a deferral when unavailable — the signal stays
        // pending and retries on the next candle.
        let levels = match self
            .state
            .pivots
            .levels(
                &candle.scrip_code,
                session_date,
                candle.close,
                pending.direction,
            )
            .await
        {
            Ok(levels) => levels,
            Err(e) if e.is_deferral() => {
                debug!(scrip = %candle.scrip_code, error = %e, "pivot lookup deferred");
                self.state.watchlist.update(&candle.scrip_code, |p| {
                    p.validation_attempts += 1;
                    p.last_rejection_reason = Some(e.code().to_string());
                });
                return;
            }
            Err(e) => {
                warn!(scrip = %candle.scrip_code, error = %e, "pivot lookup failed terminally");
                self.state.watchlist.remove(&candle.scrip_code);
                return;
            }
        };

        let prev = self
            .state
            .candle_history
            .previous(&candle.scrip_code, candle.window_start_ms);
        let volume_mean = self.state.candle_history.prior_volume_mean(
            &candle.scrip_code,
            candle.window_start_ms,
            config.volume_lookback,
        );
        let in_golden = self.state.hours.in_golden_window(candle_time);

        let evaluation =
            self.evaluator
                .evaluate(&pending, candle, prev.as_ref(), &levels, volume_mean, in_golden);

        if evaluation.breach_now && pending.breach_candle_start_ms.is_none() {
            self.state.watchlist.update(&candle.scrip_code, |p| {
                p.breach_candle_start_ms = Some(candle.window_start_ms);
            });
        }

        let Some(readiness) = evaluation.ready else {
            if let Some(reason) = evaluation.reject {
                debug!(scrip = %candle.scrip_code, reason, "entry not ready");
                self.state.watchlist.update(&candle.scrip_code, |p| {
                    p.validation_attempts += 1;
                    p.last_rejection_reason = Some(reason.to_string());
                });
            }
            return;
        };

        self.state.watchlist.update(&candle.scrip_code, |p| {
            p.potential_rr = Some(readiness.potential_rr);
        });

        // The watchlist holds one pending per instrument, so this candle can
        // ready at most one candidate; `select_best` keeps the ranking rule in
        // one place for the multi-candidate configuration.
        let Some((candidate, readiness)) =
            select_best(vec![(pending, readiness)])
        else {
            return;
        };

        self.try_enter(config, candidate, readiness, now).await;
    }

    async fn try_enter(
        &mut self,
        config: &RuntimeConfig,
        pending: PendingSignal,
        readiness: EntryReadiness,
        now: DateTime<Utc>,
    ) {
        let scrip = pending.scrip_code().to_string();
        let current_price = readiness.confirm_price;

        // Re-validate the signal's own levels at the current price.
        if self
            .risk
            .validate_signal(
                config,
                &scrip,
                pending.direction,
                current_price,
                pending.signal.stop_loss,
                pending.signal.target1,
            )
            .is_err()
        {
            self.state.watchlist.remove(&scrip);
            return;
        }

        let portfolio_snapshot = self.state.portfolio.read().clone();
        if self
            .risk
            .check_entry_pregates(config, &portfolio_snapshot, &scrip)
            .is_err()
        {
            self.state.watchlist.remove(&scrip);
            return;
        }

        let instrument = Self::execution_instrument(config, &pending);
        let size = PositionSizer::size(
            config,
            &pending.signal,
            portfolio_snapshot.account_value,
            current_price,
            readiness.stop_loss,
            instrument.lot_size,
        );
        if size == 0 {
            self.emit(RiskEvent::new(
                EngineError::SizerZero(String::new()).code(),
                Severity::Info,
                &scrip,
                "position size computed as zero".to_string(),
            ));
            self.state.watchlist.remove(&scrip);
            return;
        }

        if self
            .risk
            .check_entry_sized(
                config,
                &portfolio_snapshot,
                &scrip,
                current_price,
                readiness.stop_loss,
                size,
            )
            .is_err()
        {
            self.state.watchlist.remove(&scrip);
            return;
        }

        // Sanity-bound target2 so the partial-exit path never runs toward an
        // inconsistent level.
        let target2 = pending.signal.target2.filter(|&t2| match pending.direction {
            Direction::Bullish => t2 > readiness.target,
            Direction::Bearish => t2 < readiness.target,
        });

        let mut trade = ActiveTrade::new(
            scrip.clone(),
            pending.signal.company_name.clone(),
            pending.direction,
            STRATEGY_NAME.to_string(),
            pending.signal.produced_at(),
            current_price,
            size,
            readiness.stop_loss,
            readiness.target,
            target2,
            pending.signal.target3,
            ExecutionParams {
                instrument,
                limit_price_entry: pending.signal.order_limit_price_entry,
                limit_price_exit: pending.signal.order_limit_price_exit,
            },
        );
        trade.signal_id = pending.signal.signal_id.clone();

        let order = self.build_entry_order(config, &trade, now);
        let broker = self.broker_for(config.mode);

        info!(
            trade_id = %trade.trade_id,
            scrip = %trade.scrip_code,
            direction = %trade.direction,
            entry = current_price,
            stop = trade.stop_loss,
            target = trade.target1,
            size,
            rr = readiness.potential_rr,
            "submitting entry order"
        );

        match place_with_retry(broker.as_ref(), &trade.execution.instrument, &order).await {
            Ok(order_id) => {
                trade.entry_order_id = Some(order_id.clone());
                trade.status = TradeStatus::PendingFill;

                // Single-active-trade discipline: everything else pending is
                // discarded with it.
                for discarded in self.state.watchlist.all() {
                    if discarded.scrip_code() != scrip {
                        self.emit(RiskEvent::new(
                            EngineError::RiskBlocked(String::new()).code(),
                            Severity::Info,
                            discarded.scrip_code(),
                            "discarded: single-active-trade slot consumed".to_string(),
                        ));
                    }
                }
                self.state.watchlist.clear();

                self.verifier.track(
                    &order_id,
                    &trade.trade_id,
                    OrderPurpose::Entry,
                    size,
                    Duration::seconds(config.entry_timeout_secs as i64),
                    now,
                );
                self.risk.record_broker_success();
                self.store_trade(trade);
            }
            Err(e) => {
                error!(scrip = %scrip, error = %e, "entry placement failed");
                trade.status = TradeStatus::Failed;
                let code = match &e {
                    crate::broker::BrokerError::Timeout(_) => {
                        EngineError::BrokerTimeout(String::new()).code()
                    }
                    _ => EngineError::BrokerReject(String::new()).code(),
                };
                self.emit(RiskEvent::new(
                    code,
                    Severity::Critical,
                    &scrip,
                    format!("entry rejected: {e}"),
                ));
                self.note_broker_failure(config, now);
                self.state.watchlist.remove(&scrip);
                self.state.completed_trades.write().push(trade);
                self.state.increment_version();
            }
        }
    }

    /// Resolve the execution instrument: signal overrides first, then the
    /// signal instrument with exchange inference.
    fn execution_instrument(config: &RuntimeConfig, pending: &PendingSignal) -> Instrument {
        let signal = &pending.signal;
        let scrip_code = signal
            .order_scrip_code
            .clone()
            .unwrap_or_else(|| signal.scrip_code.clone());

        let exchange = TradingHoursGate::infer_exchange(
            signal
                .order_exchange
                .as_deref()
                .or(signal.exchange.as_deref()),
            &signal.company_name,
        );

        let segment = signal
            .order_exchange_type
            .as_deref()
            .or(signal.exchange_type.as_deref())
            .and_then(Segment::parse)
            .unwrap_or(Segment::Cash);

        Instrument {
            scrip_code,
            exchange,
            segment,
            tick_size: signal.order_tick_size.unwrap_or(config.default_tick_size),
            lot_size: signal.order_lot_size.unwrap_or(config.default_lot_size),
        }
    }

    fn entry_side(direction: Direction) -> OrderSide {
        match direction {
            Direction::Bullish => OrderSide::Buy,
            Direction::Bearish => OrderSide::Sell,
        }
    }

    fn exit_side(direction: Direction) -> OrderSide {
        match direction {
            Direction::Bullish => OrderSide::Sell,
            Direction::Bearish => OrderSide::Buy,
        }
    }

    /// Spread-aware LIMIT on wide-quoted segments, MARKET otherwise.
    fn build_entry_order(
        &self,
        config: &RuntimeConfig,
        trade: &ActiveTrade,
        now: DateTime<Utc>,
    ) -> Order {
        let side = Self::entry_side(trade.direction);
        let instrument = &trade.execution.instrument;

        if !instrument.segment.needs_limit_orders() {
            return Order::Market {
                side,
                quantity: trade.position_size,
            };
        }

        let limit_price = trade.execution.limit_price_entry.unwrap_or_else(|| {
            self.marketable_limit(config, instrument, side, trade.entry_price, now)
        });

        Order::Limit {
            side,
            quantity: trade.position_size,
            limit_price: round_to_tick(limit_price, instrument.tick_size),
        }
    }

    fn build_exit_order(
        &self,
        config: &RuntimeConfig,
        trade: &ActiveTrade,
        level: f64,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Order {
        let side = Self::exit_side(trade.direction);
        let instrument = &trade.execution.instrument;

        if !instrument.segment.needs_limit_orders() {
            return Order::Market { side, quantity };
        }

        let limit_price = trade
            .execution
            .limit_price_exit
            .unwrap_or_else(|| self.marketable_limit(config, instrument, side, level, now));

        Order::Limit {
            side,
            quantity,
            limit_price: round_to_tick(limit_price, instrument.tick_size),
        }
    }

    /// Cross the spread by `exit_slippage_ticks` beyond the touch; fall back
    /// to `reference` when the quote is stale.
    fn marketable_limit(
        &self,
        config: &RuntimeConfig,
        instrument: &Instrument,
        side: OrderSide,
        reference: f64,
        now: DateTime<Utc>,
    ) -> f64 {
        let slip = config.exit_slippage_ticks as f64 * instrument.tick_size;
        match self.state.price_cache.quote(&instrument.scrip_code, now) {
            Some((bid, ask)) => match side {
                OrderSide::Buy => ask + slip,
                OrderSide::Sell => bid - slip,
            },
            None => {
                let age_secs = self
                    .state
                    .price_cache
                    .age(&instrument.scrip_code, now)
                    .map(|d| d.num_seconds());
                self.emit(RiskEvent::new(
                    EngineError::MarketDataStale(String::new()).code(),
                    Severity::Warning,
                    &instrument.scrip_code,
                    format!("quote stale (age {age_secs:?}s) — limit priced off decision level"),
                ));
                reference
            }
        }
    }

    // =========================================================================
    // Ticks
    // =========================================================================

    fn on_tick(&mut self, scrip_code: &str, last_rate: f64) {
        let Some(mut trade) = self.state.active_trade.read().clone() else {
            return;
        };
        if trade.scrip_code != scrip_code || !trade.status.is_managed() || last_rate <= 0.0 {
            return;
        }
        // Excursion tracking only; exit decisions stay bar-driven.
        if last_rate > trade.high_since_entry {
            trade.high_since_entry = last_rate;
        }
        if last_rate < trade.low_since_entry {
            trade.low_since_entry = last_rate;
        }
        *self.state.active_trade.write() = Some(trade);
    }

    // =========================================================================
    // Verification results
    // =========================================================================

    async fn on_verification(&mut self, result: OrderVerificationResult) {
        let config = self.state.runtime_config.read().clone();
        let now = Utc::now();

        let Some(trade) = self.state.active_trade.read().clone() else {
            warn!(order_id = %result.order_id, "verification for no active trade — ignored");
            return;
        };
        if trade.trade_id != result.trade_id {
            warn!(
                order_id = %result.order_id,
                trade_id = %result.trade_id,
                "verification for a stale trade — ignored"
            );
            return;
        }

        match result.purpose {
            OrderPurpose::Entry => self.on_entry_verified(&config, trade, result, now).await,
            OrderPurpose::Exit => self.on_exit_verified(&config, trade, result, now).await,
        }
    }

    async fn on_entry_verified(
        &mut self,
        config: &RuntimeConfig,
        mut trade: ActiveTrade,
        result: OrderVerificationResult,
        now: DateTime<Utc>,
    ) {
        if !result.success || result.filled_qty <= 0 {
            warn!(
                trade_id = %trade.trade_id,
                message = %result.message,
                "entry verification failed — trade FAILED, slot released"
            );
            trade.status = TradeStatus::Failed;
            self.emit(RiskEvent::new(
                EngineError::VerifyFail(String::new()).code(),
                Severity::Critical,
                &trade.scrip_code,
                format!("entry not filled: {}", result.message),
            ));
            self.note_broker_failure(config, now);
            self.state.completed_trades.write().push(trade);
            *self.state.active_trade.write() = None;
            self.state.increment_version();
            self.state.stream_position();
            return;
        }

        if result.filled_qty < result.requested_qty {
            self.emit(RiskEvent::new(
                "PARTIAL_FILL",
                Severity::Warning,
                &trade.scrip_code,
                format!(
                    "entry filled {}/{} — actual quantity adopted",
                    result.filled_qty, result.requested_qty
                ),
            ));
        }

        trade.apply_entry_fill(result.filled_qty, result.avg_price, now);
        self.risk.record_broker_success();

        self.state.portfolio.write().apply_entry(
            &trade.scrip_code,
            &trade.strategy_name,
            trade.entry_price * trade.position_size as f64,
        );

        info!(
            trade_id = %trade.trade_id,
            entry = trade.entry_price,
            size = trade.position_size,
            "entry verified — position ACTIVE"
        );

        let signal_id = trade.signal_id.clone();
        self.publisher.publish_entry(&trade, signal_id.as_deref()).await;
        self.store_trade(trade);
    }

    async fn on_exit_verified(
        &mut self,
        config: &RuntimeConfig,
        mut trade: ActiveTrade,
        result: OrderVerificationResult,
        now: DateTime<Utc>,
    ) {
        let Some(pending_exit) = trade.pending_exit.clone() else {
            warn!(trade_id = %trade.trade_id, "exit verification without a pending exit — ignored");
            return;
        };

        if !result.success || result.filled_qty <= 0 {
            trade.pending_exit = None;
            trade.exit_order_id = None;
            trade.exit_failure_reason = Some(result.message.clone());
            self.note_broker_failure(config, now);
            self.maybe_escalate_exit(config, &mut trade);
            if !trade.exit_escalated {
                self.emit(RiskEvent::new(
                    EngineError::VerifyFail(String::new()).code(),
                    Severity::Warning,
                    &trade.scrip_code,
                    format!("exit not filled, will retry next bar: {}", result.message),
                ));
            }
            warn!(
                trade_id = %trade.trade_id,
                attempts = trade.exit_attempts,
                escalated = trade.exit_escalated,
                "exit verification failed"
            );
            self.store_trade(trade);
            return;
        }

        self.risk.record_broker_success();
        let fill_price = if result.avg_price > 0.0 {
            result.avg_price
        } else {
            pending_exit.exit_level
        };

        if pending_exit.is_partial && result.filled_qty < trade.position_size {
            let released = trade.entry_price * result.filled_qty as f64;
            let pnl = trade.apply_partial_exit_fill(result.filled_qty, fill_price);
            self.state.portfolio.write().apply_partial_exit(
                &trade.scrip_code,
                &trade.strategy_name,
                released,
                pnl,
            );
            info!(
                trade_id = %trade.trade_id,
                closed = result.filled_qty,
                remaining = trade.position_size,
                pnl,
                "partial exit verified — stop at breakeven, running for TARGET2"
            );
            let (account_value, daily) = {
                let p = self.state.portfolio.read();
                (p.account_value, p.daily_realized_pnl)
            };
            self.publisher.publish_portfolio_update(account_value, daily).await;
            self.store_trade(trade);
            return;
        }

        // Full (or final-remainder) exit.
        let pnl = trade.apply_exit_fill(pending_exit.reason, result.filled_qty, fill_price, now);
        self.state
            .portfolio
            .write()
            .apply_exit(&trade.scrip_code, &trade.strategy_name, pnl);

        let total_pnl = trade.realized_pnl;
        let (mfe, mae) = trade.excursions();
        let entry_time = trade.entry_time.unwrap_or(now);
        let exit_time = trade.exit_time.unwrap_or(now);

        let trade_result = TradeResult {
            trade_id: trade.trade_id.clone(),
            scrip_code: trade.scrip_code.clone(),
            company_name: trade.company_name.clone(),
            direction: trade.direction,
            strategy_name: trade.strategy_name.clone(),
            entry_price: trade.entry_price,
            entry_time,
            exit_price: trade.exit_price,
            exit_time,
            position_size: trade.closed_qty,
            pnl: total_pnl,
            r_multiple: trade.r_multiple(total_pnl),
            exit_reason: pending_exit.reason.to_string(),
            duration_minutes: (exit_time - entry_time).num_minutes(),
            max_favorable_excursion: mfe,
            max_adverse_excursion: mae,
        };

        info!(
            trade_id = %trade.trade_id,
            pnl = total_pnl,
            reason = %pending_exit.reason,
            "exit verified — trade COMPLETED, slot released"
        );

        self.state.completed_trades.write().push(trade);
        *self.state.active_trade.write() = None;
        self.state.increment_version();
        self.state.stream_position();

        let (account_value, daily) = {
            let p = self.state.portfolio.read();
            (p.account_value, p.daily_realized_pnl)
        };
        self.publisher.publish_result(&trade_result).await;
        self.publisher.publish_portfolio_update(account_value, daily).await;
    }

    // =========================================================================
    // Admin commands
    // =========================================================================

    async fn on_admin(&mut self, command: AdminCommand) {
        let now = Utc::now();
        match command {
            AdminCommand::TripBreaker { reason } => {
                self.state.portfolio.write().trip_breaker(reason.clone());
                self.emit(RiskEvent::new(
                    EngineError::RiskCircuitBreaker(String::new()).code(),
                    Severity::Critical,
                    "wallet",
                    format!("circuit breaker tripped by operator: {reason}"),
                ));
                self.state.increment_version();
            }
            AdminCommand::ResetBreaker => {
                self.state.portfolio.write().reset_breaker();
                self.emit(RiskEvent::new(
                    "RISK_BREAKER_RESET",
                    Severity::Info,
                    "wallet",
                    "circuit breaker reset by operator".to_string(),
                ));
                self.state.increment_version();
            }
            AdminCommand::ForceClose { trade_id, reason } => {
                self.force_close(&trade_id, &reason, now).await;
            }
            AdminCommand::SetMode(mode) => {
                let previous = {
                    let mut config = self.state.runtime_config.write();
                    let previous = config.mode;
                    config.mode = mode;
                    previous
                };
                info!(%previous, current = %mode, "execution mode changed");
                self.state.increment_version();
            }
            AdminCommand::AcknowledgeExitFailure { trade_id } => {
                let Some(mut trade) = self.state.active_trade.read().clone() else {
                    return;
                };
                if trade.trade_id != trade_id {
                    return;
                }
                trade.exit_escalated = false;
                trade.exit_attempts = 0;
                trade.first_exit_attempt_at = None;
                trade.exit_failure_reason = None;
                info!(trade_id = %trade_id, "exit failure acknowledged — retries resume");
                self.store_trade(trade);
            }
        }
    }

    async fn force_close(&mut self, trade_id: &str, reason: &str, now: DateTime<Utc>) {
        let config = self.state.runtime_config.read().clone();
        let Some(mut trade) = self.state.active_trade.read().clone() else {
            warn!(trade_id, "force-close requested with no active trade");
            return;
        };
        if trade.trade_id != trade_id || !trade.status.is_managed() {
            warn!(trade_id, status = %trade.status, "force-close target not closeable");
            return;
        }
        if trade.pending_exit.is_some() {
            warn!(trade_id, "force-close ignored — an exit is already in flight");
            return;
        }

        let level = self
            .state
            .price_cache
            .last_trade(&trade.scrip_code, now)
            .unwrap_or(trade.entry_price);

        info!(trade_id, reason, level, "force-closing position");
        let trigger = ExitTrigger {
            reason: ExitReason::Manual,
            level,
        };
        let quantity = trade.position_size;
        self.submit_exit(&config, &mut trade, trigger, quantity, false, now)
            .await;
        self.store_trade(trade);
    }

    // =========================================================================
    // Periodic risk check
    // =========================================================================

    async fn on_risk_check(&mut self) {
        let config = self.state.runtime_config.read().clone();
        let now = Utc::now();

        self.expire_watchlist(now);
        let session_date = self.state.hours.session_date(now);
        self.state.portfolio.write().roll_session(session_date);

        let unrealized = self
            .state
            .active_trade
            .read()
            .as_ref()
            .filter(|t| t.status.is_managed())
            .and_then(|t| {
                self.state
                    .price_cache
                    .last_trade(&t.scrip_code, now)
                    .map(|ltp| t.pnl_at(ltp, t.position_size))
            })
            .unwrap_or(0.0);

        let reason = {
            let portfolio = self.state.portfolio.read();
            if portfolio.circuit_breaker_tripped {
                None
            } else {
                self.risk.evaluate_breaker(&config, &portfolio, unrealized)
            }
        };

        if let Some(reason) = reason {
            self.state.portfolio.write().trip_breaker(reason.clone());
            self.emit(RiskEvent::new(
                EngineError::RiskCircuitBreaker(String::new()).code(),
                Severity::Critical,
                "wallet",
                reason,
            ));
            self.state.increment_version();
        }

        let (account_value, daily) = {
            let p = self.state.portfolio.read();
            (p.account_value, p.daily_realized_pnl)
        };
        self.publisher.publish_portfolio_update(account_value, daily).await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn store_trade(&self, trade: ActiveTrade) {
        *self.state.active_trade.write() = Some(trade);
        self.state.increment_version();
        self.state.stream_position();
    }

    fn note_broker_failure(&self, config: &RuntimeConfig, now: DateTime<Utc>) {
        if self.risk.record_broker_failure(config, now) {
            let mut portfolio = self.state.portfolio.write();
            if !portfolio.circuit_breaker_tripped {
                portfolio.trip_breaker("consecutive broker failures".to_string());
                drop(portfolio);
                self.emit(RiskEvent::new(
                    EngineError::RiskCircuitBreaker(String::new()).code(),
                    Severity::Critical,
                    "wallet",
                    "circuit breaker tripped after consecutive broker failures".to_string(),
                ));
            }
        }
    }
}

// =============================================================================
// Tests — end-to-end scenarios against the paper broker
// =============================================================================
