// =============================================================================
// Bot orchestrator — composes the engine and owns its lifecycle
// =============================================================================
//
// Startup order: connect exchange -> init persistence -> reconcile ->
// build live context -> restore-or-create strategy -> subscribe tickers ->
// start API + periodic loops -> run until a signal arrives. Shutdown walks
// the reverse path: strategy shutdown (cancelling its orders if configured),
// stop websockets, persist the final snapshot, disconnect.
//
// The strategy is pinned to the orchestrator's event loop; ticks use a
// latest-wins watch channel, while order fills and cancels are polled and
// handled inline so none are ever dropped.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::alert::AlertManager;
use crate::audit::AuditLog;
use crate::config::AppConfig;
use crate::data::ohlcv_cache::OhlcvCache;
use crate::exchange::binance::BinanceExchange;
use crate::exchange::websocket::{WebSocketHandler, BINANCE_STREAM_BASE};
use crate::exchange::Exchange;
use crate::execution::live::LiveExecutionContext;
use crate::execution::ExecutionContext;
use crate::persistence::Store;
use crate::reconcile::{ReconcilePolicy, Reconciler};
use crate::risk::{RiskConfig, RiskManager};
use crate::strategy::grid::GridStrategy;
use crate::strategy::{Strategy, StrategyEvent};
use crate::types::{BalanceSnapshot, OrderSide, OrderType, TradeCycle, Ticker};

/// In-memory OHLCV cache entries kept per process.
const OHLCV_MEMORY_CAPACITY: usize = 64;

const ORDER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RISK_LOOP_INTERVAL: Duration = Duration::from_secs(30);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

/// Shared state consumed by the HTTP API.
pub struct BotState {
    pub config: AppConfig,
    pub started_at: DateTime<Utc>,
    pub running: AtomicBool,
    pub last_heartbeat: RwLock<DateTime<Utc>>,
    pub last_price: RwLock<Option<Decimal>>,
    pub strategy_stats: RwLock<serde_json::Value>,
    pub risk: Arc<RiskManager>,
    pub store: Arc<Store>,
    pub exchange: Arc<dyn Exchange>,
    pub cache: Arc<OhlcvCache>,
}

impl BotState {
    pub fn uptime_secs(&self) -> i64 {
        (Utc::now() - self.started_at).num_seconds()
    }

    pub fn heartbeat_age_secs(&self) -> i64 {
        (Utc::now() - *self.last_heartbeat.read()).num_seconds()
    }

    pub fn beat(&self) {
        *self.last_heartbeat.write() = Utc::now();
    }
}

/// The long-running trading process.
pub struct TradingBot {
    config: AppConfig,
}

impl TradingBot {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal or a fatal error.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config;
        let symbol = config.trading.symbol.clone();
        let strategy_name = format!("grid:{symbol}");

        // ── 1. Exchange ──────────────────────────────────────────────────
        let exchange: Arc<dyn Exchange> = Arc::new(BinanceExchange::new(&config.exchange));
        exchange.connect().await.context("exchange connect failed")?;
        info!(exchange = exchange.name(), symbol = %symbol, "exchange connected");

        // ── 2. Persistence, audit, alerting ─────────────────────────────
        let store = Arc::new(
            Store::connect(&config.db.url, config.db.pool_size)
                .await
                .context("persistence init failed")?,
        );
        let audit = Arc::new(AuditLog::open("audit.log").context("audit log open failed")?);
        let alerts =
            Arc::new(AlertManager::new(config.alert.enabled).with_store(store.clone()));
        let cache = Arc::new(OhlcvCache::new(
            exchange.name(),
            Some(store.clone()),
            OHLCV_MEMORY_CAPACITY,
        ));

        // ── 3. Risk manager ──────────────────────────────────────────────
        let initial_equity = config.grid.total_investment;
        let risk = Arc::new(
            RiskManager::new(
                RiskConfig {
                    max_position_pct: config.trading.max_position_pct,
                    ..Default::default()
                },
                initial_equity,
            )
            .context("risk manager init failed")?,
        );

        // ── 4. Execution context & strategy ──────────────────────────────
        let context: Arc<dyn ExecutionContext> = Arc::new(LiveExecutionContext::new(
            exchange.clone(),
            store.clone(),
            config.trading.dry_run,
        ));
        let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
        let tick_size = exchange
            .market(&symbol)
            .map(|m| m.filters.tick_size)
            .filter(|t| !t.is_zero());

        let (mut strategy, fresh) = match store.load_strategy_state(&strategy_name).await? {
            Some((version, json)) => {
                info!(strategy = %strategy_name, version, "restoring strategy snapshot");
                let state: serde_json::Value =
                    serde_json::from_str(&json).context("corrupt strategy snapshot")?;
                (
                    GridStrategy::from_state(&state, context.clone(), Some(events_tx.clone()))?,
                    false,
                )
            }
            None => (
                GridStrategy::new(
                    config.grid.clone(),
                    context.clone(),
                    Some(events_tx.clone()),
                    tick_size,
                )?,
                true,
            ),
        };

        // ── 5. Reconciliation before trading resumes ─────────────────────
        let reconciler = Reconciler::new(
            exchange.clone(),
            store.clone(),
            ReconcilePolicy::TrustExchange,
            false,
        );
        let report = reconciler
            .reconcile(&mut strategy, Some(alerts.as_ref()), Some(audit.as_ref()))
            .await
            .context("startup reconciliation failed")?;
        info!(discrepancies = report.total_discrepancies(), "reconciliation complete");

        if fresh {
            strategy.initialize().await.context("strategy initialisation failed")?;
        }

        // Rehydrate cycle bookkeeping for stop tracking and closing order.
        let mut open_cycles: VecDeque<(i64, Decimal)> = store
            .open_cycles(Some(&strategy_name), Some(&symbol))
            .await?
            .into_iter()
            .filter_map(|c| c.id.map(|id| (id, c.amount)))
            .collect();

        // ── 6. Ticker subscription (latest-wins per symbol) ──────────────
        let (tick_tx, mut tick_rx) = watch::channel::<Option<Ticker>>(None);
        let ws = if config.exchange.testnet {
            // The public push endpoint serves mainnet data; poll the REST
            // testnet instead so prices match the venue we trade on.
            WebSocketHandler::polling(exchange.clone(), Duration::from_secs(1))
        } else {
            WebSocketHandler::new(exchange.clone(), BINANCE_STREAM_BASE)
        };
        ws.subscribe(
            &symbol,
            Arc::new(move |ticker| {
                let _ = tick_tx.send(Some(ticker));
            }),
        );
        ws.start();

        // ── 7. Shared state + API server ─────────────────────────────────
        let state = Arc::new(BotState {
            config: config.clone(),
            started_at: Utc::now(),
            running: AtomicBool::new(true),
            last_heartbeat: RwLock::new(Utc::now()),
            last_price: RwLock::new(None),
            strategy_stats: RwLock::new(serde_json::json!({})),
            risk: risk.clone(),
            store: store.clone(),
            exchange: exchange.clone(),
            cache: cache.clone(),
        });
        let api_state = state.clone();
        let bind_addr = config.api.bind_addr.clone();
        tokio::spawn(async move {
            if let Err(e) = crate::api::rest::serve(api_state, &bind_addr).await {
                error!(error = %e, "API server failed");
            }
        });

        // ── 8. Shutdown signal ───────────────────────────────────────────
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            #[cfg(unix)]
            {
                let mut term =
                    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                        .expect("failed to install SIGTERM handler");
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = ctrl_c.await;
            }
            warn!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        });

        audit
            .record(
                "startup",
                "bot",
                "started",
                serde_json::json!({ "symbol": symbol, "dry_run": config.trading.dry_run }),
            )
            .ok();
        alerts.info("bot.start", format!("trading engine started for {symbol}")).await;

        // ── 9. Main event loop ───────────────────────────────────────────
        let mut order_poll = tokio::time::interval(ORDER_POLL_INTERVAL);
        let mut risk_loop = tokio::time::interval(RISK_LOOP_INTERVAL);
        let mut snapshot_loop = tokio::time::interval(SNAPSHOT_INTERVAL);
        let mut equity = initial_equity;
        let mut fatal: Option<anyhow::Error> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                changed = tick_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let ticker = tick_rx.borrow_and_update().clone();
                    if let Some(ticker) = ticker {
                        *state.last_price.write() = Some(ticker.last);
                        if let Err(e) = strategy.on_tick(&ticker).await {
                            error!(error = %e, "on_tick failed");
                            risk.record_error();
                        }
                    }
                }
                Some(event) = events_rx.recv() => {
                    Self::handle_strategy_event(
                        event, &config, &store, &risk, &alerts, &audit,
                        &strategy_name, &mut open_cycles, &mut equity,
                    ).await;
                }
                _ = order_poll.tick() => {
                    if let Err(e) = Self::poll_orders(
                        &symbol, &exchange, &store, &risk, &mut strategy,
                    ).await {
                        error!(error = %e, "order poll failed fatally");
                        fatal = Some(e);
                        break;
                    }
                }
                _ = risk_loop.tick() => {
                    Self::risk_scan(
                        &config, &symbol, &exchange, &store, &risk, &context,
                        &alerts, &state, &open_cycles, equity,
                    ).await;
                }
                _ = snapshot_loop.tick() => {
                    let snapshot = strategy.get_state();
                    if let Err(e) = store
                        .save_strategy_state(&strategy_name, 1, &snapshot.to_string())
                        .await
                    {
                        warn!(error = %e, "periodic snapshot save failed");
                    }
                }
            }

            state.beat();
            *state.strategy_stats.write() = serde_json::json!({
                "name": strategy.name(),
                "symbol": strategy.symbol(),
                "statistics": strategy.stats(),
                "active_orders": strategy.active_order_count(),
                "open_cycles": strategy.open_cycle_count(),
                "halted": strategy.is_halted(),
            });
        }

        // ── 10. Graceful shutdown ────────────────────────────────────────
        state.running.store(false, Ordering::SeqCst);
        info!("shutting down: strategy first, then streams, then persistence");

        if let Err(e) = strategy.shutdown().await {
            warn!(error = %e, "strategy shutdown reported an error");
        }
        ws.stop().await;

        let snapshot = strategy.get_state();
        if let Err(e) = store
            .save_strategy_state(&strategy_name, 1, &snapshot.to_string())
            .await
        {
            warn!(error = %e, "final snapshot save failed");
        }

        audit.record("shutdown", "bot", "stopped", serde_json::json!({})).ok();
        alerts.info("bot.stop", "trading engine stopped").await;
        exchange.disconnect().await.ok();

        match fatal {
            Some(e) => {
                alerts.critical("bot.fatal", format!("fatal error: {e}")).await;
                Err(e)
            }
            None => {
                info!("shutdown complete");
                Ok(())
            }
        }
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn handle_strategy_event(
        event: StrategyEvent,
        config: &AppConfig,
        store: &Arc<Store>,
        risk: &Arc<RiskManager>,
        alerts: &Arc<AlertManager>,
        audit: &Arc<AuditLog>,
        strategy_name: &str,
        open_cycles: &mut VecDeque<(i64, Decimal)>,
        equity: &mut Decimal,
    ) {
        match event {
            StrategyEvent::CycleOpened { symbol, side, open_rate, amount, open_date } => {
                let mut cycle = TradeCycle::open(
                    "binance", &symbol, strategy_name, side, open_rate, amount, open_date,
                );
                if let Some(pct) = config.grid.stop_loss_pct {
                    cycle.stop_loss = Some(open_rate * (Decimal::ONE - pct));
                }
                match store.create_trade_cycle(&cycle).await {
                    Ok(id) => {
                        open_cycles.push_back((id, amount));
                        if let Some(pct) = config.grid.stop_loss_pct {
                            risk.register_stop_loss(
                                &id.to_string(),
                                side,
                                open_rate,
                                Some(pct),
                                None,
                            );
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to persist opened cycle"),
                }
            }
            StrategyEvent::CycleClosed {
                symbol,
                close_rate,
                close_date,
                profit,
                profit_pct,
                fee,
                ..
            } => {
                if let Some((id, _)) = open_cycles.pop_front() {
                    if let Err(e) = store
                        .close_trade_cycle(id, close_rate, close_date, profit, profit_pct, fee)
                        .await
                    {
                        warn!(trade_id = id, error = %e, "failed to persist closed cycle");
                    }
                    risk.remove_stop_loss(&id.to_string());
                }

                *equity += profit;
                if let Some(trigger) = risk.record_trade_result(&symbol, profit, *equity) {
                    alerts
                        .critical(
                            "circuit_breaker.trip",
                            format!("circuit breaker tripped: {trigger}"),
                        )
                        .await;
                    audit
                        .record(
                            "risk",
                            "circuit_breaker",
                            "tripped",
                            serde_json::json!({ "trigger": trigger.to_string() }),
                        )
                        .ok();
                }
            }
            StrategyEvent::StopLossTriggered { symbol, price } => {
                alerts
                    .critical(
                        "grid.stop_loss",
                        format!("grid stop-loss triggered for {symbol} at {price}"),
                    )
                    .await;
            }
        }
    }

    /// Poll persisted-open orders against the exchange and replay terminal
    /// transitions into the strategy. Fills and cancels are never dropped;
    /// they are handled inline before the next poll.
    async fn poll_orders(
        symbol: &str,
        exchange: &Arc<dyn Exchange>,
        store: &Arc<Store>,
        risk: &Arc<RiskManager>,
        strategy: &mut GridStrategy,
    ) -> anyhow::Result<()> {
        let records = match store.open_order_records(Some(symbol)).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "open-order query failed");
                return Ok(());
            }
        };

        for record in records {
            // Dry-run orders never reach the exchange; nothing to poll.
            if record.order.id.starts_with("dry-") {
                continue;
            }
            let remote = match exchange.fetch_order(&record.order.id, symbol).await {
                Ok(order) => order,
                Err(e) => {
                    warn!(order_id = %record.order.id, error = %e, "order poll failed");
                    risk.record_error();
                    continue;
                }
            };
            if !remote.is_terminal() {
                continue;
            }

            if let Err(e) = store.upsert_order(&remote, exchange.name(), record.trade_id).await {
                warn!(order_id = %remote.id, error = %e, "failed to persist order update");
            }
            let result = match remote.status {
                crate::types::OrderStatus::Closed => strategy.on_order_filled(&remote).await,
                _ => strategy.on_order_cancelled(&remote).await,
            };
            if let Err(e) = result {
                // Strategy callback failures are fatal: state may be torn.
                return Err(e.context("strategy callback failed during order poll"));
            }
        }
        Ok(())
    }

    /// Periodic equity snapshot and stop-loss scan.
    #[allow(clippy::too_many_arguments)]
    async fn risk_scan(
        config: &AppConfig,
        symbol: &str,
        exchange: &Arc<dyn Exchange>,
        store: &Arc<Store>,
        risk: &Arc<RiskManager>,
        context: &Arc<dyn ExecutionContext>,
        alerts: &Arc<AlertManager>,
        state: &Arc<BotState>,
        open_cycles: &VecDeque<(i64, Decimal)>,
        tracked_equity: Decimal,
    ) {
        let quote = symbol.split('/').nth(1).unwrap_or("USDT").to_string();

        // Equity observation: live balance when trading for real, tracked
        // equity in dry-run mode.
        let equity = if config.trading.dry_run {
            tracked_equity
        } else {
            match exchange.fetch_balance().await {
                Ok(balances) => balances.get(&quote).map(|b| b.total).unwrap_or(tracked_equity),
                Err(e) => {
                    warn!(error = %e, "balance fetch failed during risk scan");
                    risk.record_error();
                    tracked_equity
                }
            }
        };
        risk.update_equity(equity);
        if let Err(e) = store
            .append_balance_snapshot(&BalanceSnapshot {
                timestamp: Utc::now(),
                exchange: exchange.name().to_string(),
                currency: quote,
                total: equity,
                free: equity,
                used: Decimal::ZERO,
            })
            .await
        {
            warn!(error = %e, "balance snapshot failed");
        }

        // Stop-loss scan against the latest price.
        let Some(price) = *state.last_price.read() else {
            return;
        };
        let prices: HashMap<String, Decimal> = open_cycles
            .iter()
            .map(|(id, _)| (id.to_string(), price))
            .collect();
        for position_id in risk.check_stop_losses(&prices) {
            let amount = open_cycles
                .iter()
                .find(|(id, _)| id.to_string() == position_id)
                .map(|(_, amount)| *amount);
            let Some(amount) = amount else { continue };

            warn!(position_id = %position_id, price = %price, "stop-loss fired; closing at market");
            match context
                .place_order(symbol, OrderSide::Sell, amount, None, OrderType::Market)
                .await
            {
                Ok(order_id) => {
                    alerts
                        .warning(
                            "risk.stop_loss",
                            format!("position {position_id} stopped out via order {order_id}"),
                        )
                        .await;
                }
                Err(e) => {
                    error!(position_id = %position_id, error = %e, "stop-loss execution failed");
                    risk.record_error();
                }
            }
            risk.remove_stop_loss(&position_id);
        }
    }
}
