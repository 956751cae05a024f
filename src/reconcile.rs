// =============================================================================
// State reconciler — align persisted intent with exchange truth at startup
// =============================================================================
//
// Runs once after exchange connect and persistence init, before the
// strategy starts trading. The exchange holds the authoritative order
// status; the configured policy decides what happens on disagreement.
// Running the reconciler twice with no intervening activity produces no
// further changes.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::alert::AlertManager;
use crate::audit::AuditLog;
use crate::error::{ExchangeError, ReconcileError};
use crate::exchange::Exchange;
use crate::execution::live::CLIENT_ID_PREFIX;
use crate::persistence::Store;
use crate::strategy::Strategy;
use crate::types::{Order, OrderStatus};

/// How to resolve a persisted-vs-exchange disagreement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// The exchange is authoritative; local records are corrected.
    TrustExchange,
    /// Local records win; disagreements are logged but kept.
    TrustLocal,
    /// Disagreements are collected for operator review; startup aborts on
    /// conflicts that cannot wait.
    Manual,
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Orders open on both sides with agreeing status.
    pub agreed: u32,
    /// Persisted-open orders the exchange reports filled; strategy notified.
    pub marked_filled: u32,
    /// Persisted-open orders the exchange canceled or no longer knows.
    pub marked_cancelled: u32,
    /// Live orders carrying our client-id prefix adopted into persistence.
    pub adopted: u32,
    /// Live orders that belong to nobody we know.
    pub orphans: u32,
    pub orphans_cancelled: u32,
    /// Items requiring operator review under the Manual policy.
    pub manual_items: Vec<String>,
    pub timestamp: String,
}

impl ReconcileReport {
    pub fn total_discrepancies(&self) -> u32 {
        self.marked_filled + self.marked_cancelled + self.adopted + self.orphans
    }
}

/// Startup reconciliation driver.
pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    store: Arc<Store>,
    exchange_name: String,
    policy: ReconcilePolicy,
    /// Cancel orphan orders on the exchange under TrustExchange.
    cancel_orphans: bool,
}

impl Reconciler {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        store: Arc<Store>,
        policy: ReconcilePolicy,
        cancel_orphans: bool,
    ) -> Self {
        let exchange_name = exchange.name().to_string();
        Self {
            exchange,
            store,
            exchange_name,
            policy,
            cancel_orphans,
        }
    }

    /// Run one reconciliation pass for the strategy's symbol. The strategy
    /// must already be restored from its snapshot; fill/cancel callbacks
    /// drive its follow-on logic exactly like live events would.
    pub async fn reconcile(
        &self,
        strategy: &mut dyn Strategy,
        alerts: Option<&AlertManager>,
        audit: Option<&AuditLog>,
    ) -> Result<ReconcileReport, ReconcileError> {
        let symbol = strategy.symbol().to_string();
        let now = Utc::now().to_rfc3339();
        info!(symbol = %symbol, policy = ?self.policy, "reconciliation started");

        let mut report = ReconcileReport {
            timestamp: now,
            ..Default::default()
        };

        // Exchange truth for the symbol.
        let live_open = self.exchange.fetch_open_orders(Some(&symbol)).await?;

        // -----------------------------------------------------------------
        // Persisted-open orders vs exchange state
        // -----------------------------------------------------------------
        let persisted_open = self.store.open_order_records(Some(&symbol)).await?;
        debug!(
            persisted_open = persisted_open.len(),
            live_open = live_open.len(),
            "state loaded"
        );

        for record in &persisted_open {
            let order_id = record.order.id.clone();
            let remote = match self.exchange.fetch_order(&order_id, &symbol).await {
                Ok(order) => Some(order),
                Err(ExchangeError::OrderNotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };

            match remote {
                Some(remote) if remote.status == OrderStatus::Open => {
                    report.agreed += 1;
                }
                Some(remote) if remote.status == OrderStatus::Closed => {
                    self.resolve_filled(strategy, &mut report, &remote).await?;
                }
                Some(remote) => {
                    // Canceled or expired on the exchange.
                    self.resolve_cancelled(strategy, &mut report, &remote).await?;
                }
                None => {
                    // The exchange no longer knows the id; same treatment as
                    // a cancel.
                    let mut ghost = record.order.clone();
                    ghost.status = OrderStatus::Canceled;
                    self.resolve_cancelled(strategy, &mut report, &ghost).await?;
                }
            }
        }

        // -----------------------------------------------------------------
        // Live-open orders persistence does not track as open
        // -----------------------------------------------------------------
        let persisted_open_ids: HashSet<String> =
            persisted_open.iter().map(|r| r.order.id.clone()).collect();

        for order in &live_open {
            if persisted_open_ids.contains(&order.id) {
                continue;
            }
            match self.store.get_order(&order.id).await? {
                Some(record) if record.order.status.is_terminal() => {
                    // Persisted terminal, exchange still open: logic bug or
                    // DB corruption.
                    match self.policy {
                        ReconcilePolicy::TrustExchange => {
                            warn!(
                                order_id = %order.id,
                                "order closed locally but open on exchange; reopening local record"
                            );
                            self.store.upsert_order(order, &self.exchange_name, record.trade_id).await?;
                            report.agreed += 1;
                        }
                        _ => {
                            return Err(ReconcileError::ClosedLocallyOpenRemotely {
                                order_id: order.id.clone(),
                            });
                        }
                    }
                }
                Some(_) => {
                    // Known but raced into the open set; accept.
                    report.agreed += 1;
                }
                None => {
                    let ours = order
                        .client_order_id
                        .as_deref()
                        .map_or(false, |id| id.starts_with(CLIENT_ID_PREFIX));
                    if ours {
                        info!(order_id = %order.id, "adopting untracked order with our client id");
                        self.store.upsert_order(order, &self.exchange_name, None).await?;
                        report.adopted += 1;
                    } else {
                        report.orphans += 1;
                        match self.policy {
                            ReconcilePolicy::TrustExchange if self.cancel_orphans => {
                                warn!(order_id = %order.id, "cancelling orphan order");
                                if self.exchange.cancel_order(&order.id, &symbol).await.is_ok() {
                                    report.orphans_cancelled += 1;
                                }
                            }
                            ReconcilePolicy::Manual => {
                                report
                                    .manual_items
                                    .push(format!("orphan order {} on exchange", order.id));
                            }
                            _ => {
                                warn!(order_id = %order.id, "orphan order left on exchange");
                            }
                        }
                    }
                }
            }
        }

        self.emit_report(&report, alerts, audit).await;
        info!(
            agreed = report.agreed,
            marked_filled = report.marked_filled,
            marked_cancelled = report.marked_cancelled,
            adopted = report.adopted,
            orphans = report.orphans,
            manual = report.manual_items.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn resolve_filled(
        &self,
        strategy: &mut dyn Strategy,
        report: &mut ReconcileReport,
        remote: &Order,
    ) -> Result<(), ReconcileError> {
        match self.policy {
            ReconcilePolicy::TrustExchange => {
                self.store
                    .update_order_status(
                        &remote.id,
                        OrderStatus::Closed,
                        remote.filled,
                        remote.remaining,
                    )
                    .await?;
                report.marked_filled += 1;
                info!(order_id = %remote.id, "stale-open order was filled; replaying to strategy");
                strategy
                    .on_order_filled(remote)
                    .await
                    .map_err(|e| ReconcileError::ManualResolutionRequired {
                        order_id: remote.id.clone(),
                        detail: format!("strategy fill replay failed: {e}"),
                    })?;
            }
            ReconcilePolicy::TrustLocal => {
                warn!(order_id = %remote.id, "exchange reports fill but policy trusts local state");
            }
            ReconcilePolicy::Manual => {
                report
                    .manual_items
                    .push(format!("order {} filled on exchange, open locally", remote.id));
            }
        }
        Ok(())
    }

    async fn resolve_cancelled(
        &self,
        strategy: &mut dyn Strategy,
        report: &mut ReconcileReport,
        remote: &Order,
    ) -> Result<(), ReconcileError> {
        match self.policy {
            ReconcilePolicy::TrustExchange => {
                self.store
                    .update_order_status(
                        &remote.id,
                        OrderStatus::Canceled,
                        remote.filled,
                        remote.remaining,
                    )
                    .await?;
                report.marked_cancelled += 1;
                info!(order_id = %remote.id, "stale-open order is gone; replaying cancel to strategy");
                strategy
                    .on_order_cancelled(remote)
                    .await
                    .map_err(|e| ReconcileError::ManualResolutionRequired {
                        order_id: remote.id.clone(),
                        detail: format!("strategy cancel replay failed: {e}"),
                    })?;
            }
            ReconcilePolicy::TrustLocal => {
                warn!(order_id = %remote.id, "exchange lost the order but policy trusts local state");
            }
            ReconcilePolicy::Manual => {
                report
                    .manual_items
                    .push(format!("order {} canceled/unknown on exchange, open locally", remote.id));
            }
        }
        Ok(())
    }

    async fn emit_report(
        &self,
        report: &ReconcileReport,
        alerts: Option<&AlertManager>,
        audit: Option<&AuditLog>,
    ) {
        let summary = format!(
            "reconciliation: {} agreed, {} filled, {} cancelled, {} adopted, {} orphans, {} manual",
            report.agreed,
            report.marked_filled,
            report.marked_cancelled,
            report.adopted,
            report.orphans,
            report.manual_items.len()
        );
        if let Some(alerts) = alerts {
            if report.total_discrepancies() > 0 || !report.manual_items.is_empty() {
                alerts.warning("reconcile.report", summary.clone()).await;
            } else {
                alerts.info("reconcile.report", summary.clone()).await;
            }
        }
        if let Some(audit) = audit {
            let details = serde_json::to_value(report).unwrap_or_default();
            if let Err(e) = audit.record("reconciliation", "reconciler", "startup_pass", details) {
                warn!(error = %e, "failed to audit reconciliation report");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExchangeError;
    use crate::exchange::MarketInfo;
    use crate::execution::{ExecutionContext, OrderSummary};
    use crate::strategy::grid::{GridConfig, GridSpacing, GridStrategy};
    use crate::types::{Balance, Candle, Fill, OrderSide, OrderType, Ticker};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    // -- Mock exchange: scripted open orders and per-id lookups -----------

    #[derive(Default)]
    struct MockExchange {
        open_orders: Mutex<Vec<Order>>,
        orders_by_id: Mutex<HashMap<String, Order>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl MockExchange {
        fn set_order(&self, order: Order) {
            if order.status == OrderStatus::Open {
                self.open_orders.lock().push(order.clone());
            }
            self.orders_by_id.lock().insert(order.id.clone(), order);
        }
    }

    #[async_trait]
    impl Exchange for MockExchange {
        fn name(&self) -> &str {
            "mock"
        }
        async fn connect(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        fn market(&self, _symbol: &str) -> Option<MarketInfo> {
            None
        }
        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                bid: dec!(41999),
                ask: dec!(42001),
                last: dec!(42000),
                timestamp: Utc::now(),
            })
        }
        async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
            Ok(HashMap::new())
        }
        async fn create_order(
            &self,
            _symbol: &str,
            _order_type: OrderType,
            _side: OrderSide,
            _amount: Decimal,
            _price: Option<Decimal>,
            _client_order_id: Option<String>,
        ) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Exchange("not scripted".into()))
        }
        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<Order, ExchangeError> {
            self.cancelled.lock().push(order_id.to_string());
            self.orders_by_id
                .lock()
                .get(order_id)
                .cloned()
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
        }
        async fn fetch_order(&self, order_id: &str, _symbol: &str) -> Result<Order, ExchangeError> {
            self.orders_by_id
                .lock()
                .get(order_id)
                .cloned()
                .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))
        }
        async fn fetch_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<Order>, ExchangeError> {
            Ok(self.open_orders.lock().clone())
        }
        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _limit: u32,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_my_trades(
            &self,
            _symbol: &str,
            _limit: u32,
        ) -> Result<Vec<Fill>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    // -- Mock execution context for the strategy's follow-on orders -------

    struct RecordingContext {
        placed: Mutex<Vec<(OrderSide, Decimal, Option<Decimal>)>>,
        next_id: AtomicU64,
    }

    impl RecordingContext {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                placed: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(100),
            })
        }
    }

    #[async_trait]
    impl ExecutionContext for RecordingContext {
        fn current_timestamp(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn is_live(&self) -> bool {
            false
        }
        async fn get_current_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(dec!(42000))
        }
        async fn get_balance(&self, _currency: &str) -> Result<Decimal, ExchangeError> {
            Ok(dec!(100000))
        }
        async fn get_position(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
            Ok(None)
        }
        async fn place_order(
            &self,
            _symbol: &str,
            side: OrderSide,
            amount: Decimal,
            price: Option<Decimal>,
            _order_type: OrderType,
        ) -> Result<String, ExchangeError> {
            self.placed.lock().push((side, amount, price));
            Ok(format!("r{}", self.next_id.fetch_add(1, Ordering::SeqCst)))
        }
        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<bool, ExchangeError> {
            Ok(true)
        }
        async fn get_order_status(
            &self,
            order_id: &str,
            _symbol: &str,
        ) -> Result<OrderSummary, ExchangeError> {
            Err(ExchangeError::OrderNotFound(order_id.to_string()))
        }
        async fn get_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<OrderSummary>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn grid_config() -> GridConfig {
        GridConfig {
            symbol: "BTC/USDT".into(),
            lower_price: dec!(40000),
            upper_price: dec!(44000),
            num_grids: 5,
            total_investment: dec!(10000),
            spacing: GridSpacing::Arithmetic,
            stop_loss_pct: None,
            place_initial_sells: false,
            cancel_orders_on_shutdown: true,
        }
    }

    fn order(id: &str, side: OrderSide, price: Decimal, status: OrderStatus) -> Order {
        let amount = dec!(0.1);
        let filled = if status == OrderStatus::Closed { amount } else { Decimal::ZERO };
        Order {
            id: id.into(),
            client_order_id: Some(format!("{CLIENT_ID_PREFIX}test{id}")),
            symbol: "BTC/USDT".into(),
            side,
            order_type: OrderType::Limit,
            status,
            price: Some(price),
            amount,
            filled,
            remaining: amount - filled,
            cost: filled * price,
            fee: None,
            timestamp: Utc::now(),
        }
    }

    async fn store() -> Arc<Store> {
        Arc::new(Store::connect("sqlite::memory:", 1).await.unwrap())
    }

    /// Stale-open order reported filled by the exchange: persisted order is
    /// closed, the strategy replays the fill and rests the flip sell, and a
    /// second pass changes nothing.
    #[tokio::test]
    async fn stale_open_fill_is_replayed_and_idempotent() {
        let exchange = Arc::new(MockExchange::default());
        let store = store().await;
        let ctx = RecordingContext::new();

        // Strategy whose ladder binds order X at level 40000.
        let mut strategy = GridStrategy::new(grid_config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();
        let placed_count = ctx.placed.lock().len();
        assert!(placed_count >= 1);

        // Rebind the lowest level to exchange order id "X" (as a restart
        // snapshot would) and persist it as open.
        let state = strategy.get_state();
        let mut snapshot = state.clone();
        snapshot["levels"][0]["order_id"] = serde_json::json!("X");
        let mut strategy = GridStrategy::from_state(&snapshot, ctx.clone(), None).unwrap();

        let open_x = order("X", OrderSide::Buy, dec!(40000), OrderStatus::Open);
        store.upsert_order(&open_x, "mock", None).await.unwrap();

        // The exchange says X is filled.
        exchange.set_order(order("X", OrderSide::Buy, dec!(40000), OrderStatus::Closed));

        let reconciler = Reconciler::new(
            exchange.clone(),
            store.clone(),
            ReconcilePolicy::TrustExchange,
            false,
        );
        let report = reconciler.reconcile(&mut strategy, None, None).await.unwrap();
        assert_eq!(report.marked_filled, 1);

        // DB shows the fill.
        let record = store.get_order("X").await.unwrap().unwrap();
        assert_eq!(record.order.status, OrderStatus::Closed);
        assert_eq!(record.order.filled, dec!(0.1));

        // The strategy placed the flip sell at 41000.
        let placed = ctx.placed.lock().clone();
        let flip = placed.last().unwrap();
        assert_eq!(flip.0, OrderSide::Sell);
        assert_eq!(flip.2, Some(dec!(41000)));

        // Second pass: nothing further changes.
        let report2 = reconciler.reconcile(&mut strategy, None, None).await.unwrap();
        assert_eq!(report2.marked_filled, 0);
        assert_eq!(report2.marked_cancelled, 0);
        assert_eq!(report2.total_discrepancies(), 0);
        assert_eq!(ctx.placed.lock().len(), placed.len());
    }

    #[tokio::test]
    async fn unknown_persisted_order_is_cancelled() {
        let exchange = Arc::new(MockExchange::default());
        let store = store().await;
        let ctx = RecordingContext::new();
        let mut strategy = GridStrategy::new(grid_config(), ctx.clone(), None, None).unwrap();

        let ghost = order("GONE", OrderSide::Buy, dec!(40000), OrderStatus::Open);
        store.upsert_order(&ghost, "mock", None).await.unwrap();

        let reconciler =
            Reconciler::new(exchange, store.clone(), ReconcilePolicy::TrustExchange, false);
        let report = reconciler.reconcile(&mut strategy, None, None).await.unwrap();

        assert_eq!(report.marked_cancelled, 1);
        let record = store.get_order("GONE").await.unwrap().unwrap();
        assert_eq!(record.order.status, OrderStatus::Canceled);
    }

    #[tokio::test]
    async fn our_untracked_order_is_adopted_foreign_is_orphan() {
        let exchange = Arc::new(MockExchange::default());
        let store = store().await;
        let ctx = RecordingContext::new();
        let mut strategy = GridStrategy::new(grid_config(), ctx.clone(), None, None).unwrap();

        // Ours by client-id prefix.
        exchange.set_order(order("ADOPT", OrderSide::Buy, dec!(40000), OrderStatus::Open));
        // Not ours.
        let mut foreign = order("ALIEN", OrderSide::Sell, dec!(43000), OrderStatus::Open);
        foreign.client_order_id = Some("someone-else".into());
        exchange.set_order(foreign);

        let reconciler = Reconciler::new(
            exchange.clone(),
            store.clone(),
            ReconcilePolicy::TrustExchange,
            true,
        );
        let report = reconciler.reconcile(&mut strategy, None, None).await.unwrap();

        assert_eq!(report.adopted, 1);
        assert_eq!(report.orphans, 1);
        assert_eq!(report.orphans_cancelled, 1);
        assert!(store.get_order("ADOPT").await.unwrap().is_some());
        assert_eq!(exchange.cancelled.lock().as_slice(), ["ALIEN"]);
    }

    #[tokio::test]
    async fn closed_locally_open_remotely_is_fatal_under_manual() {
        let exchange = Arc::new(MockExchange::default());
        let store = store().await;
        let ctx = RecordingContext::new();
        let mut strategy = GridStrategy::new(grid_config(), ctx.clone(), None, None).unwrap();

        // Persisted closed, but the exchange still lists it open.
        let closed = order("CONFLICT", OrderSide::Buy, dec!(40000), OrderStatus::Closed);
        store.upsert_order(&closed, "mock", None).await.unwrap();
        exchange.set_order(order("CONFLICT", OrderSide::Buy, dec!(40000), OrderStatus::Open));

        let reconciler =
            Reconciler::new(exchange.clone(), store.clone(), ReconcilePolicy::Manual, false);
        let err = reconciler.reconcile(&mut strategy, None, None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::ClosedLocallyOpenRemotely { .. }));

        // Under TrustExchange the local record is reopened instead.
        let reconciler = Reconciler::new(
            exchange.clone(),
            store.clone(),
            ReconcilePolicy::TrustExchange,
            false,
        );
        reconciler.reconcile(&mut strategy, None, None).await.unwrap();
        let record = store.get_order("CONFLICT").await.unwrap().unwrap();
        assert_eq!(record.order.status, OrderStatus::Open);
    }

    #[tokio::test]
    async fn manual_policy_collects_items_without_mutating() {
        let exchange = Arc::new(MockExchange::default());
        let store = store().await;
        let ctx = RecordingContext::new();
        let mut strategy = GridStrategy::new(grid_config(), ctx.clone(), None, None).unwrap();

        let open_x = order("X", OrderSide::Buy, dec!(40000), OrderStatus::Open);
        store.upsert_order(&open_x, "mock", None).await.unwrap();
        exchange.set_order(order("X", OrderSide::Buy, dec!(40000), OrderStatus::Closed));

        let reconciler =
            Reconciler::new(exchange, store.clone(), ReconcilePolicy::Manual, false);
        let report = reconciler.reconcile(&mut strategy, None, None).await.unwrap();

        assert_eq!(report.manual_items.len(), 1);
        assert_eq!(report.marked_filled, 0);
        // Local record untouched.
        let record = store.get_order("X").await.unwrap().unwrap();
        assert_eq!(record.order.status, OrderStatus::Open);
        assert!(ctx.placed.lock().is_empty());
    }
}
