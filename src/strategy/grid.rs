// =============================================================================
// Grid trading strategy — ladder of resting orders harvesting oscillation
// =============================================================================
//
// Buy orders rest at every level strictly below the current price. A filled
// buy at level i opens a cycle and rests a sell one level up; a filled sell
// closes the oldest open cycle(s) FIFO and rests a new buy one level down.
// Sells at the top level and buys at the bottom level are skipped.
//
// FIFO matching consumes the earliest open buys until the sell quantity is
// exhausted; a partially consumed entry stays in the queue with its
// remaining quantity. Realised profit per sell is
// `(sell_price - matched_buy_price) * qty - fees`.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::execution::ExecutionContext;
use crate::risk::position_sizer::GridSizer;
use crate::types::{Order, OrderSide, OrderType, Ticker};

use super::{Strategy, StrategyEvent, StrategyEventTx};

/// Snapshot format version for migrations.
const STATE_VERSION: u32 = 1;

/// Investment share spread across the ladder; the rest stays in reserve.
const GRID_ALLOCATION_PCT: Decimal = Decimal::from_parts(8, 0, 0, false, 1); // 0.8
const GRID_RESERVE_PCT: Decimal = Decimal::from_parts(2, 0, 0, false, 1); // 0.2

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GridSpacing {
    /// Equal price intervals.
    Arithmetic,
    /// Equal price ratios.
    Geometric,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub symbol: String,
    pub lower_price: Decimal,
    pub upper_price: Decimal,
    pub num_grids: u32,
    pub total_investment: Decimal,
    pub spacing: GridSpacing,
    /// Optional ladder-level stop: triggered when price falls this fraction
    /// below `lower_price`; the strategy liquidates and halts.
    pub stop_loss_pct: Option<Decimal>,
    /// Rest sells above the current price at startup (needs pre-owned base
    /// inventory). Default: sells appear only as flips from filled buys.
    #[serde(default)]
    pub place_initial_sells: bool,
    /// Cancel all resting orders on shutdown.
    #[serde(default = "default_true")]
    pub cancel_orders_on_shutdown: bool,
}

fn default_true() -> bool {
    true
}

impl GridConfig {
    /// Hard validation; violations abort startup.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(3..=100).contains(&self.num_grids) {
            anyhow::bail!("num_grids must be in [3, 100], got {}", self.num_grids);
        }
        if self.lower_price <= Decimal::ZERO {
            anyhow::bail!("lower_price must be positive, got {}", self.lower_price);
        }
        if self.lower_price >= self.upper_price {
            anyhow::bail!(
                "lower_price {} must be below upper_price {}",
                self.lower_price,
                self.upper_price
            );
        }
        if self.total_investment <= Decimal::ZERO {
            anyhow::bail!(
                "total_investment must be positive, got {}",
                self.total_investment
            );
        }
        if let Some(pct) = self.stop_loss_pct {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                anyhow::bail!("stop_loss_pct must be in (0, 1), got {pct}");
            }
        }
        Ok(())
    }

    /// Soft checks; each finding is logged but trading proceeds.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.upper_price - self.lower_price > self.lower_price * Decimal::TWO {
            out.push(format!(
                "price range {}..{} is wider than 200% of the lower bound",
                self.lower_price, self.upper_price
            ));
        }
        if self.num_grids < 10 {
            out.push(format!(
                "only {} levels; fills will be infrequent",
                self.num_grids
            ));
        }
        out
    }
}

/// Quote allocation per grid interval.
pub fn per_grid_allocation(config: &GridConfig) -> Decimal {
    let sizer = GridSizer::new(GRID_ALLOCATION_PCT, GRID_RESERVE_PCT)
        .expect("grid allocation constants are valid");
    sizer
        .per_grid_allocation(config.total_investment, config.num_grids - 1)
        .expect("num_grids >= 3 implies at least two intervals")
}

// ---------------------------------------------------------------------------
// Ladder state
// ---------------------------------------------------------------------------

/// Target status of a level's resting order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LevelStatus {
    Open,
    Filled,
    Canceled,
}

/// One rung of the ladder. `side`/`status`/`order_id` describe the order
/// currently bound to this price, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridLevel {
    pub price: Decimal,
    pub side: Option<OrderSide>,
    pub status: Option<LevelStatus>,
    pub order_id: Option<String>,
}

impl GridLevel {
    fn unbound(price: Decimal) -> Self {
        Self {
            price,
            side: None,
            status: None,
            order_id: None,
        }
    }

    fn bind(&mut self, side: OrderSide, order_id: String) {
        self.side = Some(side);
        self.status = Some(LevelStatus::Open);
        self.order_id = Some(order_id);
    }
}

/// Compute ladder prices for a config, optionally rounded to the market
/// tick (toward zero).
pub fn compute_levels(config: &GridConfig, tick_size: Option<Decimal>) -> Vec<Decimal> {
    let n = config.num_grids as usize;
    let mut prices = Vec::with_capacity(n);

    match config.spacing {
        GridSpacing::Arithmetic => {
            let step =
                (config.upper_price - config.lower_price) / Decimal::from(config.num_grids - 1);
            for i in 0..n {
                prices.push(config.lower_price + Decimal::from(i as u64) * step);
            }
        }
        GridSpacing::Geometric => {
            let ratio = (config.upper_price / config.lower_price)
                .powd(Decimal::ONE / Decimal::from(config.num_grids - 1));
            let mut price = config.lower_price;
            for _ in 0..n {
                prices.push(price);
                price *= ratio;
            }
        }
    }

    if let Some(tick) = tick_size.filter(|t| !t.is_zero()) {
        for price in prices.iter_mut() {
            *price = (*price / tick).trunc() * tick;
        }
    }
    prices
}

// ---------------------------------------------------------------------------
// FIFO cycle ledger
// ---------------------------------------------------------------------------

/// One open entry (a filled buy awaiting its sell).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FifoEntry {
    price: Decimal,
    amount: Decimal,
    fee: Decimal,
    opened_at: DateTime<Utc>,
}

/// Result of matching one sell fill against the ledger.
#[derive(Debug, Clone, PartialEq)]
struct FifoMatch {
    matched_amount: Decimal,
    gross_profit: Decimal,
    buy_fees: Decimal,
    cycles_completed: u64,
    /// Open time of the earliest consumed entry.
    first_opened_at: Option<DateTime<Utc>>,
}

/// Consume the earliest entries until `sell_amount` is exhausted. Partially
/// consumed entries stay in the queue with their remaining quantity and a
/// proportionally reduced fee.
fn consume_fifo(queue: &mut VecDeque<FifoEntry>, sell_price: Decimal, sell_amount: Decimal) -> FifoMatch {
    let mut remaining = sell_amount;
    let mut gross_profit = Decimal::ZERO;
    let mut buy_fees = Decimal::ZERO;
    let mut matched = Decimal::ZERO;
    let mut cycles = 0u64;
    let mut first_opened_at = None;

    while remaining > Decimal::ZERO {
        let Some(entry) = queue.front_mut() else { break };
        if first_opened_at.is_none() {
            first_opened_at = Some(entry.opened_at);
        }
        if entry.amount <= remaining {
            remaining -= entry.amount;
            matched += entry.amount;
            gross_profit += (sell_price - entry.price) * entry.amount;
            buy_fees += entry.fee;
            cycles += 1;
            queue.pop_front();
        } else {
            let fraction = remaining / entry.amount;
            let consumed_fee = entry.fee * fraction;
            gross_profit += (sell_price - entry.price) * remaining;
            buy_fees += consumed_fee;
            matched += remaining;
            entry.amount -= remaining;
            entry.fee -= consumed_fee;
            remaining = Decimal::ZERO;
        }
    }

    FifoMatch {
        matched_amount: matched,
        gross_profit,
        buy_fees,
        cycles_completed: cycles,
        first_opened_at,
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridStats {
    /// Gross realised profit across completed cycles.
    pub total_profit: Decimal,
    pub total_fees: Decimal,
    pub completed_cycles: u64,
}

impl GridStats {
    pub fn net_profit(&self) -> Decimal {
        self.total_profit - self.total_fees
    }
}

// ---------------------------------------------------------------------------
// Strategy
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct GridSnapshot {
    name: String,
    version: u32,
    config: GridConfig,
    levels: Vec<GridLevel>,
    fifo: VecDeque<FifoEntry>,
    statistics: GridStats,
    halted: bool,
    last_price: Option<Decimal>,
    tick_size: Option<Decimal>,
    liquidation_order_id: Option<String>,
}

pub struct GridStrategy {
    name: String,
    config: GridConfig,
    context: Arc<dyn ExecutionContext>,
    events: Option<StrategyEventTx>,
    levels: Vec<GridLevel>,
    fifo: VecDeque<FifoEntry>,
    stats: GridStats,
    halted: bool,
    last_price: Option<Decimal>,
    tick_size: Option<Decimal>,
    liquidation_order_id: Option<String>,
}

impl GridStrategy {
    pub fn new(
        config: GridConfig,
        context: Arc<dyn ExecutionContext>,
        events: Option<StrategyEventTx>,
        tick_size: Option<Decimal>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        let levels = compute_levels(&config, tick_size)
            .into_iter()
            .map(GridLevel::unbound)
            .collect();
        Ok(Self {
            name: format!("grid:{}", config.symbol),
            config,
            context,
            events,
            levels,
            fifo: VecDeque::new(),
            stats: GridStats::default(),
            halted: false,
            last_price: None,
            tick_size,
            liquidation_order_id: None,
        })
    }

    /// Restore a strategy from a snapshot produced by `get_state`. The
    /// ladder (prices, bindings, order ids) survives verbatim so a restart
    /// keeps its identity.
    pub fn from_state(
        state: &serde_json::Value,
        context: Arc<dyn ExecutionContext>,
        events: Option<StrategyEventTx>,
    ) -> anyhow::Result<Self> {
        let snapshot: GridSnapshot = serde_json::from_value(state.clone())?;
        if snapshot.version > STATE_VERSION {
            anyhow::bail!(
                "snapshot version {} is newer than supported {}",
                snapshot.version,
                STATE_VERSION
            );
        }
        snapshot.config.validate()?;
        Ok(Self {
            name: snapshot.name,
            config: snapshot.config,
            context,
            events,
            levels: snapshot.levels,
            fifo: snapshot.fifo,
            stats: snapshot.statistics,
            halted: snapshot.halted,
            last_price: snapshot.last_price,
            tick_size: snapshot.tick_size,
            liquidation_order_id: snapshot.liquidation_order_id,
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn levels(&self) -> &[GridLevel] {
        &self.levels
    }

    pub fn stats(&self) -> &GridStats {
        &self.stats
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn open_cycle_count(&self) -> usize {
        self.fifo.len()
    }

    /// Count of levels with a resting (open) order.
    pub fn active_order_count(&self) -> usize {
        self.levels
            .iter()
            .filter(|l| l.status == Some(LevelStatus::Open))
            .count()
    }

    fn emit(&self, event: StrategyEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Nearest level by price; ties resolve to the lower index.
    fn nearest_level_index(&self, price: Decimal) -> Option<usize> {
        let mut best: Option<(usize, Decimal)> = None;
        for (i, level) in self.levels.iter().enumerate() {
            let diff = (level.price - price).abs();
            match best {
                Some((_, best_diff)) if diff >= best_diff => {}
                _ => best = Some((i, diff)),
            }
        }
        best.map(|(i, _)| i)
    }

    fn level_index_for_order(&self, order: &Order) -> Option<usize> {
        if let Some(i) = self
            .levels
            .iter()
            .position(|l| l.order_id.as_deref() == Some(order.id.as_str()))
        {
            return Some(i);
        }
        let price = order.price.or_else(|| order_fill_price(order))?;
        self.nearest_level_index(price)
    }

    /// Place a limit order and bind it to a level. Domain failures
    /// (insufficient funds, invalid order) are absorbed: the level is left
    /// unbound and the condition logged. Transport failures propagate.
    async fn place_level_order(
        &mut self,
        index: usize,
        side: OrderSide,
        amount: Decimal,
    ) -> anyhow::Result<()> {
        let price = self.levels[index].price;
        match self
            .context
            .place_order(&self.config.symbol, side, amount, Some(price), OrderType::Limit)
            .await
        {
            Ok(order_id) => {
                debug!(
                    symbol = %self.config.symbol,
                    side = %side,
                    price = %price,
                    amount = %amount,
                    order_id = %order_id,
                    "grid order placed"
                );
                self.levels[index].bind(side, order_id);
                Ok(())
            }
            Err(
                e @ (ExchangeError::InsufficientFunds(_)
                | ExchangeError::InvalidOrder(_)
                | ExchangeError::InsufficientNotional(_)),
            ) => {
                error!(
                    symbol = %self.config.symbol,
                    side = %side,
                    price = %price,
                    error = %e,
                    "grid order rejected; level left unbound"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn handle_buy_fill(&mut self, index: usize, order: &Order) -> anyhow::Result<()> {
        let fill_price = order.price.or_else(|| order_fill_price(order)).unwrap_or(self.levels[index].price);
        let fee = order.fee.unwrap_or(Decimal::ZERO);

        self.levels[index].status = Some(LevelStatus::Filled);
        self.levels[index].order_id = None;

        self.fifo.push_back(FifoEntry {
            price: fill_price,
            amount: order.filled,
            fee,
            opened_at: order.timestamp,
        });
        self.emit(StrategyEvent::CycleOpened {
            symbol: self.config.symbol.clone(),
            side: OrderSide::Buy,
            open_rate: fill_price,
            amount: order.filled,
            open_date: order.timestamp,
        });
        info!(
            symbol = %self.config.symbol,
            level = index,
            price = %fill_price,
            amount = %order.filled,
            "buy filled; cycle opened"
        );

        // Flip: rest a sell one level up, unless this was the top level.
        if index + 1 < self.levels.len() {
            self.place_level_order(index + 1, OrderSide::Sell, order.filled).await?;
        } else {
            debug!(level = index, "buy filled at top level; no sell to place");
        }
        Ok(())
    }

    async fn handle_sell_fill(&mut self, index: usize, order: &Order) -> anyhow::Result<()> {
        let fill_price = order.price.or_else(|| order_fill_price(order)).unwrap_or(self.levels[index].price);
        let sell_fee = order.fee.unwrap_or(Decimal::ZERO);

        self.levels[index].status = Some(LevelStatus::Filled);
        self.levels[index].order_id = None;

        let matched = consume_fifo(&mut self.fifo, fill_price, order.filled);
        if matched.matched_amount < order.filled {
            warn!(
                symbol = %self.config.symbol,
                unmatched = %(order.filled - matched.matched_amount),
                "sell fill exceeded open cycle inventory"
            );
        }

        let fees = sell_fee + matched.buy_fees;
        let net_profit = matched.gross_profit - fees;
        self.stats.total_profit += matched.gross_profit;
        self.stats.total_fees += fees;
        self.stats.completed_cycles += matched.cycles_completed;

        let profit_pct = if fill_price > Decimal::ZERO && matched.matched_amount > Decimal::ZERO {
            let cost_basis = fill_price * matched.matched_amount - matched.gross_profit;
            if cost_basis > Decimal::ZERO {
                net_profit / cost_basis
            } else {
                Decimal::ZERO
            }
        } else {
            Decimal::ZERO
        };

        self.emit(StrategyEvent::CycleClosed {
            symbol: self.config.symbol.clone(),
            open_date: matched.first_opened_at.unwrap_or(order.timestamp),
            close_rate: fill_price,
            close_date: order.timestamp,
            amount: matched.matched_amount,
            profit: net_profit,
            profit_pct,
            fee: fees,
        });
        info!(
            symbol = %self.config.symbol,
            level = index,
            price = %fill_price,
            profit = %net_profit,
            cycles = self.stats.completed_cycles,
            "sell filled; cycle closed"
        );

        // Flip: rest a buy one level down, unless this was the bottom level.
        if index > 0 {
            self.place_level_order(index - 1, OrderSide::Buy, order.filled).await?;
        } else {
            debug!(level = index, "sell filled at bottom level; no buy to place");
        }
        Ok(())
    }

    /// Ladder-level stop: cancel every resting order, liquidate open
    /// inventory at market and halt.
    async fn trigger_stop(&mut self, price: Decimal) -> anyhow::Result<()> {
        warn!(
            symbol = %self.config.symbol,
            price = %price,
            lower = %self.config.lower_price,
            "grid stop-loss triggered; cancelling ladder and liquidating"
        );
        self.halted = true;
        self.cancel_all_orders().await?;

        let inventory: Decimal = self.fifo.iter().map(|e| e.amount).sum();
        if inventory > Decimal::ZERO {
            match self
                .context
                .place_order(&self.config.symbol, OrderSide::Sell, inventory, None, OrderType::Market)
                .await
            {
                Ok(order_id) => self.liquidation_order_id = Some(order_id),
                Err(e) => error!(error = %e, "liquidation order failed"),
            }
        }

        self.emit(StrategyEvent::StopLossTriggered {
            symbol: self.config.symbol.clone(),
            price,
        });
        Ok(())
    }

    async fn handle_liquidation_fill(&mut self, order: &Order) {
        let fill_price = order_fill_price(order).unwrap_or(self.last_price.unwrap_or_default());
        let sell_fee = order.fee.unwrap_or(Decimal::ZERO);
        let matched = consume_fifo(&mut self.fifo, fill_price, order.filled);

        let fees = sell_fee + matched.buy_fees;
        self.stats.total_profit += matched.gross_profit;
        self.stats.total_fees += fees;
        self.stats.completed_cycles += matched.cycles_completed;
        self.liquidation_order_id = None;

        self.emit(StrategyEvent::CycleClosed {
            symbol: self.config.symbol.clone(),
            open_date: matched.first_opened_at.unwrap_or(order.timestamp),
            close_rate: fill_price,
            close_date: order.timestamp,
            amount: matched.matched_amount,
            profit: matched.gross_profit - fees,
            profit_pct: Decimal::ZERO,
            fee: fees,
        });
        info!(
            symbol = %self.config.symbol,
            price = %fill_price,
            amount = %matched.matched_amount,
            "liquidation filled; ladder halted"
        );
    }

    async fn cancel_all_orders(&mut self) -> anyhow::Result<()> {
        for i in 0..self.levels.len() {
            if self.levels[i].status != Some(LevelStatus::Open) {
                continue;
            }
            let Some(order_id) = self.levels[i].order_id.clone() else {
                continue;
            };
            match self.context.cancel_order(&order_id, &self.config.symbol).await {
                Ok(_) => {
                    self.levels[i].status = Some(LevelStatus::Canceled);
                    self.levels[i].order_id = None;
                }
                Err(e) => warn!(order_id = %order_id, error = %e, "cancel failed during teardown"),
            }
        }
        Ok(())
    }
}

/// Average fill price of an order from its cost, when no limit price exists.
fn order_fill_price(order: &Order) -> Option<Decimal> {
    if order.filled > Decimal::ZERO && order.cost > Decimal::ZERO {
        Some(order.cost / order.filled)
    } else {
        None
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        for warning in self.config.warnings() {
            warn!(symbol = %self.config.symbol, "{warning}");
        }
        if let (Some(tick), true) = (self.tick_size, self.levels.len() >= 2) {
            let spacing = self.levels[1].price - self.levels[0].price;
            if !tick.is_zero() && spacing < tick {
                warn!(
                    spacing = %spacing,
                    tick = %tick,
                    "inter-level spacing below exchange precision"
                );
            }
        }

        let price = self.context.get_current_price(&self.config.symbol).await?;
        self.last_price = Some(price);

        let allocation = per_grid_allocation(&self.config);
        info!(
            symbol = %self.config.symbol,
            price = %price,
            levels = self.levels.len(),
            allocation = %allocation,
            "initialising grid ladder"
        );

        for i in 0..self.levels.len() {
            let level_price = self.levels[i].price;
            if level_price < price {
                let amount = allocation / level_price;
                self.place_level_order(i, OrderSide::Buy, amount).await?;
            } else if level_price > price && self.config.place_initial_sells {
                let amount = allocation / level_price;
                self.place_level_order(i, OrderSide::Sell, amount).await?;
            }
        }

        info!(
            symbol = %self.config.symbol,
            resting = self.active_order_count(),
            "grid ladder initialised"
        );
        Ok(())
    }

    async fn on_tick(&mut self, ticker: &Ticker) -> anyhow::Result<()> {
        if self.halted {
            return Ok(());
        }
        self.last_price = Some(ticker.last);

        if let Some(pct) = self.config.stop_loss_pct {
            let threshold = self.config.lower_price * (Decimal::ONE - pct);
            if ticker.last <= threshold {
                self.trigger_stop(ticker.last).await?;
            }
        }
        Ok(())
    }

    async fn on_order_filled(&mut self, order: &Order) -> anyhow::Result<()> {
        if self.liquidation_order_id.as_deref() == Some(order.id.as_str()) {
            self.handle_liquidation_fill(order).await;
            return Ok(());
        }
        if self.halted {
            debug!(order_id = %order.id, "fill ignored; ladder halted");
            return Ok(());
        }
        let Some(index) = self.level_index_for_order(order) else {
            warn!(order_id = %order.id, "fill does not map to any grid level");
            return Ok(());
        };

        match order.side {
            OrderSide::Buy => self.handle_buy_fill(index, order).await,
            OrderSide::Sell => self.handle_sell_fill(index, order).await,
        }
    }

    async fn on_order_cancelled(&mut self, order: &Order) -> anyhow::Result<()> {
        if let Some(index) = self
            .levels
            .iter()
            .position(|l| l.order_id.as_deref() == Some(order.id.as_str()))
        {
            self.levels[index].status = Some(LevelStatus::Canceled);
            self.levels[index].order_id = None;
            info!(
                symbol = %self.config.symbol,
                level = index,
                order_id = %order.id,
                "grid order cancelled"
            );
        }
        Ok(())
    }

    fn get_state(&self) -> serde_json::Value {
        let snapshot = GridSnapshot {
            name: self.name.clone(),
            version: STATE_VERSION,
            config: self.config.clone(),
            levels: self.levels.clone(),
            fifo: self.fifo.clone(),
            statistics: self.stats.clone(),
            halted: self.halted,
            last_price: self.last_price,
            tick_size: self.tick_size,
            liquidation_order_id: self.liquidation_order_id.clone(),
        };
        serde_json::to_value(snapshot).expect("grid snapshot serialises")
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        if self.config.cancel_orders_on_shutdown {
            info!(symbol = %self.config.symbol, "cancelling grid orders on shutdown");
            self.cancel_all_orders().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderSummary;
    use crate::types::{OrderStatus, OrderType};
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct Placed {
        id: String,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    }

    struct MockContext {
        price: Mutex<Decimal>,
        placed: Mutex<Vec<Placed>>,
        cancelled: Mutex<Vec<String>>,
        next_id: AtomicU64,
    }

    impl MockContext {
        fn new(price: Decimal) -> Arc<Self> {
            Arc::new(Self {
                price: Mutex::new(price),
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            })
        }

        fn placed(&self) -> Vec<Placed> {
            self.placed.lock().clone()
        }

        fn clear_placed(&self) {
            self.placed.lock().clear();
        }
    }

    #[async_trait]
    impl ExecutionContext for MockContext {
        fn current_timestamp(&self) -> DateTime<Utc> {
            Utc::now()
        }
        fn is_live(&self) -> bool {
            false
        }
        async fn get_current_price(&self, _symbol: &str) -> Result<Decimal, ExchangeError> {
            Ok(*self.price.lock())
        }
        async fn get_balance(&self, _currency: &str) -> Result<Decimal, ExchangeError> {
            Ok(dec!(1000000))
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
            order_type: OrderType,
        ) -> Result<String, ExchangeError> {
            let id = format!("m{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.placed.lock().push(Placed {
                id: id.clone(),
                side,
                amount,
                price,
                order_type,
            });
            Ok(id)
        }
        async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool, ExchangeError> {
            self.cancelled.lock().push(order_id.to_string());
            Ok(true)
        }
        async fn get_order_status(
            &self,
            _order_id: &str,
            _symbol: &str,
        ) -> Result<OrderSummary, ExchangeError> {
            Err(ExchangeError::OrderNotFound("mock".into()))
        }
        async fn get_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<OrderSummary>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    fn config() -> GridConfig {
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

    fn filled_order(id: &str, side: OrderSide, price: Decimal, amount: Decimal) -> Order {
        Order {
            id: id.into(),
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side,
            order_type: OrderType::Limit,
            status: OrderStatus::Closed,
            price: Some(price),
            amount,
            filled: amount,
            remaining: Decimal::ZERO,
            cost: price * amount,
            fee: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn arithmetic_ladder_matches_reference() {
        let prices = compute_levels(&config(), None);
        assert_eq!(
            prices,
            vec![dec!(40000), dec!(41000), dec!(42000), dec!(43000), dec!(44000)]
        );
        // Per-grid allocation at 4 active grids: 10000 * 0.8 / 4 = 2000.
        assert_eq!(per_grid_allocation(&config()), dec!(2000));
    }

    #[test]
    fn geometric_ladder_has_equal_ratios() {
        let mut cfg = config();
        cfg.spacing = GridSpacing::Geometric;
        cfg.lower_price = dec!(40000);
        cfg.upper_price = dec!(50000);
        cfg.num_grids = 11;
        let prices = compute_levels(&cfg, None);

        assert_eq!(prices.len(), 11);
        assert!(prices[0] >= dec!(39999) && prices[0] <= dec!(40001));
        assert!(prices[10] >= dec!(49999) && prices[10] <= dec!(50001));

        let first_ratio = prices[1] / prices[0];
        for pair in prices.windows(2) {
            let ratio = pair[1] / pair[0];
            assert!((ratio - first_ratio).abs() < dec!(0.0001));
        }
        // Every level stays inside [lower, upper].
        for p in &prices {
            assert!(*p >= cfg.lower_price - dec!(1) && *p <= cfg.upper_price + dec!(1));
        }
    }

    #[test]
    fn ladder_prices_round_to_tick() {
        let mut cfg = config();
        cfg.spacing = GridSpacing::Geometric;
        let prices = compute_levels(&cfg, Some(dec!(0.01)));
        for p in &prices {
            assert_eq!(*p % dec!(0.01), Decimal::ZERO);
        }
    }

    #[test]
    fn config_bounds_are_enforced() {
        let mut cfg = config();
        cfg.num_grids = 2;
        assert!(cfg.validate().is_err());
        cfg.num_grids = 101;
        assert!(cfg.validate().is_err());
        cfg.num_grids = 3;
        assert!(cfg.validate().is_ok());
        cfg.num_grids = 100;
        assert!(cfg.validate().is_ok());

        cfg.lower_price = dec!(44000);
        cfg.upper_price = dec!(40000);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn soft_warnings_do_not_block() {
        let mut cfg = config();
        cfg.upper_price = dec!(130000); // > 200% above lower
        assert!(cfg.validate().is_ok());
        let warnings = cfg.warnings();
        assert_eq!(warnings.len(), 2); // wide range + fewer than 10 levels
    }

    #[tokio::test]
    async fn initialize_rests_buys_strictly_below_price() {
        let ctx = MockContext::new(dec!(42000));
        let mut strategy = GridStrategy::new(config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();

        let placed = ctx.placed();
        // Levels 40000 and 41000 are strictly below 42000; 42000 itself is not.
        assert_eq!(placed.len(), 2);
        for order in &placed {
            assert_eq!(order.side, OrderSide::Buy);
            assert!(order.price.unwrap() < dec!(42000));
            // amount = 2000 / level price
            assert_eq!(order.amount, dec!(2000) / order.price.unwrap());
        }
        assert_eq!(strategy.active_order_count(), 2);
    }

    #[tokio::test]
    async fn initialize_with_sells_enabled_covers_upper_levels() {
        let ctx = MockContext::new(dec!(42000));
        let mut cfg = config();
        cfg.place_initial_sells = true;
        let mut strategy = GridStrategy::new(cfg, ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();

        let placed = ctx.placed();
        let sells: Vec<_> = placed.iter().filter(|p| p.side == OrderSide::Sell).collect();
        assert_eq!(sells.len(), 2); // 43000 and 44000
        assert!(sells.iter().all(|s| s.price.unwrap() > dec!(42000)));
    }

    #[tokio::test]
    async fn buy_fill_flips_to_sell_one_level_up() {
        let ctx = MockContext::new(dec!(42000));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut strategy = GridStrategy::new(config(), ctx.clone(), Some(tx), None).unwrap();
        strategy.initialize().await.unwrap();

        let buy_id = ctx.placed()[0].id.clone(); // buy at 40000
        ctx.clear_placed();

        let fill = filled_order(&buy_id, OrderSide::Buy, dec!(40000), dec!(0.1));
        strategy.on_order_filled(&fill).await.unwrap();

        // Exactly one new sell at 41000 with the same base amount.
        let placed = ctx.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].price, Some(dec!(41000)));
        assert_eq!(placed[0].amount, dec!(0.1));

        // One cycle opened.
        assert_eq!(strategy.open_cycle_count(), 1);
        match rx.try_recv().unwrap() {
            StrategyEvent::CycleOpened { open_rate, amount, .. } => {
                assert_eq!(open_rate, dec!(40000));
                assert_eq!(amount, dec!(0.1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sell_fill_closes_cycle_fifo_and_rests_new_buy() {
        let ctx = MockContext::new(dec!(42000));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut strategy = GridStrategy::new(config(), ctx.clone(), Some(tx), None).unwrap();
        strategy.initialize().await.unwrap();

        let buy_id = ctx.placed()[0].id.clone();
        let mut buy = filled_order(&buy_id, OrderSide::Buy, dec!(40000), dec!(0.1));
        buy.fee = Some(dec!(0.5));
        strategy.on_order_filled(&buy).await.unwrap();
        let _ = rx.try_recv(); // CycleOpened

        let sell_id = ctx.placed().last().unwrap().id.clone(); // sell at 41000
        ctx.clear_placed();

        let mut sell = filled_order(&sell_id, OrderSide::Sell, dec!(41000), dec!(0.1));
        sell.fee = Some(dec!(0.5));
        strategy.on_order_filled(&sell).await.unwrap();

        // Gross (41000 - 40000) * 0.1 = 100; fees 1.0; net 99.
        assert_eq!(strategy.stats().total_profit, dec!(100.0));
        assert_eq!(strategy.stats().total_fees, dec!(1.0));
        assert_eq!(strategy.stats().net_profit(), dec!(99.0));
        assert_eq!(strategy.stats().completed_cycles, 1);
        assert_eq!(strategy.open_cycle_count(), 0);

        match rx.try_recv().unwrap() {
            StrategyEvent::CycleClosed { profit, fee, amount, .. } => {
                assert_eq!(profit, dec!(99.0));
                assert_eq!(fee, dec!(1.0));
                assert_eq!(amount, dec!(0.1));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        // A replacement buy rests one level below the sell (41000 -> 40000).
        let placed = ctx.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].side, OrderSide::Buy);
        assert_eq!(placed[0].price, Some(dec!(40000)));
    }

    #[tokio::test]
    async fn top_level_buy_fill_skips_flip() {
        let ctx = MockContext::new(dec!(45000)); // everything below price
        let mut strategy = GridStrategy::new(config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();

        // Find the buy bound to the top level (44000).
        let top_buy = ctx
            .placed()
            .iter()
            .find(|p| p.price == Some(dec!(44000)))
            .unwrap()
            .id
            .clone();
        ctx.clear_placed();

        let fill = filled_order(&top_buy, OrderSide::Buy, dec!(44000), dec!(0.05));
        strategy.on_order_filled(&fill).await.unwrap();
        assert!(ctx.placed().is_empty());
        assert_eq!(strategy.open_cycle_count(), 1);
    }

    #[tokio::test]
    async fn fifo_partial_consumption_keeps_remainder() {
        let mut queue = VecDeque::new();
        queue.push_back(FifoEntry {
            price: dec!(100),
            amount: dec!(2),
            fee: dec!(2),
            opened_at: Utc::now(),
        });
        queue.push_back(FifoEntry {
            price: dec!(101),
            amount: dec!(1),
            fee: dec!(1),
            opened_at: Utc::now(),
        });

        // Sell 2.5 at 105: consumes the whole first entry and half the second.
        let matched = consume_fifo(&mut queue, dec!(105), dec!(2.5));
        assert_eq!(matched.matched_amount, dec!(2.5));
        // (105-100)*2 + (105-101)*0.5 = 12.
        assert_eq!(matched.gross_profit, dec!(12.0));
        // Full first fee + half the second.
        assert_eq!(matched.buy_fees, dec!(2.5));
        assert_eq!(matched.cycles_completed, 1);

        // Remainder stays queued with proportional fee.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].amount, dec!(0.5));
        assert_eq!(queue[0].fee, dec!(0.5));
        assert_eq!(queue[0].price, dec!(101));
    }

    #[test]
    fn exact_level_price_resolves_to_lower_index() {
        let ctx = MockContext::new(dec!(42000));
        let mut cfg = config();
        // Two identical level prices are impossible with a strict ladder, but
        // an equidistant fill price must pick the lower index.
        cfg.num_grids = 3; // 40000, 42000, 44000
        let strategy = GridStrategy::new(cfg, ctx, None, None).unwrap();
        // 41000 is equidistant from 40000 and 42000.
        assert_eq!(strategy.nearest_level_index(dec!(41000)), Some(0));
        assert_eq!(strategy.nearest_level_index(dec!(42000)), Some(1));
    }

    #[tokio::test]
    async fn snapshot_restore_preserves_ladder_identity() {
        let ctx = MockContext::new(dec!(42000));
        let mut strategy = GridStrategy::new(config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();

        let buy_id = ctx.placed()[0].id.clone();
        strategy
            .on_order_filled(&filled_order(&buy_id, OrderSide::Buy, dec!(40000), dec!(0.1)))
            .await
            .unwrap();

        let state = strategy.get_state();
        // Decimals serialise as strings.
        assert!(state["config"]["lower_price"].is_string());
        assert_eq!(state["version"], 1);

        let restored = GridStrategy::from_state(&state, ctx.clone(), None).unwrap();
        assert_eq!(restored.levels(), strategy.levels());
        assert_eq!(restored.stats(), strategy.stats());
        assert_eq!(restored.open_cycle_count(), strategy.open_cycle_count());
        assert_eq!(restored.name(), strategy.name());

        // The restored ladder still knows the resting sell's order id.
        let sell_binding = restored
            .levels()
            .iter()
            .find(|l| l.side == Some(OrderSide::Sell) && l.status == Some(LevelStatus::Open));
        assert!(sell_binding.is_some());
    }

    #[tokio::test]
    async fn stop_loss_cancels_liquidates_and_halts() {
        let ctx = MockContext::new(dec!(42000));
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut cfg = config();
        cfg.stop_loss_pct = Some(dec!(0.05));
        let mut strategy = GridStrategy::new(cfg, ctx.clone(), Some(tx), None).unwrap();
        strategy.initialize().await.unwrap();

        // Fill one buy so there is inventory to liquidate.
        let buy_id = ctx.placed()[0].id.clone();
        strategy
            .on_order_filled(&filled_order(&buy_id, OrderSide::Buy, dec!(40000), dec!(0.1)))
            .await
            .unwrap();
        let _ = rx.try_recv();
        ctx.clear_placed();

        // Price collapses below 40000 * 0.95 = 38000.
        let ticker = Ticker {
            symbol: "BTC/USDT".into(),
            bid: dec!(37900),
            ask: dec!(37910),
            last: dec!(37905),
            timestamp: Utc::now(),
        };
        strategy.on_tick(&ticker).await.unwrap();

        assert!(strategy.is_halted());
        // A market sell for the full inventory was placed.
        let placed = ctx.placed();
        assert_eq!(placed.len(), 1);
        assert_eq!(placed[0].order_type, OrderType::Market);
        assert_eq!(placed[0].side, OrderSide::Sell);
        assert_eq!(placed[0].amount, dec!(0.1));
        // Resting orders were cancelled.
        assert!(!ctx.cancelled.lock().is_empty());
        assert!(matches!(
            rx.try_recv().unwrap(),
            StrategyEvent::StopLossTriggered { .. }
        ));

        // Further ticks are ignored.
        strategy.on_tick(&ticker).await.unwrap();
        assert_eq!(ctx.placed().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_order_unbinds_its_level() {
        let ctx = MockContext::new(dec!(42000));
        let mut strategy = GridStrategy::new(config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();

        let buy_id = ctx.placed()[0].id.clone();
        let mut cancelled = filled_order(&buy_id, OrderSide::Buy, dec!(40000), dec!(0.1));
        cancelled.status = OrderStatus::Canceled;
        cancelled.filled = Decimal::ZERO;
        cancelled.remaining = cancelled.amount;
        strategy.on_order_cancelled(&cancelled).await.unwrap();

        let level = &strategy.levels()[0];
        assert_eq!(level.status, Some(LevelStatus::Canceled));
        assert!(level.order_id.is_none());
    }

    #[tokio::test]
    async fn shutdown_cancels_resting_orders_when_configured() {
        let ctx = MockContext::new(dec!(42000));
        let mut strategy = GridStrategy::new(config(), ctx.clone(), None, None).unwrap();
        strategy.initialize().await.unwrap();
        assert_eq!(strategy.active_order_count(), 2);

        strategy.shutdown().await.unwrap();
        assert_eq!(ctx.cancelled.lock().len(), 2);
        assert_eq!(strategy.active_order_count(), 0);
    }
}
