// =============================================================================
// Backtest execution context — in-memory balances, positions and orders
// =============================================================================
//
// The engine advances simulated time with `set_market_state(ts, prices,
// volumes)`. Each call processes pending orders against the new prices:
// a limit buy fills when price <= limit, a limit sell when price >= limit,
// at the limit price pushed further by adverse slippage; market orders fill
// at the bar price after slippage. Fills pay maker (limit) or taker
// (market) fees and move balance and position atomically. A fill the quote
// balance cannot cover cancels the order instead.
//
// With a latency model configured, an order only becomes eligible once the
// simulated clock passes its drawn delay; limit orders must still honour
// the limit at the post-delay price.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rust_decimal::Decimal;
use tracing::debug;

use crate::error::ExchangeError;
use crate::execution::{ExecutionContext, OrderSummary};
use crate::types::{Order, OrderSide, OrderStatus, OrderType};

use super::simulation::{FeeModel, LatencyModel, SlippageModel};

/// Rolling fee-tier volume window.
const FEE_VOLUME_WINDOW_DAYS: i64 = 30;

#[derive(Debug, Clone)]
struct SimOrder {
    id: String,
    symbol: String,
    side: OrderSide,
    order_type: OrderType,
    status: OrderStatus,
    price: Option<Decimal>,
    amount: Decimal,
    filled: Decimal,
    cost: Decimal,
    fee: Option<Decimal>,
    created_at: DateTime<Utc>,
    /// Earliest simulated time this order may execute (latency model).
    eligible_at: DateTime<Utc>,
}

impl SimOrder {
    fn to_order(&self) -> Order {
        Order {
            id: self.id.clone(),
            client_order_id: None,
            symbol: self.symbol.clone(),
            side: self.side,
            order_type: self.order_type,
            status: self.status,
            price: self.price,
            amount: self.amount,
            filled: self.filled,
            remaining: self.amount - self.filled,
            cost: self.cost,
            fee: self.fee,
            timestamp: self.created_at,
        }
    }
}

struct Inner {
    now: DateTime<Utc>,
    prices: HashMap<String, Decimal>,
    volumes: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
    positions: HashMap<String, Decimal>,
    pending: Vec<SimOrder>,
    history: HashMap<String, SimOrder>,
    recent_notional: VecDeque<(DateTime<Utc>, Decimal)>,
    next_order_id: u64,
    rng: StdRng,
}

/// Simulated execution context shared between engine and strategy.
pub struct BacktestContext {
    fee_model: FeeModel,
    slippage_model: SlippageModel,
    latency_model: Option<LatencyModel>,
    inner: Mutex<Inner>,
}

impl BacktestContext {
    pub fn new(
        initial_balances: HashMap<String, Decimal>,
        fee_model: FeeModel,
        slippage_model: SlippageModel,
        latency_model: Option<LatencyModel>,
        seed: u64,
    ) -> Self {
        Self {
            fee_model,
            slippage_model,
            latency_model,
            inner: Mutex::new(Inner {
                now: DateTime::<Utc>::from_timestamp(0, 0).expect("epoch is valid"),
                prices: HashMap::new(),
                volumes: HashMap::new(),
                balances: initial_balances,
                positions: HashMap::new(),
                pending: Vec::new(),
                history: HashMap::new(),
                recent_notional: VecDeque::new(),
                next_order_id: 1,
                rng: StdRng::seed_from_u64(seed),
            }),
        }
    }

    /// Advance the simulation clock and process pending orders against the
    /// new prices. Returns the orders that reached a terminal state, in
    /// execution order.
    pub fn set_market_state(
        &self,
        ts: DateTime<Utc>,
        prices: HashMap<String, Decimal>,
        volumes: Option<HashMap<String, Decimal>>,
    ) -> Vec<Order> {
        let mut inner = self.inner.lock();
        inner.now = ts;
        inner.prices = prices;
        if let Some(volumes) = volumes {
            inner.volumes = volumes;
        }

        // Expire notional outside the fee-tier window.
        let cutoff = ts - Duration::days(FEE_VOLUME_WINDOW_DAYS);
        while inner
            .recent_notional
            .front()
            .is_some_and(|(t, _)| *t < cutoff)
        {
            inner.recent_notional.pop_front();
        }

        let mut results = Vec::new();
        let mut still_pending = Vec::new();
        let pending = std::mem::take(&mut inner.pending);

        for order in pending {
            if order.eligible_at > ts {
                still_pending.push(order);
                continue;
            }
            let Some(&price) = inner.prices.get(&order.symbol) else {
                still_pending.push(order);
                continue;
            };

            let crosses = match (order.order_type, order.price) {
                (OrderType::Market, _) => true,
                (OrderType::Limit, Some(limit)) => match order.side {
                    OrderSide::Buy => price <= limit,
                    OrderSide::Sell => price >= limit,
                },
                (OrderType::Limit, None) => false,
            };
            if !crosses {
                still_pending.push(order);
                continue;
            }

            let settled = Self::execute(
                &self.fee_model,
                &self.slippage_model,
                &mut inner,
                order,
                price,
                ts,
            );
            results.push(settled);
        }

        inner.pending = still_pending;
        for order in &results {
            let record = inner
                .history
                .get_mut(&order.id)
                .expect("executed order exists in history");
            record.status = order.status;
            record.filled = order.filled;
            record.cost = order.cost;
            record.fee = order.fee;
        }
        results
    }

    /// Execute one crossed order. Insufficient funds cancel it instead.
    fn execute(
        fee_model: &FeeModel,
        slippage_model: &SlippageModel,
        inner: &mut Inner,
        mut order: SimOrder,
        bar_price: Decimal,
        ts: DateTime<Utc>,
    ) -> Order {
        let (base, quote) = split_symbol(&order.symbol);
        let bar_volume = inner
            .volumes
            .get(&order.symbol)
            .copied()
            .unwrap_or(Decimal::ZERO);

        // Limit orders fill from their limit price, market orders from the
        // bar price; slippage pushes both toward adversity.
        let reference = match order.order_type {
            OrderType::Limit => order.price.unwrap_or(bar_price),
            OrderType::Market => bar_price,
        };
        let fill_price = slippage_model.apply(
            reference,
            order.side,
            order.amount,
            bar_volume,
            &mut inner.rng,
        );
        // Slippage is adverse-only: never report a better-than-limit fill.
        let fill_price = match (order.order_type, order.side) {
            (OrderType::Limit, OrderSide::Buy) => fill_price.max(reference),
            (OrderType::Limit, OrderSide::Sell) => fill_price.min(reference),
            _ => fill_price,
        };

        let rolling_volume: Decimal = inner.recent_notional.iter().map(|(_, n)| *n).sum();
        let notional = fill_price * order.amount;
        let is_maker = order.order_type == OrderType::Limit;
        let fee = fee_model.fee(notional, is_maker, rolling_volume);

        match order.side {
            OrderSide::Buy => {
                let required = notional + fee;
                let available = inner.balances.get(quote).copied().unwrap_or(Decimal::ZERO);
                if available < required {
                    debug!(
                        order_id = %order.id,
                        required = %required,
                        available = %available,
                        "fill cancelled: insufficient quote balance"
                    );
                    order.status = OrderStatus::Canceled;
                    return order.to_order();
                }
                *inner.balances.entry(quote.to_string()).or_default() -= required;
                *inner.positions.entry(order.symbol.clone()).or_default() += order.amount;
                *inner.balances.entry(base.to_string()).or_default() += order.amount;
            }
            OrderSide::Sell => {
                let held = inner
                    .positions
                    .get(&order.symbol)
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                if held < order.amount {
                    debug!(
                        order_id = %order.id,
                        held = %held,
                        amount = %order.amount,
                        "fill cancelled: insufficient base position"
                    );
                    order.status = OrderStatus::Canceled;
                    return order.to_order();
                }
                *inner.positions.entry(order.symbol.clone()).or_default() -= order.amount;
                *inner.balances.entry(base.to_string()).or_default() -= order.amount;
                *inner.balances.entry(quote.to_string()).or_default() += notional - fee;
            }
        }

        inner.recent_notional.push_back((ts, notional));

        order.status = OrderStatus::Closed;
        order.filled = order.amount;
        order.cost = notional;
        order.fee = Some(fee);
        order.price = match order.order_type {
            OrderType::Limit => Some(fill_price),
            OrderType::Market => None,
        };
        let mut result = order.to_order();
        // Expose the execution price for market orders through cost/filled.
        result.timestamp = ts;
        result
    }

    pub fn balance_of(&self, currency: &str) -> Decimal {
        self.inner
            .lock()
            .balances
            .get(currency)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub fn position_of(&self, symbol: &str) -> Decimal {
        self.inner
            .lock()
            .positions
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Mark-to-market equity in the quote currency of `symbol`.
    pub fn equity(&self, symbol: &str) -> Decimal {
        let inner = self.inner.lock();
        let (_, quote) = split_symbol(symbol);
        let quote_balance = inner.balances.get(quote).copied().unwrap_or(Decimal::ZERO);
        let position = inner.positions.get(symbol).copied().unwrap_or(Decimal::ZERO);
        let price = inner.prices.get(symbol).copied().unwrap_or(Decimal::ZERO);
        quote_balance + position * price
    }
}

fn split_symbol(symbol: &str) -> (&str, &str) {
    match symbol.split_once('/') {
        Some((base, quote)) => (base, quote),
        None => (symbol, "USDT"),
    }
}

#[async_trait]
impl ExecutionContext for BacktestContext {
    fn current_timestamp(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn is_live(&self) -> bool {
        false
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        self.inner
            .lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::Exchange(format!("no simulated price for {symbol}")))
    }

    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.balance_of(currency))
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let position = self.position_of(symbol);
        Ok((!position.is_zero()).then_some(position))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<String, ExchangeError> {
        if amount <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "amount must be positive, got {amount}"
            )));
        }
        match order_type {
            OrderType::Limit if price.is_none() => {
                return Err(ExchangeError::InvalidOrder("limit orders require a price".into()))
            }
            OrderType::Market if price.is_some() => {
                return Err(ExchangeError::InvalidOrder(
                    "market orders must not carry a price".into(),
                ))
            }
            _ => {}
        }

        let mut inner = self.inner.lock();
        let id = format!("sim-{}", inner.next_order_id);
        inner.next_order_id += 1;

        let delay_ms = match &self.latency_model {
            Some(model) => model.delay_ms(&mut inner.rng),
            None => 0,
        };
        let now = inner.now;
        let order = SimOrder {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            order_type,
            status: OrderStatus::Open,
            price,
            amount,
            filled: Decimal::ZERO,
            cost: Decimal::ZERO,
            fee: None,
            created_at: now,
            eligible_at: now + Duration::milliseconds(delay_ms as i64),
        };
        inner.history.insert(id.clone(), order.clone());
        inner.pending.push(order);
        Ok(id)
    }

    async fn cancel_order(&self, order_id: &str, _symbol: &str) -> Result<bool, ExchangeError> {
        let mut inner = self.inner.lock();
        let Some(index) = inner.pending.iter().position(|o| o.id == order_id) else {
            return Ok(false);
        };
        let mut order = inner.pending.remove(index);
        order.status = OrderStatus::Canceled;
        inner.history.insert(order.id.clone(), order);
        Ok(true)
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        _symbol: &str,
    ) -> Result<OrderSummary, ExchangeError> {
        let inner = self.inner.lock();
        let order = inner
            .history
            .get(order_id)
            .ok_or_else(|| ExchangeError::OrderNotFound(order_id.to_string()))?;
        let o = order.to_order();
        Ok(OrderSummary {
            id: o.id,
            symbol: o.symbol,
            side: o.side,
            status: o.status,
            price: o.price,
            amount: o.amount,
            filled: o.filled,
            remaining: o.remaining,
            fee: o.fee,
        })
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderSummary>, ExchangeError> {
        let inner = self.inner.lock();
        Ok(inner
            .pending
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .map(|o| {
                let o = o.to_order();
                OrderSummary {
                    id: o.id,
                    symbol: o.symbol,
                    side: o.side,
                    status: o.status,
                    price: o.price,
                    amount: o.amount,
                    filled: o.filled,
                    remaining: o.remaining,
                    fee: o.fee,
                }
            })
            .collect())
    }
}
