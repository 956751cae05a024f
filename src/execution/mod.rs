// =============================================================================
// Execution context — the order surface strategies program against
// =============================================================================
//
// Two implementations exist: the live context (delegating to the exchange
// adapter and persisting side effects) and the backtest context (in-memory
// balances with simulated fills). Strategies hold `Arc<dyn ExecutionContext>`
// and stay agnostic of which one is underneath.
// =============================================================================

pub mod live;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::{OrderSide, OrderStatus, OrderType};

/// Compact order view returned by status and open-order queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub fee: Option<Decimal>,
}

/// Abstract order-execution surface. Wall time and exchange truth in live
/// trading; simulated time and in-memory books in a backtest.
#[async_trait]
pub trait ExecutionContext: Send + Sync {
    /// Wall time in live mode, simulated bar time in a backtest.
    fn current_timestamp(&self) -> DateTime<Utc>;

    fn is_live(&self) -> bool;

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError>;

    /// Free balance for a currency.
    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;

    /// Base-asset holding for a symbol, if any.
    async fn get_position(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;

    /// Place an order and return its id.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<String, ExchangeError>;

    /// Cancel an order; true when the cancel was accepted.
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, ExchangeError>;

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderSummary, ExchangeError>;

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderSummary>, ExchangeError>;
}
