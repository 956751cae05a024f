// =============================================================================
// Exchange abstraction — uniform capability set over concrete adapters
// =============================================================================
//
// Strategies and execution contexts talk to `dyn Exchange` only. Adapters
// translate raw failures into the classified taxonomy and are safe for
// concurrent reads; order writes are serialised per symbol at the caller
// layer where a venue requires it.
// =============================================================================

pub mod binance;
pub mod filters;
pub mod rate_limit;
pub mod websocket;

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::ExchangeError;
use crate::types::{Balance, Candle, Fill, Order, OrderSide, OrderType, Ticker};

use self::filters::SymbolFilters;

/// Per-market metadata loaded from the exchange on connect.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    /// Unified symbol, e.g. "BTC/USDT".
    pub symbol: String,
    pub base: String,
    pub quote: String,
    pub filters: SymbolFilters,
}

impl MarketInfo {
    /// Price rounded to the market tick (toward zero).
    pub fn round_price(&self, price: Decimal) -> Decimal {
        self.filters.round_price(price)
    }

    /// Quantity rounded down to the market step.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        self.filters.round_qty(qty)
    }
}

/// Uniform exchange capability set. All operations may fail with a
/// classified [`ExchangeError`].
#[async_trait]
pub trait Exchange: Send + Sync {
    fn name(&self) -> &str;

    /// Load market metadata and synchronise the clock. Must be called
    /// before any other operation.
    async fn connect(&self) -> Result<(), ExchangeError>;

    /// Release connections. Idempotent.
    async fn disconnect(&self) -> Result<(), ExchangeError>;

    /// Metadata for a unified symbol, if the market exists.
    fn market(&self, symbol: &str) -> Option<MarketInfo>;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;

    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError>;

    /// Validate, round and place an order. Market orders must pass
    /// `price = None`. `client_order_id` lets callers tag orders for
    /// later reconciliation.
    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        client_order_id: Option<String>,
    ) -> Result<Order, ExchangeError>;

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError>;

    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError>;

    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError>;

    /// Candles, newest last.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Our own recent fills, most recent first.
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> Result<Vec<Fill>, ExchangeError>;
}
