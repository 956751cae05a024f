// =============================================================================
// Shared types used across the Lattice trading engine
// =============================================================================
//
// Every money field (price, amount, cost, fee, equity) is a `rust_decimal`
// Decimal. Binary floating point never appears in a money path; serde
// serialises decimals as strings so persistence and snapshots keep full
// precision.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Order enums
// ---------------------------------------------------------------------------

/// Side of an order or fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// The side that closes a position opened on this side.
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Upper-case form used on the exchange wire ("BUY" / "SELL").
    pub fn as_exchange(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(format!("unknown order side: '{other}'")),
        }
    }
}

/// Order type. Market orders carry no price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_exchange(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "market" => Ok(Self::Market),
            "limit" => Ok(Self::Limit),
            other => Err(format!("unknown order type: '{other}'")),
        }
    }
}

/// Exchange-side order status. Closed, canceled and expired are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Open,
    Closed,
    Canceled,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Open)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
            Self::Canceled => write!(f, "canceled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" | "new" | "partially_filled" => Ok(Self::Open),
            "closed" | "filled" => Ok(Self::Closed),
            "canceled" | "cancelled" | "pending_cancel" | "rejected" => Ok(Self::Canceled),
            "expired" | "expired_in_match" => Ok(Self::Expired),
            other => Err(format!("unknown order status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Market data
// ---------------------------------------------------------------------------

/// Immutable ticker snapshot from the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Immutable OHLCV candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Balance for a single currency; `total = free + used`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn new(currency: impl Into<String>, free: Decimal, used: Decimal) -> Self {
        Self {
            currency: currency.into(),
            free,
            used,
            total: free + used,
        }
    }
}

/// Append-only balance snapshot row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub timestamp: DateTime<Utc>,
    pub exchange: String,
    pub currency: String,
    pub total: Decimal,
    pub free: Decimal,
    pub used: Decimal,
}

// ---------------------------------------------------------------------------
// Orders & fills
// ---------------------------------------------------------------------------

/// An order as the exchange reports it. The exchange order `id` is
/// authoritative; `client_order_id` is ours when we set one.
///
/// Invariants: `filled + remaining = amount`; `status == Closed` implies
/// `filled == amount`; terminal statuses never transition again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// None for market orders.
    pub price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub cost: Decimal,
    pub fee: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

impl Order {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// True when the quantity bookkeeping holds together.
    pub fn is_consistent(&self) -> bool {
        if self.filled + self.remaining != self.amount {
            return false;
        }
        if self.status == OrderStatus::Closed {
            return self.filled == self.amount && self.remaining.is_zero();
        }
        true
    }
}

/// A single execution (exchange trade) against one of our orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub id: String,
    pub order_id: Option<String>,
    pub symbol: String,
    pub side: OrderSide,
    pub amount: Decimal,
    pub price: Decimal,
    pub cost: Decimal,
    pub fee: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Trade cycles
// ---------------------------------------------------------------------------

/// A domain-level round trip: one entry plus its eventual exit, aggregating
/// one or more exchange fills. Distinct from an exchange fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeCycle {
    /// Database id; None until persisted.
    pub id: Option<i64>,
    pub exchange: String,
    pub symbol: String,
    pub strategy: String,
    pub is_open: bool,
    /// Entry side.
    pub side: OrderSide,
    pub open_rate: Decimal,
    pub amount: Decimal,
    pub open_date: DateTime<Utc>,
    pub close_rate: Option<Decimal>,
    pub close_date: Option<DateTime<Utc>>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub profit: Option<Decimal>,
    pub profit_pct: Option<Decimal>,
    pub fee: Option<Decimal>,
}

impl TradeCycle {
    /// Open a new cycle for a strategy entry fill.
    pub fn open(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        side: OrderSide,
        open_rate: Decimal,
        amount: Decimal,
        open_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            exchange: exchange.into(),
            symbol: symbol.into(),
            strategy: strategy.into(),
            is_open: true,
            side,
            open_rate,
            amount,
            open_date,
            close_rate: None,
            close_date: None,
            stop_loss: None,
            take_profit: None,
            profit: None,
            profit_pct: None,
            fee: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Equity
// ---------------------------------------------------------------------------

/// One point on the equity curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: Decimal,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_order(status: OrderStatus, filled: Decimal, remaining: Decimal) -> Order {
        Order {
            id: "1".into(),
            client_order_id: None,
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            order_type: OrderType::Limit,
            status,
            price: Some(dec!(40000)),
            amount: filled + remaining,
            filled,
            remaining,
            cost: filled * dec!(40000),
            fee: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn closed_order_is_fully_filled() {
        let order = sample_order(OrderStatus::Closed, dec!(0.5), dec!(0));
        assert!(order.is_consistent());
        assert!(order.is_terminal());
    }

    #[test]
    fn closed_order_with_remainder_is_inconsistent() {
        let mut order = sample_order(OrderStatus::Closed, dec!(0.3), dec!(0));
        order.remaining = dec!(0.2);
        order.amount = dec!(0.5);
        assert!(!order.is_consistent());
    }

    #[test]
    fn side_round_trips_and_flips() {
        assert_eq!("buy".parse::<OrderSide>().unwrap(), OrderSide::Buy);
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.as_exchange(), "SELL");
    }

    #[test]
    fn status_parses_exchange_aliases() {
        assert_eq!("FILLED".parse::<OrderStatus>().unwrap(), OrderStatus::Closed);
        assert_eq!("NEW".parse::<OrderStatus>().unwrap(), OrderStatus::Open);
        assert_eq!(
            "PARTIALLY_FILLED".parse::<OrderStatus>().unwrap(),
            OrderStatus::Open
        );
        assert!(OrderStatus::Canceled.is_terminal());
    }

    #[test]
    fn balance_total_is_free_plus_used() {
        let b = Balance::new("USDT", dec!(1000), dec!(250));
        assert_eq!(b.total, dec!(1250));
    }
}
