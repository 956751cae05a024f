// =============================================================================
// Strategy protocol — lifecycle contract for pluggable strategies
// =============================================================================
//
// A strategy is pinned to one task; all callbacks run serialised on it.
// The execution context is handed over at construction (and again on
// restore), so `initialize` only has to compute state and place startup
// orders. Snapshots must be JSON-equivalent with decimals as strings;
// restoring from a snapshot is a constructor on the concrete type, which
// keeps this trait object-safe.
// =============================================================================

pub mod grid;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Order, OrderSide, Ticker};

/// Domain events a strategy emits for the orchestrator to persist and feed
/// into risk accounting. Orders themselves are persisted by the execution
/// context; these cover the cycle bookkeeping layered on top.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StrategyEvent {
    /// An entry fill opened a new trade cycle.
    CycleOpened {
        symbol: String,
        side: OrderSide,
        open_rate: Decimal,
        amount: Decimal,
        open_date: DateTime<Utc>,
    },
    /// An exit fill closed (part of) the oldest open cycle(s).
    CycleClosed {
        symbol: String,
        /// Open time of the earliest cycle consumed by this exit.
        open_date: DateTime<Utc>,
        close_rate: Decimal,
        close_date: DateTime<Utc>,
        amount: Decimal,
        profit: Decimal,
        profit_pct: Decimal,
        fee: Decimal,
    },
    /// The strategy-level stop fired and the ladder was halted.
    StopLossTriggered { symbol: String, price: Decimal },
}

/// Sender half used by strategies to surface [`StrategyEvent`]s.
pub type StrategyEventTx = tokio::sync::mpsc::UnboundedSender<StrategyEvent>;

/// Lifecycle every strategy must provide.
#[async_trait]
pub trait Strategy: Send {
    /// Unique strategy instance name (snapshot key).
    fn name(&self) -> &str;

    /// The symbol this strategy trades.
    fn symbol(&self) -> &str;

    /// One-shot setup; may place startup orders.
    async fn initialize(&mut self) -> anyhow::Result<()>;

    /// Price update for `symbol`.
    async fn on_tick(&mut self, ticker: &Ticker) -> anyhow::Result<()>;

    /// Terminal fill of a strategy-owned order.
    async fn on_order_filled(&mut self, order: &Order) -> anyhow::Result<()>;

    /// Terminal cancel of a strategy-owned order.
    async fn on_order_cancelled(&mut self, order: &Order) -> anyhow::Result<()>;

    /// Serialisable snapshot (decimals as strings).
    fn get_state(&self) -> serde_json::Value;

    /// Cancel own orders (if configured) and release resources.
    async fn shutdown(&mut self) -> anyhow::Result<()>;
}
