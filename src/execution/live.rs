// =============================================================================
// Live execution context — exchange-backed with persisted side effects
// =============================================================================
//
// Every placed or cancelled order is written through to persistence so a
// restart can reconcile local intent against exchange truth. In dry-run
// mode nothing reaches the exchange: orders get synthetic ids and are only
// recorded locally.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::persistence::Store;
use crate::types::{Order, OrderSide, OrderStatus, OrderType};

use super::{ExecutionContext, OrderSummary};

/// Prefix for client order ids; the reconciler adopts unknown exchange
/// orders carrying it.
pub const CLIENT_ID_PREFIX: &str = "lattice-";

pub struct LiveExecutionContext {
    exchange: Arc<dyn Exchange>,
    store: Arc<Store>,
    exchange_name: String,
    dry_run: bool,
}

impl LiveExecutionContext {
    pub fn new(exchange: Arc<dyn Exchange>, store: Arc<Store>, dry_run: bool) -> Self {
        let exchange_name = exchange.name().to_string();
        Self {
            exchange,
            store,
            exchange_name,
            dry_run,
        }
    }

    fn new_client_order_id() -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{CLIENT_ID_PREFIX}{}", &suffix[..20])
    }

    fn summary_of(order: &Order) -> OrderSummary {
        OrderSummary {
            id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: order.status,
            price: order.price,
            amount: order.amount,
            filled: order.filled,
            remaining: order.remaining,
            fee: order.fee,
        }
    }

    async fn persist(&self, order: &Order) {
        if let Err(e) = self.store.upsert_order(order, &self.exchange_name, None).await {
            warn!(order_id = %order.id, error = %e, "failed to persist order");
        }
    }
}

#[async_trait]
impl ExecutionContext for LiveExecutionContext {
    fn current_timestamp(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn is_live(&self) -> bool {
        true
    }

    async fn get_current_price(&self, symbol: &str) -> Result<Decimal, ExchangeError> {
        Ok(self.exchange.fetch_ticker(symbol).await?.last)
    }

    async fn get_balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let balances = self.exchange.fetch_balance().await?;
        Ok(balances
            .get(currency)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn get_position(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        let base = match self.exchange.market(symbol) {
            Some(market) => market.base,
            None => symbol.split('/').next().unwrap_or(symbol).to_string(),
        };
        let balances = self.exchange.fetch_balance().await?;
        Ok(balances.get(&base).map(|b| b.total))
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<String, ExchangeError> {
        if self.dry_run {
            let order = Order {
                id: format!("dry-{}", Uuid::new_v4().simple()),
                client_order_id: Some(Self::new_client_order_id()),
                symbol: symbol.to_string(),
                side,
                order_type,
                status: OrderStatus::Open,
                price,
                amount,
                filled: Decimal::ZERO,
                remaining: amount,
                cost: Decimal::ZERO,
                fee: None,
                timestamp: Utc::now(),
            };
            info!(
                order_id = %order.id,
                symbol,
                side = %side,
                amount = %amount,
                "dry-run order recorded (not sent to exchange)"
            );
            self.persist(&order).await;
            return Ok(order.id);
        }

        let order = self
            .exchange
            .create_order(
                symbol,
                order_type,
                side,
                amount,
                price,
                Some(Self::new_client_order_id()),
            )
            .await?;
        info!(
            order_id = %order.id,
            symbol,
            side = %side,
            order_type = %order_type,
            amount = %order.amount,
            price = ?order.price,
            "order placed"
        );
        self.persist(&order).await;
        Ok(order.id)
    }

    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<bool, ExchangeError> {
        if self.dry_run {
            if let Err(e) = self
                .store
                .update_order_status(order_id, OrderStatus::Canceled, Decimal::ZERO, Decimal::ZERO)
                .await
            {
                warn!(order_id, error = %e, "failed to persist dry-run cancel");
            }
            return Ok(true);
        }

        match self.exchange.cancel_order(order_id, symbol).await {
            Ok(order) => {
                self.persist(&order).await;
                Ok(true)
            }
            Err(ExchangeError::OrderNotFound(detail)) => {
                warn!(order_id, detail = %detail, "cancel target no longer on exchange");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn get_order_status(
        &self,
        order_id: &str,
        symbol: &str,
    ) -> Result<OrderSummary, ExchangeError> {
        let order = self.exchange.fetch_order(order_id, symbol).await?;
        self.persist(&order).await;
        Ok(Self::summary_of(&order))
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<OrderSummary>, ExchangeError> {
        let orders = self.exchange.fetch_open_orders(symbol).await?;
        Ok(orders.iter().map(Self::summary_of).collect())
    }
}
