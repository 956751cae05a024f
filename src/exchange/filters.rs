// =============================================================================
// Market filters — lot size, price tick, minimum notional
// =============================================================================
//
// Applied before every order placement. Quantities round DOWN to the step
// grid anchored at min_qty; prices round toward zero onto the tick grid.
// A bound reported as 0 by the exchange is treated as unbounded.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::OrderType;

/// Exchange-enforced constraints for one market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolFilters {
    pub min_qty: Decimal,
    pub max_qty: Decimal,
    pub step_size: Decimal,
    pub min_price: Decimal,
    pub max_price: Decimal,
    pub tick_size: Decimal,
    pub min_notional: Decimal,
}

impl SymbolFilters {
    /// Permissive filters for venues (or tests) that report none.
    pub fn unbounded() -> Self {
        Self {
            min_qty: Decimal::ZERO,
            max_qty: Decimal::ZERO,
            step_size: Decimal::ZERO,
            min_price: Decimal::ZERO,
            max_price: Decimal::ZERO,
            tick_size: Decimal::ZERO,
            min_notional: Decimal::ZERO,
        }
    }

    /// Round a quantity down onto the step grid anchored at `min_qty`.
    pub fn round_qty(&self, qty: Decimal) -> Decimal {
        if self.step_size.is_zero() {
            return qty;
        }
        let steps = ((qty - self.min_qty) / self.step_size).floor();
        self.min_qty + steps * self.step_size
    }

    /// Round a price toward zero onto the tick grid.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        if self.tick_size.is_zero() {
            return price;
        }
        (price / self.tick_size).trunc() * self.tick_size
    }

    /// Validate and round an order. Returns the adjusted `(qty, price)`.
    ///
    /// Market orders skip the notional check: the execution price is not
    /// known before the trade.
    pub fn validate_order(
        &self,
        order_type: OrderType,
        qty: Decimal,
        price: Option<Decimal>,
    ) -> Result<(Decimal, Option<Decimal>), ExchangeError> {
        let qty = self.round_qty(qty);

        if qty <= Decimal::ZERO {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity {qty} rounds to nothing at step {}",
                self.step_size
            )));
        }
        if qty < self.min_qty {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity {qty} below market minimum {}",
                self.min_qty
            )));
        }
        if !self.max_qty.is_zero() && qty > self.max_qty {
            return Err(ExchangeError::InvalidOrder(format!(
                "quantity {qty} above market maximum {}",
                self.max_qty
            )));
        }

        let price = match (order_type, price) {
            (OrderType::Market, Some(_)) => {
                return Err(ExchangeError::InvalidOrder(
                    "market orders must not carry a price".into(),
                ))
            }
            (OrderType::Market, None) => None,
            (OrderType::Limit, None) => {
                return Err(ExchangeError::InvalidOrder(
                    "limit orders require a price".into(),
                ))
            }
            (OrderType::Limit, Some(p)) => {
                let p = self.round_price(p);
                if p <= Decimal::ZERO {
                    return Err(ExchangeError::InvalidOrder(format!(
                        "price {p} rounds to nothing at tick {}",
                        self.tick_size
                    )));
                }
                if !self.min_price.is_zero() && p < self.min_price {
                    return Err(ExchangeError::InvalidOrder(format!(
                        "price {p} below market minimum {}",
                        self.min_price
                    )));
                }
                if !self.max_price.is_zero() && p > self.max_price {
                    return Err(ExchangeError::InvalidOrder(format!(
                        "price {p} above market maximum {}",
                        self.max_price
                    )));
                }
                Some(p)
            }
        };

        if let Some(p) = price {
            let notional = p * qty;
            if notional < self.min_notional {
                return Err(ExchangeError::InsufficientNotional(format!(
                    "notional {notional} below market minimum {}",
                    self.min_notional
                )));
            }
        }

        Ok((qty, price))
    }

    /// Parse the `filters` array of a Binance exchangeInfo symbol entry.
    pub fn from_exchange_info(filters: &[serde_json::Value]) -> Self {
        let mut out = Self::unbounded();
        for f in filters {
            match f.get("filterType").and_then(|v| v.as_str()) {
                Some("LOT_SIZE") => {
                    out.min_qty = dec_field(f, "minQty");
                    out.max_qty = dec_field(f, "maxQty");
                    out.step_size = dec_field(f, "stepSize");
                }
                Some("PRICE_FILTER") => {
                    out.min_price = dec_field(f, "minPrice");
                    out.max_price = dec_field(f, "maxPrice");
                    out.tick_size = dec_field(f, "tickSize");
                }
                Some("MIN_NOTIONAL") => {
                    out.min_notional = dec_field(f, "minNotional");
                }
                Some("NOTIONAL") => {
                    out.min_notional = dec_field(f, "minNotional");
                }
                _ => {}
            }
        }
        out
    }
}

fn dec_field(value: &serde_json::Value, key: &str) -> Decimal {
    value
        .get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}
