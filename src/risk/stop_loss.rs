// =============================================================================
// Stop-loss handlers — fixed, percentage, trailing and ATR stops
// =============================================================================
//
// One handler per position. Trailing stops only ever move in the position's
// favour: a long stop never descends, a short stop never ascends. Triggering
// is a single terminal transition; later checks keep returning true without
// re-stamping the trigger time.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::types::OrderSide;

/// Stop computation variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StopLossConfig {
    /// Static stop price.
    Fixed { price: Decimal },
    /// Stop at `entry * (1 -/+ pct)` for long/short.
    Percentage { pct: Decimal },
    /// Stop trails the running extreme at `pct` distance. With
    /// `activation_pct` set, trailing arms only once unrealised profit
    /// reaches that threshold; until then the initial percentage stop holds.
    Trailing {
        pct: Decimal,
        activation_pct: Option<Decimal>,
    },
    /// Stop at `extreme -/+ atr * multiplier` for long/short.
    Atr { atr: Decimal, multiplier: Decimal },
}

/// Per-position stop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossHandler {
    config: StopLossConfig,
    side: OrderSide,
    entry_price: Decimal,
    current_stop: Decimal,
    highest_price: Decimal,
    lowest_price: Decimal,
    trailing_active: bool,
    triggered: bool,
    triggered_at: Option<DateTime<Utc>>,
}

impl StopLossHandler {
    /// Create a handler for a position entered at `entry_price`.
    /// `side` is the position side: Buy = long, Sell = short.
    pub fn new(config: StopLossConfig, side: OrderSide, entry_price: Decimal) -> Self {
        let current_stop = match &config {
            StopLossConfig::Fixed { price } => *price,
            StopLossConfig::Percentage { pct } | StopLossConfig::Trailing { pct, .. } => {
                match side {
                    OrderSide::Buy => entry_price * (Decimal::ONE - pct),
                    OrderSide::Sell => entry_price * (Decimal::ONE + pct),
                }
            }
            StopLossConfig::Atr { atr, multiplier } => match side {
                OrderSide::Buy => entry_price - atr * multiplier,
                OrderSide::Sell => entry_price + atr * multiplier,
            },
        };
        let trailing_active = match &config {
            StopLossConfig::Trailing { activation_pct, .. } => activation_pct.is_none(),
            _ => false,
        };

        Self {
            config,
            side,
            entry_price,
            current_stop,
            highest_price: entry_price,
            lowest_price: entry_price,
            trailing_active,
            triggered: false,
            triggered_at: None,
        }
    }

    pub fn current_stop(&self) -> Decimal {
        self.current_stop
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn triggered_at(&self) -> Option<DateTime<Utc>> {
        self.triggered_at
    }

    pub fn trailing_active(&self) -> bool {
        self.trailing_active
    }

    /// Feed a new price: track extremes and ratchet the stop where the
    /// configuration allows.
    pub fn update(&mut self, price: Decimal) {
        if self.triggered {
            return;
        }
        if price > self.highest_price {
            self.highest_price = price;
        }
        if price < self.lowest_price {
            self.lowest_price = price;
        }

        match &self.config {
            StopLossConfig::Fixed { .. } | StopLossConfig::Percentage { .. } => {}
            StopLossConfig::Trailing { pct, activation_pct } => {
                if !self.trailing_active {
                    if let Some(threshold) = activation_pct {
                        let profit_pct = match self.side {
                            OrderSide::Buy => (price - self.entry_price) / self.entry_price,
                            OrderSide::Sell => (self.entry_price - price) / self.entry_price,
                        };
                        if profit_pct >= *threshold {
                            self.trailing_active = true;
                            debug!(stop = %self.current_stop, "trailing stop activated");
                        }
                    }
                }
                if self.trailing_active {
                    match self.side {
                        OrderSide::Buy => {
                            let candidate = self.highest_price * (Decimal::ONE - pct);
                            if candidate > self.current_stop {
                                self.current_stop = candidate;
                            }
                        }
                        OrderSide::Sell => {
                            let candidate = self.lowest_price * (Decimal::ONE + pct);
                            if candidate < self.current_stop {
                                self.current_stop = candidate;
                            }
                        }
                    }
                }
            }
            StopLossConfig::Atr { atr, multiplier } => match self.side {
                OrderSide::Buy => {
                    let candidate = self.highest_price - atr * multiplier;
                    if candidate > self.current_stop {
                        self.current_stop = candidate;
                    }
                }
                OrderSide::Sell => {
                    let candidate = self.lowest_price + atr * multiplier;
                    if candidate < self.current_stop {
                        self.current_stop = candidate;
                    }
                }
            },
        }
    }

    /// Check whether the stop is hit at `price`. Long positions trigger at
    /// `price <= stop`; shorts at `price >= stop`.
    pub fn check_stop(&mut self, price: Decimal) -> bool {
        if self.triggered {
            return true;
        }
        let hit = match self.side {
            OrderSide::Buy => price <= self.current_stop,
            OrderSide::Sell => price >= self.current_stop,
        };
        if hit {
            self.triggered = true;
            self.triggered_at = Some(Utc::now());
            info!(
                side = %self.side,
                stop = %self.current_stop,
                price = %price,
                "stop-loss triggered"
            );
        }
        hit
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Tracks stops for every open position id.
#[derive(Debug, Default)]
pub struct StopLossManager {
    handlers: HashMap<String, StopLossHandler>,
}

impl StopLossManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, position_id: impl Into<String>, handler: StopLossHandler) {
        self.handlers.insert(position_id.into(), handler);
    }

    pub fn remove(&mut self, position_id: &str) -> Option<StopLossHandler> {
        self.handlers.remove(position_id)
    }

    pub fn get(&self, position_id: &str) -> Option<&StopLossHandler> {
        self.handlers.get(position_id)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Update every handler with its position's latest price and return the
    /// ids whose stops triggered on this pass.
    pub fn scan(&mut self, prices: &HashMap<String, Decimal>) -> Vec<String> {
        let mut triggered = Vec::new();
        for (position_id, handler) in self.handlers.iter_mut() {
            let Some(price) = prices.get(position_id) else {
                continue;
            };
            if handler.is_triggered() {
                continue;
            }
            handler.update(*price);
            if handler.check_stop(*price) {
                triggered.push(position_id.clone());
            }
        }
        triggered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn percentage_stop_for_both_sides() {
        let long = StopLossHandler::new(
            StopLossConfig::Percentage { pct: dec!(0.05) },
            OrderSide::Buy,
            dec!(100),
        );
        assert_eq!(long.current_stop(), dec!(95.00));

        let short = StopLossHandler::new(
            StopLossConfig::Percentage { pct: dec!(0.05) },
            OrderSide::Sell,
            dec!(100),
        );
        assert_eq!(short.current_stop(), dec!(105.00));
    }

    #[test]
    fn trailing_stop_follows_reference_sequence() {
        // Long at 100, trailing 5%. Prices 110, 105, 115, 108.
        let mut stop = StopLossHandler::new(
            StopLossConfig::Trailing { pct: dec!(0.05), activation_pct: None },
            OrderSide::Buy,
            dec!(100),
        );

        stop.update(dec!(110));
        assert_eq!(stop.current_stop(), dec!(104.50));
        assert!(!stop.check_stop(dec!(110)));

        stop.update(dec!(105));
        assert_eq!(stop.current_stop(), dec!(104.50));
        assert!(!stop.check_stop(dec!(105)));

        stop.update(dec!(115));
        assert_eq!(stop.current_stop(), dec!(109.25));
        assert!(!stop.check_stop(dec!(115)));

        stop.update(dec!(108));
        assert_eq!(stop.current_stop(), dec!(109.25));
        // 108 <= 109.25 -> triggered.
        assert!(stop.check_stop(dec!(108)));
        assert!(stop.is_triggered());
    }

    #[test]
    fn trailing_stop_is_monotonic_long_and_short() {
        let mut long = StopLossHandler::new(
            StopLossConfig::Trailing { pct: dec!(0.02), activation_pct: None },
            OrderSide::Buy,
            dec!(100),
        );
        let mut prev = long.current_stop();
        for price in [dec!(101), dec!(99), dec!(104), dec!(102), dec!(110), dec!(108)] {
            long.update(price);
            assert!(long.current_stop() >= prev);
            prev = long.current_stop();
        }

        let mut short = StopLossHandler::new(
            StopLossConfig::Trailing { pct: dec!(0.02), activation_pct: None },
            OrderSide::Sell,
            dec!(100),
        );
        let mut prev = short.current_stop();
        for price in [dec!(99), dec!(101), dec!(96), dec!(98), dec!(90), dec!(92)] {
            short.update(price);
            assert!(short.current_stop() <= prev);
            prev = short.current_stop();
        }
    }

    #[test]
    fn trailing_activation_defers_ratcheting() {
        let mut stop = StopLossHandler::new(
            StopLossConfig::Trailing {
                pct: dec!(0.05),
                activation_pct: Some(dec!(0.03)),
            },
            OrderSide::Buy,
            dec!(100),
        );
        assert!(!stop.trailing_active());

        // +2% profit: still the initial stop.
        stop.update(dec!(102));
        assert_eq!(stop.current_stop(), dec!(95.00));

        // +4% profit arms trailing and ratchets to 104 * 0.95.
        stop.update(dec!(104));
        assert!(stop.trailing_active());
        assert_eq!(stop.current_stop(), dec!(98.80));
    }

    #[test]
    fn atr_stop_ratchets_with_new_highs() {
        let mut stop = StopLossHandler::new(
            StopLossConfig::Atr { atr: dec!(2), multiplier: dec!(1.5) },
            OrderSide::Buy,
            dec!(100),
        );
        assert_eq!(stop.current_stop(), dec!(97.0));

        stop.update(dec!(106));
        assert_eq!(stop.current_stop(), dec!(103.0));

        // A pullback never lowers the stop.
        stop.update(dec!(101));
        assert_eq!(stop.current_stop(), dec!(103.0));
    }

    #[test]
    fn triggering_is_idempotent() {
        let mut stop = StopLossHandler::new(
            StopLossConfig::Fixed { price: dec!(95) },
            OrderSide::Buy,
            dec!(100),
        );
        assert!(stop.check_stop(dec!(94)));
        let first = stop.triggered_at().unwrap();
        assert!(stop.check_stop(dec!(99)));
        assert_eq!(stop.triggered_at().unwrap(), first);
    }

    #[test]
    fn manager_scan_returns_triggered_ids() {
        let mut manager = StopLossManager::new();
        manager.register(
            "pos-1",
            StopLossHandler::new(
                StopLossConfig::Percentage { pct: dec!(0.05) },
                OrderSide::Buy,
                dec!(100),
            ),
        );
        manager.register(
            "pos-2",
            StopLossHandler::new(
                StopLossConfig::Percentage { pct: dec!(0.05) },
                OrderSide::Buy,
                dec!(200),
            ),
        );

        let mut prices = HashMap::new();
        prices.insert("pos-1".to_string(), dec!(94));
        prices.insert("pos-2".to_string(), dec!(199));

        let triggered = manager.scan(&prices);
        assert_eq!(triggered, vec!["pos-1".to_string()]);

        // Already-triggered stops are not reported again.
        assert!(manager.scan(&prices).is_empty());
    }
}
