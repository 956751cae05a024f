// =============================================================================
// Risk manager — central pre-trade validator and post-trade recorder
// =============================================================================
//
// One façade orchestrating the position sizer, stop-loss manager, circuit
// breaker and drawdown tracker. Mutations of the drawdown tracker and stop
// registry are serialised under the manager's critical section; within one
// `record_trade_result` call the drawdown update happens before the breaker
// update and the pair is atomic from an observer's viewpoint.
// =============================================================================

pub mod circuit_breaker;
pub mod drawdown;
pub mod position_sizer;
pub mod stop_loss;

use std::collections::HashMap;

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::OrderSide;

use self::circuit_breaker::{BreakerTrigger, CircuitBreaker, CircuitBreakerConfig};
use self::drawdown::{DrawdownStats, DrawdownTracker};
use self::position_sizer::{FixedFractionalSizer, PositionSize, SizerError};
use self::stop_loss::{StopLossConfig, StopLossHandler, StopLossManager};

/// Fraction of the balance kept free when down-adjusting oversized orders.
const BALANCE_HEADROOM: Decimal = Decimal::from_parts(95, 0, 0, false, 2); // 0.95

/// Stop style for `register_stop_loss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Percentage,
    Trailing,
}

/// Risk configuration shared by the manager and its presets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Balance fraction risked per trade (fixed-fractional input).
    pub risk_pct: Decimal,
    /// Default stop distance when the caller provides none.
    pub default_stop_loss_pct: Decimal,
    /// Soft cap: position value as a fraction of balance (warning only).
    pub max_position_pct: Decimal,
    /// Hard cap: reject trades above this portfolio drawdown.
    pub max_drawdown_limit: Decimal,
    pub breaker: CircuitBreakerConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            risk_pct: Decimal::new(2, 2),              // 0.02
            default_stop_loss_pct: Decimal::new(5, 2), // 0.05
            max_position_pct: Decimal::new(20, 2),     // 0.20
            max_drawdown_limit: Decimal::new(15, 2),   // 0.15
            breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Decision returned by `validate_trade`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeValidation {
    pub allowed: bool,
    pub reason: Option<String>,
    pub position_size: Option<PositionSize>,
    pub stop_price: Option<Decimal>,
    pub warnings: Vec<String>,
}

impl TradeValidation {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            position_size: None,
            stop_price: None,
            warnings: Vec::new(),
        }
    }
}

/// Central risk façade.
pub struct RiskManager {
    config: RiskConfig,
    sizer: FixedFractionalSizer,
    breaker: CircuitBreaker,
    state: Mutex<ManagedState>,
}

struct ManagedState {
    drawdown: DrawdownTracker,
    stops: StopLossManager,
}

impl RiskManager {
    pub fn new(config: RiskConfig, initial_equity: Decimal) -> Result<Self, SizerError> {
        let sizer = FixedFractionalSizer::new(config.risk_pct)?;
        let breaker = CircuitBreaker::new(config.breaker.clone(), initial_equity);
        Ok(Self {
            config,
            sizer,
            breaker,
            state: Mutex::new(ManagedState {
                drawdown: DrawdownTracker::new(initial_equity),
                stops: StopLossManager::new(),
            }),
        })
    }

    // -------------------------------------------------------------------------
    // Presets
    // -------------------------------------------------------------------------

    pub fn conservative(initial_equity: Decimal) -> Self {
        let config = RiskConfig {
            risk_pct: Decimal::new(1, 2),
            default_stop_loss_pct: Decimal::new(3, 2),
            max_position_pct: Decimal::new(15, 2),
            max_drawdown_limit: Decimal::new(10, 2),
            breaker: CircuitBreakerConfig {
                max_daily_loss_pct: Decimal::new(3, 2),
                max_consecutive_losses: 3,
                max_drawdown_pct: Decimal::new(10, 2),
                ..Default::default()
            },
        };
        Self::new(config, initial_equity).expect("preset config is valid")
    }

    pub fn moderate(initial_equity: Decimal) -> Self {
        Self::new(RiskConfig::default(), initial_equity).expect("preset config is valid")
    }

    pub fn aggressive(initial_equity: Decimal) -> Self {
        let config = RiskConfig {
            risk_pct: Decimal::new(4, 2),
            default_stop_loss_pct: Decimal::new(8, 2),
            max_position_pct: Decimal::new(30, 2),
            max_drawdown_limit: Decimal::new(25, 2),
            breaker: CircuitBreakerConfig {
                max_daily_loss_pct: Decimal::new(8, 2),
                max_consecutive_losses: 8,
                max_drawdown_pct: Decimal::new(25, 2),
                ..Default::default()
            },
        };
        Self::new(config, initial_equity).expect("preset config is valid")
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    // -------------------------------------------------------------------------
    // Pre-trade validation
    // -------------------------------------------------------------------------

    /// Validate a prospective entry and size it.
    pub fn validate_trade(
        &self,
        symbol: &str,
        side: OrderSide,
        entry_price: Decimal,
        balance: Decimal,
        stop_loss_pct: Option<Decimal>,
    ) -> TradeValidation {
        // 1. Circuit breaker gate.
        if !self.breaker.is_trading_allowed() {
            let state = self.breaker.state();
            let reason = match state.trigger {
                Some(trigger) => format!("circuit breaker tripped ({trigger})"),
                None => "circuit breaker tripped".to_string(),
            };
            warn!(symbol, reason = %reason, "trade rejected");
            return TradeValidation::rejected(reason);
        }

        // 2. Portfolio drawdown gate.
        let current_dd = self.state.lock().drawdown.current_drawdown_pct();
        if current_dd >= self.config.max_drawdown_limit {
            let reason = format!(
                "drawdown {current_dd} at or above limit {}",
                self.config.max_drawdown_limit
            );
            warn!(symbol, reason = %reason, "trade rejected");
            return TradeValidation::rejected(reason);
        }

        // 3. Stop price from the percentage distance.
        let pct = stop_loss_pct.unwrap_or(self.config.default_stop_loss_pct);
        let stop_price = match side {
            OrderSide::Buy => entry_price * (Decimal::ONE - pct),
            OrderSide::Sell => entry_price * (Decimal::ONE + pct),
        };

        // 4. Position size.
        let mut size = match self.sizer.size(balance, entry_price, stop_price) {
            Ok(size) => size,
            Err(e) => return TradeValidation::rejected(e.to_string()),
        };

        let mut warnings = Vec::new();

        // 5. Soft position cap.
        let max_value = balance * self.config.max_position_pct;
        if size.position_value > max_value {
            warnings.push(format!(
                "position value {} exceeds {} of balance",
                size.position_value, self.config.max_position_pct
            ));
        }

        // 6. Affordability: shrink to 95% of balance if needed.
        if size.position_value > balance && entry_price > Decimal::ZERO {
            let adjusted = BALANCE_HEADROOM * balance / entry_price;
            warnings.push(format!(
                "position down-adjusted from {} to {} for available balance",
                size.amount, adjusted
            ));
            size.amount = adjusted;
            size.position_value = adjusted * entry_price;
            size.risk_amount = size.amount * (entry_price - stop_price).abs();
        }

        debug!(
            symbol,
            side = %side,
            amount = %size.amount,
            stop = %stop_price,
            warnings = warnings.len(),
            "trade validated"
        );

        TradeValidation {
            allowed: true,
            reason: None,
            position_size: Some(size),
            stop_price: Some(stop_price),
            warnings,
        }
    }

    // -------------------------------------------------------------------------
    // Post-trade recording
    // -------------------------------------------------------------------------

    /// Record a realised trade result: drawdown first, then the breaker.
    /// Returns a trigger if this result tripped the breaker.
    pub fn record_trade_result(
        &self,
        symbol: &str,
        pnl: Decimal,
        equity: Decimal,
    ) -> Option<BreakerTrigger> {
        let mut state = self.state.lock();
        state.drawdown.update(equity, chrono::Utc::now());
        let trigger = self.breaker.record_trade(pnl, equity);
        if let Some(trigger) = trigger {
            warn!(symbol, trigger = %trigger, pnl = %pnl, "trade result tripped circuit breaker");
        }
        trigger
    }

    /// Record an operational error against the breaker's error budget.
    pub fn record_error(&self) -> Option<BreakerTrigger> {
        self.breaker.record_error()
    }

    /// Feed a periodic equity observation into the drawdown tracker without
    /// recording a trade.
    pub fn update_equity(&self, equity: Decimal) {
        self.state.lock().drawdown.update(equity, chrono::Utc::now());
    }

    pub fn drawdown_stats(&self) -> DrawdownStats {
        self.state.lock().drawdown.stats()
    }

    // -------------------------------------------------------------------------
    // Stop-loss registry
    // -------------------------------------------------------------------------

    /// Create and track a stop for a position.
    pub fn register_stop_loss(
        &self,
        position_id: &str,
        side: OrderSide,
        entry_price: Decimal,
        pct: Option<Decimal>,
        kind: Option<StopKind>,
    ) {
        let pct = pct.unwrap_or(self.config.default_stop_loss_pct);
        let config = match kind.unwrap_or(StopKind::Percentage) {
            StopKind::Percentage => StopLossConfig::Percentage { pct },
            StopKind::Trailing => StopLossConfig::Trailing { pct, activation_pct: None },
        };
        let handler = StopLossHandler::new(config, side, entry_price);
        self.state.lock().stops.register(position_id, handler);
    }

    pub fn remove_stop_loss(&self, position_id: &str) {
        self.state.lock().stops.remove(position_id);
    }

    pub fn stop_count(&self) -> usize {
        self.state.lock().stops.len()
    }

    /// Scan all registered stops against the latest prices; returns the
    /// position ids that triggered. Execution (opposite-side market order)
    /// belongs to the caller holding the execution context.
    pub fn check_stop_losses(&self, prices: &HashMap<String, Decimal>) -> Vec<String> {
        self.state.lock().stops.scan(prices)
    }
}
