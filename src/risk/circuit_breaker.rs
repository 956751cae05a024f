// =============================================================================
// Circuit breaker — multi-trigger trading pause with cooldown
// =============================================================================
//
// Trigger order on each recorded trade: daily loss, consecutive losses, max
// drawdown. Error-rate trips fire from `record_error`. Once tripped, trading
// stays blocked until the cooldown elapses, at which point the breaker
// auto-resets (clearing the trigger and loss streak while keeping equity and
// daily counters). Daily counters reset at the first event after UTC
// midnight when `auto_reset_daily` is set.
//
// All state mutations are serialised behind one lock; `is_trading_allowed`
// may race a trip, in which case the next check returns false.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What tripped the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerTrigger {
    DailyLoss,
    ConsecutiveLosses,
    MaxDrawdown,
    ErrorRate,
    Manual,
}

impl std::fmt::Display for BreakerTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DailyLoss => write!(f, "daily_loss"),
            Self::ConsecutiveLosses => write!(f, "consecutive_losses"),
            Self::MaxDrawdown => write!(f, "max_drawdown"),
            Self::ErrorRate => write!(f, "error_rate"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// Breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Daily loss as a fraction of peak equity (e.g. 0.05).
    pub max_daily_loss_pct: Decimal,
    pub max_consecutive_losses: u32,
    /// Drawdown from peak equity (e.g. 0.15).
    pub max_drawdown_pct: Decimal,
    /// Errors per trade before tripping (e.g. 0.5).
    pub max_error_rate: Decimal,
    pub cooldown_minutes: i64,
    pub auto_reset_daily: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: Decimal::new(5, 2),
            max_consecutive_losses: 5,
            max_drawdown_pct: Decimal::new(15, 2),
            max_error_rate: Decimal::new(5, 1),
            cooldown_minutes: 60,
            auto_reset_daily: true,
        }
    }
}

/// Serialisable view of the breaker for dashboards and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub is_tripped: bool,
    pub trigger: Option<BreakerTrigger>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub day_start: DateTime<Utc>,
    pub daily_pnl: Decimal,
    pub daily_trades: u32,
    pub daily_errors: u32,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown: Decimal,
}

struct Inner {
    is_tripped: bool,
    trigger: Option<BreakerTrigger>,
    tripped_at: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    day_start: DateTime<Utc>,
    daily_pnl: Decimal,
    daily_trades: u32,
    daily_errors: u32,
    consecutive_losses: u32,
    consecutive_wins: u32,
    peak_equity: Decimal,
    current_equity: Decimal,
}

impl Inner {
    fn current_drawdown(&self) -> Decimal {
        if self.peak_equity > Decimal::ZERO {
            (self.peak_equity - self.current_equity) / self.peak_equity
        } else {
            Decimal::ZERO
        }
    }
}

/// Multi-condition circuit breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: RwLock<Inner>,
}

fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc()
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, initial_equity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            config,
            inner: RwLock::new(Inner {
                is_tripped: false,
                trigger: None,
                tripped_at: None,
                cooldown_until: None,
                day_start: utc_midnight(now),
                daily_pnl: Decimal::ZERO,
                daily_trades: 0,
                daily_errors: 0,
                consecutive_losses: 0,
                consecutive_wins: 0,
                peak_equity: initial_equity,
                current_equity: initial_equity,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Recording
    // -------------------------------------------------------------------------

    /// Record a completed trade's P&L and post-trade equity. Returns the
    /// trigger when this trade trips the breaker.
    pub fn record_trade(&self, pnl: Decimal, equity: Decimal) -> Option<BreakerTrigger> {
        self.record_trade_at(pnl, equity, Utc::now())
    }

    pub(crate) fn record_trade_at(
        &self,
        pnl: Decimal,
        equity: Decimal,
        now: DateTime<Utc>,
    ) -> Option<BreakerTrigger> {
        let mut s = self.inner.write();
        Self::maybe_reset_daily(&self.config, &mut s, now);

        s.daily_pnl += pnl;
        s.daily_trades += 1;
        if pnl < Decimal::ZERO {
            s.consecutive_losses += 1;
            s.consecutive_wins = 0;
        } else {
            s.consecutive_wins += 1;
            s.consecutive_losses = 0;
        }

        s.current_equity = equity;
        if equity > s.peak_equity {
            s.peak_equity = equity;
        }

        if s.is_tripped {
            return None;
        }

        // 1. Daily loss.
        if s.daily_pnl < Decimal::ZERO && s.peak_equity > Decimal::ZERO {
            let loss_pct = s.daily_pnl.abs() / s.peak_equity;
            if loss_pct >= self.config.max_daily_loss_pct {
                return Some(Self::trip(&self.config, &mut s, BreakerTrigger::DailyLoss, now));
            }
        }

        // 2. Consecutive losses.
        if s.consecutive_losses >= self.config.max_consecutive_losses {
            return Some(Self::trip(
                &self.config,
                &mut s,
                BreakerTrigger::ConsecutiveLosses,
                now,
            ));
        }

        // 3. Drawdown.
        if s.current_drawdown() >= self.config.max_drawdown_pct {
            return Some(Self::trip(&self.config, &mut s, BreakerTrigger::MaxDrawdown, now));
        }

        None
    }

    /// Record an operational error; trips on excessive error rate.
    pub fn record_error(&self) -> Option<BreakerTrigger> {
        self.record_error_at(Utc::now())
    }

    pub(crate) fn record_error_at(&self, now: DateTime<Utc>) -> Option<BreakerTrigger> {
        let mut s = self.inner.write();
        Self::maybe_reset_daily(&self.config, &mut s, now);

        s.daily_errors += 1;
        if s.is_tripped || s.daily_trades == 0 {
            return None;
        }
        let rate = Decimal::from(s.daily_errors) / Decimal::from(s.daily_trades);
        if rate >= self.config.max_error_rate {
            return Some(Self::trip(&self.config, &mut s, BreakerTrigger::ErrorRate, now));
        }
        None
    }

    /// Trip by operator action.
    pub fn trip_manual(&self) -> BreakerTrigger {
        let mut s = self.inner.write();
        Self::trip(&self.config, &mut s, BreakerTrigger::Manual, Utc::now())
    }

    fn trip(
        config: &CircuitBreakerConfig,
        s: &mut Inner,
        trigger: BreakerTrigger,
        now: DateTime<Utc>,
    ) -> BreakerTrigger {
        s.is_tripped = true;
        s.trigger = Some(trigger);
        s.tripped_at = Some(now);
        s.cooldown_until = Some(now + Duration::minutes(config.cooldown_minutes));
        warn!(
            trigger = %trigger,
            cooldown_minutes = config.cooldown_minutes,
            daily_pnl = %s.daily_pnl,
            consecutive_losses = s.consecutive_losses,
            drawdown = %s.current_drawdown(),
            "circuit breaker TRIPPED"
        );
        trigger
    }

    // -------------------------------------------------------------------------
    // Gate
    // -------------------------------------------------------------------------

    /// Whether trading is allowed right now. A tripped breaker auto-resets
    /// once the cooldown has elapsed.
    pub fn is_trading_allowed(&self) -> bool {
        self.is_trading_allowed_at(Utc::now())
    }

    pub(crate) fn is_trading_allowed_at(&self, now: DateTime<Utc>) -> bool {
        {
            let s = self.inner.read();
            if !s.is_tripped {
                return true;
            }
            if let Some(until) = s.cooldown_until {
                if now < until {
                    return false;
                }
            }
        }
        // Cooldown elapsed: auto-reset keeps equity and daily counters but
        // clears the triggered state and the loss streak.
        let mut s = self.inner.write();
        if s.is_tripped && s.cooldown_until.map_or(true, |until| now >= until) {
            s.is_tripped = false;
            s.trigger = None;
            s.tripped_at = None;
            s.cooldown_until = None;
            s.consecutive_losses = 0;
            info!("circuit breaker auto-reset after cooldown");
        }
        !s.is_tripped
    }

    /// Operator reset that bypasses the cooldown. Callers must audit this.
    pub fn reset_manual(&self) {
        let mut s = self.inner.write();
        s.is_tripped = false;
        s.trigger = None;
        s.tripped_at = None;
        s.cooldown_until = None;
        s.consecutive_losses = 0;
        warn!("circuit breaker manually reset");
    }

    // -------------------------------------------------------------------------
    // Snapshot & daily reset
    // -------------------------------------------------------------------------

    pub fn state(&self) -> CircuitBreakerState {
        let s = self.inner.read();
        CircuitBreakerState {
            is_tripped: s.is_tripped,
            trigger: s.trigger,
            tripped_at: s.tripped_at,
            cooldown_until: s.cooldown_until,
            day_start: s.day_start,
            daily_pnl: s.daily_pnl,
            daily_trades: s.daily_trades,
            daily_errors: s.daily_errors,
            consecutive_losses: s.consecutive_losses,
            consecutive_wins: s.consecutive_wins,
            peak_equity: s.peak_equity,
            current_equity: s.current_equity,
            current_drawdown: s.current_drawdown(),
        }
    }

    fn maybe_reset_daily(config: &CircuitBreakerConfig, s: &mut Inner, now: DateTime<Utc>) {
        if !config.auto_reset_daily {
            return;
        }
        let today = utc_midnight(now);
        if today > s.day_start {
            info!(
                old_day = %s.day_start,
                new_day = %today,
                "UTC day rolled; daily breaker counters reset"
            );
            s.day_start = today;
            s.daily_pnl = Decimal::ZERO;
            s.daily_trades = 0;
            s.daily_errors = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn breaker(config: CircuitBreakerConfig) -> CircuitBreaker {
        CircuitBreaker::new(config, dec!(10000))
    }

    #[test]
    fn daily_loss_trips_at_threshold() {
        // Mirrors the reference scenario: 5% daily loss cap, equity 10000.
        let cb = breaker(CircuitBreakerConfig {
            max_daily_loss_pct: dec!(0.05),
            cooldown_minutes: 30,
            ..Default::default()
        });
        let now = Utc::now();

        assert!(cb.record_trade_at(dec!(-400), dec!(9600), now).is_none());
        assert!(cb.is_trading_allowed_at(now));

        let trigger = cb.record_trade_at(dec!(-200), dec!(9400), now);
        assert_eq!(trigger, Some(BreakerTrigger::DailyLoss));
        assert!(!cb.is_trading_allowed_at(now));

        let state = cb.state();
        assert!(state.is_tripped);
        assert_eq!(state.cooldown_until, Some(now + Duration::minutes(30)));
    }

    #[test]
    fn consecutive_losses_trip() {
        let cb = breaker(CircuitBreakerConfig {
            max_daily_loss_pct: dec!(0.9),
            max_consecutive_losses: 3,
            max_drawdown_pct: dec!(0.9),
            ..Default::default()
        });
        let now = Utc::now();

        assert!(cb.record_trade_at(dec!(-1), dec!(9999), now).is_none());
        assert!(cb.record_trade_at(dec!(-1), dec!(9998), now).is_none());
        assert_eq!(
            cb.record_trade_at(dec!(-1), dec!(9997), now),
            Some(BreakerTrigger::ConsecutiveLosses)
        );
    }

    #[test]
    fn win_resets_loss_streak() {
        let cb = breaker(CircuitBreakerConfig {
            max_daily_loss_pct: dec!(0.9),
            max_consecutive_losses: 3,
            max_drawdown_pct: dec!(0.9),
            ..Default::default()
        });
        let now = Utc::now();

        cb.record_trade_at(dec!(-1), dec!(9999), now);
        cb.record_trade_at(dec!(-1), dec!(9998), now);
        cb.record_trade_at(dec!(5), dec!(10003), now);
        assert!(cb.record_trade_at(dec!(-1), dec!(10002), now).is_none());
        assert_eq!(cb.state().consecutive_losses, 1);
        assert_eq!(cb.state().consecutive_wins, 0);
    }

    #[test]
    fn drawdown_trip_uses_peak_equity() {
        let cb = breaker(CircuitBreakerConfig {
            max_daily_loss_pct: dec!(0.9),
            max_consecutive_losses: 100,
            max_drawdown_pct: dec!(0.10),
            ..Default::default()
        });
        let now = Utc::now();

        // Push the peak up, then fall more than 10% from it.
        cb.record_trade_at(dec!(2000), dec!(12000), now);
        assert_eq!(
            cb.record_trade_at(dec!(-1500), dec!(10500), now),
            Some(BreakerTrigger::MaxDrawdown)
        );
    }

    #[test]
    fn error_rate_trips_only_with_trades() {
        let cb = breaker(CircuitBreakerConfig {
            max_error_rate: dec!(0.5),
            ..Default::default()
        });
        let now = Utc::now();

        // No trades yet: errors never trip.
        assert!(cb.record_error_at(now).is_none());
        assert!(cb.record_error_at(now).is_none());

        cb.record_trade_at(dec!(1), dec!(10001), now);
        cb.record_trade_at(dec!(1), dec!(10002), now);
        cb.record_trade_at(dec!(1), dec!(10003), now);
        cb.record_trade_at(dec!(1), dec!(10004), now);
        // 3 errors / 4 trades >= 0.5.
        assert_eq!(cb.record_error_at(now), Some(BreakerTrigger::ErrorRate));
    }

    #[test]
    fn cooldown_auto_resets_and_keeps_counters() {
        let cb = breaker(CircuitBreakerConfig {
            max_daily_loss_pct: dec!(0.05),
            cooldown_minutes: 60,
            ..Default::default()
        });
        let now = Utc::now();

        cb.record_trade_at(dec!(-600), dec!(9400), now);
        assert!(!cb.is_trading_allowed_at(now));
        assert!(!cb.is_trading_allowed_at(now + Duration::minutes(59)));

        // Cooldown elapsed: trading resumes; daily counters survive.
        assert!(cb.is_trading_allowed_at(now + Duration::minutes(60)));
        let state = cb.state();
        assert!(!state.is_tripped);
        assert_eq!(state.trigger, None);
        assert_eq!(state.consecutive_losses, 0);
        assert_eq!(state.daily_pnl, dec!(-600));
        assert_eq!(state.daily_trades, 1);
    }

    #[test]
    fn daily_counters_reset_after_utc_midnight() {
        let cb = breaker(CircuitBreakerConfig::default());
        let now = Utc::now();

        cb.record_trade_at(dec!(-100), dec!(9900), now);
        cb.record_error_at(now);
        assert_eq!(cb.state().daily_trades, 1);
        assert_eq!(cb.state().daily_errors, 1);

        // First event of the next UTC day resets pnl/trades/errors.
        let tomorrow = now + Duration::days(1);
        cb.record_trade_at(dec!(50), dec!(9950), tomorrow);
        let state = cb.state();
        assert_eq!(state.daily_pnl, dec!(50));
        assert_eq!(state.daily_trades, 1);
        assert_eq!(state.daily_errors, 0);
        assert_eq!(state.day_start, utc_midnight(tomorrow));
    }

    #[test]
    fn manual_trip_and_reset() {
        let cb = breaker(CircuitBreakerConfig::default());
        assert_eq!(cb.trip_manual(), BreakerTrigger::Manual);
        assert!(!cb.is_trading_allowed());
        cb.reset_manual();
        assert!(cb.is_trading_allowed());
    }
}
