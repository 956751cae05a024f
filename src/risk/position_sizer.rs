// =============================================================================
// Position sizing — fixed-fractional, Kelly, grid and dynamic sizers
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SizerError {
    #[error("stop price equals entry price; risk per unit is zero")]
    ZeroRange,

    #[error("invalid sizer configuration: {0}")]
    InvalidConfig(String),
}

/// Outcome of a sizing computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSize {
    /// Base-currency quantity to trade.
    pub amount: Decimal,
    /// Quote value put at risk (loss if the stop is hit).
    pub risk_amount: Decimal,
    /// Quote value of the position at entry.
    pub position_value: Decimal,
}

// ---------------------------------------------------------------------------
// Fixed fractional
// ---------------------------------------------------------------------------

/// Risk a fixed fraction of the balance per trade:
/// `qty = balance * risk_pct / |entry - stop|`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedFractionalSizer {
    risk_pct: Decimal,
}

impl FixedFractionalSizer {
    pub const MIN_RISK_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 3); // 0.001
    pub const MAX_RISK_PCT: Decimal = Decimal::from_parts(10, 0, 0, false, 2); // 0.10

    pub fn new(risk_pct: Decimal) -> Result<Self, SizerError> {
        if risk_pct < Self::MIN_RISK_PCT || risk_pct > Self::MAX_RISK_PCT {
            return Err(SizerError::InvalidConfig(format!(
                "risk_pct must be in [{}, {}], got {risk_pct}",
                Self::MIN_RISK_PCT,
                Self::MAX_RISK_PCT
            )));
        }
        Ok(Self { risk_pct })
    }

    pub fn risk_pct(&self) -> Decimal {
        self.risk_pct
    }

    pub fn size(
        &self,
        balance: Decimal,
        entry: Decimal,
        stop: Decimal,
    ) -> Result<PositionSize, SizerError> {
        let per_unit_risk = (entry - stop).abs();
        if per_unit_risk.is_zero() {
            return Err(SizerError::ZeroRange);
        }
        let risk_amount = balance * self.risk_pct;
        let amount = risk_amount / per_unit_risk;
        Ok(PositionSize {
            amount,
            risk_amount,
            position_value: amount * entry,
        })
    }
}

// ---------------------------------------------------------------------------
// Kelly
// ---------------------------------------------------------------------------

/// Kelly criterion sizing: `f* = W - (1 - W) / R` with `R = avg_win /
/// avg_loss`. The output fraction is scaled by `fraction` (half-Kelly
/// recommended) and clamped to [0, 0.25].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KellySizer {
    fraction: Decimal,
}

impl KellySizer {
    const MAX_FRACTION_OF_BALANCE: Decimal = Decimal::from_parts(25, 0, 0, false, 2); // 0.25

    pub fn new(fraction: Decimal) -> Result<Self, SizerError> {
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(SizerError::InvalidConfig(format!(
                "fraction must be in (0, 1], got {fraction}"
            )));
        }
        Ok(Self { fraction })
    }

    /// Balance fraction to commit given historical win statistics.
    pub fn balance_fraction(
        &self,
        win_rate: Decimal,
        avg_win: Decimal,
        avg_loss: Decimal,
    ) -> Result<Decimal, SizerError> {
        if win_rate < Decimal::ZERO || win_rate > Decimal::ONE {
            return Err(SizerError::InvalidConfig(format!(
                "win_rate must be in [0, 1], got {win_rate}"
            )));
        }
        if avg_loss <= Decimal::ZERO {
            return Err(SizerError::InvalidConfig(format!(
                "avg_loss must be positive, got {avg_loss}"
            )));
        }
        let payoff = avg_win / avg_loss;
        if payoff.is_zero() {
            return Ok(Decimal::ZERO);
        }
        let kelly = win_rate - (Decimal::ONE - win_rate) / payoff;
        let scaled = (self.fraction * kelly).max(Decimal::ZERO);
        Ok(scaled.min(Self::MAX_FRACTION_OF_BALANCE))
    }

    pub fn size(
        &self,
        balance: Decimal,
        entry: Decimal,
        win_rate: Decimal,
        avg_win: Decimal,
        avg_loss: Decimal,
    ) -> Result<PositionSize, SizerError> {
        if entry <= Decimal::ZERO {
            return Err(SizerError::InvalidConfig(format!(
                "entry must be positive, got {entry}"
            )));
        }
        let fraction = self.balance_fraction(win_rate, avg_win, avg_loss)?;
        let position_value = balance * fraction;
        Ok(PositionSize {
            amount: position_value / entry,
            risk_amount: position_value,
            position_value,
        })
    }
}

// ---------------------------------------------------------------------------
// Grid
// ---------------------------------------------------------------------------

/// Split an allocation evenly across active grid levels, keeping a reserve.
/// Invariant: `allocation_pct + reserve_pct <= 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSizer {
    allocation_pct: Decimal,
    reserve_pct: Decimal,
}

impl GridSizer {
    pub fn new(allocation_pct: Decimal, reserve_pct: Decimal) -> Result<Self, SizerError> {
        if allocation_pct <= Decimal::ZERO || allocation_pct > Decimal::ONE {
            return Err(SizerError::InvalidConfig(format!(
                "allocation_pct must be in (0, 1], got {allocation_pct}"
            )));
        }
        if reserve_pct < Decimal::ZERO || reserve_pct >= Decimal::ONE {
            return Err(SizerError::InvalidConfig(format!(
                "reserve_pct must be in [0, 1), got {reserve_pct}"
            )));
        }
        if allocation_pct + reserve_pct > Decimal::ONE {
            return Err(SizerError::InvalidConfig(format!(
                "allocation_pct + reserve_pct must not exceed 1, got {}",
                allocation_pct + reserve_pct
            )));
        }
        Ok(Self {
            allocation_pct,
            reserve_pct,
        })
    }

    pub fn allocation_pct(&self) -> Decimal {
        self.allocation_pct
    }

    pub fn reserve_pct(&self) -> Decimal {
        self.reserve_pct
    }

    /// Quote allocation for one grid level.
    pub fn per_grid_allocation(
        &self,
        balance: Decimal,
        num_active_grids: u32,
    ) -> Result<Decimal, SizerError> {
        if num_active_grids == 0 {
            return Err(SizerError::InvalidConfig(
                "num_active_grids must be positive".into(),
            ));
        }
        Ok(self.allocation_pct * balance / Decimal::from(num_active_grids))
    }

    pub fn reserve(&self, balance: Decimal) -> Decimal {
        self.reserve_pct * balance
    }
}

// ---------------------------------------------------------------------------
// Dynamic
// ---------------------------------------------------------------------------

/// Fixed-fractional base scaled down in hostile conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicSizer {
    base: FixedFractionalSizer,
}

/// Volatility above this ratio of its average triggers downscaling.
const VOLATILITY_TRIGGER_RATIO: Decimal = Decimal::from_parts(15, 0, 0, false, 1); // 1.5
/// Floor for the volatility adjustment factor.
const VOLATILITY_FLOOR: Decimal = Decimal::from_parts(5, 0, 0, false, 1); // 0.5
/// Drawdown above which sizing shrinks.
const DRAWDOWN_TRIGGER: Decimal = Decimal::from_parts(5, 0, 0, false, 2); // 0.05
/// Floor for the drawdown adjustment factor.
const DRAWDOWN_FLOOR: Decimal = Decimal::from_parts(25, 0, 0, false, 2); // 0.25

impl DynamicSizer {
    pub fn new(risk_pct: Decimal) -> Result<Self, SizerError> {
        Ok(Self {
            base: FixedFractionalSizer::new(risk_pct)?,
        })
    }

    /// Combined scaling factor for current market conditions.
    pub fn adjustment_factor(
        &self,
        current_atr: Decimal,
        average_atr: Decimal,
        current_drawdown: Decimal,
    ) -> Decimal {
        let mut factor = Decimal::ONE;

        if average_atr > Decimal::ZERO {
            let ratio = current_atr / average_atr;
            if ratio > VOLATILITY_TRIGGER_RATIO {
                factor *= (Decimal::ONE / ratio).max(VOLATILITY_FLOOR);
            }
        }

        if current_drawdown > DRAWDOWN_TRIGGER {
            let dd_factor =
                (Decimal::ONE - Decimal::from(5) * current_drawdown).max(DRAWDOWN_FLOOR);
            factor *= dd_factor;
        }

        factor
    }

    pub fn size(
        &self,
        balance: Decimal,
        entry: Decimal,
        stop: Decimal,
        current_atr: Decimal,
        average_atr: Decimal,
        current_drawdown: Decimal,
    ) -> Result<PositionSize, SizerError> {
        let base = self.base.size(balance, entry, stop)?;
        let factor = self.adjustment_factor(current_atr, average_atr, current_drawdown);
        Ok(PositionSize {
            amount: base.amount * factor,
            risk_amount: base.risk_amount * factor,
            position_value: base.position_value * factor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn fixed_fractional_matches_reference_numbers() {
        // balance 10000, entry 100, stop 95, risk 2% -> amount 40, risk 200.
        let sizer = FixedFractionalSizer::new(dec!(0.02)).unwrap();
        let size = sizer.size(dec!(10000), dec!(100), dec!(95)).unwrap();
        assert_eq!(size.amount, dec!(40));
        assert_eq!(size.risk_amount, dec!(200));
        assert_eq!(size.position_value, dec!(4000));
    }

    #[test]
    fn fixed_fractional_rejects_zero_range_and_bad_config() {
        let sizer = FixedFractionalSizer::new(dec!(0.02)).unwrap();
        assert_eq!(
            sizer.size(dec!(10000), dec!(100), dec!(100)).unwrap_err(),
            SizerError::ZeroRange
        );
        assert!(FixedFractionalSizer::new(dec!(0.0001)).is_err());
        assert!(FixedFractionalSizer::new(dec!(0.2)).is_err());
        assert!(FixedFractionalSizer::new(dec!(0.001)).is_ok());
        assert!(FixedFractionalSizer::new(dec!(0.10)).is_ok());
    }

    #[test]
    fn kelly_is_clamped_and_never_negative() {
        let sizer = KellySizer::new(dec!(0.5)).unwrap();

        // W = 0.6, R = 2 -> f* = 0.6 - 0.4/2 = 0.4; half-Kelly 0.2.
        let f = sizer.balance_fraction(dec!(0.6), dec!(200), dec!(100)).unwrap();
        assert_eq!(f, dec!(0.2));

        // Losing edge goes to zero, not negative.
        let f = sizer.balance_fraction(dec!(0.3), dec!(100), dec!(100)).unwrap();
        assert_eq!(f, Decimal::ZERO);

        // Extreme edge is capped at a quarter of the balance.
        let full = KellySizer::new(dec!(1)).unwrap();
        let f = full.balance_fraction(dec!(0.9), dec!(500), dec!(100)).unwrap();
        assert_eq!(f, dec!(0.25));
    }

    #[test]
    fn kelly_rejects_invalid_inputs() {
        assert!(KellySizer::new(dec!(0)).is_err());
        assert!(KellySizer::new(dec!(1.5)).is_err());
        let sizer = KellySizer::new(dec!(0.5)).unwrap();
        assert!(sizer.balance_fraction(dec!(1.2), dec!(100), dec!(100)).is_err());
        assert!(sizer.balance_fraction(dec!(0.5), dec!(100), dec!(0)).is_err());
    }

    #[test]
    fn grid_allocation_splits_evenly() {
        let sizer = GridSizer::new(dec!(0.8), dec!(0.2)).unwrap();
        // 10000 * 0.8 / 4 = 2000 per active grid.
        assert_eq!(
            sizer.per_grid_allocation(dec!(10000), 4).unwrap(),
            dec!(2000)
        );
        assert_eq!(sizer.reserve(dec!(10000)), dec!(2000));
    }

    #[test]
    fn grid_rejects_over_committed_allocation() {
        assert!(GridSizer::new(dec!(0.9), dec!(0.2)).is_err());
        assert!(GridSizer::new(dec!(0.8), dec!(0.2)).is_ok());
        let sizer = GridSizer::new(dec!(0.5), dec!(0.1)).unwrap();
        assert!(sizer.per_grid_allocation(dec!(1000), 0).is_err());
    }

    #[test]
    fn dynamic_downscales_on_volatility_and_drawdown() {
        let sizer = DynamicSizer::new(dec!(0.02)).unwrap();

        // Calm conditions leave the base size untouched.
        assert_eq!(
            sizer.adjustment_factor(dec!(10), dec!(10), dec!(0.01)),
            Decimal::ONE
        );

        // ATR ratio 2.0 -> factor 1/2 (above the 0.5 floor).
        assert_eq!(
            sizer.adjustment_factor(dec!(20), dec!(10), dec!(0.01)),
            dec!(0.5)
        );

        // ATR ratio 4.0 -> 1/4 clamps to the 0.5 floor.
        assert_eq!(
            sizer.adjustment_factor(dec!(40), dec!(10), dec!(0.01)),
            dec!(0.5)
        );

        // 10% drawdown -> 1 - 0.5 = 0.5.
        assert_eq!(
            sizer.adjustment_factor(dec!(10), dec!(10), dec!(0.10)),
            dec!(0.50)
        );

        // 20% drawdown -> 1 - 1.0 clamps to the 0.25 floor.
        assert_eq!(
            sizer.adjustment_factor(dec!(10), dec!(10), dec!(0.20)),
            dec!(0.25)
        );

        // Both effects compound.
        let size = sizer
            .size(dec!(10000), dec!(100), dec!(95), dec!(20), dec!(10), dec!(0.10))
            .unwrap();
        assert_eq!(size.amount, dec!(10)); // 40 * 0.5 * 0.5
    }
}
