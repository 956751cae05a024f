// =============================================================================
// Simulation models — fees, slippage and latency
// =============================================================================
//
// Slippage is always adverse: buys pay more, sells receive less. Randomness
// flows through a caller-owned seeded RNG so a backtest replays identically
// for the same seed.
// =============================================================================

use rand::rngs::StdRng;
use rand::Rng;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

// ---------------------------------------------------------------------------
// Fees
// ---------------------------------------------------------------------------

/// One volume tier: orders count against the rolling 30-day volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeTier {
    /// Rolling 30-day volume needed to reach this tier.
    pub min_volume: Decimal,
    pub maker_rate: Decimal,
    pub taker_rate: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeeModel {
    /// Flat maker/taker percentage of notional.
    Percentage { maker_rate: Decimal, taker_rate: Decimal },
    /// Fixed quote amount per order.
    Fixed { per_order: Decimal },
    /// Maker/taker rates chosen by rolling 30-day volume.
    Tiered { tiers: Vec<FeeTier> },
}

impl FeeModel {
    /// Binance-like default: 10 bps both sides.
    pub fn default_percentage() -> Self {
        Self::Percentage {
            maker_rate: Decimal::new(1, 3),
            taker_rate: Decimal::new(1, 3),
        }
    }

    /// Fee for an execution. Limit fills pay maker, market fills taker.
    pub fn fee(&self, notional: Decimal, is_maker: bool, rolling_volume: Decimal) -> Decimal {
        match self {
            Self::Percentage { maker_rate, taker_rate } => {
                notional * if is_maker { *maker_rate } else { *taker_rate }
            }
            Self::Fixed { per_order } => *per_order,
            Self::Tiered { tiers } => {
                let mut maker = Decimal::ZERO;
                let mut taker = Decimal::ZERO;
                // Tiers are ordered by min_volume; take the deepest reached.
                for tier in tiers {
                    if rolling_volume >= tier.min_volume {
                        maker = tier.maker_rate;
                        taker = tier.taker_rate;
                    }
                }
                notional * if is_maker { maker } else { taker }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Slippage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SlippageModel {
    /// Constant adverse rate.
    Fixed { rate: Decimal },
    /// `base + order_amount / bar_volume * impact`; degrades with size.
    VolumeBased { base_rate: Decimal, impact: Decimal },
    /// Uniform adverse rate in `[min_rate, max_rate]`.
    Random { min_rate: Decimal, max_rate: Decimal },
    /// Apply each model in sequence.
    Composite { models: Vec<SlippageModel> },
}

impl SlippageModel {
    pub fn none() -> Self {
        Self::Fixed { rate: Decimal::ZERO }
    }

    /// Adverse rate for one execution.
    fn rate(
        &self,
        order_amount: Decimal,
        bar_volume: Decimal,
        rng: &mut StdRng,
    ) -> Decimal {
        match self {
            Self::Fixed { rate } => *rate,
            Self::VolumeBased { base_rate, impact } => {
                if bar_volume > Decimal::ZERO {
                    *base_rate + order_amount / bar_volume * *impact
                } else {
                    *base_rate
                }
            }
            Self::Random { min_rate, max_rate } => {
                if max_rate <= min_rate {
                    return *min_rate;
                }
                let min = min_rate.to_string().parse::<f64>().unwrap_or(0.0);
                let max = max_rate.to_string().parse::<f64>().unwrap_or(0.0);
                Decimal::from_f64(rng.gen_range(min..max)).unwrap_or(*min_rate)
            }
            Self::Composite { models } => models
                .iter()
                .map(|m| m.rate(order_amount, bar_volume, rng))
                .sum(),
        }
    }

    /// Execution price after adverse slippage.
    pub fn apply(
        &self,
        price: Decimal,
        side: OrderSide,
        order_amount: Decimal,
        bar_volume: Decimal,
        rng: &mut StdRng,
    ) -> Decimal {
        let rate = self.rate(order_amount, bar_volume, rng);
        match side {
            OrderSide::Buy => price * (Decimal::ONE + rate),
            OrderSide::Sell => price * (Decimal::ONE - rate),
        }
    }
}

// ---------------------------------------------------------------------------
// Latency
// ---------------------------------------------------------------------------

/// Per-order delay, uniform in `[min_ms, max_ms]` with occasional spikes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyModel {
    pub min_ms: u64,
    pub max_ms: u64,
    /// Probability of a spike in [0, 1].
    pub spike_probability: f64,
    pub spike_max_ms: u64,
}

impl LatencyModel {
    pub fn delay_ms(&self, rng: &mut StdRng) -> u64 {
        if self.spike_probability > 0.0 && rng.gen_bool(self.spike_probability.clamp(0.0, 1.0)) {
            let lo = self.max_ms.max(1);
            if self.spike_max_ms > lo {
                return rng.gen_range(lo..=self.spike_max_ms);
            }
            return lo;
        }
        if self.max_ms > self.min_ms {
            rng.gen_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        }
    }
}
