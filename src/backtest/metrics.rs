// =============================================================================
// Performance metrics — returns, risk, risk-adjusted ratios, trade stats
// =============================================================================
//
// Statistics that need sqrt/powers run in f64 and convert back to Decimal
// at the boundary; money paths stay Decimal. The timeframe -> periods/year
// table treats the market as always-open (1m -> 525600), which overstates
// annualised volatility on venues with maintenance windows; kept as a known
// approximation.
// =============================================================================

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::EquityPoint;

/// Fixed annualisation table.
pub fn periods_per_year(timeframe: &str) -> u32 {
    match timeframe {
        "1m" => 525_600,
        "5m" => 105_120,
        "15m" => 35_040,
        "30m" => 17_520,
        "1h" => 8_760,
        "4h" => 2_190,
        "1d" => 365,
        _ => 365,
    }
}

/// One realised round trip fed into trade statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMetrics {
    pub total_return: Decimal,
    pub cagr: Decimal,
    /// (year, month, compounded return), chronological.
    pub monthly_returns: Vec<(i32, u32, Decimal)>,
    pub best_month: Decimal,
    pub worst_month: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    pub annualized_volatility: Decimal,
    pub max_drawdown: Decimal,
    pub avg_drawdown: Decimal,
    pub longest_drawdown_days: i64,
    pub var_95: Decimal,
    pub var_99: Decimal,
    pub cvar_95: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAdjustedMetrics {
    pub sharpe_ratio: Decimal,
    pub sortino_ratio: Decimal,
    pub calmar_ratio: Decimal,
    pub omega_ratio: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeMetrics {
    pub total_trades: usize,
    pub win_rate: Decimal,
    pub profit_factor: Decimal,
    pub expectancy: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub avg_duration_secs: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceReport {
    pub returns: ReturnMetrics,
    pub risk: RiskMetrics,
    pub risk_adjusted: RiskAdjustedMetrics,
    pub trades: TradeMetrics,
}

/// Metrics calculator parameterised by annualisation and risk-free rate.
pub struct MetricsCalculator {
    risk_free_rate: f64,
    periods_per_year: u32,
}

impl MetricsCalculator {
    pub fn new(timeframe: &str, risk_free_rate: f64) -> Self {
        Self {
            risk_free_rate,
            periods_per_year: periods_per_year(timeframe),
        }
    }

    pub fn calculate(&self, equity: &[EquityPoint], trades: &[ClosedTrade]) -> PerformanceReport {
        let returns = self.return_metrics(equity);
        let risk = self.risk_metrics(equity);
        let risk_adjusted = self.risk_adjusted_metrics(equity, &returns, &risk);
        let trade_metrics = self.trade_metrics(trades);
        PerformanceReport {
            returns,
            risk,
            risk_adjusted,
            trades: trade_metrics,
        }
    }

    // -------------------------------------------------------------------------
    // Returns
    // -------------------------------------------------------------------------

    fn return_metrics(&self, equity: &[EquityPoint]) -> ReturnMetrics {
        if equity.len() < 2 || equity[0].equity <= Decimal::ZERO {
            return ReturnMetrics {
                total_return: Decimal::ZERO,
                cagr: Decimal::ZERO,
                monthly_returns: Vec::new(),
                best_month: Decimal::ZERO,
                worst_month: Decimal::ZERO,
            };
        }

        let first = equity[0].equity;
        let last = equity[equity.len() - 1].equity;
        let total_return = last / first - Decimal::ONE;

        let years = equity.len() as f64 / self.periods_per_year as f64;
        let cagr = if years > 0.0 && last > Decimal::ZERO {
            let growth = (last / first).to_f64().unwrap_or(1.0);
            from_f64(growth.powf(1.0 / years) - 1.0)
        } else {
            Decimal::ZERO
        };

        // Compound per calendar month.
        let mut monthly: Vec<(i32, u32, Decimal)> = Vec::new();
        let mut month_start = equity[0].equity;
        let mut current = (equity[0].timestamp.year(), equity[0].timestamp.month());
        let mut last_in_month = equity[0].equity;
        for point in &equity[1..] {
            let key = (point.timestamp.year(), point.timestamp.month());
            if key != current {
                if month_start > Decimal::ZERO {
                    monthly.push((current.0, current.1, last_in_month / month_start - Decimal::ONE));
                }
                current = key;
                month_start = last_in_month;
            }
            last_in_month = point.equity;
        }
        if month_start > Decimal::ZERO {
            monthly.push((current.0, current.1, last_in_month / month_start - Decimal::ONE));
        }

        let best_month = monthly.iter().map(|(_, _, r)| *r).max().unwrap_or(Decimal::ZERO);
        let worst_month = monthly.iter().map(|(_, _, r)| *r).min().unwrap_or(Decimal::ZERO);

        ReturnMetrics {
            total_return,
            cagr,
            monthly_returns: monthly,
            best_month,
            worst_month,
        }
    }

    // -------------------------------------------------------------------------
    // Risk
    // -------------------------------------------------------------------------

    fn risk_metrics(&self, equity: &[EquityPoint]) -> RiskMetrics {
        let returns = period_returns(equity);
        let annualized_volatility = if returns.len() >= 2 {
            from_f64(std_dev(&returns) * (self.periods_per_year as f64).sqrt())
        } else {
            Decimal::ZERO
        };

        // Drawdown sweep over the equity curve.
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        let mut drawdowns: Vec<Decimal> = Vec::new();
        let mut current_trough = Decimal::ZERO;
        let mut dd_start: Option<DateTime<Utc>> = None;
        let mut longest_days: i64 = 0;
        for point in equity {
            if point.equity > peak {
                if let Some(start) = dd_start.take() {
                    if peak > Decimal::ZERO {
                        drawdowns.push((peak - current_trough) / peak);
                    }
                    longest_days = longest_days.max((point.timestamp - start).num_days());
                }
                peak = point.equity;
                current_trough = point.equity;
            } else if peak > Decimal::ZERO {
                if dd_start.is_none() && point.equity < peak {
                    dd_start = Some(point.timestamp);
                    current_trough = point.equity;
                }
                current_trough = current_trough.min(point.equity);
                let dd = (peak - point.equity) / peak;
                max_dd = max_dd.max(dd);
            }
        }
        if let (Some(start), Some(last)) = (dd_start, equity.last()) {
            if peak > Decimal::ZERO {
                drawdowns.push((peak - current_trough) / peak);
            }
            longest_days = longest_days.max((last.timestamp - start).num_days());
        }
        let avg_drawdown = if drawdowns.is_empty() {
            Decimal::ZERO
        } else {
            drawdowns.iter().copied().sum::<Decimal>() / Decimal::from(drawdowns.len() as u64)
        };

        // Tail risk from the period-return distribution.
        let (var_95, var_99, cvar_95) = if returns.len() >= 2 {
            let mut sorted = returns.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let p5 = percentile(&sorted, 0.05);
            let p1 = percentile(&sorted, 0.01);
            let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= p5).collect();
            let cvar = if tail.is_empty() {
                0.0
            } else {
                -(tail.iter().sum::<f64>() / tail.len() as f64)
            };
            (from_f64(-p5), from_f64(-p1), from_f64(cvar))
        } else {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };

        RiskMetrics {
            annualized_volatility,
            max_drawdown: max_dd,
            avg_drawdown,
            longest_drawdown_days: longest_days,
            var_95,
            var_99,
            cvar_95,
        }
    }

    // -------------------------------------------------------------------------
    // Risk-adjusted
    // -------------------------------------------------------------------------

    fn risk_adjusted_metrics(
        &self,
        equity: &[EquityPoint],
        returns: &ReturnMetrics,
        risk: &RiskMetrics,
    ) -> RiskAdjustedMetrics {
        let period_rets = period_returns(equity);
        let ppy = self.periods_per_year as f64;

        let sharpe_ratio = if period_rets.len() >= 2 {
            let sd = std_dev(&period_rets);
            if sd > 0.0 {
                let excess = mean(&period_rets) - self.risk_free_rate / ppy;
                from_f64(excess / sd * ppy.sqrt())
            } else {
                Decimal::ZERO
            }
        } else {
            Decimal::ZERO
        };

        let sortino_ratio = if period_rets.len() >= 2 {
            let downside: Vec<f64> = period_rets.iter().copied().filter(|r| *r < 0.0).collect();
            let dd_sd = if downside.len() >= 2 { std_dev(&downside) } else { 0.0 };
            if dd_sd > 0.0 {
                from_f64(mean(&period_rets) / dd_sd * ppy.sqrt())
            } else {
                Decimal::ZERO
            }
        } else {
            Decimal::ZERO
        };

        let calmar_ratio = if risk.max_drawdown > Decimal::ZERO {
            returns.cagr / risk.max_drawdown
        } else {
            Decimal::ZERO
        };

        let gains: f64 = period_rets.iter().copied().filter(|r| *r > 0.0).sum();
        let losses: f64 = period_rets.iter().copied().filter(|r| *r < 0.0).sum();
        let omega_ratio = if losses.abs() > f64::EPSILON {
            from_f64(gains / losses.abs())
        } else {
            Decimal::ZERO
        };

        RiskAdjustedMetrics {
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            omega_ratio,
        }
    }

    // -------------------------------------------------------------------------
    // Trades
    // -------------------------------------------------------------------------

    fn trade_metrics(&self, trades: &[ClosedTrade]) -> TradeMetrics {
        if trades.is_empty() {
            return TradeMetrics {
                total_trades: 0,
                win_rate: Decimal::ZERO,
                profit_factor: Decimal::ZERO,
                expectancy: Decimal::ZERO,
                avg_win: Decimal::ZERO,
                avg_loss: Decimal::ZERO,
                avg_duration_secs: 0,
            };
        }

        let wins: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl > Decimal::ZERO)
            .map(|t| t.pnl)
            .collect();
        let losses: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl < Decimal::ZERO)
            .map(|t| t.pnl.abs())
            .collect();

        let total = Decimal::from(trades.len() as u64);
        let win_rate = Decimal::from(wins.len() as u64) / total;
        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().copied().sum();
        let profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit / gross_loss
        } else {
            Decimal::ZERO
        };
        let avg_win = if wins.is_empty() {
            Decimal::ZERO
        } else {
            gross_profit / Decimal::from(wins.len() as u64)
        };
        let avg_loss = if losses.is_empty() {
            Decimal::ZERO
        } else {
            gross_loss / Decimal::from(losses.len() as u64)
        };
        let expectancy = win_rate * avg_win - (Decimal::ONE - win_rate) * avg_loss;
        let avg_duration_secs = trades
            .iter()
            .map(|t| (t.closed_at - t.opened_at).num_seconds())
            .sum::<i64>()
            / trades.len() as i64;

        TradeMetrics {
            total_trades: trades.len(),
            win_rate,
            profit_factor,
            expectancy,
            avg_win,
            avg_loss,
            avg_duration_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Numeric helpers
// ---------------------------------------------------------------------------

fn from_f64(value: f64) -> Decimal {
    if value.is_finite() {
        Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
    } else {
        Decimal::ZERO
    }
}

fn period_returns(equity: &[EquityPoint]) -> Vec<f64> {
    equity
        .windows(2)
        .filter_map(|pair| {
            let prev = pair[0].equity.to_f64()?;
            let curr = pair[1].equity.to_f64()?;
            (prev != 0.0).then(|| curr / prev - 1.0)
        })
        .collect()
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

/// Linear-interpolated percentile of a sorted slice; `q` in [0, 1].
fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn curve(values: &[i64]) -> Vec<EquityPoint> {
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        values
            .iter()
            .enumerate()
            .map(|(i, v)| EquityPoint {
                timestamp: start + Duration::days(i as i64),
                equity: Decimal::from(*v),
            })
            .collect()
    }

    #[test]
    fn annualization_table_is_fixed() {
        assert_eq!(periods_per_year("1m"), 525_600);
        assert_eq!(periods_per_year("1h"), 8_760);
        assert_eq!(periods_per_year("1d"), 365);
        assert_eq!(periods_per_year("unknown"), 365);
    }

    #[test]
    fn total_return_and_drawdown() {
        let calc = MetricsCalculator::new("1d", 0.0);
        let report = calc.calculate(&curve(&[10000, 11000, 9900, 10450, 12100]), &[]);

        assert_eq!(report.returns.total_return, dec!(0.21));
        // Peak 11000 -> trough 9900 = 10% drawdown.
        assert_eq!(report.risk.max_drawdown, dec!(0.1));
        assert!(report.returns.cagr > Decimal::ZERO);
    }

    #[test]
    fn flat_curve_produces_zero_metrics() {
        let calc = MetricsCalculator::new("1d", 0.0);
        let report = calc.calculate(&curve(&[10000, 10000, 10000]), &[]);
        assert_eq!(report.returns.total_return, Decimal::ZERO);
        assert_eq!(report.risk.max_drawdown, Decimal::ZERO);
        assert_eq!(report.risk.annualized_volatility, Decimal::ZERO);
        assert_eq!(report.risk_adjusted.sharpe_ratio, Decimal::ZERO);
    }

    #[test]
    fn empty_and_single_point_curves_are_safe() {
        let calc = MetricsCalculator::new("1h", 0.0);
        let report = calc.calculate(&[], &[]);
        assert_eq!(report.returns.total_return, Decimal::ZERO);
        let report = calc.calculate(&curve(&[10000]), &[]);
        assert_eq!(report.returns.total_return, Decimal::ZERO);
    }

    #[test]
    fn sharpe_positive_for_uptrend() {
        let calc = MetricsCalculator::new("1d", 0.0);
        let report = calc.calculate(
            &curve(&[10000, 10100, 10150, 10300, 10280, 10500, 10650]),
            &[],
        );
        assert!(report.risk_adjusted.sharpe_ratio > Decimal::ZERO);
        assert!(report.risk_adjusted.omega_ratio > Decimal::ONE);
    }

    #[test]
    fn trade_metrics_match_formulas() {
        let calc = MetricsCalculator::new("1h", 0.0);
        let start = DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap();
        let trade = |pnl: Decimal, hours: i64| ClosedTrade {
            pnl,
            opened_at: start,
            closed_at: start + Duration::hours(hours),
        };
        let trades = vec![
            trade(dec!(100), 2),
            trade(dec!(50), 4),
            trade(dec!(-30), 2),
            trade(dec!(80), 4),
        ];
        let m = calc.trade_metrics(&trades);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.win_rate, dec!(0.75));
        // (100+50+80)/30
        assert_eq!(m.profit_factor, dec!(230) / dec!(30));
        // avg_win = 230/3, avg_loss = 30
        let expected = dec!(0.75) * (dec!(230) / dec!(3)) - dec!(0.25) * dec!(30);
        assert_eq!(m.expectancy, expected);
        assert_eq!(m.avg_duration_secs, 3 * 3600);
    }

    #[test]
    fn monthly_returns_split_on_calendar_month() {
        let calc = MetricsCalculator::new("1d", 0.0);
        let start = DateTime::parse_from_rfc3339("2024-01-25T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let equity: Vec<EquityPoint> = (0..14)
            .map(|i| EquityPoint {
                timestamp: start + Duration::days(i),
                equity: dec!(10000) + Decimal::from(i * 10),
            })
            .collect();
        let returns = calc.return_metrics(&equity);
        // Spans January and February.
        assert_eq!(returns.monthly_returns.len(), 2);
        assert_eq!(returns.monthly_returns[0].1, 1);
        assert_eq!(returns.monthly_returns[1].1, 2);
        assert!(returns.best_month >= returns.worst_month);
    }
}
