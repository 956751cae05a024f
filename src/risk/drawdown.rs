// =============================================================================
// Drawdown tracker — equity peaks, underwater periods, recovery
// =============================================================================
//
// Tracks the running equity peak, the current and maximum drawdown, and a
// list of underwater periods (started when equity dips below the peak,
// closed when a new peak is made). Equity history is bounded; the oldest
// points fall off. `max_drawdown_pct` is monotonically non-decreasing.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::EquityPoint;

/// Maximum retained equity points.
const EQUITY_HISTORY_CAP: usize = 10_000;

/// One underwater stretch of the equity curve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrawdownPeriod {
    pub start_date: DateTime<Utc>,
    /// None while the period is still open.
    pub end_date: Option<DateTime<Utc>>,
    pub peak_equity: Decimal,
    pub trough_equity: Decimal,
    pub drawdown_pct: Decimal,
    pub duration_days: i64,
    pub recovered: bool,
}

/// Summary snapshot for dashboards and the risk manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownStats {
    pub peak_equity: Decimal,
    pub current_equity: Decimal,
    pub current_drawdown_pct: Decimal,
    pub max_drawdown_pct: Decimal,
    pub max_drawdown_date: Option<DateTime<Utc>>,
    /// Gain needed to climb back to the peak (`peak/equity - 1`).
    pub recovery_needed_pct: Decimal,
    pub underwater: bool,
    pub period_count: usize,
    pub avg_drawdown_pct: Decimal,
    pub longest_duration_days: i64,
}

/// Equity-curve drawdown tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownTracker {
    peak_equity: Decimal,
    current_equity: Decimal,
    max_drawdown_pct: Decimal,
    max_drawdown_date: Option<DateTime<Utc>>,
    history: Vec<EquityPoint>,
    periods: Vec<DrawdownPeriod>,
}

impl DrawdownTracker {
    pub fn new(initial_equity: Decimal) -> Self {
        Self {
            peak_equity: initial_equity,
            current_equity: initial_equity,
            max_drawdown_pct: Decimal::ZERO,
            max_drawdown_date: None,
            history: Vec::new(),
            periods: Vec::new(),
        }
    }

    /// Feed one equity observation.
    pub fn update(&mut self, equity: Decimal, ts: DateTime<Utc>) {
        self.current_equity = equity;
        self.history.push(EquityPoint { timestamp: ts, equity });
        if self.history.len() > EQUITY_HISTORY_CAP {
            let excess = self.history.len() - EQUITY_HISTORY_CAP;
            self.history.drain(..excess);
        }

        if equity > self.peak_equity {
            self.peak_equity = equity;
            // A new peak ends any open underwater period.
            if let Some(open) = self.periods.iter_mut().rev().find(|p| p.end_date.is_none()) {
                open.end_date = Some(ts);
                open.recovered = true;
                open.duration_days = (ts - open.start_date).num_days();
                debug!(
                    drawdown_pct = %open.drawdown_pct,
                    duration_days = open.duration_days,
                    "drawdown period recovered"
                );
            }
        }

        let current_dd = self.current_drawdown_pct();
        if current_dd > self.max_drawdown_pct {
            self.max_drawdown_pct = current_dd;
            self.max_drawdown_date = Some(ts);
        }

        let open_period = self.periods.iter_mut().rev().find(|p| p.end_date.is_none());
        match open_period {
            None if current_dd > Decimal::ZERO => {
                self.periods.push(DrawdownPeriod {
                    start_date: ts,
                    end_date: None,
                    peak_equity: self.peak_equity,
                    trough_equity: equity,
                    drawdown_pct: current_dd,
                    duration_days: 0,
                    recovered: false,
                });
            }
            Some(open) if equity < open.trough_equity => {
                open.trough_equity = equity;
                open.drawdown_pct = current_dd;
                open.duration_days = (ts - open.start_date).num_days();
            }
            Some(open) => {
                open.duration_days = (ts - open.start_date).num_days();
            }
            None => {}
        }
    }

    pub fn current_drawdown_pct(&self) -> Decimal {
        if self.peak_equity > Decimal::ZERO {
            (self.peak_equity - self.current_equity) / self.peak_equity
        } else {
            Decimal::ZERO
        }
    }

    pub fn max_drawdown_pct(&self) -> Decimal {
        self.max_drawdown_pct
    }

    pub fn peak_equity(&self) -> Decimal {
        self.peak_equity
    }

    pub fn history(&self) -> &[EquityPoint] {
        &self.history
    }

    pub fn periods(&self) -> &[DrawdownPeriod] {
        &self.periods
    }

    /// Gain fraction required to recover the peak from current equity.
    pub fn recovery_needed_pct(&self) -> Decimal {
        if self.current_equity > Decimal::ZERO {
            self.peak_equity / self.current_equity - Decimal::ONE
        } else {
            Decimal::ZERO
        }
    }

    pub fn stats(&self) -> DrawdownStats {
        let completed: Vec<&DrawdownPeriod> = self.periods.iter().collect();
        let avg_drawdown_pct = if completed.is_empty() {
            Decimal::ZERO
        } else {
            completed.iter().map(|p| p.drawdown_pct).sum::<Decimal>()
                / Decimal::from(completed.len() as u64)
        };
        let longest_duration_days = self
            .periods
            .iter()
            .map(|p| p.duration_days)
            .max()
            .unwrap_or(0);

        DrawdownStats {
            peak_equity: self.peak_equity,
            current_equity: self.current_equity,
            current_drawdown_pct: self.current_drawdown_pct(),
            max_drawdown_pct: self.max_drawdown_pct,
            max_drawdown_date: self.max_drawdown_date,
            recovery_needed_pct: self.recovery_needed_pct(),
            underwater: self.current_drawdown_pct() > Decimal::ZERO,
            period_count: self.periods.len(),
            avg_drawdown_pct,
            longest_duration_days,
        }
    }
}
