// =============================================================================
// Optimizer — Cartesian grid search and walk-forward analysis
// =============================================================================
//
// Grid search evaluates every combination of the parameter ranges against a
// caller-supplied objective. Walk-forward partitions the bar history into
// rolling windows, optimizes on the in-sample segment, evaluates the chosen
// parameters out-of-sample, and reports per-parameter robustness as
// `1 - coefficient_of_variation` of the values chosen across folds.
// =============================================================================

use std::collections::BTreeMap;
use std::future::Future;
use std::ops::Range;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One tunable parameter and its candidate values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamRange {
    pub name: String,
    pub values: Vec<Decimal>,
}

impl ParamRange {
    pub fn new(name: impl Into<String>, values: Vec<Decimal>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

/// A concrete assignment of every parameter.
pub type ParamSet = BTreeMap<String, Decimal>;

/// Every combination of the given ranges, in deterministic order.
pub fn cartesian_product(ranges: &[ParamRange]) -> Vec<ParamSet> {
    let mut combos: Vec<ParamSet> = vec![BTreeMap::new()];
    for range in ranges {
        let mut next = Vec::with_capacity(combos.len() * range.values.len());
        for combo in &combos {
            for value in &range.values {
                let mut extended = combo.clone();
                extended.insert(range.name.clone(), *value);
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub params: ParamSet,
    pub score: Decimal,
}

/// Evaluate every combination; results sorted best-first.
pub async fn grid_search<F, Fut>(
    ranges: &[ParamRange],
    mut evaluate: F,
) -> anyhow::Result<Vec<OptimizationResult>>
where
    F: FnMut(ParamSet) -> Fut,
    Fut: Future<Output = anyhow::Result<Decimal>>,
{
    let combos = cartesian_product(ranges);
    info!(combinations = combos.len(), "grid search started");

    let mut results = Vec::with_capacity(combos.len());
    for params in combos {
        let score = evaluate(params.clone()).await?;
        debug!(?params, score = %score, "combination evaluated");
        results.push(OptimizationResult { params, score });
    }
    results.sort_by(|a, b| b.score.cmp(&a.score));
    Ok(results)
}

// ---------------------------------------------------------------------------
// Walk-forward
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldResult {
    pub fold: usize,
    pub in_sample: (usize, usize),
    pub out_of_sample: (usize, usize),
    pub best_params: ParamSet,
    pub in_sample_score: Decimal,
    pub out_of_sample_score: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardReport {
    pub folds: Vec<FoldResult>,
    /// Per-parameter `1 - CV` of the values chosen across folds, in [0, 1].
    pub robustness: BTreeMap<String, Decimal>,
    /// Mean out-of-sample score.
    pub oos_mean_score: Decimal,
}

/// Rolling fold boundaries over `num_bars` bars.
fn fold_windows(num_bars: usize, num_folds: usize, in_sample_ratio: f64) -> Vec<(Range<usize>, Range<usize>)> {
    if num_folds == 0 || num_bars < num_folds + 1 {
        return Vec::new();
    }
    let window = num_bars * 2 / (num_folds + 1);
    let step = window / 2;
    if window < 2 || step == 0 {
        return Vec::new();
    }

    let mut folds = Vec::with_capacity(num_folds);
    for fold in 0..num_folds {
        let start = fold * step;
        let end = (start + window).min(num_bars);
        let split = start + ((end - start) as f64 * in_sample_ratio) as usize;
        if split <= start || split >= end {
            continue;
        }
        folds.push((start..split, split..end));
    }
    folds
}

/// Walk-forward analysis. `evaluate(params, bars)` must run the strategy
/// over the given bar index range and return the objective score.
pub async fn walk_forward<F, Fut>(
    num_bars: usize,
    ranges: &[ParamRange],
    num_folds: usize,
    in_sample_ratio: f64,
    mut evaluate: F,
) -> anyhow::Result<WalkForwardReport>
where
    F: FnMut(ParamSet, Range<usize>) -> Fut,
    Fut: Future<Output = anyhow::Result<Decimal>>,
{
    let windows = fold_windows(num_bars, num_folds, in_sample_ratio);
    if windows.is_empty() {
        anyhow::bail!(
            "cannot partition {num_bars} bars into {num_folds} folds at ratio {in_sample_ratio}"
        );
    }

    let mut folds = Vec::with_capacity(windows.len());
    for (fold, (in_sample, out_of_sample)) in windows.into_iter().enumerate() {
        // Optimize on the in-sample segment.
        let mut best: Option<(ParamSet, Decimal)> = None;
        for params in cartesian_product(ranges) {
            let score = evaluate(params.clone(), in_sample.clone()).await?;
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((params, score));
            }
        }
        let (best_params, in_sample_score) =
            best.ok_or_else(|| anyhow::anyhow!("no parameter combinations to evaluate"))?;

        // Evaluate the winner out-of-sample.
        let out_of_sample_score = evaluate(best_params.clone(), out_of_sample.clone()).await?;
        info!(
            fold,
            in_sample_score = %in_sample_score,
            out_of_sample_score = %out_of_sample_score,
            "walk-forward fold evaluated"
        );

        folds.push(FoldResult {
            fold,
            in_sample: (in_sample.start, in_sample.end),
            out_of_sample: (out_of_sample.start, out_of_sample.end),
            best_params,
            in_sample_score,
            out_of_sample_score,
        });
    }

    let robustness = parameter_robustness(ranges, &folds);
    let oos_mean_score = if folds.is_empty() {
        Decimal::ZERO
    } else {
        folds.iter().map(|f| f.out_of_sample_score).sum::<Decimal>()
            / Decimal::from(folds.len() as u64)
    };

    Ok(WalkForwardReport {
        folds,
        robustness,
        oos_mean_score,
    })
}

/// `1 - CV` of each parameter's chosen values across folds, clamped to
/// [0, 1]. Stable choices score 1; erratic choices approach 0.
fn parameter_robustness(ranges: &[ParamRange], folds: &[FoldResult]) -> BTreeMap<String, Decimal> {
    let mut out = BTreeMap::new();
    for range in ranges {
        let values: Vec<f64> = folds
            .iter()
            .filter_map(|f| f.best_params.get(&range.name))
            .filter_map(|d| d.to_f64())
            .collect();
        if values.is_empty() {
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let robustness = if mean.abs() < f64::EPSILON {
            0.0
        } else {
            let var =
                values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
            let cv = var.sqrt() / mean.abs();
            (1.0 - cv).clamp(0.0, 1.0)
        };
        out.insert(
            range.name.clone(),
            Decimal::from_f64(robustness).unwrap_or(Decimal::ZERO),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn cartesian_product_covers_all_combinations() {
        let ranges = vec![
            ParamRange::new("a", vec![dec!(1), dec!(2)]),
            ParamRange::new("b", vec![dec!(10), dec!(20), dec!(30)]),
        ];
        let combos = cartesian_product(&ranges);
        assert_eq!(combos.len(), 6);
        assert!(combos
            .iter()
            .any(|c| c["a"] == dec!(2) && c["b"] == dec!(30)));
        // No duplicates.
        for i in 0..combos.len() {
            for j in (i + 1)..combos.len() {
                assert_ne!(combos[i], combos[j]);
            }
        }
    }

    #[tokio::test]
    async fn grid_search_ranks_best_first() {
        let ranges = vec![ParamRange::new(
            "x",
            vec![dec!(1), dec!(2), dec!(3), dec!(4), dec!(5)],
        )];
        // Objective peaks at x = 3.
        let results = grid_search(&ranges, |params| async move {
            let x = params["x"];
            Ok(-(x - dec!(3)) * (x - dec!(3)))
        })
        .await
        .unwrap();

        assert_eq!(results.len(), 5);
        assert_eq!(results[0].params["x"], dec!(3));
        assert_eq!(results[0].score, Decimal::ZERO);
        assert!(results.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn fold_windows_are_rolling_and_split() {
        let windows = fold_windows(100, 3, 0.75);
        assert_eq!(windows.len(), 3);
        for (is, oos) in &windows {
            assert!(is.end == oos.start);
            assert!(is.len() > oos.len()); // 75/25 split
            assert!(oos.end <= 100);
        }
        // Successive folds advance.
        assert!(windows[1].0.start > windows[0].0.start);
    }

    #[tokio::test]
    async fn walk_forward_reports_stable_choice_as_robust() {
        let ranges = vec![ParamRange::new("x", vec![dec!(1), dec!(2), dec!(3)])];
        // Objective independent of the data window: always picks x = 2.
        let report = walk_forward(120, &ranges, 4, 0.75, |params, _bars| async move {
            let x = params["x"];
            Ok(-(x - dec!(2)) * (x - dec!(2)))
        })
        .await
        .unwrap();

        assert_eq!(report.folds.len(), 4);
        for fold in &report.folds {
            assert_eq!(fold.best_params["x"], dec!(2));
        }
        assert_eq!(report.robustness["x"], Decimal::ONE);
        assert_eq!(report.oos_mean_score, Decimal::ZERO);
    }

    #[tokio::test]
    async fn walk_forward_rejects_undersized_history() {
        let ranges = vec![ParamRange::new("x", vec![dec!(1)])];
        let result = walk_forward(3, &ranges, 10, 0.75, |_p, _b| async { Ok(Decimal::ZERO) }).await;
        assert!(result.is_err());
    }
}
