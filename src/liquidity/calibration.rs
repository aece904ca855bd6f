//! Offline calibration sub-mode (§4.8): grid search the penalty/continuity parameters against a
//! Corwin-Schultz spread proxy, then estimate the composite weights by k-fold CV regression
//! subject to a variance-inflation guard. Gated by a config flag; the default stage mode uses
//! supplied parameters and never calls into this module.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use super::calculator::{LiquidityParams, LiquidityWeights, PenaltyKind, TickerSeries};

/// Two-day overlapping Corwin-Schultz spread estimator from daily highs/lows. Negative estimates
/// (a known artifact of the closed-form solution) are floored at zero. Returns one spread per
/// adjacent day pair, so `len() == records.len() - 1`.
pub fn corwin_schultz_spreads(high: &[f64], low: &[f64]) -> Vec<f64> {
    assert_eq!(high.len(), low.len(), "high/low series must be the same length");
    const K: f64 = 3.0 - 2.0 * std::f64::consts::SQRT_2;

    let mut spreads = Vec::with_capacity(high.len().saturating_sub(1));
    for t in 0..high.len().saturating_sub(1) {
        let beta = (high[t] / low[t]).ln().powi(2) + (high[t + 1] / low[t + 1]).ln().powi(2);
        let h_max = high[t].max(high[t + 1]);
        let l_min = low[t].min(low[t + 1]);
        let gamma = (h_max / l_min).ln().powi(2);

        let alpha = (2.0 * beta).sqrt().mul_add(1.0, -beta.sqrt()) / K - (gamma / K).sqrt();
        let spread = 2.0 * (alpha.exp() - 1.0) / (1.0 + alpha.exp());
        spreads.push(spread.max(0.0));
    }
    spreads
}

fn mean_cs_spread(series: &TickerSeries) -> f64 {
    let high: Vec<f64> = series.records.iter().map(|r| r.high).collect();
    let low: Vec<f64> = series.records.iter().map(|r| r.low).collect();
    let spreads = corwin_schultz_spreads(&high, &low);
    if spreads.is_empty() {
        0.0
    } else {
        spreads.iter().sum::<f64>() / spreads.len() as f64
    }
}

fn rank(values: &[f64]) -> Vec<f64> {
    let mut indexed: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap());
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < indexed.len() {
        let mut j = i;
        while j + 1 < indexed.len() && indexed[j + 1].1 == indexed[i].1 {
            j += 1;
        }
        let avg_rank = ((i + j) as f64 / 2.0) + 1.0;
        for idx in indexed.iter().take(j + 1).skip(i) {
            ranks[idx.0] = avg_rank;
        }
        i = j + 1;
    }
    ranks
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..a.len() {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a.abs() < f64::EPSILON || var_b.abs() < f64::EPSILON {
        0.0
    } else {
        cov / (var_a.sqrt() * var_b.sqrt())
    }
}

/// Spearman rank correlation between two equal-length series.
pub fn spearman_correlation(a: &[f64], b: &[f64]) -> f64 {
    pearson(&rank(a), &rank(b))
}

fn frange(start: f64, stop: f64, step: f64) -> Vec<f64> {
    let mut out = Vec::new();
    let mut v = start;
    // Round to avoid float-step drift (e.g. 0.1 + 0.1 + 0.1 != 0.3) accumulating past `stop`.
    while v <= stop + 1e-9 {
        out.push((v * 1e6).round() / 1e6);
        v += step;
    }
    out
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridSearchResult {
    pub beta: f64,
    pub gamma: f64,
    pub p_star: f64,
    pub delta: f64,
    pub spearman: f64,
}

/// Grid search (§4.8, bounds β∈[0.5,1.0] step 0.05, γ∈[1.0,2.0] step 0.05, p*∈[0.3,0.6] step 0.02,
/// δ∈[1.5,2.5] step 0.05) maximizing Spearman correlation between ILLIQ_adj and the mean
/// Corwin-Schultz spread, holding the penalty shape fixed at whatever `base.penalty` already is.
pub fn grid_search(series: &[TickerSeries], base: &LiquidityParams) -> Option<GridSearchResult> {
    let cs_targets: Vec<f64> = series.iter().map(mean_cs_spread).collect();
    if cs_targets.len() < 3 {
        return None; // correlation is meaningless below a handful of points
    }

    let mut best: Option<GridSearchResult> = None;

    for beta in frange(0.5, 1.0, 0.05) {
        for gamma in frange(1.0, 2.0, 0.05) {
            for p_star in frange(0.3, 0.6, 0.02) {
                for delta in frange(1.5, 2.5, 0.05) {
                    let params = LiquidityParams {
                        beta,
                        gamma,
                        p_star,
                        delta,
                        penalty: base.penalty,
                        ..base.clone()
                    };
                    let (rows, errors) = super::compute_liquidity_scores(series, &params, chrono_epoch());
                    if !errors.is_empty() || rows.len() != cs_targets.len() {
                        continue;
                    }
                    let illiq: Vec<f64> = rows.iter().map(|r| r.illiq_adj).collect();
                    let corr = spearman_correlation(&illiq, &cs_targets);

                    let is_better = match &best {
                        None => true,
                        Some(b) => corr > b.spearman,
                    };
                    if is_better {
                        best = Some(GridSearchResult {
                            beta,
                            gamma,
                            p_star,
                            delta,
                            spearman: corr,
                        });
                    }
                }
            }
        }
    }

    best
}

/// Placeholder timestamp for calibration-internal scoring passes; calibration results are judged
/// by relative ranking, not wall-clock time, so any fixed instant is safe here.
fn chrono_epoch() -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from_timestamp(0, 0).expect("epoch is always a valid timestamp")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightEstimate {
    pub weights: LiquidityWeights,
    pub r_squared: f64,
    pub cv_r_squared: f64,
    pub vif: [f64; 3],
}

#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    #[error("not enough observations for {0}-fold cross-validation")]
    InsufficientData(usize),
    #[error("variance inflation factor {0:.2} exceeds the guard of 5.0")]
    MulticollinearityGuard(f64),
}

/// Ordinary least squares: target ~ intercept + impact + volume + continuity, via the normal
/// equations. `regressors` is row-major, one row per observation.
fn ols_fit(regressors: &[[f64; 3]], target: &[f64]) -> (DVector<f64>, f64) {
    let n = regressors.len();
    let mut design = DMatrix::<f64>::from_element(n, 4, 1.0);
    for (i, row) in regressors.iter().enumerate() {
        design[(i, 1)] = row[0];
        design[(i, 2)] = row[1];
        design[(i, 3)] = row[2];
    }
    let y = DVector::from_row_slice(target);

    let xtx = design.transpose() * &design;
    let xty = design.transpose() * &y;
    let coeffs = xtx
        .clone()
        .try_inverse()
        .map(|inv| inv * &xty)
        .unwrap_or_else(|| DVector::zeros(4));

    let predictions = &design * &coeffs;
    let residuals = &y - &predictions;
    let ss_res = residuals.dot(&residuals);
    let mean_y = y.mean();
    let ss_tot: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    let r2 = if ss_tot.abs() < f64::EPSILON { 0.0 } else { 1.0 - ss_res / ss_tot };

    (coeffs, r2)
}

/// Variance inflation factor for each of the three regressors: `1 / (1 - R^2)` of that regressor
/// against the other two.
fn variance_inflation_factors(regressors: &[[f64; 3]]) -> [f64; 3] {
    let n = regressors.len();
    let mut vifs = [0.0; 3];
    for target_col in 0..3 {
        let others: Vec<[f64; 2]> = regressors
            .iter()
            .map(|row| {
                let mut o = [0.0; 2];
                let mut k = 0;
                for (col, &v) in row.iter().enumerate() {
                    if col != target_col {
                        o[k] = v;
                        k += 1;
                    }
                }
                o
            })
            .collect();
        let y: Vec<f64> = regressors.iter().map(|row| row[target_col]).collect();

        let mut design = DMatrix::<f64>::from_element(n, 3, 1.0);
        for (i, row) in others.iter().enumerate() {
            design[(i, 1)] = row[0];
            design[(i, 2)] = row[1];
        }
        let y_vec = DVector::from_row_slice(&y);
        let xtx = design.transpose() * &design;
        let xty = design.transpose() * &y_vec;
        let coeffs = xtx.try_inverse().map(|inv| inv * &xty).unwrap_or_else(|| DVector::zeros(3));
        let predictions = &design * &coeffs;
        let residuals = &y_vec - &predictions;
        let ss_res = residuals.dot(&residuals);
        let mean_y = y_vec.mean();
        let ss_tot: f64 = y_vec.iter().map(|v| (v - mean_y).powi(2)).sum();
        let r2 = if ss_tot.abs() < f64::EPSILON { 0.0 } else { 1.0 - ss_res / ss_tot };
        vifs[target_col] = if (1.0 - r2).abs() < f64::EPSILON { f64::INFINITY } else { 1.0 / (1.0 - r2) };
    }
    vifs
}

/// Estimate composite weights via k-fold cross-validated OLS regression of the three component
/// scores against the Corwin-Schultz proxy, guarded by VIF ≤ 5 (§4.8).
pub fn estimate_weights(
    impact_scores: &[f64],
    volume_scores: &[f64],
    continuity_scores: &[f64],
    cs_targets: &[f64],
    k_folds: usize,
) -> Result<WeightEstimate, CalibrationError> {
    let n = impact_scores.len();
    if n < k_folds.max(2) * 2 {
        return Err(CalibrationError::InsufficientData(k_folds));
    }

    let regressors: Vec<[f64; 3]> = (0..n)
        .map(|i| [impact_scores[i], volume_scores[i], continuity_scores[i]])
        .collect();

    let vif = variance_inflation_factors(&regressors);
    if let Some(&worst) = vif.iter().filter(|v| v.is_finite()).reduce(|a, b| if a > b { a } else { b }) {
        if worst > 5.0 {
            return Err(CalibrationError::MulticollinearityGuard(worst));
        }
    }

    let (full_coeffs, full_r2) = ols_fit(&regressors, cs_targets);

    let fold_size = n / k_folds;
    let mut cv_r2_sum = 0.0;
    for fold in 0..k_folds {
        let test_start = fold * fold_size;
        let test_end = if fold == k_folds - 1 { n } else { test_start + fold_size };

        let train_regressors: Vec<[f64; 3]> = regressors
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < test_start || *i >= test_end)
            .map(|(_, r)| *r)
            .collect();
        let train_targets: Vec<f64> = cs_targets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < test_start || *i >= test_end)
            .map(|(_, v)| *v)
            .collect();

        let (coeffs, _) = ols_fit(&train_regressors, &train_targets);

        let test_targets = &cs_targets[test_start..test_end];
        let mut ss_res = 0.0;
        let mut ss_tot = 0.0;
        let mean_test = test_targets.iter().sum::<f64>() / test_targets.len() as f64;
        for i in test_start..test_end {
            let pred = coeffs[0] + coeffs[1] * regressors[i][0] + coeffs[2] * regressors[i][1] + coeffs[3] * regressors[i][2];
            ss_res += (cs_targets[i] - pred).powi(2);
            ss_tot += (cs_targets[i] - mean_test).powi(2);
        }
        let fold_r2 = if ss_tot.abs() < f64::EPSILON { 0.0 } else { 1.0 - ss_res / ss_tot };
        cv_r2_sum += fold_r2;
    }

    // Weights are the (possibly negative) regression slopes, renormalized to sum to 1 and clamped
    // to be non-negative — a negative coefficient means that component is inversely related to
    // the proxy and gets a floor of zero rather than pulling other weights negative.
    let raw = [full_coeffs[1].max(0.0), full_coeffs[2].max(0.0), full_coeffs[3].max(0.0)];
    let sum: f64 = raw.iter().sum();
    let weights = if sum.abs() < f64::EPSILON {
        LiquidityWeights { w_impact: 1.0 / 3.0, w_volume: 1.0 / 3.0, w_continuity: 1.0 / 3.0 }
    } else {
        LiquidityWeights {
            w_impact: raw[0] / sum,
            w_volume: raw[1] / sum,
            w_continuity: raw[2] / sum,
        }
    };

    Ok(WeightEstimate {
        weights,
        r_squared: full_r2,
        cv_r_squared: cv_r2_sum / k_folds as f64,
        vif,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn series(symbol: &str, highs: &[f64], lows: &[f64]) -> TickerSeries {
        let d = |day: u32| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let records = highs
            .iter()
            .zip(lows)
            .enumerate()
            .map(|(i, (&h, &l))| super::super::calculator::DailyRecord {
                date: d(i as u32 + 1),
                high: h,
                low: l,
                value: 100.0,
                volume: 10.0,
                ret: 0.01,
            })
            .collect();
        TickerSeries { symbol: symbol.to_string(), records }
    }

    #[test]
    fn corwin_schultz_spread_is_nonnegative() {
        let spreads = corwin_schultz_spreads(&[10.0, 10.5, 11.0], &[9.0, 9.2, 9.5]);
        assert_eq!(spreads.len(), 2);
        for s in spreads {
            assert!(s >= 0.0);
        }
    }

    #[test]
    fn spearman_correlation_of_identical_series_is_one() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((spearman_correlation(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spearman_correlation_of_inverted_series_is_minus_one() {
        let a = [1.0, 2.0, 3.0, 4.0, 5.0];
        let b = [5.0, 4.0, 3.0, 2.0, 1.0];
        assert!((spearman_correlation(&a, &b) + 1.0).abs() < 1e-9);
    }

    #[test]
    fn grid_search_returns_none_with_too_few_tickers() {
        let a = series("AAAA", &[10.0, 10.5], &[9.0, 9.2]);
        let b = series("BBBB", &[20.0, 20.5], &[19.0, 19.2]);
        let base = LiquidityParams { penalty: PenaltyKind::Piecewise, ..Default::default() };
        assert!(grid_search(&[a, b], &base).is_none());
    }

    #[test]
    fn estimate_weights_rejects_high_vif() {
        // impact and volume move in lockstep -> perfectly collinear -> VIF blows up.
        let impact: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let volume = impact.clone();
        let continuity: Vec<f64> = (0..20).map(|i| (i as f64 * 1.7) % 13.0).collect();
        let targets: Vec<f64> = (0..20).map(|i| i as f64 * 0.5).collect();

        let result = estimate_weights(&impact, &volume, &continuity, &targets, 4);
        assert!(matches!(result, Err(CalibrationError::MulticollinearityGuard(_))));
    }
}
