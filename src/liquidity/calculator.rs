//! Liquidity calculator core (C8, §4.8).
//!
//! Pure, deterministic functions over in-memory series; the stage wrapper in
//! [`crate::stages::liquidity`] is responsible for reading CSVs and writing the output file.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::stats::{log_winsorize, mad, median, robust_zscore, zscore_to_percentile};

/// One calendar open-day observation for a ticker. `value` (price × volume) is `0.0` on days with
/// no trade; `ret` may be `NaN` on such days (no return is defined) but must be finite whenever
/// `value > 0.0`.
#[derive(Debug, Clone)]
pub struct DailyRecord {
    pub date: NaiveDate,
    pub high: f64,
    pub low: f64,
    pub value: f64,
    pub volume: f64,
    pub ret: f64,
}

impl DailyRecord {
    fn traded(&self) -> bool {
        self.value > 0.0
    }
}

#[derive(Debug, Clone)]
pub struct TickerSeries {
    pub symbol: String,
    /// Already windowed to the last `window` calendar open-days, chronological order.
    pub records: Vec<DailyRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyKind {
    Piecewise,
    Exponential,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityWeights {
    pub w_impact: f64,
    pub w_volume: f64,
    pub w_continuity: f64,
}

impl LiquidityWeights {
    pub fn validate(&self) -> Result<(), String> {
        let sum = self.w_impact + self.w_volume + self.w_continuity;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("liquidity weights must sum to 1.0, got {sum}"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityParams {
    pub window: u32,
    pub penalty: PenaltyKind,
    pub beta: f64,
    pub gamma: f64,
    pub p_star: f64,
    pub alpha: f64,
    pub max_mult: f64,
    pub delta: f64,
    pub k_lower: f64,
    pub k_upper: f64,
    pub weights: LiquidityWeights,
}

impl Default for LiquidityParams {
    fn default() -> Self {
        Self {
            window: 60,
            penalty: PenaltyKind::Piecewise,
            beta: 0.75,
            gamma: 1.5,
            p_star: 0.5,
            alpha: 2.0,
            max_mult: 5.0,
            delta: 2.0,
            k_lower: 3.0,
            k_upper: 3.0,
            weights: LiquidityWeights {
                w_impact: 0.4,
                w_volume: 0.3,
                w_continuity: 0.3,
            },
        }
    }
}

/// A symbol whose computation could not complete because of corrupted input (NaN/Inf on a traded
/// day). Reported in the manifest; the symbol's score is simply omitted from the output (§4.8
/// Numerical contract).
#[derive(Debug, Clone)]
pub struct SymbolError {
    pub symbol: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LiquidityScoreRow {
    #[serde(rename = "Symbol")]
    pub symbol: String,
    #[serde(rename = "LiquidityScore")]
    pub liquidity_score: f64,
    #[serde(rename = "ImpactScore")]
    pub impact_score: f64,
    #[serde(rename = "VolumeScore")]
    pub volume_score: f64,
    #[serde(rename = "ContinuityScore")]
    pub continuity_score: f64,
    #[serde(rename = "TradingDays")]
    pub trading_days: u32,
    #[serde(rename = "TotalDays")]
    pub total_days: u32,
    #[serde(rename = "InactivityRatio")]
    pub inactivity_ratio: f64,
    #[serde(rename = "AvgVolume")]
    pub avg_volume: f64,
    #[serde(rename = "AvgValue")]
    pub avg_value: f64,
    #[serde(rename = "ILLIQ_Raw")]
    pub illiq_raw: f64,
    #[serde(rename = "ILLIQ_Adj")]
    pub illiq_adj: f64,
    #[serde(rename = "PenaltyMult")]
    pub penalty_mult: f64,
    #[serde(rename = "VALINT")]
    pub valint: f64,
    #[serde(rename = "Continuity_NL")]
    pub continuity_nl: f64,
    #[serde(rename = "Window")]
    pub window: u32,
    #[serde(rename = "CalculatedAt")]
    pub calculated_at: DateTime<Utc>,
}

/// Intermediate per-ticker statistics, before cross-sectional scaling (§4.8 steps 1-7).
struct RawStats {
    symbol: String,
    p0: f64,
    illiq_raw: f64,
    illiq_adj: f64,
    penalty_mult: f64,
    valint: f64,
    continuity_nl: f64,
    avg_volume: f64,
    avg_value: f64,
    trading_days: u32,
    total_days: u32,
}

fn penalty_multiplier(p0: f64, params: &LiquidityParams) -> f64 {
    match params.penalty {
        PenaltyKind::Piecewise => {
            let raw = if p0 <= params.p_star {
                1.0 + params.beta * p0
            } else {
                1.0 + params.beta * params.p_star + params.gamma * (p0 - params.p_star)
            };
            raw.min(params.max_mult)
        }
        PenaltyKind::Exponential => (params.alpha * p0).exp().min(params.max_mult),
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Compute steps 1, 2, 6, 7 for one ticker. Returns `Err` (NaN/Inf propagation) when a traded
/// day's return isn't finite.
fn compute_raw_stats(series: &TickerSeries, params: &LiquidityParams) -> Result<RawStats, SymbolError> {
    let total_days = series.records.len() as u32;
    if total_days == 0 {
        return Err(SymbolError {
            symbol: series.symbol.clone(),
            message: "no records in window".to_string(),
        });
    }

    let traded: Vec<&DailyRecord> = series.records.iter().filter(|r| r.traded()).collect();
    let trading_days = traded.len() as u32;
    let inactive_days = total_days - trading_days;
    let p0 = inactive_days as f64 / total_days as f64;

    let mut illiq_terms = Vec::with_capacity(traded.len());
    for record in &traded {
        if !record.ret.is_finite() {
            return Err(SymbolError {
                symbol: series.symbol.clone(),
                message: format!(
                    "non-finite return {} on traded day {} (value={})",
                    record.ret, record.date, record.value
                ),
            });
        }
        illiq_terms.push(record.ret.abs() / record.value);
    }
    if illiq_terms.iter().any(|v| !v.is_finite()) {
        return Err(SymbolError {
            symbol: series.symbol.clone(),
            message: "non-finite ILLIQ term".to_string(),
        });
    }

    let illiq_raw = if illiq_terms.is_empty() {
        0.0
    } else {
        illiq_terms.iter().sum::<f64>() / illiq_terms.len() as f64
    };

    let penalty_mult = penalty_multiplier(p0, params);

    let total_value: f64 = series.records.iter().map(|r| r.value).sum();
    let valint = total_value / total_days as f64;

    let total_volume: f64 = series.records.iter().map(|r| r.volume).sum();
    let avg_volume = if trading_days > 0 {
        total_volume / trading_days as f64
    } else {
        0.0
    };
    let avg_value = if trading_days > 0 {
        traded.iter().map(|r| r.value).sum::<f64>() / trading_days as f64
    } else {
        0.0
    };

    let continuity_nl = (1.0 - p0).powf(params.delta);

    Ok(RawStats {
        symbol: series.symbol.clone(),
        p0,
        illiq_raw,
        illiq_adj: illiq_raw * penalty_mult, // overwritten after cross-sectional winsorization
        penalty_mult,
        valint,
        continuity_nl,
        avg_volume,
        avg_value,
        trading_days,
        total_days,
    })
}

/// Run the full per-window calculation across a cross-section of tickers (§4.8 all steps).
/// Returns the output rows (sorted by symbol for determinism) plus any symbols that failed due to
/// corrupted input.
pub fn compute_liquidity_scores(
    series: &[TickerSeries],
    params: &LiquidityParams,
    calculated_at: DateTime<Utc>,
) -> (Vec<LiquidityScoreRow>, Vec<SymbolError>) {
    params
        .weights
        .validate()
        .expect("caller validates weights before invoking the calculator");

    let mut raw_by_symbol = Vec::new();
    let mut errors = Vec::new();

    for ticker in series {
        match compute_raw_stats(ticker, params) {
            Ok(stats) => raw_by_symbol.push(stats),
            Err(e) => errors.push(e),
        }
    }

    if raw_by_symbol.is_empty() {
        return (Vec::new(), errors);
    }

    // Step 3: log-winsorize ILLIQ_raw across the surviving cross-section.
    const EPS: f64 = 1e-12;
    let logs: Vec<f64> = raw_by_symbol
        .iter()
        .map(|s| s.illiq_raw.max(EPS).ln())
        .collect();
    let log_med = median(&logs);
    let log_mad = mad(&logs);

    for stats in &mut raw_by_symbol {
        let winsorized = if log_mad.abs() < f64::EPSILON {
            stats.illiq_raw.max(EPS)
        } else {
            log_winsorize(stats.illiq_raw.max(EPS), log_med, log_mad, params.k_lower, params.k_upper)
        };
        stats.illiq_adj = winsorized * stats.penalty_mult;
    }

    // Step 8: cross-sectional robust scaling, mapped to 0-100 via the normal CDF.
    let illiq_adj_vals: Vec<f64> = raw_by_symbol.iter().map(|s| s.illiq_adj).collect();
    let valint_vals: Vec<f64> = raw_by_symbol.iter().map(|s| s.valint).collect();
    let cont_vals: Vec<f64> = raw_by_symbol.iter().map(|s| s.continuity_nl).collect();

    let illiq_med = median(&illiq_adj_vals);
    let illiq_mad = mad(&illiq_adj_vals);
    let valint_med = median(&valint_vals);
    let valint_mad = mad(&valint_vals);
    let cont_med = median(&cont_vals);
    let cont_mad = mad(&cont_vals);

    let mut rows: Vec<LiquidityScoreRow> = raw_by_symbol
        .into_iter()
        .map(|s| {
            // Lower ILLIQ_adj is better, so negate the z-score before mapping to a percentile.
            let impact_z = -robust_zscore(s.illiq_adj, illiq_med, illiq_mad);
            let volume_z = robust_zscore(s.valint, valint_med, valint_mad);
            let continuity_z = robust_zscore(s.continuity_nl, cont_med, cont_mad);

            let impact_score = zscore_to_percentile(impact_z);
            let volume_score = zscore_to_percentile(volume_z);
            let continuity_score = zscore_to_percentile(continuity_z);

            let liquidity_score = params.weights.w_impact * impact_score
                + params.weights.w_volume * volume_score
                + params.weights.w_continuity * continuity_score;

            LiquidityScoreRow {
                symbol: s.symbol,
                liquidity_score: round6(liquidity_score),
                impact_score: round6(impact_score),
                volume_score: round6(volume_score),
                continuity_score: round6(continuity_score),
                trading_days: s.trading_days,
                total_days: s.total_days,
                inactivity_ratio: round6(s.p0),
                avg_volume: round6(s.avg_volume),
                avg_value: round6(s.avg_value),
                illiq_raw: round6(s.illiq_raw),
                illiq_adj: round6(s.illiq_adj),
                penalty_mult: round6(s.penalty_mult),
                valint: round6(s.valint),
                continuity_nl: round6(s.continuity_nl),
                window: params.window,
                calculated_at,
            }
        })
        .collect();

    rows.sort_by(|a, b| a.symbol.cmp(&b.symbol));
    (rows, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn fixture_series() -> TickerSeries {
        // §8 S3: high=[10,11,12], low=[9,10,11], value=[100,0,200], returns=[0,NaN,0.09], W=3.
        let d = |day: u32| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        TickerSeries {
            symbol: "TASC".to_string(),
            records: vec![
                DailyRecord { date: d(1), high: 10.0, low: 9.0, value: 100.0, volume: 10.0, ret: 0.0 },
                DailyRecord { date: d(2), high: 11.0, low: 10.0, value: 0.0, volume: 0.0, ret: f64::NAN },
                DailyRecord { date: d(3), high: 12.0, low: 11.0, value: 200.0, volume: 15.0, ret: 0.09 },
            ],
        }
    }

    fn fixture_params() -> LiquidityParams {
        LiquidityParams {
            window: 3,
            penalty: PenaltyKind::Piecewise,
            beta: 0.75,
            gamma: 1.5,
            p_star: 0.5,
            alpha: 2.0,
            max_mult: 5.0,
            delta: 2.0,
            k_lower: 3.0,
            k_upper: 3.0,
            weights: LiquidityWeights {
                w_impact: 0.4,
                w_volume: 0.3,
                w_continuity: 0.3,
            },
        }
    }

    #[test]
    fn s3_fixture_matches_spec_intermediate_values() {
        let series = fixture_series();
        let params = fixture_params();
        let stats = compute_raw_stats(&series, &params).unwrap();

        assert!((stats.p0 - 1.0 / 3.0).abs() < 1e-9);
        assert!((stats.penalty_mult - 1.25).abs() < 1e-9); // 1 + 0.75 * (1/3)
        assert!((stats.valint - 100.0).abs() < 1e-9); // 300/3
        assert!((stats.continuity_nl - (2.0f64 / 3.0).powi(2)).abs() < 1e-9); // (2/3)^2
    }

    #[test]
    fn non_finite_return_on_traded_day_is_a_symbol_error() {
        let mut series = fixture_series();
        series.records[0].ret = f64::NAN; // day with value > 0 now has a bad return
        let params = fixture_params();
        assert!(compute_raw_stats(&series, &params).is_err());
    }

    #[test]
    fn no_trade_day_nan_return_does_not_error() {
        // The fixture's own no-trade day has NaN return by construction and must not error.
        let series = fixture_series();
        let params = fixture_params();
        assert!(compute_raw_stats(&series, &params).is_ok());
    }

    #[test]
    fn cross_section_scores_are_deterministic_and_bounded() {
        let mut series_a = fixture_series();
        series_a.symbol = "AAAA".to_string();
        let mut series_b = fixture_series();
        series_b.symbol = "BBBB".to_string();
        series_b.records[2].ret = 0.2; // different ILLIQ so the cross-section isn't degenerate

        let params = fixture_params();
        let (rows1, errors1) = compute_liquidity_scores(&[series_a.clone(), series_b.clone()], &params, Utc::now());
        let (rows2, errors2) = compute_liquidity_scores(&[series_a, series_b], &params, Utc::now());

        assert!(errors1.is_empty() && errors2.is_empty());
        assert_eq!(rows1.len(), 2);
        for row in &rows1 {
            assert!(row.liquidity_score >= 0.0 && row.liquidity_score <= 100.0);
        }
        assert_eq!(
            rows1.iter().map(|r| r.liquidity_score).collect::<Vec<_>>(),
            rows2.iter().map(|r| r.liquidity_score).collect::<Vec<_>>()
        );
    }

    #[test]
    fn corrupted_symbol_is_omitted_not_fatal() {
        let good = fixture_series();
        let mut bad = fixture_series();
        bad.symbol = "BAD".to_string();
        bad.records[0].ret = f64::INFINITY;

        let params = fixture_params();
        let (rows, errors) = compute_liquidity_scores(&[good, bad], &params, Utc::now());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "TASC");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].symbol, "BAD");
    }
}
