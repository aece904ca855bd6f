//! Robust statistics used by the liquidity calculator (§4.8 steps 3 and 8).
//!
//! Batch median/MAD rather than an online Welford accumulator, since the calculator has its whole
//! cross-sectional window available up front instead of a streaming series.

/// Population median of a slice. Panics on empty input; callers are expected to filter first.
pub fn median(values: &[f64]) -> f64 {
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    }
}

/// Median absolute deviation, scaled by the standard consistency constant (1.4826) so it's
/// comparable to a standard deviation under normality.
pub fn mad(values: &[f64]) -> f64 {
    let med = median(values);
    let deviations: Vec<f64> = values.iter().map(|v| (v - med).abs()).collect();
    1.4826 * median(&deviations)
}

/// Clamp `value` to `[center - k_lower * scale, center + k_upper * scale]`.
pub fn winsorize_clamp(value: f64, center: f64, scale: f64, k_lower: f64, k_upper: f64) -> f64 {
    let lower = center - k_lower * scale;
    let upper = center + k_upper * scale;
    value.max(lower).min(upper)
}

/// Log-space winsorization (§4.8 step 3): clamp `ln(value)` against the median/MAD of the
/// log-transformed cross-section, then back-transform with `exp`.
///
/// `value` must be strictly positive (ILLIQ is a ratio of absolute return to value traded, always
/// non-negative; zero is treated as a degenerate case by the caller before this is reached).
pub fn log_winsorize(value: f64, log_median: f64, log_mad: f64, k_lower: f64, k_upper: f64) -> f64 {
    let log_value = value.ln();
    let clamped = winsorize_clamp(log_value, log_median, log_mad, k_lower, k_upper);
    clamped.exp()
}

/// Robust z-score: `(value - median) / mad`. Returns 0.0 when `mad` is zero (degenerate
/// cross-section, e.g. a single ticker) rather than producing `Inf`.
pub fn robust_zscore(value: f64, med: f64, scale: f64) -> f64 {
    if scale.abs() < f64::EPSILON {
        0.0
    } else {
        (value - med) / scale
    }
}

/// Map a robust z-score to a 0-100 percentile score via the standard normal CDF (§4.8 step 8).
/// `statrs` backs the CDF.
pub fn zscore_to_percentile(z: f64) -> f64 {
    use statrs::distribution::{ContinuousCDF, Normal};
    let normal = Normal::new(0.0, 1.0).expect("standard normal is always valid");
    normal.cdf(z) * 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn median_of_odd_length() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
    }

    #[test]
    fn median_of_even_length() {
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }

    #[test]
    fn mad_is_zero_for_constant_series() {
        assert_eq!(mad(&[5.0, 5.0, 5.0]), 0.0);
    }

    #[test]
    fn zscore_is_zero_when_scale_is_zero() {
        assert_eq!(robust_zscore(10.0, 5.0, 0.0), 0.0);
    }

    #[test]
    fn percentile_of_zero_zscore_is_fifty() {
        let pct = zscore_to_percentile(0.0);
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn winsorize_clamps_outliers() {
        let clamped = winsorize_clamp(100.0, 0.0, 1.0, 2.0, 2.0);
        assert_eq!(clamped, 2.0);
        let unclamped = winsorize_clamp(1.0, 0.0, 1.0, 2.0, 2.0);
        assert_eq!(unclamped, 1.0);
    }
}
