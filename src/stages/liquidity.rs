//! Liquidity stage (C7/C8): pure in-process stage. Reads per-ticker CSVs, runs the liquidity
//! calculator (or its offline calibration sub-mode) over the configured rolling window, and
//! writes `liquidity_scores_YYYY-MM-DD.csv`.

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::liquidity::{
    self, LiquidityParams, LiquidityScoreRow, LiquidityWeights, PenaltyKind, TickerSeries,
};
use crate::types::{ArtifactDescriptor, ArtifactKind, TickerDailyRow};

use super::{ProgressSink, Stage, StageContext, StageError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LiquidityConfig {
    #[serde(default = "default_window")]
    window: u32,
    #[serde(default)]
    penalty: ConfigPenalty,
    #[serde(default = "default_beta")]
    beta: f64,
    #[serde(default = "default_gamma")]
    gamma: f64,
    #[serde(default = "default_p_star")]
    p_star: f64,
    #[serde(default = "default_alpha")]
    alpha: f64,
    #[serde(default = "default_max_mult")]
    max_mult: f64,
    #[serde(default = "default_delta")]
    delta: f64,
    #[serde(default = "default_k")]
    k_lower: f64,
    #[serde(default = "default_k")]
    k_upper: f64,
    #[serde(default = "default_w_impact")]
    w_impact: f64,
    #[serde(default = "default_w_volume")]
    w_volume: f64,
    #[serde(default = "default_w_continuity")]
    w_continuity: f64,
    #[serde(default)]
    calibrate: bool,
}

#[derive(Debug, Default, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
enum ConfigPenalty {
    #[default]
    Piecewise,
    Exponential,
}

fn default_window() -> u32 {
    60
}
fn default_beta() -> f64 {
    0.75
}
fn default_gamma() -> f64 {
    1.5
}
fn default_p_star() -> f64 {
    0.5
}
fn default_alpha() -> f64 {
    2.0
}
fn default_max_mult() -> f64 {
    5.0
}
fn default_delta() -> f64 {
    2.0
}
fn default_k() -> f64 {
    3.0
}
fn default_w_impact() -> f64 {
    0.4
}
fn default_w_volume() -> f64 {
    0.3
}
fn default_w_continuity() -> f64 {
    0.3
}

impl LiquidityConfig {
    fn to_params(&self) -> LiquidityParams {
        LiquidityParams {
            window: self.window,
            penalty: match self.penalty {
                ConfigPenalty::Piecewise => PenaltyKind::Piecewise,
                ConfigPenalty::Exponential => PenaltyKind::Exponential,
            },
            beta: self.beta,
            gamma: self.gamma,
            p_star: self.p_star,
            alpha: self.alpha,
            max_mult: self.max_mult,
            delta: self.delta,
            k_lower: self.k_lower,
            k_upper: self.k_upper,
            weights: LiquidityWeights {
                w_impact: self.w_impact,
                w_volume: self.w_volume,
                w_continuity: self.w_continuity,
            },
        }
    }
}

#[derive(Default)]
pub struct LiquidityStage;

async fn load_series(tickers_dir: &std::path::Path, window: u32) -> Result<Vec<TickerSeries>, StageError> {
    let mut entries = tokio::fs::read_dir(tickers_dir).await?;
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) == Some("csv") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut series = Vec::with_capacity(paths.len());
    for path in paths {
        let symbol = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut reader = csv::Reader::from_path(&path)
            .map_err(|e| StageError::DataCorrupted(format!("{}: {e}", path.display())))?;
        let mut rows: Vec<TickerDailyRow> = Vec::new();
        for record in reader.deserialize::<TickerDailyRow>() {
            rows.push(record.map_err(|e| StageError::DataCorrupted(format!("{}: {e}", path.display())))?);
        }
        rows.sort_by_key(|r| r.date);
        let windowed = if rows.len() > window as usize {
            rows[rows.len() - window as usize..].to_vec()
        } else {
            rows
        };

        let records = windowed
            .into_iter()
            .map(|r| liquidity::DailyRecord {
                date: r.date,
                high: r.high,
                low: r.low,
                value: r.value,
                volume: r.volume,
                ret: if r.close > 0.0 && r.value > 0.0 {
                    (r.close - r.open) / r.open
                } else {
                    f64::NAN
                },
            })
            .collect();

        series.push(TickerSeries { symbol, records });
    }
    Ok(series)
}

#[async_trait]
impl Stage for LiquidityStage {
    fn id(&self) -> &'static str {
        "liquidity"
    }
    fn name(&self) -> &'static str {
        "Score ticker liquidity"
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &["process"]
    }
    fn produces(&self) -> &'static [ArtifactKind] {
        &[ArtifactKind::LiquidityScoresCsv, ArtifactKind::CalibrationReport]
    }
    fn optional(&self) -> bool {
        true
    }

    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError> {
        let cfg: LiquidityConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("liquidity config: {e}")))?;
        let weights = cfg.to_params().weights;
        weights.validate().map_err(StageError::Validation)?;

        let tickers_dir = ctx.workspace_path("tickers");
        if !tickers_dir.is_dir() {
            return Err(StageError::MissingArtifact(
                "tickers directory from the process stage is missing".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        progress: ProgressSink,
    ) -> Result<Vec<ArtifactDescriptor>, StageError> {
        let cfg: LiquidityConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("liquidity config: {e}")))?;
        let params = cfg.to_params();

        progress.report(10, "loading per-ticker histories");
        let tickers_dir = ctx.workspace_path("tickers");
        let series = load_series(&tickers_dir, params.window).await?;

        if cfg.calibrate {
            return self.run_calibration(ctx, progress, &series, &params).await;
        }

        progress.report(50, "scoring cross-section");
        let calculated_at = Utc::now();
        let (rows, errors): (Vec<LiquidityScoreRow>, _) =
            liquidity::compute_liquidity_scores(&series, &params, calculated_at);

        for err in &errors {
            tracing::warn!(symbol = %err.symbol, reason = %err.message, "liquidity score omitted for symbol");
        }

        let file_name = format!("liquidity_scores_{}.csv", calculated_at.format("%Y-%m-%d"));
        let out_path = ctx.workspace_path(&file_name);
        let tmp_path = ctx.workspace_path(format!("{file_name}.tmp"));
        {
            let mut writer = csv::Writer::from_path(&tmp_path)
                .map_err(|e| StageError::DataCorrupted(e.to_string()))?;
            for row in &rows {
                writer
                    .serialize(row)
                    .map_err(|e| StageError::DataCorrupted(e.to_string()))?;
            }
            writer.flush()?;
        }
        tokio::fs::rename(&tmp_path, &out_path).await?;

        let bytes = tokio::fs::read(&out_path).await?;
        let sha256 = hex::encode(Sha256::digest(&bytes));

        progress.report(100, format!("scored {} symbols, {} omitted", rows.len(), errors.len()));
        Ok(vec![ArtifactDescriptor {
            kind: ArtifactKind::LiquidityScoresCsv,
            path: out_path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
            sha256,
            producer_stage: self.id().to_string(),
            schema_version: 1,
        }])
    }
}

impl LiquidityStage {
    async fn run_calibration(
        &self,
        ctx: &StageContext,
        progress: ProgressSink,
        series: &[TickerSeries],
        base_params: &LiquidityParams,
    ) -> Result<Vec<ArtifactDescriptor>, StageError> {
        use crate::liquidity::calibration;

        progress.report(20, "grid searching penalty parameters");
        let grid = calibration::grid_search(series, base_params);

        let Some(grid) = grid else {
            return Err(StageError::Validation(
                "not enough tickers in the cross-section to calibrate".to_string(),
            ));
        };

        let calibrated_params = LiquidityParams {
            beta: grid.beta,
            gamma: grid.gamma,
            p_star: grid.p_star,
            delta: grid.delta,
            ..base_params.clone()
        };

        progress.report(60, "estimating composite weights via k-fold CV");
        let (rows, _errors) = liquidity::compute_liquidity_scores(series, &calibrated_params, Utc::now());
        let impact: Vec<f64> = rows.iter().map(|r| r.impact_score).collect();
        let volume: Vec<f64> = rows.iter().map(|r| r.volume_score).collect();
        let continuity: Vec<f64> = rows.iter().map(|r| r.continuity_score).collect();
        let cs_targets: Vec<f64> = series
            .iter()
            .map(|s| {
                let high: Vec<f64> = s.records.iter().map(|r| r.high).collect();
                let low: Vec<f64> = s.records.iter().map(|r| r.low).collect();
                let spreads = calibration::corwin_schultz_spreads(&high, &low);
                if spreads.is_empty() { 0.0 } else { spreads.iter().sum::<f64>() / spreads.len() as f64 }
            })
            .collect();

        let weight_estimate = calibration::estimate_weights(&impact, &volume, &continuity, &cs_targets, 5)
            .map_err(|e| StageError::Validation(e.to_string()))?;

        let report = serde_json::json!({
            "grid": {
                "beta": grid.beta,
                "gamma": grid.gamma,
                "p_star": grid.p_star,
                "delta": grid.delta,
                "spearman": grid.spearman,
            },
            "weights": weight_estimate.weights,
            "r_squared": weight_estimate.r_squared,
            "cv_r_squared": weight_estimate.cv_r_squared,
            "vif": weight_estimate.vif,
        });

        let out_path = ctx.workspace_path("calibration_report.json");
        let tmp_path = ctx.workspace_path("calibration_report.json.tmp");
        tokio::fs::write(&tmp_path, serde_json::to_vec_pretty(&report).expect("report always serializes")).await?;
        tokio::fs::rename(&tmp_path, &out_path).await?;

        let bytes = tokio::fs::read(&out_path).await?;
        let sha256 = hex::encode(Sha256::digest(&bytes));

        progress.report(100, "calibration complete");
        Ok(vec![ArtifactDescriptor {
            kind: ArtifactKind::CalibrationReport,
            path: out_path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
            sha256,
            producer_stage: self.id().to_string(),
            schema_version: 1,
        }])
    }
}
