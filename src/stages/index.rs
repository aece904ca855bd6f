//! Index stage (C7): pure in-process stage. Reads every per-ticker CSV the process stage
//! produced and writes an aggregate `indexes.csv` with one row per date.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::types::{ArtifactDescriptor, ArtifactKind, TickerDailyRow};

use super::{ProgressSink, Stage, StageContext, StageError};

#[derive(Debug, Default, Clone)]
struct DailyAccumulator {
    total_value: f64,
    total_volume: f64,
    close_sum: f64,
    ticker_count: u32,
}

#[derive(Debug, Serialize)]
struct IndexRow {
    #[serde(rename = "Date")]
    date: NaiveDate,
    #[serde(rename = "IndexValue")]
    index_value: f64,
    #[serde(rename = "TotalValue")]
    total_value: f64,
    #[serde(rename = "TotalVolume")]
    total_volume: f64,
    #[serde(rename = "TickerCount")]
    ticker_count: u32,
    #[serde(rename = "CalculatedAt")]
    calculated_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct IndexStage;

#[async_trait]
impl Stage for IndexStage {
    fn id(&self) -> &'static str {
        "index"
    }
    fn name(&self) -> &'static str {
        "Aggregate per-date index values"
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &["process"]
    }
    fn produces(&self) -> &'static [ArtifactKind] {
        &[ArtifactKind::IndexesCsv]
    }

    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError> {
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
        let tickers_dir = ctx.workspace_path("tickers");
        let mut csv_paths = Vec::new();
        let mut entries = tokio::fs::read_dir(&tickers_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("csv") {
                csv_paths.push(path);
            }
        }
        csv_paths.sort();

        let mut by_date: BTreeMap<NaiveDate, DailyAccumulator> = BTreeMap::new();
        let total = csv_paths.len().max(1);

        for (i, path) in csv_paths.iter().enumerate() {
            if ctx.cancel.is_cancelled() {
                return Err(StageError::Canceled);
            }
            let mut reader = csv::Reader::from_path(path)
                .map_err(|e| StageError::DataCorrupted(format!("{}: {e}", path.display())))?;
            for record in reader.deserialize::<TickerDailyRow>() {
                let row = record
                    .map_err(|e| StageError::DataCorrupted(format!("{}: {e}", path.display())))?;
                let entry = by_date.entry(row.date).or_default();
                entry.total_value += row.value;
                entry.total_volume += row.volume;
                if row.value > 0.0 {
                    entry.close_sum += row.close;
                    entry.ticker_count += 1;
                }
            }
            let pct = (((i + 1) as f64 / total as f64) * 100.0).min(100.0) as u8;
            progress.report(pct, format!("indexed {}", path.display()));
        }

        let now = Utc::now();
        let rows: Vec<IndexRow> = by_date
            .into_iter()
            .map(|(date, acc)| {
                let index_value = if acc.ticker_count > 0 {
                    acc.close_sum / acc.ticker_count as f64
                } else {
                    0.0
                };
                IndexRow {
                    date,
                    index_value,
                    total_value: acc.total_value,
                    total_volume: acc.total_volume,
                    ticker_count: acc.ticker_count,
                    calculated_at: now,
                }
            })
            .collect();

        let out_path = ctx.workspace_path("indexes.csv");
        let tmp_path = ctx.workspace_path("indexes.csv.tmp");
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

        progress.report(100, "index complete");
        Ok(vec![ArtifactDescriptor {
            kind: ArtifactKind::IndexesCsv,
            path: out_path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
            sha256,
            producer_stage: self.id().to_string(),
            schema_version: 1,
        }])
    }
}
