//! Scrape stage (C7): spawns the external collector subprocess that fetches ISX daily Excel
//! reports for a date range and streams its stdout for progress.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::types::{ArtifactDescriptor, ArtifactKind};

use super::{ProgressSink, Stage, StageContext, StageError};

/// Whether this run seeds the workspace from scratch or only fetches what's missing since the
/// last run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ScrapeMode {
    Initial,
    Incremental,
}

impl Default for ScrapeMode {
    fn default() -> Self {
        ScrapeMode::Incremental
    }
}

impl ScrapeMode {
    fn as_arg(&self) -> &'static str {
        match self {
            ScrapeMode::Initial => "initial",
            ScrapeMode::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ScrapeConfig {
    from_date: NaiveDate,
    to_date: NaiveDate,
    #[serde(default)]
    mode: ScrapeMode,
    #[serde(default = "default_max_retries")]
    max_retries: u32,
    /// Per-request timeout forwarded to the scraper subprocess, in seconds.
    #[serde(default = "default_request_timeout")]
    request_timeout: u64,
    #[serde(default = "default_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

fn default_command() -> String {
    "isx-scraper".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_request_timeout() -> u64 {
    30
}

/// ISX trades Sunday-Thursday; Friday and Saturday are the exchange weekend (§4.7).
fn is_isx_open_day(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Fri | Weekday::Sat)
}

fn expected_open_days(start: NaiveDate, end: NaiveDate) -> u32 {
    let mut count = 0;
    let mut day = start;
    while day <= end {
        if is_isx_open_day(day) {
            count += 1;
        }
        day = day.succ_opt().expect("date range is bounded");
    }
    count
}

#[derive(Default)]
pub struct ScrapeStage;

#[async_trait]
impl Stage for ScrapeStage {
    fn id(&self) -> &'static str {
        "scrape"
    }
    fn name(&self) -> &'static str {
        "Scrape ISX daily reports"
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }
    fn produces(&self) -> &'static [ArtifactKind] {
        &[ArtifactKind::ReportExcel]
    }

    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError> {
        let cfg: ScrapeConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("scrape config: {e}")))?;
        if cfg.from_date > cfg.to_date {
            return Err(StageError::Validation(
                "scrape.from_date must be <= scrape.to_date".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        progress: ProgressSink,
    ) -> Result<Vec<ArtifactDescriptor>, StageError> {
        let cfg: ScrapeConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("scrape config: {e}")))?;

        let reports_dir = ctx.workspace_path("reports");
        tokio::fs::create_dir_all(&reports_dir).await?;

        let expected = expected_open_days(cfg.from_date, cfg.to_date).max(1);

        let mut command = Command::new(&cfg.command);
        command
            .arg("--start")
            .arg(cfg.from_date.to_string())
            .arg("--end")
            .arg(cfg.to_date.to_string())
            .arg("--mode")
            .arg(cfg.mode.as_arg())
            .arg("--max-retries")
            .arg(cfg.max_retries.to_string())
            .arg("--request-timeout")
            .arg(cfg.request_timeout.to_string())
            .arg("--out")
            .arg(&reports_dir)
            .args(&cfg.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

        let mut fetched: Vec<PathBuf> = Vec::new();
        let mut completed: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(StageError::Canceled);
                }
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if let Some(rest) = line.strip_prefix("FETCHED ") {
                        completed += 1;
                        let path = reports_dir.join(rest.trim());
                        fetched.push(path);
                        let pct = ((completed as f64 / expected as f64) * 100.0).min(100.0) as u8;
                        progress.report(pct, format!("fetched {rest}"));
                    } else if let Some(rest) = line.strip_prefix("SKIPPED ") {
                        completed += 1;
                        let pct = ((completed as f64 / expected as f64) * 100.0).min(100.0) as u8;
                        progress.report(pct, format!("skipped {rest} (holiday or already present)"));
                    } else if let Some(rest) = line.strip_prefix("FAILED ") {
                        tracing::warn!(date = %rest, "scrape subprocess reported a failed fetch");
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(StageError::SubprocessFailed(status.code().unwrap_or(-1)));
        }

        let mut artifacts = Vec::with_capacity(fetched.len());
        for path in fetched {
            let bytes = tokio::fs::read(&path).await?;
            let sha256 = hex::encode(Sha256::digest(&bytes));
            artifacts.push(ArtifactDescriptor {
                kind: ArtifactKind::ReportExcel,
                path: path.to_string_lossy().into_owned(),
                size: bytes.len() as u64,
                sha256,
                producer_stage: self.id().to_string(),
                schema_version: 1,
            });
        }

        progress.report(100, "scrape complete");
        Ok(artifacts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn friday_and_saturday_are_closed() {
        let fri = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
        let sat = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        let sun = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        assert!(!is_isx_open_day(fri));
        assert!(!is_isx_open_day(sat));
        assert!(is_isx_open_day(sun));
    }

    #[test]
    fn expected_open_days_excludes_weekend() {
        // 2024-01-07 (Sun) .. 2024-01-13 (Sat): Sun,Mon,Tue,Wed,Thu open, Fri,Sat closed.
        let start = NaiveDate::from_ymd_opt(2024, 1, 7).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 13).unwrap();
        assert_eq!(expected_open_days(start, end), 5);
    }
}
