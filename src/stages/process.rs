//! Process stage (C7): spawns the external converter subprocess that turns the scraped Excel
//! reports into one CSV per ticker, and streams its page-level progress.

use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::types::{ArtifactDescriptor, ArtifactKind};

use super::{ProgressSink, Stage, StageContext, StageError};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessConfig {
    #[serde(default = "default_input_dir")]
    input_dir: String,
    #[serde(default = "default_output_dir")]
    output_dir: String,
    #[serde(default)]
    skip_existing: bool,
    #[serde(default = "default_command")]
    command: String,
    #[serde(default)]
    args: Vec<String>,
}

fn default_command() -> String {
    "isx-processor".to_string()
}

fn default_input_dir() -> String {
    "reports".to_string()
}

fn default_output_dir() -> String {
    "tickers".to_string()
}

#[derive(Default)]
pub struct ProcessStage;

#[async_trait]
impl Stage for ProcessStage {
    fn id(&self) -> &'static str {
        "process"
    }
    fn name(&self) -> &'static str {
        "Convert reports to per-ticker CSVs"
    }
    fn depends_on(&self) -> &'static [&'static str] {
        &["scrape"]
    }
    fn produces(&self) -> &'static [ArtifactKind] {
        &[ArtifactKind::TickerCsv]
    }

    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError> {
        let cfg: ProcessConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("process config: {e}")))?;
        let reports_dir = ctx.workspace_path(&cfg.input_dir);
        if !reports_dir.is_dir() {
            return Err(StageError::MissingArtifact(
                "reports directory from the scrape stage is missing".to_string(),
            ));
        }
        let has_files = std::fs::read_dir(&reports_dir)
            .map_err(StageError::Io)?
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().and_then(|x| x.to_str()) == Some("xlsx"));
        if !has_files {
            return Err(StageError::MissingArtifact(
                "no .xlsx reports found to process".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &StageContext,
        progress: ProgressSink,
    ) -> Result<Vec<ArtifactDescriptor>, StageError> {
        let cfg: ProcessConfig = serde_json::from_value(ctx.config.clone())
            .map_err(|e| StageError::Validation(format!("process config: {e}")))?;

        let reports_dir = ctx.workspace_path(&cfg.input_dir);
        let tickers_dir = ctx.workspace_path(&cfg.output_dir);
        tokio::fs::create_dir_all(&tickers_dir).await?;

        let mut command = Command::new(&cfg.command);
        command
            .arg("--reports")
            .arg(&reports_dir)
            .arg("--out")
            .arg(&tickers_dir)
            .args(&cfg.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if cfg.skip_existing {
            command.arg("--skip-existing");
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take().expect("piped stdout");
        let mut lines = BufReader::new(stdout).lines();

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
                    if let Some(rest) = line.strip_prefix("PAGE ") {
                        if let Some((current, total)) = rest.split_once('/') {
                            if let (Ok(current), Ok(total)) = (current.trim().parse::<u32>(), total.trim().parse::<u32>()) {
                                let pct = ((current as f64 / total.max(1) as f64) * 100.0).min(100.0) as u8;
                                progress.report(pct, format!("page {current}/{total}"));
                            }
                        }
                    } else if let Some(rest) = line.strip_prefix("ERROR ") {
                        tracing::warn!(detail = %rest, "process subprocess reported a page error");
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(StageError::SubprocessFailed(status.code().unwrap_or(-1)));
        }

        let artifacts = collect_csv_artifacts(&tickers_dir, self.id()).await?;
        progress.report(100, "process complete");
        Ok(artifacts)
    }
}

async fn collect_csv_artifacts(dir: &Path, producer: &str) -> Result<Vec<ArtifactDescriptor>, StageError> {
    let mut artifacts = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("csv") {
            continue;
        }
        let bytes = tokio::fs::read(&path).await?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        artifacts.push(ArtifactDescriptor {
            kind: ArtifactKind::TickerCsv,
            path: path.to_string_lossy().into_owned(),
            size: bytes.len() as u64,
            sha256,
            producer_stage: producer.to_string(),
            schema_version: 1,
        });
    }
    artifacts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(artifacts)
}
