//! Cross-cutting identifiers and enums shared by the orchestrator, stages, and API layer.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One row of a per-ticker daily trading CSV, as written by the process stage and read by the
/// index and liquidity stages. `value` is zero on days with no trade.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TickerDailyRow {
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Open")]
    pub open: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "Close")]
    pub close: f64,
    #[serde(rename = "Volume")]
    pub volume: f64,
    #[serde(rename = "Value")]
    pub value: f64,
}

/// Closed set of operation types the Manager knows how to plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    FullPipeline,
    ScrapeOnly,
    ProcessOnly,
    IndexOnly,
    LiquidityOnly,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::FullPipeline => "full_pipeline",
            OperationType::ScrapeOnly => "scrape_only",
            OperationType::ProcessOnly => "process_only",
            OperationType::IndexOnly => "index_only",
            OperationType::LiquidityOnly => "liquidity_only",
        }
    }

    /// Singleton types may have at most one live run at a time (§4.6).
    pub fn is_singleton(&self) -> bool {
        matches!(self, OperationType::FullPipeline)
    }

    /// Stage IDs selected by this operation type, in registration order.
    pub fn stage_ids(&self) -> &'static [&'static str] {
        match self {
            OperationType::FullPipeline => &["scrape", "process", "index", "liquidity"],
            OperationType::ScrapeOnly => &["scrape"],
            OperationType::ProcessOnly => &["process"],
            OperationType::IndexOnly => &["index"],
            OperationType::LiquidityOnly => &["liquidity"],
        }
    }
}

/// Kind tag for a produced artifact (§3 Artifact descriptor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    ReportExcel,
    TickerCsv,
    IndexesCsv,
    LiquidityScoresCsv,
    CalibrationReport,
}

/// An immutable record of one file produced by a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub kind: ArtifactKind,
    pub path: String,
    pub size: u64,
    pub sha256: String,
    pub producer_stage: String,
    pub schema_version: u32,
}

/// Lifecycle state of an Operation (§4.6 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl OperationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Succeeded | OperationState::Failed | OperationState::Canceled
        )
    }
}

/// Lifecycle state of a single stage within an operation (§3 Stage record).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Canceled,
}

impl StageState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StageState::Pending | StageState::Running)
    }
}

pub type OperationId = Uuid;
