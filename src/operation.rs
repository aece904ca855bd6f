//! Operation Manager (C6): one owning task per operation, driving the stage DAG to completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::events::{EventKind, HubHandle};
use crate::manifest::ManifestWriter;
use crate::queue::{JobOutcome, JobQueue, JobSubmission, Priority};
use crate::stages::{ProgressSink, StageContext, StageError, StageRegistry};
use crate::types::{ArtifactDescriptor, OperationId, OperationState, OperationType, StageState};

/// Default retention window an operation's status stays in memory after reaching a terminal
/// state (§4.6 step 6).
const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Grace window the Manager waits for a canceled stage to cooperate before marking it stranded
/// (§5 Cancellation & timeouts).
const CANCEL_GRACE: Duration = Duration::from_secs(10);

fn stage_deadline(stage_id: &str, config: &Value) -> Duration {
    let configured = config
        .get("deadlines")
        .and_then(|d| d.get(stage_id))
        .and_then(|v| v.as_u64());
    if let Some(secs) = configured {
        return Duration::from_secs(secs);
    }
    match stage_id {
        "scrape" => Duration::from_secs(30 * 60),
        "process" | "index" => Duration::from_secs(10 * 60),
        "liquidity" => Duration::from_secs(5 * 60),
        _ => Duration::from_secs(10 * 60),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageSnapshot {
    pub id: String,
    pub state: StageState,
    pub attempt: u32,
    pub last_progress_pct: u8,
    pub message: Option<String>,
    pub stranded: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub op_type: OperationType,
    pub state: OperationState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub stages: Vec<StageSnapshot>,
    pub artifacts: Vec<ArtifactDescriptor>,
    pub error: Option<String>,
}

struct OperationRecord {
    id: OperationId,
    op_type: OperationType,
    config: Value,
    state: OperationState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    stages: HashMap<String, StageSnapshot>,
    /// Live per-stage progress, written to by the stage's [`ProgressSink`] as it runs. Read back
    /// on every [`OperationRecord::snapshot`] call so `GET /operations/{id}` reflects in-flight
    /// progress instead of only the 0%/100% bookends recorded at stage start/finish.
    progress_cells: HashMap<String, Arc<AtomicU8>>,
    artifacts: Vec<ArtifactDescriptor>,
    error: Option<String>,
    cancel: CancellationToken,
}

impl OperationRecord {
    fn snapshot(&self) -> OperationSnapshot {
        let mut stages: Vec<StageSnapshot> = self
            .stages
            .values()
            .cloned()
            .map(|mut stage| {
                if let Some(cell) = self.progress_cells.get(&stage.id) {
                    stage.last_progress_pct = cell.load(Ordering::SeqCst);
                }
                stage
            })
            .collect();
        stages.sort_by(|a, b| a.id.cmp(&b.id));
        OperationSnapshot {
            id: self.id,
            op_type: self.op_type,
            state: self.state,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            stages,
            artifacts: self.artifacts.clone(),
            error: self.error.clone(),
        }
    }
}

#[derive(Default, Clone)]
pub struct OperationFilter {
    pub op_type: Option<OperationType>,
    pub state: Option<OperationState>,
}

pub struct OperationManager {
    registry: Arc<StageRegistry>,
    queue: Arc<JobQueue>,
    hub: HubHandle,
    workspace_root: PathBuf,
    operations: Arc<RwLock<HashMap<OperationId, Arc<RwLock<OperationRecord>>>>>,
    singleton_running: Arc<RwLock<Option<OperationId>>>,
    retention: Duration,
}

impl OperationManager {
    pub fn new(registry: Arc<StageRegistry>, queue: Arc<JobQueue>, hub: HubHandle, workspace_root: PathBuf) -> Self {
        Self {
            registry,
            queue,
            hub,
            workspace_root,
            operations: Arc::new(RwLock::new(HashMap::new())),
            singleton_running: Arc::new(RwLock::new(None)),
            retention: DEFAULT_RETENTION,
        }
    }

    pub fn start(self: Arc<Self>, op_type: OperationType, config: Value) -> Result<OperationId, AppError> {
        if op_type.is_singleton() {
            let mut guard = self.singleton_running.write();
            if guard.is_some() {
                return Err(AppError::OperationAlreadyRunning(op_type.as_str().to_string()));
            }
            let op_id = uuid::Uuid::new_v4();
            *guard = Some(op_id);
            drop(guard);
            self.spawn_operation(op_id, op_type, config);
            Ok(op_id)
        } else {
            let op_id = uuid::Uuid::new_v4();
            self.spawn_operation(op_id, op_type, config);
            Ok(op_id)
        }
    }

    /// Cancel every live operation's root token. Called from graceful shutdown (§4.10 C12); does
    /// not wait for the driver loops to observe cancellation, callers apply their own grace
    /// window.
    pub fn shutdown(&self) {
        let operations = self.operations.read();
        for record in operations.values() {
            record.read().cancel.cancel();
        }
    }

    pub fn stop(&self, op_id: OperationId) -> Result<(), AppError> {
        let operations = self.operations.read();
        let record = operations
            .get(&op_id)
            .ok_or(AppError::OperationNotFound(op_id))?;
        record.read().cancel.cancel();
        Ok(())
    }

    pub fn status(&self, op_id: OperationId) -> Result<OperationSnapshot, AppError> {
        let operations = self.operations.read();
        let record = operations
            .get(&op_id)
            .ok_or(AppError::OperationNotFound(op_id))?;
        let snapshot = record.read().snapshot();
        Ok(snapshot)
    }

    /// Replace the live config for an in-flight or pending operation. Takes effect for any stage
    /// not yet scheduled at the time of the call (§4.6: the driver loop re-reads it per stage);
    /// stages already running keep the config snapshot they started with.
    pub fn update_config(&self, op_id: OperationId, config: Value) -> Result<Value, AppError> {
        let operations = self.operations.read();
        let record = operations
            .get(&op_id)
            .ok_or(AppError::OperationNotFound(op_id))?;
        let mut guard = record.write();
        if guard.state.is_terminal() {
            return Err(AppError::Conflict(format!("operation {op_id} has already finished")));
        }
        guard.config = config.clone();
        Ok(config)
    }

    pub fn list(&self, filter: OperationFilter) -> Vec<OperationSnapshot> {
        let operations = self.operations.read();
        let mut snapshots: Vec<OperationSnapshot> = operations
            .values()
            .map(|r| r.read().snapshot())
            .filter(|s| filter.op_type.map(|t| t == s.op_type).unwrap_or(true))
            .filter(|s| filter.state.map(|st| st == s.state).unwrap_or(true))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }

    fn spawn_operation(self: Arc<Self>, op_id: OperationId, op_type: OperationType, config: Value) {
        let cancel = CancellationToken::new();
        let stage_ids = op_type.stage_ids();
        let stages = stage_ids
            .iter()
            .map(|id| {
                (
                    id.to_string(),
                    StageSnapshot {
                        id: id.to_string(),
                        state: StageState::Pending,
                        attempt: 0,
                        last_progress_pct: 0,
                        message: None,
                        stranded: false,
                    },
                )
            })
            .collect();

        let record = Arc::new(RwLock::new(OperationRecord {
            id: op_id,
            op_type,
            config: config.clone(),
            state: OperationState::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            stages,
            progress_cells: HashMap::new(),
            artifacts: Vec::new(),
            error: None,
            cancel: cancel.clone(),
        }));

        self.operations.write().insert(op_id, record.clone());

        let manager = self.clone();
        tokio::spawn(async move {
            manager.drive(op_id, op_type, config, record, cancel).await;
        });
    }

    async fn drive(
        self: Arc<Self>,
        op_id: OperationId,
        op_type: OperationType,
        config: Value,
        record: Arc<RwLock<OperationRecord>>,
        cancel: CancellationToken,
    ) {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let workspace = self.workspace_root.join(op_id.to_string());
        if let Err(e) = tokio::fs::create_dir_all(&workspace).await {
            self.finish(&record, op_type, OperationState::Failed, Some(e.to_string()));
            return;
        }

        let manifest = match ManifestWriter::create(&self.workspace_root, op_id) {
            Ok(m) => Arc::new(m),
            Err(e) => {
                self.finish(&record, op_type, OperationState::Failed, Some(e.to_string()));
                return;
            }
        };

        record.write().state = OperationState::Running;
        record.write().started_at = Some(Utc::now());

        let plan = match self.registry.resolve(op_type.stage_ids()) {
            Ok(p) => p,
            Err(e) => {
                self.finish(&record, op_type, OperationState::Failed, Some(e.to_string()));
                return;
            }
        };

        let mut remaining: HashMap<&str, usize> = HashMap::new();
        for stage in &plan {
            let deps_in_plan = stage
                .depends_on()
                .iter()
                .filter(|d| plan.iter().any(|s| s.id() == **d))
                .count();
            remaining.insert(stage.id(), deps_in_plan);
        }

        let mut pending: Vec<_> = plan.clone();
        let mut terminal_error: Option<String> = None;
        let mut skip_rest = false;

        while !pending.is_empty() {
            if cancel.is_cancelled() {
                for stage in &pending {
                    record.write().stages.insert(
                        stage.id().to_string(),
                        StageSnapshot {
                            id: stage.id().to_string(),
                            state: StageState::Canceled,
                            attempt: 0,
                            last_progress_pct: 0,
                            message: None,
                            stranded: false,
                        },
                    );
                }
                terminal_error.get_or_insert_with(|| "canceled".to_string());
                break;
            }

            let ready: Vec<_> = pending
                .iter()
                .filter(|s| remaining.get(s.id()).copied().unwrap_or(0) == 0)
                .cloned()
                .collect();

            if ready.is_empty() {
                // No stage is ready but some remain: a dependency failed upstream. Mark the rest
                // Skipped and stop.
                for stage in &pending {
                    record.write().stages.insert(
                        stage.id().to_string(),
                        StageSnapshot {
                            id: stage.id().to_string(),
                            state: StageState::Skipped,
                            attempt: 0,
                            last_progress_pct: 0,
                            message: None,
                            stranded: false,
                        },
                    );
                }
                break;
            }

            for stage in &ready {
                pending.retain(|s| s.id() != stage.id());
            }

            if skip_rest {
                for stage in &ready {
                    record.write().stages.insert(
                        stage.id().to_string(),
                        StageSnapshot {
                            id: stage.id().to_string(),
                            state: StageState::Skipped,
                            attempt: 0,
                            last_progress_pct: 0,
                            message: None,
                            stranded: false,
                        },
                    );
                }
                continue;
            }

            let mut handles = Vec::new();
            for stage in ready {
                let stage_id = stage.id();
                record.write().stages.insert(
                    stage_id.to_string(),
                    StageSnapshot {
                        id: stage_id.to_string(),
                        state: StageState::Running,
                        attempt: 1,
                        last_progress_pct: 0,
                        message: None,
                        stranded: false,
                    },
                );
                self.hub.publish(op_id, Some(stage_id.to_string()), EventKind::StageStart, trace_id.clone());
                let _ = manifest.append(serde_json::json!({"event": "stage_start", "stage": stage_id}));

                let live_config = record.read().config.clone();
                let ctx = StageContext {
                    operation_id: op_id,
                    workspace: workspace.clone(),
                    config: live_config.clone(),
                    cancel: cancel.child_token(),
                    trace_id: trace_id.clone(),
                    attempt: 1,
                };
                let progress = ProgressSink::new(self.hub.clone(), op_id, stage_id, trace_id.clone());
                record.write().progress_cells.insert(stage_id.to_string(), progress.shared_pct());
                let deadline = stage_deadline(stage_id, &live_config);
                let stage_cancel = ctx.cancel.clone();

                let stage_for_task = stage.clone();
                let ctx_for_task = ctx.clone();
                let progress_for_task = progress.clone();
                let factory: crate::queue::JobFactory = Arc::new(move || {
                    let stage = stage_for_task.clone();
                    let ctx = ctx_for_task.clone();
                    let progress = progress_for_task.clone();
                    Box::pin(async move {
                        stage.validate(&ctx).await?;
                        stage.execute(&ctx, progress).await.map(|_| ())
                    })
                });

                let recv = self.queue.submit(JobSubmission {
                    operation_id: op_id,
                    stage_id: stage_id.to_string(),
                    priority: Priority::Normal,
                    deadline: Some(deadline),
                    cancel: stage_cancel,
                    factory,
                });

                match recv {
                    Ok(recv) => handles.push((stage, recv)),
                    Err(_) => {
                        terminal_error.get_or_insert_with(|| "job queue is full".to_string());
                        skip_rest = true;
                    }
                }
            }

            for (stage, recv) in handles {
                let outcome = recv
                    .await
                    .unwrap_or(JobOutcome::Failed { attempt: 1, error: "job channel closed".to_string() });
                let stage_id = stage.id();
                let (state, attempt, message, failed) = match outcome {
                    JobOutcome::Succeeded { attempt } => (StageState::Succeeded, attempt, None, false),
                    JobOutcome::Canceled { attempt } => {
                        tokio::time::timeout(CANCEL_GRACE, tokio::time::sleep(Duration::ZERO)).await.ok();
                        (StageState::Canceled, attempt, None, false)
                    }
                    JobOutcome::Failed { attempt, error } => {
                        let optional = stage.optional();
                        if optional {
                            (StageState::Skipped, attempt, Some(error), false)
                        } else {
                            (StageState::Failed, attempt, Some(error), true)
                        }
                    }
                };

                let last_progress_pct = match state {
                    StageState::Succeeded => 100,
                    _ => record
                        .read()
                        .progress_cells
                        .get(stage_id)
                        .map(|cell| cell.load(Ordering::SeqCst))
                        .unwrap_or(0),
                };

                record.write().stages.insert(
                    stage_id.to_string(),
                    StageSnapshot {
                        id: stage_id.to_string(),
                        state,
                        attempt,
                        last_progress_pct,
                        message: message.clone(),
                        stranded: false,
                    },
                );
                self.hub.publish(op_id, Some(stage_id.to_string()), EventKind::StageComplete, trace_id.clone());
                let _ = manifest.append(serde_json::json!({"event": "stage_complete", "stage": stage_id, "state": format!("{state:?}")}));

                if failed {
                    terminal_error.get_or_insert(message.unwrap_or_else(|| "stage failed".to_string()));
                    skip_rest = true;
                }

                for remaining_stage in &pending {
                    if remaining_stage.depends_on().contains(&stage_id) {
                        if let Some(count) = remaining.get_mut(remaining_stage.id()) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
            }
        }

        let final_state = if cancel.is_cancelled() {
            OperationState::Canceled
        } else if terminal_error.is_some() {
            OperationState::Failed
        } else {
            OperationState::Succeeded
        };

        self.hub.publish(op_id, None, EventKind::OperationComplete, trace_id.clone());
        let _ = manifest.append(serde_json::json!({"event": "operation_complete", "state": format!("{final_state:?}")}));

        self.finish(&record, op_type, final_state, terminal_error);
    }

    fn finish(&self, record: &Arc<RwLock<OperationRecord>>, op_type: OperationType, state: OperationState, error: Option<String>) {
        {
            let mut guard = record.write();
            guard.state = state;
            guard.finished_at = Some(Utc::now());
            guard.error = error;
        }

        if op_type.is_singleton() {
            *self.singleton_running.write() = None;
        }

        let op_id = record.read().id;
        let operations = self.operations.clone();
        let retention = self.retention;
        tokio::spawn(async move {
            tokio::time::sleep(retention).await;
            operations.write().remove(&op_id);
        });
    }
}
