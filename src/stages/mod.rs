//! Stage registry & dependency resolver (C4), plus the built-in stages (C7).

pub mod index;
pub mod liquidity;
pub mod process;
pub mod scrape;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::ErrorKind;
use crate::events::HubHandle;
use crate::types::{ArtifactDescriptor, ArtifactKind, OperationId};

/// Typed error a stage returns. Distinct from [`crate::error::AppError`] so stage authors only
/// ever construct this narrow type; the Manager wraps it with operation context at the boundary.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("missing dependency artifact: {0}")]
    MissingArtifact(String),
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("data corrupted: {0}")]
    DataCorrupted(String),
    #[error("network: {0}")]
    Network(String),
    #[error("timed out")]
    Timeout,
    #[error("canceled")]
    Canceled,
    #[error("subprocess exited with status {0}")]
    SubprocessFailed(i32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) => ErrorKind::Validation,
            StageError::MissingArtifact(_) => ErrorKind::NotFound,
            StageError::Permission(_) => ErrorKind::Forbidden,
            StageError::DataCorrupted(_) => ErrorKind::DataCorrupted,
            StageError::Network(_) => ErrorKind::ServiceUnavailable,
            StageError::Timeout => ErrorKind::Timeout,
            StageError::Canceled => ErrorKind::Internal,
            StageError::SubprocessFailed(_) => ErrorKind::Internal,
            StageError::Io(e) => match e.kind() {
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
                std::io::ErrorKind::PermissionDenied => ErrorKind::Forbidden,
                _ => ErrorKind::Internal,
            },
        }
    }

    /// §7 retry classification: network, timeout, and rate-limit-flavored errors retry.
    pub fn retryable(&self) -> bool {
        matches!(self, StageError::Network(_) | StageError::Timeout) || self.kind().is_retryable()
    }
}

/// Immutable, read-only context a stage receives for one attempt. Never exposes mutable access to
/// sibling stage state (§3 Ownership).
#[derive(Clone)]
pub struct StageContext {
    pub operation_id: OperationId,
    pub workspace: PathBuf,
    pub config: Value,
    pub cancel: CancellationToken,
    pub trace_id: String,
    pub attempt: u32,
}

impl StageContext {
    pub fn workspace_path(&self, relative: impl AsRef< std::path::Path>) -> PathBuf {
        self.workspace.join(relative)
    }
}

/// Write-only progress sink handed to a stage. Sequencing and hub delivery are the hub's
/// responsibility (§9): a stage can only ever push forward percent and a message.
#[derive(Clone)]
pub struct ProgressSink {
    hub: HubHandle,
    operation_id: OperationId,
    stage_id: &'static str,
    trace_id: String,
    last_pct: Arc<std::sync::atomic::AtomicU8>,
}

impl ProgressSink {
    pub fn new(hub: HubHandle, operation_id: OperationId, stage_id: &'static str, trace_id: String) -> Self {
        Self {
            hub,
            operation_id,
            stage_id,
            trace_id,
            last_pct: Arc::new(std::sync::atomic::AtomicU8::new(0)),
        }
    }

    /// Report progress. `pct` is clamped to be monotonically non-decreasing within the stage
    /// (§3 invariant) — a stage that reports a lower value than before is a programming error we
    /// silently correct rather than propagate.
    pub fn report(&self, pct: u8, message: impl Into<String>) {
        let pct = pct.min(100);
        let clamped = self
            .last_pct
            .fetch_max(pct, std::sync::atomic::Ordering::SeqCst)
            .max(pct);
        self.hub.publish(
            self.operation_id,
            Some(self.stage_id.to_string()),
            crate::events::EventKind::Progress {
                pct: clamped,
                message: Some(message.into()),
                meta: None,
            },
            self.trace_id.clone(),
        );
    }

    /// A shared handle onto the last-reported percent, for callers that need to read live
    /// progress back (the Operation Manager's snapshot) without a separate event subscription.
    pub fn shared_pct(&self) -> Arc<std::sync::atomic::AtomicU8> {
        self.last_pct.clone()
    }
}

/// A unit of pipeline work with declared dependencies and outputs (§4.4).
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn depends_on(&self) -> &'static [&'static str];
    fn produces(&self) -> &'static [ArtifactKind];
    /// Optional stages don't fail the operation on a non-retryable error (§4.6 step 4).
    fn optional(&self) -> bool {
        false
    }

    async fn validate(&self, ctx: &StageContext) -> Result<(), StageError>;
    async fn execute(
        &self,
        ctx: &StageContext,
        progress: ProgressSink,
    ) -> Result<Vec<ArtifactDescriptor>, StageError>;
}

/// Registers stages, validates the declared graph is a DAG, and produces a stable topological
/// order.
pub struct StageRegistry {
    stages: Vec<Arc<dyn Stage>>,
    index: HashMap<&'static str, usize>,
}

impl StageRegistry {
    pub fn builder() -> StageRegistryBuilder {
        StageRegistryBuilder::default()
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Stage>> {
        self.index.get(id).map(|&i| self.stages[i].clone())
    }

    pub fn all(&self) -> &[Arc<dyn Stage>] {
        &self.stages
    }

    /// Topologically order the given subset of stage ids. Ties are broken by registration index,
    /// so the order is stable across runs for the same set (§4.4).
    pub fn resolve(&self, wanted: &[&str]) -> Result<Vec<Arc<dyn Stage>>, StageError> {
        let wanted_set: HashSet<&str> = wanted.iter().copied().collect();
        for id in &wanted_set {
            if !self.index.contains_key(id) {
                return Err(StageError::Validation(format!("unknown stage '{id}'")));
            }
        }

        let mut in_degree: HashMap<&'static str, usize> = HashMap::new();
        let mut dependents: HashMap<&'static str, Vec<&'static str>> = HashMap::new();

        for stage in &self.stages {
            if !wanted_set.contains(stage.id()) {
                continue;
            }
            let deps_in_plan: Vec<&'static str> = stage
                .depends_on()
                .iter()
                .copied()
                .filter(|d| wanted_set.contains(d))
                .collect();
            in_degree.insert(stage.id(), deps_in_plan.len());
            for dep in deps_in_plan {
                dependents.entry(dep).or_default().push(stage.id());
            }
        }

        // Kahn's algorithm, seeded with zero-in-degree stages in registration order for
        // determinism.
        let mut ready: Vec<&'static str> = self
            .stages
            .iter()
            .filter(|s| wanted_set.contains(s.id()) && in_degree.get(s.id()).copied() == Some(0))
            .map(|s| s.id())
            .collect();

        let mut order = Vec::new();
        while !ready.is_empty() {
            ready.sort_by_key(|id| self.index[id]);
            let next = ready.remove(0);
            order.push(next);
            if let Some(deps) = dependents.get(next) {
                for &dependent in deps {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent);
                    }
                }
            }
        }

        if order.len() != wanted_set.len() {
            return Err(StageError::Validation(
                "stage graph contains a cycle or unreachable dependency outside the plan".to_string(),
            ));
        }

        Ok(order.into_iter().map(|id| self.get(id).unwrap()).collect())
    }
}

#[derive(Default)]
pub struct StageRegistryBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageRegistryBuilder {
    pub fn register(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<StageRegistry, StageError> {
        let mut index = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if index.insert(stage.id(), i).is_some() {
                return Err(StageError::Validation(format!(
                    "duplicate stage id '{}'",
                    stage.id()
                )));
            }
        }
        for stage in &self.stages {
            for dep in stage.depends_on() {
                if !index.contains_key(dep) {
                    return Err(StageError::Validation(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.id(),
                        dep
                    )));
                }
            }
        }

        let registry = StageRegistry {
            stages: self.stages,
            index,
        };

        // Cycle check over the full graph (not a subset plan).
        let all_ids: Vec<&str> = registry.stages.iter().map(|s| s.id()).collect();
        registry.resolve(&all_ids)?;

        Ok(registry)
    }
}

pub fn default_registry() -> StageRegistry {
    StageRegistry::builder()
        .register(Arc::new(scrape::ScrapeStage::default()))
        .register(Arc::new(process::ProcessStage::default()))
        .register(Arc::new(index::IndexStage::default()))
        .register(Arc::new(liquidity::LiquidityStage::default()))
        .build()
        .expect("built-in stage graph is a valid DAG")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop(&'static str, &'static [&'static str]);

    #[async_trait]
    impl Stage for Noop {
        fn id(&self) -> &'static str {
            self.0
        }
        fn name(&self) -> &'static str {
            self.0
        }
        fn depends_on(&self) -> &'static [&'static str] {
            self.1
        }
        fn produces(&self) -> &'static [ArtifactKind] {
            &[]
        }
        async fn validate(&self, _ctx: &StageContext) -> Result<(), StageError> {
            Ok(())
        }
        async fn execute(
            &self,
            _ctx: &StageContext,
            _progress: ProgressSink,
        ) -> Result<Vec<ArtifactDescriptor>, StageError> {
            Ok(vec![])
        }
    }

    #[test]
    fn resolver_orders_by_dependency_then_registration_index() {
        let registry = StageRegistry::builder()
            .register(Arc::new(Noop("a", &[])))
            .register(Arc::new(Noop("b", &["a"])))
            .register(Arc::new(Noop("c", &["a"])))
            .build()
            .unwrap();

        let order = registry.resolve(&["c", "b", "a"]).unwrap();
        let ids: Vec<_> = order.iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[test]
    fn cycle_is_rejected_at_registration() {
        struct Cyclic;
        let result = StageRegistry::builder()
            .register(Arc::new(Noop("x", &["y"])))
            .register(Arc::new(Noop("y", &["x"])))
            .build();
        let _ = Cyclic;
        assert!(result.is_err());
    }

    #[test]
    fn unknown_dependency_rejected() {
        let result = StageRegistry::builder()
            .register(Arc::new(Noop("a", &["ghost"])))
            .build();
        assert!(result.is_err());
    }
}
