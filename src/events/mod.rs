//! Event bus & WebSocket hub (C2).
//!
//! [`Event`] is the typed union published by the Manager and stages; [`Hub`] fans it out to
//! per-client bounded channels with drop-oldest overflow, heartbeats, and a replay ring.

mod hub;

pub use hub::{ClientFilter, ClientHandle, Hub, HubHandle, ResumeOutcome};

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The typed event union (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    StageStart,
    Progress {
        pct: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        meta: Option<Value>,
    },
    StageComplete,
    OperationComplete,
    Error {
        error_code: String,
        message: String,
    },
    Heartbeat,
    /// Not part of the wire union in §3, but published by the hub itself when a client's buffer
    /// drops events — one summary event per overflow window (§4.2, §8 boundary behavior).
    DroppedEvents {
        count: u64,
    },
}

/// An event on the bus. `seq` is assigned by the hub at publish time and is strictly increasing
/// per `op_id` (§3 invariants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub seq: u64,
    pub op_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_id: Option<String>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub trace_id: String,
}

impl Event {
    pub fn is_terminal_for_operation(&self) -> bool {
        matches!(self.kind, EventKind::OperationComplete)
    }
}

/// Per-operation strictly-increasing sequence counter. The hub owns one of these per operation id
/// and assigns sequence numbers at publish time, never at construction time, so ordering holds
/// even when multiple stages race to publish.
#[derive(Debug, Default)]
pub struct SequenceCounter(AtomicU64);

impl SequenceCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }
}
