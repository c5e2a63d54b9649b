use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorTag;

/// Terminal or in-flight status of an Execution (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Dlq,
}

/// Free-form lifecycle markers layered on top of `status` for observability
/// (`loop_guard_skipped`, `idempotent_replay`, `agent_gone`, `stale_agent`, ...).
pub type LifecycleState = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    pub tag: ErrorTag,
    pub message: String,
}

/// Write-once ledger entry (§3), persisted at terminal state by the
/// observability layer. One row per attempt that reaches a terminal or
/// running state — never mutated after being written with a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    #[serde(rename = "_id")]
    pub id: String,
    pub agent_id: String,
    pub document_id: String,
    pub status: ExecutionStatus,
    pub lifecycle_state: LifecycleState,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ExecutionError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl Execution {
    pub fn started(id: impl Into<String>, agent_id: impl Into<String>, document_id: impl Into<String>, attempt: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            agent_id: agent_id.into(),
            document_id: document_id.into(),
            status: ExecutionStatus::Running,
            lifecycle_state: "running".to_string(),
            attempt,
            started_at,
            completed_at: None,
            duration_ms: None,
            tokens_used: None,
            cost_usd: None,
            written: false,
            error: None,
            skip_reason: None,
        }
    }

    pub fn finish_completed(mut self, completed_at: DateTime<Utc>, written: bool, tokens_used: Option<u64>, cost_usd: Option<f64>) -> Self {
        self.status = ExecutionStatus::Completed;
        self.lifecycle_state = "completed".to_string();
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds().max(0) as u64);
        self.written = written;
        self.tokens_used = tokens_used;
        self.cost_usd = cost_usd;
        self
    }

    pub fn finish_skipped(mut self, completed_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Skipped;
        self.lifecycle_state = reason.into();
        self.skip_reason = Some(self.lifecycle_state.clone());
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds().max(0) as u64);
        self
    }

    pub fn finish_failed(mut self, completed_at: DateTime<Utc>, tag: ErrorTag, message: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Failed;
        self.lifecycle_state = "failed".to_string();
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds().max(0) as u64);
        self.error = Some(ExecutionError { tag, message: message.into() });
        self
    }

    pub fn finish_dlq(mut self, completed_at: DateTime<Utc>, tag: ErrorTag, message: impl Into<String>) -> Self {
        self.status = ExecutionStatus::Dlq;
        self.lifecycle_state = "dlq".to_string();
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - self.started_at).num_milliseconds().max(0) as u64);
        self.error = Some(ExecutionError { tag, message: message.into() });
        self
    }
}
