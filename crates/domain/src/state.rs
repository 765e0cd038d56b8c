//! Engine state and checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::thread::Message;
use crate::tool::{ToolCall, ToolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Interrupted,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Tool calls parked while the engine waits for a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingInterrupt {
    pub tool_calls: Vec<ToolCall>,
}

/// The engine's persisted state — everything needed to resume a turn.
///
/// Invariant: between cycles, `messages` ends with either a user message or
/// tool-result messages, never with an assistant message whose tool calls
/// have not been executed (unless `status == Interrupted`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub messages: Vec<Message>,
    /// Reason↔act cycles taken this turn.
    pub iteration: u32,
    pub status: RunStatus,
    pub total_tokens: u64,
    /// Present only when `status == Interrupted`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<PendingInterrupt>,
    /// Tool results accumulated during the current step.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_results: Vec<ToolResult>,
}

impl AgentState {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            iteration: 0,
            status: RunStatus::Running,
            total_tokens: 0,
            interrupt: None,
            tool_results: Vec::new(),
        }
    }
}

/// A durable snapshot of engine state after a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub thread_id: String,
    /// Monotonically increasing within a thread, starting at 0.
    pub step: u64,
    /// Previous checkpoint in the lineage; `None` at step 0. A value
    /// reference only — the parent may be swept while the child survives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub state: AgentState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        thread_id: impl Into<String>,
        step: u64,
        parent_id: Option<String>,
        state: AgentState,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            step,
            parent_id,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Summary of what changed between two checkpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointDiff {
    pub messages_added: i64,
    pub tokens_delta: i64,
    pub iteration_delta: i64,
    pub status_from: RunStatus,
    pub status_to: RunStatus,
}

impl CheckpointDiff {
    pub fn between(a: &Checkpoint, b: &Checkpoint) -> Self {
        Self {
            messages_added: b.state.messages.len() as i64 - a.state.messages.len() as i64,
            tokens_delta: b.state.total_tokens as i64 - a.state.total_tokens as i64,
            iteration_delta: b.state.iteration as i64 - a.state.iteration as i64,
            status_from: a.state.status,
            status_to: b.state.status,
        }
    }
}
