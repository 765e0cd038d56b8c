//! Turn event envelope — the typed stream a turn yields to its caller.
//!
//! Transport (SSE, WebSocket, callback) is the embedding application's
//! concern; the core only writes these to a channel.

use serde::Serialize;

use crate::thread::Message;
use crate::tool::ToolCall;

/// Terminal error taxonomy surfaced via [`TurnEvent::Error`].
///
/// `tool_error` is deliberately absent: a failed tool surfaces as a
/// `tool_result` event and the loop continues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    PermissionDenied,
    NotFound,
    NoKeyConfigured,
    QuotaExceeded,
    IterationLimit,
    SandboxUnavailable,
    ModelError,
    Cancelled,
    Conflict,
    InternalError,
}

/// Events emitted during a single agent turn.
///
/// A turn emits at most one `session_created`, then engine events in program
/// order, and terminates with exactly one of `done`, `interrupt`, `error`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum TurnEvent {
    #[serde(rename = "session_created")]
    SessionCreated { thread_id: String },

    /// Incremental assistant text (streaming mode only).
    #[serde(rename = "token_delta")]
    TokenDelta { text: String },

    /// The model is invoking a tool.
    #[serde(rename = "tool_call")]
    ToolCallEvent {
        id: String,
        name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution result.
    #[serde(rename = "tool_result")]
    ToolResultEvent {
        id: String,
        success: bool,
        output: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// The engine paused for human approval. The checkpoint named here
    /// already holds the interrupted state.
    #[serde(rename = "interrupt")]
    Interrupt {
        checkpoint_id: String,
        pending_tool_calls: Vec<ToolCall>,
    },

    /// The turn completed with a final assistant message.
    #[serde(rename = "done")]
    Done { final_message: Message },

    /// The turn ended in an error.
    #[serde(rename = "error")]
    Error {
        kind: ErrorKind,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<serde_json::Value>,
    },
}

impl TurnEvent {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub fn error_with_data(
        kind: ErrorKind,
        message: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Done { .. } | Self::Interrupt { .. } | Self::Error { .. }
        )
    }
}
