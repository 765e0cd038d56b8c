//! Threads and messages — the conversational record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tool::ToolCall;

/// The identity a turn runs under: a registered user or an anonymous
/// cookie-scoped visitor. Exactly one of the two, by construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    Registered(String),
    Anonymous(String),
}

impl Principal {
    pub fn id(&self) -> &str {
        match self {
            Self::Registered(id) | Self::Anonymous(id) => id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous(_))
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registered(id) => write!(f, "user:{id}"),
            Self::Anonymous(id) => write!(f, "anon:{id}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreadStatus {
    Active,
    Archived,
}

/// A conversation. Created on the first turn, mutated by the dispatcher on
/// every step, deleted by the user or by the anonymous TTL sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub owner: Principal,
    /// Agent configuration binding. `None` falls back to the system default.
    #[serde(default)]
    pub agent_binding: Option<String>,
    pub title: String,
    /// True until a human (or the title generator failing closed) sets an
    /// explicit title. Replaces default-title string matching.
    #[serde(default)]
    pub title_is_autogenerated: bool,
    pub status: ThreadStatus,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    pub fn new(owner: Principal, agent_binding: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner,
            agent_binding,
            title: "New conversation".into(),
            title_is_autogenerated: true,
            status: ThreadStatus::Active,
            message_count: 0,
            token_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// An immutable record attached to a thread. Append-only.
///
/// `tool_calls` is non-empty only on assistant messages; `tool_call_id` is
/// present only on tool messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub thread_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<u32>,
    pub created_at: DateTime<Utc>,
}

// ── Convenience constructors ───────────────────────────────────────

impl Message {
    fn base(thread_id: impl Into<String>, role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            thread_id: thread_id.into(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            metadata: serde_json::Value::Null,
            token_count: None,
            created_at: Utc::now(),
        }
    }

    pub fn system(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::base(thread_id, Role::System, text)
    }

    pub fn user(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::base(thread_id, Role::User, text)
    }

    pub fn assistant(thread_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::base(thread_id, Role::Assistant, text)
    }

    /// An assistant message carrying tool calls (content may be empty).
    pub fn assistant_with_calls(
        thread_id: impl Into<String>,
        text: impl Into<String>,
        tool_calls: Vec<ToolCall>,
    ) -> Self {
        let mut msg = Self::base(thread_id, Role::Assistant, text);
        msg.tool_calls = tool_calls;
        msg
    }

    pub fn tool_result(
        thread_id: impl Into<String>,
        tool_call_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let mut msg = Self::base(thread_id, Role::Tool, content);
        msg.tool_call_id = Some(tool_call_id.into());
        msg
    }

    /// True when this assistant message still has tool calls to run.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn principal_exposes_id_and_kind() {
        let p = Principal::Anonymous("c-123".into());
        assert_eq!(p.id(), "c-123");
        assert!(p.is_anonymous());
        assert!(!Principal::Registered("u-1".into()).is_anonymous());
    }

    #[test]
    fn new_thread_starts_autogenerated() {
        let t = Thread::new(Principal::Registered("u-1".into()), None);
        assert!(t.title_is_autogenerated);
        assert_eq!(t.status, ThreadStatus::Active);
        assert_eq!(t.message_count, 0);
    }

    #[test]
    fn tool_result_message_carries_call_id() {
        let m = Message::tool_result("t-1", "tc_abc", "output");
        assert_eq!(m.role, Role::Tool);
        assert_eq!(m.tool_call_id.as_deref(), Some("tc_abc"));
        assert!(m.tool_calls.is_empty());
    }

    #[test]
    fn assistant_with_calls_round_trips_ids() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "list_dir".into(),
            arguments: serde_json::json!({"path": "."}),
        }];
        let m = Message::assistant_with_calls("t-1", "", calls);
        assert!(m.has_tool_calls());
        assert_eq!(m.tool_calls[0].call_id, "tc_1");
    }

    #[test]
    fn message_serde_skips_empty_fields() {
        let m = Message::user("t-1", "hi");
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("tool_calls").is_none());
        assert!(v.get("tool_call_id").is_none());
        assert!(v.get("metadata").is_none());
    }
}
