use serde::{Deserialize, Serialize};

/// A tool invocation requested by the model.
///
/// The `call_id` is echoed bit-exact from the provider's output; the matching
/// tool-result message must carry the same identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Broad grouping used when describing tools and deciding execution routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Runs inside the thread's sandbox (shell, python, mutating file IO).
    Execution,
    /// Read-only filesystem access, executed in-process.
    FileSystem,
    /// Web/content search, executed in-process.
    Search,
    /// Served by an external tool server.
    External,
}

/// Tool definition exposed to the LLM and consulted by the HITL policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
    /// Default answer to "does this tool need human approval?".
    /// The effective decision also consults the auto-approve globs.
    #[serde(default)]
    pub requires_confirmation: bool,
    pub category: ToolCategory,
}

/// Why a tool execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    /// Schema validation failed; the tool was never invoked.
    InvalidArguments,
    /// Execution exceeded its wall-clock budget.
    Timeout,
    /// The external tool server was unreachable.
    TransportError,
    /// The tool ran and raised.
    ExecutionError,
    /// A human rejected the call during an interrupt resume.
    RejectedByUser,
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::InvalidArguments => "invalid_arguments",
            Self::Timeout => "timeout",
            Self::TransportError => "transport_error",
            Self::ExecutionError => "execution_error",
            Self::RejectedByUser => "rejected_by_user",
        };
        f.write_str(s)
    }
}

/// Outcome of one tool execution, fed back to the model as a tool message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            failure: None,
            error: None,
        }
    }

    pub fn fail(
        call_id: impl Into<String>,
        failure: ToolFailure,
        error: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: String::new(),
            failure: Some(failure),
            error: Some(error.into()),
        }
    }

    /// The text rendered into the tool-role message for the model.
    pub fn render(&self) -> String {
        if self.success {
            self.output.clone()
        } else {
            let kind = self
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "error".into());
            format!(
                "[{kind}] {}",
                self.error.as_deref().unwrap_or("tool failed")
            )
        }
    }
}
