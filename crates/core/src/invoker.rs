//! Tool invoker — turns `(tool_name, arguments)` into a [`ToolResult`].
//!
//! Resolution order: built-in registry first, then namespaced external tool
//! servers. The invoker only executes; the HITL decision is made by the
//! engine before it ever calls in here. Failures become failed tool results
//! for the model to react to — with one exception: a sandbox that cannot be
//! acquired ends the turn (`sandbox_unavailable`).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use sp_domain::error::Error;
use sp_domain::tool::{ToolCall, ToolCategory, ToolDefinition, ToolFailure, ToolResult};
use sp_mcp_client::ServerError;
use sp_sandbox::SandboxInfo;
use sp_tools::sandbox_cmd;
use sp_tools::validate::validate_arguments;

use crate::{CoreRuntime, ThreadConfig};

/// Failures that end the whole turn instead of producing a tool result.
#[derive(Debug)]
pub enum InvokeFatal {
    SandboxUnavailable(String),
}

#[derive(Clone)]
pub struct ToolInvoker {
    runtime: Arc<CoreRuntime>,
    thread_id: String,
    user_id: String,
    binding: ThreadConfig,
}

impl ToolInvoker {
    pub fn new(
        runtime: Arc<CoreRuntime>,
        thread_id: String,
        user_id: String,
        binding: ThreadConfig,
    ) -> Self {
        Self {
            runtime,
            thread_id,
            user_id,
            binding,
        }
    }

    /// Tool definitions exposed to the model for this thread's binding:
    /// enabled built-ins plus namespaced tools from enabled servers.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = self
            .runtime
            .builtins
            .filtered(self.binding.enabled_tools.as_deref());
        defs.extend(
            self.runtime
                .tool_servers
                .definitions(self.binding.enabled_mcp_servers.as_deref()),
        );
        defs
    }

    /// HITL policy: in the confirmation set and not auto-approved.
    pub fn requires_confirmation(&self, tool_name: &str) -> bool {
        self.runtime.config.approval.requires_confirmation(tool_name)
    }

    /// Schema-validate proposed arguments without executing (used by the
    /// `modify` resume decision).
    pub fn validate(&self, tool_name: &str, arguments: &Value) -> Result<(), String> {
        match self.builtin(tool_name) {
            Some(def) => validate_arguments(&def.parameters, arguments),
            None if self.runtime.tool_servers.resolves(tool_name) => Ok(()),
            None => Err(format!("unknown tool: {tool_name}")),
        }
    }

    fn builtin(&self, name: &str) -> Option<ToolDefinition> {
        let def = self.runtime.builtins.get(name)?;
        if let Some(enabled) = self.binding.enabled_tools.as_deref() {
            if !enabled.iter().any(|n| n == name) {
                return None;
            }
        }
        Some(def.clone())
    }

    fn server_enabled(&self, namespaced: &str) -> bool {
        let Some((server, _)) = sp_mcp_client::split_namespaced(namespaced) else {
            return false;
        };
        match self.binding.enabled_mcp_servers.as_deref() {
            Some(enabled) => enabled.iter().any(|id| id == server),
            None => true,
        }
    }

    /// Effective timeout: explicit `timeout_sec` argument, else per-tool
    /// config, else the global tool default.
    fn timeout_for(&self, tool_name: &str, arguments: &Value) -> Duration {
        arguments
            .get("timeout_sec")
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.runtime.config.timeouts.tool(tool_name))
    }

    // ── Execution ────────────────────────────────────────────────────

    pub async fn execute(&self, call: &ToolCall) -> Result<ToolResult, InvokeFatal> {
        tracing::debug!(tool_name = %call.tool_name, call_id = %call.call_id, "tool dispatch");

        if let Some(def) = self.builtin(&call.tool_name) {
            if let Err(reason) = validate_arguments(&def.parameters, &call.arguments) {
                return Ok(ToolResult::fail(
                    &call.call_id,
                    ToolFailure::InvalidArguments,
                    reason,
                ));
            }
            let timeout = self.timeout_for(&call.tool_name, &call.arguments);
            return match def.category {
                ToolCategory::Execution => self.execute_sandboxed(call, timeout).await,
                _ => Ok(self.execute_in_process(call, timeout).await),
            };
        }

        if self.runtime.tool_servers.resolves(&call.tool_name) && self.server_enabled(&call.tool_name)
        {
            return Ok(self.execute_external(call).await);
        }

        Ok(ToolResult::fail(
            &call.call_id,
            ToolFailure::ExecutionError,
            format!("unknown tool: {}", call.tool_name),
        ))
    }

    // ── Sandboxed tools ──────────────────────────────────────────────

    async fn execute_sandboxed(
        &self,
        call: &ToolCall,
        timeout: Duration,
    ) -> Result<ToolResult, InvokeFatal> {
        let sandbox = self
            .runtime
            .sandboxes
            .acquire(&self.user_id, &self.thread_id)
            .await
            .map_err(|e| InvokeFatal::SandboxUnavailable(e.to_string()))?;

        let argv = match call.tool_name.as_str() {
            "run_shell" => {
                let command = call
                    .arguments
                    .get("command")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                for package in sandbox_cmd::pip_installed_packages(command) {
                    self.runtime.sandboxes.record_package(&self.thread_id, &package);
                }
                sandbox_cmd::shell_argv(command)
            }
            "run_python" => {
                let code = call
                    .arguments
                    .get("code")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                sandbox_cmd::python_argv(code)
            }
            "write_file" => {
                let path = call
                    .arguments
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                let content = call
                    .arguments
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                self.runtime.sandboxes.record_file(&self.thread_id, path);
                sandbox_cmd::write_file_argv(path, content)
            }
            other => {
                return Ok(ToolResult::fail(
                    &call.call_id,
                    ToolFailure::ExecutionError,
                    format!("no sandbox handler for tool: {other}"),
                ));
            }
        };

        let result = self.run_in_sandbox(&sandbox, call, &argv, timeout).await;
        self.runtime.sandboxes.mark_activity(&sandbox.sandbox_id);
        Ok(result)
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &SandboxInfo,
        call: &ToolCall,
        argv: &[String],
        timeout: Duration,
    ) -> ToolResult {
        match self
            .runtime
            .sandboxes
            .driver()
            .exec(&sandbox.sandbox_id, argv, timeout)
            .await
        {
            Ok(output) => {
                let mut text = output.stdout.clone();
                if !output.stderr.trim().is_empty() {
                    if !text.is_empty() {
                        text.push('\n');
                    }
                    text.push_str(output.stderr.trim_end());
                }
                if output.succeeded() {
                    ToolResult::ok(&call.call_id, text)
                } else {
                    ToolResult::fail(
                        &call.call_id,
                        ToolFailure::ExecutionError,
                        format!("exit code {}: {}", output.exit_code, text),
                    )
                }
            }
            Err(Error::Timeout(msg)) => {
                ToolResult::fail(&call.call_id, ToolFailure::Timeout, msg)
            }
            Err(e) => ToolResult::fail(&call.call_id, ToolFailure::ExecutionError, e.to_string()),
        }
    }

    // ── In-process tools ─────────────────────────────────────────────

    async fn execute_in_process(&self, call: &ToolCall, timeout: Duration) -> ToolResult {
        let run = async {
            match call.tool_name.as_str() {
                "read_file" => {
                    let path = arg_str(&call.arguments, "path");
                    self.runtime.workspace.read_file(&path)
                }
                "list_dir" => {
                    let path = arg_str(&call.arguments, "path");
                    let recursive = call
                        .arguments
                        .get("recursive")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false);
                    self.runtime.workspace.list_dir(&path, recursive)
                }
                "grep_files" => {
                    let pattern = arg_str(&call.arguments, "pattern");
                    let path = arg_str(&call.arguments, "path");
                    let case_sensitive = call
                        .arguments
                        .get("case_sensitive")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(true);
                    self.runtime.workspace.grep(&pattern, &path, case_sensitive)
                }
                "web_search" => {
                    let query = arg_str(&call.arguments, "query");
                    let num_results = call
                        .arguments
                        .get("num_results")
                        .and_then(|v| v.as_u64())
                        .unwrap_or(5) as usize;
                    self.runtime.web_search.search(&query, num_results).await
                }
                other => Err(Error::Other(format!("no in-process handler for tool: {other}"))),
            }
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(Ok(output)) => ToolResult::ok(&call.call_id, output),
            Ok(Err(Error::Timeout(msg))) => {
                ToolResult::fail(&call.call_id, ToolFailure::Timeout, msg)
            }
            Ok(Err(e)) => ToolResult::fail(&call.call_id, ToolFailure::ExecutionError, e.to_string()),
            Err(_) => ToolResult::fail(
                &call.call_id,
                ToolFailure::Timeout,
                format!("tool exceeded {timeout:?}"),
            ),
        }
    }

    // ── External tool servers ────────────────────────────────────────

    async fn execute_external(&self, call: &ToolCall) -> ToolResult {
        match self
            .runtime
            .tool_servers
            .call(&call.tool_name, call.arguments.clone())
            .await
        {
            Ok((text, false)) => ToolResult::ok(&call.call_id, text),
            Ok((text, true)) => {
                ToolResult::fail(&call.call_id, ToolFailure::ExecutionError, text)
            }
            Err(ServerError::Transport(sp_mcp_client::TransportError::Timeout)) => {
                ToolResult::fail(
                    &call.call_id,
                    ToolFailure::Timeout,
                    "tool server call timed out",
                )
            }
            Err(e) if e.is_transport() => {
                ToolResult::fail(&call.call_id, ToolFailure::TransportError, e.to_string())
            }
            Err(e) => ToolResult::fail(&call.call_id, ToolFailure::ExecutionError, e.to_string()),
        }
    }
}

fn arg_str(arguments: &Value, key: &str) -> String {
    arguments
        .get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
