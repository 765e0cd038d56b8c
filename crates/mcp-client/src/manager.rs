//! Tool server manager — connections, discovery, namespaced dispatch.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;

use sp_domain::tool::{ToolCategory, ToolDefinition};

use crate::config::ToolServerConfig;
use crate::protocol::{self, namespaced, split_namespaced, CallResult, ServerToolDef, ToolsListResult};
use crate::transport::{StdioTransport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("tool server protocol error: {0}")]
    Protocol(String),

    #[error("unknown tool server: {0}")]
    ServerNotFound(String),

    #[error("tool server is down: {0}")]
    ServerDown(String),
}

impl ServerError {
    /// Errors where the server was unreachable (vs. answered with a failure).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::ServerNotFound(_) | Self::ServerDown(_)
        )
    }
}

struct ServerConnection {
    id: String,
    tools: Vec<ServerToolDef>,
    call_timeout: Duration,
    transport: StdioTransport,
}

impl ServerConnection {
    /// Spawn the process, run the MCP handshake, discover tools.
    async fn connect(config: &ToolServerConfig) -> Result<Self, ServerError> {
        let transport = StdioTransport::spawn(config)?;
        let handshake_timeout = Duration::from_secs(30);

        let params = serde_json::to_value(protocol::initialize_params())
            .map_err(|e| ServerError::Protocol(format!("initialize params: {e}")))?;
        let resp = transport
            .request("initialize", Some(params), handshake_timeout)
            .await?;
        resp.into_result()
            .map_err(|e| ServerError::Protocol(format!("initialize failed: {e}")))?;

        transport.notify("notifications/initialized").await?;

        let tools_resp = transport
            .request("tools/list", None, handshake_timeout)
            .await?;
        let tools = match tools_resp.into_result() {
            Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                .map(|r| r.tools)
                .unwrap_or_else(|e| {
                    tracing::warn!(server_id = %config.id, error = %e, "unparseable tools/list");
                    Vec::new()
                }),
            Err(e) => {
                tracing::warn!(server_id = %config.id, error = %e, "tools/list failed");
                Vec::new()
            }
        };

        tracing::info!(
            server_id = %config.id,
            tool_count = tools.len(),
            "tool server connected"
        );

        Ok(Self {
            id: config.id.clone(),
            tools,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            transport,
        })
    }

    async fn call(&self, tool_name: &str, arguments: Value) -> Result<CallResult, ServerError> {
        if !self.transport.is_alive() {
            return Err(ServerError::ServerDown(self.id.clone()));
        }
        let params = serde_json::json!({ "name": tool_name, "arguments": arguments });
        let resp = self
            .transport
            .request("tools/call", Some(params), self.call_timeout)
            .await?;
        let value = resp
            .into_result()
            .map_err(|e| ServerError::Protocol(format!("tools/call failed: {e}")))?;
        serde_json::from_value(value)
            .map_err(|e| ServerError::Protocol(format!("unparseable tools/call result: {e}")))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Holds every configured tool server connection for the process.
pub struct ToolServerManager {
    servers: HashMap<String, ServerConnection>,
}

impl ToolServerManager {
    pub fn empty() -> Self {
        Self {
            servers: HashMap::new(),
        }
    }

    /// Connect all configured servers. Failures are logged and skipped —
    /// one broken server must not take the runtime down.
    pub async fn connect_all(configs: &[ToolServerConfig]) -> Self {
        let mut servers = HashMap::new();
        for config in configs {
            match ServerConnection::connect(config).await {
                Ok(conn) => {
                    servers.insert(config.id.clone(), conn);
                }
                Err(e) => {
                    tracing::warn!(
                        server_id = %config.id,
                        error = %e,
                        "tool server failed to connect, skipping"
                    );
                }
            }
        }
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn server_count(&self) -> usize {
        self.servers.len()
    }

    /// Namespaced tool definitions for the given enabled servers.
    /// `enabled = None` exposes every connected server.
    pub fn definitions(&self, enabled: Option<&[String]>) -> Vec<ToolDefinition> {
        let mut defs = Vec::new();
        for conn in self.servers.values() {
            if let Some(enabled) = enabled {
                if !enabled.iter().any(|id| id == &conn.id) {
                    continue;
                }
            }
            if !conn.transport.is_alive() {
                continue;
            }
            for tool in &conn.tools {
                defs.push(ToolDefinition {
                    name: namespaced(&conn.id, &tool.name),
                    description: tool.description.clone(),
                    parameters: tool.input_schema.clone(),
                    requires_confirmation: false,
                    category: ToolCategory::External,
                });
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// True when the namespaced name resolves to a connected server's tool.
    pub fn resolves(&self, namespaced_name: &str) -> bool {
        match split_namespaced(namespaced_name) {
            Some((server_id, tool)) => self
                .servers
                .get(server_id)
                .is_some_and(|c| c.tools.iter().any(|t| t.name == tool)),
            None => false,
        }
    }

    /// Call a namespaced tool. `(text, is_error)` on a served call; `Err` on
    /// transport-level failure (the invoker turns that into a failed tool
    /// result, not a turn error).
    pub async fn call(
        &self,
        namespaced_name: &str,
        arguments: Value,
    ) -> Result<(String, bool), ServerError> {
        let (server_id, tool_name) = split_namespaced(namespaced_name)
            .ok_or_else(|| ServerError::ServerNotFound(namespaced_name.to_string()))?;
        let conn = self
            .servers
            .get(server_id)
            .ok_or_else(|| ServerError::ServerNotFound(server_id.to_string()))?;

        let result = conn.call(tool_name, arguments).await?;
        Ok((result.text(), result.is_error))
    }

    pub async fn shutdown(&self) {
        let futs: Vec<_> = self
            .servers
            .values()
            .map(|c| c.transport.shutdown())
            .collect();
        futures_util::future::join_all(futs).await;
    }
}
