//! Spool core runtime — the orchestrator that turns a chat turn into a
//! streamed sequence of model calls, tool invocations, and sandboxed
//! executions, checkpointed at every step.
//!
//! Entry points: [`turn::start_turn`] and [`turn::resume_turn`], both
//! returning a channel of [`sp_domain::event::TurnEvent`]s. Transport is the
//! embedding application's concern.

pub mod arbiter;
pub mod cancel;
mod engine;
pub mod invoker;
pub mod sweep;
pub mod thread_lock;
pub mod title;
pub mod turn;

#[cfg(test)]
pub(crate) mod testing;

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sp_checkpoint::{CheckpointStore, Checkpointer};
use sp_domain::config::RuntimeConfig;
use sp_domain::error::Result;
use sp_mcp_client::ToolServerManager;
use sp_providers::{LlmProvider, OpenAiCompatProvider};
use sp_sandbox::{SandboxDriver, SessionManager, SessionPolicy, ThreadLiveness};
use sp_store::{
    CredentialRepository, KeyCipher, MessageRepository, QuotaRepository, ThreadRepository,
};
use sp_tools::{BuiltinRegistry, WebSearchClient, WorkspaceFs};

use crate::arbiter::{Arbiter, KeyLease};
use crate::cancel::CancelMap;
use crate::thread_lock::ThreadLockMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provider factory
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Builds a provider adapter for one request from the credential the
/// arbiter leased.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, lease: &KeyLease) -> Result<Arc<dyn LlmProvider>>;
}

/// Default factory: every provider id speaks the OpenAI-compatible contract
/// at its configured base URL.
pub struct OpenAiCompatFactory {
    request_timeout: std::time::Duration,
}

impl OpenAiCompatFactory {
    pub fn new(request_timeout: std::time::Duration) -> Self {
        Self { request_timeout }
    }
}

impl ProviderFactory for OpenAiCompatFactory {
    fn build(&self, lease: &KeyLease) -> Result<Arc<dyn LlmProvider>> {
        Ok(Arc::new(OpenAiCompatProvider::new(
            &lease.provider,
            lease.api_base.as_deref(),
            &lease.api_key,
            self.request_timeout,
        )?))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Thread bindings
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Immutable per-binding agent configuration, loaded once per turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadConfig {
    pub system_prompt: String,
    /// `provider/model` spec; `None` uses the process default.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Built-in tools exposed to the model. `None` = all.
    #[serde(default)]
    pub enabled_tools: Option<Vec<String>>,
    /// Tool servers exposed to the model. `None` = all connected.
    #[serde(default)]
    pub enabled_mcp_servers: Option<Vec<String>>,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a capable assistant with access to tools. \
                            Use them when they help; answer directly when they don't."
                .into(),
            model: None,
            temperature: None,
            max_tokens: None,
            max_iterations: None,
            enabled_tools: None,
            enabled_mcp_servers: None,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything [`turn::start_turn`] needs, wired once at bootstrap.
pub struct RuntimeDeps {
    pub threads: Arc<dyn ThreadRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub checkpoint_store: Arc<dyn CheckpointStore>,
    pub quota: Arc<dyn QuotaRepository>,
    pub credentials: Arc<dyn CredentialRepository>,
    pub cipher: Arc<dyn KeyCipher>,
    pub providers: Arc<dyn ProviderFactory>,
    pub sandbox_driver: Arc<dyn SandboxDriver>,
    pub tool_servers: Arc<ToolServerManager>,
    pub workspace_root: PathBuf,
}

pub struct CoreRuntime {
    pub config: Arc<RuntimeConfig>,
    pub threads: Arc<dyn ThreadRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub checkpoints: Checkpointer,
    pub arbiter: Arbiter,
    pub providers: Arc<dyn ProviderFactory>,
    pub sandboxes: Arc<SessionManager>,
    pub tool_servers: Arc<ToolServerManager>,
    pub builtins: Arc<BuiltinRegistry>,
    pub workspace: Arc<WorkspaceFs>,
    pub web_search: Arc<WebSearchClient>,
    pub locks: Arc<ThreadLockMap>,
    pub cancels: Arc<CancelMap>,
    bindings: RwLock<std::collections::HashMap<String, ThreadConfig>>,
}

impl CoreRuntime {
    pub fn new(config: RuntimeConfig, deps: RuntimeDeps) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let web_search = WebSearchClient::new(config.timeouts.tool("web_search"))?;
        let sandboxes = Arc::new(SessionManager::new(
            SessionPolicy::from(&config.sandbox),
            deps.sandbox_driver,
        ));
        let arbiter = Arbiter::new(
            config.clone(),
            deps.credentials,
            deps.cipher,
            deps.quota,
        );

        Ok(Arc::new(Self {
            config,
            threads: deps.threads,
            messages: deps.messages,
            checkpoints: Checkpointer::new(deps.checkpoint_store),
            arbiter,
            providers: deps.providers,
            sandboxes,
            tool_servers: deps.tool_servers,
            builtins: Arc::new(BuiltinRegistry::new()),
            workspace: Arc::new(WorkspaceFs::new(deps.workspace_root)),
            web_search: Arc::new(web_search),
            locks: Arc::new(ThreadLockMap::new()),
            cancels: Arc::new(CancelMap::new()),
            bindings: RwLock::new(std::collections::HashMap::new()),
        }))
    }

    /// Register a named agent binding.
    pub fn register_binding(&self, name: impl Into<String>, binding: ThreadConfig) {
        self.bindings.write().insert(name.into(), binding);
    }

    /// Resolve a binding name to its configuration; unknown or absent names
    /// fall back to the default binding.
    pub fn binding(&self, name: Option<&str>) -> ThreadConfig {
        name.and_then(|n| self.bindings.read().get(n).cloned())
            .unwrap_or_default()
    }

    /// Delete a thread and everything it owns: messages, checkpoints, and
    /// its live sandbox.
    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.messages.delete_thread(thread_id).await?;
        self.checkpoints.delete_thread(thread_id).await?;
        self.sandboxes
            .release(thread_id, sp_sandbox::CleanupReason::ThreadDeleted)
            .await;
        self.threads.delete(thread_id).await?;
        tracing::info!(thread_id, "thread deleted");
        Ok(())
    }

    /// Launch the background maintenance tasks: sandbox reaper, checkpoint
    /// retention sweep, anonymous-thread TTL sweep, and a one-shot orphan
    /// reclamation pass. Returns the task handles for shutdown.
    pub fn spawn_maintenance(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let liveness: Arc<dyn ThreadLiveness> =
            Arc::new(ThreadLivenessAdapter(self.threads.clone()));
        handles.push(self.sandboxes.spawn_reaper(Some(liveness)));

        handles.push(sp_checkpoint::sweep::spawn_retention_sweep(
            self.checkpoints.store().clone(),
            self.config.checkpoint.clone(),
        ));

        handles.push(sweep::spawn_anonymous_sweep(self.clone()));

        let runtime = self.clone();
        handles.push(tokio::spawn(async move {
            let max_age = std::time::Duration::from_secs(runtime.config.sandbox.max_duration_secs);
            match runtime.sandboxes.reclaim_orphans(max_age).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(reclaimed = n, "startup orphan reclamation"),
                Err(e) => tracing::warn!(error = %e, "startup orphan reclamation failed"),
            }
        }));

        handles
    }
}

/// Adapts the thread repository to the sandbox reaper's liveness probe.
struct ThreadLivenessAdapter(Arc<dyn ThreadRepository>);

#[async_trait::async_trait]
impl ThreadLiveness for ThreadLivenessAdapter {
    async fn thread_exists(&self, thread_id: &str) -> bool {
        matches!(self.0.get(thread_id).await, Ok(Some(_)))
    }
}
