//! Shared fakes for the core test suite: a scripted provider, a recording
//! sandbox driver, and a fully in-memory runtime harness.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use sp_domain::config::{ProviderSettings, RuntimeConfig};
use sp_domain::error::{Error, Result};
use sp_domain::event::TurnEvent;
use sp_domain::stream::{BoxStream, StreamEvent, Usage};
use sp_domain::thread::Principal;
use sp_domain::tool::ToolCall;
use sp_mcp_client::ToolServerManager;
use sp_providers::{ChatRequest, ChatResponse, LlmProvider};
use sp_sandbox::{ExecOutput, ResourceLimits, RuntimeListing, SandboxDriver};
use sp_store::{
    MemoryCredentialStore, MemoryMessageStore, MemoryQuotaStore, MemoryThreadStore, ReversingCipher,
};

use crate::arbiter::KeyLease;
use crate::{CoreRuntime, ProviderFactory, RuntimeDeps};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted provider
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Plays back a queue of canned responses; an exhausted script answers with
/// a permanent provider failure.
pub(crate) struct ScriptedProvider {
    responses: Mutex<VecDeque<ChatResponse>>,
    /// Optional delay before the stream yields, for cancellation tests.
    pub stream_delay: Mutex<Option<Duration>>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<ChatResponse>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            stream_delay: Mutex::new(None),
        })
    }

    pub fn push(&self, response: ChatResponse) {
        self.responses.lock().push_back(response);
    }

    fn pop(&self) -> Result<ChatResponse> {
        self.responses.lock().pop_front().ok_or(Error::Provider {
            provider: "scripted".into(),
            message: "HTTP 400 - script exhausted".into(),
        })
    }
}

#[async_trait::async_trait]
impl LlmProvider for ScriptedProvider {
    async fn chat(&self, _req: &ChatRequest) -> Result<ChatResponse> {
        self.pop()
    }

    async fn chat_stream(
        &self,
        _req: &ChatRequest,
    ) -> Result<BoxStream<'static, Result<StreamEvent>>> {
        let response = self.pop()?;
        let delay = *self.stream_delay.lock();
        let stream = async_stream::stream! {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if !response.content.is_empty() {
                yield Ok(StreamEvent::Token { text: response.content.clone() });
            }
            for tc in &response.tool_calls {
                yield Ok(StreamEvent::ToolCallFinished {
                    call_id: tc.call_id.clone(),
                    tool_name: tc.tool_name.clone(),
                    arguments: tc.arguments.clone(),
                });
            }
            yield Ok(StreamEvent::Done {
                usage: response.usage,
                finish_reason: response.finish_reason.clone(),
            });
        };
        Ok(Box::pin(stream))
    }

    fn provider_id(&self) -> &str {
        "scripted"
    }
}

pub(crate) struct ScriptedFactory {
    provider: Arc<ScriptedProvider>,
}

impl ProviderFactory for ScriptedFactory {
    fn build(&self, _lease: &KeyLease) -> Result<Arc<dyn LlmProvider>> {
        Ok(self.provider.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording sandbox driver
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub(crate) struct RecordingDriver {
    pub execs: Mutex<Vec<Vec<String>>>,
}

#[async_trait::async_trait]
impl SandboxDriver for RecordingDriver {
    async fn create(&self, _name: &str, _image: &str, _limits: &ResourceLimits) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _name: &str,
        command: &[String],
        _timeout: Duration,
    ) -> Result<ExecOutput> {
        self.execs.lock().push(command.to_vec());
        Ok(ExecOutput {
            exit_code: 0,
            stdout: format!("executed: {}", command.join(" ")),
            stderr: String::new(),
        })
    }

    async fn terminate(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn list_all(&self, _prefix: &str) -> Result<Vec<RuntimeListing>> {
        Ok(Vec::new())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct TestHarness {
    pub runtime: Arc<CoreRuntime>,
    pub provider: Arc<ScriptedProvider>,
    pub threads: Arc<MemoryThreadStore>,
    pub messages: Arc<MemoryMessageStore>,
    pub quota: Arc<MemoryQuotaStore>,
    pub credentials: Arc<MemoryCredentialStore>,
    pub driver: Arc<RecordingDriver>,
    _workspace: tempfile::TempDir,
}

pub(crate) fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.providers.insert(
        "openai".into(),
        ProviderSettings {
            api_key: Some("sk-system".into()),
            api_base: None,
        },
    );
    // Fast-fail retries, no background title calls eating the script.
    config.retry.attempts = 1;
    config.retry.base_delay_ms = 1;
    config.auto_title = false;
    config
}

/// Install a test-writer subscriber once; `RUST_LOG` filters as usual.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub(crate) fn harness_with(config: RuntimeConfig, responses: Vec<ChatResponse>) -> TestHarness {
    init_tracing();
    let provider = ScriptedProvider::new(responses);
    let threads = Arc::new(MemoryThreadStore::new());
    let messages = Arc::new(MemoryMessageStore::new());
    let quota = Arc::new(MemoryQuotaStore::new(config.quota.clone()));
    let credentials = Arc::new(MemoryCredentialStore::new());
    let driver = Arc::new(RecordingDriver::default());
    let workspace = tempfile::tempdir().expect("tempdir");

    let runtime = CoreRuntime::new(
        config,
        RuntimeDeps {
            threads: threads.clone(),
            messages: messages.clone(),
            checkpoint_store: Arc::new(sp_checkpoint::MemoryCheckpointStore::new()),
            quota: quota.clone(),
            credentials: credentials.clone(),
            cipher: Arc::new(ReversingCipher),
            providers: Arc::new(ScriptedFactory {
                provider: provider.clone(),
            }),
            sandbox_driver: driver.clone(),
            tool_servers: Arc::new(ToolServerManager::empty()),
            workspace_root: workspace.path().to_path_buf(),
        },
    )
    .expect("runtime construction");

    TestHarness {
        runtime,
        provider,
        threads,
        messages,
        quota,
        credentials,
        driver,
        _workspace: workspace,
    }
}

pub(crate) fn harness(responses: Vec<ChatResponse>) -> TestHarness {
    harness_with(test_config(), responses)
}

// ── Response builders ──────────────────────────────────────────────

pub(crate) fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

pub(crate) fn chat_text(text: &str) -> ChatResponse {
    ChatResponse {
        content: text.into(),
        tool_calls: Vec::new(),
        usage: Some(usage()),
        model: "gpt-4o".into(),
        finish_reason: Some("stop".into()),
    }
}

pub(crate) fn chat_tool(call_id: &str, name: &str, arguments: serde_json::Value) -> ChatResponse {
    ChatResponse {
        content: String::new(),
        tool_calls: vec![ToolCall {
            call_id: call_id.into(),
            tool_name: name.into(),
            arguments,
        }],
        usage: Some(usage()),
        model: "gpt-4o".into(),
        finish_reason: Some("tool_calls".into()),
    }
}

// ── Event helpers ──────────────────────────────────────────────────

/// Drain a turn's event stream to completion.
pub(crate) async fn drain(mut rx: mpsc::Receiver<TurnEvent>) -> Vec<TurnEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

pub(crate) fn thread_id_of(events: &[TurnEvent]) -> String {
    events
        .iter()
        .find_map(|e| match e {
            TurnEvent::SessionCreated { thread_id } => Some(thread_id.clone()),
            _ => None,
        })
        .expect("no session_created event")
}

pub(crate) fn alice() -> Principal {
    Principal::Registered("alice".into())
}
