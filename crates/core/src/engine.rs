//! The agent execution engine: a finite-state loop over [`AgentState`].
//!
//! Each cycle calls the model, parses tool calls, and either completes,
//! interrupts for human approval, or executes the tools and loops. A
//! checkpoint is written before every outgoing terminal or cycle boundary,
//! so a crash resumes from the last successful step and replays at most one
//! duplicate event.

use std::sync::Arc;

use futures_util::StreamExt;
use tokio::sync::mpsc;

use sp_domain::config::RuntimeConfig;
use sp_domain::error::Error;
use sp_domain::event::{ErrorKind, TurnEvent};
use sp_domain::state::{AgentState, PendingInterrupt, RunStatus};
use sp_domain::stream::{StreamEvent, Usage};
use sp_domain::thread::{Message, Thread};
use sp_domain::tool::{ToolCall, ToolResult};
use sp_providers::retry::{backoff_delay, is_transient};
use sp_providers::{ChatRequest, LlmProvider};
use sp_store::Capability;

use crate::arbiter::{KeyLease, LeaseOutcome};
use crate::cancel::CancelToken;
use crate::invoker::{InvokeFatal, ToolInvoker};
use crate::{CoreRuntime, ThreadConfig};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outcome types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How the engine loop ended. The dispatcher converts this into the turn's
/// single terminal event after flushing messages.
pub(crate) enum Terminal {
    Done {
        final_message: Message,
    },
    Interrupt {
        checkpoint_id: String,
        pending: Vec<ToolCall>,
    },
    Failure {
        kind: ErrorKind,
        message: String,
        data: Option<serde_json::Value>,
    },
}

impl Terminal {
    pub(crate) fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure {
            kind,
            message: message.into(),
            data: None,
        }
    }

    pub(crate) fn into_event(self) -> TurnEvent {
        match self {
            Self::Done { final_message } => TurnEvent::Done { final_message },
            Self::Interrupt {
                checkpoint_id,
                pending,
            } => TurnEvent::Interrupt {
                checkpoint_id,
                pending_tool_calls: pending,
            },
            Self::Failure {
                kind,
                message,
                data,
            } => TurnEvent::Error {
                kind,
                message,
                data,
            },
        }
    }
}

pub(crate) struct EngineOutcome {
    pub state: AgentState,
    pub terminal: Terminal,
}

/// What one model call produced once the stream drained.
struct ModelTurn {
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

enum StreamEnd {
    Completed(ModelTurn),
    Cancelled,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Engine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct Engine {
    runtime: Arc<CoreRuntime>,
    thread: Thread,
    binding: ThreadConfig,
    invoker: ToolInvoker,
    cancel: CancelToken,
    tx: mpsc::Sender<TurnEvent>,
    state: AgentState,
    /// Credential pre-leased by the dispatcher for the first model call.
    first_lease: Option<KeyLease>,
    /// Tool calls to execute before the first model call (approve/modify
    /// resume path).
    pending_execution: Option<Vec<ToolCall>>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        runtime: Arc<CoreRuntime>,
        thread: Thread,
        binding: ThreadConfig,
        state: AgentState,
        cancel: CancelToken,
        tx: mpsc::Sender<TurnEvent>,
        first_lease: Option<KeyLease>,
        pending_execution: Option<Vec<ToolCall>>,
    ) -> Self {
        let invoker = ToolInvoker::new(
            runtime.clone(),
            thread.id.clone(),
            thread.owner.id().to_string(),
            binding.clone(),
        );
        Self {
            runtime,
            thread,
            binding,
            invoker,
            cancel,
            tx,
            state,
            first_lease,
            pending_execution,
        }
    }

    fn config(&self) -> &RuntimeConfig {
        &self.runtime.config
    }

    async fn emit(&self, event: TurnEvent) {
        let _ = self.tx.send(event).await;
    }

    /// Persist the current state as the thread's next checkpoint.
    async fn checkpoint(&self) -> Result<sp_domain::state::Checkpoint, Terminal> {
        self.runtime
            .checkpoints
            .append(&self.thread.id, self.state.clone())
            .await
            .map_err(|e| {
                Terminal::failure(ErrorKind::InternalError, format!("checkpoint write failed: {e}"))
            })
    }

    // ── Main loop ────────────────────────────────────────────────────

    pub(crate) async fn run(mut self) -> EngineOutcome {
        let terminal = self.run_inner().await;
        // A pre-flight reservation the loop never spent (cancellation or
        // iteration limit before the first model call) backs out here.
        if let Some(lease) = self.first_lease.take() {
            self.refund_lease(&lease).await;
        }
        EngineOutcome {
            state: self.state,
            terminal,
        }
    }

    /// Hand an admission unit back for a call that never completed.
    async fn refund_lease(&self, lease: &KeyLease) {
        if let Err(e) = self
            .runtime
            .arbiter
            .refund(self.thread.owner.id(), lease, Capability::Text)
            .await
        {
            tracing::warn!(error = %e, "quota refund failed");
        }
    }

    async fn run_inner(&mut self) -> Terminal {
        // Resume path: a human approved (or modified) pending tool calls.
        if let Some(calls) = self.pending_execution.take() {
            self.state.status = RunStatus::Running;
            self.state.interrupt = None;
            self.state.tool_results.clear();
            match self.execute_calls(&calls).await {
                Ok(results) => {
                    self.state.tool_results = results;
                    if let Err(t) = self.checkpoint().await {
                        return t;
                    }
                }
                Err(terminal) => return terminal,
            }
        }

        let max_iterations = self
            .binding
            .max_iterations
            .unwrap_or(self.config().max_iterations);

        loop {
            if self.cancel.is_cancelled() {
                return Terminal::failure(ErrorKind::Cancelled, "turn cancelled");
            }

            if self.state.iteration >= max_iterations {
                self.state.status = RunStatus::Failed;
                return Terminal::failure(
                    ErrorKind::IterationLimit,
                    format!("iteration limit reached ({max_iterations})"),
                );
            }

            // ── Credential + quota ────────────────────────────────────
            let model_spec = self
                .binding
                .model
                .clone()
                .unwrap_or_else(|| self.config().models.default_model.clone());
            let (provider_id, model) = RuntimeConfig::split_model_spec(&model_spec);
            let (provider_id, model) = (provider_id.to_string(), model.to_string());

            let lease = match self.first_lease.take() {
                Some(lease) => lease,
                None => {
                    let outcome = match self
                        .runtime
                        .arbiter
                        .lease(self.thread.owner.id(), &provider_id, Capability::Text)
                        .await
                    {
                        Ok(o) => o,
                        Err(e) => {
                            self.state.status = RunStatus::Failed;
                            return Terminal::failure(ErrorKind::InternalError, e.to_string());
                        }
                    };
                    match outcome {
                        LeaseOutcome::Granted(lease) => lease,
                        LeaseOutcome::NoKey { provider } => {
                            self.state.status = RunStatus::Failed;
                            return Terminal::failure(
                                ErrorKind::NoKeyConfigured,
                                format!("no LLM credential configured for provider '{provider}'"),
                            );
                        }
                        LeaseOutcome::QuotaExceeded(exceeded) => {
                            self.state.status = RunStatus::Failed;
                            return Terminal::Failure {
                                kind: ErrorKind::QuotaExceeded,
                                message: format!(
                                    "{} quota exhausted ({}/{})",
                                    exceeded.capability, exceeded.used, exceeded.limit
                                ),
                                data: serde_json::to_value(&exceeded).ok(),
                            };
                        }
                    }
                }
            };

            let provider = match self.runtime.providers.build(&lease) {
                Ok(p) => p,
                Err(e) => {
                    self.refund_lease(&lease).await;
                    self.state.status = RunStatus::Failed;
                    return Terminal::failure(ErrorKind::InternalError, e.to_string());
                }
            };

            // ── Model call ────────────────────────────────────────────
            self.state.iteration += 1;
            self.state.tool_results.clear();

            let turn = match self.call_model(provider.as_ref(), &model).await {
                Ok(StreamEnd::Completed(turn)) => turn,
                Ok(StreamEnd::Cancelled) => {
                    // Mid-model-call cancellation: abort the upstream
                    // request, refund the admission, no new checkpoint.
                    self.refund_lease(&lease).await;
                    return Terminal::failure(ErrorKind::Cancelled, "turn cancelled");
                }
                Err(e) => {
                    // The call produced nothing billable.
                    self.refund_lease(&lease).await;
                    self.state.status = RunStatus::Failed;
                    return Terminal::failure(ErrorKind::ModelError, e.to_string());
                }
            };

            // Account usage even for partial responses.
            if let Err(e) = self
                .runtime
                .arbiter
                .settle(
                    self.thread.owner.id(),
                    &lease,
                    &model,
                    Capability::Text,
                    turn.usage.as_ref(),
                )
                .await
            {
                tracing::warn!(error = %e, "usage settlement failed");
            }
            if let Some(usage) = &turn.usage {
                self.state.total_tokens += usage.total_tokens as u64;
            }

            let mut assistant =
                Message::assistant_with_calls(&self.thread.id, &turn.text, turn.tool_calls.clone());
            assistant.token_count = turn.usage.map(|u| u.completion_tokens);
            self.state.messages.push(assistant.clone());

            // ── No tool calls: done ───────────────────────────────────
            if turn.tool_calls.is_empty() {
                self.state.status = RunStatus::Completed;
                self.state.interrupt = None;
                if let Err(t) = self.checkpoint().await {
                    return t;
                }
                return Terminal::Done {
                    final_message: assistant,
                };
            }

            // ── HITL gate ─────────────────────────────────────────────
            let needs_confirmation = turn
                .tool_calls
                .iter()
                .any(|tc| self.invoker.requires_confirmation(&tc.tool_name));
            if needs_confirmation {
                self.state.status = RunStatus::Interrupted;
                self.state.interrupt = Some(PendingInterrupt {
                    tool_calls: turn.tool_calls.clone(),
                });
                let checkpoint = match self.checkpoint().await {
                    Ok(c) => c,
                    Err(t) => return t,
                };
                return Terminal::Interrupt {
                    checkpoint_id: checkpoint.id,
                    pending: turn.tool_calls,
                };
            }

            // ── Execute tools in order ────────────────────────────────
            match self.execute_calls(&turn.tool_calls).await {
                Ok(results) => {
                    self.state.tool_results = results;
                    if let Err(t) = self.checkpoint().await {
                        return t;
                    }
                }
                Err(terminal) => return terminal,
            }
        }
    }

    // ── Model call ───────────────────────────────────────────────────

    fn build_request(&self, model: &str) -> ChatRequest {
        let mut messages = Vec::with_capacity(self.state.messages.len() + 1);
        messages.push(Message::system(&self.thread.id, &self.binding.system_prompt));
        messages.extend(self.state.messages.iter().cloned());

        ChatRequest {
            messages,
            tools: self.invoker.definitions(),
            temperature: self
                .binding
                .temperature
                .or(Some(self.config().models.temperature)),
            max_tokens: self.binding.max_tokens.or(self.config().models.max_tokens),
            model: model.to_string(),
        }
    }

    /// One model call with bounded retry. Retries only happen while nothing
    /// has been emitted downstream; once token deltas are out, a mid-stream
    /// failure is surfaced rather than replayed.
    async fn call_model(
        &mut self,
        provider: &dyn LlmProvider,
        model: &str,
    ) -> Result<StreamEnd, Error> {
        let retry = self.config().retry.clone();
        let model_timeout = self.config().timeouts.model();
        let mut attempt = 0u32;

        loop {
            let mut emitted_any = false;
            let result = tokio::time::timeout(
                model_timeout,
                self.stream_once(provider, model, &mut emitted_any),
            )
            .await
            .unwrap_or_else(|_| Err(Error::Timeout(format!("model call exceeded {model_timeout:?}"))));

            match result {
                Ok(end) => return Ok(end),
                Err(e)
                    if !emitted_any && is_transient(&e) && attempt + 1 < retry.attempts.max(1) =>
                {
                    let delay = backoff_delay(&retry, attempt);
                    tracing::warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient model failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive one streaming (or blocking) completion to its end.
    async fn stream_once(
        &self,
        provider: &dyn LlmProvider,
        model: &str,
        emitted_any: &mut bool,
    ) -> Result<StreamEnd, Error> {
        let req = self.build_request(model);

        if !self.config().streaming {
            let resp = provider.chat(&req).await?;
            return Ok(StreamEnd::Completed(ModelTurn {
                text: resp.content,
                tool_calls: resp.tool_calls,
                usage: resp.usage,
            }));
        }

        let mut stream = provider.chat_stream(&req).await?;

        let mut text = String::new();
        let mut finished_calls: Vec<ToolCall> = Vec::new();
        // call_id -> (tool_name, argument json fragments)
        let mut assembling: Vec<(String, String, String)> = Vec::new();
        let mut usage: Option<Usage> = None;

        loop {
            let event = tokio::select! {
                ev = stream.next() => ev,
                _ = self.cancel.cancelled() => return Ok(StreamEnd::Cancelled),
            };
            let Some(event) = event else { break };

            match event? {
                StreamEvent::Token { text: delta } => {
                    *emitted_any = true;
                    self.emit(TurnEvent::TokenDelta {
                        text: delta.clone(),
                    })
                    .await;
                    text.push_str(&delta);
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    assembling.push((call_id, tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some(slot) = assembling.iter_mut().find(|(id, _, _)| *id == call_id) {
                        slot.2.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    assembling.retain(|(id, _, _)| *id != call_id);
                    finished_calls.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { usage: u, .. } => {
                    if u.is_some() {
                        usage = u;
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::Provider {
                        provider: provider.provider_id().to_string(),
                        message,
                    });
                }
            }
        }

        // Calls assembled from start/delta fragments (providers that never
        // send a finished event).
        for (call_id, tool_name, args_json) in assembling {
            let arguments = if args_json.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                serde_json::from_str(&args_json).unwrap_or_else(|e| {
                    tracing::warn!(
                        call_id = %call_id,
                        tool = %tool_name,
                        error = %e,
                        "tool call arguments are not valid JSON, defaulting to empty object"
                    );
                    serde_json::Value::Object(Default::default())
                })
            };
            finished_calls.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        Ok(StreamEnd::Completed(ModelTurn {
            text,
            tool_calls: finished_calls,
            usage,
        }))
    }

    // ── Tool execution ───────────────────────────────────────────────

    /// Execute tool calls sequentially in their original order, appending a
    /// tool message per result. Cancellation lets the in-flight tool finish
    /// within a short grace period, then detaches it as orphaned.
    pub(crate) async fn execute_calls(
        &mut self,
        calls: &[ToolCall],
    ) -> Result<Vec<ToolResult>, Terminal> {
        const CANCEL_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

        let mut results = Vec::with_capacity(calls.len());

        for tc in calls {
            if self.cancel.is_cancelled() {
                return Err(Terminal::failure(ErrorKind::Cancelled, "turn cancelled"));
            }

            self.emit(TurnEvent::ToolCallEvent {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                arguments: tc.arguments.clone(),
            })
            .await;

            let invoker = self.invoker.clone();
            let call = tc.clone();
            let mut fut = Box::pin(async move { invoker.execute(&call).await });
            let mut cancelled_during_call = false;

            let invoked = tokio::select! {
                res = &mut fut => res,
                _ = self.cancel.cancelled() => {
                    cancelled_during_call = true;
                    match tokio::time::timeout(CANCEL_GRACE, &mut fut).await {
                        Ok(res) => res,
                        Err(_) => Ok(ToolResult::fail(
                            &tc.call_id,
                            sp_domain::tool::ToolFailure::ExecutionError,
                            "orphaned: turn cancelled while the tool was running",
                        )),
                    }
                }
            };
            drop(fut);

            let result = match invoked {
                Ok(result) => result,
                Err(InvokeFatal::SandboxUnavailable(msg)) => {
                    self.state.status = RunStatus::Failed;
                    return Err(Terminal::failure(ErrorKind::SandboxUnavailable, msg));
                }
            };

            self.emit(TurnEvent::ToolResultEvent {
                id: result.call_id.clone(),
                success: result.success,
                output: result.output.clone(),
                error: result.error.clone(),
            })
            .await;

            self.state
                .messages
                .push(Message::tool_result(&self.thread.id, &tc.call_id, result.render()));
            results.push(result);

            if cancelled_during_call {
                // The in-flight result is recorded; the turn still ends here.
                self.state.tool_results = results;
                return Err(Terminal::failure(ErrorKind::Cancelled, "turn cancelled"));
            }
        }

        Ok(results)
    }
}
