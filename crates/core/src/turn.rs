//! Turn dispatcher — the entry points of the core runtime.
//!
//! [`start_turn`] resolves the thread, persists the user message, and drives
//! the engine; [`resume_turn`] splices a human decision into an interrupted
//! checkpoint and re-enters the loop. Both return a channel that yields
//! engine events and terminates with exactly one of `done`, `interrupt`,
//! `error`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::Instrument;

use sp_domain::config::RuntimeConfig;
use sp_domain::event::{ErrorKind, TurnEvent};
use sp_domain::state::{AgentState, RunStatus};
use sp_domain::thread::{Message, Principal, Thread};
use sp_domain::tool::{ToolCall, ToolFailure, ToolResult};
use sp_store::Capability;

use crate::arbiter::LeaseOutcome;
use crate::cancel::CancelToken;
use crate::engine::{Engine, EngineOutcome, Terminal};
use crate::invoker::ToolInvoker;
use crate::CoreRuntime;

const EVENT_BUFFER: usize = 64;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to [`start_turn`].
pub struct TurnRequest {
    /// `None` creates a new thread owned by the principal.
    pub thread_id: Option<String>,
    pub user_message: String,
    pub principal: Principal,
    /// Overrides the thread's stored binding for this turn.
    pub agent_binding: Option<String>,
}

/// The human decision spliced in by [`resume_turn`].
pub enum ResumeDecision {
    Approve,
    Reject,
    Modify {
        call_id: String,
        arguments: serde_json::Value,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry points
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn. Events stream on the returned receiver; the thread id of a
/// freshly created thread arrives in the `session_created` event.
pub fn start_turn(runtime: Arc<CoreRuntime>, req: TurnRequest) -> mpsc::Receiver<TurnEvent> {
    let (tx, rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let span = tracing::info_span!("turn", principal = %req.principal);
    tokio::spawn(run_start(runtime, req, tx).instrument(span));
    rx
}

/// Resume an interrupted (or crash-recovered) checkpoint with a decision.
pub fn resume_turn(
    runtime: Arc<CoreRuntime>,
    thread_id: String,
    checkpoint_id: String,
    principal: Principal,
    decision: ResumeDecision,
) -> mpsc::Receiver<TurnEvent> {
    let (tx, rx) = mpsc::channel::<TurnEvent>(EVENT_BUFFER);
    let span = tracing::info_span!("resume", thread_id = %thread_id, checkpoint_id = %checkpoint_id);
    tokio::spawn(
        run_resume(runtime, thread_id, checkpoint_id, principal, decision, tx).instrument(span),
    );
    rx
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// start_turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn send_error(tx: &mpsc::Sender<TurnEvent>, kind: ErrorKind, message: impl Into<String>) {
    let _ = tx.send(TurnEvent::error(kind, message)).await;
}

async fn run_start(runtime: Arc<CoreRuntime>, req: TurnRequest, tx: mpsc::Sender<TurnEvent>) {
    if req.user_message.trim().is_empty() {
        send_error(&tx, ErrorKind::InternalError, "empty user message").await;
        return;
    }

    // ── Resolve or create the thread ─────────────────────────────────
    let (mut thread, created) = match &req.thread_id {
        Some(id) => match runtime.threads.get(id).await {
            Ok(Some(thread)) => {
                if thread.owner != req.principal {
                    send_error(
                        &tx,
                        ErrorKind::PermissionDenied,
                        "thread belongs to a different principal",
                    )
                    .await;
                    return;
                }
                (thread, false)
            }
            Ok(None) => {
                send_error(&tx, ErrorKind::NotFound, format!("thread {id}")).await;
                return;
            }
            Err(e) => {
                send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
                return;
            }
        },
        None => {
            let thread = Thread::new(req.principal.clone(), req.agent_binding.clone());
            if let Err(e) = runtime.threads.create(thread.clone()).await {
                send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
                return;
            }
            (thread, true)
        }
    };

    if created {
        let _ = tx
            .send(TurnEvent::SessionCreated {
                thread_id: thread.id.clone(),
            })
            .await;
    }

    let binding_name = req
        .agent_binding
        .clone()
        .or_else(|| thread.agent_binding.clone());
    let binding = runtime.binding(binding_name.as_deref());

    // One turn at a time per thread; later requests queue here.
    let _permit = runtime.locks.acquire(&thread.id).await;

    // ── Initial state from the latest checkpoint ─────────────────────
    let mut state = match runtime.checkpoints.latest(&thread.id).await {
        Ok(Some(checkpoint)) => {
            if checkpoint.state.status == RunStatus::Interrupted {
                send_error(
                    &tx,
                    ErrorKind::Conflict,
                    "thread has a pending approval; resume it instead of starting a new turn",
                )
                .await;
                return;
            }
            let mut state = checkpoint.state;
            state.status = RunStatus::Running;
            state.interrupt = None;
            state.iteration = 0;
            state.tool_results.clear();
            state
        }
        Ok(None) => AgentState::new(Vec::new()),
        Err(e) => {
            send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
            return;
        }
    };

    // ── Pre-flight credential + quota ────────────────────────────────
    // Runs before the user message is persisted, so a refused turn leaves
    // no trace in the thread. The admission is a reservation: the engine
    // settles it on success and refunds it on any path where the model
    // call never completes.
    let model_spec = binding
        .model
        .clone()
        .unwrap_or_else(|| runtime.config.models.default_model.clone());
    let (provider_id, _model) = RuntimeConfig::split_model_spec(&model_spec);

    let lease = match runtime
        .arbiter
        .lease(req.principal.id(), provider_id, Capability::Text)
        .await
    {
        Ok(LeaseOutcome::Granted(lease)) => lease,
        Ok(LeaseOutcome::NoKey { provider }) => {
            send_error(
                &tx,
                ErrorKind::NoKeyConfigured,
                format!("no LLM credential configured for provider '{provider}'"),
            )
            .await;
            return;
        }
        Ok(LeaseOutcome::QuotaExceeded(exceeded)) => {
            let _ = tx
                .send(TurnEvent::error_with_data(
                    ErrorKind::QuotaExceeded,
                    format!(
                        "{} quota exhausted ({}/{})",
                        exceeded.capability, exceeded.used, exceeded.limit
                    ),
                    serde_json::to_value(&exceeded).unwrap_or(serde_json::Value::Null),
                ))
                .await;
            return;
        }
        Err(e) => {
            send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
            return;
        }
    };

    // ── Persist the user message before any model call ───────────────
    let user_message = Message::user(&thread.id, req.user_message.trim());
    if let Err(e) = runtime.messages.append(user_message.clone()).await {
        if let Err(e) = runtime
            .arbiter
            .refund(req.principal.id(), &lease, Capability::Text)
            .await
        {
            tracing::warn!(error = %e, "quota refund failed");
        }
        send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
        return;
    }
    let first_turn = thread.message_count == 0;
    thread.message_count += 1;
    thread.updated_at = chrono::Utc::now();
    if let Err(e) = runtime.threads.update(&thread).await {
        tracing::warn!(error = %e, thread_id = %thread.id, "thread counter update failed");
    }

    state.messages.push(user_message);
    let tokens_before = state.total_tokens;

    // ── Run the engine under cancellation + turn timeout ─────────────
    let cancel = runtime.cancels.register(&thread.id);
    let watchdog = spawn_watchdog(cancel.clone(), runtime.config.timeouts.turn());

    let engine = Engine::new(
        runtime.clone(),
        thread.clone(),
        binding,
        state,
        cancel,
        tx.clone(),
        Some(lease),
        None,
    );
    let outcome = engine.run().await;

    watchdog.abort();
    runtime.cancels.remove(&thread.id);

    let title_seed = (first_turn && thread.title_is_autogenerated)
        .then(|| req.user_message.trim().to_string());
    finish_turn(runtime, thread, outcome, tokens_before, tx, title_seed).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// resume_turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_resume(
    runtime: Arc<CoreRuntime>,
    thread_id: String,
    checkpoint_id: String,
    principal: Principal,
    decision: ResumeDecision,
    tx: mpsc::Sender<TurnEvent>,
) {
    let thread = match runtime.threads.get(&thread_id).await {
        Ok(Some(thread)) => thread,
        Ok(None) => {
            send_error(&tx, ErrorKind::NotFound, format!("thread {thread_id}")).await;
            return;
        }
        Err(e) => {
            send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
            return;
        }
    };
    if thread.owner != principal {
        send_error(
            &tx,
            ErrorKind::PermissionDenied,
            "thread belongs to a different principal",
        )
        .await;
        return;
    }

    // A resume racing a running turn is rejected, not queued.
    let Some(_permit) = runtime.locks.try_acquire(&thread.id) else {
        send_error(
            &tx,
            ErrorKind::Conflict,
            "a turn is already in flight for this thread",
        )
        .await;
        return;
    };

    let checkpoint = match runtime.checkpoints.load(&checkpoint_id).await {
        Ok(checkpoint) => checkpoint,
        Err(e) => {
            send_error(&tx, ErrorKind::NotFound, e.to_string()).await;
            return;
        }
    };
    if checkpoint.thread_id != thread.id {
        send_error(
            &tx,
            ErrorKind::NotFound,
            "checkpoint does not belong to this thread",
        )
        .await;
        return;
    }

    // ── Terminal checkpoints: resume is a no-op ──────────────────────
    match checkpoint.state.status {
        RunStatus::Completed => {
            let final_message = checkpoint
                .state
                .messages
                .iter()
                .rev()
                .find(|m| m.role == sp_domain::thread::Role::Assistant)
                .cloned()
                .unwrap_or_else(|| Message::assistant(&thread.id, ""));
            let _ = tx.send(TurnEvent::Done { final_message }).await;
            return;
        }
        RunStatus::Failed => {
            send_error(
                &tx,
                ErrorKind::InternalError,
                "checkpoint is terminal (failed); nothing to resume",
            )
            .await;
            return;
        }
        RunStatus::Interrupted | RunStatus::Running => {}
    }

    let binding = runtime.binding(thread.agent_binding.as_deref());
    let mut state = checkpoint.state;

    let tokens_before = state.total_tokens;

    // ── Splice the decision ──────────────────────────────────────────
    // Approve leaves the interrupted checkpoint as-is: a crash before the
    // tools finish resumes from it and the human approves again. Reject and
    // modify change state, so they persist a splice checkpoint before the
    // loop re-enters.
    let mut pending_execution: Option<Vec<ToolCall>> = None;
    if let Some(interrupt) = state.interrupt.clone() {
        match decision {
            ResumeDecision::Approve => {
                pending_execution = Some(interrupt.tool_calls);
            }
            ResumeDecision::Reject => {
                for tc in &interrupt.tool_calls {
                    let result =
                        ToolResult::fail(&tc.call_id, ToolFailure::RejectedByUser, "rejected by user");
                    let _ = tx
                        .send(TurnEvent::ToolResultEvent {
                            id: result.call_id.clone(),
                            success: false,
                            output: String::new(),
                            error: result.error.clone(),
                        })
                        .await;
                    state
                        .messages
                        .push(Message::tool_result(&thread.id, &tc.call_id, result.render()));
                    state.tool_results.push(result);
                }
                state.interrupt = None;
                state.status = RunStatus::Running;
                if let Err(e) = runtime.checkpoints.append(&thread.id, state.clone()).await {
                    send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
                    return;
                }
            }
            ResumeDecision::Modify { call_id, arguments } => {
                let mut calls = interrupt.tool_calls;
                let Some(target) = calls.iter_mut().find(|tc| tc.call_id == call_id) else {
                    send_error(
                        &tx,
                        ErrorKind::NotFound,
                        format!("pending tool call {call_id}"),
                    )
                    .await;
                    return;
                };

                let invoker = ToolInvoker::new(
                    runtime.clone(),
                    thread.id.clone(),
                    thread.owner.id().to_string(),
                    binding.clone(),
                );
                if let Err(reason) = invoker.validate(&target.tool_name, &arguments) {
                    send_error(
                        &tx,
                        ErrorKind::InternalError,
                        format!("modified arguments rejected: {reason}"),
                    )
                    .await;
                    return;
                }

                // The modification is visible in the persisted history: patch
                // the assistant message and the pending set in the state,
                // keep the interrupt pending, and checkpoint the splice.
                target.arguments = arguments.clone();
                if let Some(assistant) = state
                    .messages
                    .iter_mut()
                    .rev()
                    .find(|m| m.tool_calls.iter().any(|tc| tc.call_id == call_id))
                {
                    if let Some(tc) = assistant
                        .tool_calls
                        .iter_mut()
                        .find(|tc| tc.call_id == call_id)
                    {
                        tc.arguments = arguments;
                    }
                }
                state.interrupt = Some(sp_domain::state::PendingInterrupt {
                    tool_calls: calls.clone(),
                });
                if let Err(e) = runtime.checkpoints.append(&thread.id, state.clone()).await {
                    send_error(&tx, ErrorKind::InternalError, e.to_string()).await;
                    return;
                }
                pending_execution = Some(calls);
            }
        }
    }

    let cancel = runtime.cancels.register(&thread.id);
    let watchdog = spawn_watchdog(cancel.clone(), runtime.config.timeouts.turn());

    let engine = Engine::new(
        runtime.clone(),
        thread.clone(),
        binding,
        state,
        cancel,
        tx.clone(),
        None,
        pending_execution,
    );
    let outcome = engine.run().await;

    watchdog.abort();
    runtime.cancels.remove(&thread.id);

    finish_turn(runtime, thread, outcome, tokens_before, tx, None).await;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared tail
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn spawn_watchdog(cancel: CancelToken, timeout: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        tracing::warn!("turn timeout reached, cancelling");
        cancel.cancel();
    })
}

/// Flush new messages on `done`/`interrupt`, update thread counters, emit
/// the terminal event, and kick off title generation when warranted.
///
/// The flush starts at the repository's current message count rather than a
/// remembered offset: a turn that failed before flushing (crash, model
/// error) leaves a gap between the checkpointed state and the message
/// table, and the next successful flush heals it without duplicating.
async fn finish_turn(
    runtime: Arc<CoreRuntime>,
    mut thread: Thread,
    outcome: EngineOutcome,
    tokens_before: u64,
    tx: mpsc::Sender<TurnEvent>,
    title_seed: Option<String>,
) {
    let flush = matches!(
        outcome.terminal,
        Terminal::Done { .. } | Terminal::Interrupt { .. }
    );

    if flush {
        let persisted = match runtime.messages.count_by_thread(&thread.id).await {
            Ok(n) => n as usize,
            Err(e) => {
                tracing::warn!(error = %e, thread_id = %thread.id, "message count failed");
                outcome.state.messages.len()
            }
        };
        let new_messages = &outcome.state.messages[persisted.min(outcome.state.messages.len())..];
        for message in new_messages {
            if let Err(e) = runtime.messages.append(message.clone()).await {
                tracing::warn!(error = %e, thread_id = %thread.id, "message flush failed");
            }
        }
        thread.message_count += new_messages.len() as u64;
        thread.token_count += outcome.state.total_tokens.saturating_sub(tokens_before);
        thread.updated_at = chrono::Utc::now();
        if let Err(e) = runtime.threads.update(&thread).await {
            tracing::warn!(error = %e, thread_id = %thread.id, "thread update failed");
        }
    }

    let completed = matches!(outcome.terminal, Terminal::Done { .. });
    let _ = tx.send(outcome.terminal.into_event()).await;

    if completed && runtime.config.auto_title {
        if let Some(seed) = title_seed {
            crate::title::spawn_title_generation(runtime, thread.id.clone(), seed);
        }
    }
}
