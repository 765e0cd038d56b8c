//! Per-thread cancellation tokens.
//!
//! Each running turn registers a token keyed by thread id. Cancelling stops
//! the turn at its next suspension point; the engine decides how much of the
//! in-flight work to keep.

use std::collections::HashMap;

use parking_lot::Mutex;

/// A cancellation token checked (and awaited) by the engine loop.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }
}

/// Active cancellation tokens, one per running turn.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a fresh token for a thread's turn.
    pub fn register(&self, thread_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(thread_id.to_owned(), token.clone());
        token
    }

    /// Cancel the running turn for a thread. `false` when none is running.
    pub fn cancel(&self, thread_id: &str) -> bool {
        match self.tokens.lock().get(thread_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token when a turn finishes.
    pub fn remove(&self, thread_id: &str) {
        self.tokens.lock().remove(thread_id);
    }

    pub fn is_running(&self, thread_id: &str) -> bool {
        self.tokens.lock().contains_key(thread_id)
    }
}
