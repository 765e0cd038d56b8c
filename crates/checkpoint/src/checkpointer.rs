//! The checkpointer facade consumed by the engine and dispatcher.

use std::sync::Arc;

use sp_domain::error::{Error, Result};
use sp_domain::state::{AgentState, Checkpoint, CheckpointDiff};

use crate::store::CheckpointStore;

/// Saves and loads engine state snapshots, enforcing lineage rules.
///
/// Within a thread, steps are strictly sequential: a save at step `n` must
/// name the step `n-1` checkpoint as its parent. Cross-thread saves are
/// independent. The dispatcher's per-thread advisory lock is what keeps two
/// processes from advancing the same thread concurrently; the monotonicity
/// check here turns any violation into a hard error instead of corruption.
#[derive(Clone)]
pub struct Checkpointer {
    store: Arc<dyn CheckpointStore>,
}

impl Checkpointer {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CheckpointStore> {
        &self.store
    }

    /// Persist `state` as the next step of the thread's lineage and return
    /// the new checkpoint. Durable before returning (backend permitting).
    pub async fn append(&self, thread_id: &str, state: AgentState) -> Result<Checkpoint> {
        let latest = self.store.latest(thread_id).await?;
        let (step, parent_id) = match &latest {
            Some(prev) => (prev.step + 1, Some(prev.id.clone())),
            None => (0, None),
        };
        let checkpoint = Checkpoint::new(thread_id, step, parent_id, state);
        self.store.put(checkpoint.clone()).await?;
        tracing::debug!(thread_id, step, checkpoint_id = %checkpoint.id, "checkpoint saved");
        Ok(checkpoint)
    }

    /// Persist at an explicit position in the lineage. Rejects saves that
    /// would break step monotonicity or parent linkage.
    pub async fn save(
        &self,
        thread_id: &str,
        step: u64,
        parent_id: Option<String>,
        state: AgentState,
    ) -> Result<Checkpoint> {
        let latest = self.store.latest(thread_id).await?;
        match &latest {
            Some(prev) => {
                if step != prev.step + 1 {
                    return Err(Error::Conflict(format!(
                        "thread {thread_id}: save at step {step} but latest is {}",
                        prev.step
                    )));
                }
                if parent_id.as_deref() != Some(prev.id.as_str()) {
                    return Err(Error::Conflict(format!(
                        "thread {thread_id}: parent must be the step-{} checkpoint",
                        prev.step
                    )));
                }
            }
            None => {
                if step != 0 || parent_id.is_some() {
                    return Err(Error::Conflict(format!(
                        "thread {thread_id}: first checkpoint must be step 0 with no parent"
                    )));
                }
            }
        }

        let checkpoint = Checkpoint::new(thread_id, step, parent_id, state);
        self.store.put(checkpoint.clone()).await?;
        Ok(checkpoint)
    }

    pub async fn load(&self, checkpoint_id: &str) -> Result<Checkpoint> {
        self.store
            .get(checkpoint_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    pub async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        self.store.latest(thread_id).await
    }

    pub async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>> {
        self.store.history(thread_id, limit).await
    }

    pub async fn diff(&self, a_id: &str, b_id: &str) -> Result<CheckpointDiff> {
        let a = self.load(a_id).await?;
        let b = self.load(b_id).await?;
        Ok(CheckpointDiff::between(&a, &b))
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.store.delete_thread(thread_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCheckpointStore;
    use sp_domain::state::RunStatus;
    use sp_domain::thread::Message;

    fn checkpointer() -> Checkpointer {
        Checkpointer::new(Arc::new(MemoryCheckpointStore::new()))
    }

    #[tokio::test]
    async fn append_builds_a_linear_lineage() {
        let cp = checkpointer();
        let c0 = cp.append("t-1", AgentState::new(vec![])).await.unwrap();
        let c1 = cp.append("t-1", AgentState::new(vec![])).await.unwrap();
        let c2 = cp.append("t-1", AgentState::new(vec![])).await.unwrap();

        assert_eq!((c0.step, c1.step, c2.step), (0, 1, 2));
        assert_eq!(c1.parent_id.as_deref(), Some(c0.id.as_str()));
        assert_eq!(c2.parent_id.as_deref(), Some(c1.id.as_str()));
    }

    #[tokio::test]
    async fn explicit_save_rejects_gaps_and_bad_parents() {
        let cp = checkpointer();
        let c0 = cp
            .save("t-1", 0, None, AgentState::new(vec![]))
            .await
            .unwrap();

        // Gap in steps.
        let err = cp
            .save("t-1", 2, Some(c0.id.clone()), AgentState::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // Wrong parent.
        let err = cp
            .save("t-1", 1, Some("bogus".into()), AgentState::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // First save must be step 0.
        let err = cp
            .save("t-2", 1, None, AgentState::new(vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let cp = checkpointer();
        let err = cp.load("nope").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn diff_reports_state_delta() {
        let cp = checkpointer();
        let c0 = cp.append("t-1", AgentState::new(vec![])).await.unwrap();

        let mut later = AgentState::new(vec![
            Message::user("t-1", "hi"),
            Message::assistant("t-1", "hello"),
        ]);
        later.iteration = 1;
        later.total_tokens = 25;
        later.status = RunStatus::Completed;
        let c1 = cp.append("t-1", later).await.unwrap();

        let d = cp.diff(&c0.id, &c1.id).await.unwrap();
        assert_eq!(d.messages_added, 2);
        assert_eq!(d.tokens_delta, 25);
        assert_eq!(d.status_to, RunStatus::Completed);
    }
}
