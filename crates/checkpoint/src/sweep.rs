//! Checkpoint retention sweep.
//!
//! Deletes checkpoints older than the retention window from the tail of each
//! thread's lineage, always preserving the most recent N per thread so a
//! dormant conversation stays resumable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use sp_domain::config::CheckpointConfig;
use sp_domain::error::Result;

use crate::store::CheckpointStore;

/// One sweep pass. Returns the number of checkpoints removed.
pub async fn sweep_once(
    store: &Arc<dyn CheckpointStore>,
    retention: chrono::Duration,
    min_retained: usize,
) -> Result<u64> {
    let cutoff = Utc::now() - retention;
    let mut removed = 0u64;

    for thread_id in store.thread_ids().await? {
        // History is most recent first; everything past the protected head
        // that predates the cutoff goes.
        let history = store.history(&thread_id, usize::MAX).await?;
        let expired: Vec<String> = history
            .iter()
            .skip(min_retained)
            .filter(|c| c.created_at < cutoff)
            .map(|c| c.id.clone())
            .collect();

        if !expired.is_empty() {
            removed += expired.len() as u64;
            store.remove(&thread_id, &expired).await?;
            tracing::debug!(
                thread_id = %thread_id,
                count = expired.len(),
                "swept expired checkpoints"
            );
        }
    }

    Ok(removed)
}

/// Spawn the periodic sweeper. Runs until the handle is aborted.
pub fn spawn_retention_sweep(
    store: Arc<dyn CheckpointStore>,
    cfg: CheckpointConfig,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_secs(cfg.sweep_interval_secs.max(1));
    let retention = chrono::Duration::days(cfg.retention_days as i64);
    let min_retained = cfg.min_retained_per_thread as usize;

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_once(&store, retention, min_retained).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, "checkpoint retention sweep"),
                Err(e) => tracing::warn!(error = %e, "checkpoint retention sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryCheckpointStore;
    use sp_domain::state::{AgentState, Checkpoint};

    fn aged(thread: &str, step: u64, age_days: i64) -> Checkpoint {
        let mut c = Checkpoint::new(thread, step, None, AgentState::new(vec![]));
        c.created_at = Utc::now() - chrono::Duration::days(age_days);
        c
    }

    #[tokio::test]
    async fn sweep_removes_old_tail_only() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        // Steps 0..=4, steps 0-2 are 10 days old.
        for step in 0..5u64 {
            let age = if step < 3 { 10 } else { 0 };
            store.put(aged("t-1", step, age)).await.unwrap();
        }

        // Protected head is steps 4,3,2 (most recent three); steps 1 and 0
        // are expired and past the head.
        let removed = sweep_once(&store, chrono::Duration::days(7), 3).await.unwrap();
        assert_eq!(removed, 2);

        let left = store.history("t-1", usize::MAX).await.unwrap();
        assert_eq!(left.iter().map(|c| c.step).collect::<Vec<_>>(), vec![4, 3, 2]);
    }

    #[tokio::test]
    async fn sweep_preserves_min_retained_regardless_of_age() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        for step in 0..3u64 {
            store.put(aged("t-1", step, 30)).await.unwrap();
        }

        let removed = sweep_once(&store, chrono::Duration::days(7), 3).await.unwrap();
        assert_eq!(removed, 0);
        assert_eq!(store.history("t-1", usize::MAX).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_threads_alone() {
        let store: Arc<dyn CheckpointStore> = Arc::new(MemoryCheckpointStore::new());
        for step in 0..10u64 {
            store.put(aged("t-1", step, 0)).await.unwrap();
        }
        let removed = sweep_once(&store, chrono::Duration::days(7), 3).await.unwrap();
        assert_eq!(removed, 0);
    }
}
