//! Anonymous-thread TTL sweep.
//!
//! Anonymous (cookie-owned) threads expire after `anonymous.ttl_days` of
//! inactivity: the thread, its messages, its checkpoints, and its sandbox
//! all go. Registered users' threads are never swept.

use std::sync::Arc;

use chrono::{Duration, Utc};

use sp_domain::error::Result;

use crate::CoreRuntime;

/// One sweep pass. Returns the number of threads deleted.
pub async fn sweep_anonymous_once(runtime: &Arc<CoreRuntime>) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(runtime.config.anonymous.ttl_days as i64);
    let mut deleted = 0u64;

    for thread in runtime.threads.list_all().await? {
        if !thread.owner.is_anonymous() || thread.updated_at >= cutoff {
            continue;
        }
        // Never sweep under a live turn.
        if runtime.cancels.is_running(&thread.id) {
            continue;
        }
        match runtime.delete_thread(&thread.id).await {
            Ok(()) => {
                deleted += 1;
                tracing::info!(thread_id = %thread.id, "expired anonymous thread deleted");
            }
            Err(e) => {
                tracing::warn!(thread_id = %thread.id, error = %e, "anonymous sweep delete failed")
            }
        }
    }

    Ok(deleted)
}

/// Spawn the periodic sweeper (hourly). Runs until aborted.
pub fn spawn_anonymous_sweep(runtime: Arc<CoreRuntime>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_anonymous_once(&runtime).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(deleted = n, "anonymous TTL sweep"),
                Err(e) => tracing::warn!(error = %e, "anonymous TTL sweep failed"),
            }
        }
    })
}
