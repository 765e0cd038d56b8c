//! Per-thread advisory locks.
//!
//! One turn at a time per thread: a second `start_turn` queues behind the
//! running one, while a `resume_turn` racing a running turn is rejected with
//! a conflict instead of queuing (resuming mid-turn is never meaningful).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Map of thread id → `Semaphore(1)`. Holding the permit is holding the
/// thread's advisory lock; it releases on drop, covering every exit path.
#[derive(Default)]
pub struct ThreadLockMap {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl ThreadLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore(&self, thread_id: &str) -> Arc<Semaphore> {
        self.locks
            .lock()
            .entry(thread_id.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Acquire the thread lock, waiting behind a running turn.
    pub async fn acquire(&self, thread_id: &str) -> OwnedSemaphorePermit {
        let sem = self.semaphore(thread_id);
        // The semaphore is never closed, so acquisition cannot fail.
        sem.acquire_owned()
            .await
            .expect("thread lock semaphore closed")
    }

    /// Acquire without waiting. `None` means a turn is in flight.
    pub fn try_acquire(&self, thread_id: &str) -> Option<OwnedSemaphorePermit> {
        self.semaphore(thread_id).try_acquire_owned().ok()
    }

    /// Number of tracked threads (monitoring).
    pub fn thread_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop lock entries for threads with no turn in flight.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_acquire_release() {
        let map = ThreadLockMap::new();
        let p1 = map.acquire("t-1").await;
        drop(p1);
        let p2 = map.acquire("t-1").await;
        drop(p2);
    }

    #[tokio::test]
    async fn distinct_threads_do_not_contend() {
        let map = ThreadLockMap::new();
        let _p1 = map.acquire("t-1").await;
        let _p2 = map.acquire("t-2").await;
        assert_eq!(map.thread_count(), 2);
    }

    #[tokio::test]
    async fn try_acquire_conflicts_with_running_turn() {
        let map = ThreadLockMap::new();
        let held = map.acquire("t-1").await;
        assert!(map.try_acquire("t-1").is_none());
        drop(held);
        assert!(map.try_acquire("t-1").is_some());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let map = Arc::new(ThreadLockMap::new());
        let held = map.acquire("t-1").await;

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire("t-1").await;
            7
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn prune_drops_idle_entries() {
        let map = ThreadLockMap::new();
        {
            let _p = map.acquire("t-1").await;
            let _q = map.acquire("t-2").await;
            map.prune_idle();
            assert_eq!(map.thread_count(), 2);
        }
        map.prune_idle();
        assert_eq!(map.thread_count(), 0);
    }
}
