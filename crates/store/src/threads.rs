//! Thread repository.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use sp_domain::error::{Error, Result};
use sp_domain::thread::{Principal, Thread};

#[async_trait::async_trait]
pub trait ThreadRepository: Send + Sync {
    async fn create(&self, thread: Thread) -> Result<()>;

    async fn get(&self, thread_id: &str) -> Result<Option<Thread>>;

    async fn list_owned(&self, owner: &Principal) -> Result<Vec<Thread>>;

    /// Full replace keyed by `thread.id`. Fails with `not_found` when the
    /// thread does not exist.
    async fn update(&self, thread: &Thread) -> Result<()>;

    async fn delete(&self, thread_id: &str) -> Result<()>;

    /// Every thread, regardless of owner. Used by the TTL sweep.
    async fn list_all(&self) -> Result<Vec<Thread>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryThreadStore {
    threads: RwLock<HashMap<String, Thread>>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ThreadRepository for MemoryThreadStore {
    async fn create(&self, thread: Thread) -> Result<()> {
        self.threads.write().insert(thread.id.clone(), thread);
        Ok(())
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.read().get(thread_id).cloned())
    }

    async fn list_owned(&self, owner: &Principal) -> Result<Vec<Thread>> {
        let mut owned: Vec<Thread> = self
            .threads
            .read()
            .values()
            .filter(|t| &t.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(owned)
    }

    async fn update(&self, thread: &Thread) -> Result<()> {
        let mut threads = self.threads.write();
        match threads.get_mut(&thread.id) {
            Some(existing) => {
                *existing = thread.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("thread {}", thread.id))),
        }
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.threads.write().remove(thread_id);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<Thread>> {
        Ok(self.threads.read().values().cloned().collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread store persisted as a single `threads.json` document under the
/// state path. Loaded eagerly at startup, written through on every mutation.
pub struct FileThreadStore {
    path: PathBuf,
    threads: RwLock<HashMap<String, Thread>>,
}

impl FileThreadStore {
    pub fn new(state_path: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_path)?;
        let path = state_path.join("threads.json");

        let threads = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            HashMap::new()
        };

        tracing::info!(
            threads = threads.len(),
            path = %path.display(),
            "thread store loaded"
        );

        Ok(Self {
            path,
            threads: RwLock::new(threads),
        })
    }

    fn flush(&self) -> Result<()> {
        let threads = self.threads.read();
        let json = serde_json::to_string_pretty(&*threads)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ThreadRepository for FileThreadStore {
    async fn create(&self, thread: Thread) -> Result<()> {
        self.threads.write().insert(thread.id.clone(), thread);
        self.flush()
    }

    async fn get(&self, thread_id: &str) -> Result<Option<Thread>> {
        Ok(self.threads.read().get(thread_id).cloned())
    }

    async fn list_owned(&self, owner: &Principal) -> Result<Vec<Thread>> {
        let mut owned: Vec<Thread> = self
            .threads
            .read()
            .values()
            .filter(|t| &t.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(owned)
    }

    async fn update(&self, thread: &Thread) -> Result<()> {
        {
            let mut threads = self.threads.write();
            match threads.get_mut(&thread.id) {
                Some(existing) => *existing = thread.clone(),
                None => return Err(Error::NotFound(format!("thread {}", thread.id))),
            }
        }
        self.flush()
    }

    async fn delete(&self, thread_id: &str) -> Result<()> {
        self.threads.write().remove(thread_id);
        self.flush()
    }

    async fn list_all(&self) -> Result<Vec<Thread>> {
        Ok(self.threads.read().values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(repo: &dyn ThreadRepository) {
        let alice = Principal::Registered("alice".into());
        let bob = Principal::Anonymous("cookie-1".into());

        let t1 = Thread::new(alice.clone(), None);
        let t1_id = t1.id.clone();
        repo.create(t1).await.unwrap();
        repo.create(Thread::new(alice.clone(), Some("coder".into())))
            .await
            .unwrap();
        repo.create(Thread::new(bob.clone(), None)).await.unwrap();

        assert_eq!(repo.list_owned(&alice).await.unwrap().len(), 2);
        assert_eq!(repo.list_owned(&bob).await.unwrap().len(), 1);
        assert_eq!(repo.list_all().await.unwrap().len(), 3);

        let mut t1 = repo.get(&t1_id).await.unwrap().unwrap();
        t1.title = "renamed".into();
        t1.title_is_autogenerated = false;
        t1.message_count = 4;
        repo.update(&t1).await.unwrap();
        let reread = repo.get(&t1_id).await.unwrap().unwrap();
        assert_eq!(reread.title, "renamed");
        assert_eq!(reread.message_count, 4);

        repo.delete(&t1_id).await.unwrap();
        assert!(repo.get(&t1_id).await.unwrap().is_none());

        // Updating a deleted thread is an error.
        assert!(matches!(
            repo.update(&t1).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn memory_backend() {
        exercise(&MemoryThreadStore::new()).await;
    }

    #[tokio::test]
    async fn file_backend() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileThreadStore::new(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn file_backend_reloads_state() {
        let dir = tempfile::tempdir().unwrap();
        let thread = Thread::new(Principal::Registered("alice".into()), None);
        let id = thread.id.clone();
        {
            let repo = FileThreadStore::new(dir.path()).unwrap();
            repo.create(thread).await.unwrap();
        }
        let repo = FileThreadStore::new(dir.path()).unwrap();
        assert!(repo.get(&id).await.unwrap().is_some());
    }
}
