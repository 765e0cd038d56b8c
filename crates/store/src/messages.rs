//! Message repository. Messages are append-only.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use sp_domain::error::{Error, Result};
use sp_domain::thread::Message;

#[async_trait::async_trait]
pub trait MessageRepository: Send + Sync {
    async fn append(&self, message: Message) -> Result<()>;

    /// All messages in thread order.
    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>>;

    async fn count_by_thread(&self, thread_id: &str) -> Result<u64>;

    /// Cascade used when a thread is deleted.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Default)]
pub struct MemoryMessageStore {
    by_thread: RwLock<HashMap<String, Vec<Message>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl MessageRepository for MemoryMessageStore {
    async fn append(&self, message: Message) -> Result<()> {
        self.by_thread
            .write()
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .by_thread
            .read()
            .get(thread_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn count_by_thread(&self, thread_id: &str) -> Result<u64> {
        Ok(self
            .by_thread
            .read()
            .get(thread_id)
            .map(|v| v.len() as u64)
            .unwrap_or(0))
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.by_thread.write().remove(thread_id);
        Ok(())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Append-only JSONL log, one file per thread under `root/messages/`.
/// Appends are O(1); reads parse the whole file (message history is bounded
/// by context windows in practice).
pub struct FileMessageLog {
    root: PathBuf,
    io_lock: parking_lot::Mutex<()>,
}

impl FileMessageLog {
    pub fn new(state_path: &Path) -> Result<Self> {
        let root = state_path.join("messages");
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            io_lock: parking_lot::Mutex::new(()),
        })
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        let safe: String = thread_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }
}

#[async_trait::async_trait]
impl MessageRepository for FileMessageLog {
    async fn append(&self, message: Message) -> Result<()> {
        let _g = self.io_lock.lock();
        let path = self.thread_path(&message.thread_id);
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(f, "{}", serde_json::to_string(&message)?)?;
        Ok(())
    }

    async fn list_by_thread(&self, thread_id: &str) -> Result<Vec<Message>> {
        let path = self.thread_path(thread_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Message>(line) {
                Ok(m) => messages.push(m),
                // A torn trailing line from a crash is dropped, not fatal.
                Err(e) => tracing::warn!(thread_id, error = %e, "skipping corrupt message line"),
            }
        }
        Ok(messages)
    }

    async fn count_by_thread(&self, thread_id: &str) -> Result<u64> {
        Ok(self.list_by_thread(thread_id).await?.len() as u64)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _g = self.io_lock.lock();
        match std::fs::remove_file(self.thread_path(thread_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(repo: &dyn MessageRepository) {
        repo.append(Message::user("t-1", "first")).await.unwrap();
        repo.append(Message::assistant("t-1", "second")).await.unwrap();
        repo.append(Message::user("t-2", "other thread")).await.unwrap();

        let msgs = repo.list_by_thread("t-1").await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "first");
        assert_eq!(msgs[1].content, "second");
        assert_eq!(repo.count_by_thread("t-1").await.unwrap(), 2);
        assert_eq!(repo.count_by_thread("t-9").await.unwrap(), 0);

        repo.delete_thread("t-1").await.unwrap();
        assert!(repo.list_by_thread("t-1").await.unwrap().is_empty());
        assert_eq!(repo.count_by_thread("t-2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn memory_backend() {
        exercise(&MemoryMessageStore::new()).await;
    }

    #[tokio::test]
    async fn file_backend() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FileMessageLog::new(dir.path()).unwrap()).await;
    }

    #[tokio::test]
    async fn file_backend_skips_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileMessageLog::new(dir.path()).unwrap();
        log.append(Message::user("t-1", "good")).await.unwrap();

        // Simulate a crash mid-append.
        let path = dir.path().join("messages").join("t-1.jsonl");
        let mut f = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        f.write_all(b"{\"id\":\"trunc").unwrap();

        let msgs = log.list_by_thread("t-1").await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "good");
    }
}
