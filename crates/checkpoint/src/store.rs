//! Checkpoint storage backends.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use sp_domain::error::{Error, Result};
use sp_domain::state::Checkpoint;

/// Storage contract for checkpoints.
///
/// Keyed by `(thread_id, step)` with a secondary by-id lookup. Writes must
/// be durable before returning (the in-memory backend is exempt — it exists
/// for dev/test and is lost on restart by design).
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()>;

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>>;

    /// The checkpoint with the highest step for the thread.
    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Most recent first.
    async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>>;

    /// Remove specific checkpoints from a thread (retention sweep).
    async fn remove(&self, thread_id: &str, checkpoint_ids: &[String]) -> Result<()>;

    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// All threads with at least one checkpoint (sweep enumeration).
    async fn thread_ids(&self) -> Result<Vec<String>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Dev/test backend. Lost on restart.
#[derive(Default)]
pub struct MemoryCheckpointStore {
    /// thread_id -> checkpoints ordered by step ascending.
    by_thread: RwLock<HashMap<String, Vec<Checkpoint>>>,
    /// checkpoint id -> thread_id.
    by_id: RwLock<HashMap<String, String>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        self.by_id
            .write()
            .insert(checkpoint.id.clone(), checkpoint.thread_id.clone());
        self.by_thread
            .write()
            .entry(checkpoint.thread_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        let thread_id = match self.by_id.read().get(checkpoint_id) {
            Some(t) => t.clone(),
            None => return Ok(None),
        };
        Ok(self
            .by_thread
            .read()
            .get(&thread_id)
            .and_then(|v| v.iter().find(|c| c.id == checkpoint_id))
            .cloned())
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .by_thread
            .read()
            .get(thread_id)
            .and_then(|v| v.iter().max_by_key(|c| c.step))
            .cloned())
    }

    async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>> {
        let mut all = self
            .by_thread
            .read()
            .get(thread_id)
            .cloned()
            .unwrap_or_default();
        all.sort_by(|a, b| b.step.cmp(&a.step));
        all.truncate(limit);
        Ok(all)
    }

    async fn remove(&self, thread_id: &str, checkpoint_ids: &[String]) -> Result<()> {
        if let Some(v) = self.by_thread.write().get_mut(thread_id) {
            v.retain(|c| !checkpoint_ids.contains(&c.id));
        }
        let mut by_id = self.by_id.write();
        for id in checkpoint_ids {
            by_id.remove(id);
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        if let Some(removed) = self.by_thread.write().remove(thread_id) {
            let mut by_id = self.by_id.write();
            for c in removed {
                by_id.remove(&c.id);
            }
        }
        Ok(())
    }

    async fn thread_ids(&self) -> Result<Vec<String>> {
        Ok(self.by_thread.read().keys().cloned().collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File-backed backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable backend: one JSON document per thread under `root/`.
///
/// Saves write to a temp file, fsync, then rename over the live document, so
/// a crash mid-write leaves the previous generation intact. Within a thread,
/// writes are already serialized by the dispatcher's advisory lock; the
/// store-level lock only guards cross-thread map access.
pub struct FileCheckpointStore {
    root: PathBuf,
    /// Per-thread write serialization for callers that bypass the advisory lock.
    io_lock: parking_lot::Mutex<()>,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            io_lock: parking_lot::Mutex::new(()),
        })
    }

    fn thread_path(&self, thread_id: &str) -> PathBuf {
        // Thread ids are UUIDs; keep a defensively flat namespace anyway.
        let safe: String = thread_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{safe}.json"))
    }

    fn read_thread(&self, path: &Path) -> Result<Vec<Checkpoint>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_thread(&self, path: &Path, checkpoints: &[Checkpoint]) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(serde_json::to_string(checkpoints)?.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn put(&self, checkpoint: Checkpoint) -> Result<()> {
        let _g = self.io_lock.lock();
        let path = self.thread_path(&checkpoint.thread_id);
        let mut all = self.read_thread(&path)?;
        all.push(checkpoint);
        self.write_thread(&path, &all)
    }

    async fn get(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>> {
        // No global by-id index on disk; scan thread documents.
        for thread_id in self.thread_ids().await? {
            let path = self.thread_path(&thread_id);
            if let Some(c) = self
                .read_thread(&path)?
                .into_iter()
                .find(|c| c.id == checkpoint_id)
            {
                return Ok(Some(c));
            }
        }
        Ok(None)
    }

    async fn latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.thread_path(thread_id);
        Ok(self
            .read_thread(&path)?
            .into_iter()
            .max_by_key(|c| c.step))
    }

    async fn history(&self, thread_id: &str, limit: usize) -> Result<Vec<Checkpoint>> {
        let path = self.thread_path(thread_id);
        let mut all = self.read_thread(&path)?;
        all.sort_by(|a, b| b.step.cmp(&a.step));
        all.truncate(limit);
        Ok(all)
    }

    async fn remove(&self, thread_id: &str, checkpoint_ids: &[String]) -> Result<()> {
        let _g = self.io_lock.lock();
        let path = self.thread_path(thread_id);
        let mut all = self.read_thread(&path)?;
        all.retain(|c| !checkpoint_ids.contains(&c.id));
        self.write_thread(&path, &all)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _g = self.io_lock.lock();
        let path = self.thread_path(thread_id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn thread_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}
