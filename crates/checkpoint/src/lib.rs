//! Durable per-thread checkpoints.
//!
//! Two interchangeable backends sit behind [`CheckpointStore`]: an in-memory
//! map for dev/test and a file-backed store for production. Callers only see
//! the [`Checkpointer`] facade; nothing outside this crate peeks at the
//! physical layout.

mod checkpointer;
mod store;
pub mod sweep;

pub use checkpointer::Checkpointer;
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
