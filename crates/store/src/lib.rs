//! Repository contracts consumed by the core, plus reference backends.
//!
//! The core never sees a physical schema — it talks to these traits. The
//! in-memory backends serve dev/test; the file-backed thread and message
//! stores are the small-deployment default. A relational deployment swaps in
//! its own implementations without touching callers.

pub mod credentials;
pub mod messages;
pub mod quota;
pub mod threads;

pub use credentials::{
    CredentialRepository, KeyCipher, MemoryCredentialStore, ProviderCredential, ReversingCipher,
};
pub use messages::{FileMessageLog, MemoryMessageStore, MessageRepository};
pub use quota::{
    Capability, KeySource, MemoryQuotaStore, QuotaDecision, QuotaExceeded, QuotaLedger,
    QuotaRepository, UsageLogEntry,
};
pub use threads::{FileThreadStore, MemoryThreadStore, ThreadRepository};
