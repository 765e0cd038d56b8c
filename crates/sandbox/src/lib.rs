//! Sandbox session management.
//!
//! One long-lived isolated runtime per conversation thread, so state built
//! up by one tool call (an installed package, a written file) is visible to
//! later calls in the same thread. The [`SessionManager`] owns policy
//! (quotas, timeouts, eviction); the [`SandboxDriver`] owns mechanism
//! (start/stop/exec of the actual runtime).

mod driver;
mod manager;
mod policy;

pub use driver::{DockerCliDriver, ExecOutput, ResourceLimits, RuntimeListing, SandboxDriver};
pub use manager::{
    CleanupReason, SandboxHistory, SandboxInfo, SandboxSession, SessionManager, SessionState,
    ThreadLiveness,
};
pub use policy::SessionPolicy;
