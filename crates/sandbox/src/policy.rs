//! Session policy — the knobs, separated from the driver mechanism.

use std::time::Duration;

use sp_domain::config::SandboxConfig;

/// Lifecycle limits applied by the [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub idle_timeout: Duration,
    pub max_session_duration: Duration,
    pub max_per_user: usize,
    pub reaper_interval: Duration,
    pub boot_timeout: Duration,
    /// All runtime names start with this; the orphan sweep refuses to touch
    /// anything that doesn't.
    pub name_prefix: String,
    pub image: String,
}

impl From<&SandboxConfig> for SessionPolicy {
    fn from(cfg: &SandboxConfig) -> Self {
        Self {
            idle_timeout: Duration::from_secs(cfg.idle_timeout_secs),
            max_session_duration: Duration::from_secs(cfg.max_duration_secs),
            max_per_user: cfg.max_per_user as usize,
            reaper_interval: Duration::from_secs(cfg.reaper_interval_secs),
            boot_timeout: Duration::from_secs(cfg.boot_timeout_secs),
            name_prefix: cfg.name_prefix.clone(),
            image: cfg.image.clone(),
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        (&SandboxConfig::default()).into()
    }
}
