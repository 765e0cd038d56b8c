//! The sandbox session manager — the one per-process global.
//!
//! Owns three maps (`sessions`, `by_thread`, `by_user`) behind a single
//! mutex. The mutex is held only for map mutation; runtime boots and
//! terminations happen outside it so a slow Docker daemon never stalls
//! unrelated threads.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use sp_domain::error::{Error, Result};

use crate::driver::{ResourceLimits, SandboxDriver};
use crate::policy::SessionPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Idle,
    Evicted,
    Terminated,
}

/// Why a session was torn down. Stored in the thread's sandbox history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupReason {
    IdleTimeout,
    MaxDuration,
    ThreadDeleted,
    UserRequest,
    QuotaEvicted,
    Orphaned,
    BootFailed,
}

impl std::fmt::Display for CleanupReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::IdleTimeout => "idle_timeout",
            Self::MaxDuration => "max_duration",
            Self::ThreadDeleted => "thread_deleted",
            Self::UserRequest => "user_request",
            Self::QuotaEvicted => "quota_evicted",
            Self::Orphaned => "orphaned",
            Self::BootFailed => "boot_failed",
        };
        f.write_str(s)
    }
}

/// A live isolated runtime bound to one thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSession {
    pub sandbox_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub installed_packages: BTreeSet<String>,
    pub created_files: BTreeSet<String>,
}

/// What `acquire` hands back to the tool invoker.
#[derive(Debug, Clone)]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub thread_id: String,
    pub user_id: String,
    pub is_new: bool,
    /// A prior sandbox for this thread existed and was cleaned up; its
    /// history is available for replay.
    pub is_recreated: bool,
    pub installed_packages: BTreeSet<String>,
    pub created_files: BTreeSet<String>,
}

/// Per-thread record that outlives the live session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxHistory {
    pub installed_packages: BTreeSet<String>,
    pub created_files: BTreeSet<String>,
    pub last_cleanup_reason: Option<CleanupReason>,
    pub cleaned_at: Option<DateTime<Utc>>,
}

/// Probe used by the reaper to drop sessions whose thread is gone. The core
/// adapts its thread repository to this; the manager stays storage-agnostic.
#[async_trait::async_trait]
pub trait ThreadLiveness: Send + Sync {
    async fn thread_exists(&self, thread_id: &str) -> bool;
}

#[derive(Default)]
struct Maps {
    sessions: HashMap<String, SandboxSession>,
    by_thread: HashMap<String, String>,
    by_user: HashMap<String, HashSet<String>>,
}

impl Maps {
    fn unlink(&mut self, sandbox_id: &str) -> Option<SandboxSession> {
        let session = self.sessions.remove(sandbox_id)?;
        if self
            .by_thread
            .get(&session.thread_id)
            .is_some_and(|id| id.as_str() == sandbox_id)
        {
            self.by_thread.remove(&session.thread_id);
        }
        if let Some(set) = self.by_user.get_mut(&session.user_id) {
            set.remove(sandbox_id);
            if set.is_empty() {
                self.by_user.remove(&session.user_id);
            }
        }
        Some(session)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SessionManager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SessionManager {
    policy: SessionPolicy,
    driver: Arc<dyn SandboxDriver>,
    limits: ResourceLimits,
    maps: Mutex<Maps>,
    history: RwLock<HashMap<String, SandboxHistory>>,
}

impl SessionManager {
    pub fn new(policy: SessionPolicy, driver: Arc<dyn SandboxDriver>) -> Self {
        Self {
            policy,
            driver,
            limits: ResourceLimits::default(),
            maps: Mutex::new(Maps::default()),
            history: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.policy
    }

    pub fn driver(&self) -> &Arc<dyn SandboxDriver> {
        &self.driver
    }

    // ── Acquire ──────────────────────────────────────────────────────

    /// Return the thread's live sandbox, creating one if absent.
    ///
    /// On creation, a user at their concurrency cap has their
    /// least-recently-used session evicted first. The runtime boot runs
    /// outside the manager mutex, bounded by the policy's boot timeout.
    pub async fn acquire(&self, user_id: &str, thread_id: &str) -> Result<SandboxInfo> {
        let (sandbox_id, evicted, had_history) = {
            let mut maps = self.maps.lock();

            // Existing live session for this thread.
            if let Some(id) = maps.by_thread.get(thread_id).cloned() {
                if let Some(session) = maps.sessions.get_mut(&id) {
                    session.last_activity = Utc::now();
                    session.state = SessionState::Active;
                    return Ok(Self::info_from(session, false, false));
                }
            }

            // At the cap: evict this user's LRU session.
            let mut evicted = None;
            let live: Vec<String> = maps
                .by_user
                .get(user_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default();
            if live.len() >= self.policy.max_per_user {
                let lru = live
                    .iter()
                    .filter_map(|id| maps.sessions.get(id))
                    .min_by_key(|s| s.last_activity)
                    .map(|s| s.sandbox_id.clone());
                if let Some(id) = lru {
                    evicted = maps.unlink(&id);
                }
            }

            let sandbox_id = format!("{}{}", self.policy.name_prefix, uuid::Uuid::new_v4());
            let now = Utc::now();
            let session = SandboxSession {
                sandbox_id: sandbox_id.clone(),
                thread_id: thread_id.to_string(),
                user_id: user_id.to_string(),
                state: SessionState::Starting,
                created_at: now,
                last_activity: now,
                installed_packages: BTreeSet::new(),
                created_files: BTreeSet::new(),
            };
            maps.by_thread
                .insert(thread_id.to_string(), sandbox_id.clone());
            maps.by_user
                .entry(user_id.to_string())
                .or_default()
                .insert(sandbox_id.clone());
            maps.sessions.insert(sandbox_id.clone(), session);

            let had_history = self.history.read().contains_key(thread_id);
            (sandbox_id, evicted, had_history)
        };

        if let Some(old) = evicted {
            self.finish_teardown(old, CleanupReason::QuotaEvicted).await;
        }

        // Boot outside the lock.
        let boot = tokio::time::timeout(
            self.policy.boot_timeout,
            self.driver
                .create(&sandbox_id, &self.policy.image, &self.limits),
        )
        .await;

        let boot_result = match boot {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!(
                "sandbox boot exceeded {:?}",
                self.policy.boot_timeout
            ))),
        };

        if let Err(e) = boot_result {
            let removed = self.maps.lock().unlink(&sandbox_id);
            if let Some(session) = removed {
                self.write_history(&session, CleanupReason::BootFailed);
            }
            // The runtime may be half-created; best-effort removal.
            let _ = self.driver.terminate(&sandbox_id).await;
            return Err(Error::Sandbox(format!("sandbox boot failed: {e}")));
        }

        let mut maps = self.maps.lock();
        match maps.sessions.get_mut(&sandbox_id) {
            Some(session) => {
                session.state = SessionState::Active;
                session.last_activity = Utc::now();
                Ok(Self::info_from(session, true, had_history))
            }
            // Reaped between boot and activation (thread deleted mid-boot).
            None => Err(Error::Sandbox("sandbox was reclaimed during boot".into())),
        }
    }

    fn info_from(session: &SandboxSession, is_new: bool, is_recreated: bool) -> SandboxInfo {
        SandboxInfo {
            sandbox_id: session.sandbox_id.clone(),
            thread_id: session.thread_id.clone(),
            user_id: session.user_id.clone(),
            is_new,
            is_recreated,
            installed_packages: session.installed_packages.clone(),
            created_files: session.created_files.clone(),
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────

    pub fn mark_activity(&self, sandbox_id: &str) {
        if let Some(session) = self.maps.lock().sessions.get_mut(sandbox_id) {
            session.last_activity = Utc::now();
            session.state = SessionState::Active;
        }
    }

    /// Record a package installed by a tool call (visible in history after
    /// eviction, so a recreated sandbox can be re-populated).
    pub fn record_package(&self, thread_id: &str, package: &str) {
        {
            let mut maps = self.maps.lock();
            if let Some(id) = maps.by_thread.get(thread_id).cloned() {
                if let Some(session) = maps.sessions.get_mut(&id) {
                    session.installed_packages.insert(package.to_string());
                }
            }
        }
        self.history
            .write()
            .entry(thread_id.to_string())
            .or_default()
            .installed_packages
            .insert(package.to_string());
    }

    pub fn record_file(&self, thread_id: &str, path: &str) {
        {
            let mut maps = self.maps.lock();
            if let Some(id) = maps.by_thread.get(thread_id).cloned() {
                if let Some(session) = maps.sessions.get_mut(&id) {
                    session.created_files.insert(path.to_string());
                }
            }
        }
        self.history
            .write()
            .entry(thread_id.to_string())
            .or_default()
            .created_files
            .insert(path.to_string());
    }

    pub fn session_for_thread(&self, thread_id: &str) -> Option<SandboxSession> {
        let maps = self.maps.lock();
        let id = maps.by_thread.get(thread_id)?;
        maps.sessions.get(id).cloned()
    }

    pub fn user_session_count(&self, user_id: &str) -> usize {
        self.maps
            .lock()
            .by_user
            .get(user_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }

    /// The thread's accumulated sandbox history, surviving eviction.
    pub fn history(&self, thread_id: &str) -> Option<SandboxHistory> {
        self.history.read().get(thread_id).cloned()
    }

    // ── Teardown ─────────────────────────────────────────────────────

    /// Explicit teardown, e.g. when the thread is deleted.
    pub async fn release(&self, thread_id: &str, reason: CleanupReason) -> bool {
        let session = {
            let mut maps = self.maps.lock();
            let id = match maps.by_thread.get(thread_id).cloned() {
                Some(id) => id,
                None => return false,
            };
            maps.unlink(&id)
        };
        match session {
            Some(s) => {
                self.finish_teardown(s, reason).await;
                true
            }
            None => false,
        }
    }

    async fn finish_teardown(&self, session: SandboxSession, reason: CleanupReason) {
        self.write_history(&session, reason);
        if let Err(e) = self.driver.terminate(&session.sandbox_id).await {
            tracing::warn!(
                sandbox = %session.sandbox_id,
                error = %e,
                "sandbox terminate failed"
            );
        }
        tracing::info!(
            sandbox = %session.sandbox_id,
            thread_id = %session.thread_id,
            reason = %reason,
            "sandbox session ended"
        );
    }

    fn write_history(&self, session: &SandboxSession, reason: CleanupReason) {
        let mut history = self.history.write();
        let entry = history.entry(session.thread_id.clone()).or_default();
        entry
            .installed_packages
            .extend(session.installed_packages.iter().cloned());
        entry
            .created_files
            .extend(session.created_files.iter().cloned());
        entry.last_cleanup_reason = Some(reason);
        entry.cleaned_at = Some(Utc::now());
    }

    // ── Reaper ───────────────────────────────────────────────────────

    fn due_for_cleanup(&self, session: &SandboxSession, now: DateTime<Utc>) -> Option<CleanupReason> {
        let idle = (now - session.last_activity)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if idle > self.policy.idle_timeout {
            return Some(CleanupReason::IdleTimeout);
        }
        let age = (now - session.created_at).to_std().unwrap_or(Duration::ZERO);
        if age > self.policy.max_session_duration {
            return Some(CleanupReason::MaxDuration);
        }
        None
    }

    /// One reaper pass. Returns the number of sessions terminated.
    pub async fn reap_once(&self, liveness: Option<&dyn ThreadLiveness>) -> usize {
        let now = Utc::now();
        let candidates: Vec<(String, String, Option<CleanupReason>)> = {
            let maps = self.maps.lock();
            maps.sessions
                .values()
                .filter(|s| s.state != SessionState::Starting)
                .map(|s| (s.sandbox_id.clone(), s.thread_id.clone(), self.due_for_cleanup(s, now)))
                .collect()
        };

        let mut doomed: Vec<(String, CleanupReason)> = Vec::new();
        for (sandbox_id, thread_id, reason) in candidates {
            if let Some(reason) = reason {
                doomed.push((sandbox_id, reason));
                continue;
            }
            if let Some(probe) = liveness {
                if !probe.thread_exists(&thread_id).await {
                    doomed.push((sandbox_id, CleanupReason::ThreadDeleted));
                }
            }
        }

        let mut reaped = 0;
        for (sandbox_id, reason) in doomed {
            let session = self.maps.lock().unlink(&sandbox_id);
            if let Some(session) = session {
                self.finish_teardown(session, reason).await;
                reaped += 1;
            }
        }
        reaped
    }

    /// Spawn the periodic reaper. Runs until aborted.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        liveness: Option<Arc<dyn ThreadLiveness>>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = manager.policy.reaper_interval.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let reaped = manager.reap_once(liveness.as_deref()).await;
                if reaped > 0 {
                    tracing::info!(reaped, "sandbox reaper pass");
                }
            }
        })
    }

    // ── Orphan reclamation ───────────────────────────────────────────

    /// Terminate runtimes that carry our name prefix but are unknown to the
    /// live map (left behind by a crashed prior process) and are older than
    /// `max_age`. Runtimes with an unparseable start time are treated as old.
    pub async fn reclaim_orphans(&self, max_age: Duration) -> Result<usize> {
        let listings = self.driver.list_all(&self.policy.name_prefix).await?;
        let known: HashSet<String> = self.maps.lock().sessions.keys().cloned().collect();
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());

        let mut reclaimed = 0;
        for listing in listings {
            if known.contains(&listing.name) {
                continue;
            }
            let old_enough = listing.created_at.map(|t| t < cutoff).unwrap_or(true);
            if !old_enough {
                continue;
            }
            match self.driver.terminate(&listing.name).await {
                Ok(()) => {
                    reclaimed += 1;
                    tracing::info!(sandbox = %listing.name, "orphaned runtime reclaimed");
                }
                Err(e) => {
                    tracing::warn!(sandbox = %listing.name, error = %e, "orphan reclaim failed")
                }
            }
        }
        Ok(reclaimed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{ExecOutput, RuntimeListing};
    use parking_lot::Mutex as PMutex;

    /// In-memory driver that records create/terminate calls.
    #[derive(Default)]
    struct FakeDriver {
        created: PMutex<Vec<String>>,
        terminated: PMutex<Vec<String>>,
        external: PMutex<Vec<RuntimeListing>>,
        fail_create: PMutex<bool>,
    }

    impl FakeDriver {
        fn created(&self) -> Vec<String> {
            self.created.lock().clone()
        }
        fn terminated(&self) -> Vec<String> {
            self.terminated.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl SandboxDriver for FakeDriver {
        async fn create(&self, name: &str, _image: &str, _limits: &ResourceLimits) -> Result<()> {
            if *self.fail_create.lock() {
                return Err(Error::Sandbox("boot refused".into()));
            }
            self.created.lock().push(name.to_string());
            Ok(())
        }

        async fn exec(
            &self,
            _name: &str,
            _command: &[String],
            _timeout: Duration,
        ) -> Result<ExecOutput> {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }

        async fn terminate(&self, name: &str) -> Result<()> {
            self.terminated.lock().push(name.to_string());
            Ok(())
        }

        async fn list_all(&self, prefix: &str) -> Result<Vec<RuntimeListing>> {
            let mut all: Vec<RuntimeListing> = self
                .created
                .lock()
                .iter()
                .map(|n| RuntimeListing {
                    name: n.clone(),
                    created_at: Some(Utc::now()),
                })
                .collect();
            all.extend(self.external.lock().iter().cloned());
            all.retain(|l| l.name.starts_with(prefix));
            Ok(all)
        }
    }

    fn manager_with(policy: SessionPolicy) -> (Arc<SessionManager>, Arc<FakeDriver>) {
        let driver = Arc::new(FakeDriver::default());
        let manager = Arc::new(SessionManager::new(policy, driver.clone()));
        (manager, driver)
    }

    fn test_policy() -> SessionPolicy {
        SessionPolicy {
            idle_timeout: Duration::from_secs(900),
            max_session_duration: Duration::from_secs(7200),
            max_per_user: 2,
            reaper_interval: Duration::from_secs(60),
            boot_timeout: Duration::from_secs(5),
            name_prefix: "spool-sbx-".into(),
            image: "python:3.12-slim".into(),
        }
    }

    #[tokio::test]
    async fn acquire_is_one_sandbox_per_thread() {
        let (mgr, driver) = manager_with(test_policy());

        let first = mgr.acquire("u1", "t-1").await.unwrap();
        assert!(first.is_new);
        assert!(first.sandbox_id.starts_with("spool-sbx-"));

        let second = mgr.acquire("u1", "t-1").await.unwrap();
        assert!(!second.is_new);
        assert_eq!(second.sandbox_id, first.sandbox_id);
        assert_eq!(driver.created().len(), 1);
    }

    #[tokio::test]
    async fn cap_evicts_least_recently_used() {
        let (mgr, driver) = manager_with(test_policy());

        let a = mgr.acquire("u1", "t-a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _b = mgr.acquire("u1", "t-b").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Third thread pushes the user over max_per_user=2; A is the LRU.
        let _c = mgr.acquire("u1", "t-c").await.unwrap();

        assert_eq!(mgr.user_session_count("u1"), 2);
        assert!(mgr.session_for_thread("t-a").is_none());
        assert_eq!(driver.terminated(), vec![a.sandbox_id.clone()]);
        assert_eq!(
            mgr.history("t-a").unwrap().last_cleanup_reason,
            Some(CleanupReason::QuotaEvicted)
        );

        // A fresh acquire on the evicted thread boots anew and sees history.
        let again = mgr.acquire("u1", "t-a").await.unwrap();
        assert!(again.is_new);
        assert!(again.is_recreated);
    }

    #[tokio::test]
    async fn boot_failure_unwinds_maps() {
        let (mgr, driver) = manager_with(test_policy());
        *driver.fail_create.lock() = true;

        let err = mgr.acquire("u1", "t-1").await.unwrap_err();
        assert!(matches!(err, Error::Sandbox(_)));
        assert!(mgr.session_for_thread("t-1").is_none());
        assert_eq!(mgr.user_session_count("u1"), 0);
    }

    #[tokio::test]
    async fn release_records_reason_and_terminates() {
        let (mgr, driver) = manager_with(test_policy());
        let info = mgr.acquire("u1", "t-1").await.unwrap();
        mgr.record_package("t-1", "requests");
        mgr.record_file("t-1", "/workspace/out.csv");

        assert!(mgr.release("t-1", CleanupReason::ThreadDeleted).await);
        assert!(!mgr.release("t-1", CleanupReason::ThreadDeleted).await);
        assert_eq!(driver.terminated(), vec![info.sandbox_id]);

        let hist = mgr.history("t-1").unwrap();
        assert_eq!(hist.last_cleanup_reason, Some(CleanupReason::ThreadDeleted));
        assert!(hist.installed_packages.contains("requests"));
        assert!(hist.created_files.contains("/workspace/out.csv"));
    }

    #[tokio::test]
    async fn reaper_terminates_idle_sessions() {
        let mut policy = test_policy();
        policy.idle_timeout = Duration::from_millis(10);
        let (mgr, _driver) = manager_with(policy);

        mgr.acquire("u1", "t-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(mgr.reap_once(None).await, 1);
        assert!(mgr.session_for_thread("t-1").is_none());
        assert_eq!(
            mgr.history("t-1").unwrap().last_cleanup_reason,
            Some(CleanupReason::IdleTimeout)
        );
    }

    #[tokio::test]
    async fn reaper_terminates_overage_sessions() {
        let mut policy = test_policy();
        policy.max_session_duration = Duration::from_millis(10);
        let (mgr, _driver) = manager_with(policy);

        mgr.acquire("u1", "t-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(mgr.reap_once(None).await, 1);
        assert_eq!(
            mgr.history("t-1").unwrap().last_cleanup_reason,
            Some(CleanupReason::MaxDuration)
        );
    }

    #[tokio::test]
    async fn reaper_drops_sessions_for_deleted_threads() {
        struct NothingExists;
        #[async_trait::async_trait]
        impl ThreadLiveness for NothingExists {
            async fn thread_exists(&self, _thread_id: &str) -> bool {
                false
            }
        }

        let (mgr, _driver) = manager_with(test_policy());
        mgr.acquire("u1", "t-1").await.unwrap();

        assert_eq!(mgr.reap_once(Some(&NothingExists)).await, 1);
        assert_eq!(
            mgr.history("t-1").unwrap().last_cleanup_reason,
            Some(CleanupReason::ThreadDeleted)
        );
    }

    #[tokio::test]
    async fn orphan_reclaim_only_touches_unknown_prefixed_runtimes() {
        let (mgr, driver) = manager_with(test_policy());
        let live = mgr.acquire("u1", "t-1").await.unwrap();

        // Two leftovers from a crashed process, one fresh, one old; plus a
        // container outside our namespace that must never be touched.
        driver.external.lock().extend([
            RuntimeListing {
                name: "spool-sbx-dead-old".into(),
                created_at: Some(Utc::now() - chrono::Duration::hours(3)),
            },
            RuntimeListing {
                name: "spool-sbx-dead-unknown-age".into(),
                created_at: None,
            },
            RuntimeListing {
                name: "spool-sbx-dead-fresh".into(),
                created_at: Some(Utc::now()),
            },
        ]);

        let reclaimed = mgr.reclaim_orphans(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(reclaimed, 2);

        let terminated = driver.terminated();
        assert!(terminated.contains(&"spool-sbx-dead-old".to_string()));
        assert!(terminated.contains(&"spool-sbx-dead-unknown-age".to_string()));
        assert!(!terminated.contains(&"spool-sbx-dead-fresh".to_string()));
        assert!(!terminated.contains(&live.sandbox_id));
    }
}
