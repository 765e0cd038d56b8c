//! Per-user quota ledger and usage log.
//!
//! Quotas only bind users on the system key; users with their own provider
//! key bypass the caps but are still logged. The check and the increment are
//! one atomic operation — a read-then-write pair would over-admit under
//! concurrency.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sp_domain::config::QuotaDefaults;
use sp_domain::error::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Billable capability classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Text,
    Image,
    Embedding,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Embedding => "embedding",
        };
        f.write_str(s)
    }
}

/// Which credential served a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeySource {
    User,
    System,
}

/// Rolling usage counters for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub user_id: String,
    pub daily_text_requests: Option<u32>,
    pub daily_image_requests: Option<u32>,
    pub daily_embedding_requests: Option<u32>,
    pub monthly_token_limit: Option<u64>,
    pub current_daily_text: u32,
    pub current_daily_image: u32,
    pub current_daily_embedding: u32,
    pub current_monthly_tokens: u64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
}

impl QuotaLedger {
    pub fn from_defaults(user_id: impl Into<String>, defaults: &QuotaDefaults) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            daily_text_requests: defaults.daily_text_requests,
            daily_image_requests: defaults.daily_image_requests,
            daily_embedding_requests: defaults.daily_embedding_requests,
            monthly_token_limit: defaults.monthly_token_limit,
            current_daily_text: 0,
            current_daily_image: 0,
            current_daily_embedding: 0,
            current_monthly_tokens: 0,
            daily_reset_at: now + Duration::days(1),
            monthly_reset_at: now + Duration::days(30),
        }
    }

    pub fn limit_for(&self, capability: Capability) -> Option<u32> {
        match capability {
            Capability::Text => self.daily_text_requests,
            Capability::Image => self.daily_image_requests,
            Capability::Embedding => self.daily_embedding_requests,
        }
    }

    pub fn used_for(&self, capability: Capability) -> u32 {
        match capability {
            Capability::Text => self.current_daily_text,
            Capability::Image => self.current_daily_image,
            Capability::Embedding => self.current_daily_embedding,
        }
    }

    fn bump(&mut self, capability: Capability, amount: u32) {
        let counter = match capability {
            Capability::Text => &mut self.current_daily_text,
            Capability::Image => &mut self.current_daily_image,
            Capability::Embedding => &mut self.current_daily_embedding,
        };
        *counter += amount;
    }

    /// Advance rolling windows that have elapsed, zeroing their counters.
    pub fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now >= self.daily_reset_at {
            self.current_daily_text = 0;
            self.current_daily_image = 0;
            self.current_daily_embedding = 0;
            while self.daily_reset_at <= now {
                self.daily_reset_at += Duration::days(1);
            }
        }
        if now >= self.monthly_reset_at {
            self.current_monthly_tokens = 0;
            while self.monthly_reset_at <= now {
                self.monthly_reset_at += Duration::days(30);
            }
        }
    }
}

/// Data returned with a quota rejection; surfaced verbatim in the
/// `quota_exceeded` error event.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaExceeded {
    pub capability: Capability,
    pub limit: u32,
    pub used: u32,
    pub reset_at: DateTime<Utc>,
}

/// Outcome of an atomic admission check.
#[derive(Debug, Clone)]
pub enum QuotaDecision {
    Admitted,
    Exceeded(QuotaExceeded),
}

impl QuotaDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

/// Append-only per-call usage record, written for every billed call no
/// matter which key served it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub user_id: String,
    pub capability: Capability,
    pub provider: String,
    pub model: String,
    pub key_source: KeySource,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_estimate: f64,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository contract
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait::async_trait]
pub trait QuotaRepository: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaLedger>>;

    /// Check the capability counter against its limit and, if admitted,
    /// increment it by `amount` — as one serialized operation per
    /// `(user, capability)`. Rolls elapsed windows first.
    ///
    /// An admission is a *reservation*: callers that never complete the
    /// billed call hand it back via [`release_usage`](Self::release_usage).
    async fn atomic_check_and_increment(
        &self,
        user_id: &str,
        capability: Capability,
        amount: u32,
    ) -> Result<QuotaDecision>;

    /// Compensating decrement for a reserved admission whose call never
    /// completed. Saturating: a refund landing after the window rolled
    /// decrements a fresh counter at most to zero and is otherwise dropped.
    async fn release_usage(
        &self,
        user_id: &str,
        capability: Capability,
        amount: u32,
    ) -> Result<()>;

    /// Add to the rolling monthly token counter.
    async fn increment_tokens(&self, user_id: &str, tokens: u64) -> Result<()>;

    async fn append_log(&self, entry: UsageLogEntry) -> Result<()>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory backend
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Reference backend: one mutex over the whole ledger map makes the
/// check+increment trivially atomic. A relational backend would use a
/// transactional `UPDATE ... WHERE used < limit` instead.
pub struct MemoryQuotaStore {
    defaults: QuotaDefaults,
    ledgers: Mutex<HashMap<String, QuotaLedger>>,
    logs: Mutex<Vec<UsageLogEntry>>,
}

impl MemoryQuotaStore {
    pub fn new(defaults: QuotaDefaults) -> Self {
        Self {
            defaults,
            ledgers: Mutex::new(HashMap::new()),
            logs: Mutex::new(Vec::new()),
        }
    }

    /// Replace a user's ledger wholesale (admin/test hook).
    pub fn put_ledger(&self, ledger: QuotaLedger) {
        self.ledgers.lock().insert(ledger.user_id.clone(), ledger);
    }

    pub fn logs(&self) -> Vec<UsageLogEntry> {
        self.logs.lock().clone()
    }
}

#[async_trait::async_trait]
impl QuotaRepository for MemoryQuotaStore {
    async fn get(&self, user_id: &str) -> Result<Option<QuotaLedger>> {
        Ok(self.ledgers.lock().get(user_id).cloned())
    }

    async fn atomic_check_and_increment(
        &self,
        user_id: &str,
        capability: Capability,
        amount: u32,
    ) -> Result<QuotaDecision> {
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaLedger::from_defaults(user_id, &self.defaults));

        ledger.roll_windows(Utc::now());

        if let Some(limit) = ledger.limit_for(capability) {
            let used = ledger.used_for(capability);
            if used.saturating_add(amount) > limit {
                return Ok(QuotaDecision::Exceeded(QuotaExceeded {
                    capability,
                    limit,
                    used,
                    reset_at: ledger.daily_reset_at,
                }));
            }
        }

        ledger.bump(capability, amount);
        Ok(QuotaDecision::Admitted)
    }

    async fn release_usage(
        &self,
        user_id: &str,
        capability: Capability,
        amount: u32,
    ) -> Result<()> {
        let mut ledgers = self.ledgers.lock();
        let Some(ledger) = ledgers.get_mut(user_id) else {
            return Ok(());
        };
        let counter = match capability {
            Capability::Text => &mut ledger.current_daily_text,
            Capability::Image => &mut ledger.current_daily_image,
            Capability::Embedding => &mut ledger.current_daily_embedding,
        };
        *counter = counter.saturating_sub(amount);
        Ok(())
    }

    async fn increment_tokens(&self, user_id: &str, tokens: u64) -> Result<()> {
        let mut ledgers = self.ledgers.lock();
        let ledger = ledgers
            .entry(user_id.to_string())
            .or_insert_with(|| QuotaLedger::from_defaults(user_id, &self.defaults));
        ledger.current_monthly_tokens += tokens;
        Ok(())
    }

    async fn append_log(&self, entry: UsageLogEntry) -> Result<()> {
        self.logs.lock().push(entry);
        Ok(())
    }
}
