//! LLM key and quota arbiter.
//!
//! Per model call: pick the credential (user key first, system key as
//! fallback), admit against the quota ledger when the system key is used,
//! and settle usage afterwards. Plaintext keys exist only inside the lease.

use std::sync::Arc;

use chrono::Utc;

use sp_domain::config::RuntimeConfig;
use sp_domain::error::Result;
use sp_domain::stream::Usage;
use sp_store::{
    Capability, CredentialRepository, KeyCipher, KeySource, QuotaDecision, QuotaExceeded,
    QuotaRepository, UsageLogEntry,
};

/// A resolved credential for one model call.
#[derive(Clone)]
pub struct KeyLease {
    pub provider: String,
    pub api_key: String,
    pub api_base: Option<String>,
    pub source: KeySource,
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never let the plaintext key reach logs.
        f.debug_struct("KeyLease")
            .field("provider", &self.provider)
            .field("api_base", &self.api_base)
            .field("source", &self.source)
            .finish()
    }
}

/// Outcome of a lease attempt. Refusals are data, not errors — the engine
/// turns them into terminal events; `Err` is reserved for infrastructure
/// failures.
pub enum LeaseOutcome {
    Granted(KeyLease),
    NoKey { provider: String },
    QuotaExceeded(QuotaExceeded),
}

pub struct Arbiter {
    config: Arc<RuntimeConfig>,
    credentials: Arc<dyn CredentialRepository>,
    cipher: Arc<dyn KeyCipher>,
    quota: Arc<dyn QuotaRepository>,
}

impl Arbiter {
    pub fn new(
        config: Arc<RuntimeConfig>,
        credentials: Arc<dyn CredentialRepository>,
        cipher: Arc<dyn KeyCipher>,
        quota: Arc<dyn QuotaRepository>,
    ) -> Self {
        Self {
            config,
            credentials,
            cipher,
            quota,
        }
    }

    /// Resolve a credential for `(user, provider)` and, when it is the
    /// system key, atomically reserve one unit of the capability's quota.
    ///
    /// The reservation is the concurrency-safe admission check; it only
    /// becomes a real charge if the model call completes (settlement). A
    /// call that never completes must hand the unit back via
    /// [`refund`](Self::refund), so failed or cancelled requests cost
    /// nothing.
    ///
    /// A user's own active key bypasses the cap entirely (usage is still
    /// logged at settlement).
    pub async fn lease(
        &self,
        user_id: &str,
        provider: &str,
        capability: Capability,
    ) -> Result<LeaseOutcome> {
        // 1. User-configured key.
        if let Some(cred) = self.credentials.get(user_id, provider).await? {
            if cred.is_active {
                let api_key = self.cipher.decrypt(&cred.encrypted_key)?;
                return Ok(LeaseOutcome::Granted(KeyLease {
                    provider: provider.to_string(),
                    api_key,
                    api_base: cred.api_base.clone(),
                    source: KeySource::User,
                }));
            }
        }

        // 2. System key, gated by quota.
        let Some(settings) = self.config.system_key(provider) else {
            return Ok(LeaseOutcome::NoKey {
                provider: provider.to_string(),
            });
        };
        let api_key = settings
            .api_key
            .clone()
            .unwrap_or_default();

        match self
            .quota
            .atomic_check_and_increment(user_id, capability, 1)
            .await?
        {
            QuotaDecision::Admitted => Ok(LeaseOutcome::Granted(KeyLease {
                provider: provider.to_string(),
                api_key,
                api_base: settings.api_base.clone(),
                source: KeySource::System,
            })),
            QuotaDecision::Exceeded(exceeded) => Ok(LeaseOutcome::QuotaExceeded(exceeded)),
        }
    }

    /// Return a reserved admission unit whose call never completed (model
    /// error after retries, cancellation, or a failure before the call was
    /// issued). User-key leases were never charged, so only system-key
    /// leases decrement the counter.
    pub async fn refund(
        &self,
        user_id: &str,
        lease: &KeyLease,
        capability: Capability,
    ) -> Result<()> {
        if lease.source == KeySource::System {
            self.quota.release_usage(user_id, capability, 1).await?;
        }
        Ok(())
    }

    /// Record a completed (possibly partial) call: bump the monthly token
    /// counter and append the usage log entry. Runs for both key sources.
    /// The admission unit reserved at lease time stays spent here — this is
    /// the success half of the reserve/refund pair.
    pub async fn settle(
        &self,
        user_id: &str,
        lease: &KeyLease,
        model: &str,
        capability: Capability,
        usage: Option<&Usage>,
    ) -> Result<()> {
        let (input_tokens, output_tokens, total) = match usage {
            Some(u) => (u.prompt_tokens, u.completion_tokens, u.total_tokens as u64),
            None => (0, 0, 0),
        };

        if total > 0 {
            self.quota.increment_tokens(user_id, total).await?;
        }

        let cost_estimate = self
            .config
            .pricing
            .get(model)
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
            .unwrap_or(0.0);

        self.quota
            .append_log(UsageLogEntry {
                user_id: user_id.to_string(),
                capability,
                provider: lease.provider.clone(),
                model: model.to_string(),
                key_source: lease.source,
                input_tokens,
                output_tokens,
                cost_estimate,
                created_at: Utc::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sp_domain::config::{ModelPricing, ProviderSettings, QuotaDefaults};
    use sp_store::{MemoryCredentialStore, MemoryQuotaStore, ReversingCipher};

    fn config_with_system_key(daily_text: Option<u32>) -> Arc<RuntimeConfig> {
        let mut config = RuntimeConfig {
            quota: QuotaDefaults {
                daily_text_requests: daily_text,
                ..Default::default()
            },
            ..Default::default()
        };
        config.providers.insert(
            "openai".into(),
            ProviderSettings {
                api_key: Some("sk-system".into()),
                api_base: None,
            },
        );
        config
            .pricing
            .insert("gpt-4o".into(), ModelPricing { input_per_1k: 0.01, output_per_1k: 0.03 });
        Arc::new(config)
    }

    fn arbiter(
        config: Arc<RuntimeConfig>,
    ) -> (Arbiter, Arc<MemoryCredentialStore>, Arc<MemoryQuotaStore>) {
        let creds = Arc::new(MemoryCredentialStore::new());
        let quota = Arc::new(MemoryQuotaStore::new(config.quota.clone()));
        let arb = Arbiter::new(
            config,
            creds.clone(),
            Arc::new(ReversingCipher),
            quota.clone(),
        );
        (arb, creds, quota)
    }

    #[tokio::test]
    async fn user_key_wins_and_bypasses_quota() {
        // Daily limit of zero would reject any system-key call.
        let (arb, creds, quota) = arbiter(config_with_system_key(Some(0)));
        creds
            .insert_plaintext(&ReversingCipher, "u1", "openai", "sk-user", Some("https://proxy".into()))
            .unwrap();

        let outcome = arb.lease("u1", "openai", Capability::Text).await.unwrap();
        let lease = match outcome {
            LeaseOutcome::Granted(l) => l,
            _ => panic!("expected grant"),
        };
        assert_eq!(lease.api_key, "sk-user");
        assert_eq!(lease.source, KeySource::User);
        assert_eq!(lease.api_base.as_deref(), Some("https://proxy"));

        // The ledger was never touched.
        assert!(quota.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn inactive_user_key_falls_back_to_system() {
        let (arb, creds, _quota) = arbiter(config_with_system_key(None));
        creds.insert(sp_store::ProviderCredential {
            user_id: "u1".into(),
            provider: "openai".into(),
            encrypted_key: "whatever".into(),
            api_base: None,
            is_active: false,
        });

        let outcome = arb.lease("u1", "openai", Capability::Text).await.unwrap();
        match outcome {
            LeaseOutcome::Granted(lease) => {
                assert_eq!(lease.api_key, "sk-system");
                assert_eq!(lease.source, KeySource::System);
            }
            _ => panic!("expected grant"),
        }
    }

    #[tokio::test]
    async fn no_key_anywhere() {
        let (arb, _creds, _quota) = arbiter(Arc::new(RuntimeConfig::default()));
        let outcome = arb.lease("u1", "openai", Capability::Text).await.unwrap();
        assert!(matches!(outcome, LeaseOutcome::NoKey { provider } if provider == "openai"));
    }

    #[tokio::test]
    async fn system_key_consumes_quota_until_exhausted() {
        let (arb, _creds, quota) = arbiter(config_with_system_key(Some(2)));

        for _ in 0..2 {
            assert!(matches!(
                arb.lease("u1", "openai", Capability::Text).await.unwrap(),
                LeaseOutcome::Granted(_)
            ));
        }
        match arb.lease("u1", "openai", Capability::Text).await.unwrap() {
            LeaseOutcome::QuotaExceeded(e) => {
                assert_eq!(e.limit, 2);
                assert_eq!(e.used, 2);
            }
            _ => panic!("expected quota rejection"),
        }
        assert_eq!(quota.get("u1").await.unwrap().unwrap().current_daily_text, 2);
    }

    #[tokio::test]
    async fn refund_returns_system_key_reservation() {
        let (arb, _creds, quota) = arbiter(config_with_system_key(Some(1)));

        let lease = match arb.lease("u1", "openai", Capability::Text).await.unwrap() {
            LeaseOutcome::Granted(l) => l,
            _ => panic!("expected grant"),
        };
        // Reservation holds the only unit.
        assert!(matches!(
            arb.lease("u1", "openai", Capability::Text).await.unwrap(),
            LeaseOutcome::QuotaExceeded(_)
        ));

        arb.refund("u1", &lease, Capability::Text).await.unwrap();
        assert_eq!(quota.get("u1").await.unwrap().unwrap().current_daily_text, 0);
        assert!(matches!(
            arb.lease("u1", "openai", Capability::Text).await.unwrap(),
            LeaseOutcome::Granted(_)
        ));
    }

    #[tokio::test]
    async fn refund_is_a_noop_for_user_keys() {
        let (arb, creds, quota) = arbiter(config_with_system_key(Some(1)));
        creds
            .insert_plaintext(&ReversingCipher, "u1", "openai", "sk-user", None)
            .unwrap();

        let lease = match arb.lease("u1", "openai", Capability::Text).await.unwrap() {
            LeaseOutcome::Granted(l) => l,
            _ => panic!("expected grant"),
        };
        arb.refund("u1", &lease, Capability::Text).await.unwrap();
        // Nothing was reserved, nothing moved.
        assert!(quota.get("u1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn settle_accounts_tokens_and_logs() {
        let (arb, _creds, quota) = arbiter(config_with_system_key(None));
        let lease = match arb.lease("u1", "openai", Capability::Text).await.unwrap() {
            LeaseOutcome::Granted(l) => l,
            _ => panic!(),
        };

        let usage = Usage {
            prompt_tokens: 2000,
            completion_tokens: 1000,
            total_tokens: 3000,
        };
        arb.settle("u1", &lease, "gpt-4o", Capability::Text, Some(&usage))
            .await
            .unwrap();

        let ledger = quota.get("u1").await.unwrap().unwrap();
        assert_eq!(ledger.current_monthly_tokens, 3000);

        let logs = quota.logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].input_tokens, 2000);
        assert!((logs[0].cost_estimate - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn settle_without_usage_still_logs() {
        let (arb, _creds, quota) = arbiter(config_with_system_key(None));
        let lease = match arb.lease("u1", "openai", Capability::Text).await.unwrap() {
            LeaseOutcome::Granted(l) => l,
            _ => panic!(),
        };
        arb.settle("u1", &lease, "gpt-4o", Capability::Text, None)
            .await
            .unwrap();
        assert_eq!(quota.logs().len(), 1);
        assert_eq!(quota.logs()[0].input_tokens, 0);
    }
}
