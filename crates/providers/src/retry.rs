//! Transient-failure classification and bounded exponential backoff.
//!
//! The engine retries a model call only when retrying can plausibly help:
//! timeouts, connection resets, 5xx, and 429. Authentication and invalid
//! request failures are permanent and bubble up immediately.

use std::time::Duration;

use sp_domain::config::RetryConfig;
use sp_domain::error::Error;

/// Whether a bounded retry may recover from this error.
pub fn is_transient(err: &Error) -> bool {
    match err {
        Error::Timeout(_) | Error::Http(_) => true,
        Error::Provider { message, .. } => {
            // Adapters format upstream HTTP failures as "HTTP <status> - <body>".
            if let Some(rest) = message.strip_prefix("HTTP ") {
                let status: u32 = rest
                    .split(|c: char| !c.is_ascii_digit())
                    .next()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                return status == 429 || (500..600).contains(&status);
            }
            false
        }
        _ => false,
    }
}

/// Delay before retry attempt `attempt` (0-based), with ±jitter applied.
pub fn backoff_delay(cfg: &RetryConfig, attempt: u32) -> Duration {
    let base = cfg.base_delay_ms.saturating_mul(1u64 << attempt.min(16));
    let capped = base.min(cfg.max_delay_ms);

    // Cheap deterministic-enough jitter; a PRNG dependency is not worth it
    // for smearing retry storms.
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as f64;
    let unit = (nanos / u32::MAX as f64) * 2.0 - 1.0; // [-1, 1]
    let jitter = capped as f64 * cfg.jitter_ratio * unit;

    Duration::from_millis(((capped as f64 + jitter).max(0.0)) as u64)
}

/// Run `op` with bounded retries on transient failures.
///
/// Permanent failures and exhaustion both return the last error.
pub async fn with_backoff<T, F, Fut>(cfg: &RetryConfig, what: &str, mut op: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) && attempt + 1 < cfg.attempts => {
                let delay = backoff_delay(cfg, attempt);
                tracing::warn!(
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "{what}: transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn cfg() -> RetryConfig {
        RetryConfig {
            attempts: 3,
            base_delay_ms: 1,
            max_delay_ms: 4,
            jitter_ratio: 0.0,
        }
    }

    #[test]
    fn classifies_transient() {
        assert!(is_transient(&Error::Timeout("model call".into())));
        assert!(is_transient(&Error::Http("connection reset".into())));
        assert!(is_transient(&Error::Provider {
            provider: "openai".into(),
            message: "HTTP 503 - overloaded".into(),
        }));
        assert!(is_transient(&Error::Provider {
            provider: "openai".into(),
            message: "HTTP 429 - rate limited".into(),
        }));
    }

    #[test]
    fn classifies_permanent() {
        assert!(!is_transient(&Error::Provider {
            provider: "openai".into(),
            message: "HTTP 401 - invalid api key".into(),
        }));
        assert!(!is_transient(&Error::Provider {
            provider: "openai".into(),
            message: "HTTP 400 - bad request".into(),
        }));
        assert!(!is_transient(&Error::Other("boom".into())));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = RetryConfig {
            attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 300,
            jitter_ratio: 0.0,
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_millis(200));
        // 400 would exceed the cap.
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff(&cfg(), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Timeout("t".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&cfg(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(Error::Provider {
                    provider: "openai".into(),
                    message: "HTTP 401 - nope".into(),
                })
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff(&cfg(), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::Timeout("still down".into())) }
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
