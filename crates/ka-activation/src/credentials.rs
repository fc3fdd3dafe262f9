//! Egress proxy credential cache.

use chrono::{DateTime, Utc};
use ka_config::ProxyConfig;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::BackendClient;
use crate::error::Result;
use crate::ttl_cache::TtlCache;

/// Short-lived username/password for the regional egress proxies.
#[derive(Clone, Deserialize)]
pub struct ProxyCredentials {
    pub user: String,
    pub password: String,
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl ProxyCredentials {
    /// How long these may be cached: time to expiry minus `skew`, capped at `max`.
    pub fn cache_ttl(&self, now: DateTime<Utc>, skew: Duration, max: Duration) -> Duration {
        let remaining = (self.expires_at - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(skew);
        remaining.min(max)
    }
}

/// Process-wide credential cache. One backend call per expiry window, shared by all
/// concurrent callers.
pub struct CredentialCache {
    backend: Arc<dyn BackendClient>,
    cache: TtlCache<(), Arc<ProxyCredentials>>,
    expiry_skew: Duration,
    max_ttl: Duration,
}

impl CredentialCache {
    pub fn new(backend: Arc<dyn BackendClient>, config: &ProxyConfig) -> Self {
        Self {
            backend,
            cache: TtlCache::new(),
            expiry_skew: Duration::from_secs(config.expiry_skew_secs),
            max_ttl: Duration::from_secs(config.max_credential_ttl_secs),
        }
    }

    pub async fn get(&self) -> Result<Arc<ProxyCredentials>> {
        let backend = self.backend.clone();
        let (skew, max) = (self.expiry_skew, self.max_ttl);

        self.cache
            .get_or_fetch((), move || async move {
                let credentials = backend.proxy_credentials().await?;
                let ttl = credentials.cache_ttl(Utc::now(), skew, max);
                info!(
                    user = %credentials.user,
                    ttl_secs = ttl.as_secs(),
                    "Fetched egress proxy credentials"
                );
                Ok((Arc::new(credentials), ttl))
            })
            .await
    }

    /// Drop cached credentials after the proxy rejected them.
    pub fn invalidate(&self) {
        if self.cache.invalidate(&()) {
            debug!("Proxy credentials invalidated");
        }
    }

    pub fn fetches(&self) -> u64 {
        self.cache.fetches_started()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn creds(expires_in: ChronoDuration) -> ProxyCredentials {
        ProxyCredentials {
            user: "u".into(),
            password: "p".into(),
            expires_at: Utc::now() + expires_in,
        }
    }

    #[test]
    fn test_cache_ttl_applies_skew_and_cap() {
        let now = Utc::now();
        let skew = Duration::from_secs(30);
        let max = Duration::from_secs(1800);

        let short = ProxyCredentials { expires_at: now + ChronoDuration::seconds(90), ..creds(ChronoDuration::zero()) };
        assert_eq!(short.cache_ttl(now, skew, max), Duration::from_secs(60));

        let long = ProxyCredentials { expires_at: now + ChronoDuration::hours(5), ..creds(ChronoDuration::zero()) };
        assert_eq!(long.cache_ttl(now, skew, max), max);

        let expired = ProxyCredentials { expires_at: now - ChronoDuration::seconds(5), ..creds(ChronoDuration::zero()) };
        assert_eq!(expired.cache_ttl(now, skew, max), Duration::ZERO);
    }

    #[test]
    fn test_debug_redacts_password() {
        let rendered = format!("{:?}", creds(ChronoDuration::minutes(5)));
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("\"p\""));
    }
}
