use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::Result;
use crate::ttl_cache::TtlCache;

/// Vendor identity token captured from the authenticated browser session.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityToken {
    value: String,
    expires_at: Instant,
}

impl IdentityToken {
    pub fn new(value: impl Into<String>, ttl: Duration) -> Self {
        Self {
            value: value.into(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Raw header value for vendor requests.
    pub fn secret(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn preview(&self) -> String {
        let head: String = self.value.chars().take(12).collect();
        format!("{}…", head)
    }
}

impl fmt::Debug for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityToken")
            .field("value", &self.preview())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Identity tokens keyed by device identity.
#[derive(Default)]
pub struct TokenCache {
    inner: TtlCache<String, IdentityToken>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<IdentityToken> {
        self.inner
            .get(&device_id.to_string())
            .filter(|token| !token.is_expired())
    }

    pub fn set(&self, device_id: &str, token: IdentityToken) {
        let ttl = token.expires_at().saturating_duration_since(Instant::now());
        self.inner.set(device_id.to_string(), token, ttl);
    }

    pub fn invalidate(&self, device_id: &str) -> bool {
        self.inner.invalidate(&device_id.to_string())
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    /// Drop a capture left in flight by a cancelled run.
    pub fn abandon_capture(&self, device_id: &str) -> bool {
        self.inner.abandon_fetch(&device_id.to_string())
    }

    /// Single-flight fill; `fetch` yields a token carrying its own expiry.
    pub async fn get_or_capture<F, Fut>(&self, device_id: &str, fetch: F) -> Result<IdentityToken>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<IdentityToken>> + Send + 'static,
    {
        self.inner
            .get_or_fetch(device_id.to_string(), move || {
                let fut = fetch();
                async move {
                    let token = fut.await?;
                    let ttl = token.expires_at().saturating_duration_since(Instant::now());
                    Ok((token, ttl))
                }
            })
            .await
    }
}
