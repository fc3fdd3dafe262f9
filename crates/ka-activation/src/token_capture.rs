//! Identity token capture through the browser automation port.

use ka_config::{RetryConfig, TokenConfig};
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::RetryPolicy;
use crate::browser::{BrowserAutomation, BrowserMessage, MessageBus, Surface, WaitKind};
use crate::error::{ActivationError, Result};
use crate::token_cache::{IdentityToken, TokenCache};

/// Posts `tokenCaptured` / `tokenCaptureFailed` back through the host bridge.
pub(crate) const BRIDGE_PRELUDE: &str = r##"
const __kaPost = (msg) => {
  const payload = JSON.stringify(msg);
  if (window.__kaBridge) { window.__kaBridge.postMessage(payload); return; }
  if (window.chrome && window.chrome.webview) { window.chrome.webview.postMessage(payload); return; }
  if (window.webkit && window.webkit.messageHandlers && window.webkit.messageHandlers.activation) {
    window.webkit.messageHandlers.activation.postMessage(payload);
  }
};
"##;

const CAPTURE_SCRIPT: &str = r##"
(async () => {
  try {
    const res = await fetch('/en-US/auth/getTokensSilently?rp=http://xboxlive.com', { credentials: 'include' });
    if (!res.ok) { __kaPost({ type: 'tokenCaptureFailed', error: 'HTTP ' + res.status }); return; }
    const body = await res.json();
    const entry = body && body.tokens && body.tokens['http://xboxlive.com'];
    if (!entry || !entry.token || !entry.userHash) {
      __kaPost({ type: 'tokenCaptureFailed', error: 'token missing from response' });
      return;
    }
    __kaPost({ type: 'tokenCaptured', token: 'XBL3.0 x=' + entry.userHash + ';' + entry.token });
  } catch (e) {
    __kaPost({ type: 'tokenCaptureFailed', error: String(e) });
  }
})();
"##;

#[derive(Debug, Clone)]
pub struct TokenCaptureConfig {
    pub identity_url: String,
    pub identity_domain: String,
    pub ttl: Duration,
    pub timeout: Duration,
    pub policy: RetryPolicy,
}

impl TokenCaptureConfig {
    pub fn from_config(token: &TokenConfig, retry: &RetryConfig) -> Self {
        Self {
            identity_url: token.identity_url.clone(),
            identity_domain: token.identity_domain.clone(),
            ttl: Duration::from_secs(token.ttl_secs),
            timeout: Duration::from_secs(token.capture_timeout_secs),
            policy: RetryPolicy::new(token.max_attempts, retry),
        }
    }
}

impl Default for TokenCaptureConfig {
    fn default() -> Self {
        Self::from_config(&TokenConfig::default(), &RetryConfig::default())
    }
}

/// Obtains identity tokens, preferring the cache.
#[derive(Clone)]
pub struct TokenCaptureService {
    browser: Arc<dyn BrowserAutomation>,
    bus: Arc<MessageBus>,
    cache: Arc<TokenCache>,
    config: TokenCaptureConfig,
    device_id: String,
}

impl TokenCaptureService {
    pub fn new(
        browser: Arc<dyn BrowserAutomation>,
        bus: Arc<MessageBus>,
        cache: Arc<TokenCache>,
        config: TokenCaptureConfig,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            browser,
            bus,
            cache,
            config,
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Drop this device's token, e.g. after the vendor rejected it.
    pub fn invalidate(&self) {
        if self.cache.invalidate(&self.device_id) {
            info!(device_id = %self.device_id, "Identity token invalidated");
        }
    }

    /// Called when the run awaiting a capture is cancelled.
    pub fn abandon(&self) {
        if self.cache.abandon_capture(&self.device_id) {
            debug!(device_id = %self.device_id, "Abandoned in-flight token capture");
        }
    }

    /// Cached token, or a fresh capture shared with any concurrent caller.
    pub async fn capture(&self) -> Result<IdentityToken> {
        if let Some(token) = self.cache.get(&self.device_id) {
            debug!(token = %token.preview(), "Using cached identity token");
            return Ok(token);
        }

        let this = self.clone();
        self.cache
            .get_or_capture(&self.device_id, move || async move {
                this.capture_with_retries().await
            })
            .await
    }

    async fn capture_with_retries(&self) -> Result<IdentityToken> {
        let policy = &self.config.policy;
        let mut attempts = 0;

        loop {
            // A token set while we were backing off short-circuits the remaining attempts.
            if let Some(token) = self.cache.get(&self.device_id) {
                return Ok(token);
            }

            attempts += 1;
            match self.capture_once().await {
                Ok(token) => {
                    info!(attempt = attempts, token = %token.preview(), "Identity token captured");
                    return Ok(token);
                }
                Err(ActivationError::Cancelled) => return Err(ActivationError::Cancelled),
                Err(e) if !policy.allows(attempts) => {
                    warn!(attempts, error = %e, "Token capture attempts exhausted");
                    return Err(ActivationError::exhausted(attempts, e));
                }
                Err(e) => {
                    let delay = policy.delay_after(attempts);
                    warn!(
                        attempt = attempts,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "Token capture failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn capture_once(&self) -> Result<IdentityToken> {
        // Register before injecting so a fast reply cannot be missed.
        let pending = self.bus.register(WaitKind::TokenCapture);

        self.ensure_identity_surface().await?;

        let script = format!("{}{}", BRIDGE_PRELUDE, CAPTURE_SCRIPT);
        self.browser
            .inject_script(Surface::Identity, &script)
            .await
            .map_err(ActivationError::Browser)?;

        match pending
            .wait(self.config.timeout, ActivationError::TokenTimeout)
            .await?
        {
            BrowserMessage::TokenCaptured { token } if !token.trim().is_empty() => {
                Ok(IdentityToken::new(token.trim(), self.config.ttl))
            }
            BrowserMessage::TokenCaptured { .. } => {
                Err(ActivationError::TokenCaptureFailed("empty token".to_string()))
            }
            BrowserMessage::TokenCaptureFailed { error } => {
                Err(ActivationError::TokenCaptureFailed(error))
            }
            other => Err(ActivationError::Browser(format!(
                "unexpected message during capture: {}",
                other.name()
            ))),
        }
    }

    async fn ensure_identity_surface(&self) -> Result<()> {
        let current = self.browser.current_url(Surface::Identity).await;
        let on_domain = current
            .as_deref()
            .is_some_and(|url| host_matches(url, &self.config.identity_domain));

        if !on_domain {
            debug!(current = ?current, target = %self.config.identity_url, "Loading identity provider");
            self.browser
                .load_url(Surface::Identity, &self.config.identity_url)
                .await
                .map_err(ActivationError::Browser)?;
        }
        Ok(())
    }
}

/// `url`'s host equals `domain` or is a subdomain of it.
pub(crate) fn host_matches(url: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
        .is_some_and(|host| host == domain || host.ends_with(&format!(".{}", domain)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_matches_domain_and_subdomains() {
        assert!(host_matches("https://account.xbox.com/en-US", "xbox.com"));
        assert!(host_matches("https://xbox.com/", ".xbox.com"));
        assert!(!host_matches("https://xbox.com.evil.net/", "xbox.com"));
        assert!(!host_matches("about:blank", "xbox.com"));
        assert!(!host_matches("not a url", "xbox.com"));
    }
}
