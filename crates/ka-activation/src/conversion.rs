//! Consent ("conversion") sub-flow on the dedicated browser surface.

use ka_common::mask_key;
use ka_config::ConversionConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::{BrowserAutomation, BrowserMessage, MessageBus, Surface, WaitKind};
use crate::error::{ActivationError, Result};
use crate::token_capture::BRIDGE_PRELUDE;

const FILL_KEY_SCRIPT: &str = r##"
(() => {
  const input = document.querySelector('#tokenString, input[name="tokenString"], input[type="text"]');
  if (!input) { __kaPost({ type: 'conversionFailed', error: 'key input not found' }); return false; }
  input.focus();
  input.value = __KEY__;
  input.dispatchEvent(new Event('input', { bubbles: true }));
  input.dispatchEvent(new Event('change', { bubbles: true }));
  const next = document.querySelector('#nextButton, button[type="submit"]');
  if (next) { next.click(); }
  return true;
})();
"##;

const CONFIRM_STEP_SCRIPT: &str = r##"
(() => {
  const button = document.querySelector('#nextButton, #confirmButton, button[data-step="confirm"], button.primary');
  if (!button || button.disabled) { return false; }
  button.click();
  return true;
})();
"##;

const DISABLE_AUTO_RENEW_SCRIPT: &str = r##"
(() => {
  const done = (msg) => { if (!window.__kaConversionDone) { window.__kaConversionDone = true; __kaPost(msg); } };
  const observe = () => {
    const text = document.body ? document.body.innerText.toLowerCase() : '';
    if (document.querySelector('.success-message, [data-redeem-result="success"]') || text.includes('you\'re all set')) {
      done({ type: 'conversionSuccess' });
    } else {
      const failure = document.querySelector('.error-message, [role="alert"]');
      if (failure && failure.innerText.trim()) { done({ type: 'conversionFailed', error: failure.innerText.trim() }); }
    }
  };
  window.__kaConversionDone = false;
  new MutationObserver(observe).observe(document.documentElement, { childList: true, subtree: true, characterData: true });
  const toggle = document.querySelector('input[name="autoRenew"], #autoRenewToggle');
  if (toggle && toggle.checked) { toggle.click(); }
  const confirm = document.querySelector('#confirmButton, #nextButton, button[type="submit"]');
  if (confirm) { confirm.click(); }
  observe();
  return true;
})();
"##;

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub consent_url: String,
    pub timeout: Duration,
    pub confirmation_steps: u32,
    pub step_delay: Duration,
}

impl From<&ConversionConfig> for ConversionSettings {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            consent_url: config.consent_url.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            confirmation_steps: config.confirmation_steps,
            step_delay: Duration::from_millis(config.step_delay_ms),
        }
    }
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self::from(&ConversionConfig::default())
    }
}

/// Drives the vendor's consent pages when redemption reports that consent is
/// required. One attempt per key.
#[derive(Clone)]
pub struct ConversionController {
    browser: Arc<dyn BrowserAutomation>,
    bus: Arc<MessageBus>,
    settings: ConversionSettings,
}

impl ConversionController {
    pub fn new(
        browser: Arc<dyn BrowserAutomation>,
        bus: Arc<MessageBus>,
        settings: ConversionSettings,
    ) -> Self {
        Self { browser, bus, settings }
    }

    pub async fn run(&self, key: &str) -> Result<()> {
        info!(key = %mask_key(key), "Starting conversion consent flow");
        let pending = self.bus.register(WaitKind::Conversion);

        self.browser
            .load_url(Surface::Conversion, &self.settings.consent_url)
            .await
            .map_err(ActivationError::ConversionFailed)?;

        for (step, script) in self.step_scripts(key)?.iter().enumerate() {
            if step > 0 {
                tokio::time::sleep(self.settings.step_delay).await;
            }
            let result = self
                .browser
                .inject_script(Surface::Conversion, script)
                .await
                .map_err(ActivationError::ConversionFailed)?;
            debug!(step, ?result, "Conversion step injected");
        }

        match pending
            .wait(self.settings.timeout, ActivationError::ConversionTimeout)
            .await?
        {
            BrowserMessage::ConversionSuccess => {
                info!(key = %mask_key(key), "Conversion consent completed");
                Ok(())
            }
            BrowserMessage::ConversionFailed { error } => {
                warn!(key = %mask_key(key), %error, "Conversion consent failed");
                Err(ActivationError::ConversionFailed(error))
            }
            other => Err(ActivationError::Browser(format!(
                "unexpected message during conversion: {}",
                other.name()
            ))),
        }
    }

    /// Fill key, confirmation steps, then disable auto-renew and watch for the result.
    fn step_scripts(&self, key: &str) -> Result<Vec<String>> {
        let literal = serde_json::to_string(key)?;
        let mut scripts = Vec::with_capacity(self.settings.confirmation_steps as usize + 2);
        scripts.push(format!(
            "{}{}",
            BRIDGE_PRELUDE,
            FILL_KEY_SCRIPT.replace("__KEY__", &literal)
        ));
        for _ in 0..self.settings.confirmation_steps {
            scripts.push(CONFIRM_STEP_SCRIPT.to_string());
        }
        scripts.push(format!("{}{}", BRIDGE_PRELUDE, DISABLE_AUTO_RENEW_SCRIPT));
        Ok(scripts)
    }
}
