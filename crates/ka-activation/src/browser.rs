//! Browser automation port and inbound message routing.
//!
//! The host application owns the embedded browser. It implements
//! [`BrowserAutomation`] for outbound commands and forwards every message the page
//! posts back to [`MessageBus::dispatch`]. Each pending wait is a single-consumer
//! oneshot channel: the first matching message, the caller's timeout, or a
//! cancellation resolves it.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{ActivationError, Result};

/// Browser surfaces driven by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Surface {
    /// Signed-in identity provider page used for token capture
    Identity,
    /// Dedicated surface for the consent flow
    Conversion,
}

/// Commands the core issues to the host's browser.
#[async_trait]
pub trait BrowserAutomation: Send + Sync {
    async fn load_url(&self, surface: Surface, url: &str) -> std::result::Result<(), String>;

    async fn inject_script(
        &self,
        surface: Surface,
        source: &str,
    ) -> std::result::Result<serde_json::Value, String>;

    async fn current_url(&self, surface: Surface) -> Option<String>;
}

/// Messages posted back by injected scripts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BrowserMessage {
    TokenCaptured { token: String },
    TokenCaptureFailed { error: String },
    ConversionSuccess,
    ConversionFailed { error: String },
    RedeemPageEntered { url: String },
}

impl BrowserMessage {
    pub fn name(&self) -> &'static str {
        match self {
            BrowserMessage::TokenCaptured { .. } => "tokenCaptured",
            BrowserMessage::TokenCaptureFailed { .. } => "tokenCaptureFailed",
            BrowserMessage::ConversionSuccess => "conversionSuccess",
            BrowserMessage::ConversionFailed { .. } => "conversionFailed",
            BrowserMessage::RedeemPageEntered { .. } => "redeemPageEntered",
        }
    }

    fn wait_kind(&self) -> Option<WaitKind> {
        match self {
            BrowserMessage::TokenCaptured { .. } | BrowserMessage::TokenCaptureFailed { .. } => {
                Some(WaitKind::TokenCapture)
            }
            BrowserMessage::ConversionSuccess | BrowserMessage::ConversionFailed { .. } => {
                Some(WaitKind::Conversion)
            }
            BrowserMessage::RedeemPageEntered { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitKind {
    TokenCapture,
    Conversion,
}

type Waiter = oneshot::Sender<Result<BrowserMessage>>;

/// Routes inbound browser messages to whoever registered interest.
pub struct MessageBus {
    pending: Mutex<HashMap<WaitKind, Waiter>>,
    redeem_page: watch::Sender<Option<String>>,
}

impl MessageBus {
    pub fn new() -> Self {
        let (redeem_page, _) = watch::channel(None);
        Self {
            pending: Mutex::new(HashMap::new()),
            redeem_page,
        }
    }

    /// Register interest in the next message of `kind`.
    ///
    /// Must be called before the script that produces the message is injected. A
    /// previous wait of the same kind is resolved with `Cancelled`.
    pub fn register(&self, kind: WaitKind) -> PendingMessage {
        let (tx, rx) = oneshot::channel();
        if let Some(previous) = self.pending.lock().insert(kind, tx) {
            let _ = previous.send(Err(ActivationError::Cancelled));
            debug!(?kind, "Replaced pending browser wait");
        }
        PendingMessage { kind, rx }
    }

    /// Deliver a message from the host. Returns whether a waiter received it.
    pub fn dispatch(&self, message: BrowserMessage) -> bool {
        if let BrowserMessage::RedeemPageEntered { url } = &message {
            info!(%url, "Redeem page entered");
            self.redeem_page.send_replace(Some(url.clone()));
            return false;
        }

        let Some(kind) = message.wait_kind() else {
            return false;
        };
        let name = message.name();
        match self.pending.lock().remove(&kind) {
            Some(waiter) => {
                let delivered = waiter.send(Ok(message)).is_ok();
                debug!(message = name, delivered, "Browser message dispatched");
                delivered
            }
            None => {
                warn!(message = name, "Browser message with no pending wait");
                false
            }
        }
    }

    /// Parse a raw JSON message posted by a page and dispatch it.
    pub fn dispatch_json(&self, raw: &str) -> Result<bool> {
        let message: BrowserMessage = serde_json::from_str(raw)?;
        Ok(self.dispatch(message))
    }

    /// Resolve every pending wait with `Cancelled`.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (_, waiter) in drained {
            let _ = waiter.send(Err(ActivationError::Cancelled));
        }
        if count > 0 {
            info!(count, "Cancelled pending browser waits");
        }
        count
    }

    pub fn has_pending(&self, kind: WaitKind) -> bool {
        self.pending.lock().contains_key(&kind)
    }

    /// Most recent redeem page URL reported by the browser.
    pub fn redeem_page(&self) -> watch::Receiver<Option<String>> {
        self.redeem_page.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A registered, not yet resolved browser wait.
#[derive(Debug)]
pub struct PendingMessage {
    kind: WaitKind,
    rx: oneshot::Receiver<Result<BrowserMessage>>,
}

impl PendingMessage {
    pub fn kind(&self) -> WaitKind {
        self.kind
    }

    /// Race the message against `timeout`; the timer winning yields `on_timeout`.
    pub async fn wait(self, timeout: Duration, on_timeout: ActivationError) -> Result<BrowserMessage> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value: the bus was torn down.
            Ok(Err(_)) => Err(ActivationError::Cancelled),
            Err(_) => {
                warn!(kind = ?self.kind, timeout_secs = timeout.as_secs(), "Browser wait timed out");
                Err(on_timeout)
            }
        }
    }
}
