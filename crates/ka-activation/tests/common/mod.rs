//! Shared mocks for the activation integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use ka_activation::{
    ActivationError, BackendClient, BrowserAutomation, BrowserMessage, MessageBus,
    ProxyCredentials, Result, Surface,
};
use ka_common::{ActivationMethod, Product};
use ka_config::{AppConfig, RegionOverride};

pub const PROXY_USER: &str = "proxy-user";
pub const PROXY_PASSWORD: &str = "proxy-pass";
/// `Basic base64("proxy-user:proxy-pass")`
pub const PROXY_AUTHORIZATION: &str = "Basic cHJveHktdXNlcjpwcm94eS1wYXNz";
pub const IDENTITY_TOKEN: &str = "XBL3.0 x=1234;test-token";

/// Mock storefront backend
pub struct MockBackend {
    products: Mutex<HashMap<String, Product>>,
    lookups: AtomicU32,
    credential_fetches: AtomicU32,
    credential_delay: Duration,
    reports: Mutex<Vec<(String, bool)>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::with_credential_delay(Duration::ZERO)
    }

    pub fn with_credential_delay(delay: Duration) -> Self {
        Self {
            products: Mutex::new(HashMap::new()),
            lookups: AtomicU32::new(0),
            credential_fetches: AtomicU32::new(0),
            credential_delay: delay,
            reports: Mutex::new(Vec::new()),
        }
    }

    pub fn with_product(self, session_token: &str, product: Product) -> Self {
        self.products.lock().insert(session_token.to_string(), product);
        self
    }

    /// Replace the product behind a session between runs.
    pub fn set_product(&self, session_token: &str, product: Product) {
        self.products.lock().insert(session_token.to_string(), product);
    }

    pub fn credential_fetches(&self) -> u32 {
        self.credential_fetches.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<(String, bool)> {
        self.reports.lock().clone()
    }
}

#[async_trait]
impl BackendClient for MockBackend {
    async fn lookup_session(&self, session_token: &str) -> Result<Product> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.products
            .lock()
            .get(session_token)
            .cloned()
            .ok_or_else(|| ActivationError::Backend("session not found".to_string()))
    }

    async fn mark_activated(&self, session_token: &str, success: bool) -> Result<()> {
        self.reports.lock().push((session_token.to_string(), success));
        Ok(())
    }

    async fn proxy_credentials(&self) -> Result<ProxyCredentials> {
        self.credential_fetches.fetch_add(1, Ordering::SeqCst);
        if !self.credential_delay.is_zero() {
            tokio::time::sleep(self.credential_delay).await;
        }
        Ok(ProxyCredentials {
            user: PROXY_USER.to_string(),
            password: PROXY_PASSWORD.to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

/// How the identity page answers the capture script.
#[derive(Debug, Clone)]
pub enum CaptureReply {
    Token(String),
    Fail(String),
    Silent,
}

/// Mock embedded browser that answers injected scripts through the message bus.
pub struct MockBrowser {
    bus: OnceLock<Arc<MessageBus>>,
    capture: CaptureReply,
    conversion: Option<BrowserMessage>,
    current_url: Mutex<Option<String>>,
    loads: Mutex<Vec<(Surface, String)>>,
    identity_injections: AtomicU32,
    conversion_injections: AtomicU32,
}

impl MockBrowser {
    pub fn new(capture: CaptureReply) -> Self {
        Self {
            bus: OnceLock::new(),
            capture,
            conversion: None,
            current_url: Mutex::new(None),
            loads: Mutex::new(Vec::new()),
            identity_injections: AtomicU32::new(0),
            conversion_injections: AtomicU32::new(0),
        }
    }

    pub fn token() -> Self {
        Self::new(CaptureReply::Token(IDENTITY_TOKEN.to_string()))
    }

    pub fn silent() -> Self {
        Self::new(CaptureReply::Silent)
    }

    pub fn with_conversion_reply(mut self, reply: BrowserMessage) -> Self {
        self.conversion = Some(reply);
        self
    }

    pub fn attach(&self, bus: Arc<MessageBus>) {
        let _ = self.bus.set(bus);
    }

    pub fn identity_injections(&self) -> u32 {
        self.identity_injections.load(Ordering::SeqCst)
    }

    pub fn conversion_injections(&self) -> u32 {
        self.conversion_injections.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> Vec<(Surface, String)> {
        self.loads.lock().clone()
    }

    fn post(&self, message: BrowserMessage) {
        if let Some(bus) = self.bus.get() {
            bus.dispatch(message);
        }
    }
}

#[async_trait]
impl BrowserAutomation for MockBrowser {
    async fn load_url(&self, surface: Surface, url: &str) -> std::result::Result<(), String> {
        self.loads.lock().push((surface, url.to_string()));
        if surface == Surface::Identity {
            *self.current_url.lock() = Some(url.to_string());
        }
        Ok(())
    }

    async fn inject_script(
        &self,
        surface: Surface,
        _source: &str,
    ) -> std::result::Result<serde_json::Value, String> {
        match surface {
            Surface::Identity => {
                self.identity_injections.fetch_add(1, Ordering::SeqCst);
                match &self.capture {
                    CaptureReply::Token(token) => self.post(BrowserMessage::TokenCaptured {
                        token: token.clone(),
                    }),
                    CaptureReply::Fail(error) => self.post(BrowserMessage::TokenCaptureFailed {
                        error: error.clone(),
                    }),
                    CaptureReply::Silent => {}
                }
            }
            Surface::Conversion => {
                self.conversion_injections.fetch_add(1, Ordering::SeqCst);
                if let Some(reply) = &self.conversion {
                    self.post(reply.clone());
                }
            }
        }
        Ok(serde_json::Value::Null)
    }

    async fn current_url(&self, surface: Surface) -> Option<String> {
        match surface {
            Surface::Identity => self.current_url.lock().clone(),
            Surface::Conversion => None,
        }
    }
}

pub fn product(keys: &[&str], region: &str) -> Product {
    Product {
        keys: keys.iter().map(|k| k.to_string()).collect(),
        region: region.to_string(),
        vendor: "xbox".to_string(),
        name: "Test Game".to_string(),
        image_url: None,
        status: "paid".to_string(),
        activation_method: ActivationMethod::Standard,
        order_id: Some("order-1".to_string()),
        order_item_id: Some("item-1".to_string()),
        expires_at: None,
        is_subscription: false,
    }
}

/// Config with near-zero delays, pointed at `vendor_url`.
pub fn fast_config(vendor_url: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.vendor.base_url = vendor_url.to_string();
    config.device_id = "device-test".to_string();
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.jitter = false;
    config.bundle.inter_key_delay_ms = 1;
    config.bundle.failure_penalty_ms = 1;
    config.bundle.jitter_ms = 0;
    config.bundle.min_delay_ms = 0;
    config.conversion.step_delay_ms = 1;
    config
}

/// Route region `code` through a proxy listening at `proxy_uri` (a wiremock server).
pub fn proxy_region(config: &mut AppConfig, code: &str, market: &str, proxy_uri: &str) {
    let address = proxy_uri.trim_start_matches("http://");
    let (host, port) = address.rsplit_once(':').unwrap_or((address, "80"));
    config.regions.insert(
        code.to_string(),
        RegionOverride {
            host: host.to_string(),
            port: port.parse().unwrap_or(80),
            market: market.to_string(),
        },
    );
}

pub fn token_description(state: &str) -> serde_json::Value {
    serde_json::json!({ "tokenState": state, "products": [] })
}
