//! Vendor commerce client: key validation and redemption.
//!
//! - Direct transport for global keys, a proxied reqwest client per region otherwise
//! - Proxied clients are opened once per region and reused until released
//! - Response classification into [`ActivationError`]
//! - One fallback-market retry for catalog misses and market mismatches
//! - Attempt budgets counted on the caller's [`KeyState`]

use ka_common::{mask_key, KeyState, Product};
use ka_config::{RetryConfig, VendorConfig};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, Proxy, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backoff::RetryPolicy;
use crate::credentials::{CredentialCache, ProxyCredentials};
use crate::error::{ActivationError, Result};
use crate::region::{RegionConfig, RegionRegistry, Route};
use crate::token_cache::IdentityToken;

pub const CONVERSION_CONSENT_REQUIRED: &str = "ConversionConsentRequired";
pub const ACTIVE_MARKET_MISMATCH: &str = "ActiveMarketMismatch";
pub const USER_ALREADY_OWNS_CONTENT: &str = "UserAlreadyOwnsContent";
pub const TOKEN_ALREADY_REDEEMED: &str = "TokenAlreadyRedeemed";
pub const INVALID_TOKEN: &str = "InvalidToken";
pub const CATALOG_DATA_NOT_FOUND: &str = "catalog data not found";

#[derive(Debug, Clone)]
pub struct VendorClientConfig {
    pub base_url: String,
    pub orders_path: String,
    pub language: String,
    pub fallback_market: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub validation: RetryPolicy,
    pub redemption: RetryPolicy,
}

impl VendorClientConfig {
    pub fn from_config(vendor: &VendorConfig, retry: &RetryConfig) -> Self {
        Self {
            base_url: vendor.base_url.trim_end_matches('/').to_string(),
            orders_path: vendor.orders_path.clone(),
            language: vendor.language.clone(),
            fallback_market: vendor.fallback_market.to_ascii_uppercase(),
            timeout: Duration::from_millis(vendor.timeout_ms),
            connect_timeout: Duration::from_millis(vendor.connect_timeout_ms),
            validation: RetryPolicy::validation(retry),
            redemption: RetryPolicy::redemption(retry),
        }
    }
}

impl Default for VendorClientConfig {
    fn default() -> Self {
        Self::from_config(&VendorConfig::default(), &RetryConfig::default())
    }
}

/// Result of a token-description read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Validation {
    Valid,
    AlreadyRedeemed,
    /// The vendor knows the key but it is not redeemable; carries the reported state.
    Invalid { state: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VendorStats {
    /// Proxied transports opened since construction
    pub sessions_opened: u64,
    /// Proxied transports currently held
    pub open_sessions: usize,
    /// Vendor HTTP requests issued
    pub requests: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenDescription {
    #[serde(alias = "state")]
    token_state: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest<'a> {
    order_id: String,
    market: &'a str,
    language: &'a str,
    order_state: &'static str,
    billing_information: BillingInformation<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    friendly_name: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct BillingInformation<'a> {
    payment_instrument_id: &'a str,
    payment_instrument_type: &'static str,
    session_id: String,
}

/// Vendor error payload. Codes may sit at the top level, under `error`, or in
/// `innererror`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    innererror: Option<Box<ErrorBody>>,
    error: Option<Box<ErrorBody>>,
    data: Vec<serde_json::Value>,
    products: Vec<serde_json::Value>,
}

/// Parsed non-success response.
#[derive(Debug)]
struct VendorFailure {
    status: StatusCode,
    codes: Vec<String>,
    products: Vec<String>,
    text: String,
}

impl VendorFailure {
    fn parse(status: StatusCode, text: String) -> Self {
        let body: ErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let mut codes = Vec::new();
        let mut products = Vec::new();
        collect(&body, &mut codes, &mut products);
        Self {
            status,
            codes,
            products,
            text: text.to_ascii_lowercase(),
        }
    }

    /// Structured code match, falling back to a substring search of the raw body.
    fn has(&self, code: &str) -> bool {
        self.codes.iter().any(|c| c.eq_ignore_ascii_case(code))
            || self.text.contains(&code.to_ascii_lowercase())
    }

    fn is_catalog_miss(&self) -> bool {
        self.text.contains(CATALOG_DATA_NOT_FOUND)
    }
}

fn collect(body: &ErrorBody, codes: &mut Vec<String>, products: &mut Vec<String>) {
    codes.extend(body.code.iter().cloned());
    if let Some(message) = &body.message {
        debug!(%message, "Vendor error message");
    }
    products.extend(body.data.iter().chain(&body.products).filter_map(product_name));
    for nested in body.innererror.iter().chain(&body.error) {
        collect(nested, codes, products);
    }
}

fn product_name(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Object(map) => ["title", "productTitle", "name", "productId"]
            .iter()
            .find_map(|field| map.get(*field).and_then(|v| v.as_str()))
            .map(str::to_string),
        _ => None,
    }
}

fn classify_validation(failure: &VendorFailure) -> ActivationError {
    if failure.is_catalog_miss() {
        return ActivationError::CatalogNotFound;
    }
    match failure.status {
        StatusCode::UNAUTHORIZED => ActivationError::AuthenticationFailed,
        StatusCode::NOT_FOUND => ActivationError::InvalidKey,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ActivationError::ProxyAuthenticationFailed,
        StatusCode::CONFLICT => ActivationError::AlreadyRedeemed,
        StatusCode::BAD_REQUEST if failure.has(TOKEN_ALREADY_REDEEMED) => {
            ActivationError::AlreadyRedeemed
        }
        StatusCode::BAD_REQUEST if failure.has(INVALID_TOKEN) => ActivationError::InvalidKey,
        s if s.is_server_error() => ActivationError::ServerError(s.as_u16()),
        s => ActivationError::HttpError(s.as_u16()),
    }
}

fn classify_redemption(failure: &VendorFailure) -> ActivationError {
    let status = failure.status;
    match status {
        StatusCode::PRECONDITION_FAILED if failure.has(CONVERSION_CONSENT_REQUIRED) => {
            ActivationError::ConversionRequired
        }
        StatusCode::FORBIDDEN if failure.has(ACTIVE_MARKET_MISMATCH) => {
            ActivationError::MarketMismatch
        }
        StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST
            if failure.has(USER_ALREADY_OWNS_CONTENT) =>
        {
            ActivationError::AlreadyOwned(failure.products.clone())
        }
        StatusCode::CONFLICT => ActivationError::AlreadyRedeemed,
        StatusCode::BAD_REQUEST if failure.has(TOKEN_ALREADY_REDEEMED) => {
            ActivationError::AlreadyRedeemed
        }
        StatusCode::BAD_REQUEST if failure.has(INVALID_TOKEN) => ActivationError::InvalidKey,
        StatusCode::UNAUTHORIZED => ActivationError::AuthenticationFailed,
        StatusCode::PROXY_AUTHENTICATION_REQUIRED => ActivationError::ProxyAuthenticationFailed,
        s if s.is_server_error() => ActivationError::ServerError(s.as_u16()),
        s => ActivationError::HttpError(s.as_u16()),
    }
}

/// What happens before the next attempt.
enum Retry {
    /// Fallback market, same transport, no delay
    Now,
    /// Proxy rejected the credentials
    Reopen,
    After(Duration),
}

/// Error for a call that found its attempt budget already spent.
fn budget_spent(attempts: u32, last: Option<ActivationError>) -> ActivationError {
    ActivationError::exhausted(
        attempts,
        last.unwrap_or_else(|| ActivationError::Network("attempt budget already spent".to_string())),
    )
}

pub struct VendorClient {
    config: VendorClientConfig,
    regions: Arc<RegionRegistry>,
    credentials: Arc<CredentialCache>,
    direct: Client,
    sessions: Mutex<HashMap<String, Client>>,
    sessions_opened: AtomicU64,
    requests: AtomicU64,
}

impl VendorClient {
    pub fn new(
        config: VendorClientConfig,
        regions: Arc<RegionRegistry>,
        credentials: Arc<CredentialCache>,
    ) -> Result<Self> {
        let direct = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .no_proxy()
            .build()
            .map_err(|e| ActivationError::Config(format!("vendor client: {}", e)))?;

        info!(
            base_url = %config.base_url,
            regions = regions.len(),
            timeout_secs = config.timeout.as_secs(),
            "VendorClient initialized"
        );

        Ok(Self {
            config,
            regions,
            credentials,
            direct,
            sessions: Mutex::new(HashMap::new()),
            sessions_opened: AtomicU64::new(0),
            requests: AtomicU64::new(0),
        })
    }

    pub fn stats(&self) -> VendorStats {
        VendorStats {
            sessions_opened: self.sessions_opened.load(Ordering::SeqCst),
            open_sessions: self.sessions.lock().len(),
            requests: self.requests.load(Ordering::SeqCst),
        }
    }

    /// Drop every proxied transport. Returns how many were held.
    pub fn release_sessions(&self) -> usize {
        let released = self.sessions.lock().drain().count();
        if released > 0 {
            info!(released, "Released proxy sessions");
        }
        released
    }

    /// Read the key's token description, falling back to the fallback market once
    /// when the native market has no catalog entry.
    pub async fn validate(
        &self,
        state: &mut KeyState,
        token: &IdentityToken,
        region: &str,
    ) -> Result<Validation> {
        let route = self.regions.resolve(region)?;
        let policy = &self.config.validation;
        if !policy.allows(state.validation_attempts) {
            return Err(budget_spent(state.validation_attempts, None));
        }

        let mut market = route.market().to_string();
        let mut fell_back = false;
        let mut reopened = false;
        let mut http = self.transport(&route).await?;

        loop {
            state.validation_attempts += 1;
            state.record_market(&market);

            let error = match self.validate_once(&http, &state.key, token, &market).await {
                Ok(validation) => {
                    debug!(
                        key = %mask_key(&state.key),
                        %market,
                        attempt = state.validation_attempts,
                        result = ?validation,
                        "Key validated"
                    );
                    return Ok(validation);
                }
                Err(e) => e,
            };
            state.last_error = Some(error.to_string());

            let next = match &error {
                ActivationError::CatalogNotFound
                    if !fell_back && market != self.config.fallback_market =>
                {
                    info!(
                        key = %mask_key(&state.key),
                        from = %market,
                        to = %self.config.fallback_market,
                        "Catalog miss, validating against fallback market"
                    );
                    fell_back = true;
                    market = self.config.fallback_market.clone();
                    Some(Retry::Now)
                }
                ActivationError::CatalogNotFound => None,
                ActivationError::ProxyAuthenticationFailed if !reopened => {
                    reopened = true;
                    Some(Retry::Reopen)
                }
                ActivationError::ProxyAuthenticationFailed => None,
                e if e.is_recoverable() => {
                    Some(Retry::After(policy.delay_after(state.validation_attempts)))
                }
                _ => None,
            };
            let Some(next) = next else {
                return Err(error);
            };

            if !policy.allows(state.validation_attempts) {
                warn!(
                    key = %mask_key(&state.key),
                    attempts = state.validation_attempts,
                    error = %error,
                    "Validation attempts exhausted"
                );
                return Err(ActivationError::exhausted(state.validation_attempts, error));
            }
            http = self.prepare_retry(next, &route, http, &error, "validation").await?;
        }
    }

    /// Place an order paid with the key. A market mismatch is retried once against
    /// the fallback market on the same transport.
    pub async fn redeem(
        &self,
        state: &mut KeyState,
        token: &IdentityToken,
        region: &str,
        product: &Product,
    ) -> Result<()> {
        let route = self.regions.resolve(region)?;
        let policy = &self.config.redemption;
        if !policy.allows(state.redemption_attempts) {
            return Err(budget_spent(state.redemption_attempts, None));
        }

        let mut market = route.market().to_string();
        let mut fell_back = false;
        let mut reopened = false;
        let mut http = self.transport(&route).await?;

        loop {
            state.redemption_attempts += 1;
            state.record_market(&market);

            let error = match self.redeem_once(&http, &state.key, token, &market, product).await {
                Ok(()) => {
                    info!(
                        key = %mask_key(&state.key),
                        %market,
                        attempt = state.redemption_attempts,
                        "Key redeemed"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };
            state.last_error = Some(error.to_string());

            let next = match &error {
                ActivationError::MarketMismatch
                    if !fell_back && market != self.config.fallback_market =>
                {
                    info!(
                        key = %mask_key(&state.key),
                        from = %market,
                        to = %self.config.fallback_market,
                        "Active market mismatch, retrying on the same transport"
                    );
                    fell_back = true;
                    market = self.config.fallback_market.clone();
                    Some(Retry::Now)
                }
                ActivationError::MarketMismatch => None,
                ActivationError::ProxyAuthenticationFailed if !reopened => {
                    reopened = true;
                    Some(Retry::Reopen)
                }
                ActivationError::ProxyAuthenticationFailed => None,
                e if e.is_recoverable() => {
                    Some(Retry::After(policy.delay_after(state.redemption_attempts)))
                }
                _ => None,
            };
            let Some(next) = next else {
                return Err(error);
            };

            if !policy.allows(state.redemption_attempts) {
                warn!(
                    key = %mask_key(&state.key),
                    attempts = state.redemption_attempts,
                    error = %error,
                    "Redemption attempts exhausted"
                );
                return Err(ActivationError::exhausted(state.redemption_attempts, error));
            }
            http = self.prepare_retry(next, &route, http, &error, "redemption").await?;
        }
    }

    /// Sleep or swap transports ahead of the next attempt.
    async fn prepare_retry(
        &self,
        next: Retry,
        route: &Route,
        http: Client,
        error: &ActivationError,
        operation: &'static str,
    ) -> Result<Client> {
        match next {
            Retry::Now => Ok(http),
            Retry::Reopen => {
                self.reopen(route);
                self.transport(route).await
            }
            Retry::After(delay) => {
                warn!(
                    operation,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Vendor call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                Ok(http)
            }
        }
    }

    async fn validate_once(
        &self,
        client: &Client,
        key: &str,
        token: &IdentityToken,
        market: &str,
    ) -> Result<Validation> {
        let url = format!(
            "{}/tokenDescriptions/{}",
            self.config.base_url,
            urlencoding::encode(key)
        );
        self.requests.fetch_add(1, Ordering::SeqCst);

        let response = client
            .get(&url)
            .query(&[("market", market), ("language", self.config.language.as_str())])
            .header(AUTHORIZATION, token.secret())
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let failure = VendorFailure::parse(status, text);
            return Err(classify_validation(&failure));
        }

        let description: TokenDescription = match serde_json::from_str(&text) {
            Ok(d) => d,
            Err(_) if text.to_ascii_lowercase().contains(CATALOG_DATA_NOT_FOUND) => {
                return Err(ActivationError::CatalogNotFound)
            }
            Err(e) => return Err(e.into()),
        };

        let token_state = description.token_state.trim();
        if token_state.eq_ignore_ascii_case("Active") {
            Ok(Validation::Valid)
        } else if token_state.eq_ignore_ascii_case("Redeemed")
            || token_state.eq_ignore_ascii_case("AlreadyRedeemed")
        {
            Ok(Validation::AlreadyRedeemed)
        } else {
            Ok(Validation::Invalid {
                state: token_state.to_string(),
            })
        }
    }

    async fn redeem_once(
        &self,
        client: &Client,
        key: &str,
        token: &IdentityToken,
        market: &str,
        product: &Product,
    ) -> Result<()> {
        let url = format!("{}{}", self.config.base_url, self.config.orders_path);
        let order = OrderRequest {
            order_id: Uuid::new_v4().to_string(),
            market,
            language: &self.config.language,
            order_state: "Purchased",
            billing_information: BillingInformation {
                payment_instrument_id: key,
                payment_instrument_type: "Token",
                session_id: Uuid::new_v4().to_string(),
            },
            friendly_name: Some(product.name.as_str()).filter(|n| !n.is_empty()),
        };
        self.requests.fetch_add(1, Ordering::SeqCst);

        let response = client
            .post(&url)
            .header(AUTHORIZATION, token.secret())
            .header(ACCEPT, "application/json")
            .json(&order)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let text = response.text().await.unwrap_or_default();
        let failure = VendorFailure::parse(status, text);
        let error = classify_redemption(&failure);
        debug!(
            status = status.as_u16(),
            codes = ?failure.codes,
            error = %error,
            "Redemption rejected"
        );
        Err(error)
    }

    /// Transport for `route`: the shared direct client, or this region's proxy
    /// session, opened on first use.
    async fn transport(&self, route: &Route) -> Result<Client> {
        let (region, config) = match route {
            Route::Direct { .. } => return Ok(self.direct.clone()),
            Route::Proxied { region, config } => (region, config),
        };

        let existing = self.sessions.lock().get(region).cloned();
        if let Some(client) = existing {
            return Ok(client);
        }

        let credentials = self.credentials.get().await?;
        let client = self.proxied_client(config, &credentials)?;

        let mut sessions = self.sessions.lock();
        let client = sessions
            .entry(region.clone())
            .or_insert_with(|| {
                self.sessions_opened.fetch_add(1, Ordering::SeqCst);
                info!(
                    region = %region,
                    proxy = %format!("{}:{}", config.host, config.port),
                    "Opened proxy session"
                );
                client
            })
            .clone();
        Ok(client)
    }

    fn proxied_client(&self, region: &RegionConfig, credentials: &ProxyCredentials) -> Result<Client> {
        let proxy_url = format!("http://{}:{}", region.host, region.port);
        let proxy = Proxy::all(&proxy_url)
            .map_err(|e| ActivationError::Config(format!("proxy {}: {}", proxy_url, e)))?
            .basic_auth(&credentials.user, &credentials.password);

        Client::builder()
            .timeout(self.config.timeout)
            .connect_timeout(self.config.connect_timeout)
            .proxy(proxy)
            .build()
            .map_err(|e| ActivationError::Config(format!("proxied client: {}", e)))
    }

    /// Forget the credentials and session the proxy just rejected.
    fn reopen(&self, route: &Route) {
        self.credentials.invalidate();
        if let Route::Proxied { region, .. } = route {
            if self.sessions.lock().remove(region).is_some() {
                warn!(region = %region, "Proxy rejected credentials, reopening session");
            }
        }
    }
}
