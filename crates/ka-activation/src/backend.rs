//! Storefront backend collaborator: session lookup, activation reporting and proxy
//! credential issuance.

use async_trait::async_trait;
use ka_common::Product;
use ka_config::BackendConfig;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::credentials::ProxyCredentials;
use crate::error::{ActivationError, Result};

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Resolve the product behind an opaque session token.
    async fn lookup_session(&self, session_token: &str) -> Result<Product>;

    /// Report the run's result. Called exactly once per run.
    async fn mark_activated(&self, session_token: &str, success: bool) -> Result<()>;

    async fn proxy_credentials(&self) -> Result<ProxyCredentials>;
}

#[derive(Debug, Serialize)]
struct MarkActivatedRequest<'a> {
    session_token: &'a str,
    success: bool,
}

/// reqwest-backed [`BackendClient`].
pub struct HttpBackendClient {
    client: Client,
    base_url: String,
}

impl HttpBackendClient {
    pub fn new(config: &BackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!("ka-activation/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ActivationError::Config(format!("backend client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn error_from(response: reqwest::Response, what: &str) -> ActivationError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        ActivationError::Backend(format!("{} failed with HTTP {}: {}", what, status.as_u16(), body))
    }
}

#[async_trait]
impl BackendClient for HttpBackendClient {
    async fn lookup_session(&self, session_token: &str) -> Result<Product> {
        let url = self.url(&format!(
            "/activation/sessions/{}",
            urlencoding::encode(session_token)
        ));
        debug!(%url, "Resolving activation session");

        let response = self.client.get(&url).send().await?;
        match response.status() {
            status if status.is_success() => {
                let product: Product = response.json().await?;
                info!(
                    keys = product.keys.len(),
                    region = %product.region,
                    vendor = %product.vendor,
                    "Session resolved"
                );
                Ok(product)
            }
            StatusCode::NOT_FOUND => Err(ActivationError::Backend("session not found".to_string())),
            _ => Err(Self::error_from(response, "session lookup").await),
        }
    }

    async fn mark_activated(&self, session_token: &str, success: bool) -> Result<()> {
        let response = self
            .client
            .post(self.url("/activation/mark-activated"))
            .json(&MarkActivatedRequest { session_token, success })
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            let err = Self::error_from(response, "mark activated").await;
            warn!(error = %err, "Backend rejected activation report");
            Err(err)
        }
    }

    async fn proxy_credentials(&self) -> Result<ProxyCredentials> {
        let response = self
            .client
            .post(self.url("/activation/proxy-credentials"))
            .json(&serde_json::json!({}))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, "proxy credentials").await);
        }
        let credentials: ProxyCredentials = response.json().await?;
        debug!(user = %credentials.user, expires_at = %credentials.expires_at, "Proxy credentials issued");
        Ok(credentials)
    }
}
