//! Key activation configuration
//!
//! TOML-based configuration with environment variable overrides. Every section is
//! optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub vendor: VendorConfig,
    pub proxy: ProxyConfig,
    pub token: TokenConfig,
    pub conversion: ConversionConfig,
    pub retry: RetryConfig,
    pub bundle: BundleConfig,

    /// Region table overrides and additions, keyed by region code
    pub regions: BTreeMap<String, RegionOverride>,

    /// Device identity the token cache is keyed by (empty: `default`)
    pub device_id: String,
}

/// Storefront backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            timeout_ms: 15_000,
        }
    }
}

/// Vendor commerce API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VendorConfig {
    pub base_url: String,
    pub orders_path: String,
    pub language: String,
    /// Market retried once on catalog misses and market mismatches
    pub fallback_market: String,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for VendorConfig {
    fn default() -> Self {
        Self {
            base_url: "https://purchase.mp.microsoft.com/v7.0".to_string(),
            orders_path: "/users/me/orders".to_string(),
            language: "en-US".to_string(),
            fallback_market: "US".to_string(),
            timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

/// Regional egress proxies
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Built-in regions resolve to `<region>.<domain>`
    pub domain: String,
    pub port: u16,
    /// Upper bound on how long fetched credentials are cached
    pub max_credential_ttl_secs: u64,
    /// Credentials are dropped this long before their stated expiry
    pub expiry_skew_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            domain: "egress.keyactivation.net".to_string(),
            port: 8080,
            max_credential_ttl_secs: 1800,
            expiry_skew_secs: 30,
        }
    }
}

/// Identity token capture
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub identity_url: String,
    /// Host suffix the identity surface must be on before the capture script runs
    pub identity_domain: String,
    pub ttl_secs: u64,
    pub capture_timeout_secs: u64,
    pub max_attempts: u32,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            identity_url: "https://account.xbox.com/".to_string(),
            identity_domain: "xbox.com".to_string(),
            ttl_secs: 3600,
            capture_timeout_secs: 30,
            max_attempts: 3,
        }
    }
}

/// Consent (conversion) sub-flow
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub consent_url: String,
    pub timeout_secs: u64,
    pub confirmation_steps: u32,
    /// Pause between injected step scripts
    pub step_delay_ms: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            consent_url: "https://redeem.microsoft.com/".to_string(),
            timeout_secs: 30,
            confirmation_steps: 3,
            step_delay_ms: 1500,
        }
    }
}

/// Per-key retry budgets and backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub validation_max_attempts: u32,
    pub redemption_max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            validation_max_attempts: 3,
            redemption_max_attempts: 2,
            base_delay_ms: 1000,
            max_delay_ms: 8000,
            jitter: true,
        }
    }
}

/// Throttling between bundle keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BundleConfig {
    pub inter_key_delay_ms: u64,
    /// Added once any key in the run has failed
    pub failure_penalty_ms: u64,
    /// Uniform jitter in `[-jitter_ms, +jitter_ms]`
    pub jitter_ms: u64,
    pub min_delay_ms: u64,
    /// How long a partially activated bundle is remembered for resuming
    pub resume_ttl_secs: u64,
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            inter_key_delay_ms: 3000,
            failure_penalty_ms: 2000,
            jitter_ms: 500,
            min_delay_ms: 1000,
            resume_ttl_secs: 3600,
        }
    }
}

/// Explicit egress endpoint for one region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionOverride {
    pub host: String,
    pub port: u16,
    pub market: String,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Reject values the services cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn require(ok: bool, message: &str) -> Result<(), ConfigError> {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::ValidationError(message.to_string()))
            }
        }

        require(!self.backend.base_url.trim().is_empty(), "backend.base_url is required")?;
        require(!self.vendor.base_url.trim().is_empty(), "vendor.base_url is required")?;
        require(!self.vendor.fallback_market.trim().is_empty(), "vendor.fallback_market is required")?;
        require(self.token.max_attempts >= 1, "token.max_attempts must be >= 1")?;
        require(self.token.capture_timeout_secs > 0, "token.capture_timeout_secs must be > 0")?;
        require(self.conversion.timeout_secs > 0, "conversion.timeout_secs must be > 0")?;
        require(self.conversion.confirmation_steps >= 1, "conversion.confirmation_steps must be >= 1")?;
        require(self.retry.validation_max_attempts >= 1, "retry.validation_max_attempts must be >= 1")?;
        require(self.retry.redemption_max_attempts >= 1, "retry.redemption_max_attempts must be >= 1")?;
        require(
            self.retry.base_delay_ms <= self.retry.max_delay_ms,
            "retry.base_delay_ms must not exceed retry.max_delay_ms",
        )?;
        for (code, region) in &self.regions {
            if region.host.trim().is_empty() || region.market.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "regions.{} needs host and market",
                    code
                )));
            }
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Key activation configuration
# Environment variables (KEYACTIVATION_*) override these settings

device_id = ""

[backend]
base_url = "http://localhost:8000/api"
timeout_ms = 15000

[vendor]
base_url = "https://purchase.mp.microsoft.com/v7.0"
orders_path = "/users/me/orders"
language = "en-US"
fallback_market = "US"
timeout_ms = 30000
connect_timeout_ms = 10000

[proxy]
domain = "egress.keyactivation.net"
port = 8080
max_credential_ttl_secs = 1800
expiry_skew_secs = 30

[token]
identity_url = "https://account.xbox.com/"
identity_domain = "xbox.com"
ttl_secs = 3600
capture_timeout_secs = 30
max_attempts = 3

[conversion]
consent_url = "https://redeem.microsoft.com/"
timeout_secs = 30
confirmation_steps = 3
step_delay_ms = 1500

[retry]
validation_max_attempts = 3
redemption_max_attempts = 2
base_delay_ms = 1000
max_delay_ms = 8000
jitter = true

[bundle]
inter_key_delay_ms = 3000
failure_penalty_ms = 2000
jitter_ms = 500
min_delay_ms = 1000
resume_ttl_secs = 3600

# [regions.DE]
# host = "de-2.egress.keyactivation.net"
# port = 3128
# market = "DE"
"#
        .to_string()
    }
}
