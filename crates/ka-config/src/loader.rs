//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "keyactivation.toml",
    "config.toml",
    "./config/keyactivation.toml",
    "/etc/keyactivation/config.toml",
];

/// Env var naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "KEYACTIVATION_CONFIG";

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load from file (if found), apply environment overrides, validate
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|name| env::var(name).ok())
    }

    /// Same as [`load`](Self::load) with an explicit variable lookup.
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match self.find_config_file(&lookup) {
            Some(path) => {
                info!(?path, "Loading configuration from file");
                AppConfig::from_file(&path)?
            }
            None => AppConfig::default(),
        };

        apply_overrides(&mut config, &lookup);
        config.validate()?;
        Ok(config)
    }

    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured path does not exist, searching defaults");
        }

        if let Some(path) = lookup(CONFIG_PATH_ENV).map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn set_parsed<T: FromStr, F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, target: &mut T) {
    if let Some(val) = lookup(name) {
        match val.trim().parse() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(var = name, value = %val, "Ignoring unparseable override"),
        }
    }
}

fn set_string<F: Fn(&str) -> Option<String>>(lookup: &F, name: &str, target: &mut String) {
    if let Some(val) = lookup(name) {
        *target = val;
    }
}

fn apply_overrides<F: Fn(&str) -> Option<String>>(config: &mut AppConfig, lookup: &F) {
    // Backend
    set_string(lookup, "KEYACTIVATION_BACKEND_URL", &mut config.backend.base_url);
    set_parsed(lookup, "KEYACTIVATION_BACKEND_TIMEOUT_MS", &mut config.backend.timeout_ms);

    // Vendor
    set_string(lookup, "KEYACTIVATION_VENDOR_URL", &mut config.vendor.base_url);
    set_string(lookup, "KEYACTIVATION_VENDOR_LANGUAGE", &mut config.vendor.language);
    set_string(lookup, "KEYACTIVATION_FALLBACK_MARKET", &mut config.vendor.fallback_market);
    set_parsed(lookup, "KEYACTIVATION_VENDOR_TIMEOUT_MS", &mut config.vendor.timeout_ms);

    // Proxy
    set_string(lookup, "KEYACTIVATION_PROXY_DOMAIN", &mut config.proxy.domain);
    set_parsed(lookup, "KEYACTIVATION_PROXY_PORT", &mut config.proxy.port);

    // Token capture
    set_string(lookup, "KEYACTIVATION_IDENTITY_URL", &mut config.token.identity_url);
    set_parsed(lookup, "KEYACTIVATION_TOKEN_TTL_SECS", &mut config.token.ttl_secs);
    set_parsed(lookup, "KEYACTIVATION_TOKEN_TIMEOUT_SECS", &mut config.token.capture_timeout_secs);

    // Conversion
    set_string(lookup, "KEYACTIVATION_CONSENT_URL", &mut config.conversion.consent_url);
    set_parsed(lookup, "KEYACTIVATION_CONVERSION_TIMEOUT_SECS", &mut config.conversion.timeout_secs);

    // Retry / bundle throttling
    set_parsed(lookup, "KEYACTIVATION_VALIDATION_MAX_ATTEMPTS", &mut config.retry.validation_max_attempts);
    set_parsed(lookup, "KEYACTIVATION_REDEMPTION_MAX_ATTEMPTS", &mut config.retry.redemption_max_attempts);
    set_parsed(lookup, "KEYACTIVATION_RETRY_JITTER", &mut config.retry.jitter);
    set_parsed(lookup, "KEYACTIVATION_INTER_KEY_DELAY_MS", &mut config.bundle.inter_key_delay_ms);
    set_parsed(lookup, "KEYACTIVATION_BUNDLE_RESUME_TTL_SECS", &mut config.bundle.resume_ttl_secs);

    set_string(lookup, "KEYACTIVATION_DEVICE_ID", &mut config.device_id);
}
