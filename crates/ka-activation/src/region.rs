//! Region registry: storefront region code → egress proxy endpoint and market.

use std::collections::HashMap;

use ka_config::{ProxyConfig, RegionOverride};

use crate::error::{ActivationError, Result};

/// Region codes that are redeemed without an egress proxy.
pub const GLOBAL_REGION_CODES: &[&str] = &["GLOBAL", "WW", "WORLDWIDE"];

/// Built-in regions as `(region code, market code)`.
const BUILTIN_REGIONS: &[(&str, &str)] = &[
    ("AR", "AR"),
    ("AU", "AU"),
    ("BR", "BR"),
    ("CA", "CA"),
    ("CL", "CL"),
    ("CO", "CO"),
    ("DE", "DE"),
    ("EG", "EG"),
    ("ES", "ES"),
    ("EU", "DE"),
    ("FR", "FR"),
    ("HU", "HU"),
    ("IN", "IN"),
    ("IT", "IT"),
    ("JP", "JP"),
    ("KR", "KR"),
    ("MX", "MX"),
    ("NG", "NG"),
    ("NL", "NL"),
    ("NZ", "NZ"),
    ("PL", "PL"),
    ("SA", "SA"),
    ("TR", "TR"),
    ("UK", "GB"),
    ("US", "US"),
    ("UA", "UA"),
    ("ZA", "ZA"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionConfig {
    pub host: String,
    pub port: u16,
    pub market: String,
}

/// How a region's vendor calls leave the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct { market: String },
    Proxied { region: String, config: RegionConfig },
}

impl Route {
    pub fn market(&self) -> &str {
        match self {
            Route::Direct { market } => market,
            Route::Proxied { config, .. } => &config.market,
        }
    }
}

/// Immutable region table, built once at startup.
#[derive(Debug, Clone)]
pub struct RegionRegistry {
    regions: HashMap<String, RegionConfig>,
    direct_market: String,
}

impl RegionRegistry {
    /// Built-in table with proxies at `<code>.<domain>:<port>`.
    pub fn builtin(proxy: &ProxyConfig) -> Self {
        let regions = BUILTIN_REGIONS
            .iter()
            .map(|(code, market)| {
                let config = RegionConfig {
                    host: format!("{}.{}", code.to_ascii_lowercase(), proxy.domain),
                    port: proxy.port,
                    market: market.to_string(),
                };
                (code.to_string(), config)
            })
            .collect();

        Self {
            regions,
            direct_market: "US".to_string(),
        }
    }

    /// Built-in table with configured entries replacing or extending it.
    pub fn with_overrides<'a, I>(proxy: &ProxyConfig, overrides: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a RegionOverride)>,
    {
        let mut registry = Self::builtin(proxy);
        for (code, o) in overrides {
            registry.regions.insert(
                normalize(code),
                RegionConfig {
                    host: o.host.clone(),
                    port: o.port,
                    market: o.market.to_ascii_uppercase(),
                },
            );
        }
        registry
    }

    /// Market used for region codes that bypass proxying.
    pub fn with_direct_market(mut self, market: impl Into<String>) -> Self {
        self.direct_market = market.into();
        self
    }

    pub fn is_global(code: &str) -> bool {
        let code = normalize(code);
        GLOBAL_REGION_CODES.contains(&code.as_str())
    }

    pub fn get(&self, code: &str) -> Option<&RegionConfig> {
        self.regions.get(&normalize(code))
    }

    pub fn resolve(&self, code: &str) -> Result<Route> {
        if Self::is_global(code) {
            return Ok(Route::Direct {
                market: self.direct_market.clone(),
            });
        }
        let region = normalize(code);
        match self.regions.get(&region) {
            Some(config) => Ok(Route::Proxied {
                region,
                config: config.clone(),
            }),
            None => Err(ActivationError::UnsupportedRegion(code.to_string())),
        }
    }

    pub fn market_for(&self, code: &str) -> Result<String> {
        self.resolve(code).map(|route| route.market().to_string())
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

fn normalize(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
