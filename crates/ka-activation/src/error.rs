use thiserror::Error;

/// Failure taxonomy for activation.
///
/// `Clone` so a single in-flight fetch can hand the same error to every waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActivationError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out waiting for identity token")]
    TokenTimeout,

    #[error("Identity token capture failed: {0}")]
    TokenCaptureFailed(String),

    #[error("Timed out waiting for conversion consent")]
    ConversionTimeout,

    #[error("Vendor rejected the identity token")]
    AuthenticationFailed,

    #[error("Egress proxy rejected credentials")]
    ProxyAuthenticationFailed,

    #[error("Invalid key")]
    InvalidKey,

    #[error("Key already redeemed")]
    AlreadyRedeemed,

    #[error("Account already owns: {}", .0.join(", "))]
    AlreadyOwned(Vec<String>),

    #[error("Conversion consent required")]
    ConversionRequired,

    #[error("Conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Active market mismatch")]
    MarketMismatch,

    #[error("Catalog data not found for market")]
    CatalogNotFound,

    #[error("Unsupported region: {0}")]
    UnsupportedRegion(String),

    #[error("Vendor server error: HTTP {0}")]
    ServerError(u16),

    #[error("Unexpected vendor response: HTTP {0}")]
    HttpError(u16),

    #[error("Gave up after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: Box<ActivationError>,
    },

    #[error("Cancelled")]
    Cancelled,

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Browser automation error: {0}")]
    Browser(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ActivationError {
    /// Whether a local retry may succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ActivationError::Network(_)
                | ActivationError::TokenTimeout
                | ActivationError::TokenCaptureFailed(_)
                | ActivationError::ProxyAuthenticationFailed
                | ActivationError::MarketMismatch
                | ActivationError::CatalogNotFound
                | ActivationError::ServerError(_)
        )
    }

    /// Strip retry wrapping to get at the error that ended the attempts.
    pub fn root(&self) -> &ActivationError {
        match self {
            ActivationError::MaxRetriesExceeded { last, .. } => last.root(),
            other => other,
        }
    }

    pub fn exhausted(attempts: u32, last: ActivationError) -> Self {
        match last {
            // Already exhausted deeper down, keep the innermost count.
            ActivationError::MaxRetriesExceeded { .. } => last,
            last => ActivationError::MaxRetriesExceeded {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

impl From<reqwest::Error> for ActivationError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ActivationError::Network(format!("request timeout: {}", e))
        } else if e.is_connect() {
            ActivationError::Network(format!("connection error: {}", e))
        } else if e.is_decode() {
            ActivationError::Serialization(e.to_string())
        } else {
            ActivationError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ActivationError {
    fn from(e: serde_json::Error) -> Self {
        ActivationError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ActivationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverability() {
        assert!(ActivationError::ServerError(503).is_recoverable());
        assert!(ActivationError::ProxyAuthenticationFailed.is_recoverable());
        assert!(ActivationError::CatalogNotFound.is_recoverable());
        assert!(!ActivationError::AlreadyRedeemed.is_recoverable());
        assert!(!ActivationError::AlreadyOwned(vec![]).is_recoverable());
        assert!(!ActivationError::InvalidKey.is_recoverable());
        assert!(!ActivationError::Cancelled.is_recoverable());
    }

    #[test]
    fn test_exhausted_does_not_nest() {
        let inner = ActivationError::exhausted(3, ActivationError::ServerError(500));
        let outer = ActivationError::exhausted(2, inner.clone());
        assert_eq!(inner, outer);
        assert_eq!(outer.root(), &ActivationError::ServerError(500));
    }

    #[test]
    fn test_already_owned_message_lists_products() {
        let e = ActivationError::AlreadyOwned(vec!["Game Pass".into(), "DLC".into()]);
        assert_eq!(e.to_string(), "Account already owns: Game Pass, DLC");
    }
}
