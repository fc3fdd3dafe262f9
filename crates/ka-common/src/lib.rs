use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

pub mod logging;

// ============================================================================
// Product
// ============================================================================

/// Status substrings that mean a key has already been consumed upstream.
pub const REDEEMED_STATUS_VOCABULARY: &[&str] = &[
    "redeemed",
    "alreadyredeemed",
    "used",
    "invalid",
    "consumed",
    "duplicate",
];

/// How the vendor expects the purchase to be activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActivationMethod {
    #[default]
    Standard,
    /// Delivered to a digital account by the storefront; never redeemed by us.
    DigitalAccount,
}

impl From<String> for ActivationMethod {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "digital_account" | "digitalaccount" => ActivationMethod::DigitalAccount,
            _ => ActivationMethod::Standard,
        }
    }
}

impl From<ActivationMethod> for String {
    fn from(value: ActivationMethod) -> Self {
        match value {
            ActivationMethod::Standard => "standard".to_string(),
            ActivationMethod::DigitalAccount => "digital_account".to_string(),
        }
    }
}

/// Product descriptor resolved from a session token by the backend.
///
/// Never mutated during a run. Persistence gets a [`ProductRecord`] via
/// [`Product::stamped`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    #[serde(alias = "key", deserialize_with = "one_or_many")]
    pub keys: Vec<String>,
    pub region: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default, alias = "product_name")]
    pub name: String,
    #[serde(default, alias = "product_image")]
    pub image_url: Option<String>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub activation_method: ActivationMethod,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub order_item_id: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_subscription: bool,
}

impl Product {
    pub fn is_bundle(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }

    /// Case-insensitive substring match against [`REDEEMED_STATUS_VOCABULARY`].
    pub fn status_indicates_redeemed(&self) -> bool {
        let status = self.status.to_ascii_lowercase();
        REDEEMED_STATUS_VOCABULARY
            .iter()
            .any(|term| status.contains(term))
    }

    pub fn stamped(&self, activated_at: DateTime<Utc>, outcome: &ActivationOutcome) -> ProductRecord {
        ProductRecord {
            product: self.clone(),
            outcome: outcome.label().to_string(),
            activated_at,
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    let keys = match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(key) => vec![key],
        OneOrMany::Many(keys) => keys,
    };
    Ok(keys
        .into_iter()
        .map(|k| k.trim().to_string())
        .filter(|k| !k.is_empty())
        .collect())
}

/// Timestamped copy of a product handed to the persistence collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductRecord {
    pub product: Product,
    pub outcome: String,
    pub activated_at: DateTime<Utc>,
}

/// Shortens a license key for log output: `ABCDE-…-VWXYZ`.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 10 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..5].iter().collect();
    let tail: String = chars[chars.len() - 5..].iter().collect();
    format!("{}-…-{}", head, tail)
}

// ============================================================================
// Per-key and bundle state
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum KeyStatus {
    Pending,
    Validating,
    Redeeming,
    ConversionRequired,
    Succeeded,
    Failed { reason: String },
    AlreadyOwned { products: Vec<String> },
    AlreadyRedeemed,
}

impl KeyStatus {
    /// Final states that never go back to pending/validating/redeeming.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            KeyStatus::Succeeded | KeyStatus::AlreadyOwned { .. } | KeyStatus::AlreadyRedeemed
        )
    }

    pub fn is_terminal(&self) -> bool {
        self.is_settled() || matches!(self, KeyStatus::Failed { .. })
    }

    pub fn is_in_progress(&self) -> bool {
        matches!(
            self,
            KeyStatus::Pending | KeyStatus::Validating | KeyStatus::Redeeming
        )
    }

    /// Human-readable reason used when a key counts as failed.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            KeyStatus::Failed { reason } => Some(reason.clone()),
            KeyStatus::AlreadyOwned { products } if products.is_empty() => {
                Some("already owned".to_string())
            }
            KeyStatus::AlreadyOwned { products } => {
                Some(format!("already owned: {}", products.join(", ")))
            }
            KeyStatus::AlreadyRedeemed => Some("already redeemed".to_string()),
            _ => None,
        }
    }
}

/// Tracking record for one key within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyState {
    pub key: String,
    pub status: KeyStatus,
    pub validation_attempts: u32,
    pub redemption_attempts: u32,
    pub last_error: Option<String>,
    pub markets_attempted: Vec<String>,
}

impl KeyState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: KeyStatus::Pending,
            validation_attempts: 0,
            redemption_attempts: 0,
            last_error: None,
            markets_attempted: Vec::new(),
        }
    }

    /// Moves to `next` unless the key is settled and `next` is an in-progress state.
    ///
    /// Returns whether the transition was applied.
    pub fn transition(&mut self, next: KeyStatus) -> bool {
        if self.status.is_settled() && next.is_in_progress() {
            tracing::warn!(
                key = %mask_key(&self.key),
                from = ?self.status,
                to = ?next,
                "Rejected key status regression"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn record_market(&mut self, market: &str) {
        if !self.markets_attempted.iter().any(|m| m == market) {
            self.markets_attempted.push(market.to_string());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyFailure {
    pub key: String,
    pub reason: String,
}

/// Aggregate over all keys of a bundle. Every key is either succeeded or failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BundleResult {
    pub succeeded: Vec<String>,
    pub failed: Vec<KeyFailure>,
}

impl BundleResult {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn succeeded_count(&self) -> usize {
        self.succeeded.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.total() > 0 && self.failed.is_empty()
    }

    pub fn is_complete_failure(&self) -> bool {
        self.succeeded.is_empty()
    }

    pub fn has_partial_success(&self) -> bool {
        !self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

// ============================================================================
// Orchestrator states and outcomes
// ============================================================================

/// Terminal result of one activation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum ActivationOutcome {
    Success,
    PartialSuccess {
        succeeded: usize,
        total: usize,
        failures: Vec<KeyFailure>,
    },
    AlreadyRedeemed,
    AlreadyOwned { products: Vec<String> },
    RegionMismatch {
        account_region: String,
        key_region: String,
    },
    ActiveSubscriptionConflict,
    ExpiredSession,
    RequiresDigitalAccount,
    Error { reason: String },
}

impl ActivationOutcome {
    pub fn error(reason: impl Into<String>) -> Self {
        ActivationOutcome::Error {
            reason: reason.into(),
        }
    }

    /// Whether the backend should mark the session activated.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ActivationOutcome::Success | ActivationOutcome::PartialSuccess { .. }
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ActivationOutcome::Success => "success",
            ActivationOutcome::PartialSuccess { .. } => "partial_success",
            ActivationOutcome::AlreadyRedeemed => "already_redeemed",
            ActivationOutcome::AlreadyOwned { .. } => "already_owned",
            ActivationOutcome::RegionMismatch { .. } => "region_mismatch",
            ActivationOutcome::ActiveSubscriptionConflict => "active_subscription_conflict",
            ActivationOutcome::ExpiredSession => "expired_session",
            ActivationOutcome::RequiresDigitalAccount => "requires_digital_account",
            ActivationOutcome::Error { .. } => "error",
        }
    }
}

impl From<BundleResult> for ActivationOutcome {
    fn from(result: BundleResult) -> Self {
        if result.is_complete_success() {
            ActivationOutcome::Success
        } else if result.is_complete_failure() {
            let reason = result
                .failed
                .iter()
                .map(|f| f.reason.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            ActivationOutcome::error(format!("all keys failed: {}", reason))
        } else {
            ActivationOutcome::PartialSuccess {
                succeeded: result.succeeded_count(),
                total: result.total(),
                failures: result.failed,
            }
        }
    }
}

/// Observable orchestrator state, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ActivationState {
    Idle,
    Initializing,
    FetchingProduct,
    ValidatingKey,
    CheckingSubscription,
    CapturingToken,
    Activating,
    ActivatingBundle { index: usize, total: usize },
    HandlingConversion,
    Finished { outcome: ActivationOutcome },
}

impl ActivationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActivationState::Finished { .. })
    }
}

impl fmt::Display for ActivationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivationState::Idle => write!(f, "idle"),
            ActivationState::Initializing => write!(f, "initializing"),
            ActivationState::FetchingProduct => write!(f, "fetchingProduct"),
            ActivationState::ValidatingKey => write!(f, "validatingKey"),
            ActivationState::CheckingSubscription => write!(f, "checkingSubscription"),
            ActivationState::CapturingToken => write!(f, "capturingToken"),
            ActivationState::Activating => write!(f, "activating"),
            ActivationState::ActivatingBundle { index, total } => {
                write!(f, "activatingBundle({}/{})", index + 1, total)
            }
            ActivationState::HandlingConversion => write!(f, "handlingConversion"),
            ActivationState::Finished { outcome } => write!(f, "finished({})", outcome.label()),
        }
    }
}
