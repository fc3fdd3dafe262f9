//! Key Activation Orchestrator
//!
//! Activates storefront license keys against the vendor's commerce API for an
//! account signed in inside the host's embedded browser:
//! - Orchestrator: per-run state machine with observable transitions
//! - TokenCaptureService: identity token capture through the browser port, cached per device
//! - VendorClient: validation and redemption with regional egress proxies and market fallback
//! - CredentialCache / TokenCache: single-flight TTL caches
//! - BundleTracker: per-key state and aggregate results for multi-key products
//! - ConversionController: inline consent flow on the conversion surface
//! - MessageBus: routes messages posted by injected scripts to pending waits

pub mod backend;
pub mod backoff;
pub mod browser;
pub mod bundle;
pub mod conversion;
pub mod credentials;
pub mod error;
pub mod orchestrator;
pub mod region;
pub mod token_cache;
pub mod token_capture;
pub mod ttl_cache;
pub mod vendor;

pub use backend::{BackendClient, HttpBackendClient};
pub use backoff::RetryPolicy;
pub use browser::{BrowserAutomation, BrowserMessage, MessageBus, PendingMessage, Surface, WaitKind};
pub use bundle::{inter_key_delay, BundleTracker};
pub use conversion::{ConversionController, ConversionSettings};
pub use credentials::{CredentialCache, ProxyCredentials};
pub use error::{ActivationError, Result};
pub use orchestrator::{AccountProbe, Orchestrator, PurchaseRecorder, UnknownAccount};
pub use region::{RegionConfig, RegionRegistry, Route, GLOBAL_REGION_CODES};
pub use token_cache::{IdentityToken, TokenCache};
pub use token_capture::{TokenCaptureConfig, TokenCaptureService};
pub use ttl_cache::TtlCache;
pub use vendor::{Validation, VendorClient, VendorClientConfig, VendorStats};

pub use ka_common::{
    ActivationOutcome, ActivationState, BundleResult, KeyFailure, KeyState, KeyStatus, Product,
    ProductRecord,
};
