//! Key activation orchestrator.
//!
//! One run per instance. A run resolves the session's product, applies the
//! pre-flight checks, captures an identity token, activates the key (or each key of
//! a bundle) and reports exactly one [`ActivationOutcome`]. Every state change is
//! published on a watch channel (current state) and a broadcast channel (sequence).

use async_trait::async_trait;
use chrono::Utc;
use ka_common::{
    mask_key, ActivationMethod, ActivationOutcome, ActivationState, KeyState, KeyStatus, Product,
    ProductRecord,
};
use ka_config::{AppConfig, BundleConfig};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::backend::BackendClient;
use crate::browser::{BrowserAutomation, MessageBus};
use crate::bundle::{inter_key_delay, BundleTracker};
use crate::conversion::{ConversionController, ConversionSettings};
use crate::credentials::CredentialCache;
use crate::error::{ActivationError, Result};
use crate::region::RegionRegistry;
use crate::token_cache::{IdentityToken, TokenCache};
use crate::token_capture::{TokenCaptureConfig, TokenCaptureService};
use crate::ttl_cache::TtlCache;
use crate::vendor::{Validation, VendorClient, VendorClientConfig, VendorStats};

const STATE_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_DEVICE_ID: &str = "default";

/// Account facts needed before redeeming a subscription key.
///
/// The subscription conflict and region mismatch checks only fire when the host
/// supplies a probe through [`Orchestrator::with_account_probe`]. The default
/// [`UnknownAccount`] answers `None` to both questions.
#[async_trait]
pub trait AccountProbe: Send + Sync {
    /// `Some(true)` when the account already has a running subscription.
    async fn has_active_subscription(&self, _product: &Product) -> Option<bool> {
        None
    }

    /// The account's purchasing region, if known.
    async fn account_region(&self) -> Option<String> {
        None
    }
}

/// Probe that knows nothing, so subscription checks pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownAccount;

impl AccountProbe for UnknownAccount {}

/// Persistence hook for products from successful runs.
#[async_trait]
pub trait PurchaseRecorder: Send + Sync {
    async fn record(&self, record: ProductRecord) -> Result<()>;
}

#[derive(Default)]
struct RunContext {
    product: Option<Product>,
}

pub struct Orchestrator {
    backend: Arc<dyn BackendClient>,
    bus: Arc<MessageBus>,
    token_cache: Arc<TokenCache>,
    credentials: Arc<CredentialCache>,
    tokens: TokenCaptureService,
    vendor: Arc<VendorClient>,
    conversion: ConversionController,
    probe: Arc<dyn AccountProbe>,
    recorder: Option<Arc<dyn PurchaseRecorder>>,
    bundle: BundleConfig,
    state: watch::Sender<ActivationState>,
    events: broadcast::Sender<ActivationState>,
    active: Mutex<Option<CancellationToken>>,
    run_lock: tokio::sync::Mutex<()>,
    /// Keys already activated, per session token, for resuming partial bundles
    completed_keys: TtlCache<String, HashSet<String>>,
}

impl Orchestrator {
    pub fn new(
        config: &AppConfig,
        backend: Arc<dyn BackendClient>,
        browser: Arc<dyn BrowserAutomation>,
    ) -> Result<Self> {
        let regions = Arc::new(
            RegionRegistry::with_overrides(&config.proxy, &config.regions)
                .with_direct_market(config.vendor.fallback_market.to_ascii_uppercase()),
        );
        let bus = Arc::new(MessageBus::new());
        let token_cache = Arc::new(TokenCache::new());
        let credentials = Arc::new(CredentialCache::new(backend.clone(), &config.proxy));
        let vendor = Arc::new(VendorClient::new(
            VendorClientConfig::from_config(&config.vendor, &config.retry),
            regions,
            credentials.clone(),
        )?);

        let device_id = match config.device_id.trim() {
            "" => DEFAULT_DEVICE_ID.to_string(),
            id => id.to_string(),
        };
        let tokens = TokenCaptureService::new(
            browser.clone(),
            bus.clone(),
            token_cache.clone(),
            TokenCaptureConfig::from_config(&config.token, &config.retry),
            device_id,
        );
        let conversion = ConversionController::new(
            browser,
            bus.clone(),
            ConversionSettings::from(&config.conversion),
        );

        let (state, _) = watch::channel(ActivationState::Idle);
        let (events, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);

        Ok(Self {
            backend,
            bus,
            token_cache,
            credentials,
            tokens,
            vendor,
            conversion,
            probe: Arc::new(UnknownAccount),
            recorder: None,
            bundle: config.bundle.clone(),
            state,
            events,
            active: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            completed_keys: TtlCache::new(),
        })
    }

    pub fn with_account_probe(mut self, probe: Arc<dyn AccountProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn PurchaseRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Where the host delivers messages posted by injected scripts.
    pub fn message_bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn token_cache(&self) -> Arc<TokenCache> {
        self.token_cache.clone()
    }

    pub fn state(&self) -> watch::Receiver<ActivationState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> ActivationState {
        self.state.borrow().clone()
    }

    /// Every transition from now on, in order.
    pub fn subscribe(&self) -> broadcast::Receiver<ActivationState> {
        self.events.subscribe()
    }

    pub fn vendor_stats(&self) -> VendorStats {
        self.vendor.stats()
    }

    pub fn credential_fetches(&self) -> u64 {
        self.credentials.fetches()
    }

    /// Cancel the active run, if any. Its pending browser waits resolve with
    /// `Cancelled` and it still reports to the backend.
    pub fn cancel(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            active.cancel();
        }
        self.bus.cancel_all();
    }

    /// Run one activation for `session_token`, superseding any run in progress.
    pub async fn start(&self, session_token: &str) -> ActivationOutcome {
        let cancel = CancellationToken::new();
        if let Some(previous) = self.active.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        self.bus.cancel_all();

        // The superseded run finalizes before this one begins.
        let _run = self.run_lock.lock().await;

        let run_id = Uuid::new_v4();
        let span = info_span!("activation", %run_id, session = %mask_key(session_token));
        self.execute(session_token, cancel).instrument(span).await
    }

    async fn execute(&self, session_token: &str, cancel: CancellationToken) -> ActivationOutcome {
        info!("Activation run started");
        let purged = self.completed_keys.purge_expired();
        if purged > 0 {
            debug!(purged, "Dropped stale bundle resume entries");
        }
        self.publish(ActivationState::Initializing);

        let mut run = RunContext::default();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!("Activation run cancelled");
                self.tokens.abandon();
                ActivationOutcome::error(ActivationError::Cancelled.to_string())
            }
            outcome = self.run(session_token, &mut run) => outcome,
        };
        if !keeps_resume_state(&outcome)
            && self.completed_keys.invalidate(&session_token.to_string())
        {
            debug!(outcome = outcome.label(), "Session settled, dropping bundle resume entry");
        }

        self.finalize(session_token, &run, &outcome).await;
        self.publish(ActivationState::Finished {
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn run(&self, session_token: &str, run: &mut RunContext) -> ActivationOutcome {
        self.publish(ActivationState::FetchingProduct);
        let product = match self.backend.lookup_session(session_token).await {
            Ok(product) => product,
            Err(e) => {
                error!(error = %e, "Session lookup failed");
                return ActivationOutcome::error(e.to_string());
            }
        };
        run.product = Some(product.clone());

        if product.activation_method == ActivationMethod::DigitalAccount {
            info!("Product is delivered to a digital account");
            return ActivationOutcome::RequiresDigitalAccount;
        }
        if product.is_expired(Utc::now()) {
            info!(expires_at = ?product.expires_at, "Session expired");
            return ActivationOutcome::ExpiredSession;
        }

        self.publish(ActivationState::ValidatingKey);
        if product.keys.is_empty() {
            return ActivationOutcome::error("product has no license keys");
        }
        if product.status_indicates_redeemed() {
            info!(status = %product.status, "Storefront status shows the key as consumed");
            return ActivationOutcome::AlreadyRedeemed;
        }

        if product.is_subscription {
            self.publish(ActivationState::CheckingSubscription);
            if let Some(outcome) = self.check_account(&product).await {
                return outcome;
            }
        }

        self.publish(ActivationState::CapturingToken);
        let token = match self.tokens.capture().await {
            Ok(token) => token,
            Err(e) => {
                error!(error = %e, "Identity token unavailable");
                return ActivationOutcome::error(e.to_string());
            }
        };

        if product.is_bundle() {
            self.activate_bundle(session_token, &product, &token).await
        } else {
            self.activate_single(&product, &token).await
        }
    }

    async fn check_account(&self, product: &Product) -> Option<ActivationOutcome> {
        if self.probe.has_active_subscription(product).await == Some(true) {
            info!("Account already has an active subscription");
            return Some(ActivationOutcome::ActiveSubscriptionConflict);
        }
        if RegionRegistry::is_global(&product.region) {
            return None;
        }
        let account_region = self.probe.account_region().await?;
        if account_region.trim().eq_ignore_ascii_case(product.region.trim()) {
            return None;
        }
        info!(%account_region, key_region = %product.region, "Account region differs from key region");
        Some(ActivationOutcome::RegionMismatch {
            account_region,
            key_region: product.region.clone(),
        })
    }

    async fn activate_single(&self, product: &Product, token: &IdentityToken) -> ActivationOutcome {
        self.publish(ActivationState::Activating);
        let Some(key) = product.keys.first() else {
            return ActivationOutcome::error("product has no license keys");
        };

        let mut state = KeyState::new(key.clone());
        let result = self.activate_key(&mut state, product, token).await;
        match self.settle(&mut state, result) {
            KeyStatus::Succeeded => ActivationOutcome::Success,
            KeyStatus::AlreadyRedeemed => ActivationOutcome::AlreadyRedeemed,
            KeyStatus::AlreadyOwned { products } => ActivationOutcome::AlreadyOwned { products },
            KeyStatus::Failed { reason } => ActivationOutcome::error(reason),
            other => ActivationOutcome::error(format!("key ended in unexpected state {:?}", other)),
        }
    }

    async fn activate_bundle(
        &self,
        session_token: &str,
        product: &Product,
        token: &IdentityToken,
    ) -> ActivationOutcome {
        let restored = self
            .completed_keys
            .get(&session_token.to_string())
            .unwrap_or_default();
        let mut tracker = BundleTracker::new(&product.keys, &restored);
        let total = tracker.len();
        info!(total, restored = restored.len(), "Activating bundle");

        for index in 0..total {
            if tracker.is_restored(index) {
                debug!(index, "Key activated in an earlier run, skipping");
                continue;
            }
            self.publish(ActivationState::ActivatingBundle { index, total });

            let Some(state) = tracker.state_mut(index) else {
                break;
            };
            let result = self.activate_key(state, product, token).await;
            let token_rejected = matches!(
                &result,
                Err(e) if matches!(e.root(), ActivationError::AuthenticationFailed)
            );
            if self.settle(state, result) == KeyStatus::Succeeded {
                self.remember_completed(session_token, &state.key);
            }

            if token_rejected {
                warn!(index, "Identity token rejected, abandoning remaining keys");
                break;
            }
            if tracker.has_pending_after(index) {
                let delay = inter_key_delay(&self.bundle, tracker.any_failure());
                debug!(delay_ms = delay.as_millis() as u64, "Pausing before next key");
                tokio::time::sleep(delay).await;
            }
        }

        let result = tracker.result();
        info!(
            succeeded = result.succeeded_count(),
            failed = result.failed_count(),
            total = result.total(),
            "Bundle finished"
        );
        ActivationOutcome::from(result)
    }

    fn remember_completed(&self, session_token: &str, key: &str) {
        let session = session_token.to_string();
        let mut keys = self.completed_keys.get(&session).unwrap_or_default();
        keys.insert(key.to_string());
        let ttl = Duration::from_secs(self.bundle.resume_ttl_secs);
        self.completed_keys.set(session, keys, ttl);
    }

    /// Sessions with bundle keys remembered for a later resume.
    pub fn resumable_sessions(&self) -> usize {
        self.completed_keys.len()
    }

    /// Validate then redeem one key, running the consent flow inline when asked.
    async fn activate_key(
        &self,
        state: &mut KeyState,
        product: &Product,
        token: &IdentityToken,
    ) -> Result<()> {
        state.transition(KeyStatus::Validating);
        match self.vendor.validate(state, token, &product.region).await? {
            Validation::Valid => {}
            Validation::AlreadyRedeemed => return Err(ActivationError::AlreadyRedeemed),
            Validation::Invalid { state: vendor_state } => {
                warn!(key = %mask_key(&state.key), %vendor_state, "Key is not redeemable");
                return Err(ActivationError::InvalidKey);
            }
        }

        state.transition(KeyStatus::Redeeming);
        match self.vendor.redeem(state, token, &product.region, product).await {
            Err(e) if matches!(e.root(), ActivationError::ConversionRequired) => {
                state.transition(KeyStatus::ConversionRequired);
                self.publish(ActivationState::HandlingConversion);
                self.conversion.run(&state.key).await
            }
            other => other,
        }
    }

    /// Record the key's final status.
    fn settle(&self, state: &mut KeyState, result: Result<()>) -> KeyStatus {
        let status = match result {
            Ok(()) => KeyStatus::Succeeded,
            Err(e) => {
                if matches!(e.root(), ActivationError::AuthenticationFailed) {
                    self.tokens.invalidate();
                }
                warn!(key = %mask_key(&state.key), error = %e, "Key activation failed");
                state.last_error = Some(e.to_string());
                KeyStatus::from(&e)
            }
        };
        state.transition(status.clone());
        status
    }

    async fn finalize(&self, session_token: &str, run: &RunContext, outcome: &ActivationOutcome) {
        let success = outcome.is_success();
        if let Err(e) = self.backend.mark_activated(session_token, success).await {
            warn!(error = %e, "Failed to report activation result");
        }

        if let (true, Some(recorder), Some(product)) = (success, &self.recorder, &run.product) {
            if let Err(e) = recorder.record(product.stamped(Utc::now(), outcome)).await {
                warn!(error = %e, "Failed to record purchased product");
            }
        }

        self.vendor.release_sessions();
        self.bus.cancel_all();
        info!(outcome = outcome.label(), success, "Activation run finished");
    }

    fn publish(&self, state: ActivationState) {
        debug!(state = %state, "State transition");
        self.state.send_replace(state.clone());
        // No subscribers is fine.
        let _ = self.events.send(state);
    }
}

/// Partial bundles and interrupted runs may be resumed; any other outcome settles
/// the session.
fn keeps_resume_state(outcome: &ActivationOutcome) -> bool {
    matches!(
        outcome,
        ActivationOutcome::PartialSuccess { .. } | ActivationOutcome::Error { .. }
    )
}
