//! Orchestrator Tests
//!
//! End-to-end runs against a mock backend, a scripted browser and a wiremock
//! vendor API:
//! - Single-key and bundle outcomes
//! - Bundle resume across runs
//! - Pre-flight short-circuits (digital account, expiry, consumed status, account checks)
//! - Conversion consent handled inline
//! - Token rejection and capture timeout
//! - Cancellation by a superseding run

mod common;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use ka_activation::{
    AccountProbe, ActivationError, BrowserMessage, Orchestrator, PurchaseRecorder, Result,
    Surface, WaitKind,
};
use ka_common::{ActivationMethod, ActivationOutcome, ActivationState, KeyFailure, Product, ProductRecord};
use ka_config::AppConfig;

use common::{fast_config, product, token_description, MockBackend, MockBrowser};

const KEY: &str = "AAAAA-BBBBB-CCCCC-DDDDD-EEEEE";
const DEVICE: &str = "device-test";
const ORDERS: &str = "/users/me/orders";

fn orchestrator(
    config: &AppConfig,
    backend: Arc<MockBackend>,
    browser: Arc<MockBrowser>,
) -> Orchestrator {
    let orchestrator = Orchestrator::new(config, backend, browser.clone()).unwrap();
    browser.attach(orchestrator.message_bus());
    orchestrator
}

async fn mount_active(server: &MockServer, key: &str, expected: u64) {
    Mock::given(method("GET"))
        .and(path(format!("/tokenDescriptions/{}", key)))
        .and(query_param("market", "US"))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_description("Active")))
        .expect(expected)
        .mount(server)
        .await;
}

fn order_for(key: &str) -> serde_json::Value {
    serde_json::json!({ "billingInformation": { "paymentInstrumentId": key } })
}

fn drain(events: &mut broadcast::Receiver<ActivationState>) -> Vec<ActivationState> {
    let mut states = Vec::new();
    while let Ok(state) = events.try_recv() {
        states.push(state);
    }
    states
}

#[derive(Default)]
struct MemoryRecorder {
    records: Mutex<Vec<ProductRecord>>,
}

#[async_trait]
impl PurchaseRecorder for MemoryRecorder {
    async fn record(&self, record: ProductRecord) -> Result<()> {
        self.records.lock().push(record);
        Ok(())
    }
}

struct FixedAccount {
    active_subscription: bool,
    region: &'static str,
}

#[async_trait]
impl AccountProbe for FixedAccount {
    async fn has_active_subscription(&self, _product: &Product) -> Option<bool> {
        Some(self.active_subscription)
    }

    async fn account_region(&self) -> Option<String> {
        Some(self.region.to_string())
    }
}

fn subscription(region: &str) -> Product {
    Product {
        is_subscription: true,
        ..product(&[KEY], region)
    }
}

#[tokio::test]
async fn test_single_key_success() {
    let server = MockServer::start().await;
    mount_active(&server, KEY, 1).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(body_partial_json(order_for(KEY)))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("sess-1", product(&[KEY], "GLOBAL")));
    let browser = Arc::new(MockBrowser::token());
    let recorder = Arc::new(MemoryRecorder::default());
    let orchestrator = orchestrator(&fast_config(&server.uri()), backend.clone(), browser.clone())
        .with_recorder(recorder.clone());
    let mut events = orchestrator.subscribe();

    let outcome = orchestrator.start("sess-1").await;

    assert_eq!(outcome, ActivationOutcome::Success);
    assert_eq!(
        drain(&mut events),
        vec![
            ActivationState::Initializing,
            ActivationState::FetchingProduct,
            ActivationState::ValidatingKey,
            ActivationState::CapturingToken,
            ActivationState::Activating,
            ActivationState::Finished {
                outcome: ActivationOutcome::Success
            },
        ]
    );
    assert!(orchestrator.current_state().is_terminal());
    assert_eq!(backend.reports(), vec![("sess-1".to_string(), true)]);
    assert_eq!(browser.identity_injections(), 1);

    let records = recorder.records.lock().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, "success");
    assert_eq!(records[0].product.keys, vec![KEY.to_string()]);

    // Direct route, nothing to release.
    assert_eq!(orchestrator.vendor_stats().open_sessions, 0);
    assert_eq!(orchestrator.credential_fetches(), 0);
}

#[tokio::test]
async fn test_redeem_conflict_is_already_redeemed() {
    let server = MockServer::start().await;
    mount_active(&server, KEY, 1).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(409))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("sess-1", product(&[KEY], "GLOBAL")));
    let orchestrator = orchestrator(
        &fast_config(&server.uri()),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );

    let outcome = orchestrator.start("sess-1").await;

    assert_eq!(outcome, ActivationOutcome::AlreadyRedeemed);
    assert_eq!(backend.reports(), vec![("sess-1".to_string(), false)]);
}

#[tokio::test]
async fn test_bundle_partial_success() {
    let server = MockServer::start().await;
    let keys = ["KEY01-AAAAA", "KEY02-BBBBB", "KEY03-CCCCC"];
    for key in keys {
        mount_active(&server, key, 1).await;
    }
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(body_partial_json(order_for(keys[1])))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "code": "UserAlreadyOwnsContent",
            "data": ["Test Game"]
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(201))
        .expect(2)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("bundle", product(&keys, "GLOBAL")));
    let orchestrator = orchestrator(
        &fast_config(&server.uri()),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );
    let mut events = orchestrator.subscribe();

    let outcome = orchestrator.start("bundle").await;

    assert_eq!(
        outcome,
        ActivationOutcome::PartialSuccess {
            succeeded: 2,
            total: 3,
            failures: vec![KeyFailure {
                key: keys[1].to_string(),
                reason: "already owned: Test Game".to_string(),
            }],
        }
    );
    let progress: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|state| match state {
            ActivationState::ActivatingBundle { index, total } => Some((index, total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3)]);
    // Partial success still counts as activated.
    assert_eq!(backend.reports(), vec![("bundle".to_string(), true)]);
}

#[tokio::test]
async fn test_bundle_resumes_after_partial_failure() {
    let server = MockServer::start().await;
    let keys = ["KEY01-AAAAA", "KEY02-BBBBB", "KEY03-CCCCC"];
    mount_active(&server, keys[0], 1).await;
    mount_active(&server, keys[1], 1).await;
    mount_active(&server, keys[2], 2).await;

    // Third key fails both redemption attempts of the first run.
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(body_partial_json(order_for(keys[2])))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("bundle", product(&keys, "GLOBAL")));
    let orchestrator = orchestrator(
        &fast_config(&server.uri()),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );

    let first = orchestrator.start("bundle").await;
    match first {
        ActivationOutcome::PartialSuccess {
            succeeded,
            total,
            failures,
        } => {
            assert_eq!((succeeded, total), (2, 3));
            assert_eq!(failures[0].key, keys[2]);
            assert!(failures[0].reason.contains("HTTP 500"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }

    let mut events = orchestrator.subscribe();
    let second = orchestrator.start("bundle").await;

    assert_eq!(second, ActivationOutcome::Success);
    // Only the remaining key is attempted.
    assert!(drain(&mut events).contains(&ActivationState::ActivatingBundle { index: 2, total: 3 }));
    assert_eq!(
        backend.reports(),
        vec![("bundle".to_string(), true), ("bundle".to_string(), true)]
    );
}

async fn mount_partial_bundle(server: &MockServer, keys: &[&str]) {
    for key in keys {
        mount_active(server, key, 1).await;
    }
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .and(body_partial_json(order_for(keys[1])))
        .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
            "code": "UserAlreadyOwnsContent",
            "data": ["Test Game"]
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(201))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_settled_session_drops_resume_entry() {
    let server = MockServer::start().await;
    let keys = ["KEY01-AAAAA", "KEY02-BBBBB", "KEY03-CCCCC"];
    mount_partial_bundle(&server, &keys).await;

    let backend = Arc::new(MockBackend::new().with_product("bundle", product(&keys, "GLOBAL")));
    let orchestrator = orchestrator(
        &fast_config(&server.uri()),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );

    let first = orchestrator.start("bundle").await;
    assert!(matches!(first, ActivationOutcome::PartialSuccess { succeeded: 2, .. }));
    assert_eq!(orchestrator.resumable_sessions(), 1);

    backend.set_product(
        "bundle",
        Product {
            status: "Redeemed".to_string(),
            ..product(&keys, "GLOBAL")
        },
    );
    let second = orchestrator.start("bundle").await;

    assert_eq!(second, ActivationOutcome::AlreadyRedeemed);
    assert_eq!(orchestrator.resumable_sessions(), 0);
}

#[tokio::test]
async fn test_stale_resume_entries_are_purged() {
    let server = MockServer::start().await;
    let keys = ["KEY01-AAAAA", "KEY02-BBBBB", "KEY03-CCCCC"];
    mount_partial_bundle(&server, &keys).await;

    let mut config = fast_config(&server.uri());
    config.bundle.resume_ttl_secs = 0;
    let backend = Arc::new(MockBackend::new().with_product("bundle", product(&keys, "GLOBAL")));
    let orchestrator = orchestrator(&config, backend, Arc::new(MockBrowser::token()));

    let outcome = orchestrator.start("bundle").await;
    assert!(matches!(outcome, ActivationOutcome::PartialSuccess { .. }));
    assert_eq!(orchestrator.resumable_sessions(), 1);

    // Any later run sweeps entries past their TTL, whatever its session.
    let other = orchestrator.start("unknown").await;
    assert!(matches!(other, ActivationOutcome::Error { .. }));
    assert_eq!(orchestrator.resumable_sessions(), 0);
}

#[tokio::test]
async fn test_consumed_status_short_circuits() {
    let backend = Arc::new(MockBackend::new().with_product(
        "sess-1",
        Product {
            status: "Redeemed".to_string(),
            ..product(&[KEY], "GLOBAL")
        },
    ));
    let browser = Arc::new(MockBrowser::token());
    let orchestrator = orchestrator(&fast_config("http://127.0.0.1:9"), backend.clone(), browser.clone());

    let outcome = orchestrator.start("sess-1").await;

    assert_eq!(outcome, ActivationOutcome::AlreadyRedeemed);
    assert_eq!(browser.identity_injections(), 0);
    assert_eq!(backend.reports(), vec![("sess-1".to_string(), false)]);
}

#[tokio::test]
async fn test_digital_account_and_expired_sessions() {
    let backend = Arc::new(
        MockBackend::new()
            .with_product(
                "digital",
                Product {
                    activation_method: ActivationMethod::DigitalAccount,
                    ..product(&[KEY], "GLOBAL")
                },
            )
            .with_product(
                "expired",
                Product {
                    expires_at: Some(chrono::Utc::now() - chrono::Duration::minutes(1)),
                    ..product(&[KEY], "GLOBAL")
                },
            ),
    );
    let browser = Arc::new(MockBrowser::token());
    let orchestrator = orchestrator(&fast_config("http://127.0.0.1:9"), backend.clone(), browser.clone());

    assert_eq!(
        orchestrator.start("digital").await,
        ActivationOutcome::RequiresDigitalAccount
    );
    assert_eq!(orchestrator.start("expired").await, ActivationOutcome::ExpiredSession);
    assert_eq!(browser.identity_injections(), 0);
    assert_eq!(backend.lookups(), 2);
    assert_eq!(
        backend.reports(),
        vec![("digital".to_string(), false), ("expired".to_string(), false)]
    );
}

#[tokio::test]
async fn test_unknown_session_is_error() {
    let backend = Arc::new(MockBackend::new());
    let orchestrator = orchestrator(
        &fast_config("http://127.0.0.1:9"),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );

    let outcome = orchestrator.start("missing").await;

    assert!(matches!(outcome, ActivationOutcome::Error { reason } if reason.contains("session not found")));
    assert_eq!(backend.reports(), vec![("missing".to_string(), false)]);
}

#[tokio::test]
async fn test_subscription_account_checks() {
    let backend = Arc::new(
        MockBackend::new()
            .with_product("active", subscription("TR"))
            .with_product("foreign", subscription("TR")),
    );
    let browser = Arc::new(MockBrowser::token());
    let config = fast_config("http://127.0.0.1:9");

    let conflicted = orchestrator(&config, backend.clone(), browser.clone()).with_account_probe(
        Arc::new(FixedAccount {
            active_subscription: true,
            region: "TR",
        }),
    );
    assert_eq!(
        conflicted.start("active").await,
        ActivationOutcome::ActiveSubscriptionConflict
    );

    let mismatched = orchestrator(&config, backend.clone(), browser.clone()).with_account_probe(
        Arc::new(FixedAccount {
            active_subscription: false,
            region: "US",
        }),
    );
    assert_eq!(
        mismatched.start("foreign").await,
        ActivationOutcome::RegionMismatch {
            account_region: "US".to_string(),
            key_region: "TR".to_string(),
        }
    );
    assert_eq!(browser.identity_injections(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_token_capture_timeout_is_error() {
    let backend = Arc::new(MockBackend::new().with_product("sess-1", product(&[KEY], "GLOBAL")));
    let browser = Arc::new(MockBrowser::silent());
    let orchestrator = orchestrator(&fast_config("http://127.0.0.1:9"), backend.clone(), browser.clone());

    let outcome = orchestrator.start("sess-1").await;

    match outcome {
        ActivationOutcome::Error { reason } => {
            assert!(reason.contains(&ActivationError::TokenTimeout.to_string()));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(browser.identity_injections(), 3);
    assert_eq!(backend.reports(), vec![("sess-1".to_string(), false)]);
}

#[tokio::test]
async fn test_conversion_handled_inline() {
    let server = MockServer::start().await;
    mount_active(&server, KEY, 1).await;
    Mock::given(method("POST"))
        .and(path(ORDERS))
        .respond_with(ResponseTemplate::new(412).set_body_json(serde_json::json!({
            "code": "ConversionConsentRequired"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("sess-1", product(&[KEY], "GLOBAL")));
    let browser =
        Arc::new(MockBrowser::token().with_conversion_reply(BrowserMessage::ConversionSuccess));
    let orchestrator = orchestrator(&fast_config(&server.uri()), backend.clone(), browser.clone());
    let mut events = orchestrator.subscribe();

    let outcome = orchestrator.start("sess-1").await;

    assert_eq!(outcome, ActivationOutcome::Success);
    assert!(drain(&mut events).contains(&ActivationState::HandlingConversion));
    assert!(browser.conversion_injections() > 0);
    assert!(browser
        .loads()
        .iter()
        .any(|(surface, _)| *surface == Surface::Conversion));
    assert_eq!(backend.reports(), vec![("sess-1".to_string(), true)]);
}

#[tokio::test]
async fn test_rejected_token_is_invalidated() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/tokenDescriptions/{}", KEY)))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let backend = Arc::new(MockBackend::new().with_product("sess-1", product(&[KEY], "GLOBAL")));
    let orchestrator = orchestrator(
        &fast_config(&server.uri()),
        backend.clone(),
        Arc::new(MockBrowser::token()),
    );

    let outcome = orchestrator.start("sess-1").await;

    assert_eq!(
        outcome,
        ActivationOutcome::error(ActivationError::AuthenticationFailed.to_string())
    );
    assert!(orchestrator.token_cache().get(DEVICE).is_none());
}

#[tokio::test]
async fn test_new_run_cancels_active_run() {
    let backend = Arc::new(
        MockBackend::new()
            .with_product("first", product(&[KEY], "GLOBAL"))
            .with_product(
                "second",
                Product {
                    activation_method: ActivationMethod::DigitalAccount,
                    ..product(&[KEY], "GLOBAL")
                },
            ),
    );
    let browser = Arc::new(MockBrowser::silent());
    let orchestrator = Arc::new(orchestrator(
        &fast_config("http://127.0.0.1:9"),
        backend.clone(),
        browser,
    ));
    let bus = orchestrator.message_bus();

    let first = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start("first").await }
    });

    // Wait until the first run is parked on the identity page.
    tokio::time::timeout(Duration::from_secs(5), async {
        while !bus.has_pending(WaitKind::TokenCapture) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let second = orchestrator.start("second").await;
    let first = first.await.unwrap();

    assert_eq!(first, ActivationOutcome::error("Cancelled"));
    assert_eq!(second, ActivationOutcome::RequiresDigitalAccount);
    assert_eq!(
        backend.reports(),
        vec![("first".to_string(), false), ("second".to_string(), false)]
    );
    assert!(!bus.has_pending(WaitKind::TokenCapture));
}
