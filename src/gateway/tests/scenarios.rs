//! End-to-end scenarios over the HTTP surface
//!
//! The full stack — receiver, queue, worker pool, identity resolution,
//! entitlements, detectors — runs against the in-memory store; only the
//! database and Redis are swapped out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

use revwatch_backfill::{MemoryLockManager, MemoryProgressStore};
use revwatch_database::{MemoryStore, Store};
use revwatch_gateway::{build_router, AppState};
use revwatch_ingestion::MemoryQueue;
use revwatch_security::build_signature_header;
use revwatch_shared::*;

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    api_key: String,
    org_id: Uuid,
    slug: String,
    /// Keeps the worker pool's shutdown channel alive for the test
    _bootstrap: revwatch_gateway::Bootstrap,
}

async fn request(router: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn authed(mut req: Request<Body>, api_key: &str) -> Request<Body> {
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {}", api_key).parse().unwrap(),
    );
    req
}

async fn test_app(slug: &str) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let config = AppConfig {
        database_url: "postgres://unused".into(),
        redis_url: None,
        credential_encryption_key: Some(
            "6368616e676520746869732070617373776f726420746f206120736563726574".into(),
        ),
        credential_encryption_key_previous: None,
        slack_bot_token: None,
        slack_signing_secret: None,
        dashboard_url: Some("https://dash.example.com".into()),
        anthropic_api_key: None,
        server: Default::default(),
        workers: WorkerConfig {
            ingestion_workers: 2,
            alert_workers: 1,
            backfill_workers: 1,
            db_pool_size: 1,
        },
    };
    let bootstrap = AppState::assemble(
        config,
        store.clone(),
        MemoryQueue::new(),
        Arc::new(MemoryLockManager::new()),
        Arc::new(MemoryProgressStore::new()),
    )
    .unwrap();
    let router = build_router(bootstrap.state.clone());

    let (status, body) = request(
        &router,
        post_json("/v1/setup/org", json!({ "name": "Acme", "slug": slug })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let api_key = body["apiKey"].as_str().unwrap().to_string();
    let org_id: Uuid = body["organization"]["id"].as_str().unwrap().parse().unwrap();

    TestApp {
        router,
        store,
        api_key,
        org_id,
        slug: slug.to_string(),
        _bootstrap: bootstrap,
    }
}

async fn install_source(app: &TestApp, source: &str, webhook_secret: Option<&str>) {
    let mut body = json!({ "credentials": {"secret_key": "sk_test_123"} });
    if let Some(secret) = webhook_secret {
        body["webhookSecret"] = json!(secret);
    }
    let (status, _) = request(
        &app.router,
        authed(post_json(&format!("/v1/setup/{}", source), body), &app.api_key),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn deliver(app: &TestApp, source: &str, body: Value) -> (StatusCode, Value) {
    request(
        &app.router,
        post_json(&format!("/webhooks/{}/{}", app.slug, source), body),
    )
    .await
}

/// Poll until the worker pool has processed everything we expect. The
/// canonical event is written before the entitlement transition and the
/// detectors, so settle briefly after the count matches.
async fn wait_for_events(store: &MemoryStore, org_id: Uuid, count: usize) {
    for _ in 0..200 {
        if store.events(org_id).await.len() >= count {
            tokio::time::sleep(Duration::from_millis(50)).await;
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "expected {} events, saw {}",
        count,
        store.events(org_id).await.len()
    );
}

fn stripe_subscription_created(event_id: &str, amount: i64) -> Value {
    json!({
        "id": event_id,
        "type": "customer.subscription.created",
        "created": 1700000000,
        "livemode": true,
        "data": {"object": {
            "id": "sub_123",
            "customer": "cus_abc",
            "status": "active",
            "currency": "usd",
            "plan": {"amount": amount},
            "current_period_end": 1702592000
        }}
    })
}

fn stripe_refund(event_id: &str, amount: i64) -> Value {
    json!({
        "id": event_id,
        "type": "charge.refunded",
        "created": 1700001000,
        "livemode": true,
        "data": {"object": {
            "id": "ch_1",
            "customer": "cus_abc",
            "subscription": "sub_123",
            "amount": amount,
            "amount_refunded": amount,
            "currency": "usd"
        }}
    })
}

fn apple_jws(payload: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
    let body = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
    format!("{}.{}.c2lnbmF0dXJl", header, body)
}

fn apple_notification(notification_type: &str, subtype: Option<&str>, uuid: &str) -> Value {
    let transaction = json!({
        "originalTransactionId": "1000000123",
        "transactionId": "2000000456",
        "productId": "com.example.pro.monthly",
        "appAccountToken": "acc-token-1",
        "price": 9990,
        "currency": "USD",
        "signedDate": 1700000000000i64,
        "expiresDate": 1702592000000i64
    });
    let mut payload = json!({
        "notificationType": notification_type,
        "notificationUUID": uuid,
        "signedDate": 1700000000000i64,
        "data": {
            "bundleId": "com.example.app",
            "environment": "Production",
            "signedTransactionInfo": apple_jws(&transaction)
        }
    });
    if let Some(sub) = subtype {
        payload["subtype"] = json!(sub);
    }
    json!({ "signedPayload": apple_jws(&payload) })
}

#[tokio::test]
async fn scenario_stripe_purchase_then_refund() {
    let app = test_app("acme-refund").await;
    install_source(&app, "stripe", None).await;

    let (status, body) = deliver(&app, "stripe", stripe_subscription_created("evt_1", 1999)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], json!(true));
    assert!(body["webhookLogId"].is_string());
    wait_for_events(&app.store, app.org_id, 1).await;

    // User and active stripe entitlement exist
    assert_eq!(app.store.user_count(app.org_id).await, 1);
    let events = app.store.events(app.org_id).await;
    let user_id = events[0].user_id.unwrap();
    let entitlement = app
        .store
        .get_entitlement(app.org_id, user_id, None, Source::Stripe)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entitlement.state, EntitlementState::Active);

    let (status, _) = deliver(&app, "stripe", stripe_refund("evt_2", 1999)).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_events(&app.store, app.org_id, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The charge refund left the subscription live — that gap is the issue
    let (status, body) = request(
        &app.router,
        authed(
            Request::builder()
                .uri("/v1/issues?status=open")
                .body(Body::empty())
                .unwrap(),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let issues = body["issues"].as_array().unwrap();
    assert_eq!(issues.len(), 1);
    let issue = &issues[0];
    assert_eq!(issue["issue_type"], "unrevoked_refund");
    assert_eq!(issue["severity"], "warning");
    assert_eq!(issue["estimated_revenue_cents"], 1999);
    assert!((issue["confidence"].as_f64().unwrap() - 0.92).abs() < 1e-9);
}

#[tokio::test]
async fn scenario_apple_renew_after_subscribe() {
    let app = test_app("acme-apple").await;
    install_source(&app, "apple", None).await;

    let uuid1 = "a1b2c3d4-0000-0000-0000-000000000001";
    let uuid2 = "a1b2c3d4-0000-0000-0000-000000000002";

    let (status, _) = deliver(&app, "apple", apple_notification("SUBSCRIBED", None, uuid1)).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_events(&app.store, app.org_id, 1).await;

    let (status, _) = deliver(&app, "apple", apple_notification("DID_RENEW", None, uuid2)).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_events(&app.store, app.org_id, 2).await;

    assert_eq!(app.store.user_count(app.org_id).await, 1);

    let events = app.store.events(app.org_id).await;
    let mut keys: Vec<&str> = events.iter().map(|e| e.idempotency_key.as_str()).collect();
    keys.sort();
    assert_eq!(
        keys,
        vec![format!("apple:{}", uuid1), format!("apple:{}", uuid2)]
    );

    let user_id = events[0].user_id.unwrap();
    let entitlement = app
        .store
        .get_entitlement(app.org_id, user_id, None, Source::Apple)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entitlement.state, EntitlementState::Active);

    // One transition recorded (inactive -> active); the renewal refreshed
    // the period without a state change
    assert_eq!(entitlement.state_history.len(), 1);

    let issues = app
        .store
        .list_issues(app.org_id, Default::default())
        .await
        .unwrap();
    assert!(issues.is_empty());
}

#[tokio::test]
async fn scenario_cross_platform_duplicate_then_mismatch() {
    let app = test_app("acme-dup").await;
    install_source(&app, "stripe", None).await;
    install_source(&app, "apple", None).await;

    // The email links both identities to one user
    let stripe_purchase = json!({
        "id": "evt_s1",
        "type": "customer.subscription.created",
        "created": 1700000000,
        "livemode": true,
        "data": {"object": {
            "id": "sub_123",
            "customer": "cus_abc",
            "customer_email": "jane@example.com",
            "status": "active",
            "currency": "usd",
            "plan": {"amount": 1999},
            "current_period_end": 1702592000
        }}
    });
    deliver(&app, "stripe", stripe_purchase).await;
    wait_for_events(&app.store, app.org_id, 1).await;

    // Merge apple onto the same user through the identity graph
    let events = app.store.events(app.org_id).await;
    let user_id = events[0].user_id.unwrap();
    app.store
        .upsert_identity(UserIdentity {
            id: Uuid::new_v4(),
            org_id: app.org_id,
            user_id,
            source: Source::Apple,
            id_type: IdentityType::OriginalTransactionId,
            external_id: "1000000123".into(),
            metadata: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    deliver(
        &app,
        "apple",
        apple_notification("SUBSCRIBED", None, "b0000000-0000-0000-0000-000000000001"),
    )
    .await;
    wait_for_events(&app.store, app.org_id, 2).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Both platforms active: duplicate_subscription warning
    let dup = app
        .store
        .find_open_issue(app.org_id, Some(user_id), IssueType::DuplicateSubscription, None)
        .await
        .unwrap();
    assert!(dup.is_some(), "expected duplicate_subscription issue");
    assert_eq!(dup.unwrap().severity, IssueSeverity::Warning);

    // Apple expires while stripe stays active: critical mismatch
    deliver(
        &app,
        "apple",
        apple_notification(
            "EXPIRED",
            Some("VOLUNTARY"),
            "b0000000-0000-0000-0000-000000000002",
        ),
    )
    .await;
    wait_for_events(&app.store, app.org_id, 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mismatch = app
        .store
        .find_open_issue(app.org_id, Some(user_id), IssueType::CrossPlatformMismatch, None)
        .await
        .unwrap();
    assert!(mismatch.is_some(), "expected cross_platform_mismatch issue");
    assert_eq!(mismatch.unwrap().severity, IssueSeverity::Critical);
}

#[tokio::test]
async fn signature_verification_gates_delivery() {
    let app = test_app("acme-sig").await;
    install_source(&app, "stripe", Some("whsec_test_secret")).await;

    let payload = stripe_subscription_created("evt_1", 1999);
    let body = payload.to_string();

    // No signature header: 401, log row preserved as failed
    let (status, body_json) = deliver(&app, "stripe", payload.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body_json["error"], "Unauthorized: signature_invalid");

    let failed = app
        .store
        .list_webhook_logs(
            app.org_id,
            revwatch_database::WebhookLogFilter {
                status: Some(ProcessingStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);

    // Valid signature: accepted and processed
    let header = build_signature_header("whsec_test_secret", Utc::now().timestamp(), body.as_bytes());
    let req = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}/stripe", app.slug))
        .header("content-type", "application/json")
        .header("stripe-signature", header)
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = request(&app.router, req).await;
    assert_eq!(status, StatusCode::OK);
    wait_for_events(&app.store, app.org_id, 1).await;

    // Tampered signature: rejected
    let bad_header =
        build_signature_header("whsec_other_secret", Utc::now().timestamp(), body.as_bytes());
    let req = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/{}/stripe", app.slug))
        .header("stripe-signature", bad_header)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = request(&app.router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_slug_and_source_are_404() {
    let app = test_app("acme-404").await;
    install_source(&app, "stripe", None).await;

    let (status, _) = request(
        &app.router,
        post_json("/webhooks/nope/stripe", json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = request(
        &app.router,
        post_json(&format!("/webhooks/{}/paypal", app.slug), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Connected source exists, but apple was never installed
    let (status, _) = request(
        &app.router,
        post_json(&format!("/webhooks/{}/apple", app.slug), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn auth_and_scope_enforcement() {
    let app = test_app("acme-auth").await;

    // No bearer token
    let (status, _) = request(
        &app.router,
        Request::builder()
            .uri("/v1/issues")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Unknown key
    let (status, _) = request(
        &app.router,
        authed(
            Request::builder()
                .uri("/v1/issues")
                .body(Body::empty())
                .unwrap(),
            &format!("rev_{}", "0".repeat(64)),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // A key scoped to access checks only cannot read issues
    let scoped = revwatch_security::generate_api_key();
    app.store
        .insert_api_key(ApiKey {
            id: Uuid::new_v4(),
            org_id: app.org_id,
            key_hash: scoped.key_hash.clone(),
            key_prefix: scoped.key_prefix.clone(),
            scopes: vec![ApiScope::AccessChecksWrite],
            expires_at: None,
            revoked_at: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let (status, _) = request(
        &app.router,
        authed(
            Request::builder()
                .uri("/v1/issues")
                .body(Body::empty())
                .unwrap(),
            &scoped.plaintext,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Expired key gets the dedicated 401
    let expired = revwatch_security::generate_api_key();
    app.store
        .insert_api_key(ApiKey {
            id: Uuid::new_v4(),
            org_id: app.org_id,
            key_hash: expired.key_hash.clone(),
            key_prefix: expired.key_prefix.clone(),
            scopes: vec![],
            expires_at: Some(Utc::now() - chrono::Duration::hours(1)),
            revoked_at: None,
            created_at: Utc::now(),
        })
        .await
        .unwrap();
    let (status, body) = request(
        &app.router,
        authed(
            Request::builder()
                .uri("/v1/issues")
                .body(Body::empty())
                .unwrap(),
            &expired.plaintext,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Unauthorized: expired");
}

#[tokio::test]
async fn access_checks_resolve_and_batch_limit() {
    let app = test_app("acme-checks").await;

    let (status, _) = request(
        &app.router,
        authed(
            post_json(
                "/v1/access-checks",
                json!({ "user": "app-user-1", "hasAccess": true }),
            ),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Same external user resolves to the same canonical user
    let (status, _) = request(
        &app.router,
        authed(
            post_json(
                "/v1/access-checks",
                json!({ "user": "app-user-1", "hasAccess": false }),
            ),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.store.user_count(app.org_id).await, 1);

    // Batch over the limit rejects
    let oversized: Vec<Value> = (0..101)
        .map(|i| json!({ "user": format!("u-{}", i), "hasAccess": true }))
        .collect();
    let (status, body) = request(
        &app.router,
        authed(post_json("/v1/access-checks/batch", json!(oversized)), &app.api_key),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["details"]["max"], 100);
}

#[tokio::test]
async fn issue_lifecycle_transitions() {
    let app = test_app("acme-issues").await;

    let issue_id = Uuid::new_v4();
    app.store
        .insert_issue(Issue {
            id: issue_id,
            org_id: app.org_id,
            user_id: Some(Uuid::new_v4()),
            issue_type: IssueType::DuplicateBilling,
            severity: IssueSeverity::Critical,
            status: IssueStatus::Open,
            title: "t".into(),
            description: "d".into(),
            estimated_revenue_cents: Some(1999),
            confidence: 0.9,
            detector_id: "duplicate_billing".into(),
            detection_tier: DetectionTier::BillingOnly,
            evidence: json!({}),
            scope_key: None,
            resolution: None,
            resolved_at: None,
            ai_summary: None,
            ai_summary_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();

    let (status, body) = request(
        &app.router,
        authed(
            post_json(
                &format!("/v1/issues/{}/acknowledge", issue_id),
                json!({}),
            ),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue"]["status"], "acknowledged");

    let (status, body) = request(
        &app.router,
        authed(
            post_json(
                &format!("/v1/issues/{}/resolve", issue_id),
                json!({ "resolution": "refunded the duplicate charge" }),
            ),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["issue"]["status"], "resolved");
    assert!(body["issue"]["resolved_at"].is_string());

    // Unknown issue is 404
    let (status, _) = request(
        &app.router,
        authed(
            post_json(&format!("/v1/issues/{}/dismiss", Uuid::new_v4()), json!({})),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn duplicate_org_slug_conflicts() {
    let app = test_app("acme-taken").await;
    let (status, _) = request(
        &app.router,
        post_json("/v1/setup/org", json!({ "name": "Other", "slug": "acme-taken" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = request(
        &app.router,
        post_json("/v1/setup/org", json!({ "name": "Bad", "slug": "-bad-" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn breaker_snapshot_requires_admin_scope() {
    let app = test_app("acme-admin").await;
    let (status, body) = request(
        &app.router,
        authed(
            Request::builder()
                .uri("/v1/admin/breakers")
                .body(Body::empty())
                .unwrap(),
            &app.api_key,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["breakers"].is_array());
}
