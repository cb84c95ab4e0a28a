//! End-to-end tests of the payment gateway.
//!
//! Remote providers are replaced by wiremock servers; records live in the
//! in-memory store.

use agi_payments::eligibility;
use agi_payments::providers::paypal::{TRANSMISSION_HEADERS, compose_signature_header};
use agi_payments::*;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PAYPAL_CERT_URL: &str = "https://api.paypal.com/v1/notifications/certs/CERT-360caa42";

fn bank_accounts() -> Vec<BankAccount> {
    vec![
        BankAccount::new(
            "Banco Popular Dominicano",
            "800-123-456789",
            "AGI Labs SRL",
            "1-31-00000-1",
            Currency::USD,
        ),
        BankAccount::new(
            "Banco Popular Dominicano",
            "800-987-654321",
            "AGI Labs SRL",
            "1-31-00000-1",
            Currency::DOP,
        ),
    ]
}

fn paypal(base_url: &str) -> PayPalProvider {
    let config = PayPalConfig::new("client-id", "client-secret")
        .webhook_id("WH-GATEWAY")
        .base_url(base_url);
    PayPalProvider::new(&config, Duration::from_secs(5)).unwrap()
}

fn dominican_manager(paypal_url: &str) -> PaymentManager {
    PaymentManager::with_providers(vec![
        Arc::new(BankDepositProvider::new(bank_accounts())),
        Arc::new(paypal(paypal_url)),
    ])
}

async fn mount_paypal_verification(server: &MockServer, status: &str) {
    Mock::given(method("POST"))
        .and(path("/v1/oauth2/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "A21AA-token",
            "token_type": "Bearer",
            "expires_in": 32400
        })))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/notifications/verify-webhook-signature"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "verification_status": status })),
        )
        .mount(server)
        .await;
}

fn paypal_capture_event(event_id: &str, order_id: &str) -> String {
    json!({
        "id": event_id,
        "event_type": "PAYMENT.CAPTURE.COMPLETED",
        "create_time": "2026-02-01T09:30:00Z",
        "resource": {
            "id": "CAPTURE-9",
            "status": "COMPLETED",
            "amount": { "currency_code": "USD", "value": "49.00" },
            "supplementary_data": { "related_ids": { "order_id": order_id } }
        }
    })
    .to_string()
}

fn paypal_webhook_request(body: &str) -> Request<Body> {
    let values = [
        "SHA256withRSA",
        PAYPAL_CERT_URL,
        "b2384410-f8d2-11e9-8d5f-0d0a3e7d27a6",
        "c2lnbmF0dXJl",
        "2026-02-01T09:30:01Z",
    ];
    let mut builder = Request::builder().method("POST").uri("/webhooks/paypal");
    for (name, value) in TRANSMISSION_HEADERS.iter().zip(values) {
        builder = builder.header(*name, value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn is_reference_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

// =============================================================================
// Eligibility and routing
// =============================================================================

#[test]
fn test_international_customers_get_wallet_only() {
    for country in ["MX", "ES", "CO", "FR"] {
        assert_eq!(
            eligibility::permitted_providers(Some(country), Currency::USD),
            vec![ProviderId::PayPal]
        );
        assert!(!eligibility::requires_manual_verification(Some(country)));
    }
}

#[test]
fn test_dominican_customers_default_to_bank_deposit() {
    assert_eq!(
        eligibility::default_provider(Some("DO")),
        ProviderId::BankDeposit
    );
    assert!(eligibility::requires_manual_verification(Some("DO")));
}

#[test]
fn test_recommendation_for_dominican_pesos() {
    let manager = dominican_manager("http://127.0.0.1:9");
    let choice = manager
        .recommend_payment_method(Decimal::new(50, 0), Currency::DOP, Some("DO"), None)
        .unwrap();
    assert_eq!(choice, ProviderId::BankDeposit);
}

#[test]
fn test_empty_registry_has_no_provider() {
    let manager = PaymentManager::with_providers(Vec::new());
    let err = manager
        .recommend_payment_method(Decimal::new(50, 0), Currency::USD, Some("US"), None)
        .unwrap_err();
    assert!(matches!(err, PaymentError::NoProviderAvailable));
}

#[tokio::test]
async fn test_dominican_customer_paying_usd_gets_deposit_instructions() {
    let manager = dominican_manager("http://127.0.0.1:9");

    assert_eq!(
        manager.eligible_providers(Some("DO"), Currency::USD),
        vec![ProviderId::BankDeposit, ProviderId::PayPal]
    );
    let provider = manager
        .recommend_payment_method(Decimal::new(100, 0), Currency::USD, Some("DO"), None)
        .unwrap();
    assert_eq!(provider, ProviderId::BankDeposit);

    let session = manager
        .create_checkout(
            provider,
            CheckoutRequest::new(Decimal::new(100, 0), Currency::USD, "cus_do_1", "Professional plan")
                .country("DO")
                .locale(Locale::En),
        )
        .await
        .unwrap();

    let instructions = session.deposit_instructions.expect("deposit instructions");
    let segments: Vec<&str> = instructions.reference_code.split('-').collect();
    assert_eq!(segments.len(), 3, "{}", instructions.reference_code);
    assert_eq!(segments[0], "AGI");
    assert!(is_reference_segment(segments[1]));
    assert!(is_reference_segment(segments[2]));

    assert_eq!(instructions.due_date - session.created_at, ChronoDuration::days(3));
    assert_eq!(instructions.masked_account, "****6789");
    assert!(instructions.message.contains(&instructions.reference_code));
    assert!(instructions.message.contains("****6789"));
    assert!(instructions.message.contains("US$100.00"));
    assert_eq!(session.order_reference.as_deref(), Some(instructions.reference_code.as_str()));
}

#[tokio::test]
async fn test_card_processor_is_refused_for_dominican_customer() {
    let manager = dominican_manager("http://127.0.0.1:9");
    let err = manager
        .create_checkout(
            ProviderId::Square,
            CheckoutRequest::new(Decimal::new(100, 0), Currency::USD, "cus_do_1", "Plan").country("DO"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::ProviderUnavailable(ProviderId::Square)));
}

// =============================================================================
// Webhooks
// =============================================================================

#[tokio::test]
async fn test_paypal_invalid_signature_is_rejected() {
    let server = MockServer::start().await;
    mount_paypal_verification(&server, "FAILURE").await;

    let store = Arc::new(MemoryStore::new());
    let invoice = Invoice::open("cus_1", Money::usd(4900)).settled_by(ProviderId::PayPal, "ORDER-77");
    store.insert_invoice(invoice.clone()).await.unwrap();

    let app = router(GatewayState::new(
        Arc::new(dominican_manager(&server.uri())),
        Arc::new(WebhookReconciler::new(store.clone())),
    ));

    let body = paypal_capture_event("WH-FORGED", "ORDER-77");
    let response = app.oneshot(paypal_webhook_request(&body)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(
        store
            .get_webhook_event(ProviderId::PayPal, "WH-FORGED")
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        store.get_invoice(&invoice.id).await.unwrap().unwrap().status,
        InvoiceStatus::Open
    );
}

#[tokio::test]
async fn test_redelivered_event_is_applied_once() {
    let server = MockServer::start().await;
    mount_paypal_verification(&server, "SUCCESS").await;

    let store = Arc::new(MemoryStore::new());
    let subscription = SubscriptionRecord::new(
        "cus_1",
        ProviderId::PayPal,
        "I-BW452GLLEP1G",
        "professional",
        SubscriptionStatus::PastDue,
    );
    let invoice = Invoice::open("cus_1", Money::usd(4900))
        .for_subscription(subscription.id.clone())
        .settled_by(ProviderId::PayPal, "ORDER-88");
    store.insert_subscription(subscription.clone()).await.unwrap();
    store.insert_invoice(invoice.clone()).await.unwrap();

    let app = router(GatewayState::new(
        Arc::new(dominican_manager(&server.uri())),
        Arc::new(WebhookReconciler::new(store.clone())),
    ));

    let body = paypal_capture_event("WH-REAL-1", "ORDER-88");
    let first = app.clone().oneshot(paypal_webhook_request(&body)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let paid_at = store.get_invoice(&invoice.id).await.unwrap().unwrap().paid_at;

    let second = app.oneshot(paypal_webhook_request(&body)).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);

    let current = store.get_invoice(&invoice.id).await.unwrap().unwrap();
    assert_eq!(current.status, InvoiceStatus::Paid);
    assert_eq!(current.paid_at, paid_at);
    assert_eq!(
        store.get_subscription(&subscription.id).await.unwrap().unwrap().status,
        SubscriptionStatus::Active
    );

    let record = store
        .get_webhook_event(ProviderId::PayPal, "WH-REAL-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, WebhookStatus::Processed);
    assert_eq!(record.attempts, 1);
}

// =============================================================================
// Bank deposit verification
// =============================================================================

fn declaration(invoice_id: &str) -> DepositDeclaration {
    DepositDeclaration::new(
        "cus_do_1",
        Money::usd(10_000),
        "Banco BHD",
        "0123456789",
        "AGI-M7Q2K1-ZX81QP",
    )
    .invoice(invoice_id)
}

#[tokio::test]
async fn test_deposit_review_lifecycle() {
    let store = Arc::new(MemoryStore::new());
    let invoice = Invoice::open("cus_do_1", Money::usd(10_000));
    store.insert_invoice(invoice.clone()).await.unwrap();
    let workflow = BankDepositWorkflow::new(store.clone());

    let deposit = workflow.declare(declaration(&invoice.id)).await.unwrap();
    assert_eq!(deposit.account_last4, "6789");

    let err = workflow
        .verify(&deposit.id, "ops@agi.example", false, None)
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Validation(_)));

    store.fail_next_apply(1, "simulated outage");
    assert!(workflow.verify(&deposit.id, "ops@agi.example", true, None).await.is_err());
    assert_eq!(workflow.get(&deposit.id).await.unwrap().status, DepositStatus::Pending);
    assert_eq!(
        store.get_invoice(&invoice.id).await.unwrap().unwrap().status,
        InvoiceStatus::Open
    );

    let verified = workflow
        .verify(&deposit.id, "ops@agi.example", true, None)
        .await
        .unwrap();
    assert_eq!(verified.status, DepositStatus::Verified);
    assert_eq!(
        store.get_invoice(&invoice.id).await.unwrap().unwrap().status,
        InvoiceStatus::Paid
    );

    let err = workflow
        .verify(&deposit.id, "someone@agi.example", false, Some("duplicate"))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::AlreadyFinalized { .. }));
    let unchanged = workflow.get(&deposit.id).await.unwrap();
    assert_eq!(unchanged.status, DepositStatus::Verified);
    assert_eq!(unchanged.verified_by.as_deref(), Some("ops@agi.example"));
}

// =============================================================================
// Payment methods
// =============================================================================

#[tokio::test]
async fn test_single_default_payment_method() {
    let store = Arc::new(MemoryStore::new());
    let service = PaymentMethodService::new(store, DetailsCipher::from_bytes([7u8; 32]));
    let details = json!({ "card_id": "ccof:1" });

    let first = service
        .attach(NewPaymentMethod::new("cus_1", ProviderId::Square).default_method(), &details)
        .await
        .unwrap();
    let second = service
        .attach(NewPaymentMethod::new("cus_1", ProviderId::Square).default_method(), &details)
        .await
        .unwrap();

    let methods = service.list_active("cus_1").await.unwrap();
    let defaults: Vec<&str> = methods
        .iter()
        .filter(|m| m.is_default)
        .map(|m| m.id.as_str())
        .collect();
    assert_eq!(defaults, vec![second.id.as_str()]);
    assert!(methods.iter().any(|m| m.id == first.id && !m.is_default));
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/payments"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({}))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let config = SquareConfig::new("sq-token", "L1").base_url(server.uri());
    let square = SquareProvider::new(&config, Duration::from_millis(300)).unwrap();
    let manager = PaymentManager::with_providers(vec![Arc::new(square)]);

    let err = manager
        .process_payment(
            ProviderId::Square,
            PaymentRequest::new(Decimal::new(2900, 2), Currency::USD, "cus_us_1")
                .payment_method("cnon:card-nonce-ok")
                .country("US"),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, PaymentError::Timeout { provider: ProviderId::Square }));
    assert!(err.is_retryable());
    assert_eq!(err.provider(), Some(ProviderId::Square));
}
