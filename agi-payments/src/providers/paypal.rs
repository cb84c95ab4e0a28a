//! PayPal wallet implementation

use crate::{
    config::{Environment, PayPalConfig},
    error::{DeclineCode, PaymentError, Result},
    money::{Currency, Money},
    provider::{PaymentProvider, ProviderClient, status_error},
    types::*,
    webhook::{WebhookEvent, WebhookEventType, WebhookResource, WebhookResult, log_excerpt, parse_timestamp},
};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;
use reqwest::header::HeaderMap;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{Value, json};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PRODUCTION_URL: &str = "https://api-m.paypal.com";
const SANDBOX_URL: &str = "https://api-m.sandbox.paypal.com";

/// Webhook transmission headers, in the order they are joined
pub const TRANSMISSION_HEADERS: [&str; 5] = [
    "paypal-auth-algo",
    "paypal-cert-url",
    "paypal-transmission-id",
    "paypal-transmission-sig",
    "paypal-transmission-time",
];

/// Delimiter of the composite signature string
pub const SIGNATURE_DELIMITER: char = '|';

const ID: ProviderId = ProviderId::PayPal;

/// Tokens are refreshed this long before PayPal expires them
const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;
/// Cache lifetime when the advertised one is unusable
const FALLBACK_TOKEN_TTL_SECS: i64 = 300;

/// PayPal provider
pub struct PayPalProvider {
    client_id: String,
    client_secret: SecretString,
    webhook_id: Option<String>,
    client: ProviderClient,
    access_token: tokio::sync::RwLock<Option<PayPalToken>>,
}

#[derive(Debug, Clone)]
struct PayPalToken {
    token: String,
    expires_at: chrono::DateTime<Utc>,
}

/// Transmission headers of one notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureParts {
    pub auth_algo: String,
    pub cert_url: String,
    pub transmission_id: String,
    pub transmission_sig: String,
    pub transmission_time: String,
}

impl SignatureParts {
    /// Split a composite signature string
    pub fn parse(signature: &str) -> Option<Self> {
        let parts: Vec<&str> = signature.split(SIGNATURE_DELIMITER).collect();
        if parts.len() != 5 || parts.iter().any(|p| p.trim().is_empty()) {
            return None;
        }
        Some(Self {
            auth_algo: parts[0].trim().to_string(),
            cert_url: parts[1].trim().to_string(),
            transmission_id: parts[2].trim().to_string(),
            transmission_sig: parts[3].trim().to_string(),
            transmission_time: parts[4].trim().to_string(),
        })
    }

    /// Certificate must be served over https from a paypal.com host
    pub fn has_trusted_cert_url(&self) -> bool {
        url::Url::parse(&self.cert_url).is_ok_and(|url| {
            url.scheme() == "https"
                && url
                    .host_str()
                    .is_some_and(|host| host == "paypal.com" || host.ends_with(".paypal.com"))
        })
    }
}

/// Join the transmission headers into the composite signature string
pub fn compose_signature_header(
    auth_algo: &str,
    cert_url: &str,
    transmission_id: &str,
    transmission_sig: &str,
    transmission_time: &str,
) -> String {
    [auth_algo, cert_url, transmission_id, transmission_sig, transmission_time]
        .join(&SIGNATURE_DELIMITER.to_string())
}

impl PayPalProvider {
    /// Create a new PayPal provider
    pub fn new(config: &PayPalConfig, timeout: Duration) -> Result<Self> {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.environment {
                Environment::Production => PRODUCTION_URL,
                Environment::Sandbox => SANDBOX_URL,
            }
            .to_string()
        });

        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            webhook_id: config.webhook_id.clone(),
            client: ProviderClient::new(ID, base_url, timeout, HeaderMap::new())?,
            access_token: tokio::sync::RwLock::new(None),
        })
    }

    /// Get or refresh access token
    async fn get_token(&self) -> Result<String> {
        {
            let token = self.access_token.read().await;
            if let Some(ref t) = *token {
                if t.expires_at > Utc::now() {
                    return Ok(t.token.clone());
                }
            }
        }

        let mut token = self.access_token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(ref t) = *token {
            if t.expires_at > Utc::now() {
                return Ok(t.token.clone());
            }
        }

        let response = self
            .client
            .send(
                self.client
                    .request(Method::POST, "/v1/oauth2/token")
                    .basic_auth(&self.client_id, Some(self.client_secret.expose_secret()))
                    .form(&[("grant_type", "client_credentials")]),
            )
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::Authentication {
                provider: ID,
                message: format!("token request returned {}", response.status()),
            });
        }

        let token_response: PayPalTokenResponse = self.client.json(response).await?;
        *token = Some(PayPalToken {
            token: token_response.access_token.clone(),
            expires_at: token_expiry(Utc::now(), token_response.expires_in),
        });
        debug!(provider = %ID, expires_in = token_response.expires_in, "Refreshed access token");

        Ok(token_response.access_token)
    }

    /// Ask PayPal whether a notification is genuine. Every failure rejects it.
    async fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<()> {
        let rejected = PaymentError::InvalidSignature { provider: ID };

        let Some(webhook_id) = &self.webhook_id else {
            warn!(provider = %ID, "Webhook ID not configured; rejecting notification");
            return Err(rejected);
        };
        let Some(parts) = SignatureParts::parse(signature) else {
            return Err(rejected);
        };
        if !parts.has_trusted_cert_url() {
            warn!(provider = %ID, cert_url = %parts.cert_url, "Untrusted certificate URL");
            return Err(rejected);
        }
        let event: Value = serde_json::from_slice(payload)
            .map_err(|_| PaymentError::InvalidSignature { provider: ID })?;

        let body = json!({
            "auth_algo": parts.auth_algo,
            "cert_url": parts.cert_url,
            "transmission_id": parts.transmission_id,
            "transmission_sig": parts.transmission_sig,
            "transmission_time": parts.transmission_time,
            "webhook_id": webhook_id,
            "webhook_event": event,
        });

        match self.request_verification(&body).await {
            Ok(v) if v.verification_status == "SUCCESS" => Ok(()),
            Ok(v) => {
                warn!(provider = %ID, status = %v.verification_status, "Signature verification failed");
                Err(rejected)
            }
            Err(err) => {
                warn!(provider = %ID, error = %err, "Signature verification unavailable");
                Err(rejected)
            }
        }
    }

    async fn request_verification(&self, body: &Value) -> Result<VerificationResponse> {
        let token = self.get_token().await?;
        let response = self
            .client
            .post("/v1/notifications/verify-webhook-signature", &token, body)
            .await?;
        self.client.json(response).await
    }
}

#[async_trait]
impl PaymentProvider for PayPalProvider {
    fn id(&self) -> ProviderId {
        ID
    }

    async fn initialize(&self) -> Result<()> {
        self.get_token()
            .await
            .map(|_| ())
            .map_err(|e| PaymentError::ProviderInit {
                provider: ID,
                message: e.to_string(),
            })
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        request.validate()?;
        let amount = request.money()?;

        let mut purchase_unit = json!({
            "reference_id": request.customer_id,
            "description": request.description,
            "amount": amount_json(&amount),
        });
        if let Some(invoice_id) = request.metadata.get("invoice_id") {
            purchase_unit["custom_id"] = json!(invoice_id);
        }

        let mut context = json!({
            "user_action": "PAY_NOW",
            "shipping_preference": "NO_SHIPPING",
            "locale": match request.locale {
                Locale::Es => "es-ES",
                Locale::En => "en-US",
            },
        });
        if let Some(url) = &request.return_url {
            context["return_url"] = json!(url);
        }
        if let Some(url) = &request.cancel_url {
            context["cancel_url"] = json!(url);
        }

        let body = json!({
            "intent": "CAPTURE",
            "purchase_units": [purchase_unit],
            "application_context": context,
        });

        let token = self.get_token().await?;
        let response = self.client.post("/v2/checkout/orders", &token, &body).await?;
        let order: PayPalOrder = self.client.json(response).await?;

        Ok(CheckoutSession {
            checkout_url: approval_link(&order.links),
            checkout_id: order.id.clone(),
            provider: ID,
            order_reference: Some(order.id),
            status: CheckoutStatus::Pending,
            amount,
            customer_id: request.customer_id,
            description: request.description,
            return_url: request.return_url,
            cancel_url: request.cancel_url,
            deposit_instructions: None,
            created_at: Utc::now(),
        })
    }

    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentResult> {
        request.validate()?;
        let amount = request.money()?;
        let order_id = request.payment_method_id.clone().ok_or_else(|| {
            PaymentError::Validation("an approved PayPal order ID is required".into())
        })?;

        let token = self.get_token().await?;
        let idempotency_key = request
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let response = self
            .client
            .send(
                self.client
                    .request(Method::POST, &format!("/v2/checkout/orders/{}/capture", order_id))
                    .bearer_auth(&token)
                    .header("PayPal-Request-Id", idempotency_key)
                    .json(&json!({})),
            )
            .await?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PaymentError::transport(ID, e))?;

        if (200..300).contains(&status) {
            let order: PayPalOrder = serde_json::from_slice(&bytes)?;
            let capture = order
                .purchase_units
                .iter()
                .flat_map(|unit| unit.payments.iter().flat_map(|p| p.captures.iter()))
                .next();

            let Some(capture) = capture else {
                return Ok(PaymentResult::new(ID, order.id, order_status(&order.status), amount));
            };

            let status = capture_status(&capture.status);
            if status == PaymentStatus::Failed {
                return Ok(PaymentResult::failed(
                    ID,
                    capture.id.clone(),
                    amount,
                    DeclineCode::InstrumentDeclined.message(),
                ));
            }
            return Ok(PaymentResult::new(ID, capture.id.clone(), status, amount));
        }

        // Funding failures come back as 422 with an issue code
        if status == 422 {
            let failure: PayPalError = serde_json::from_slice(&bytes).unwrap_or_default();
            if let Some(issue) = failure.details.iter().find_map(|d| d.issue.as_deref()) {
                let code = DeclineCode::parse(issue);
                if code != DeclineCode::Unknown {
                    info!(provider = %ID, issue = %issue, "Capture declined");
                    return Ok(PaymentResult::failed(ID, order_id, amount, code.message()));
                }
            }
        }

        Err(status_error(ID, status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookResult> {
        if let Err(err) = self.verify_signature(payload, signature).await {
            warn!(
                provider = %ID,
                payload = %log_excerpt(payload),
                "Webhook signature verification failed"
            );
            return Err(err);
        }

        Ok(WebhookResult::accepted(parse_event(payload)?))
    }

    async fn create_subscription(&self, request: SubscriptionRequest) -> Result<Subscription> {
        let mut body = json!({
            "plan_id": request.plan_id,
            "custom_id": request.customer_id,
        });
        if let Some(email) = &request.customer_email {
            body["subscriber"] = json!({ "email_address": email });
        }
        let mut context = json!({ "user_action": "SUBSCRIBE_NOW" });
        if let Some(url) = &request.return_url {
            context["return_url"] = json!(url);
        }
        if let Some(url) = &request.cancel_url {
            context["cancel_url"] = json!(url);
        }
        body["application_context"] = context;

        let token = self.get_token().await?;
        let response = self
            .client
            .post("/v1/billing/subscriptions", &token, &body)
            .await?;
        let created: PayPalSubscription = self.client.json(response).await?;

        Ok(Subscription {
            approval_url: approval_link(&created.links),
            status: subscription_status(&created.status),
            current_period_end: created
                .billing_info
                .as_ref()
                .and_then(|b| parse_timestamp(b.next_billing_time.as_deref())),
            id: created.id,
            provider: ID,
            plan_id: request.plan_id,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool> {
        let token = self.get_token().await?;
        let response = self
            .client
            .post(
                &format!("/v1/billing/subscriptions/{}/cancel", subscription_id),
                &token,
                &json!({ "reason": "Canceled by customer" }),
            )
            .await?;

        match response.status().as_u16() {
            200..=299 => Ok(true),
            // Already canceled or expired
            422 => {
                warn!(provider = %ID, subscription_id = %subscription_id, "Subscription not in a cancellable state");
                Ok(false)
            }
            _ => Err(self.client.status_error(response).await),
        }
    }

    async fn refund(&self, payment_id: &str, amount: Option<Money>) -> Result<RefundResult> {
        let body = match &amount {
            Some(amount) => json!({ "amount": amount_json(amount) }),
            None => json!({}),
        };

        let token = self.get_token().await?;
        let response = self
            .client
            .post(&format!("/v2/payments/captures/{}/refund", payment_id), &token, &body)
            .await?;
        let refund: PayPalRefund = self.client.json(response).await?;

        let status = match refund.status.as_str() {
            "COMPLETED" => RefundStatus::Succeeded,
            "CANCELLED" | "FAILED" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        };

        Ok(RefundResult {
            refund_id: Some(refund.id),
            payment_id: payment_id.to_string(),
            provider: ID,
            amount: refund.amount.as_ref().and_then(to_money).or(amount),
            status,
        })
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus> {
        let token = self.get_token().await?;
        let response = self
            .client
            .get(&format!("/v2/payments/captures/{}", payment_id), &token)
            .await?;

        if response.status().as_u16() != 404 {
            let capture: PayPalCapture = self.client.json(response).await?;
            return Ok(capture_status(&capture.status));
        }

        // Not captured yet; the ID may name an order
        let response = self
            .client
            .get(&format!("/v2/checkout/orders/{}", payment_id), &token)
            .await?;
        let order: PayPalOrder = self.client.json(response).await?;
        Ok(order_status(&order.status))
    }
}

/// When a token advertised to live `expires_in` seconds should be refreshed
fn token_expiry(now: chrono::DateTime<Utc>, expires_in: u64) -> chrono::DateTime<Utc> {
    i64::try_from(expires_in)
        .ok()
        .and_then(|secs| chrono::Duration::try_seconds((secs - TOKEN_REFRESH_MARGIN_SECS).max(0)))
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .unwrap_or(now + chrono::Duration::seconds(FALLBACK_TOKEN_TTL_SECS))
}

fn amount_json(money: &Money) -> Value {
    json!({
        "currency_code": money.currency.code(),
        "value": money.to_major_string(),
    })
}

fn to_money(amount: &PayPalAmount) -> Option<Money> {
    let currency = Currency::from_code(&amount.currency_code)?;
    let value = Decimal::from_str(&amount.value).ok()?;
    Money::from_major(value, currency).ok()
}

fn approval_link(links: &[PayPalLink]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel == "approve" || l.rel == "payer-action")
        .map(|l| l.href.clone())
}

fn capture_status(status: &str) -> PaymentStatus {
    match status {
        "COMPLETED" => PaymentStatus::Succeeded,
        "DECLINED" | "FAILED" => PaymentStatus::Failed,
        "REFUNDED" | "PARTIALLY_REFUNDED" => PaymentStatus::Refunded,
        _ => PaymentStatus::Pending,
    }
}

fn order_status(status: &str) -> PaymentStatus {
    match status {
        "COMPLETED" => PaymentStatus::Succeeded,
        "VOIDED" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

fn subscription_status(status: &str) -> SubscriptionStatus {
    match status {
        "ACTIVE" => SubscriptionStatus::Active,
        "SUSPENDED" => SubscriptionStatus::PastDue,
        "CANCELLED" | "EXPIRED" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::RequiresPaymentMethod,
    }
}

fn str_at<'a>(value: &'a Value, path: &[&str]) -> Option<&'a str> {
    path.iter()
        .try_fold(value, |current, key| current.get(key))
        .and_then(Value::as_str)
}

fn resource_amount(resource: &Value) -> Option<Money> {
    // Orders and captures use `value`; legacy sale events use `total`
    let amount = resource.get("amount")?;
    let currency = amount
        .get("currency_code")
        .or_else(|| amount.get("currency"))
        .and_then(Value::as_str)?;
    let value = amount
        .get("value")
        .or_else(|| amount.get("total"))
        .and_then(Value::as_str)?;
    to_money(&PayPalAmount {
        currency_code: currency.to_string(),
        value: value.to_string(),
    })
}

/// Normalize a verified notification
fn parse_event(payload: &[u8]) -> Result<WebhookEvent> {
    let envelope: PayPalWebhook = serde_json::from_slice(payload)?;
    let resource = &envelope.resource;
    let resource_id = str_at(resource, &["id"]).map(str::to_string);
    let mut normalized = WebhookResource {
        amount: resource_amount(resource),
        ..WebhookResource::default()
    };

    let event_type = match envelope.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.CAPTURE.DENIED" | "PAYMENT.CAPTURE.DECLINED" => {
            normalized.payment_id = resource_id;
            normalized.order_reference =
                str_at(resource, &["supplementary_data", "related_ids", "order_id"]).map(str::to_string);
            if envelope.event_type == "PAYMENT.CAPTURE.COMPLETED" {
                WebhookEventType::PaymentCompleted
            } else {
                WebhookEventType::PaymentFailed
            }
        }
        "PAYMENT.CAPTURE.REFUNDED" => {
            normalized.payment_id = resource_id;
            normalized.order_reference =
                str_at(resource, &["supplementary_data", "related_ids", "order_id"]).map(str::to_string);
            WebhookEventType::PaymentRefunded
        }
        "CHECKOUT.ORDER.APPROVED" => {
            normalized.order_reference = resource_id;
            WebhookEventType::CheckoutApproved
        }
        "BILLING.SUBSCRIPTION.ACTIVATED"
        | "BILLING.SUBSCRIPTION.UPDATED"
        | "BILLING.SUBSCRIPTION.CANCELLED"
        | "BILLING.SUBSCRIPTION.EXPIRED"
        | "BILLING.SUBSCRIPTION.SUSPENDED"
        | "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => {
            normalized.subscription_id = resource_id;
            normalized.subscription_status = str_at(resource, &["status"]).map(subscription_status);
            normalized.current_period_end =
                parse_timestamp(str_at(resource, &["billing_info", "next_billing_time"]));
            match envelope.event_type.as_str() {
                "BILLING.SUBSCRIPTION.ACTIVATED" => WebhookEventType::SubscriptionActivated,
                "BILLING.SUBSCRIPTION.UPDATED" => WebhookEventType::SubscriptionUpdated,
                "BILLING.SUBSCRIPTION.SUSPENDED" => WebhookEventType::SubscriptionSuspended,
                "BILLING.SUBSCRIPTION.PAYMENT.FAILED" => WebhookEventType::SubscriptionPaymentFailed,
                _ => WebhookEventType::SubscriptionCanceled,
            }
        }
        "PAYMENT.SALE.COMPLETED" => {
            normalized.payment_id = resource_id;
            normalized.subscription_id = str_at(resource, &["billing_agreement_id"]).map(str::to_string);
            normalized.order_reference = str_at(resource, &["custom"])
                .or_else(|| str_at(resource, &["invoice_number"]))
                .map(str::to_string);
            WebhookEventType::InvoicePaid
        }
        other => WebhookEventType::Unknown(other.to_string()),
    };

    Ok(WebhookEvent {
        id: envelope.id,
        provider: ID,
        event_type,
        created_at: parse_timestamp(envelope.create_time.as_deref()).unwrap_or_else(Utc::now),
        raw_type: envelope.event_type,
        resource: normalized,
        payload: serde_json::from_slice(payload)?,
    })
}

// PayPal API types

#[derive(Debug, Deserialize)]
struct PayPalTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct PayPalAmount {
    currency_code: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct PayPalLink {
    href: String,
    rel: String,
}

#[derive(Debug, Deserialize)]
struct PayPalOrder {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
    #[serde(default)]
    purchase_units: Vec<PayPalPurchaseUnit>,
}

#[derive(Debug, Deserialize)]
struct PayPalPurchaseUnit {
    payments: Option<PayPalPayments>,
}

#[derive(Debug, Deserialize)]
struct PayPalPayments {
    #[serde(default)]
    captures: Vec<PayPalCapture>,
}

#[derive(Debug, Deserialize)]
struct PayPalCapture {
    id: String,
    #[serde(default)]
    status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalRefund {
    id: String,
    #[serde(default)]
    status: String,
    amount: Option<PayPalAmount>,
}

#[derive(Debug, Deserialize)]
struct PayPalSubscription {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    links: Vec<PayPalLink>,
    billing_info: Option<PayPalBillingInfo>,
}

#[derive(Debug, Deserialize)]
struct PayPalBillingInfo {
    next_billing_time: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PayPalError {
    #[serde(default)]
    details: Vec<PayPalErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct PayPalErrorDetail {
    issue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerificationResponse {
    verification_status: String,
}

#[derive(Debug, Deserialize)]
struct PayPalWebhook {
    id: String,
    event_type: String,
    create_time: Option<String>,
    #[serde(default)]
    resource: Value,
}
