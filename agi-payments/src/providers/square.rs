//! Square card processor implementation

use crate::{
    config::{Environment, SquareConfig},
    crypto::DetailsCipher,
    error::{DeclineCode, PaymentError, Result},
    money::{Currency, Money},
    provider::{PaymentProvider, ProviderClient, status_error},
    types::*,
    webhook::{WebhookEvent, WebhookEventType, WebhookResource, WebhookResult, log_excerpt, parse_timestamp},
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const PRODUCTION_URL: &str = "https://connect.squareup.com";
const SANDBOX_URL: &str = "https://connect.squareupsandbox.com";

/// API version pinned on every request
pub const SQUARE_VERSION: &str = "2025-01-23";

/// Header carrying the webhook signature
pub const SIGNATURE_HEADER: &str = "x-square-hmacsha256-signature";

const ID: ProviderId = ProviderId::Square;

/// Saved card details, sealed at rest and only opened here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SquareCardDetails {
    /// Card on file ID (`ccof:...`)
    pub card_id: String,
    pub brand: Option<String>,
    pub last4: Option<String>,
    pub exp_month: Option<u32>,
    pub exp_year: Option<u32>,
}

/// Square provider
pub struct SquareProvider {
    access_token: SecretString,
    location_id: String,
    webhook_signature_key: Option<SecretString>,
    webhook_url: Option<String>,
    cipher: Option<DetailsCipher>,
    client: ProviderClient,
}

impl SquareProvider {
    /// Create a new Square provider
    pub fn new(config: &SquareConfig, timeout: Duration) -> Result<Self> {
        let base_url = config.base_url.clone().unwrap_or_else(|| {
            match config.environment {
                Environment::Production => PRODUCTION_URL,
                Environment::Sandbox => SANDBOX_URL,
            }
            .to_string()
        });

        let mut headers = HeaderMap::new();
        headers.insert("Square-Version", HeaderValue::from_static(SQUARE_VERSION));

        Ok(Self {
            access_token: config.access_token.clone(),
            location_id: config.location_id.clone(),
            webhook_signature_key: config.webhook_signature_key.clone(),
            webhook_url: config.webhook_url.clone(),
            cipher: None,
            client: ProviderClient::new(ID, base_url, timeout, headers)?,
        })
    }

    /// Cipher used to open saved card details
    pub fn with_cipher(mut self, cipher: DetailsCipher) -> Self {
        self.cipher = Some(cipher);
        self
    }

    fn token(&self) -> &str {
        self.access_token.expose_secret()
    }

    /// Verify `x-square-hmacsha256-signature`: base64(HMAC-SHA256(key, url + body))
    pub fn verify_signature(&self, payload: &[u8], signature: &str) -> Result<()> {
        let key = self
            .webhook_signature_key
            .as_ref()
            .ok_or(PaymentError::InvalidSignature { provider: ID })?;

        let expected = BASE64
            .decode(signature.trim())
            .map_err(|_| PaymentError::InvalidSignature { provider: ID })?;

        let mut mac = Hmac::<Sha256>::new_from_slice(key.expose_secret().as_bytes())
            .map_err(|_| PaymentError::InvalidSignature { provider: ID })?;
        mac.update(self.webhook_url.as_deref().unwrap_or_default().as_bytes());
        mac.update(payload);

        mac.verify_slice(&expected)
            .map_err(|_| PaymentError::InvalidSignature { provider: ID })
    }

    /// Resolve what to charge: an explicit nonce/card ID or a saved card
    fn payment_source(&self, request: &PaymentRequest) -> Result<(String, Option<String>)> {
        if let Some(source) = &request.payment_method_id {
            return Ok((source.clone(), None));
        }

        let saved = request.saved_method.as_ref().ok_or_else(|| {
            PaymentError::Validation("a card nonce or saved card is required".into())
        })?;
        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| PaymentError::Encryption("no key configured for saved cards".into()))?;
        let card: SquareCardDetails = cipher.open(&saved.details)?;
        Ok((card.card_id, saved.provider_customer_ref.clone()))
    }

    async fn fetch_payment(&self, payment_id: &str) -> Result<SquarePayment> {
        let response = self
            .client
            .get(&format!("/v2/payments/{}", payment_id), self.token())
            .await?;
        let body: PaymentEnvelope = self.client.json(response).await?;
        Ok(body.payment)
    }
}

#[async_trait]
impl PaymentProvider for SquareProvider {
    fn id(&self) -> ProviderId {
        ID
    }

    async fn initialize(&self) -> Result<()> {
        let path = format!("/v2/locations/{}", self.location_id);
        let response = self
            .client
            .get(&path, self.token())
            .await
            .map_err(|e| PaymentError::ProviderInit {
                provider: ID,
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PaymentError::ProviderInit {
                provider: ID,
                message: format!("location lookup returned {}", response.status()),
            });
        }
        Ok(())
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        request.validate()?;
        let amount = request.money()?;

        let mut body = json!({
            "idempotency_key": Uuid::new_v4().to_string(),
            "quick_pay": {
                "name": request.description,
                "price_money": money_json(&amount),
                "location_id": self.location_id,
            },
            "payment_note": request.customer_id,
        });
        if let Some(url) = &request.return_url {
            body["checkout_options"] = json!({ "redirect_url": url });
        }
        if let Some(email) = &request.customer_email {
            body["pre_populated_data"] = json!({ "buyer_email": email });
        }

        let response = self
            .client
            .post("/v2/online-checkout/payment-links", self.token(), &body)
            .await?;
        let created: PaymentLinkEnvelope = self.client.json(response).await?;
        let link = created.payment_link;

        Ok(CheckoutSession {
            checkout_id: link.id,
            provider: ID,
            checkout_url: Some(link.url),
            order_reference: link.order_id,
            status: CheckoutStatus::Pending,
            amount,
            customer_id: request.customer_id,
            description: request.description,
            return_url: request.return_url,
            cancel_url: request.cancel_url,
            deposit_instructions: None,
            created_at: parse_timestamp(link.created_at.as_deref()).unwrap_or_else(Utc::now),
        })
    }

    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentResult> {
        request.validate()?;
        let amount = request.money()?;
        let (source_id, customer_ref) = self.payment_source(&request)?;

        let mut body = json!({
            "source_id": source_id,
            "idempotency_key": request
                .idempotency_key
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            "amount_money": money_json(&amount),
            "location_id": self.location_id,
            "autocomplete": true,
        });
        if let Some(customer) = customer_ref {
            body["customer_id"] = json!(customer);
        }
        if let Some(reference) = &request.reference {
            body["reference_id"] = json!(reference);
        }

        let response = self.client.post("/v2/payments", self.token(), &body).await?;
        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PaymentError::transport(ID, e))?;

        if (200..300).contains(&status) {
            let created: PaymentEnvelope = serde_json::from_slice(&bytes)?;
            let payment = created.payment;
            let status = payment_status(&payment);
            return Ok(PaymentResult::new(ID, payment.id, status, amount)
                .with_receipt(payment.receipt_url));
        }

        // Card declines come back as 4xx with a PAYMENT_METHOD_ERROR
        let failure: ErrorEnvelope = serde_json::from_slice(&bytes).unwrap_or_default();
        if let Some(decline) = failure
            .errors
            .iter()
            .find(|e| e.category == "PAYMENT_METHOD_ERROR")
        {
            let code = DeclineCode::parse(&decline.code);
            info!(provider = %ID, code = %decline.code, "Card declined");
            let payment_id = failure.payment.map(|p| p.id).unwrap_or_default();
            return Ok(PaymentResult::failed(ID, payment_id, amount, code.message()));
        }

        Err(status_error(ID, status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookResult> {
        if let Err(err) = self.verify_signature(payload, signature) {
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
        let customer = request.provider_customer_ref.clone().ok_or_else(|| {
            PaymentError::Validation("Square subscriptions need a Square customer ID".into())
        })?;

        let mut body = json!({
            "idempotency_key": Uuid::new_v4().to_string(),
            "location_id": self.location_id,
            "plan_variation_id": request.plan_id,
            "customer_id": customer,
        });
        if let Some(card_id) = request.metadata.get("card_id") {
            body["card_id"] = json!(card_id);
        }

        let response = self
            .client
            .post("/v2/subscriptions", self.token(), &body)
            .await?;
        let created: SubscriptionEnvelope = self.client.json(response).await?;
        let sub = created.subscription;

        Ok(Subscription {
            status: subscription_status(&sub.status),
            current_period_end: parse_date(sub.charged_through_date.as_deref()),
            id: sub.id,
            provider: ID,
            approval_url: None,
            plan_id: request.plan_id,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool> {
        let path = format!("/v2/subscriptions/{}/cancel", subscription_id);
        let response = self.client.post(&path, self.token(), &json!({})).await?;
        let canceled: SubscriptionEnvelope = self.client.json(response).await?;
        Ok(matches!(
            subscription_status(&canceled.subscription.status),
            SubscriptionStatus::Canceled
        ) || canceled.subscription.canceled_date.is_some())
    }

    async fn refund(&self, payment_id: &str, amount: Option<Money>) -> Result<RefundResult> {
        let amount = match amount {
            Some(amount) => amount,
            None => self
                .fetch_payment(payment_id)
                .await?
                .amount_money
                .and_then(|m| m.to_money())
                .ok_or_else(|| PaymentError::Upstream {
                    provider: ID,
                    status: 200,
                    message: format!("payment {} has no amount", payment_id),
                })?,
        };

        let body = json!({
            "idempotency_key": Uuid::new_v4().to_string(),
            "payment_id": payment_id,
            "amount_money": money_json(&amount),
        });
        let response = self.client.post("/v2/refunds", self.token(), &body).await?;
        let created: RefundEnvelope = self.client.json(response).await?;

        let status = match created.refund.status.as_str() {
            "COMPLETED" => RefundStatus::Succeeded,
            "REJECTED" | "FAILED" => RefundStatus::Failed,
            _ => RefundStatus::Pending,
        };

        Ok(RefundResult {
            refund_id: Some(created.refund.id),
            payment_id: payment_id.to_string(),
            provider: ID,
            amount: Some(amount),
            status,
        })
    }

    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus> {
        Ok(payment_status(&self.fetch_payment(payment_id).await?))
    }
}

fn money_json(money: &Money) -> serde_json::Value {
    json!({ "amount": money.amount, "currency": money.currency.code() })
}

fn payment_status(payment: &SquarePayment) -> PaymentStatus {
    let refunded = payment
        .refunded_money
        .as_ref()
        .zip(payment.amount_money.as_ref())
        .is_some_and(|(refunded, total)| refunded.amount > 0 && refunded.amount >= total.amount);
    if refunded {
        return PaymentStatus::Refunded;
    }

    match payment.status.as_str() {
        "COMPLETED" => PaymentStatus::Succeeded,
        "FAILED" | "CANCELED" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

fn subscription_status(status: &str) -> SubscriptionStatus {
    match status {
        "ACTIVE" => SubscriptionStatus::Active,
        "PENDING" => SubscriptionStatus::Trialing,
        "PAUSED" => SubscriptionStatus::PastDue,
        "CANCELED" | "DEACTIVATED" => SubscriptionStatus::Canceled,
        _ => SubscriptionStatus::RequiresPaymentMethod,
    }
}

/// Square dates are plain `YYYY-MM-DD`
fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Normalize a verified notification
fn parse_event(payload: &[u8]) -> Result<WebhookEvent> {
    let envelope: SquareWebhook = serde_json::from_slice(payload)?;
    let object = &envelope.data.object;
    let mut resource = WebhookResource::default();

    let event_type = match envelope.event_type.as_str() {
        "payment.created" | "payment.updated" => {
            let payment: SquarePayment = object_field(object, "payment")?;
            resource.amount = payment.amount_money.as_ref().and_then(|m| m.to_money());
            resource.order_reference = payment.order_id.clone();
            resource.payment_id = Some(payment.id.clone());
            match payment.status.as_str() {
                "COMPLETED" => WebhookEventType::PaymentCompleted,
                "FAILED" | "CANCELED" => WebhookEventType::PaymentFailed,
                _ => WebhookEventType::Unknown(envelope.event_type.clone()),
            }
        }
        "refund.created" | "refund.updated" => {
            let refund: SquareRefund = object_field(object, "refund")?;
            resource.payment_id = refund.payment_id.clone();
            resource.order_reference = refund.order_id.clone();
            resource.amount = refund.amount_money.as_ref().and_then(|m| m.to_money());
            match refund.status.as_str() {
                "COMPLETED" => WebhookEventType::PaymentRefunded,
                _ => WebhookEventType::Unknown(envelope.event_type.clone()),
            }
        }
        "subscription.created" | "subscription.updated" => {
            let sub: SquareSubscription = object_field(object, "subscription")?;
            let status = subscription_status(&sub.status);
            resource.subscription_id = Some(sub.id.clone());
            resource.subscription_status = Some(status);
            resource.current_period_end = parse_date(sub.charged_through_date.as_deref());
            match status {
                SubscriptionStatus::Canceled => WebhookEventType::SubscriptionCanceled,
                SubscriptionStatus::PastDue => WebhookEventType::SubscriptionSuspended,
                SubscriptionStatus::Active if envelope.event_type == "subscription.created" => {
                    WebhookEventType::SubscriptionActivated
                }
                _ => WebhookEventType::SubscriptionUpdated,
            }
        }
        "invoice.payment_made" | "invoice.scheduled_charge_failed" => {
            let invoice: SquareInvoice = object_field(object, "invoice")?;
            resource.order_reference = invoice.order_id.clone();
            resource.subscription_id = invoice.subscription_id.clone();
            if envelope.event_type == "invoice.payment_made" {
                WebhookEventType::InvoicePaid
            } else {
                WebhookEventType::SubscriptionPaymentFailed
            }
        }
        other => WebhookEventType::Unknown(other.to_string()),
    };

    Ok(WebhookEvent {
        id: envelope.event_id,
        provider: ID,
        event_type,
        raw_type: envelope.event_type,
        created_at: parse_timestamp(envelope.created_at.as_deref()).unwrap_or_else(Utc::now),
        resource,
        payload: serde_json::from_slice(payload)?,
    })
}

fn object_field<T: for<'de> Deserialize<'de>>(object: &serde_json::Value, field: &str) -> Result<T> {
    let value = object
        .get(field)
        .cloned()
        .ok_or_else(|| PaymentError::Serialization(format!("webhook object has no {}", field)))?;
    Ok(serde_json::from_value(value)?)
}

// Square API response types

#[derive(Debug, Clone, Deserialize)]
struct SquareMoney {
    amount: i64,
    currency: String,
}

impl SquareMoney {
    fn to_money(&self) -> Option<Money> {
        Currency::from_code(&self.currency).map(|c| Money::new(self.amount, c))
    }
}

#[derive(Debug, Deserialize)]
struct PaymentLinkEnvelope {
    payment_link: SquarePaymentLink,
}

#[derive(Debug, Deserialize)]
struct SquarePaymentLink {
    id: String,
    url: String,
    order_id: Option<String>,
    created_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentEnvelope {
    payment: SquarePayment,
}

#[derive(Debug, Clone, Deserialize)]
struct SquarePayment {
    id: String,
    #[serde(default)]
    status: String,
    order_id: Option<String>,
    receipt_url: Option<String>,
    amount_money: Option<SquareMoney>,
    refunded_money: Option<SquareMoney>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<SquareError>,
    payment: Option<SquarePayment>,
}

#[derive(Debug, Deserialize)]
struct SquareError {
    #[serde(default)]
    category: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Deserialize)]
struct RefundEnvelope {
    refund: SquareRefund,
}

#[derive(Debug, Deserialize)]
struct SquareRefund {
    id: String,
    #[serde(default)]
    status: String,
    payment_id: Option<String>,
    order_id: Option<String>,
    amount_money: Option<SquareMoney>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionEnvelope {
    subscription: SquareSubscription,
}

#[derive(Debug, Deserialize)]
struct SquareSubscription {
    id: String,
    #[serde(default)]
    status: String,
    charged_through_date: Option<String>,
    canceled_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SquareInvoice {
    order_id: Option<String>,
    subscription_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SquareWebhook {
    event_id: String,
    #[serde(rename = "type")]
    event_type: String,
    created_at: Option<String>,
    data: SquareWebhookData,
}

#[derive(Debug, Deserialize)]
struct SquareWebhookData {
    #[serde(default)]
    object: serde_json::Value,
}
