//! Payment provider trait and common functionality

use crate::error::{PaymentError, Result};
use crate::money::Money;
use crate::types::*;
use crate::webhook::WebhookResult;
use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

/// Payment provider trait
///
/// One implementation per backend. Adapters never persist anything; they
/// translate between the normalized types and the backend's API.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider identity
    fn id(&self) -> ProviderId;

    /// Lightweight authenticated call proving the credentials work
    async fn initialize(&self) -> Result<()>;

    /// Start a purchase
    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession>;

    /// Finalize a payment. Declines are a failed result, not an error.
    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentResult>;

    /// Verify and parse an inbound notification
    async fn handle_webhook(&self, payload: &[u8], signature: &str) -> Result<WebhookResult>;

    /// Create a recurring subscription
    async fn create_subscription(&self, request: SubscriptionRequest) -> Result<Subscription>;

    /// Cancel a subscription; `true` once the provider confirmed it
    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool>;

    /// Refund a payment, fully when `amount` is `None`
    async fn refund(&self, payment_id: &str, amount: Option<Money>) -> Result<RefundResult>;

    /// Current status of a payment
    async fn payment_status(&self, payment_id: &str) -> Result<PaymentStatus>;
}

/// Common HTTP client for providers
///
/// Transport failures come back already tagged with the provider.
#[derive(Debug, Clone)]
pub struct ProviderClient {
    provider: ProviderId,
    client: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    /// Create a new provider client
    pub fn new(
        provider: ProviderId,
        base_url: impl Into<String>,
        timeout: Duration,
        default_headers: HeaderMap,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(default_headers)
            .build()
            .map_err(|e| PaymentError::ProviderInit {
                provider,
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            provider,
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are issued against
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request to `path` relative to the base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
    }

    /// Send a request
    pub async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request
            .send()
            .await
            .map_err(|e| PaymentError::transport(self.provider, e))?;
        debug!(
            provider = %self.provider,
            url = %response.url(),
            status = response.status().as_u16(),
            "Provider responded"
        );
        Ok(response)
    }

    /// GET request with bearer auth
    pub async fn get(&self, path: &str, token: &str) -> Result<Response> {
        self.send(self.request(Method::GET, path).bearer_auth(token))
            .await
    }

    /// POST request with JSON body and bearer auth
    pub async fn post<T: serde::Serialize + ?Sized>(
        &self,
        path: &str,
        token: &str,
        body: &T,
    ) -> Result<Response> {
        self.send(self.request(Method::POST, path).bearer_auth(token).json(body))
            .await
    }

    /// Decode a successful response, or turn a failed one into an error
    pub async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T> {
        if !response.status().is_success() {
            return Err(self.status_error(response).await);
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| PaymentError::transport(self.provider, e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Map a non-success response to an error
    pub async fn status_error(&self, response: Response) -> PaymentError {
        let status = response.status().as_u16();
        let message = response.text().await.unwrap_or_default();
        status_error(self.provider, status, message)
    }
}

/// Map an HTTP status and body to the matching error
pub fn status_error(provider: ProviderId, status: u16, message: String) -> PaymentError {
    match status {
        401 | 403 => PaymentError::Authentication { provider, message },
        _ => PaymentError::Upstream {
            provider,
            status,
            message,
        },
    }
}
