//! Inbound webhook endpoints.
//!
//! `POST /webhooks/{provider}` hands the raw body and the provider's signature
//! headers to the matching adapter, then reconciles the verified event.
//!
//! | outcome                                   | status |
//! |-------------------------------------------|--------|
//! | processed, ignored or duplicate           | 200    |
//! | signature rejected                        | 401    |
//! | provider unknown, unconfigured, no hooks  | 404    |
//! | event claimed by another worker           | 409    |
//! | anything else                             | 500    |

use crate::error::PaymentError;
use crate::manager::PaymentManager;
use crate::providers::{paypal, square};
use crate::reconciler::WebhookReconciler;
use crate::types::ProviderId;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Shared state of the webhook router
#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<PaymentManager>,
    pub reconciler: Arc<WebhookReconciler>,
}

impl GatewayState {
    pub fn new(manager: Arc<PaymentManager>, reconciler: Arc<WebhookReconciler>) -> Self {
        Self {
            manager,
            reconciler,
        }
    }
}

/// Error body returned to the provider
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: &'static str,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &'static str, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Build the webhook router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/webhooks/{provider}", post(receive_webhook))
        .with_state(state)
}

/// Signature material each provider sends, in the form its adapter expects
fn extract_signature(provider: ProviderId, headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    match provider {
        ProviderId::Square => header(square::SIGNATURE_HEADER),
        ProviderId::PayPal => {
            let [algo, cert, id, sig, time] = paypal::TRANSMISSION_HEADERS.map(header);
            paypal::compose_signature_header(&algo, &cert, &id, &sig, &time)
        }
        ProviderId::BankDeposit => String::new(),
    }
}

/// Map a failure to the status the provider sees
fn error_response(err: &PaymentError) -> HandlerError {
    let (status, code) = match err {
        PaymentError::InvalidSignature { .. } => (StatusCode::UNAUTHORIZED, "invalid_signature"),
        PaymentError::UnknownProvider(_)
        | PaymentError::ProviderUnavailable(_)
        | PaymentError::Unsupported { .. } => (StatusCode::NOT_FOUND, "not_found"),
        PaymentError::WebhookInFlight { .. } => (StatusCode::CONFLICT, "in_flight"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };
    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        "webhook could not be processed".to_string()
    } else {
        err.to_string()
    };
    (status, Json(ErrorResponse::new(code, message)))
}

/// POST /webhooks/{provider}
async fn receive_webhook(
    State(state): State<GatewayState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, HandlerError> {
    let id = ProviderId::parse(&provider)
        .ok_or_else(|| error_response(&PaymentError::UnknownProvider(provider.clone())))?;

    let signature = extract_signature(id, &headers);
    let result = state
        .manager
        .handle_webhook(id, &body, &signature)
        .await
        .map_err(|err| {
            if !matches!(err, PaymentError::InvalidSignature { .. }) {
                warn!(provider = %id, error = %err, "Webhook rejected");
            }
            error_response(&err)
        })?;

    if !result.received {
        return Err(error_response(&PaymentError::Unsupported {
            provider: id,
            operation: "webhooks",
        }));
    }

    let Some(event) = result.event else {
        return Ok(StatusCode::OK);
    };

    match state.reconciler.process(&event).await {
        Ok(outcome) => {
            info!(provider = %id, event_id = %event.id, outcome = ?outcome, "Webhook acknowledged");
            Ok(StatusCode::OK)
        }
        Err(err) => {
            if matches!(err, PaymentError::WebhookInFlight { .. }) {
                info!(provider = %id, event_id = %event.id, "Webhook event in flight, asking for redelivery");
            } else {
                error!(provider = %id, event_id = %event.id, error = %err, "Webhook reconciliation failed");
            }
            Err(error_response(&err))
        }
    }
}
