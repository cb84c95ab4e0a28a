//! Applies verified webhook events to billing records.
//!
//! Every event is claimed in the store on (provider, event_id) before any
//! record is touched, so a redelivered event changes nothing. The record
//! changes for an event and its `processed` mark are written in one batch.

use crate::error::{PaymentError, Result};
use crate::records::{Invoice, InvoiceStatus, SubscriptionRecord, WebhookEventRecord, WebhookStatus};
use crate::store::{Mutation, RecordStore, WebhookClaim};
use crate::types::{ProviderId, SubscriptionStatus};
use crate::webhook::{WebhookEvent, WebhookEventType};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How long a worker owns an event before another delivery may take it over
pub const DEFAULT_LEASE_SECS: i64 = 300;

/// Result of reconciling one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Records were updated
    Processed,
    /// Event was handled by an earlier delivery
    Duplicate,
    /// Event recorded as processed without touching any record
    Ignored,
}

/// Webhook reconciler
pub struct WebhookReconciler {
    store: Arc<dyn RecordStore>,
    lease: Duration,
}

impl WebhookReconciler {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            lease: Duration::seconds(DEFAULT_LEASE_SECS),
        }
    }

    /// Override the claim lease
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Claim, plan and apply one event
    pub async fn process(&self, event: &WebhookEvent) -> Result<ReconcileOutcome> {
        let record = WebhookEventRecord::pending(
            event.provider,
            event.id.clone(),
            event.raw_type.clone(),
            event.payload.clone(),
        );

        match self.store.claim_webhook_event(record, self.lease).await? {
            WebhookClaim::AlreadyProcessed(_) => {
                info!(provider = %event.provider, event_id = %event.id, "Duplicate webhook event acknowledged");
                return Ok(ReconcileOutcome::Duplicate);
            }
            WebhookClaim::AlreadyFailed(record) => {
                info!(
                    provider = %event.provider,
                    event_id = %event.id,
                    error = record.error.as_deref().unwrap_or_default(),
                    "Failed webhook event acknowledged without reprocessing"
                );
                return Ok(ReconcileOutcome::Duplicate);
            }
            WebhookClaim::InFlight(_) => {
                debug!(provider = %event.provider, event_id = %event.id, "Webhook event claimed by another worker");
                return Err(PaymentError::WebhookInFlight {
                    provider: event.provider,
                    event_id: event.id.clone(),
                });
            }
            WebhookClaim::Acquired(record) => {
                debug!(
                    provider = %event.provider,
                    event_id = %event.id,
                    attempts = record.attempts,
                    "Webhook event claimed"
                );
            }
        }

        let mut batch = match self.plan(event).await {
            Ok(batch) => batch,
            Err(err) => {
                warn!(provider = %event.provider, event_id = %event.id, error = %err, "Webhook event could not be planned");
                self.mark_failed(event, &err).await;
                return Err(err);
            }
        };

        let outcome = if batch.is_empty() {
            ReconcileOutcome::Ignored
        } else {
            ReconcileOutcome::Processed
        };
        let changes = batch.len();

        batch.push(Mutation::CompleteWebhookEvent {
            provider: event.provider,
            event_id: event.id.clone(),
            status: WebhookStatus::Processed,
            error: None,
            at: Utc::now(),
        });

        if let Err(err) = self.store.apply(batch).await {
            error!(provider = %event.provider, event_id = %event.id, error = %err, "Failed to apply webhook event");
            self.release(event).await;
            return Err(err.into());
        }

        info!(
            provider = %event.provider,
            event_id = %event.id,
            event_type = %event.raw_type,
            changes,
            "Webhook event processed"
        );
        Ok(outcome)
    }

    /// Record changes an event calls for
    async fn plan(&self, event: &WebhookEvent) -> Result<Vec<Mutation>> {
        let mut plan = Plan::default();
        let resource = &event.resource;

        match &event.event_type {
            WebhookEventType::PaymentCompleted => {
                if let Some(invoice) = self.referenced_invoice(event).await? {
                    plan.invoice(&invoice, InvoiceStatus::Paid, Some(event.created_at));
                    if let Some(subscription) = self.invoice_subscription(&invoice).await? {
                        plan.subscription(&subscription, SubscriptionStatus::Active, None);
                    }
                }
            }
            WebhookEventType::InvoicePaid => {
                let invoice = self.referenced_invoice(event).await?;
                if let Some(invoice) = &invoice {
                    plan.invoice(invoice, InvoiceStatus::Paid, Some(event.created_at));
                }
                let subscription = match self.event_subscription(event).await? {
                    Some(subscription) => Some(subscription),
                    None => match &invoice {
                        Some(invoice) => self.invoice_subscription(invoice).await?,
                        None => None,
                    },
                };
                if let Some(subscription) = subscription {
                    plan.subscription(
                        &subscription,
                        SubscriptionStatus::Active,
                        resource.current_period_end,
                    );
                }
            }
            WebhookEventType::PaymentFailed => {
                let subscription = match self.event_subscription(event).await? {
                    Some(subscription) => Some(subscription),
                    None => match self.referenced_invoice(event).await? {
                        Some(invoice) => self.invoice_subscription(&invoice).await?,
                        None => None,
                    },
                };
                if let Some(subscription) = subscription {
                    plan.subscription(&subscription, SubscriptionStatus::PastDue, None);
                }
            }
            WebhookEventType::PaymentRefunded => {
                if let Some(invoice) = self.referenced_invoice(event).await? {
                    plan.invoice(&invoice, InvoiceStatus::Refunded, None);
                }
            }
            WebhookEventType::SubscriptionActivated | WebhookEventType::SubscriptionUpdated => {
                let subscription = self.required_subscription(event).await?;
                let status = match (&event.event_type, resource.subscription_status) {
                    (_, Some(status)) => Some(status),
                    (WebhookEventType::SubscriptionActivated, None) => Some(SubscriptionStatus::Active),
                    _ => None,
                };
                if let (Some(subscription), Some(status)) = (subscription, status) {
                    plan.subscription(&subscription, status, resource.current_period_end);
                }
            }
            WebhookEventType::SubscriptionCanceled => {
                if let Some(subscription) = self.required_subscription(event).await? {
                    plan.subscription(&subscription, SubscriptionStatus::Canceled, None);
                }
            }
            WebhookEventType::SubscriptionSuspended | WebhookEventType::SubscriptionPaymentFailed => {
                if let Some(subscription) = self.required_subscription(event).await? {
                    plan.subscription(&subscription, SubscriptionStatus::PastDue, None);
                }
            }
            WebhookEventType::CheckoutApproved => {
                debug!(provider = %event.provider, event_id = %event.id, "Checkout approved, waiting for capture");
            }
            WebhookEventType::Unknown(raw) => {
                debug!(provider = %event.provider, event_type = %raw, "Unhandled webhook event type");
            }
        }

        Ok(plan.mutations)
    }

    /// Invoice matched by the order reference, then by the payment ID
    async fn referenced_invoice(&self, event: &WebhookEvent) -> Result<Option<Invoice>> {
        let candidates = [&event.resource.order_reference, &event.resource.payment_id];
        for reference in candidates.into_iter().flatten() {
            if let Some(invoice) = self.store.find_invoice(event.provider, reference).await? {
                return Ok(Some(invoice));
            }
        }
        debug!(provider = %event.provider, event_id = %event.id, "No invoice matches webhook event");
        Ok(None)
    }

    async fn invoice_subscription(&self, invoice: &Invoice) -> Result<Option<SubscriptionRecord>> {
        match &invoice.subscription_id {
            Some(id) => Ok(self.store.get_subscription(id).await?),
            None => Ok(None),
        }
    }

    async fn event_subscription(&self, event: &WebhookEvent) -> Result<Option<SubscriptionRecord>> {
        match &event.resource.subscription_id {
            Some(id) => Ok(self.store.find_subscription(event.provider, id).await?),
            None => Ok(None),
        }
    }

    /// Subscription events must name their subscription
    async fn required_subscription(&self, event: &WebhookEvent) -> Result<Option<SubscriptionRecord>> {
        if event.resource.subscription_id.is_none() {
            return Err(PaymentError::Validation(format!(
                "{} event {} carries no subscription reference",
                event.raw_type, event.id
            )));
        }
        let subscription = self.event_subscription(event).await?;
        if subscription.is_none() {
            debug!(provider = %event.provider, event_id = %event.id, "No subscription matches webhook event");
        }
        Ok(subscription)
    }

    async fn mark_failed(&self, event: &WebhookEvent, err: &PaymentError) {
        let mark = Mutation::CompleteWebhookEvent {
            provider: event.provider,
            event_id: event.id.clone(),
            status: WebhookStatus::Failed,
            error: Some(err.to_string()),
            at: Utc::now(),
        };
        if let Err(store_err) = self.store.apply(vec![mark]).await {
            error!(provider = %event.provider, event_id = %event.id, error = %store_err, "Failed to record webhook failure");
            self.release(event).await;
        }
    }

    async fn release(&self, event: &WebhookEvent) {
        let release = Mutation::ReleaseWebhookEvent {
            provider: event.provider,
            event_id: event.id.clone(),
        };
        if let Err(err) = self.store.apply(vec![release]).await {
            error!(provider = %event.provider, event_id = %event.id, error = %err, "Failed to release webhook claim");
        }
    }
}

/// Mutations collected while planning, skipping no-op transitions
#[derive(Default)]
struct Plan {
    mutations: Vec<Mutation>,
}

impl Plan {
    fn invoice(&mut self, invoice: &Invoice, status: InvoiceStatus, paid_at: Option<DateTime<Utc>>) {
        if invoice.status == status {
            return;
        }
        self.mutations.push(Mutation::UpdateInvoice {
            id: invoice.id.clone(),
            status,
            paid_at,
        });
    }

    fn subscription(
        &mut self,
        subscription: &SubscriptionRecord,
        status: SubscriptionStatus,
        current_period_end: Option<DateTime<Utc>>,
    ) {
        // Deposit subscriptions only move through deposit verification
        if subscription.provider == ProviderId::BankDeposit {
            return;
        }
        let period_unchanged =
            current_period_end.is_none() || current_period_end == subscription.current_period_end;
        if subscription.status == status && period_unchanged {
            return;
        }
        self.mutations.push(Mutation::UpdateSubscription {
            id: subscription.id.clone(),
            status,
            current_period_end,
        });
    }
}
