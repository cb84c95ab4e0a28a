//! Record store abstraction.
//!
//! The core only needs a handful of reads plus one write primitive: an atomic
//! batch of [`Mutation`]s. Either every mutation in a batch is applied or none
//! is. Webhook deduplication goes through [`RecordStore::claim_webhook_event`],
//! which must be atomic on (provider, event_id) in every implementation.

use crate::records::{
    BankDeposit, Customer, DepositStatus, Invoice, InvoiceStatus, PaymentMethodRecord,
    SubscriptionRecord, WebhookEventRecord, WebhookStatus,
};
use crate::types::{ProviderId, SubscriptionStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tokio::sync::RwLock;

/// Record store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Referenced record does not exist
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Uniqueness or precondition violated
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Store could not complete the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether retrying may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One write inside an atomic batch
#[derive(Debug, Clone)]
pub enum Mutation {
    InsertCustomer(Customer),
    /// Insert or replace a payment method. When it is the active default, every
    /// other default of the same customer is cleared in the same batch.
    SavePaymentMethod(PaymentMethodRecord),
    SetDefaultPaymentMethod {
        customer_id: String,
        method_id: String,
    },
    DeactivatePaymentMethod {
        id: String,
    },
    InsertSubscription(SubscriptionRecord),
    UpdateSubscription {
        id: String,
        status: SubscriptionStatus,
        current_period_end: Option<DateTime<Utc>>,
    },
    InsertInvoice(Invoice),
    UpdateInvoice {
        id: String,
        status: InvoiceStatus,
        paid_at: Option<DateTime<Utc>>,
    },
    InsertDeposit(BankDeposit),
    /// Replace an existing deposit that is still pending
    UpdateDeposit(BankDeposit),
    /// Move a claimed webhook event to a terminal or failed state and drop the claim
    CompleteWebhookEvent {
        provider: ProviderId,
        event_id: String,
        status: WebhookStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    /// Drop the claim, leaving the event pending for redelivery
    ReleaseWebhookEvent {
        provider: ProviderId,
        event_id: String,
    },
}

/// Outcome of claiming a webhook event for processing
#[derive(Debug, Clone)]
pub enum WebhookClaim {
    /// Caller holds the claim and must complete or release it
    Acquired(WebhookEventRecord),
    /// Event was processed before; nothing to do
    AlreadyProcessed(WebhookEventRecord),
    /// Event failed before and stays failed; nothing to do
    AlreadyFailed(WebhookEventRecord),
    /// Another worker holds an unexpired claim
    InFlight(WebhookEventRecord),
}

/// Generic record store used by the billing services
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Apply a batch of mutations atomically
    async fn apply(&self, batch: Vec<Mutation>) -> StoreResult<()>;

    /// Insert the event if unseen, or re-claim it when it is pending/failed and
    /// its previous claim has expired. Atomic on (provider, event_id).
    async fn claim_webhook_event(
        &self,
        record: WebhookEventRecord,
        lease: Duration,
    ) -> StoreResult<WebhookClaim>;

    async fn get_webhook_event(
        &self,
        provider: ProviderId,
        event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>>;

    async fn get_customer(&self, id: &str) -> StoreResult<Option<Customer>>;

    async fn get_payment_method(&self, id: &str) -> StoreResult<Option<PaymentMethodRecord>>;

    /// All payment methods of a customer, oldest first
    async fn list_payment_methods(&self, customer_id: &str)
    -> StoreResult<Vec<PaymentMethodRecord>>;

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<SubscriptionRecord>>;

    async fn find_subscription(
        &self,
        provider: ProviderId,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<SubscriptionRecord>>;

    async fn get_invoice(&self, id: &str) -> StoreResult<Option<Invoice>>;

    async fn find_invoice(
        &self,
        provider: ProviderId,
        provider_reference: &str,
    ) -> StoreResult<Option<Invoice>>;

    async fn get_deposit(&self, id: &str) -> StoreResult<Option<BankDeposit>>;

    /// Deposits, optionally filtered by status, oldest first
    async fn list_deposits(&self, status: Option<DepositStatus>) -> StoreResult<Vec<BankDeposit>>;

    async fn insert_invoice(&self, invoice: Invoice) -> StoreResult<()> {
        self.apply(vec![Mutation::InsertInvoice(invoice)]).await
    }

    async fn insert_subscription(&self, subscription: SubscriptionRecord) -> StoreResult<()> {
        self.apply(vec![Mutation::InsertSubscription(subscription)])
            .await
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryState {
    customers: HashMap<String, Customer>,
    payment_methods: HashMap<String, PaymentMethodRecord>,
    subscriptions: HashMap<String, SubscriptionRecord>,
    invoices: HashMap<String, Invoice>,
    deposits: HashMap<String, BankDeposit>,
    webhook_events: HashMap<(ProviderId, String), WebhookEventRecord>,
}

impl MemoryState {
    fn apply(&mut self, mutation: Mutation) -> StoreResult<()> {
        match mutation {
            Mutation::InsertCustomer(customer) => {
                insert_unique(&mut self.customers, "customer", customer.id.clone(), customer)
            }
            Mutation::SavePaymentMethod(record) => {
                if record.is_default && record.active {
                    for other in self.payment_methods.values_mut() {
                        if other.customer_id == record.customer_id && other.id != record.id {
                            other.is_default = false;
                        }
                    }
                }
                self.payment_methods.insert(record.id.clone(), record);
                Ok(())
            }
            Mutation::SetDefaultPaymentMethod {
                customer_id,
                method_id,
            } => {
                let target = self
                    .payment_methods
                    .get(&method_id)
                    .filter(|m| m.customer_id == customer_id && m.active)
                    .ok_or_else(|| not_found("payment method", &method_id))?;
                let target_id = target.id.clone();
                for method in self.payment_methods.values_mut() {
                    if method.customer_id == customer_id {
                        method.is_default = method.id == target_id;
                    }
                }
                Ok(())
            }
            Mutation::DeactivatePaymentMethod { id } => {
                let method = self
                    .payment_methods
                    .get_mut(&id)
                    .ok_or_else(|| not_found("payment method", &id))?;
                method.active = false;
                method.is_default = false;
                Ok(())
            }
            Mutation::InsertSubscription(subscription) => {
                let duplicate = self.subscriptions.values().any(|s| {
                    s.provider == subscription.provider
                        && s.provider_subscription_id == subscription.provider_subscription_id
                });
                if duplicate {
                    return Err(StoreError::Conflict(format!(
                        "subscription {} already recorded for {}",
                        subscription.provider_subscription_id, subscription.provider
                    )));
                }
                insert_unique(
                    &mut self.subscriptions,
                    "subscription",
                    subscription.id.clone(),
                    subscription,
                )
            }
            Mutation::UpdateSubscription {
                id,
                status,
                current_period_end,
            } => {
                let subscription = self
                    .subscriptions
                    .get_mut(&id)
                    .ok_or_else(|| not_found("subscription", &id))?;
                subscription.status = status;
                if current_period_end.is_some() {
                    subscription.current_period_end = current_period_end;
                }
                subscription.updated_at = Utc::now();
                Ok(())
            }
            Mutation::InsertInvoice(invoice) => {
                insert_unique(&mut self.invoices, "invoice", invoice.id.clone(), invoice)
            }
            Mutation::UpdateInvoice {
                id,
                status,
                paid_at,
            } => {
                let invoice = self
                    .invoices
                    .get_mut(&id)
                    .ok_or_else(|| not_found("invoice", &id))?;
                invoice.status = status;
                if paid_at.is_some() {
                    invoice.paid_at = paid_at;
                }
                Ok(())
            }
            Mutation::InsertDeposit(deposit) => {
                insert_unique(&mut self.deposits, "bank deposit", deposit.id.clone(), deposit)
            }
            Mutation::UpdateDeposit(deposit) => {
                let slot = self
                    .deposits
                    .get_mut(&deposit.id)
                    .ok_or_else(|| not_found("bank deposit", &deposit.id))?;
                if slot.status.is_terminal() {
                    return Err(StoreError::Conflict(format!(
                        "bank deposit {} is already {}",
                        deposit.id, slot.status
                    )));
                }
                *slot = deposit;
                Ok(())
            }
            Mutation::CompleteWebhookEvent {
                provider,
                event_id,
                status,
                error,
                at,
            } => {
                let event = self
                    .webhook_events
                    .get_mut(&(provider, event_id.clone()))
                    .ok_or_else(|| not_found("webhook event", &event_id))?;
                if event.status == WebhookStatus::Processed {
                    return Err(StoreError::Conflict(format!(
                        "webhook event {} already processed",
                        event_id
                    )));
                }
                event.status = status;
                event.error = error;
                event.locked_until = None;
                if status == WebhookStatus::Processed {
                    event.processed_at = Some(at);
                }
                Ok(())
            }
            Mutation::ReleaseWebhookEvent { provider, event_id } => {
                let event = self
                    .webhook_events
                    .get_mut(&(provider, event_id.clone()))
                    .ok_or_else(|| not_found("webhook event", &event_id))?;
                event.locked_until = None;
                Ok(())
            }
        }
    }
}

fn insert_unique<T>(
    map: &mut HashMap<String, T>,
    entity: &'static str,
    id: String,
    value: T,
) -> StoreResult<()> {
    if map.contains_key(&id) {
        return Err(StoreError::Conflict(format!("{} {} already exists", entity, id)));
    }
    map.insert(id, value);
    Ok(())
}

fn not_found(entity: &'static str, id: &str) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

fn oldest_first<T, F>(mut items: Vec<T>, created_at: F) -> Vec<T>
where
    F: Fn(&T) -> DateTime<Utc>,
{
    items.sort_by_key(|item| created_at(item));
    items
}

/// In-process store. Batches are staged on a copy of the state and swapped in
/// only when every mutation succeeded.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    injected_failure: Mutex<Option<(usize, String)>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next batch fail after staging `after` of its mutations.
    ///
    /// Fault injection for exercising atomicity; nothing from the failed batch
    /// becomes visible.
    pub fn fail_next_apply(&self, after: usize, reason: impl Into<String>) {
        if let Ok(mut slot) = self.injected_failure.lock() {
            *slot = Some((after, reason.into()));
        }
    }

    fn take_injected_failure(&self) -> Option<(usize, String)> {
        self.injected_failure
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn apply(&self, batch: Vec<Mutation>) -> StoreResult<()> {
        let injected = self.take_injected_failure();
        let mut state = self.state.write().await;
        let mut staged = state.clone();

        for (index, mutation) in batch.into_iter().enumerate() {
            if let Some((after, reason)) = &injected {
                if index == *after {
                    return Err(StoreError::Unavailable(reason.clone()));
                }
            }
            staged.apply(mutation)?;
        }
        if let Some((_, reason)) = injected {
            return Err(StoreError::Unavailable(reason));
        }

        *state = staged;
        Ok(())
    }

    async fn claim_webhook_event(
        &self,
        record: WebhookEventRecord,
        lease: Duration,
    ) -> StoreResult<WebhookClaim> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let key = (record.provider, record.event_id.clone());

        let Some(existing) = state.webhook_events.get_mut(&key) else {
            let mut record = record;
            record.attempts = 1;
            record.locked_until = Some(now + lease);
            state.webhook_events.insert(key, record.clone());
            return Ok(WebhookClaim::Acquired(record));
        };

        if existing.status == WebhookStatus::Processed {
            return Ok(WebhookClaim::AlreadyProcessed(existing.clone()));
        }
        if existing.status == WebhookStatus::Failed {
            return Ok(WebhookClaim::AlreadyFailed(existing.clone()));
        }
        if existing.locked_until.is_some_and(|until| until > now) {
            return Ok(WebhookClaim::InFlight(existing.clone()));
        }

        existing.status = WebhookStatus::Pending;
        existing.attempts += 1;
        existing.locked_until = Some(now + lease);
        Ok(WebhookClaim::Acquired(existing.clone()))
    }

    async fn get_webhook_event(
        &self,
        provider: ProviderId,
        event_id: &str,
    ) -> StoreResult<Option<WebhookEventRecord>> {
        let state = self.state.read().await;
        Ok(state
            .webhook_events
            .get(&(provider, event_id.to_string()))
            .cloned())
    }

    async fn get_customer(&self, id: &str) -> StoreResult<Option<Customer>> {
        Ok(self.state.read().await.customers.get(id).cloned())
    }

    async fn get_payment_method(&self, id: &str) -> StoreResult<Option<PaymentMethodRecord>> {
        Ok(self.state.read().await.payment_methods.get(id).cloned())
    }

    async fn list_payment_methods(
        &self,
        customer_id: &str,
    ) -> StoreResult<Vec<PaymentMethodRecord>> {
        let state = self.state.read().await;
        let methods = state
            .payment_methods
            .values()
            .filter(|m| m.customer_id == customer_id)
            .cloned()
            .collect();
        Ok(oldest_first(methods, |m| m.created_at))
    }

    async fn get_subscription(&self, id: &str) -> StoreResult<Option<SubscriptionRecord>> {
        Ok(self.state.read().await.subscriptions.get(id).cloned())
    }

    async fn find_subscription(
        &self,
        provider: ProviderId,
        provider_subscription_id: &str,
    ) -> StoreResult<Option<SubscriptionRecord>> {
        let state = self.state.read().await;
        Ok(state
            .subscriptions
            .values()
            .find(|s| s.provider == provider && s.provider_subscription_id == provider_subscription_id)
            .cloned())
    }

    async fn get_invoice(&self, id: &str) -> StoreResult<Option<Invoice>> {
        Ok(self.state.read().await.invoices.get(id).cloned())
    }

    async fn find_invoice(
        &self,
        provider: ProviderId,
        provider_reference: &str,
    ) -> StoreResult<Option<Invoice>> {
        let state = self.state.read().await;
        Ok(state
            .invoices
            .values()
            .find(|i| {
                i.provider == Some(provider)
                    && i.provider_reference.as_deref() == Some(provider_reference)
            })
            .cloned())
    }

    async fn get_deposit(&self, id: &str) -> StoreResult<Option<BankDeposit>> {
        Ok(self.state.read().await.deposits.get(id).cloned())
    }

    async fn list_deposits(&self, status: Option<DepositStatus>) -> StoreResult<Vec<BankDeposit>> {
        let state = self.state.read().await;
        let deposits = state
            .deposits
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect();
        Ok(oldest_first(deposits, |d| d.created_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Money;

    fn pending_event(event_id: &str) -> WebhookEventRecord {
        WebhookEventRecord::pending(
            ProviderId::Square,
            event_id,
            "payment.updated",
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        let invoice = Invoice::open("cus_1", Money::usd(1000));
        let invoice_id = invoice.id.clone();

        let result = store
            .apply(vec![
                Mutation::InsertInvoice(invoice),
                Mutation::UpdateInvoice {
                    id: "inv_missing".into(),
                    status: InvoiceStatus::Paid,
                    paid_at: Some(Utc::now()),
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert!(store.get_invoice(&invoice_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_failure_discards_staged_writes() {
        let store = MemoryStore::new();
        let invoice = Invoice::open("cus_1", Money::usd(1000));
        let id = invoice.id.clone();
        store.insert_invoice(invoice).await.unwrap();

        store.fail_next_apply(1, "disk full");
        let result = store
            .apply(vec![
                Mutation::UpdateInvoice {
                    id: id.clone(),
                    status: InvoiceStatus::Paid,
                    paid_at: Some(Utc::now()),
                },
                Mutation::UpdateInvoice {
                    id: id.clone(),
                    status: InvoiceStatus::Paid,
                    paid_at: None,
                },
            ])
            .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        let invoice = store.get_invoice(&id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Open);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let lease = Duration::minutes(5);

        let first = store.claim_webhook_event(pending_event("evt_1"), lease).await.unwrap();
        assert!(matches!(first, WebhookClaim::Acquired(_)));

        let second = store.claim_webhook_event(pending_event("evt_1"), lease).await.unwrap();
        assert!(matches!(second, WebhookClaim::InFlight(_)));

        store
            .apply(vec![Mutation::ReleaseWebhookEvent {
                provider: ProviderId::Square,
                event_id: "evt_1".into(),
            }])
            .await
            .unwrap();

        let third = store.claim_webhook_event(pending_event("evt_1"), lease).await.unwrap();
        match third {
            WebhookClaim::Acquired(record) => assert_eq!(record.attempts, 2),
            other => panic!("expected claim, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_recovered() {
        let store = MemoryStore::new();
        store
            .claim_webhook_event(pending_event("evt_2"), Duration::seconds(-1))
            .await
            .unwrap();

        let retry = store
            .claim_webhook_event(pending_event("evt_2"), Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(retry, WebhookClaim::Acquired(_)));
    }

    #[tokio::test]
    async fn test_processed_event_is_not_reclaimed() {
        let store = MemoryStore::new();
        store
            .claim_webhook_event(pending_event("evt_3"), Duration::minutes(5))
            .await
            .unwrap();
        store
            .apply(vec![Mutation::CompleteWebhookEvent {
                provider: ProviderId::Square,
                event_id: "evt_3".into(),
                status: WebhookStatus::Processed,
                error: None,
                at: Utc::now(),
            }])
            .await
            .unwrap();

        let again = store
            .claim_webhook_event(pending_event("evt_3"), Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(again, WebhookClaim::AlreadyProcessed(_)));
    }

    #[tokio::test]
    async fn test_failed_event_is_not_reclaimed() {
        let store = MemoryStore::new();
        store
            .claim_webhook_event(pending_event("evt_4"), Duration::minutes(5))
            .await
            .unwrap();
        store
            .apply(vec![Mutation::CompleteWebhookEvent {
                provider: ProviderId::Square,
                event_id: "evt_4".into(),
                status: WebhookStatus::Failed,
                error: Some("missing subscription reference".into()),
                at: Utc::now(),
            }])
            .await
            .unwrap();

        let again = store
            .claim_webhook_event(pending_event("evt_4"), Duration::minutes(5))
            .await
            .unwrap();
        match again {
            WebhookClaim::AlreadyFailed(record) => assert_eq!(record.attempts, 1),
            other => panic!("expected failed record, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrent_claims_yield_one_winner() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_webhook_event(pending_event("evt_race"), Duration::minutes(5))
                    .await
                    .unwrap()
            }));
        }

        let mut acquired = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), WebhookClaim::Acquired(_)) {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 1);
    }
}
