//! Saved payment methods.
//!
//! Account details are sealed before they reach the store and only the owning
//! adapter opens them again. Removal is a soft delete.

use crate::crypto::DetailsCipher;
use crate::error::{PaymentError, Result};
use crate::records::{Customer, PaymentMethodRecord};
use crate::store::{Mutation, RecordStore};
use crate::types::{ProviderId, SavedMethod};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Payment method to attach to a customer
#[derive(Debug, Clone)]
pub struct NewPaymentMethod {
    pub customer_id: String,
    pub provider: ProviderId,
    pub provider_customer_ref: Option<String>,
    /// Country the method was added from
    pub country: Option<String>,
    pub make_default: bool,
}

impl NewPaymentMethod {
    pub fn new(customer_id: impl Into<String>, provider: ProviderId) -> Self {
        Self {
            customer_id: customer_id.into(),
            provider,
            provider_customer_ref: None,
            country: None,
            make_default: false,
        }
    }

    /// With provider-side customer reference
    pub fn provider_customer(mut self, reference: impl Into<String>) -> Self {
        self.provider_customer_ref = Some(reference.into());
        self
    }

    /// With originating country
    pub fn country(mut self, country: impl Into<String>) -> Self {
        self.country = Some(country.into());
        self
    }

    /// Make this the customer's default method
    pub fn default_method(mut self) -> Self {
        self.make_default = true;
        self
    }
}

/// Payment method service
pub struct PaymentMethodService {
    store: Arc<dyn RecordStore>,
    cipher: DetailsCipher,
}

impl PaymentMethodService {
    pub fn new(store: Arc<dyn RecordStore>, cipher: DetailsCipher) -> Self {
        Self { store, cipher }
    }

    /// Seal the details and save the method.
    ///
    /// A customer's first active method becomes the default even when not
    /// requested. Unknown customers are registered in the same batch, and a
    /// method added without a country inherits the customer's.
    pub async fn attach<T: Serialize>(
        &self,
        method: NewPaymentMethod,
        details: &T,
    ) -> Result<PaymentMethodRecord> {
        if method.customer_id.trim().is_empty() {
            return Err(PaymentError::Validation("customer_id is required".into()));
        }
        let account_details = self.cipher.seal(details)?;

        let has_default = self
            .list_active(&method.customer_id)
            .await?
            .iter()
            .any(|m| m.is_default);

        let customer = self.store.get_customer(&method.customer_id).await?;
        let country = method
            .country
            .map(|country| country.trim().to_uppercase())
            .or_else(|| customer.as_ref().and_then(|c| c.country.clone()));

        let mut metadata = HashMap::new();
        if let Some(country) = &country {
            metadata.insert("country".to_string(), country.clone());
        }

        let record = PaymentMethodRecord {
            id: format!("pm_{}", Uuid::new_v4().simple()),
            customer_id: method.customer_id,
            provider: method.provider,
            provider_customer_ref: method.provider_customer_ref,
            account_details,
            is_default: method.make_default || !has_default,
            active: true,
            created_at: Utc::now(),
            metadata,
        };

        let mut batch = Vec::with_capacity(2);
        if customer.is_none() {
            batch.push(Mutation::InsertCustomer(Customer {
                id: record.customer_id.clone(),
                email: None,
                country,
                created_at: record.created_at,
            }));
        }
        batch.push(Mutation::SavePaymentMethod(record.clone()));
        self.store.apply(batch).await?;

        info!(
            customer_id = %record.customer_id,
            payment_method_id = %record.id,
            provider = %record.provider,
            is_default = record.is_default,
            "Payment method attached"
        );
        Ok(record)
    }

    /// Make an active method the customer's only default
    pub async fn set_default(&self, customer_id: &str, method_id: &str) -> Result<()> {
        self.owned_active(customer_id, method_id).await?;
        self.store
            .apply(vec![Mutation::SetDefaultPaymentMethod {
                customer_id: customer_id.to_string(),
                method_id: method_id.to_string(),
            }])
            .await?;
        info!(customer_id, payment_method_id = method_id, "Default payment method changed");
        Ok(())
    }

    /// Deactivate a method. The record is kept.
    pub async fn remove(&self, customer_id: &str, method_id: &str) -> Result<()> {
        self.owned_active(customer_id, method_id).await?;
        self.store
            .apply(vec![Mutation::DeactivatePaymentMethod {
                id: method_id.to_string(),
            }])
            .await?;
        info!(customer_id, payment_method_id = method_id, "Payment method removed");
        Ok(())
    }

    /// Active methods, oldest first
    pub async fn list_active(&self, customer_id: &str) -> Result<Vec<PaymentMethodRecord>> {
        Ok(self
            .store
            .list_payment_methods(customer_id)
            .await?
            .into_iter()
            .filter(|m| m.active)
            .collect())
    }

    /// Customer's default method, if any
    pub async fn default_method(&self, customer_id: &str) -> Result<Option<PaymentMethodRecord>> {
        Ok(self
            .list_active(customer_id)
            .await?
            .into_iter()
            .find(|m| m.is_default))
    }

    /// Sealed method ready to put on a [`crate::types::PaymentRequest`]
    pub async fn saved_method(&self, customer_id: &str, method_id: &str) -> Result<(ProviderId, SavedMethod)> {
        let record = self.owned_active(customer_id, method_id).await?;
        Ok((
            record.provider,
            SavedMethod {
                provider_customer_ref: record.provider_customer_ref,
                details: record.account_details,
            },
        ))
    }

    async fn owned_active(&self, customer_id: &str, method_id: &str) -> Result<PaymentMethodRecord> {
        self.store
            .get_payment_method(method_id)
            .await?
            .filter(|m| m.customer_id == customer_id && m.active)
            .ok_or_else(|| PaymentError::NotFound {
                entity: "payment method",
                id: method_id.to_string(),
            })
    }
}
