//! Manual bank deposit verification.
//!
//! Customers declare a transfer, optionally attach a receipt, and an operator
//! approves or rejects it exactly once. Approval settles the linked invoice in
//! the same store batch as the deposit update.

use crate::error::{PaymentError, Result};
use crate::money::Money;
use crate::records::{BankDeposit, DepositStatus, InvoiceStatus};
use crate::store::{Mutation, RecordStore};
use crate::types::ProviderId;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Customer's declaration of a transfer they made
#[derive(Debug, Clone)]
pub struct DepositDeclaration {
    pub customer_id: String,
    /// Invoice the deposit pays; looked up by reference code when absent
    pub invoice_id: Option<String>,
    pub amount: Money,
    pub bank_name: String,
    /// Originating account number; only the last four digits are kept
    pub account_number: String,
    pub reference_code: String,
    pub metadata: HashMap<String, String>,
}

impl DepositDeclaration {
    pub fn new(
        customer_id: impl Into<String>,
        amount: Money,
        bank_name: impl Into<String>,
        account_number: impl Into<String>,
        reference_code: impl Into<String>,
    ) -> Self {
        Self {
            customer_id: customer_id.into(),
            invoice_id: None,
            amount,
            bank_name: bank_name.into(),
            account_number: account_number.into(),
            reference_code: reference_code.into(),
            metadata: HashMap::new(),
        }
    }

    /// Link to an invoice
    pub fn invoice(mut self, invoice_id: impl Into<String>) -> Self {
        self.invoice_id = Some(invoice_id.into());
        self
    }

    /// With metadata
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Last four digits of an account number
fn last_four(account_number: &str) -> Result<String> {
    let digits: Vec<char> = account_number.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() < 4 {
        return Err(PaymentError::Validation(
            "account number must contain at least 4 digits".into(),
        ));
    }
    Ok(digits[digits.len() - 4..].iter().collect())
}

fn required(field: &str, value: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PaymentError::Validation(format!("{} is required", field)));
    }
    Ok(value.to_string())
}

/// Bank deposit workflow
pub struct BankDepositWorkflow {
    store: Arc<dyn RecordStore>,
}

impl BankDepositWorkflow {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Record a declared deposit as pending
    pub async fn declare(&self, declaration: DepositDeclaration) -> Result<BankDeposit> {
        if declaration.amount.amount <= 0 {
            return Err(PaymentError::InvalidAmount(format!(
                "deposit amount must be positive, got {}",
                declaration.amount
            )));
        }
        let customer_id = required("customer_id", &declaration.customer_id)?;
        let reference_code = required("reference_code", &declaration.reference_code)?;
        let bank_name = required("bank_name", &declaration.bank_name)?;
        let account_last4 = last_four(&declaration.account_number)?;

        let invoice = match declaration.invoice_id {
            Some(id) => Some(self.store.get_invoice(&id).await?.ok_or(PaymentError::NotFound {
                entity: "invoice",
                id,
            })?),
            None => {
                self.store
                    .find_invoice(ProviderId::BankDeposit, &reference_code)
                    .await?
            }
        };
        if let Some(invoice) = invoice.as_ref().filter(|i| i.customer_id != customer_id) {
            warn!(
                customer_id = %customer_id,
                invoice_id = %invoice.id,
                "Deposit declared against another customer's invoice"
            );
            return Err(PaymentError::Validation(format!(
                "invoice {} does not belong to customer {}",
                invoice.id, customer_id
            )));
        }
        let invoice_id = invoice.map(|invoice| invoice.id);

        let deposit = BankDeposit {
            id: format!("dep_{}", Uuid::new_v4().simple()),
            customer_id,
            invoice_id,
            amount: declaration.amount,
            bank_name,
            account_last4,
            reference_code,
            receipt_reference: None,
            status: DepositStatus::Pending,
            verified_by: None,
            verified_at: None,
            rejection_reason: None,
            metadata: declaration.metadata,
            created_at: Utc::now(),
        };

        self.store
            .apply(vec![Mutation::InsertDeposit(deposit.clone())])
            .await?;

        info!(
            deposit_id = %deposit.id,
            customer_id = %deposit.customer_id,
            amount = %deposit.amount,
            reference = %deposit.reference_code,
            "Bank deposit declared"
        );
        Ok(deposit)
    }

    /// Attach a receipt to a pending deposit
    pub async fn upload_receipt(&self, deposit_id: &str, receipt_reference: &str) -> Result<BankDeposit> {
        let receipt_reference = required("receipt_reference", receipt_reference)?;
        let mut deposit = self.pending_deposit(deposit_id).await?;

        deposit.receipt_reference = Some(receipt_reference.clone());
        deposit
            .metadata
            .insert("receipt_reference".into(), receipt_reference);
        deposit
            .metadata
            .insert("receipt_uploaded_at".into(), Utc::now().to_rfc3339());

        self.store
            .apply(vec![Mutation::UpdateDeposit(deposit.clone())])
            .await?;

        info!(deposit_id = %deposit.id, "Bank deposit receipt uploaded");
        Ok(deposit)
    }

    /// Approve or reject a pending deposit. A deposit is reviewed once.
    pub async fn verify(
        &self,
        deposit_id: &str,
        verifier: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> Result<BankDeposit> {
        let verifier = required("verifier", verifier)?;
        let mut deposit = self.pending_deposit(deposit_id).await?;
        let now = Utc::now();

        deposit.verified_by = Some(verifier);
        deposit.verified_at = Some(now);

        let mut batch = Vec::with_capacity(2);
        if approved {
            deposit.status = DepositStatus::Verified;
            if let Some(invoice_id) = &deposit.invoice_id {
                batch.push(Mutation::UpdateInvoice {
                    id: invoice_id.clone(),
                    status: InvoiceStatus::Paid,
                    paid_at: Some(now),
                });
            }
        } else {
            let reason = reason.map(str::trim).filter(|r| !r.is_empty()).ok_or_else(|| {
                PaymentError::Validation("a reason is required to reject a deposit".into())
            })?;
            deposit.status = DepositStatus::Rejected;
            deposit.rejection_reason = Some(reason.to_string());
        }
        batch.insert(0, Mutation::UpdateDeposit(deposit.clone()));

        self.store.apply(batch).await?;

        if approved {
            info!(
                deposit_id = %deposit.id,
                invoice_id = ?deposit.invoice_id,
                verified_by = ?deposit.verified_by,
                "Bank deposit verified"
            );
        } else {
            warn!(
                deposit_id = %deposit.id,
                verified_by = ?deposit.verified_by,
                "Bank deposit rejected"
            );
        }
        Ok(deposit)
    }

    /// Deposits awaiting review, oldest first
    pub async fn pending(&self) -> Result<Vec<BankDeposit>> {
        Ok(self.store.list_deposits(Some(DepositStatus::Pending)).await?)
    }

    /// Look up a deposit
    pub async fn get(&self, deposit_id: &str) -> Result<BankDeposit> {
        self.store
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| PaymentError::NotFound {
                entity: "bank deposit",
                id: deposit_id.to_string(),
            })
    }

    async fn pending_deposit(&self, deposit_id: &str) -> Result<BankDeposit> {
        let deposit = self.get(deposit_id).await?;
        if deposit.status.is_terminal() {
            return Err(PaymentError::AlreadyFinalized {
                deposit_id: deposit.id,
                status: deposit.status,
            });
        }
        Ok(deposit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::Invoice;
    use crate::store::MemoryStore;

    fn declaration() -> DepositDeclaration {
        DepositDeclaration::new(
            "cus_1",
            Money::dop(500_000),
            "Banco Popular",
            "800-123-4567",
            "AGI-M1ABCD-X1Y2Z3",
        )
    }

    #[tokio::test]
    async fn test_declare_keeps_last_four_digits() {
        let store = Arc::new(MemoryStore::new());
        let workflow = BankDepositWorkflow::new(store);

        let deposit = workflow.declare(declaration()).await.unwrap();
        assert_eq!(deposit.account_last4, "4567");
        assert_eq!(deposit.status, DepositStatus::Pending);
        assert_eq!(workflow.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_declare_requires_reference() {
        let workflow = BankDepositWorkflow::new(Arc::new(MemoryStore::new()));
        let mut missing = declaration();
        missing.reference_code = "  ".into();
        assert!(matches!(
            workflow.declare(missing).await,
            Err(PaymentError::Validation(_))
        ));

        let mut short = declaration();
        short.account_number = "12".into();
        assert!(matches!(
            workflow.declare(short).await,
            Err(PaymentError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_declare_links_invoice_by_reference() {
        let store = Arc::new(MemoryStore::new());
        let invoice = Invoice::open("cus_1", Money::dop(500_000))
            .settled_by(ProviderId::BankDeposit, "AGI-M1ABCD-X1Y2Z3");
        store.insert_invoice(invoice.clone()).await.unwrap();

        let workflow = BankDepositWorkflow::new(store);
        let deposit = workflow.declare(declaration()).await.unwrap();
        assert_eq!(deposit.invoice_id, Some(invoice.id));
    }

    #[tokio::test]
    async fn test_declare_rejects_unknown_invoice() {
        let store = Arc::new(MemoryStore::new());
        let workflow = BankDepositWorkflow::new(store);

        let err = workflow
            .declare(declaration().invoice("inv_missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound { entity: "invoice", .. }));
        assert!(workflow.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_declare_rejects_other_customers_invoice() {
        let store = Arc::new(MemoryStore::new());
        let invoice = Invoice::open("cus_2", Money::dop(500_000))
            .settled_by(ProviderId::BankDeposit, "AGI-M1ABCD-X1Y2Z3");
        store.insert_invoice(invoice.clone()).await.unwrap();
        let workflow = BankDepositWorkflow::new(store.clone());

        let err = workflow
            .declare(declaration().invoice(invoice.id.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));

        let err = workflow.declare(declaration()).await.unwrap_err();
        assert!(matches!(err, PaymentError::Validation(_)));

        assert!(workflow.pending().await.unwrap().is_empty());
        assert_eq!(
            store.get_invoice(&invoice.id).await.unwrap().unwrap().status,
            InvoiceStatus::Open
        );
    }

    #[tokio::test]
    async fn test_upload_receipt() {
        let workflow = BankDepositWorkflow::new(Arc::new(MemoryStore::new()));
        let deposit = workflow.declare(declaration()).await.unwrap();

        let updated = workflow.upload_receipt(&deposit.id, "receipts/123.pdf").await.unwrap();
        assert_eq!(updated.status, DepositStatus::Pending);
        assert_eq!(updated.receipt_reference.as_deref(), Some("receipts/123.pdf"));
        assert!(updated.metadata.contains_key("receipt_uploaded_at"));
        assert_eq!(
            updated.metadata.get("receipt_reference").map(String::as_str),
            Some("receipts/123.pdf")
        );
    }

    #[tokio::test]
    async fn test_rejection_requires_reason() {
        let workflow = BankDepositWorkflow::new(Arc::new(MemoryStore::new()));
        let deposit = workflow.declare(declaration()).await.unwrap();

        for reason in [None, Some(""), Some("   ")] {
            assert!(matches!(
                workflow.verify(&deposit.id, "admin@agi", false, reason).await,
                Err(PaymentError::Validation(_))
            ));
        }
        assert_eq!(workflow.get(&deposit.id).await.unwrap().status, DepositStatus::Pending);

        let rejected = workflow
            .verify(&deposit.id, "admin@agi", false, Some("Amount does not match"))
            .await
            .unwrap();
        assert_eq!(rejected.status, DepositStatus::Rejected);
        assert_eq!(rejected.customer_message(), Some("Amount does not match"));
    }

    #[tokio::test]
    async fn test_terminal_deposit_cannot_change() {
        let workflow = BankDepositWorkflow::new(Arc::new(MemoryStore::new()));
        let deposit = workflow.declare(declaration()).await.unwrap();
        let verified = workflow.verify(&deposit.id, "admin@agi", true, None).await.unwrap();

        let err = workflow
            .verify(&deposit.id, "other@agi", false, Some("late"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PaymentError::AlreadyFinalized { status: DepositStatus::Verified, .. }
        ));
        assert!(matches!(
            workflow.upload_receipt(&deposit.id, "r.pdf").await,
            Err(PaymentError::AlreadyFinalized { .. })
        ));

        let current = workflow.get(&deposit.id).await.unwrap();
        assert_eq!(current.verified_by, verified.verified_by);
        assert!(workflow.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_approval_is_atomic_with_invoice() {
        let store = Arc::new(MemoryStore::new());
        let invoice = Invoice::open("cus_1", Money::dop(500_000));
        store.insert_invoice(invoice.clone()).await.unwrap();
        let workflow = BankDepositWorkflow::new(store.clone());
        let deposit = workflow
            .declare(declaration().invoice(invoice.id.clone()))
            .await
            .unwrap();

        store.fail_next_apply(1, "connection reset");
        assert!(workflow.verify(&deposit.id, "admin@agi", true, None).await.is_err());
        assert_eq!(workflow.get(&deposit.id).await.unwrap().status, DepositStatus::Pending);
        assert_eq!(
            store.get_invoice(&invoice.id).await.unwrap().unwrap().status,
            InvoiceStatus::Open
        );

        let verified = workflow.verify(&deposit.id, "admin@agi", true, None).await.unwrap();
        assert_eq!(verified.status, DepositStatus::Verified);
        assert!(verified.verified_at.is_some());
        let paid = store.get_invoice(&invoice.id).await.unwrap().unwrap();
        assert_eq!(paid.status, InvoiceStatus::Paid);
        assert!(paid.paid_at.is_some());
    }

    #[tokio::test]
    async fn test_unknown_deposit() {
        let workflow = BankDepositWorkflow::new(Arc::new(MemoryStore::new()));
        assert!(matches!(
            workflow.verify("dep_missing", "admin@agi", true, None).await,
            Err(PaymentError::NotFound { .. })
        ));
    }
}
