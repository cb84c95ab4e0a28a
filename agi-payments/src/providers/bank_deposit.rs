//! Manual bank deposit provider.
//!
//! Nothing here talks to a remote service. Checkout produces deposit
//! instructions; settlement happens later when an operator verifies the
//! customer's declared deposit.

use crate::{
    config::BankAccount,
    error::{PaymentError, Result},
    money::Money,
    provider::PaymentProvider,
    types::*,
    webhook::WebhookResult,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

/// Days the customer has to make the deposit
pub const DEPOSIT_DUE_DAYS: i64 = 3;

/// Prefix of every deposit reference code
pub const REFERENCE_PREFIX: &str = "AGI";

const ID: ProviderId = ProviderId::BankDeposit;
/// Crockford base32 alphabet, without I, L, O or U
const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Bank deposit provider
pub struct BankDepositProvider {
    accounts: Vec<BankAccount>,
}

impl BankDepositProvider {
    /// Create from the configured accounts
    pub fn new(accounts: Vec<BankAccount>) -> Self {
        Self { accounts }
    }

    /// First active account for the currency of `amount`
    fn account_for(&self, amount: &Money) -> Result<&BankAccount> {
        self.accounts
            .iter()
            .find(|a| a.active && a.currency == amount.currency)
            .ok_or(PaymentError::NoActiveAccount(amount.currency))
    }

    fn instructions(
        &self,
        account: &BankAccount,
        amount: Money,
        locale: Locale,
        now: DateTime<Utc>,
    ) -> DepositInstructions {
        let reference_code = generate_reference_code(now);
        let due_date = now + Duration::days(DEPOSIT_DUE_DAYS);
        let masked_account = mask_account(&account.account_number);
        let message = instruction_message(
            locale,
            account,
            &masked_account,
            &amount,
            &reference_code,
            due_date,
        );

        DepositInstructions {
            bank_name: account.bank_name.clone(),
            account_holder: account.account_holder.clone(),
            tax_id: account.tax_id.clone(),
            masked_account,
            account_type: account.account_type.clone(),
            amount,
            reference_code,
            due_date,
            message,
        }
    }
}

#[async_trait]
impl PaymentProvider for BankDepositProvider {
    fn id(&self) -> ProviderId {
        ID
    }

    async fn initialize(&self) -> Result<()> {
        if !self.accounts.iter().any(|a| a.active) {
            return Err(PaymentError::ProviderInit {
                provider: ID,
                message: "no active bank account configured".into(),
            });
        }
        Ok(())
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> Result<CheckoutSession> {
        request.validate()?;
        let amount = request.money()?;
        let account = self.account_for(&amount)?;
        let now = Utc::now();
        let instructions = self.instructions(account, amount, request.locale, now);

        info!(
            provider = %ID,
            customer_id = %request.customer_id,
            reference = %instructions.reference_code,
            amount = %amount,
            "Issued bank deposit instructions"
        );

        Ok(CheckoutSession {
            checkout_id: instructions.reference_code.clone(),
            provider: ID,
            checkout_url: None,
            order_reference: Some(instructions.reference_code.clone()),
            status: CheckoutStatus::Pending,
            amount,
            customer_id: request.customer_id,
            description: request.description,
            return_url: request.return_url,
            cancel_url: request.cancel_url,
            deposit_instructions: Some(instructions),
            created_at: now,
        })
    }

    async fn process_payment(&self, request: PaymentRequest) -> Result<PaymentResult> {
        request.validate()?;
        let amount = request.money()?;
        self.account_for(&amount)?;

        // Settles only when an operator verifies the deposit
        let payment_id = request
            .payment_method_id
            .or(request.reference)
            .unwrap_or_else(|| generate_reference_code(Utc::now()));
        Ok(PaymentResult::new(ID, payment_id, PaymentStatus::Pending, amount))
    }

    async fn handle_webhook(&self, _payload: &[u8], _signature: &str) -> Result<WebhookResult> {
        Ok(WebhookResult::unsupported())
    }

    async fn create_subscription(&self, request: SubscriptionRequest) -> Result<Subscription> {
        Ok(Subscription {
            id: format!("bd_sub_{}", Uuid::new_v4().simple()),
            provider: ID,
            status: SubscriptionStatus::RequiresPaymentMethod,
            approval_url: None,
            current_period_end: None,
            plan_id: request.plan_id,
        })
    }

    async fn cancel_subscription(&self, subscription_id: &str) -> Result<bool> {
        warn!(
            provider = %ID,
            subscription_id = %subscription_id,
            "Manual action required: stop expecting deposits for canceled subscription"
        );
        Ok(true)
    }

    async fn refund(&self, payment_id: &str, amount: Option<Money>) -> Result<RefundResult> {
        warn!(
            provider = %ID,
            payment_id = %payment_id,
            amount = ?amount.map(|a| a.format()),
            "Manual action required: refund must be transferred by an operator"
        );
        Ok(RefundResult {
            refund_id: None,
            payment_id: payment_id.to_string(),
            provider: ID,
            amount,
            status: RefundStatus::ManualActionRequired,
        })
    }

    async fn payment_status(&self, _payment_id: &str) -> Result<PaymentStatus> {
        Ok(PaymentStatus::Pending)
    }
}

/// `AGI-<base32 millis>-<6 random base32 chars>`, uppercase Crockford alphabet
pub fn generate_reference_code(now: DateTime<Utc>) -> String {
    let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();
    format!("{}-{}-{}", REFERENCE_PREFIX, encode(millis), suffix)
}

fn encode(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(ALPHABET[(value % 32) as usize]);
        value /= 32;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

/// Hide all but the last four characters, e.g. `****6789`
pub fn mask_account(account_number: &str) -> String {
    let visible: Vec<char> = account_number
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let tail: String = visible[visible.len().saturating_sub(4)..].iter().collect();
    format!("****{}", tail)
}

fn instruction_message(
    locale: Locale,
    account: &BankAccount,
    masked_account: &str,
    amount: &Money,
    reference_code: &str,
    due_date: DateTime<Utc>,
) -> String {
    let amount = amount.format_grouped();
    let due = due_date.format("%d/%m/%Y");
    let account_type = account.account_type.as_deref();

    match locale {
        Locale::Es => format!(
            "Realice un depósito o transferencia de {amount} a la cuenta {kind}{masked} de {bank} \
             a nombre de {holder} (RNC {tax_id}). Incluya la referencia {reference} en la \
             descripción de la transacción antes del {due}. Luego suba su comprobante para que \
             podamos verificar el pago.",
            kind = account_type.map(|t| format!("{} ", t)).unwrap_or_default(),
            masked = masked_account,
            bank = account.bank_name,
            holder = account.account_holder,
            tax_id = account.tax_id,
            reference = reference_code,
        ),
        Locale::En => format!(
            "Deposit or transfer {amount} to {bank} {kind}account {masked} held by {holder} \
             (tax ID {tax_id}). Include the reference {reference} in the transaction \
             description before {due}. Then upload your receipt so we can verify the payment.",
            kind = account_type.map(|t| format!("{} ", t)).unwrap_or_default(),
            masked = masked_account,
            bank = account.bank_name,
            holder = account.account_holder,
            tax_id = account.tax_id,
            reference = reference_code,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Currency;
    use rust_decimal::Decimal;
    use std::collections::HashSet;

    fn provider() -> BankDepositProvider {
        let mut dop = BankAccount::new(
            "Banco Popular Dominicano",
            "800-123456789",
            "AGI Software SRL",
            "1-31-12345-6",
            Currency::DOP,
        );
        dop.account_type = Some("corriente".into());
        let mut inactive_usd = BankAccount::new("Banreservas", "9600001111", "AGI Software SRL", "1-31-12345-6", Currency::USD);
        inactive_usd.active = false;
        let usd = BankAccount::new("Banreservas", "9600005678", "AGI Software SRL", "1-31-12345-6", Currency::USD);
        BankDepositProvider::new(vec![dop, inactive_usd, usd])
    }

    fn is_reference_code(code: &str) -> bool {
        let parts: Vec<&str> = code.split('-').collect();
        parts.len() == 3
            && parts[0] == REFERENCE_PREFIX
            && parts[1..].iter().all(|p| {
                !p.is_empty() && p.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
            })
            && parts[2].len() == 6
    }

    #[test]
    fn test_reference_code_format() {
        let code = generate_reference_code(Utc::now());
        assert!(is_reference_code(&code), "unexpected code {}", code);
    }

    #[test]
    fn test_reference_codes_are_unique() {
        let now = Utc::now();
        let codes: HashSet<String> = (0..500).map(|_| generate_reference_code(now)).collect();
        assert_eq!(codes.len(), 500);
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode(0), "0");
        assert_eq!(encode(18), "J");
        assert_eq!(encode(31), "Z");
        assert_eq!(encode(32), "10");
    }

    #[test]
    fn test_reference_codes_avoid_ambiguous_characters() {
        let now = Utc::now();
        for _ in 0..200 {
            let code = generate_reference_code(now);
            let body = &code[REFERENCE_PREFIX.len()..];
            assert!(
                !body.chars().any(|c| matches!(c, 'I' | 'L' | 'O' | 'U')),
                "ambiguous character in {}",
                code
            );
        }
    }

    #[test]
    fn test_mask_account() {
        assert_eq!(mask_account("800-123456789"), "****6789");
        assert_eq!(mask_account("12"), "****12");
    }

    #[tokio::test]
    async fn test_checkout_uses_first_active_account_for_currency() {
        let session = provider()
            .create_checkout(
                CheckoutRequest::new(Decimal::new(100, 0), Currency::USD, "cus_1", "Starter")
                    .locale(Locale::En),
            )
            .await
            .unwrap();

        let instructions = session.deposit_instructions.unwrap();
        assert_eq!(instructions.masked_account, "****5678");
        assert_eq!(instructions.amount, Money::usd(10_000));
        assert!(instructions.message.contains("US$100.00"));
        assert!(instructions.message.contains(&instructions.reference_code));
        assert!(instructions.message.contains("****5678"));
        assert_eq!(session.checkout_id, instructions.reference_code);
        assert!(session.checkout_url.is_none());
    }

    #[tokio::test]
    async fn test_spanish_instructions_by_default() {
        let before = Utc::now();
        let session = provider()
            .create_checkout(CheckoutRequest::new(
                Decimal::new(5000, 0),
                Currency::DOP,
                "cus_1",
                "Plan Profesional",
            ))
            .await
            .unwrap();

        let instructions = session.deposit_instructions.unwrap();
        assert!(instructions.message.starts_with("Realice un depósito"));
        assert!(instructions.message.contains("RD$5,000.00"));
        assert!(instructions.message.contains("corriente ****6789"));
        assert!(instructions.message.contains("RNC 1-31-12345-6"));

        let due_in = instructions.due_date - before;
        assert!(due_in >= Duration::days(3) && due_in < Duration::days(3) + Duration::minutes(1));
    }

    #[tokio::test]
    async fn test_no_account_for_currency() {
        let err = provider()
            .create_checkout(CheckoutRequest::new(Decimal::ONE, Currency::EUR, "cus_1", "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NoActiveAccount(Currency::EUR)));
    }

    #[tokio::test]
    async fn test_no_money_moves() {
        let bank = provider();
        assert!(!bank.handle_webhook(b"{}", "").await.unwrap().received);
        assert_eq!(bank.payment_status("AGI-X-Y").await.unwrap(), PaymentStatus::Pending);

        let refund = bank.refund("AGI-X-Y", Some(Money::dop(100))).await.unwrap();
        assert_eq!(refund.status, RefundStatus::ManualActionRequired);
        assert!(refund.refund_id.is_none());

        let sub = bank
            .create_subscription(SubscriptionRequest::new("cus_1", "starter"))
            .await
            .unwrap();
        assert!(sub.id.starts_with("bd_sub_"));
        assert_eq!(sub.status, SubscriptionStatus::RequiresPaymentMethod);
        assert!(bank.cancel_subscription(&sub.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_initialize_requires_active_account() {
        assert!(provider().initialize().await.is_ok());
        let mut account = BankAccount::new("Banco", "123", "Holder", "RNC", Currency::DOP);
        account.active = false;
        let err = BankDepositProvider::new(vec![account]).initialize().await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderInit { .. }));
    }
}
