//! Provider-agnostic payment gateway for AGI subscriptions.
//!
//! Routes checkouts, payments, subscriptions and refunds to Square, PayPal or
//! manual bank deposits depending on where the customer is, and reconciles
//! provider webhooks into billing records exactly once.
//!
//! ## Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Payment Gateway                           │
//! │                                                                   │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                      PaymentManager                         │  │
//! │  │  eligibility (DO | US | intl) → provider → plan mapping     │  │
//! │  └────────────────────────────────────────────────────────────┘  │
//! │                              │                                    │
//! │          ┌───────────────────┼───────────────────┐                │
//! │          ▼                   ▼                   ▼                │
//! │   ┌────────────┐      ┌────────────┐      ┌──────────────┐       │
//! │   │   Square   │      │   PayPal   │      │ Bank deposit │       │
//! │   └────────────┘      └────────────┘      └──────────────┘       │
//! │          │                   │                   │                │
//! │          ▼                   ▼                   ▼                │
//! │  ┌────────────────────────────────┐   ┌────────────────────────┐ │
//! │  │  POST /webhooks/{provider}     │   │  BankDepositWorkflow   │ │
//! │  │  verify → claim → reconcile    │   │  declare → verify      │ │
//! │  └────────────────────────────────┘   └────────────────────────┘ │
//! │                  │                               │                │
//! │                  └──────────────┬────────────────┘                │
//! │                                 ▼                                 │
//! │               RecordStore (atomic mutation batches)               │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use agi_payments::{PaymentManager, PaymentsConfig, CheckoutRequest, Currency};
//! use rust_decimal::Decimal;
//!
//! let config = PaymentsConfig::from_env()?;
//! let manager = PaymentManager::initialize(&config).await;
//!
//! let provider = manager.recommend_payment_method(
//!     Decimal::new(100, 0),
//!     Currency::USD,
//!     Some("DO"),
//!     None,
//! )?;
//!
//! let session = manager
//!     .create_checkout(
//!         provider,
//!         CheckoutRequest::new(Decimal::new(100, 0), Currency::USD, "cus_1", "Professional plan")
//!             .country("DO"),
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod crypto;
pub mod deposit;
pub mod eligibility;
pub mod error;
pub mod ingress;
pub mod manager;
pub mod money;
pub mod payment_methods;
pub mod plans;
pub mod provider;
pub mod reconciler;
pub mod records;
pub mod store;
pub mod types;
pub mod webhook;

pub mod providers;

pub use config::{BankAccount, ConfigError, Environment, PayPalConfig, PaymentsConfig, SquareConfig};
pub use crypto::{DetailsCipher, SealedDetails};
pub use deposit::{BankDepositWorkflow, DepositDeclaration};
pub use error::*;
pub use ingress::{GatewayState, router};
pub use manager::PaymentManager;
pub use money::*;
pub use payment_methods::{NewPaymentMethod, PaymentMethodService};
pub use plans::PlanCatalog;
pub use provider::*;
pub use providers::{BankDepositProvider, PayPalProvider, SquareProvider};
pub use reconciler::{ReconcileOutcome, WebhookReconciler};
pub use records::*;
pub use store::{MemoryStore, Mutation, RecordStore, StoreError, WebhookClaim};
pub use types::*;
pub use webhook::*;
