//! Payment provider abstraction.
//!
//! A [`PaymentProvider`] only talks to the provider: checkout sessions, customers, the billing
//! portal and webhook validation. Turning provider state into ledger entries and subscription
//! updates is shared across providers and lives in [`fulfilment`].

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::PaymentConfig;
use crate::db::errors::DbError;
use crate::types::{TenantId, UserId};

pub mod dummy;
pub mod fulfilment;
pub mod stripe;

/// Build the configured provider. Adding a provider means adding a match arm here.
pub fn create_provider(config: &PaymentConfig) -> anyhow::Result<Box<dyn PaymentProvider>> {
    Ok(match config {
        PaymentConfig::Stripe(stripe_config) => Box::new(self::stripe::StripeProvider::from(stripe_config.clone())),
        PaymentConfig::Dummy(dummy_config) => Box::new(dummy::DummyProvider::from(dummy_config.clone())),
    })
}

pub type Result<T> = std::result::Result<T, PaymentError>;

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("Payment provider API error: {0}")]
    ProviderApi(String),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Payment not completed yet")]
    PaymentNotCompleted,

    #[error("Invalid payment data: {0}")]
    InvalidData(String),

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(String),

    #[error("Tenant has no payment provider customer")]
    NoCustomerId,
}

impl From<::stripe::StripeError> for PaymentError {
    fn from(err: ::stripe::StripeError) -> Self {
        PaymentError::ProviderApi(err.to_string())
    }
}

impl From<sqlx::Error> for PaymentError {
    fn from(err: sqlx::Error) -> Self {
        PaymentError::Database(DbError::from(err))
    }
}

/// Who is paying, and where the provider should send them afterwards.
#[derive(Debug, Clone)]
pub struct CheckoutRequest<'a> {
    pub tenant_id: TenantId,
    pub user_id: UserId,
    pub email: &'a str,
    /// Existing provider customer; a new one is created by the provider when absent
    pub customer_id: Option<&'a str>,
    pub success_url: &'a str,
    pub cancel_url: &'a str,
}

/// What is being bought.
#[derive(Debug, Clone, Copy)]
pub enum CheckoutItem<'a> {
    /// One-off credit top-up paying `currency_units` of money
    Credits { currency_units: u32 },
    /// Recurring plan subscription
    Plan { plan_code: &'a str, price_id: &'a str },
}

#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub id: String,
    /// Where to send the user to pay
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionKind {
    CreditPurchase,
    Subscription { plan_code: Option<String> },
}

/// A checkout session as reported by the provider.
#[derive(Debug, Clone)]
pub struct PaymentSession {
    pub session_id: String,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    /// Amount paid in currency units
    pub amount: Decimal,
    pub is_paid: bool,
    pub kind: SessionKind,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
}

/// Subscription state pushed by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSubscription {
    pub subscription_id: String,
    pub customer_id: Option<String>,
    pub status: String,
    pub price_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

/// A paid subscription invoice. Credits follow the plan of the matching local subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderInvoice {
    pub invoice_id: String,
    pub customer_id: Option<String>,
    pub subscription_id: Option<String>,
    pub period_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookEvent {
    CheckoutCompleted { session_id: String },
    SubscriptionUpdated(ProviderSubscription),
    SubscriptionDeleted(ProviderSubscription),
    InvoicePaid(ProviderInvoice),
    Ignored { event_type: String },
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Create a customer record for a tenant and return its id.
    async fn create_customer(&self, tenant_id: TenantId, name: &str, email: &str) -> Result<String>;

    /// Create a hosted checkout session.
    async fn create_checkout_session(&self, request: &CheckoutRequest<'_>, item: CheckoutItem<'_>) -> Result<CheckoutSession>;

    /// Fetch a checkout session from the provider.
    async fn get_payment_session(&self, session_id: &str) -> Result<PaymentSession>;

    /// Verify a webhook delivery and decode it.
    ///
    /// Returns `None` for providers without webhooks.
    async fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>>;

    /// Create a self-service billing portal session and return its URL.
    async fn create_billing_portal_session(&self, customer_id: &str, return_url: &str) -> Result<String>;
}
