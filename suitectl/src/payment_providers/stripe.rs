//! Stripe payment provider implementation

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use stripe::Client;
use stripe_billing::billing_portal_session::CreateBillingPortalSession;
use stripe_checkout::checkout_session::{
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData, RetrieveCheckoutSession,
};
use stripe_checkout::{CheckoutSessionId, CheckoutSessionMode, CheckoutSessionPaymentStatus, CheckoutSessionStatus};
use stripe_core::customer::CreateCustomer;
use stripe_webhook::{EventObject, Webhook, WebhookError};
use tracing::{debug, instrument};

use crate::config::StripeConfig;
use crate::payment_providers::{
    CheckoutItem, CheckoutRequest, CheckoutSession, PaymentError, PaymentProvider, PaymentSession, ProviderInvoice,
    ProviderSubscription, Result, SessionKind, WebhookEvent,
};
use crate::types::TenantId;

/// Stripe payment provider
pub struct StripeProvider {
    api_key: String,
    credits_price_id: String,
    webhook_secret: String,
}

impl From<StripeConfig> for StripeProvider {
    fn from(config: StripeConfig) -> Self {
        Self {
            api_key: config.api_key,
            credits_price_id: config.credits_price_id,
            webhook_secret: config.webhook_secret,
        }
    }
}

impl StripeProvider {
    fn client(&self) -> Client {
        Client::new(&self.api_key)
    }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn tenant_metadata(tenant_id: TenantId) -> HashMap<String, String> {
    HashMap::from([("tenant_id".to_string(), tenant_id.to_string())])
}

fn parse_tenant_id(raw: Option<&String>) -> Option<TenantId> {
    raw.and_then(|s| s.parse().ok())
}

fn subscription_state(sub: stripe_shared::Subscription) -> ProviderSubscription {
    let first_item = sub.items.data.first();
    ProviderSubscription {
        subscription_id: sub.id.to_string(),
        customer_id: Some(sub.customer.id().to_string()),
        status: sub.status.as_str().to_string(),
        price_id: first_item.map(|item| item.price.id.to_string()),
        tenant_id: parse_tenant_id(sub.metadata.get("tenant_id")),
        current_period_start: first_item.and_then(|item| timestamp(item.current_period_start)),
        current_period_end: first_item.and_then(|item| timestamp(item.current_period_end)),
        canceled_at: sub.canceled_at.and_then(timestamp),
    }
}

fn paid_invoice(invoice: stripe_shared::Invoice) -> Result<ProviderInvoice> {
    let invoice_id = invoice
        .id
        .ok_or_else(|| PaymentError::InvalidData("paid invoice has no id".to_string()))?;
    let subscription_id = invoice
        .parent
        .and_then(|parent| parent.subscription_details)
        .map(|details| details.subscription.id().to_string());
    let period_end = invoice
        .lines
        .data
        .first()
        .map(|line| line.period.end)
        .unwrap_or(invoice.period_end);

    Ok(ProviderInvoice {
        invoice_id: invoice_id.to_string(),
        customer_id: invoice.customer.map(|customer| customer.id().to_string()),
        subscription_id,
        period_end: timestamp(period_end),
    })
}

fn webhook_error(err: WebhookError) -> PaymentError {
    tracing::error!("Failed to construct webhook event: {:?}", err);
    match err {
        WebhookError::BadParse(_) => PaymentError::InvalidData(format!("Webhook payload could not be decoded: {err}")),
        other => PaymentError::InvalidSignature(other.to_string()),
    }
}

#[async_trait]
impl PaymentProvider for StripeProvider {
    #[instrument(skip(self, name, email), err)]
    async fn create_customer(&self, tenant_id: TenantId, name: &str, email: &str) -> Result<String> {
        let customer = CreateCustomer::new()
            .name(name)
            .email(email)
            .metadata(tenant_metadata(tenant_id))
            .send(&self.client())
            .await?;
        Ok(customer.id.to_string())
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id), err)]
    async fn create_checkout_session(&self, request: &CheckoutRequest<'_>, item: CheckoutItem<'_>) -> Result<CheckoutSession> {
        let mut metadata = tenant_metadata(request.tenant_id);
        metadata.insert("user_id".to_string(), request.user_id.to_string());

        let mut params = CreateCheckoutSession::new()
            .success_url(request.success_url)
            .cancel_url(request.cancel_url)
            .client_reference_id(request.tenant_id.to_string());

        params = match item {
            CheckoutItem::Credits { currency_units } => params.mode(CheckoutSessionMode::Payment).line_items(vec![CreateCheckoutSessionLineItems {
                price: Some(self.credits_price_id.clone()),
                quantity: Some(u64::from(currency_units)),
                ..Default::default()
            }]),
            CheckoutItem::Plan { plan_code, price_id } => {
                metadata.insert("plan_code".to_string(), plan_code.to_string());
                let mut subscription_data = CreateCheckoutSessionSubscriptionData::new();
                subscription_data.metadata = Some(tenant_metadata(request.tenant_id));
                params
                    .mode(CheckoutSessionMode::Subscription)
                    .line_items(vec![CreateCheckoutSessionLineItems {
                        price: Some(price_id.to_string()),
                        quantity: Some(1),
                        ..Default::default()
                    }])
                    .subscription_data(subscription_data)
            }
        };

        params = match request.customer_id {
            Some(customer) => params.customer(customer),
            None => params.customer_email(request.email),
        };

        let session = params.metadata(metadata).send(&self.client()).await.map_err(|e| {
            tracing::error!("Failed to create Stripe checkout session: {:?}", e);
            PaymentError::from(e)
        })?;
        debug!(session_id = %session.id, "Created Stripe checkout session");

        let url = session.url.ok_or_else(|| {
            tracing::error!("Checkout session missing URL");
            PaymentError::ProviderApi("Checkout session missing URL".to_string())
        })?;
        Ok(CheckoutSession {
            id: session.id.to_string(),
            url,
        })
    }

    #[instrument(skip(self), err)]
    async fn get_payment_session(&self, session_id: &str) -> Result<PaymentSession> {
        if !session_id.starts_with("cs_") {
            return Err(PaymentError::InvalidData("Invalid Stripe session ID".to_string()));
        }
        let id: CheckoutSessionId = session_id
            .parse()
            .map_err(|_| PaymentError::InvalidData("Invalid Stripe session ID".to_string()))?;

        let session = RetrieveCheckoutSession::new(id).send(&self.client()).await.map_err(|e| {
            tracing::error!("Failed to retrieve Stripe checkout session: {:?}", e);
            PaymentError::from(e)
        })?;

        let metadata = session.metadata.unwrap_or_default();
        let tenant_id = parse_tenant_id(session.client_reference_id.as_ref())
            .or_else(|| parse_tenant_id(metadata.get("tenant_id")))
            .ok_or_else(|| PaymentError::InvalidData("Checkout session has no tenant reference".to_string()))?;

        let kind = match session.mode {
            CheckoutSessionMode::Subscription => SessionKind::Subscription {
                plan_code: metadata.get("plan_code").cloned(),
            },
            _ => SessionKind::CreditPurchase,
        };

        Ok(PaymentSession {
            session_id: session.id.to_string(),
            tenant_id,
            user_id: metadata.get("user_id").and_then(|s| s.parse().ok()),
            // Stripe reports minor units
            amount: Decimal::new(session.amount_total.unwrap_or(0), 2),
            is_paid: session.status == Some(CheckoutSessionStatus::Complete)
                && session.payment_status != CheckoutSessionPaymentStatus::Unpaid,
            kind,
            customer_id: session.customer.as_ref().map(|c| c.id().to_string()),
            subscription_id: session.subscription.as_ref().map(|s| s.id().to_string()),
        })
    }

    async fn validate_webhook(&self, headers: &HeaderMap, body: &str) -> Result<Option<WebhookEvent>> {
        let signature = headers
            .get("stripe-signature")
            .ok_or_else(|| {
                tracing::error!("Missing stripe-signature header");
                PaymentError::InvalidSignature("Missing stripe-signature header".to_string())
            })?
            .to_str()
            .map_err(|e| {
                tracing::error!("Invalid stripe-signature header: {:?}", e);
                PaymentError::InvalidSignature("Invalid stripe-signature header".to_string())
            })?;

        let event = Webhook::construct_event(body, signature, &self.webhook_secret).map_err(webhook_error)?;
        tracing::trace!("Validated Stripe webhook event: {:?}", event.type_);

        let webhook_event = match event.data.object {
            EventObject::CheckoutSessionCompleted(session) | EventObject::CheckoutSessionAsyncPaymentSucceeded(session) => {
                WebhookEvent::CheckoutCompleted {
                    session_id: session.id.to_string(),
                }
            }
            EventObject::CustomerSubscriptionCreated(sub) | EventObject::CustomerSubscriptionUpdated(sub) => {
                WebhookEvent::SubscriptionUpdated(subscription_state(*sub))
            }
            EventObject::CustomerSubscriptionDeleted(sub) => WebhookEvent::SubscriptionDeleted(subscription_state(*sub)),
            EventObject::InvoicePaid(invoice) => WebhookEvent::InvoicePaid(paid_invoice(*invoice)?),
            _ => WebhookEvent::Ignored {
                event_type: format!("{:?}", event.type_),
            },
        };
        Ok(Some(webhook_event))
    }

    #[instrument(skip(self, return_url), err)]
    async fn create_billing_portal_session(&self, customer_id: &str, return_url: &str) -> Result<String> {
        let portal = CreateBillingPortalSession::new()
            .customer(customer_id)
            .return_url(return_url)
            .send(&self.client())
            .await?;
        Ok(portal.url)
    }
}
