//! Dummy payment provider.
//!
//! Every checkout completes instantly and pays the configured amount, so credits and plans can
//! be exercised without a real provider account. Session ids carry everything needed to replay
//! the session later:
//!
//! - credits: `dummy_session_{tenant}_{user}_{nonce}`
//! - plans: `dummy_subscription_{tenant}_{user}_{nonce}_{plan_code}`

use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::DummyPaymentConfig;
use crate::payment_providers::{
    CheckoutItem, CheckoutRequest, CheckoutSession, PaymentError, PaymentProvider, PaymentSession, Result, SessionKind,
    WebhookEvent,
};
use crate::types::TenantId;

const CREDITS_PREFIX: &str = "dummy_session_";
const SUBSCRIPTION_PREFIX: &str = "dummy_subscription_";

pub struct DummyProvider {
    amount: Decimal,
}

impl From<DummyPaymentConfig> for DummyProvider {
    fn from(config: DummyPaymentConfig) -> Self {
        Self::new(config.amount)
    }
}

impl DummyProvider {
    /// Provider whose sessions all pay `amount`.
    pub fn new(amount: Decimal) -> Self {
        Self { amount }
    }
}

fn invalid() -> PaymentError {
    PaymentError::InvalidData("Invalid dummy session ID format".to_string())
}

#[async_trait]
impl PaymentProvider for DummyProvider {
    async fn create_customer(&self, tenant_id: TenantId, _name: &str, _email: &str) -> Result<String> {
        Ok(format!("dummy_cus_{tenant_id}"))
    }

    async fn create_checkout_session(&self, request: &CheckoutRequest<'_>, item: CheckoutItem<'_>) -> Result<CheckoutSession> {
        let nonce = Uuid::new_v4().simple();
        let session_id = match item {
            CheckoutItem::Credits { .. } => format!("{CREDITS_PREFIX}{}_{}_{nonce}", request.tenant_id, request.user_id),
            CheckoutItem::Plan { plan_code, .. } => {
                format!("{SUBSCRIPTION_PREFIX}{}_{}_{nonce}_{plan_code}", request.tenant_id, request.user_id)
            }
        };

        tracing::info!(%session_id, tenant_id = %request.tenant_id, "Dummy provider created checkout session");

        // Payment is instantly complete, so the user goes straight to the success page
        let url = request.success_url.replace("{CHECKOUT_SESSION_ID}", &session_id);
        Ok(CheckoutSession { id: session_id, url })
    }

    async fn get_payment_session(&self, session_id: &str) -> Result<PaymentSession> {
        let (rest, is_subscription) = if let Some(rest) = session_id.strip_prefix(CREDITS_PREFIX) {
            (rest, false)
        } else if let Some(rest) = session_id.strip_prefix(SUBSCRIPTION_PREFIX) {
            (rest, true)
        } else {
            return Err(invalid());
        };

        let mut parts = rest.splitn(4, '_');
        let tenant_id: TenantId = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        let user_id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(invalid)?;
        parts.next().filter(|nonce| !nonce.is_empty()).ok_or_else(invalid)?;

        let kind = if is_subscription {
            let plan_code = parts.next().filter(|p| !p.is_empty()).ok_or_else(invalid)?;
            SessionKind::Subscription {
                plan_code: Some(plan_code.to_string()),
            }
        } else {
            SessionKind::CreditPurchase
        };

        Ok(PaymentSession {
            session_id: session_id.to_string(),
            tenant_id,
            user_id: Some(user_id),
            amount: self.amount,
            is_paid: true,
            subscription_id: is_subscription.then(|| format!("dummy_sub_{tenant_id}")),
            customer_id: Some(format!("dummy_cus_{tenant_id}")),
            kind,
        })
    }

    async fn validate_webhook(&self, _headers: &HeaderMap, _body: &str) -> Result<Option<WebhookEvent>> {
        Ok(None)
    }

    async fn create_billing_portal_session(&self, _customer_id: &str, return_url: &str) -> Result<String> {
        Ok(return_url.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(tenant_id: TenantId, user_id: Uuid) -> CheckoutRequest<'a> {
        CheckoutRequest {
            tenant_id,
            user_id,
            email: "owner@acme.test",
            customer_id: None,
            success_url: "https://app.test/billing?session_id={CHECKOUT_SESSION_ID}",
            cancel_url: "https://app.test/billing",
        }
    }

    #[tokio::test]
    async fn credit_sessions_round_trip_through_the_id() {
        let provider = DummyProvider::new(Decimal::from(50));
        let (tenant_id, user_id) = (Uuid::new_v4(), Uuid::new_v4());

        let checkout = provider
            .create_checkout_session(&request(tenant_id, user_id), CheckoutItem::Credits { currency_units: 10 })
            .await
            .unwrap();
        assert!(checkout.url.ends_with(&checkout.id));

        let session = provider.get_payment_session(&checkout.id).await.unwrap();
        assert!(session.is_paid);
        assert_eq!(session.tenant_id, tenant_id);
        assert_eq!(session.user_id, Some(user_id));
        assert_eq!(session.amount, Decimal::from(50));
        assert_eq!(session.kind, SessionKind::CreditPurchase);
    }

    #[tokio::test]
    async fn plan_codes_with_underscores_survive() {
        let provider = DummyProvider::new(Decimal::from(50));
        let checkout = provider
            .create_checkout_session(
                &request(Uuid::new_v4(), Uuid::new_v4()),
                CheckoutItem::Plan {
                    plan_code: "growth_annual",
                    price_id: "price_x",
                },
            )
            .await
            .unwrap();

        let session = provider.get_payment_session(&checkout.id).await.unwrap();
        assert_eq!(
            session.kind,
            SessionKind::Subscription {
                plan_code: Some("growth_annual".to_string())
            }
        );
        assert!(session.subscription_id.is_some());
    }

    #[tokio::test]
    async fn malformed_ids_are_rejected() {
        let provider = DummyProvider::new(Decimal::from(50));
        for id in ["cs_test_1", "dummy_session_", "dummy_session_not-a-uuid_x_y"] {
            assert!(provider.get_payment_session(id).await.is_err(), "{id} should be rejected");
        }
    }

    #[tokio::test]
    async fn configured_provider_pays_configured_amount() {
        let config = crate::config::PaymentConfig::Dummy(DummyPaymentConfig {
            amount: Decimal::from(75),
        });
        let provider = crate::payment_providers::create_provider(&config).unwrap();

        let checkout = provider
            .create_checkout_session(&request(Uuid::new_v4(), Uuid::new_v4()), CheckoutItem::Credits { currency_units: 75 })
            .await
            .unwrap();
        let session = provider.get_payment_session(&checkout.id).await.unwrap();
        assert_eq!(session.amount, Decimal::from(75));
    }
}
