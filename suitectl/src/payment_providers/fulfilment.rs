//! Applying provider-side payment state to the local database.
//!
//! Everything here is safe to repeat: credit grants are keyed by `payment:{session}` and
//! `invoice:{invoice}` source ids, and subscription updates only overwrite with provider state.

use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Connection, PgConnection, PgPool};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::db::handlers::{Credits, Subscriptions};
use crate::db::models::credits::{CreditGrantDBRequest, CreditTransactionType};
use crate::db::models::subscriptions::{SubscriptionDBResponse, SubscriptionStatus, SubscriptionUpdateDBRequest};
use crate::metrics::CreditMetrics;
use crate::payment_providers::{
    PaymentError, PaymentProvider, ProviderInvoice, ProviderSubscription, Result, SessionKind, WebhookEvent,
};
use crate::types::TenantId;

pub fn purchase_source_id(session_id: &str) -> String {
    format!("payment:{session_id}")
}

pub fn invoice_source_id(invoice_id: &str) -> String {
    format!("invoice:{invoice_id}")
}

/// What a processed checkout session did.
#[derive(Debug, Clone, PartialEq)]
pub enum Fulfilled {
    Credits {
        tenant_id: TenantId,
        amount: Decimal,
        /// The session had already been credited
        replayed: bool,
    },
    Subscription {
        tenant_id: TenantId,
        plan_code: String,
    },
}

pub struct Fulfilment<'a> {
    pub provider: &'a dyn PaymentProvider,
    pub pool: &'a PgPool,
    pub config: &'a Config,
    pub metrics: Option<&'a CreditMetrics>,
}

impl Fulfilment<'_> {
    /// Apply a completed checkout session.
    #[instrument(skip(self), err)]
    pub async fn process_session(&self, session_id: &str) -> Result<Fulfilled> {
        let source_id = purchase_source_id(session_id);
        let mut conn = self.pool.acquire().await?;

        // Fast path: the success redirect and the webhook usually race for the same session
        if let Some(existing) = Credits::new(&mut conn).get_transaction_by_source(&source_id).await? {
            debug!("Session already credited");
            return Ok(Fulfilled::Credits {
                tenant_id: existing.tenant_id,
                amount: existing.amount,
                replayed: true,
            });
        }

        let session = self.provider.get_payment_session(session_id).await?;
        if !session.is_paid {
            return Err(PaymentError::PaymentNotCompleted);
        }

        match session.kind {
            SessionKind::CreditPurchase => {
                let credits = session.amount * self.config.credits.credits_per_currency_unit;
                if credits <= Decimal::ZERO {
                    return Err(PaymentError::InvalidData(format!("session {session_id} paid nothing")));
                }

                let mut tx = conn.begin().await?;
                let recorded = Credits::new(&mut tx)
                    .grant(&CreditGrantDBRequest {
                        tenant_id: session.tenant_id,
                        user_id: session.user_id,
                        transaction_type: CreditTransactionType::Purchase,
                        amount: credits,
                        expires_at: None,
                        source_id,
                        description: Some(format!("Credit purchase ({} paid)", session.amount)),
                    })
                    .await?;
                if let Some(customer_id) = session.customer_id {
                    remember_customer(&mut tx, session.tenant_id, customer_id).await?;
                }
                tx.commit().await?;

                if !recorded.replayed {
                    info!(tenant_id = %session.tenant_id, %credits, "Credited purchase");
                    if let Some(metrics) = self.metrics {
                        metrics.record_grant(CreditTransactionType::Purchase, credits);
                    }
                }
                Ok(Fulfilled::Credits {
                    tenant_id: session.tenant_id,
                    amount: recorded.transaction.amount,
                    replayed: recorded.replayed,
                })
            }
            SessionKind::Subscription { plan_code } => {
                let plan_code = plan_code
                    .filter(|code| self.config.plan(code).is_some())
                    .ok_or_else(|| PaymentError::InvalidData(format!("session {session_id} names no configured plan")))?;

                let mut subscriptions = Subscriptions::new(&mut conn);
                subscriptions
                    .update_for_tenant(
                        session.tenant_id,
                        &SubscriptionUpdateDBRequest {
                            plan_code: Some(plan_code.clone()),
                            status: Some(SubscriptionStatus::Active),
                            provider_customer_id: session.customer_id,
                            provider_subscription_id: session.subscription_id,
                            ..Default::default()
                        },
                    )
                    .await?;
                info!(tenant_id = %session.tenant_id, plan = %plan_code, "Subscription checkout completed");
                Ok(Fulfilled::Subscription {
                    tenant_id: session.tenant_id,
                    plan_code,
                })
            }
        }
    }

    /// Apply a verified webhook event.
    #[instrument(skip(self, event), err)]
    pub async fn process_event(&self, event: WebhookEvent) -> Result<()> {
        match event {
            WebhookEvent::CheckoutCompleted { session_id } => match self.process_session(&session_id).await {
                Ok(_) => Ok(()),
                // Async payment methods complete later with a separate event
                Err(PaymentError::PaymentNotCompleted) => {
                    debug!(%session_id, "Checkout completed but not yet paid");
                    Ok(())
                }
                Err(e) => Err(e),
            },
            WebhookEvent::SubscriptionUpdated(subscription) => self.sync_subscription(subscription, false).await,
            WebhookEvent::SubscriptionDeleted(subscription) => self.sync_subscription(subscription, true).await,
            WebhookEvent::InvoicePaid(invoice) => self.grant_for_invoice(invoice).await,
            WebhookEvent::Ignored { event_type } => {
                debug!(%event_type, "Ignoring webhook event");
                Ok(())
            }
        }
    }

    async fn sync_subscription(&self, remote: ProviderSubscription, deleted: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let Some(local) = find_subscription(
            &mut conn,
            Some(&remote.subscription_id),
            remote.customer_id.as_deref(),
            remote.tenant_id,
        )
        .await?
        else {
            warn!(subscription_id = %remote.subscription_id, "No local subscription for provider subscription");
            return Ok(());
        };

        let plan_code = remote
            .price_id
            .as_deref()
            .and_then(|price| self.config.plan_by_price(price))
            .map(|plan| plan.code.clone());
        if plan_code.is_none() {
            debug!(price_id = ?remote.price_id, "Provider price maps to no configured plan, keeping current plan");
        }

        let (status, canceled_at) = if deleted {
            (SubscriptionStatus::Canceled, remote.canceled_at.or_else(|| Some(Utc::now())))
        } else {
            (SubscriptionStatus::from_provider(&remote.status), remote.canceled_at)
        };

        Subscriptions::new(&mut conn)
            .update_for_tenant(
                local.tenant_id,
                &SubscriptionUpdateDBRequest {
                    plan_code,
                    status: Some(status),
                    provider_customer_id: remote.customer_id,
                    provider_subscription_id: Some(remote.subscription_id),
                    current_period_start: remote.current_period_start,
                    current_period_end: remote.current_period_end,
                    canceled_at,
                },
            )
            .await?;
        info!(tenant_id = %local.tenant_id, ?status, "Synced subscription from provider");
        Ok(())
    }

    async fn grant_for_invoice(&self, invoice: ProviderInvoice) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let Some(local) = find_subscription(
            &mut conn,
            invoice.subscription_id.as_deref(),
            invoice.customer_id.as_deref(),
            None,
        )
        .await?
        else {
            warn!(invoice_id = %invoice.invoice_id, "Paid invoice matches no local subscription");
            return Ok(());
        };

        let Some(plan) = self.config.plan(&local.plan_code) else {
            warn!(plan = %local.plan_code, "Subscription plan is no longer configured, no credits granted");
            return Ok(());
        };
        if plan.monthly_credits <= Decimal::ZERO {
            return Ok(());
        }

        let recorded = Credits::new(&mut conn)
            .grant(&CreditGrantDBRequest {
                tenant_id: local.tenant_id,
                user_id: None,
                transaction_type: CreditTransactionType::SubscriptionGrant,
                amount: plan.monthly_credits,
                expires_at: invoice.period_end,
                source_id: invoice_source_id(&invoice.invoice_id),
                description: Some(format!("{} plan credits", plan.name)),
            })
            .await?;

        if !recorded.replayed {
            info!(tenant_id = %local.tenant_id, credits = %plan.monthly_credits, "Granted subscription credits");
            if let Some(metrics) = self.metrics {
                metrics.record_grant(CreditTransactionType::SubscriptionGrant, plan.monthly_credits);
            }
        }
        Ok(())
    }
}

async fn remember_customer(conn: &mut PgConnection, tenant_id: TenantId, customer_id: String) -> Result<()> {
    let mut subscriptions = Subscriptions::new(conn);
    if subscriptions.get_by_tenant(tenant_id).await?.is_some() {
        subscriptions
            .update_for_tenant(
                tenant_id,
                &SubscriptionUpdateDBRequest {
                    provider_customer_id: Some(customer_id),
                    ..Default::default()
                },
            )
            .await?;
    }
    Ok(())
}

/// Locate a local subscription by provider subscription id, then tenant, then customer.
async fn find_subscription(
    conn: &mut PgConnection,
    subscription_id: Option<&str>,
    customer_id: Option<&str>,
    tenant_id: Option<TenantId>,
) -> Result<Option<SubscriptionDBResponse>> {
    let mut subscriptions = Subscriptions::new(conn);
    if let Some(id) = subscription_id
        && let Some(found) = subscriptions.get_by_provider_subscription(id).await?
    {
        return Ok(Some(found));
    }
    if let Some(tenant_id) = tenant_id
        && let Some(found) = subscriptions.get_by_tenant(tenant_id).await?
    {
        return Ok(Some(found));
    }
    if let Some(customer) = customer_id {
        return Ok(subscriptions.get_by_provider_customer(customer).await?);
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PlanConfig;
    use crate::db::models::subscriptions::SubscriptionCreateDBRequest;
    use crate::payment_providers::dummy::DummyProvider;
    use crate::payment_providers::{CheckoutItem, CheckoutRequest};
    use crate::test_utils::{create_test_tenant, create_test_user};
    use chrono::Duration;
    use uuid::Uuid;

    fn config() -> Config {
        let mut config = Config::default();
        config.credits.credits_per_currency_unit = Decimal::from(10);
        config.plans.push(PlanConfig {
            code: "growth".to_string(),
            name: "Growth".to_string(),
            price_id: Some("price_growth".to_string()),
            monthly_credits: Decimal::from(5000),
            onboarding_credits: Decimal::ZERO,
            trial_days: 0,
        });
        config
    }

    async fn subscribe(pool: &PgPool, tenant_id: TenantId, provider_subscription_id: &str) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Subscriptions::new(&mut conn);
        repo.create(&SubscriptionCreateDBRequest {
            tenant_id,
            plan_code: "starter".to_string(),
            status: SubscriptionStatus::Trialing,
            trial_ends_at: None,
            current_period_end: None,
        })
        .await
        .unwrap();
        repo.update_for_tenant(
            tenant_id,
            &SubscriptionUpdateDBRequest {
                provider_subscription_id: Some(provider_subscription_id.to_string()),
                provider_customer_id: Some("cus_1".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    }

    async fn set_local_plan(pool: &PgPool, tenant_id: TenantId, plan_code: &str) {
        let mut conn = pool.acquire().await.unwrap();
        Subscriptions::new(&mut conn)
            .update_for_tenant(
                tenant_id,
                &SubscriptionUpdateDBRequest {
                    plan_code: Some(plan_code.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    async fn checkout(provider: &DummyProvider, tenant_id: TenantId, user_id: Uuid, item: CheckoutItem<'_>) -> String {
        let request = CheckoutRequest {
            tenant_id,
            user_id,
            email: "owner@acme.test",
            customer_id: None,
            success_url: "https://app.test/ok",
            cancel_url: "https://app.test/cancel",
        };
        provider.create_checkout_session(&request, item).await.unwrap().id
    }

    #[sqlx::test]
    #[test_log::test]
    async fn purchase_is_credited_once(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "buyer").await;
        let user = create_test_user(&pool, Some(tenant.id), "buyer@acme.test").await;
        let provider = DummyProvider::new(Decimal::from(25));
        let config = config();
        let fulfilment = Fulfilment {
            provider: &provider,
            pool: &pool,
            config: &config,
            metrics: None,
        };

        let session_id = checkout(&provider, tenant.id, user.id, CheckoutItem::Credits { currency_units: 25 }).await;
        let first = fulfilment.process_session(&session_id).await.unwrap();
        assert_eq!(
            first,
            Fulfilled::Credits {
                tenant_id: tenant.id,
                amount: Decimal::from(250),
                replayed: false
            }
        );

        let second = fulfilment.process_session(&session_id).await.unwrap();
        assert!(matches!(second, Fulfilled::Credits { replayed: true, .. }));

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Credits::new(&mut conn).balance(tenant.id).await.unwrap(), Decimal::from(250));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn subscription_checkout_switches_plan(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "upgrader").await;
        let user = create_test_user(&pool, Some(tenant.id), "up@acme.test").await;
        subscribe(&pool, tenant.id, "sub_old").await;
        let provider = DummyProvider::new(Decimal::from(25));
        let config = config();
        let fulfilment = Fulfilment {
            provider: &provider,
            pool: &pool,
            config: &config,
            metrics: None,
        };

        let session_id = checkout(
            &provider,
            tenant.id,
            user.id,
            CheckoutItem::Plan {
                plan_code: "growth",
                price_id: "price_growth",
            },
        )
        .await;
        fulfilment.process_session(&session_id).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn).get_by_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(subscription.plan_code, "growth");
        assert_eq!(subscription.status, SubscriptionStatus::Active);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn paid_invoice_grants_expiring_plan_credits_once(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "invoiced").await;
        subscribe(&pool, tenant.id, "sub_123").await;
        // The plan change arrives as a subscription update before the renewal invoice
        set_local_plan(&pool, tenant.id, "growth").await;
        let provider = DummyProvider::new(Decimal::from(25));
        let config = config();
        let fulfilment = Fulfilment {
            provider: &provider,
            pool: &pool,
            config: &config,
            metrics: None,
        };

        let period_end = Utc::now() + Duration::days(30);
        let invoice = ProviderInvoice {
            invoice_id: "in_1".to_string(),
            customer_id: Some("cus_1".to_string()),
            subscription_id: Some("sub_123".to_string()),
            period_end: Some(period_end),
        };
        fulfilment.process_event(WebhookEvent::InvoicePaid(invoice.clone())).await.unwrap();
        fulfilment.process_event(WebhookEvent::InvoicePaid(invoice)).await.unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let mut credits = Credits::new(&mut conn);
        assert_eq!(credits.balance(tenant.id).await.unwrap(), Decimal::from(5000));
        let allocations = credits.list_allocations(tenant.id, false).await.unwrap();
        assert_eq!(allocations.len(), 1);
        assert!(allocations[0].expires_at.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn deleted_subscription_is_canceled(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "churned").await;
        subscribe(&pool, tenant.id, "sub_gone").await;
        let provider = DummyProvider::new(Decimal::from(25));
        let config = config();
        let fulfilment = Fulfilment {
            provider: &provider,
            pool: &pool,
            config: &config,
            metrics: None,
        };

        fulfilment
            .process_event(WebhookEvent::SubscriptionDeleted(ProviderSubscription {
                subscription_id: "sub_gone".to_string(),
                customer_id: Some("cus_1".to_string()),
                status: "canceled".to_string(),
                price_id: None,
                tenant_id: None,
                current_period_start: None,
                current_period_end: None,
                canceled_at: None,
            }))
            .await
            .unwrap();

        let mut conn = pool.acquire().await.unwrap();
        let subscription = Subscriptions::new(&mut conn).get_by_tenant(tenant.id).await.unwrap().unwrap();
        assert_eq!(subscription.status, SubscriptionStatus::Canceled);
        assert!(subscription.canceled_at.is_some());
        assert_eq!(subscription.plan_code, "starter");
    }

    #[sqlx::test]
    #[test_log::test]
    async fn events_for_unknown_subscriptions_are_skipped(pool: PgPool) {
        let provider = DummyProvider::new(Decimal::from(25));
        let config = config();
        let fulfilment = Fulfilment {
            provider: &provider,
            pool: &pool,
            config: &config,
            metrics: None,
        };
        fulfilment
            .process_event(WebhookEvent::InvoicePaid(ProviderInvoice {
                invoice_id: "in_orphan".to_string(),
                customer_id: Some("cus_nobody".to_string()),
                subscription_id: Some("sub_nobody".to_string()),
                period_end: None,
            }))
            .await
            .unwrap();
    }
}
