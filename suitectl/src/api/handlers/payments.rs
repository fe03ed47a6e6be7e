//! HTTP handlers for payment processing endpoints.
//!
//! Checkout sessions are created here; what a completed session means for the ledger and the
//! subscription is decided in [`crate::payment_providers::fulfilment`], shared by the success
//! redirect and the webhook.

use axum::{
    Json,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
};
use sqlx::PgConnection;
use tracing::{debug, info, instrument};

use crate::{
    AppState,
    api::models::{
        payments::{BillingPortalResponse, CheckoutResponse, CreditCheckoutRequest, PaymentProcessedResponse},
        users::CurrentUser,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Repository, Subscriptions, Tenants},
        models::subscriptions::SubscriptionUpdateDBRequest,
    },
    errors::{Error, Result},
    payment_providers::{
        CheckoutItem, CheckoutRequest, PaymentError, PaymentProvider,
        fulfilment::{Fulfilled, Fulfilment},
    },
    types::TenantId,
};

const DEFAULT_CURRENCY_UNITS: u32 = 10;
const MAX_CURRENCY_UNITS: u32 = 10_000;

pub(crate) fn payment_provider(state: &AppState) -> Result<&dyn PaymentProvider> {
    state.payment.as_deref().ok_or_else(|| Error::BadRequest {
        message: "Payments are not configured".to_string(),
    })
}

pub(crate) fn fulfilment<'a>(state: &'a AppState, provider: &'a dyn PaymentProvider) -> Fulfilment<'a> {
    Fulfilment {
        provider,
        pool: &state.db,
        config: &state.config,
        metrics: state.credit_metrics.as_ref(),
    }
}

pub(crate) fn billing_url(state: &AppState) -> String {
    format!("{}/billing", state.config.dashboard_url.trim_end_matches('/'))
}

/// The tenant's provider customer, created and remembered on first use.
#[instrument(skip(conn, provider, user), err)]
pub(crate) async fn ensure_customer(
    conn: &mut PgConnection,
    provider: &dyn PaymentProvider,
    tenant_id: TenantId,
    user: &CurrentUser,
) -> Result<String> {
    let subscription = Subscriptions::new(&mut *conn).get_by_tenant(tenant_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Subscription".to_string(),
        id: tenant_id.to_string(),
    })?;
    if let Some(customer_id) = subscription.provider_customer_id {
        return Ok(customer_id);
    }

    let tenant = Tenants::new(&mut *conn).get_by_id(tenant_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Tenant".to_string(),
        id: tenant_id.to_string(),
    })?;
    let customer_id = provider.create_customer(tenant_id, &tenant.name, &user.email).await?;
    Subscriptions::new(&mut *conn)
        .update_for_tenant(
            tenant_id,
            &SubscriptionUpdateDBRequest {
                provider_customer_id: Some(customer_id.clone()),
                ..Default::default()
            },
        )
        .await?;
    info!(%tenant_id, "Created payment provider customer");
    Ok(customer_id)
}

/// Start a credit top-up checkout
#[utoipa::path(
    post,
    path = "/payments",
    tag = "payments",
    summary = "Create a credit checkout",
    description = "Create a hosted checkout session for buying credits and return the URL to send the browser to",
    request_body = CreditCheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Invalid amount, or payments are not configured"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin or BillingManager"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_payment(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Payments, operation::CreateOwn>,
    body: Option<Json<CreditCheckoutRequest>>,
) -> Result<Json<CheckoutResponse>> {
    let tenant_id = perm.tenant_id()?;
    let provider = payment_provider(&state)?;
    let currency_units = body.and_then(|Json(b)| b.currency_units).unwrap_or(DEFAULT_CURRENCY_UNITS);
    if !(1..=MAX_CURRENCY_UNITS).contains(&currency_units) {
        return Err(Error::BadRequest {
            message: format!("currency_units must be between 1 and {MAX_CURRENCY_UNITS}"),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let customer_id = ensure_customer(&mut conn, provider, tenant_id, &perm.user).await?;

    let return_url = billing_url(&state);
    let success_url = format!("{return_url}?session_id={{CHECKOUT_SESSION_ID}}");
    let session = provider
        .create_checkout_session(
            &CheckoutRequest {
                tenant_id,
                user_id: perm.user.id,
                email: &perm.user.email,
                customer_id: Some(&customer_id),
                success_url: &success_url,
                cancel_url: &return_url,
            },
            CheckoutItem::Credits { currency_units },
        )
        .await?;

    info!(%tenant_id, session_id = %session.id, "Created credit checkout session");
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}

/// Apply a completed checkout session
#[utoipa::path(
    patch,
    path = "/payments/{id}",
    tag = "payments",
    summary = "Process a checkout session",
    description = "Called from the checkout success page. Safe to repeat: a session is credited once, \
                   whether this endpoint or the webhook sees it first.",
    params(
        ("id" = String, Path, description = "Checkout session ID"),
    ),
    responses(
        (status = 200, description = "Payment applied", body = PaymentProcessedResponse),
        (status = 400, description = "Payment not completed, or invalid session"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Session belongs to another organization"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all, fields(session_id = %id))]
pub async fn process_payment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    perm: RequiresPermission<resource::Payments, operation::CreateOwn>,
) -> Result<Json<PaymentProcessedResponse>> {
    let tenant_id = perm.tenant_id()?;
    let provider = payment_provider(&state)?;

    let fulfilled = fulfilment(&state, provider).process_session(&id).await?;
    let not_found = || Error::NotFound {
        resource: "Payment".to_string(),
        id: id.clone(),
    };

    let response = match fulfilled {
        Fulfilled::Credits {
            tenant_id: paid_for,
            amount,
            replayed,
        } => {
            if paid_for != tenant_id {
                return Err(not_found());
            }
            PaymentProcessedResponse::Credits {
                tenant_id,
                credits_added: amount,
                already_processed: replayed,
            }
        }
        Fulfilled::Subscription {
            tenant_id: paid_for,
            plan_code,
        } => {
            if paid_for != tenant_id {
                return Err(not_found());
            }
            PaymentProcessedResponse::Subscription { tenant_id, plan_code }
        }
    };
    Ok(Json(response))
}

/// Open the provider's self-service billing portal
#[utoipa::path(
    post,
    path = "/billing/portal",
    tag = "payments",
    summary = "Create a billing portal session",
    responses(
        (status = 200, description = "Portal session created", body = BillingPortalResponse),
        (status = 400, description = "No billing account yet, or payments are not configured"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin or BillingManager"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_billing_portal(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Payments, operation::CreateOwn>,
) -> Result<Json<BillingPortalResponse>> {
    let tenant_id = perm.tenant_id()?;
    let provider = payment_provider(&state)?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let customer_id = Subscriptions::new(&mut conn)
        .get_by_tenant(tenant_id)
        .await?
        .and_then(|s| s.provider_customer_id)
        .ok_or(PaymentError::NoCustomerId)?;

    let url = provider.create_billing_portal_session(&customer_id, &billing_url(&state)).await?;
    Ok(Json(BillingPortalResponse { url }))
}

/// Payment provider webhook
#[utoipa::path(
    post,
    path = "/webhooks/payments",
    tag = "payments",
    summary = "Receive payment provider events",
    description = "Unauthenticated; deliveries are verified with the provider's signature header",
    request_body = String,
    responses(
        (status = 200, description = "Event processed or ignored"),
        (status = 400, description = "Invalid signature or payload"),
        (status = 404, description = "Payments are not configured"),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn webhook_handler(State(state): State<AppState>, headers: HeaderMap, body: String) -> Result<StatusCode> {
    let Some(provider) = state.payment.as_deref() else {
        return Err(Error::NotFound {
            resource: "Webhook".to_string(),
            id: "payments".to_string(),
        });
    };

    let Some(event) = provider.validate_webhook(&headers, &body).await? else {
        debug!("Provider does not use webhooks");
        return Ok(StatusCode::OK);
    };
    fulfilment(&state, provider).process_event(event).await?;
    Ok(StatusCode::OK)
}
