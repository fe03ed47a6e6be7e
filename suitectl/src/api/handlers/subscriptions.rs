//! HTTP handlers for plans and the caller's subscription.

use axum::{Json, extract::State};
use tracing::info;

use crate::{
    AppState,
    api::{
        handlers::payments::{billing_url, ensure_customer, payment_provider},
        models::{
            payments::CheckoutResponse,
            subscriptions::{PlanResponse, SubscriptionCheckoutRequest, SubscriptionResponse},
            users::CurrentUser,
        },
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{errors::DbError, handlers::Subscriptions},
    errors::{Error, Result},
    payment_providers::{CheckoutItem, CheckoutRequest},
};

/// List the configured plans
#[utoipa::path(
    get,
    path = "/plans",
    tag = "subscriptions",
    summary = "List plans",
    responses(
        (status = 200, description = "Configured plans", body = Vec<PlanResponse>),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_plans(State(state): State<AppState>, _user: CurrentUser) -> Json<Vec<PlanResponse>> {
    Json(
        state
            .config
            .plans
            .iter()
            .map(|plan| PlanResponse::from_config(plan, &state.config.default_plan))
            .collect(),
    )
}

/// Get the caller's subscription
#[utoipa::path(
    get,
    path = "/subscriptions/current",
    tag = "subscriptions",
    summary = "Get current subscription",
    responses(
        (status = 200, description = "Subscription", body = SubscriptionResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Caller has no organization or subscription"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_current_subscription(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Subscriptions, operation::ReadOwn>,
) -> Result<Json<SubscriptionResponse>> {
    let tenant_id = perm.tenant_id()?;
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let subscription = Subscriptions::new(&mut conn)
        .get_by_tenant(tenant_id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Subscription".to_string(),
            id: tenant_id.to_string(),
        })?;

    let plan = state.config.plan(&subscription.plan_code);
    Ok(Json(SubscriptionResponse::new(subscription, plan)))
}

/// Start a checkout for a paid plan
#[utoipa::path(
    post,
    path = "/subscriptions/checkout",
    tag = "subscriptions",
    summary = "Create a plan checkout",
    description = "The subscription switches plan once the provider reports the checkout as paid",
    request_body = SubscriptionCheckoutRequest,
    responses(
        (status = 200, description = "Checkout session created", body = CheckoutResponse),
        (status = 400, description = "Unknown or non-purchasable plan, or payments are not configured"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin or BillingManager"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all, fields(plan_code = %request.plan_code))]
pub async fn subscription_checkout(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Subscriptions, operation::UpdateOwn>,
    Json(request): Json<SubscriptionCheckoutRequest>,
) -> Result<Json<CheckoutResponse>> {
    let tenant_id = perm.tenant_id()?;
    let provider = payment_provider(&state)?;

    let plan = state.config.plan(&request.plan_code).ok_or_else(|| Error::BadRequest {
        message: format!("Unknown plan '{}'", request.plan_code),
    })?;
    let price_id = plan.price_id.as_deref().ok_or_else(|| Error::BadRequest {
        message: format!("Plan '{}' cannot be bought", plan.code),
    })?;

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
            CheckoutItem::Plan {
                plan_code: &plan.code,
                price_id,
            },
        )
        .await?;

    info!(%tenant_id, session_id = %session.id, "Created plan checkout session");
    Ok(Json(CheckoutResponse {
        session_id: session.id,
        url: session.url,
    }))
}
