//! HTTP handlers for platform administration of organizations.
//!
//! Only platform managers reach these; they act on any tenant by id rather than the caller's own.

use axum::{
    Json,
    extract::{Path, Query, State},
};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::{
    AppState,
    api::models::{
        admin::{
            CreditAdjustmentType, ListOrganizationsQuery, OrganizationCreditAdjustment, OrganizationCreditAdjustmentResponse,
            OrganizationDetail, OrganizationSummary, OrganizationUpdate,
        },
        credits::{CreditAllocationResponse, CreditTransactionResponse},
        pagination::PaginatedResponse,
        subscriptions::SubscriptionResponse,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Credits, Repository, Subscriptions, Tenants, Users, tenants::TenantFilter},
        models::{
            credits::{CreditDebitDBRequest, CreditGrantDBRequest, CreditTransactionType, DebitOutcome},
            tenants::{TenantDBResponse, TenantUpdateDBRequest},
        },
    },
    errors::{Error, Result},
    types::TenantId,
};

fn tenant_not_found(id: TenantId) -> Error {
    Error::NotFound {
        resource: "Organization".to_string(),
        id: id.to_string(),
    }
}

/// List all organizations
#[utoipa::path(
    get,
    path = "/admin/organizations",
    tag = "admin",
    summary = "List organizations",
    params(ListOrganizationsQuery),
    responses(
        (status = 200, description = "Page of organizations", body = PaginatedResponse<OrganizationSummary>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires PlatformManager"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_organizations(
    State(state): State<AppState>,
    Query(query): Query<ListOrganizationsQuery>,
    _perm: RequiresPermission<resource::Organizations, operation::ReadAll>,
) -> Result<Json<PaginatedResponse<OrganizationSummary>>> {
    let (skip, limit) = query.pagination.params();
    let filter = TenantFilter::new(skip, limit).with_search(query.search);

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let tenants = Tenants::new(&mut conn).list(&filter).await?;
    let total_count = Tenants::new(&mut conn).count(&filter).await?;

    let ids: Vec<TenantId> = tenants.iter().map(|t| t.id).collect();
    let balances = Credits::new(&mut conn).balances(&ids).await?;
    let mut subscriptions = Subscriptions::new(&mut conn).get_for_tenants(&ids).await?;
    let member_counts = Users::new(&mut conn).count_by_tenant(&ids).await?;

    let data = tenants
        .into_iter()
        .map(|tenant| {
            let subscription = subscriptions.remove(&tenant.id);
            OrganizationSummary {
                balance: balances.get(&tenant.id).copied().unwrap_or(Decimal::ZERO),
                member_count: member_counts.get(&tenant.id).copied().unwrap_or(0),
                plan_code: subscription.as_ref().map(|s| s.plan_code.clone()),
                subscription_status: subscription.map(|s| s.status),
                tenant: tenant.into(),
            }
        })
        .collect();

    Ok(Json(PaginatedResponse::new(data, total_count, skip, limit)))
}

async fn organization_detail(state: &AppState, tenant: TenantDBResponse) -> Result<OrganizationDetail> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut credits = Credits::new(&mut conn);
    let balance = credits.balance(tenant.id).await?;
    let allocations = credits.list_allocations(tenant.id, true).await?;
    let subscription = Subscriptions::new(&mut conn).get_by_tenant(tenant.id).await?;
    let member_count = Users::new(&mut conn)
        .count_by_tenant(&[tenant.id])
        .await?
        .get(&tenant.id)
        .copied()
        .unwrap_or(0);

    Ok(OrganizationDetail {
        identity_org_code: tenant.identity_org_code.clone(),
        subscription: subscription.map(|s| {
            let plan = state.config.plan(&s.plan_code);
            SubscriptionResponse::new(s, plan)
        }),
        balance,
        member_count,
        allocations: allocations.into_iter().map(CreditAllocationResponse::from).collect(),
        tenant: tenant.into(),
    })
}

/// Get one organization with its ledger state
#[utoipa::path(
    get,
    path = "/admin/organizations/{id}",
    tag = "admin",
    summary = "Get organization",
    params(
        ("id" = uuid::Uuid, Path, description = "Organization ID"),
    ),
    responses(
        (status = 200, description = "Organization", body = OrganizationDetail),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires PlatformManager"),
        (status = 404, description = "Organization not found"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %id))]
pub async fn get_organization(
    State(state): State<AppState>,
    Path(id): Path<TenantId>,
    _perm: RequiresPermission<resource::Organizations, operation::ReadAll>,
) -> Result<Json<OrganizationDetail>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let tenant = Tenants::new(&mut conn).get_by_id(id).await?.ok_or_else(|| tenant_not_found(id))?;
    drop(conn);
    Ok(Json(organization_detail(&state, tenant).await?))
}

/// Suspend or reactivate an organization
#[utoipa::path(
    patch,
    path = "/admin/organizations/{id}",
    tag = "admin",
    summary = "Update organization status",
    description = "Suspended organizations keep their data but cannot record usage",
    params(
        ("id" = uuid::Uuid, Path, description = "Organization ID"),
    ),
    request_body = OrganizationUpdate,
    responses(
        (status = 200, description = "Updated organization", body = OrganizationDetail),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires PlatformManager"),
        (status = 404, description = "Organization not found"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %id))]
pub async fn update_organization(
    State(state): State<AppState>,
    Path(id): Path<TenantId>,
    perm: RequiresPermission<resource::Organizations, operation::UpdateAll>,
    Json(update): Json<OrganizationUpdate>,
) -> Result<Json<OrganizationDetail>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let tenant = Tenants::new(&mut conn)
        .update(
            id,
            &TenantUpdateDBRequest {
                status: Some(update.status),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| match e {
            DbError::NotFound => tenant_not_found(id),
            other => other.into(),
        })?;
    drop(conn);

    info!(tenant_id = %id, status = ?update.status, changed_by = %perm.user.id, "Organization status changed");
    Ok(Json(organization_detail(&state, tenant).await?))
}

/// Grant or remove an organization's credits
#[utoipa::path(
    post,
    path = "/admin/organizations/{id}/credits",
    tag = "admin",
    summary = "Adjust organization credits",
    params(
        ("id" = uuid::Uuid, Path, description = "Organization ID"),
    ),
    request_body = OrganizationCreditAdjustment,
    responses(
        (status = 201, description = "Credits adjusted", body = OrganizationCreditAdjustmentResponse),
        (status = 400, description = "Invalid amount, or expiry on a removal"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Removal exceeds the balance"),
        (status = 403, description = "Requires PlatformManager"),
        (status = 404, description = "Organization not found"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all, fields(tenant_id = %id))]
pub async fn adjust_organization_credits(
    State(state): State<AppState>,
    Path(id): Path<TenantId>,
    perm: RequiresPermission<resource::Organizations, operation::UpdateAll>,
    Json(adjustment): Json<OrganizationCreditAdjustment>,
) -> Result<(axum::http::StatusCode, Json<OrganizationCreditAdjustmentResponse>)> {
    if adjustment.amount <= Decimal::ZERO {
        return Err(Error::BadRequest {
            message: "Amount must be positive".to_string(),
        });
    }
    if adjustment.transaction_type == CreditAdjustmentType::AdminRemoval && adjustment.expires_at.is_some() {
        return Err(Error::BadRequest {
            message: "Only grants can expire".to_string(),
        });
    }

    let mut tx = state.db.begin().await.map_err(DbError::from)?;
    Tenants::new(&mut tx).get_by_id(id).await?.ok_or_else(|| tenant_not_found(id))?;

    let (transaction, kind) = match adjustment.transaction_type {
        CreditAdjustmentType::AdminGrant => {
            let request = CreditGrantDBRequest::admin_grant(
                id,
                perm.user.id,
                adjustment.amount,
                adjustment.expires_at,
                adjustment.description.clone(),
            );
            let kind = request.transaction_type;
            (Credits::new(&mut tx).grant(&request).await?.transaction, kind)
        }
        CreditAdjustmentType::AdminRemoval => {
            let outcome = Credits::new(&mut tx)
                .debit(&CreditDebitDBRequest {
                    tenant_id: id,
                    user_id: Some(perm.user.id),
                    transaction_type: CreditTransactionType::AdminRemoval,
                    amount: adjustment.amount,
                    source_id: format!("admin:{}:{}", perm.user.id, Uuid::new_v4()),
                    description: adjustment.description.clone(),
                })
                .await?;
            match outcome {
                DebitOutcome::Applied(recorded) => (recorded.transaction, CreditTransactionType::AdminRemoval),
                DebitOutcome::Insufficient { available } => {
                    return Err(Error::InsufficientCredits {
                        required: adjustment.amount,
                        available,
                    });
                }
            }
        }
    };
    tx.commit().await.map_err(DbError::from)?;

    if let Some(metrics) = &state.credit_metrics {
        if kind.is_credit() {
            metrics.record_grant(kind, transaction.amount);
        } else {
            metrics.record_debit(kind, transaction.amount);
        }
    }
    info!(
        tenant_id = %id,
        granted_by = %perm.user.id,
        ?kind,
        amount = %transaction.amount,
        "Admin credit adjustment"
    );

    Ok((
        axum::http::StatusCode::CREATED,
        Json(OrganizationCreditAdjustmentResponse {
            balance: transaction.balance_after,
            transaction: CreditTransactionResponse::from(transaction),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use crate::api::models::users::Role;
    use crate::test_utils::{
        add_auth_headers, create_test_app, create_test_platform_manager, create_test_subscription, create_test_tenant,
        create_test_user, create_test_user_with_roles, json_decimal,
    };
    use axum::http::StatusCode;
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_organizations_with_search(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let manager = create_test_platform_manager(&pool, "ops@suite.test").await;
        let alpha = create_test_tenant(&pool, "alpha-labs").await;
        create_test_subscription(&pool, alpha.id).await;
        create_test_tenant(&pool, "beta-works").await;
        create_test_user(&pool, Some(alpha.id), "one@alpha.test").await;
        create_test_user(&pool, Some(alpha.id), "two@alpha.test").await;

        let headers = add_auth_headers(&manager);
        let response = app
            .get("/api/v1/admin/organizations")
            .add_query_param("search", "ALPHA")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["total_count"], 1);
        let org = &body["data"][0];
        assert_eq!(org["slug"], "alpha-labs");
        assert_eq!(org["member_count"], 2);
        assert_eq!(org["plan_code"], "starter");
        assert_eq!(json_decimal(&org["balance"]), Decimal::ZERO);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_tenant_admins_cannot_reach_platform_admin(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let tenant = create_test_tenant(&pool, "ambitious").await;
        let admin = create_test_user_with_roles(&pool, tenant.id, "admin@ambitious.test", vec![Role::TenantAdmin]).await;

        let headers = add_auth_headers(&admin);
        app.get("/api/v1/admin/organizations")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_grant_then_remove_credits(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let manager = create_test_platform_manager(&pool, "ops@suite.test").await;
        let tenant = create_test_tenant(&pool, "adjusted").await;
        let headers = add_auth_headers(&manager);
        let url = format!("/api/v1/admin/organizations/{}/credits", tenant.id);

        let response = app
            .post(&url)
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "transaction_type": "admin_grant", "amount": "100", "description": "goodwill" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["transaction"]["transaction_type"], "admin_grant");
        assert_eq!(json_decimal(&body["balance"]), Decimal::from(100));

        let response = app
            .post(&url)
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "transaction_type": "admin_removal", "amount": "40" }))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(json_decimal(&body["balance"]), Decimal::from(60));

        let response = app
            .post(&url)
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "transaction_type": "admin_removal", "amount": "61" }))
            .await;
        response.assert_status(StatusCode::PAYMENT_REQUIRED);

        let detail: Value = app
            .get(&format!("/api/v1/admin/organizations/{}", tenant.id))
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await
            .json();
        assert_eq!(json_decimal(&detail["balance"]), Decimal::from(60));
        assert_eq!(detail["allocations"].as_array().unwrap().len(), 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_invalid_adjustments_are_rejected(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let manager = create_test_platform_manager(&pool, "ops@suite.test").await;
        let tenant = create_test_tenant(&pool, "strict").await;
        let headers = add_auth_headers(&manager);
        let url = format!("/api/v1/admin/organizations/{}/credits", tenant.id);

        for body in [
            json!({ "transaction_type": "admin_grant", "amount": "0" }),
            json!({ "transaction_type": "admin_removal", "amount": "5", "expires_at": "2030-01-01T00:00:00Z" }),
        ] {
            app.post(&url)
                .add_header(&headers[0].0, &headers[0].1)
                .add_header(&headers[1].0, &headers[1].1)
                .json(&body)
                .await
                .assert_status(StatusCode::BAD_REQUEST);
        }

        app.post(&format!("/api/v1/admin/organizations/{}/credits", uuid::Uuid::new_v4()))
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "transaction_type": "admin_grant", "amount": "5" }))
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_suspending_blocks_usage(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let manager = create_test_platform_manager(&pool, "ops@suite.test").await;
        let tenant = create_test_tenant(&pool, "naughty").await;
        let member = create_test_user(&pool, Some(tenant.id), "member@naughty.test").await;

        let headers = add_auth_headers(&manager);
        let response = app
            .patch(&format!("/api/v1/admin/organizations/{}", tenant.id))
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "status": "suspended" }))
            .await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["status"], "suspended");

        let headers = add_auth_headers(&member);
        app.post("/api/v1/usage")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "operation": "report.view" }))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }
}
