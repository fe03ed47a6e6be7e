//! HTTP handlers for the caller's credit ledger.

use axum::{
    extract::{Query, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::PgConnection;

use crate::{
    AppState,
    api::models::{
        credits::{
            BalanceResponse, CreditAllocationResponse, CreditTransactionResponse, ListAllocationsQuery, ListTransactionsQuery,
        },
        pagination::PaginatedResponse,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    config::Config,
    db::{
        handlers::{Credits, credits::CreditTransactionFilter},
        models::credits::CreditAllocationDBResponse,
    },
    errors::{Error, Result},
    types::TenantId,
};

/// Balance plus what part of it is about to expire.
pub(crate) async fn balance_response(conn: &mut PgConnection, config: &Config, tenant_id: TenantId) -> Result<BalanceResponse> {
    let mut credits = Credits::new(conn);
    let balance = credits.balance(tenant_id).await?;
    let allocations = credits.list_allocations(tenant_id, false).await?;
    let (expiring_soon, next_expiry) = expiring_summary(&allocations, Utc::now(), config.seasonal_credits.warning_window)?;

    Ok(BalanceResponse {
        tenant_id,
        balance,
        expiring_soon,
        next_expiry,
    })
}

fn expiring_summary(
    allocations: &[CreditAllocationDBResponse],
    now: DateTime<Utc>,
    window: std::time::Duration,
) -> Result<(Decimal, Option<DateTime<Utc>>)> {
    let horizon = now
        + chrono::Duration::from_std(window).map_err(|e| Error::Internal {
            operation: format!("compute expiry horizon: {e}"),
        })?;

    let live = allocations.iter().filter(|a| a.remaining > Decimal::ZERO);
    let expiring_soon = live
        .clone()
        .filter(|a| a.expires_at.is_some_and(|at| at <= horizon))
        .map(|a| a.remaining)
        .sum();
    let next_expiry = live.filter_map(|a| a.expires_at).min();
    Ok((expiring_soon, next_expiry))
}

/// Get the caller's credit balance
#[utoipa::path(
    get,
    path = "/credits/balance",
    tag = "credits",
    summary = "Get credit balance",
    description = "Current balance of the caller's organization, and how much of it expires within the warning window",
    responses(
        (status = 200, description = "Balance", body = BalanceResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Caller has no organization"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_balance(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
) -> Result<Json<BalanceResponse>> {
    let tenant_id = perm.tenant_id()?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    Ok(Json(balance_response(&mut conn, &state.config, tenant_id).await?))
}

/// List the caller's credit transactions
#[utoipa::path(
    get,
    path = "/credits/transactions",
    tag = "credits",
    summary = "List credit transactions",
    description = "Ledger entries for the caller's organization, newest first",
    params(ListTransactionsQuery),
    responses(
        (status = 200, description = "Page of transactions", body = PaginatedResponse<CreditTransactionResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Caller has no organization"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(query): Query<ListTransactionsQuery>,
    perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
) -> Result<Json<PaginatedResponse<CreditTransactionResponse>>> {
    let tenant_id = perm.tenant_id()?;
    let (skip, limit) = query.pagination.params();
    let filter = CreditTransactionFilter::new(Some(tenant_id), skip, limit);

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let mut repo = Credits::new(&mut conn);
    let transactions = repo.list_transactions(&filter).await?;
    let total_count = repo.count_transactions(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        transactions.into_iter().map(CreditTransactionResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

/// List the caller's credit allocations
#[utoipa::path(
    get,
    path = "/credits/allocations",
    tag = "credits",
    summary = "List credit allocations",
    description = "Credit buckets making up the balance, soonest expiry first",
    params(ListAllocationsQuery),
    responses(
        (status = 200, description = "Allocations", body = Vec<CreditAllocationResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Caller has no organization"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_allocations(
    State(state): State<AppState>,
    Query(query): Query<ListAllocationsQuery>,
    perm: RequiresPermission<resource::Credits, operation::ReadOwn>,
) -> Result<Json<Vec<CreditAllocationResponse>>> {
    let tenant_id = perm.tenant_id()?;
    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let allocations = Credits::new(&mut conn).list_allocations(tenant_id, query.include_expired).await?;
    Ok(Json(allocations.into_iter().map(CreditAllocationResponse::from).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::credits::{AllocationType, CreditGrantDBRequest, CreditTransactionType};
    use crate::test_utils::{add_auth_headers, create_test_app, create_test_tenant, create_test_user, json_decimal};
    use axum::http::StatusCode;
    use chrono::Duration;
    use serde_json::Value;
    use sqlx::PgPool;
    use uuid::Uuid;

    fn allocation(remaining: i64, expires_at: Option<DateTime<Utc>>) -> CreditAllocationDBResponse {
        CreditAllocationDBResponse {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            allocation_type: AllocationType::Seasonal,
            amount: Decimal::from(100),
            remaining: Decimal::from(remaining),
            expires_at,
            expiry_warning_sent_at: None,
            expired_at: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn expiring_summary_only_counts_the_window() {
        let now = Utc::now();
        let allocations = vec![
            allocation(10, Some(now + Duration::days(2))),
            allocation(0, Some(now + Duration::days(1))),
            allocation(25, Some(now + Duration::days(30))),
            allocation(40, None),
        ];
        let (soon, next) = expiring_summary(&allocations, now, std::time::Duration::from_secs(7 * 86400)).unwrap();
        assert_eq!(soon, Decimal::from(10));
        assert_eq!(next, Some(now + Duration::days(2)));
    }

    async fn grant(pool: &PgPool, tenant_id: TenantId, amount: i64, expires_at: Option<DateTime<Utc>>, source: &str) {
        let mut conn = pool.acquire().await.unwrap();
        Credits::new(&mut conn)
            .grant(&CreditGrantDBRequest {
                tenant_id,
                user_id: None,
                transaction_type: CreditTransactionType::SeasonalGrant,
                amount: Decimal::from(amount),
                expires_at,
                source_id: source.to_string(),
                description: None,
            })
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_member_reads_balance_and_ledger(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let tenant = create_test_tenant(&pool, "ledger").await;
        let user = create_test_user(&pool, Some(tenant.id), "member@ledger.test").await;
        grant(&pool, tenant.id, 30, Some(Utc::now() + Duration::days(3)), "test:soon").await;
        grant(&pool, tenant.id, 70, None, "test:forever").await;

        let headers = add_auth_headers(&user);
        let response = app
            .get("/api/v1/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(json_decimal(&body["balance"]), Decimal::from(100));
        assert_eq!(json_decimal(&body["expiring_soon"]), Decimal::from(30));

        let response = app
            .get("/api/v1/credits/transactions")
            .add_query_param("limit", 1)
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["total_count"], 2);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);
        assert_eq!(body["data"][0]["source_id"], "test:forever");

        let response = app
            .get("/api/v1/credits/allocations")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        let body: Value = response.json();
        let allocations = body.as_array().unwrap();
        assert_eq!(allocations.len(), 2);
        assert!(allocations[0]["expires_at"].is_string());
        assert!(allocations[1]["expires_at"].is_null());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_ledger_is_scoped_to_own_tenant(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let mine = create_test_tenant(&pool, "mine").await;
        let theirs = create_test_tenant(&pool, "theirs").await;
        grant(&pool, theirs.id, 50, None, "test:theirs").await;
        let user = create_test_user(&pool, Some(mine.id), "me@mine.test").await;

        let headers = add_auth_headers(&user);
        let response = app
            .get("/api/v1/credits/transactions")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        let body: Value = response.json();
        assert_eq!(body["total_count"], 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_user_without_tenant_gets_not_found(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let user = create_test_user(&pool, None, "drifter@acme.test").await;

        let headers = add_auth_headers(&user);
        app.get("/api/v1/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
