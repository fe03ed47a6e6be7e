//! HTTP handlers for tracked operations.
//!
//! Recording usage debits the ledger and writes the usage log in one database transaction, so a
//! log entry never exists without its charge.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::debug;

use crate::{
    AppState,
    api::models::usage::{
        DailyUsage, DailyUsageQuery, OperationUsage, UsageRecordRequest, UsageRecordResponse, UsageSummaryQuery, UsageSummaryResponse,
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Credits, Repository, Tenants, UsageLogs},
        models::{
            credits::{CreditDebitDBRequest, CreditTransactionType, DebitOutcome},
            tenants::TenantStatus,
            usage::UsageLogCreateDBRequest,
        },
    },
    errors::{Error, Result},
    types::{Operation, Permission, Resource, TenantId},
};

const DEFAULT_SUMMARY_DAYS: i64 = 30;
const DEFAULT_DAILY_DAYS: u32 = 30;
const MAX_DAILY_DAYS: u32 = 366;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 200;

/// Ledger source id for a usage charge. Without a client key every call is a new charge.
pub fn usage_source_id(tenant_id: TenantId, idempotency_key: Option<&str>) -> String {
    match idempotency_key {
        Some(key) => format!("usage:{tenant_id}:{key}"),
        None => format!("usage:{tenant_id}:{}", uuid::Uuid::new_v4()),
    }
}

fn validate(request: &UsageRecordRequest) -> Result<(&str, Option<&str>)> {
    let operation = request.operation.trim();
    if operation.is_empty() {
        return Err(Error::BadRequest {
            message: "operation is required".to_string(),
        });
    }
    if request.quantity < 1 {
        return Err(Error::BadRequest {
            message: "quantity must be at least 1".to_string(),
        });
    }
    let key = request.idempotency_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
    if key.is_some_and(|k| k.len() > MAX_IDEMPOTENCY_KEY_LEN) {
        return Err(Error::BadRequest {
            message: format!("idempotency_key must be at most {MAX_IDEMPOTENCY_KEY_LEN} characters"),
        });
    }
    Ok((operation, key))
}

/// Record a tracked operation
#[utoipa::path(
    post,
    path = "/usage",
    tag = "usage",
    summary = "Record usage",
    description = "Charge the caller's organization for an operation priced in `credits.operation_costs`. \
                   Retrying with the same `idempotency_key` returns the original charge.",
    request_body = UsageRecordRequest,
    responses(
        (status = 201, description = "Usage recorded", body = UsageRecordResponse),
        (status = 200, description = "Idempotent replay; nothing new was charged", body = UsageRecordResponse),
        (status = 400, description = "Unknown operation or invalid quantity"),
        (status = 401, description = "Unauthorized"),
        (status = 402, description = "Insufficient credits"),
        (status = 403, description = "Organization is suspended"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn record_usage(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Usage, operation::CreateOwn>,
    Json(request): Json<UsageRecordRequest>,
) -> Result<(StatusCode, Json<UsageRecordResponse>)> {
    let tenant_id = perm.tenant_id()?;
    let (operation, idempotency_key) = validate(&request)?;
    let unit_cost = state.config.credits.cost_of(operation).ok_or_else(|| Error::BadRequest {
        message: format!("Unknown operation '{operation}'"),
    })?;
    let credits = unit_cost * Decimal::from(request.quantity);

    let mut tx = state.db.begin().await.map_err(DbError::from)?;

    let tenant = Tenants::new(&mut tx).get_by_id(tenant_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Tenant".to_string(),
        id: tenant_id.to_string(),
    })?;
    if tenant.status == TenantStatus::Suspended {
        return Err(Error::InsufficientPermissions {
            required: Permission::Allow(Resource::Usage, Operation::CreateOwn),
            action: Operation::CreateOwn,
            resource: "usage of a suspended organization".to_string(),
        });
    }

    let transaction = if credits > Decimal::ZERO {
        let outcome = Credits::new(&mut tx)
            .debit(&CreditDebitDBRequest {
                tenant_id,
                user_id: Some(perm.user.id),
                transaction_type: CreditTransactionType::Usage,
                amount: credits,
                source_id: usage_source_id(tenant_id, idempotency_key),
                description: Some(format!("{operation} x{}", request.quantity)),
            })
            .await?;
        match outcome {
            DebitOutcome::Applied(recorded) if recorded.replayed => {
                debug!(source_id = %recorded.transaction.source_id, "Usage already recorded");
                let balance = Credits::new(&mut tx).balance(tenant_id).await?;
                return Ok((
                    StatusCode::OK,
                    Json(UsageRecordResponse {
                        usage_log_id: None,
                        transaction_id: Some(recorded.transaction.id),
                        credits_charged: recorded.transaction.amount,
                        balance,
                        replayed: true,
                    }),
                ));
            }
            DebitOutcome::Applied(recorded) => Some(recorded.transaction),
            DebitOutcome::Insufficient { available } => {
                if let Some(metrics) = &state.credit_metrics {
                    metrics.record_rejection(operation);
                }
                return Err(Error::InsufficientCredits {
                    required: credits,
                    available,
                });
            }
        }
    } else {
        None
    };

    let log = UsageLogs::new(&mut tx)
        .record(&UsageLogCreateDBRequest {
            tenant_id,
            user_id: Some(perm.user.id),
            operation: operation.to_string(),
            quantity: request.quantity,
            credits,
            transaction_id: transaction.as_ref().map(|t| t.id),
            metadata: request.metadata.clone(),
        })
        .await?;

    let balance = match &transaction {
        Some(t) => t.balance_after,
        None => Credits::new(&mut tx).balance(tenant_id).await?,
    };
    tx.commit().await.map_err(DbError::from)?;

    if transaction.is_some()
        && let Some(metrics) = &state.credit_metrics
    {
        metrics.record_debit(CreditTransactionType::Usage, credits);
    }

    Ok((
        StatusCode::CREATED,
        Json(UsageRecordResponse {
            usage_log_id: Some(log.id),
            transaction_id: transaction.map(|t| t.id),
            credits_charged: credits,
            balance,
            replayed: false,
        }),
    ))
}

/// Per-operation usage totals
#[utoipa::path(
    get,
    path = "/usage/summary",
    tag = "usage",
    summary = "Summarise usage",
    params(UsageSummaryQuery),
    responses(
        (status = 200, description = "Totals per operation", body = UsageSummaryResponse),
        (status = 400, description = "`from` is after `to`"),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_usage_summary(
    State(state): State<AppState>,
    Query(query): Query<UsageSummaryQuery>,
    perm: RequiresPermission<resource::Usage, operation::ReadOwn>,
) -> Result<Json<UsageSummaryResponse>> {
    let tenant_id = perm.tenant_id()?;
    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - Duration::days(DEFAULT_SUMMARY_DAYS));
    if from > to {
        return Err(Error::BadRequest {
            message: "`from` must not be after `to`".to_string(),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let operations: Vec<OperationUsage> = UsageLogs::new(&mut conn)
        .summary(tenant_id, from, to)
        .await?
        .into_iter()
        .map(OperationUsage::from)
        .collect();
    let total_credits = operations.iter().map(|o| o.credits).sum();

    Ok(Json(UsageSummaryResponse {
        from,
        to,
        operations,
        total_credits,
    }))
}

/// Credits used per day
#[utoipa::path(
    get,
    path = "/usage/daily",
    tag = "usage",
    summary = "Daily usage",
    params(DailyUsageQuery),
    responses(
        (status = 200, description = "Credits per day, oldest first", body = Vec<DailyUsage>),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_daily_usage(
    State(state): State<AppState>,
    Query(query): Query<DailyUsageQuery>,
    perm: RequiresPermission<resource::Usage, operation::ReadOwn>,
) -> Result<Json<Vec<DailyUsage>>> {
    let tenant_id = perm.tenant_id()?;
    let days = query.days.unwrap_or(DEFAULT_DAILY_DAYS).clamp(1, MAX_DAILY_DAYS);
    let since = Utc::now() - Duration::days(i64::from(days));

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let rows = UsageLogs::new(&mut conn).daily(tenant_id, since).await?;
    Ok(Json(rows.into_iter().map(DailyUsage::from).collect()))
}
