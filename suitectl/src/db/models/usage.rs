//! Database models for usage logs.

use crate::types::{TenantId, TransactionId, UsageLogId, UserId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;

#[derive(Debug, Clone)]
pub struct UsageLogCreateDBRequest {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub operation: String,
    pub quantity: i32,
    pub credits: Decimal,
    pub transaction_id: Option<TransactionId>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UsageLogDBResponse {
    pub id: UsageLogId,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub operation: String,
    pub quantity: i32,
    pub credits: Decimal,
    pub transaction_id: Option<TransactionId>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Per-operation totals over a time range
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OperationUsageDBRow {
    pub operation: String,
    pub count: i64,
    pub quantity: i64,
    pub credits: Decimal,
}

/// Credits consumed on one UTC day
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DailyUsageDBRow {
    pub day: NaiveDate,
    pub count: i64,
    pub credits: Decimal,
}
