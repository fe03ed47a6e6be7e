//! API request/response models for usage tracking.

use crate::db::models::usage::{DailyUsageDBRow, OperationUsageDBRow};
use crate::types::{TransactionId, UsageLogId};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

fn default_quantity() -> i32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageRecordRequest {
    /// Operation name, priced by `credits.operation_costs`
    pub operation: String,
    #[serde(default = "default_quantity")]
    pub quantity: i32,
    pub metadata: Option<serde_json::Value>,
    /// Retrying with the same key charges once
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageRecordResponse {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub usage_log_id: Option<UsageLogId>,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub transaction_id: Option<TransactionId>,
    #[schema(value_type = String)]
    pub credits_charged: Decimal,
    #[schema(value_type = String)]
    pub balance: Decimal,
    /// The idempotency key had already been used; nothing new was charged
    pub replayed: bool,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct UsageSummaryQuery {
    /// Start of the range (default: 30 days ago)
    pub from: Option<DateTime<Utc>>,
    /// End of the range (default: now)
    pub to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OperationUsage {
    pub operation: String,
    pub count: i64,
    pub quantity: i64,
    #[schema(value_type = String)]
    pub credits: Decimal,
}

impl From<OperationUsageDBRow> for OperationUsage {
    fn from(row: OperationUsageDBRow) -> Self {
        Self {
            operation: row.operation,
            count: row.count,
            quantity: row.quantity,
            credits: row.credits,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UsageSummaryResponse {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub operations: Vec<OperationUsage>,
    #[schema(value_type = String)]
    pub total_credits: Decimal,
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct DailyUsageQuery {
    /// Number of days back from today (default 30, max 366)
    pub days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DailyUsage {
    pub day: NaiveDate,
    pub count: i64,
    #[schema(value_type = String)]
    pub credits: Decimal,
}

impl From<DailyUsageDBRow> for DailyUsage {
    fn from(row: DailyUsageDBRow) -> Self {
        Self {
            day: row.day,
            count: row.count,
            credits: row.credits,
        }
    }
}
