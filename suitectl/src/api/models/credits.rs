//! API request/response models for the credit ledger.

use super::pagination::Pagination;
use crate::db::models::credits::{AllocationType, CreditAllocationDBResponse, CreditTransactionDBResponse, CreditTransactionType};
use crate::types::{AllocationId, TenantId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    #[schema(value_type = String, format = "uuid")]
    pub tenant_id: TenantId,
    /// Current balance (string to preserve precision)
    #[schema(value_type = String)]
    pub balance: Decimal,
    /// Part of the balance that expires within the configured warning window
    #[schema(value_type = String)]
    pub expiring_soon: Decimal,
    /// Earliest expiry among live allocations
    pub next_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditTransactionResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TransactionId,
    #[schema(value_type = String, format = "uuid")]
    pub tenant_id: TenantId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub user_id: Option<UserId>,
    pub transaction_type: CreditTransactionType,
    /// Absolute amount; `transaction_type` says which direction
    #[schema(value_type = String)]
    pub amount: Decimal,
    #[schema(value_type = String)]
    pub balance_after: Decimal,
    pub source_id: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransactionDBResponse> for CreditTransactionResponse {
    fn from(db: CreditTransactionDBResponse) -> Self {
        Self {
            id: db.id,
            tenant_id: db.tenant_id,
            user_id: db.user_id,
            transaction_type: db.transaction_type,
            amount: db.amount,
            balance_after: db.balance_after,
            source_id: db.source_id,
            description: db.description,
            created_at: db.created_at,
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListTransactionsQuery {
    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreditAllocationResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: AllocationId,
    pub allocation_type: AllocationType,
    #[schema(value_type = String)]
    pub amount: Decimal,
    #[schema(value_type = String)]
    pub remaining: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditAllocationDBResponse> for CreditAllocationResponse {
    fn from(db: CreditAllocationDBResponse) -> Self {
        Self {
            id: db.id,
            allocation_type: db.allocation_type,
            amount: db.amount,
            remaining: db.remaining,
            expires_at: db.expires_at,
            expired_at: db.expired_at,
            created_at: db.created_at,
        }
    }
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListAllocationsQuery {
    /// Include allocations that have already expired
    #[serde(default)]
    pub include_expired: bool,
}
