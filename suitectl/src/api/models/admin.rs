//! API models for platform administration of organizations (tenants).

use super::pagination::Pagination;
use crate::api::models::credits::{CreditAllocationResponse, CreditTransactionResponse};
use crate::api::models::subscriptions::SubscriptionResponse;
use crate::api::models::tenants::TenantResponse;
use crate::db::models::subscriptions::SubscriptionStatus;
use crate::db::models::tenants::TenantStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListOrganizationsQuery {
    /// Case-insensitive match on name or slug
    pub search: Option<String>,

    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

/// Row in the admin organization list.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationSummary {
    #[serde(flatten)]
    pub tenant: TenantResponse,
    pub plan_code: Option<String>,
    pub subscription_status: Option<SubscriptionStatus>,
    #[schema(value_type = String)]
    pub balance: Decimal,
    pub member_count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationDetail {
    #[serde(flatten)]
    pub tenant: TenantResponse,
    pub identity_org_code: Option<String>,
    pub subscription: Option<SubscriptionResponse>,
    #[schema(value_type = String)]
    pub balance: Decimal,
    pub member_count: i64,
    pub allocations: Vec<CreditAllocationResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct OrganizationUpdate {
    pub status: TenantStatus,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CreditAdjustmentType {
    AdminGrant,
    AdminRemoval,
}

/// Grant or remove credits. Grants with `expires_at` become seasonal grants.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationCreditAdjustment {
    pub transaction_type: CreditAdjustmentType,
    /// Absolute amount (string to preserve precision)
    #[schema(value_type = String)]
    pub amount: Decimal,
    /// Only valid for grants
    pub expires_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrganizationCreditAdjustmentResponse {
    pub transaction: CreditTransactionResponse,
    #[schema(value_type = String)]
    pub balance: Decimal,
}
