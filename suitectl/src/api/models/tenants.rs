//! API request/response models for tenants.

use crate::api::models::credits::BalanceResponse;
use crate::api::models::subscriptions::SubscriptionResponse;
use crate::api::models::users::UserResponse;
use crate::db::models::tenants::{TenantDBResponse, TenantStatus};
use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
    pub status: TenantStatus,
    /// Whether the tenant is linked to an identity-provider organization
    pub identity_linked: bool,
    pub onboarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<TenantDBResponse> for TenantResponse {
    fn from(db: TenantDBResponse) -> Self {
        Self {
            id: db.id,
            name: db.name,
            slug: db.slug,
            industry: db.industry,
            company_size: db.company_size,
            country: db.country,
            status: db.status,
            identity_linked: db.identity_org_code.is_some(),
            onboarded_at: db.onboarded_at,
            created_at: db.created_at,
            updated_at: db.updated_at,
        }
    }
}

/// `GET /tenants/current`: the caller's tenant with its plan and balance.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentTenantResponse {
    #[serde(flatten)]
    pub tenant: TenantResponse,
    pub subscription: Option<SubscriptionResponse>,
    pub credits: BalanceResponse,
    pub member_count: i64,
}

/// Tenant admins may change their profile fields; status is platform-managed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TenantUpdate {
    pub name: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
}

/// How far a user got into the tenant's identity-provider organization.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySync {
    /// Member of the organization
    Synced,
    /// Invited by email; membership completes when they sign in
    Invited,
    /// Could not be reached; the org-assignment job will retry
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantInviteResponse {
    pub user: UserResponse,
    pub identity_sync: IdentitySync,
}
