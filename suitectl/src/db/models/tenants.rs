//! Database models for tenants.

use crate::types::TenantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "tenant_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
}

/// Database request for creating a new tenant
#[derive(Debug, Clone)]
pub struct TenantCreateDBRequest {
    pub name: String,
    pub slug: String,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
}

/// Database request for updating a tenant
#[derive(Debug, Clone, Default)]
pub struct TenantUpdateDBRequest {
    pub name: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
    pub status: Option<TenantStatus>,
}

/// Database response for a tenant
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TenantDBResponse {
    pub id: TenantId,
    pub name: String,
    pub slug: String,
    pub identity_org_code: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
    pub status: TenantStatus,
    pub onboarded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
