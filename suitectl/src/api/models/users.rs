//! API request/response models for users.

use super::pagination::Pagination;
use crate::db::models::users::UserDBResponse;
use crate::types::{TenantId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Roles a user can hold. `PlatformManager` is platform-wide; the rest apply within the user's tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, Hash, ToSchema)]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
pub enum Role {
    PlatformManager,
    TenantAdmin,
    BillingManager,
    Member,
}

impl Role {
    /// Roles given to the user who onboards a tenant.
    pub fn tenant_owner_roles() -> Vec<Role> {
        vec![Role::TenantAdmin, Role::BillingManager, Role::Member]
    }
}

/// Body for inviting a user into the caller's tenant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TenantUserInvite {
    pub email: String,
    pub display_name: Option<String>,
    /// Defaults to `[Member]`. `PlatformManager` cannot be granted here.
    #[serde(default)]
    pub roles: Vec<Role>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListUsersQuery {
    /// Case-insensitive match on email or display name
    pub search: Option<String>,

    #[serde(flatten)]
    #[param(inline)]
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UserResponse {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub tenant_id: Option<TenantId>,
    pub email: String,
    pub display_name: Option<String>,
    pub is_admin: bool,
    pub roles: Vec<Role>,
    pub auth_source: String,
    /// Whether the user is linked to an identity-provider account
    pub has_external_identity: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// The authenticated caller, as seen by handlers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CurrentUser {
    #[schema(value_type = String, format = "uuid")]
    pub id: UserId,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub tenant_id: Option<TenantId>,
    pub email: String,
    pub display_name: Option<String>,
    pub external_user_id: Option<String>,
    pub is_admin: bool,
    pub roles: Vec<Role>,
}

impl CurrentUser {
    pub fn has_role(&self, role: Role) -> bool {
        self.roles.contains(&role)
    }
}

impl From<UserDBResponse> for UserResponse {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            tenant_id: db.tenant_id,
            email: db.email,
            display_name: db.display_name,
            is_admin: db.is_admin,
            roles: db.roles,
            auth_source: db.auth_source,
            has_external_identity: db.external_user_id.is_some(),
            created_at: db.created_at,
            updated_at: db.updated_at,
            last_login: db.last_login,
        }
    }
}

impl From<UserDBResponse> for CurrentUser {
    fn from(db: UserDBResponse) -> Self {
        Self {
            id: db.id,
            tenant_id: db.tenant_id,
            email: db.email,
            display_name: db.display_name,
            external_user_id: db.external_user_id,
            is_admin: db.is_admin,
            roles: db.roles,
        }
    }
}
