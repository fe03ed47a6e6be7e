//! Database models for users.

use crate::api::models::users::Role;
use crate::types::{TenantId, UserId};
use chrono::{DateTime, Utc};

/// Database request for creating a new user
#[derive(Debug, Clone)]
pub struct UserCreateDBRequest {
    pub tenant_id: Option<TenantId>,
    pub email: String,
    pub display_name: Option<String>,
    pub external_user_id: Option<String>,
    pub auth_source: String,
    pub is_admin: bool,
    pub roles: Vec<Role>,
}

/// Database request for updating a user. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct UserUpdateDBRequest {
    pub display_name: Option<String>,
    pub roles: Option<Vec<Role>>,
    pub external_user_id: Option<String>,
}

/// Database response for a user
#[derive(Debug, Clone)]
pub struct UserDBResponse {
    pub id: UserId,
    pub tenant_id: Option<TenantId>,
    pub email: String,
    pub display_name: Option<String>,
    pub external_user_id: Option<String>,
    pub auth_source: String,
    pub is_admin: bool,
    pub roles: Vec<Role>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}
