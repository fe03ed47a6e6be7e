//! Database repository for users.

use crate::types::{TenantId, UserId, abbrev_uuid};
use crate::{
    api::models::users::Role,
    db::{
        errors::{DbError, Result},
        handlers::repository::Repository,
        models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
    },
};
use chrono::{DateTime, Utc};
use sqlx::{Connection, FromRow, PgConnection};
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

/// Filter for listing users
#[derive(Debug, Clone, Default)]
pub struct UserFilter {
    pub skip: i64,
    pub limit: i64,
    pub tenant_id: Option<TenantId>,
    /// Case-insensitive substring match on email or display name
    pub search: Option<String>,
}

impl UserFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            skip,
            limit,
            ..Default::default()
        }
    }

    pub fn in_tenant(mut self, tenant_id: TenantId) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = search.filter(|s| !s.trim().is_empty());
        self
    }
}

// Database entity model
#[derive(Debug, Clone, FromRow)]
struct User {
    pub id: UserId,
    pub tenant_id: Option<TenantId>,
    pub email: String,
    pub display_name: Option<String>,
    pub external_user_id: Option<String>,
    pub auth_source: String,
    pub is_admin: bool,
    pub last_login: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct UserRoleRow {
    user_id: UserId,
    role: Role,
}

const USER_COLUMNS: &str =
    "id, tenant_id, email, display_name, external_user_id, auth_source, is_admin, last_login, created_at, updated_at";

pub struct Users<'c> {
    db: &'c mut PgConnection,
}

impl From<(Vec<Role>, User)> for UserDBResponse {
    fn from((roles, user): (Vec<Role>, User)) -> Self {
        Self {
            id: user.id,
            tenant_id: user.tenant_id,
            email: user.email,
            display_name: user.display_name,
            external_user_id: user.external_user_id,
            auth_source: user.auth_source,
            is_admin: user.is_admin,
            roles,
            created_at: user.created_at,
            updated_at: user.updated_at,
            last_login: user.last_login,
        }
    }
}

#[async_trait::async_trait]
impl<'c> Repository for Users<'c> {
    type CreateRequest = UserCreateDBRequest;
    type UpdateRequest = UserUpdateDBRequest;
    type Response = UserDBResponse;
    type Id = UserId;
    type Filter = UserFilter;

    #[instrument(skip(self, request), fields(email = %request.email), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let user_id = Uuid::new_v4();

        let mut tx = self.db.begin().await?;
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (id, tenant_id, email, display_name, external_user_id, auth_source, is_admin)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(request.tenant_id)
        .bind(&request.email)
        .bind(&request.display_name)
        .bind(&request.external_user_id)
        .bind(&request.auth_source)
        .bind(request.is_admin)
        .fetch_one(&mut *tx)
        .await?;

        let roles = dedup_roles(&request.roles);
        replace_roles(&mut tx, user_id, &roles).await?;

        tx.commit().await?;

        Ok(UserDBResponse::from((roles, user)))
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;

        match user {
            Some(user) => Ok(self.attach_roles(vec![user]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<UserId>) -> Result<HashMap<Self::Id, UserDBResponse>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let users = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;

        Ok(self.attach_roles(users).await?.into_iter().map(|u| (u.id, u)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let search = filter.search.as_ref().map(|s| format!("%{}%", s.to_lowercase()));
        let users = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR LOWER(email) LIKE $2 OR LOWER(COALESCE(display_name, '')) LIKE $2)
            ORDER BY created_at ASC
            LIMIT $3 OFFSET $4
            "#
        ))
        .bind(filter.tenant_id)
        .bind(search)
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;

        self.attach_roles(users).await
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(user_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        // Touches users and user_roles, so always run in a transaction
        let mut tx = self.db.begin().await?;

        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            UPDATE users SET
                display_name = COALESCE($2, display_name),
                external_user_id = COALESCE($3, external_user_id),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.display_name)
        .bind(&request.external_user_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DbError::NotFound)?;

        if let Some(roles) = &request.roles {
            replace_roles(&mut tx, id, &dedup_roles(roles)).await?;
        }
        tx.commit().await?;

        Ok(self.attach_roles(vec![user]).await?.remove(0))
    }
}

impl<'c> Users<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, email), err)]
    pub async fn get_user_by_email(&mut self, email: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE LOWER(email) = LOWER($1)"))
            .bind(email)
            .fetch_optional(&mut *self.db)
            .await?;

        match user {
            Some(user) => Ok(self.attach_roles(vec![user]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    pub async fn get_user_by_external_id(&mut self, external_user_id: &str) -> Result<Option<UserDBResponse>> {
        let user = sqlx::query_as::<_, User>(&format!("SELECT {USER_COLUMNS} FROM users WHERE external_user_id = $1"))
            .bind(external_user_id)
            .fetch_optional(&mut *self.db)
            .await?;

        match user {
            Some(user) => Ok(self.attach_roles(vec![user]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Count users matching the filter (ignoring pagination).
    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &UserFilter) -> Result<i64> {
        let search = filter.search.as_ref().map(|s| format!("%{}%", s.to_lowercase()));
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*) FROM users
            WHERE ($1::uuid IS NULL OR tenant_id = $1)
              AND ($2::text IS NULL OR LOWER(email) LIKE $2 OR LOWER(COALESCE(display_name, '')) LIKE $2)
            "#,
        )
        .bind(filter.tenant_id)
        .bind(search)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// Move a tenantless user into a tenant and replace their roles.
    ///
    /// Returns `None` when the user already belongs to a tenant. The conditional update
    /// serializes concurrent claims on the user row, so only one of them can win.
    #[instrument(skip(self, roles), fields(user_id = %abbrev_uuid(&user_id), tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn claim_for_tenant(&mut self, user_id: UserId, tenant_id: TenantId, roles: &[Role]) -> Result<Option<UserDBResponse>> {
        let mut tx = self.db.begin().await?;
        let claimed = sqlx::query_as::<_, User>(&format!(
            "UPDATE users SET tenant_id = $2, updated_at = NOW() WHERE id = $1 AND tenant_id IS NULL RETURNING {USER_COLUMNS}"
        ))
        .bind(user_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(user) = claimed else {
            let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1)")
                .bind(user_id)
                .fetch_one(&mut *tx)
                .await?;
            return if exists { Ok(None) } else { Err(DbError::NotFound) };
        };

        // Platform managers keep their platform role when they also join a tenant
        let mut roles = dedup_roles(roles);
        let existing = fetch_roles(&mut tx, &[user_id]).await?;
        if existing.iter().any(|r| r.role == Role::PlatformManager) && !roles.contains(&Role::PlatformManager) {
            roles.push(Role::PlatformManager);
        }
        replace_roles(&mut tx, user_id, &roles).await?;
        tx.commit().await?;

        Ok(Some(UserDBResponse::from((roles, user))))
    }

    #[instrument(skip(self), fields(user_id = %abbrev_uuid(&user_id)), err)]
    pub async fn update_last_login(&mut self, user_id: UserId) -> Result<()> {
        sqlx::query("UPDATE users SET last_login = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Users of a tenant holding any of the given roles.
    #[instrument(skip(self, roles), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn list_tenant_users_with_roles(&mut self, tenant_id: TenantId, roles: &[Role]) -> Result<Vec<UserDBResponse>> {
        let users = sqlx::query_as::<_, User>(&format!(
            r#"
            SELECT {USER_COLUMNS} FROM users
            WHERE tenant_id = $1
              AND EXISTS (SELECT 1 FROM user_roles ur WHERE ur.user_id = users.id AND ur.role = ANY($2))
            ORDER BY created_at ASC
            "#
        ))
        .bind(tenant_id)
        .bind(roles)
        .fetch_all(&mut *self.db)
        .await?;

        self.attach_roles(users).await
    }

    /// Member counts keyed by tenant. Tenants without users are absent.
    #[instrument(skip(self, tenant_ids), fields(count = tenant_ids.len()), err)]
    pub async fn count_by_tenant(&mut self, tenant_ids: &[TenantId]) -> Result<HashMap<TenantId, i64>> {
        let rows = sqlx::query_as::<_, (TenantId, i64)>(
            "SELECT tenant_id, COUNT(*) FROM users WHERE tenant_id = ANY($1) GROUP BY tenant_id",
        )
        .bind(tenant_ids)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows.into_iter().collect())
    }

    /// Every user of a tenant, regardless of pagination.
    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn list_all_in_tenant(&mut self, tenant_id: TenantId) -> Result<Vec<UserDBResponse>> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE tenant_id = $1 ORDER BY created_at ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.db)
        .await?;

        self.attach_roles(users).await
    }

    async fn attach_roles(&mut self, users: Vec<User>) -> Result<Vec<UserDBResponse>> {
        let ids: Vec<UserId> = users.iter().map(|u| u.id).collect();
        let mut by_user: HashMap<UserId, Vec<Role>> = HashMap::new();
        for row in fetch_roles(&mut *self.db, &ids).await? {
            by_user.entry(row.user_id).or_default().push(row.role);
        }

        Ok(users
            .into_iter()
            .map(|user| {
                let roles = by_user.remove(&user.id).unwrap_or_default();
                UserDBResponse::from((roles, user))
            })
            .collect())
    }
}

fn dedup_roles(roles: &[Role]) -> Vec<Role> {
    let mut out: Vec<Role> = Vec::with_capacity(roles.len());
    for role in roles {
        if !out.contains(role) {
            out.push(*role);
        }
    }
    out
}

async fn fetch_roles(conn: &mut PgConnection, ids: &[UserId]) -> Result<Vec<UserRoleRow>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let rows = sqlx::query_as::<_, UserRoleRow>("SELECT user_id, role FROM user_roles WHERE user_id = ANY($1) ORDER BY role")
        .bind(ids)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

async fn replace_roles(conn: &mut PgConnection, user_id: UserId, roles: &[Role]) -> Result<()> {
    sqlx::query("DELETE FROM user_roles WHERE user_id = $1")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    for role in roles {
        sqlx::query("INSERT INTO user_roles (user_id, role) VALUES ($1, $2)")
            .bind(user_id)
            .bind(role)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}
