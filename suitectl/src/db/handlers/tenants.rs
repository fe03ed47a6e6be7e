//! Database repository for tenants.

use crate::db::{
    errors::{DbError, Result},
    handlers::repository::Repository,
    models::tenants::{TenantCreateDBRequest, TenantDBResponse, TenantUpdateDBRequest},
};
use crate::types::{TenantId, abbrev_uuid};
use sqlx::PgConnection;
use std::collections::HashMap;
use tracing::instrument;

/// Filter for listing tenants
#[derive(Debug, Clone, Default)]
pub struct TenantFilter {
    pub skip: i64,
    pub limit: i64,
    /// Case-insensitive match on name or slug
    pub search: Option<String>,
}

impl TenantFilter {
    pub fn new(skip: i64, limit: i64) -> Self {
        Self {
            skip,
            limit,
            search: None,
        }
    }

    pub fn with_search(mut self, search: Option<String>) -> Self {
        self.search = search.filter(|s| !s.trim().is_empty());
        self
    }

    fn search_pattern(&self) -> Option<String> {
        self.search.as_ref().map(|s| format!("%{}%", s.trim().to_lowercase()))
    }
}

const TENANT_COLUMNS: &str =
    "id, name, slug, identity_org_code, industry, company_size, country, status, onboarded_at, created_at, updated_at";

pub struct Tenants<'c> {
    db: &'c mut PgConnection,
}

#[async_trait::async_trait]
impl<'c> Repository for Tenants<'c> {
    type CreateRequest = TenantCreateDBRequest;
    type UpdateRequest = TenantUpdateDBRequest;
    type Response = TenantDBResponse;
    type Id = TenantId;
    type Filter = TenantFilter;

    #[instrument(skip(self, request), fields(slug = %request.slug), err)]
    async fn create(&mut self, request: &Self::CreateRequest) -> Result<Self::Response> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!(
            r#"
            INSERT INTO tenants (name, slug, industry, company_size, country)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(&request.name)
        .bind(&request.slug)
        .bind(&request.industry)
        .bind(&request.company_size)
        .bind(&request.country)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(tenant)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&id)), err)]
    async fn get_by_id(&mut self, id: Self::Id) -> Result<Option<Self::Response>> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(tenant)
    }

    #[instrument(skip(self, ids), fields(count = ids.len()), err)]
    async fn get_bulk(&mut self, ids: Vec<TenantId>) -> Result<HashMap<Self::Id, Self::Response>> {
        let tenants = sqlx::query_as::<_, TenantDBResponse>(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = ANY($1)"))
            .bind(&ids)
            .fetch_all(&mut *self.db)
            .await?;
        Ok(tenants.into_iter().map(|t| (t.id, t)).collect())
    }

    #[instrument(skip(self, filter), fields(limit = filter.limit, skip = filter.skip), err)]
    async fn list(&mut self, filter: &Self::Filter) -> Result<Vec<Self::Response>> {
        let tenants = sqlx::query_as::<_, TenantDBResponse>(&format!(
            r#"
            SELECT {TENANT_COLUMNS} FROM tenants
            WHERE ($1::text IS NULL OR LOWER(name) LIKE $1 OR slug LIKE $1)
            ORDER BY created_at DESC, id
            LIMIT $2 OFFSET $3
            "#
        ))
        .bind(filter.search_pattern())
        .bind(filter.limit)
        .bind(filter.skip)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(tenants)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&id)), err)]
    async fn delete(&mut self, id: Self::Id) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tenants WHERE id = $1").bind(id).execute(&mut *self.db).await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&id)), err)]
    async fn update(&mut self, id: Self::Id, request: &Self::UpdateRequest) -> Result<Self::Response> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!(
            r#"
            UPDATE tenants SET
                name = COALESCE($2, name),
                industry = COALESCE($3, industry),
                company_size = COALESCE($4, company_size),
                country = COALESCE($5, country),
                status = COALESCE($6, status),
                updated_at = NOW()
            WHERE id = $1
            RETURNING {TENANT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(&request.name)
        .bind(&request.industry)
        .bind(&request.company_size)
        .bind(&request.country)
        .bind(request.status)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(tenant)
    }
}

impl<'c> Tenants<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_slug(&mut self, slug: &str) -> Result<Option<TenantDBResponse>> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE slug = $1"))
            .bind(slug)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(tenant)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_org_code(&mut self, org_code: &str) -> Result<Option<TenantDBResponse>> {
        let tenant =
            sqlx::query_as::<_, TenantDBResponse>(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE identity_org_code = $1"))
                .bind(org_code)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(tenant)
    }

    #[instrument(skip(self), err)]
    pub async fn slug_available(&mut self, slug: &str) -> Result<bool> {
        let taken = sqlx::query_scalar::<_, bool>("SELECT EXISTS (SELECT 1 FROM tenants WHERE slug = $1)")
            .bind(slug)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(!taken)
    }

    #[instrument(skip(self, filter), err)]
    pub async fn count(&mut self, filter: &TenantFilter) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM tenants WHERE ($1::text IS NULL OR LOWER(name) LIKE $1 OR slug LIKE $1)",
        )
        .bind(filter.search_pattern())
        .fetch_one(&mut *self.db)
        .await?;
        Ok(count)
    }

    /// All tenants, oldest first. Used by maintenance jobs.
    #[instrument(skip(self), err)]
    pub async fn list_all(&mut self) -> Result<Vec<TenantDBResponse>> {
        let tenants = sqlx::query_as::<_, TenantDBResponse>(&format!("SELECT {TENANT_COLUMNS} FROM tenants ORDER BY created_at ASC"))
            .fetch_all(&mut *self.db)
            .await?;
        Ok(tenants)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&id)), err)]
    pub async fn set_identity_org_code(&mut self, id: TenantId, org_code: &str) -> Result<TenantDBResponse> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!(
            "UPDATE tenants SET identity_org_code = $2, updated_at = NOW() WHERE id = $1 RETURNING {TENANT_COLUMNS}"
        ))
        .bind(id)
        .bind(org_code)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(tenant)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&id)), err)]
    pub async fn mark_onboarded(&mut self, id: TenantId) -> Result<TenantDBResponse> {
        let tenant = sqlx::query_as::<_, TenantDBResponse>(&format!(
            "UPDATE tenants SET onboarded_at = COALESCE(onboarded_at, NOW()), updated_at = NOW() WHERE id = $1 RETURNING {TENANT_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::tenants::TenantStatus;
    use sqlx::PgPool;

    fn request(name: &str, slug: &str) -> TenantCreateDBRequest {
        TenantCreateDBRequest {
            name: name.to_string(),
            slug: slug.to_string(),
            industry: Some("retail".to_string()),
            company_size: None,
            country: Some("DE".to_string()),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_and_lookup(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Tenants::new(&mut conn);

        let tenant = repo.create(&request("Acme Corp", "acme-corp")).await.unwrap();
        assert_eq!(tenant.status, TenantStatus::Active);
        assert!(tenant.onboarded_at.is_none());

        assert_eq!(repo.get_by_slug("acme-corp").await.unwrap().unwrap().id, tenant.id);
        assert!(!repo.slug_available("acme-corp").await.unwrap());
        assert!(repo.slug_available("globex").await.unwrap());

        repo.set_identity_org_code(tenant.id, "org_123").await.unwrap();
        assert_eq!(repo.get_by_org_code("org_123").await.unwrap().unwrap().id, tenant.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_duplicate_slug_rejected(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Tenants::new(&mut conn);

        repo.create(&request("Acme", "acme")).await.unwrap();
        let err = repo.create(&request("Acme Two", "acme")).await.unwrap_err();
        assert!(err.is_unique_violation_on("tenants_slug_unique"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_malformed_slug_fails_check(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Tenants::new(&mut conn);

        let err = repo.create(&request("Bad", "-bad-")).await.unwrap_err();
        assert!(matches!(err, DbError::CheckViolation { .. }));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_and_mark_onboarded(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Tenants::new(&mut conn);
        let tenant = repo.create(&request("Acme", "acme")).await.unwrap();

        let updated = repo
            .update(
                tenant.id,
                &TenantUpdateDBRequest {
                    name: Some("Acme Holdings".to_string()),
                    status: Some(TenantStatus::Suspended),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Acme Holdings");
        assert_eq!(updated.status, TenantStatus::Suspended);
        assert_eq!(updated.country.as_deref(), Some("DE"));

        let first = repo.mark_onboarded(tenant.id).await.unwrap().onboarded_at.unwrap();
        let second = repo.mark_onboarded(tenant.id).await.unwrap().onboarded_at.unwrap();
        assert_eq!(first, second);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_list_with_search(pool: PgPool) {
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Tenants::new(&mut conn);
        repo.create(&request("Acme", "acme")).await.unwrap();
        repo.create(&request("Globex", "globex")).await.unwrap();
        repo.create(&request("Initech", "initech")).await.unwrap();

        assert_eq!(repo.list(&TenantFilter::new(0, 2)).await.unwrap().len(), 2);
        assert_eq!(repo.count(&TenantFilter::new(0, 2)).await.unwrap(), 3);

        let filter = TenantFilter::new(0, 10).with_search(Some("GLOB".to_string()));
        let found = repo.list(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].slug, "globex");
        assert_eq!(repo.count(&filter).await.unwrap(), 1);
    }
}
