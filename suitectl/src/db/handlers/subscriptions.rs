use crate::db::{
    errors::{DbError, Result},
    models::subscriptions::{SubscriptionCreateDBRequest, SubscriptionDBResponse, SubscriptionUpdateDBRequest},
};
use crate::types::{TenantId, abbrev_uuid};
use sqlx::PgConnection;
use std::collections::HashMap;
use tracing::instrument;

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, plan_code, status, provider_customer_id, provider_subscription_id, \
     trial_ends_at, current_period_start, current_period_end, canceled_at, created_at, updated_at";

pub struct Subscriptions<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Subscriptions<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&request.tenant_id), plan = %request.plan_code), err)]
    pub async fn create(&mut self, request: &SubscriptionCreateDBRequest) -> Result<SubscriptionDBResponse> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            INSERT INTO subscriptions (tenant_id, plan_code, status, trial_ends_at, current_period_end)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(request.tenant_id)
        .bind(&request.plan_code)
        .bind(request.status)
        .bind(request.trial_ends_at)
        .bind(request.current_period_end)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(subscription)
    }

    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn get_by_tenant(&mut self, tenant_id: TenantId) -> Result<Option<SubscriptionDBResponse>> {
        let subscription =
            sqlx::query_as::<_, SubscriptionDBResponse>(&format!("SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = $1"))
                .bind(tenant_id)
                .fetch_optional(&mut *self.db)
                .await?;
        Ok(subscription)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_provider_subscription(&mut self, provider_subscription_id: &str) -> Result<Option<SubscriptionDBResponse>> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_subscription_id = $1"
        ))
        .bind(provider_subscription_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(subscription)
    }

    #[instrument(skip(self), err)]
    pub async fn get_by_provider_customer(&mut self, provider_customer_id: &str) -> Result<Option<SubscriptionDBResponse>> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE provider_customer_id = $1"
        ))
        .bind(provider_customer_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(subscription)
    }

    #[instrument(skip(self, tenant_ids), fields(count = tenant_ids.len()), err)]
    pub async fn get_for_tenants(&mut self, tenant_ids: &[TenantId]) -> Result<HashMap<TenantId, SubscriptionDBResponse>> {
        let subscriptions = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE tenant_id = ANY($1)"
        ))
        .bind(tenant_ids)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(subscriptions.into_iter().map(|s| (s.tenant_id, s)).collect())
    }

    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn update_for_tenant(&mut self, tenant_id: TenantId, request: &SubscriptionUpdateDBRequest) -> Result<SubscriptionDBResponse> {
        let subscription = sqlx::query_as::<_, SubscriptionDBResponse>(&format!(
            r#"
            UPDATE subscriptions SET
                plan_code = COALESCE($2, plan_code),
                status = COALESCE($3, status),
                provider_customer_id = COALESCE($4, provider_customer_id),
                provider_subscription_id = COALESCE($5, provider_subscription_id),
                current_period_start = COALESCE($6, current_period_start),
                current_period_end = COALESCE($7, current_period_end),
                canceled_at = COALESCE($8, canceled_at),
                updated_at = NOW()
            WHERE tenant_id = $1
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(&request.plan_code)
        .bind(request.status)
        .bind(&request.provider_customer_id)
        .bind(&request.provider_subscription_id)
        .bind(request.current_period_start)
        .bind(request.current_period_end)
        .bind(request.canceled_at)
        .fetch_optional(&mut *self.db)
        .await?
        .ok_or(DbError::NotFound)?;
        Ok(subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::subscriptions::SubscriptionStatus;
    use crate::test_utils::create_test_tenant;
    use chrono::{Duration, Utc};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_one_subscription_per_tenant(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "subs").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Subscriptions::new(&mut conn);

        let request = SubscriptionCreateDBRequest {
            tenant_id: tenant.id,
            plan_code: "starter".to_string(),
            status: SubscriptionStatus::Trialing,
            trial_ends_at: Some(Utc::now() + Duration::days(14)),
            current_period_end: None,
        };
        repo.create(&request).await.unwrap();
        let err = repo.create(&request).await.unwrap_err();
        assert!(err.is_unique_violation_on("subscriptions_tenant_unique"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_update_mirrors_provider_state(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "mirror").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut repo = Subscriptions::new(&mut conn);

        repo.create(&SubscriptionCreateDBRequest {
            tenant_id: tenant.id,
            plan_code: "starter".to_string(),
            status: SubscriptionStatus::Active,
            trial_ends_at: None,
            current_period_end: None,
        })
        .await
        .unwrap();

        let updated = repo
            .update_for_tenant(
                tenant.id,
                &SubscriptionUpdateDBRequest {
                    plan_code: Some("growth".to_string()),
                    provider_customer_id: Some("cus_1".to_string()),
                    provider_subscription_id: Some("sub_1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.plan_code, "growth");
        assert_eq!(updated.status, SubscriptionStatus::Active);

        assert_eq!(repo.get_by_provider_subscription("sub_1").await.unwrap().unwrap().tenant_id, tenant.id);
        assert_eq!(repo.get_by_provider_customer("cus_1").await.unwrap().unwrap().tenant_id, tenant.id);
    }

    #[test]
    fn provider_status_mapping() {
        assert_eq!(SubscriptionStatus::from_provider("active"), SubscriptionStatus::Active);
        assert_eq!(SubscriptionStatus::from_provider("canceled"), SubscriptionStatus::Canceled);
        assert_eq!(SubscriptionStatus::from_provider("unpaid"), SubscriptionStatus::PastDue);
    }
}
