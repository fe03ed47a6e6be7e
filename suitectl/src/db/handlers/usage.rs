use crate::db::{
    errors::Result,
    models::usage::{DailyUsageDBRow, OperationUsageDBRow, UsageLogCreateDBRequest, UsageLogDBResponse},
};
use crate::types::{TenantId, abbrev_uuid};
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

pub struct UsageLogs<'c> {
    db: &'c mut PgConnection,
}

impl<'c> UsageLogs<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(tenant_id = %abbrev_uuid(&request.tenant_id), operation = %request.operation), err)]
    pub async fn record(&mut self, request: &UsageLogCreateDBRequest) -> Result<UsageLogDBResponse> {
        let log = sqlx::query_as::<_, UsageLogDBResponse>(
            r#"
            INSERT INTO usage_logs (tenant_id, user_id, operation, quantity, credits, transaction_id, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, tenant_id, user_id, operation, quantity, credits, transaction_id, metadata, created_at
            "#,
        )
        .bind(request.tenant_id)
        .bind(request.user_id)
        .bind(&request.operation)
        .bind(request.quantity)
        .bind(request.credits)
        .bind(request.transaction_id)
        .bind(&request.metadata)
        .fetch_one(&mut *self.db)
        .await?;
        Ok(log)
    }

    /// Totals per operation for `[from, to)`, most expensive first.
    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn summary(&mut self, tenant_id: TenantId, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<OperationUsageDBRow>> {
        let rows = sqlx::query_as::<_, OperationUsageDBRow>(
            r#"
            SELECT operation,
                   COUNT(*) AS count,
                   COALESCE(SUM(quantity), 0)::BIGINT AS quantity,
                   COALESCE(SUM(credits), 0) AS credits
            FROM usage_logs
            WHERE tenant_id = $1 AND created_at >= $2 AND created_at < $3
            GROUP BY operation
            ORDER BY credits DESC, operation ASC
            "#,
        )
        .bind(tenant_id)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows)
    }

    /// Credits per UTC day since `since`, oldest first. Days without usage are omitted.
    #[instrument(skip(self), fields(tenant_id = %abbrev_uuid(&tenant_id)), err)]
    pub async fn daily(&mut self, tenant_id: TenantId, since: DateTime<Utc>) -> Result<Vec<DailyUsageDBRow>> {
        let rows = sqlx::query_as::<_, DailyUsageDBRow>(
            r#"
            SELECT (created_at AT TIME ZONE 'UTC')::date AS day,
                   COUNT(*) AS count,
                   COALESCE(SUM(credits), 0) AS credits
            FROM usage_logs
            WHERE tenant_id = $1 AND created_at >= $2
            GROUP BY day
            ORDER BY day ASC
            "#,
        )
        .bind(tenant_id)
        .bind(since)
        .fetch_all(&mut *self.db)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self), err)]
    pub async fn count_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM usage_logs WHERE created_at < $1")
            .bind(cutoff)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(count)
    }

    #[instrument(skip(self), err)]
    pub async fn delete_older_than(&mut self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM usage_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::create_test_tenant;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use sqlx::PgPool;

    fn log(tenant_id: TenantId, operation: &str, quantity: i32, credits: i64) -> UsageLogCreateDBRequest {
        UsageLogCreateDBRequest {
            tenant_id,
            user_id: None,
            operation: operation.to_string(),
            quantity,
            credits: Decimal::from(credits),
            transaction_id: None,
            metadata: Some(serde_json::json!({"source": "test"})),
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_summary_groups_by_operation(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "usage").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut usage = UsageLogs::new(&mut conn);

        usage.record(&log(tenant.id, "invoice_generate", 2, 4)).await.unwrap();
        usage.record(&log(tenant.id, "invoice_generate", 1, 2)).await.unwrap();
        usage.record(&log(tenant.id, "report_export", 1, 10)).await.unwrap();

        let now = Utc::now();
        let rows = usage.summary(tenant.id, now - Duration::hours(1), now + Duration::hours(1)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].operation, "report_export");
        assert_eq!(rows[1].count, 2);
        assert_eq!(rows[1].quantity, 3);
        assert_eq!(rows[1].credits, Decimal::from(6));

        let daily = usage.daily(tenant.id, now - Duration::days(7)).await.unwrap();
        assert_eq!(daily.iter().map(|d| d.count).sum::<i64>(), 3);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_retention_cleanup(pool: PgPool) {
        let tenant = create_test_tenant(&pool, "retain").await;
        let mut conn = pool.acquire().await.unwrap();
        let mut usage = UsageLogs::new(&mut conn);

        let old = usage.record(&log(tenant.id, "report_export", 1, 1)).await.unwrap();
        usage.record(&log(tenant.id, "report_export", 1, 1)).await.unwrap();
        sqlx::query("UPDATE usage_logs SET created_at = NOW() - INTERVAL '400 days' WHERE id = $1")
            .bind(old.id)
            .execute(&mut *conn)
            .await
            .unwrap();

        let mut usage = UsageLogs::new(&mut conn);
        let cutoff = Utc::now() - Duration::days(365);
        assert_eq!(usage.count_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(usage.delete_older_than(cutoff).await.unwrap(), 1);
        assert_eq!(usage.count_older_than(cutoff).await.unwrap(), 0);
    }
}
