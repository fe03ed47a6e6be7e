//! Seasonal credit maintenance: expire, warn, clean up.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::{
    api::models::users::Role,
    config::Config,
    db::{
        handlers::{Credits, Repository, Tenants, UsageLogs, Users},
        models::credits::CreditAllocationDBResponse,
    },
    email::{EmailService, ExpiringCredits},
    metrics::CreditMetrics,
    types::{AllocationId, TenantId},
};

/// Counts for one run. In a dry run they describe what would have happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SeasonalReport {
    pub dry_run: bool,
    pub allocations_expired: u64,
    pub credits_expired: Decimal,
    pub tenants_warned: u64,
    pub warning_emails_sent: u64,
    pub usage_logs_deleted: u64,
    pub expired_allocations_deleted: u64,
    pub failures: u64,
}

fn to_chrono(duration: std::time::Duration) -> anyhow::Result<chrono::Duration> {
    Ok(chrono::Duration::from_std(duration)?)
}

pub struct SeasonalCreditJob<'a> {
    pool: &'a PgPool,
    config: &'a Config,
    email: &'a EmailService,
    metrics: Option<&'a CreditMetrics>,
}

impl<'a> SeasonalCreditJob<'a> {
    pub fn new(pool: &'a PgPool, config: &'a Config, email: &'a EmailService, metrics: Option<&'a CreditMetrics>) -> Self {
        Self {
            pool,
            config,
            email,
            metrics,
        }
    }

    /// Run every step in order. Individual allocation or email failures are counted and the
    /// run continues; database errors outside those abort it.
    #[instrument(skip(self), err)]
    pub async fn run(&self, now: DateTime<Utc>, dry_run: bool) -> anyhow::Result<SeasonalReport> {
        let mut report = SeasonalReport {
            dry_run,
            ..Default::default()
        };
        self.expire(now, &mut report).await?;
        self.warn(now, &mut report).await?;
        self.clean_up(now, &mut report).await?;
        Ok(report)
    }

    async fn expire(&self, now: DateTime<Utc>, report: &mut SeasonalReport) -> anyhow::Result<()> {
        let mut conn = self.pool.acquire().await?;
        let due = Credits::new(&mut conn).list_due_for_expiry(now).await?;

        if report.dry_run {
            report.allocations_expired = due.len() as u64;
            report.credits_expired = due.iter().map(|a| a.remaining).sum();
            return Ok(());
        }

        let tenants: BTreeSet<TenantId> = due.iter().map(|a| a.tenant_id).collect();
        for tenant_id in tenants {
            // One transaction per tenant so one failure does not block the rest
            match Credits::new(&mut conn).expire_lapsed(tenant_id, now).await {
                Ok(expired) => {
                    for allocation in expired {
                        report.allocations_expired += 1;
                        report.credits_expired += allocation.expired_amount;
                        if let Some(metrics) = self.metrics
                            && allocation.expired_amount > Decimal::ZERO
                        {
                            metrics.record_expiry(allocation.expired_amount);
                        }
                    }
                }
                Err(e) => {
                    error!(tenant_id = %tenant_id, error = %e, "Failed to expire tenant allocations");
                    report.failures += 1;
                }
            }
        }
        info!(count = report.allocations_expired, credits = %report.credits_expired, "Expired allocations");
        Ok(())
    }

    async fn warn(&self, now: DateTime<Utc>, report: &mut SeasonalReport) -> anyhow::Result<()> {
        let until = now + to_chrono(self.config.seasonal_credits.warning_window)?;
        let mut conn = self.pool.acquire().await?;
        let expiring = Credits::new(&mut conn).list_expiring_unwarned(now, until).await?;

        let mut by_tenant: BTreeMap<TenantId, Vec<CreditAllocationDBResponse>> = BTreeMap::new();
        for allocation in expiring {
            by_tenant.entry(allocation.tenant_id).or_default().push(allocation);
        }

        for (tenant_id, allocations) in by_tenant {
            let Some(tenant) = Tenants::new(&mut conn).get_by_id(tenant_id).await? else {
                continue;
            };
            let recipients = Users::new(&mut conn)
                .list_tenant_users_with_roles(tenant_id, &[Role::TenantAdmin, Role::BillingManager])
                .await?;

            if report.dry_run {
                report.tenants_warned += 1;
                report.warning_emails_sent += recipients.len() as u64;
                continue;
            }

            let listed: Vec<ExpiringCredits> = allocations
                .iter()
                .filter_map(|a| {
                    a.expires_at.map(|expires_at| ExpiringCredits {
                        remaining: a.remaining,
                        expires_at,
                    })
                })
                .collect();

            let mut sent = 0u64;
            let mut failed = 0u64;
            for recipient in &recipients {
                match self
                    .email
                    .send_expiry_warning(&recipient.email, recipient.display_name.as_deref(), &tenant.name, &listed)
                    .await
                {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        warn!(%tenant_id, user_id = %recipient.id, error = %e, "Failed to send expiry warning");
                        failed += 1;
                    }
                }
            }
            report.warning_emails_sent += sent;
            report.failures += failed;

            if recipients.is_empty() {
                warn!(%tenant_id, "No administrators to warn about expiring credits");
            }
            // Retry next run unless someone was told
            if sent > 0 || recipients.is_empty() {
                let ids: Vec<AllocationId> = allocations.iter().map(|a| a.id).collect();
                Credits::new(&mut conn).mark_warning_sent(&ids, now).await?;
                report.tenants_warned += 1;
            }
        }
        info!(tenants = report.tenants_warned, emails = report.warning_emails_sent, "Sent expiry warnings");
        Ok(())
    }

    async fn clean_up(&self, now: DateTime<Utc>, report: &mut SeasonalReport) -> anyhow::Result<()> {
        let usage_cutoff = now - to_chrono(self.config.seasonal_credits.usage_log_retention)?;
        let allocation_cutoff = now - to_chrono(self.config.seasonal_credits.expired_allocation_retention)?;
        let mut conn = self.pool.acquire().await?;

        if report.dry_run {
            report.usage_logs_deleted = UsageLogs::new(&mut conn).count_older_than(usage_cutoff).await? as u64;
            report.expired_allocations_deleted = Credits::new(&mut conn).count_expired_allocations_before(allocation_cutoff).await? as u64;
            return Ok(());
        }

        report.usage_logs_deleted = UsageLogs::new(&mut conn).delete_older_than(usage_cutoff).await?;
        report.expired_allocations_deleted = Credits::new(&mut conn).delete_expired_allocations_before(allocation_cutoff).await?;
        info!(
            usage_logs = report.usage_logs_deleted,
            allocations = report.expired_allocations_deleted,
            "Pruned old rows"
        );
        Ok(())
    }
}

/// Run the job on an interval while this instance is the leader.
pub async fn run_schedule(
    pool: PgPool,
    config: Config,
    metrics: Option<CreditMetrics>,
    is_leader: Arc<AtomicBool>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let email = EmailService::new(&config)?;
    let mut ticker = tokio::time::interval(config.seasonal_credits.schedule.interval);
    info!(interval = ?config.seasonal_credits.schedule.interval, "Seasonal credit schedule started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        if !is_leader.load(Ordering::Relaxed) {
            continue;
        }
        let job = SeasonalCreditJob::new(&pool, &config, &email, metrics.as_ref());
        match job.run(Utc::now(), false).await {
            Ok(report) if report.failures > 0 => warn!(?report, "Seasonal credit run finished with failures"),
            Ok(report) => info!(?report, "Seasonal credit run finished"),
            Err(e) => error!(error = %e, "Seasonal credit run failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmailTransportConfig;
    use crate::db::models::credits::{CreditGrantDBRequest, CreditTransactionType};
    use crate::db::models::usage::UsageLogCreateDBRequest;
    use crate::test_utils::{create_test_config, create_test_tenant, create_test_user_with_roles};
    use chrono::Duration;

    fn email_config(dir: &std::path::Path) -> Config {
        let mut config = create_test_config();
        config.email.transport = EmailTransportConfig::File {
            path: dir.to_string_lossy().to_string(),
        };
        config
    }

    async fn grant(pool: &PgPool, tenant_id: TenantId, amount: i64, expires_at: Option<DateTime<Utc>>, source: &str) {
        let mut conn = pool.acquire().await.unwrap();
        Credits::new(&mut conn)
            .grant(&CreditGrantDBRequest {
                tenant_id,
                user_id: None,
                transaction_type: CreditTransactionType::SeasonalGrant,
                amount: Decimal::from(amount),
                expires_at,
                source_id: source.to_string(),
                description: None,
            })
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn expires_past_allocations_and_keeps_the_rest(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = email_config(dir.path());
        let email = EmailService::new(&config).unwrap();
        let tenant = create_test_tenant(&pool, "seasonal").await;
        let now = Utc::now();

        grant(&pool, tenant.id, 100, Some(now - Duration::days(1)), "s:past").await;
        grant(&pool, tenant.id, 40, Some(now + Duration::days(60)), "s:future").await;
        grant(&pool, tenant.id, 10, None, "s:forever").await;

        let report = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(report.allocations_expired, 1);
        assert_eq!(report.credits_expired, Decimal::from(100));
        assert_eq!(report.failures, 0);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Credits::new(&mut conn).balance(tenant.id).await.unwrap(), Decimal::from(50));

        // A second run finds nothing left to do
        let again = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(again.allocations_expired, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn dry_run_reports_without_writing(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = email_config(dir.path());
        let email = EmailService::new(&config).unwrap();
        let tenant = create_test_tenant(&pool, "dry-run").await;
        create_test_user_with_roles(&pool, tenant.id, "admin@dry.test", vec![Role::TenantAdmin]).await;
        let now = Utc::now();

        grant(&pool, tenant.id, 25, Some(now - Duration::hours(1)), "d:past").await;
        grant(&pool, tenant.id, 5, Some(now + Duration::days(2)), "d:soon").await;

        let report = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, true).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.allocations_expired, 1);
        assert_eq!(report.credits_expired, Decimal::from(25));
        assert_eq!(report.tenants_warned, 1);
        assert_eq!(report.warning_emails_sent, 1);

        let mut conn = pool.acquire().await.unwrap();
        assert_eq!(Credits::new(&mut conn).balance(tenant.id).await.unwrap(), Decimal::from(30));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn warns_admins_once_per_allocation(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = email_config(dir.path());
        let email = EmailService::new(&config).unwrap();
        let tenant = create_test_tenant(&pool, "warned").await;
        create_test_user_with_roles(&pool, tenant.id, "owner@warned.test", vec![Role::TenantAdmin]).await;
        create_test_user_with_roles(&pool, tenant.id, "billing@warned.test", vec![Role::BillingManager]).await;
        create_test_user_with_roles(&pool, tenant.id, "member@warned.test", vec![Role::Member]).await;
        let now = Utc::now();

        grant(&pool, tenant.id, 80, Some(now + Duration::days(3)), "w:soon").await;
        grant(&pool, tenant.id, 80, Some(now + Duration::days(30)), "w:later").await;

        let report = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(report.tenants_warned, 1);
        assert_eq!(report.warning_emails_sent, 2);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);

        let again = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(again.tenants_warned, 0);
        assert_eq!(again.warning_emails_sent, 0);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn prunes_old_usage_logs(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = email_config(dir.path());
        let email = EmailService::new(&config).unwrap();
        let tenant = create_test_tenant(&pool, "pruned").await;

        let mut conn = pool.acquire().await.unwrap();
        let log = UsageLogs::new(&mut conn)
            .record(&UsageLogCreateDBRequest {
                tenant_id: tenant.id,
                user_id: None,
                operation: "invoice.create".to_string(),
                quantity: 1,
                credits: Decimal::ZERO,
                transaction_id: None,
                metadata: None,
            })
            .await
            .unwrap();
        sqlx::query("UPDATE usage_logs SET created_at = NOW() - INTERVAL '400 days' WHERE id = $1")
            .bind(log.id)
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);

        let report = SeasonalCreditJob::new(&pool, &config, &email, None).run(Utc::now(), false).await.unwrap();
        assert_eq!(report.usage_logs_deleted, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn prunes_expired_allocations_past_retention(pool: PgPool) {
        let dir = tempfile::tempdir().unwrap();
        let config = email_config(dir.path());
        let email = EmailService::new(&config).unwrap();
        let tenant = create_test_tenant(&pool, "retention").await;
        let now = Utc::now();

        grant(&pool, tenant.id, 60, Some(now - Duration::days(1)), "r:past").await;
        let first = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(first.allocations_expired, 1);
        assert_eq!(first.expired_allocations_deleted, 0);

        let mut conn = pool.acquire().await.unwrap();
        let (allocation_id,): (AllocationId,) = sqlx::query_as("SELECT id FROM credit_allocations WHERE tenant_id = $1")
            .bind(tenant.id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        sqlx::query("UPDATE credit_allocations SET expired_at = NOW() - INTERVAL '400 days' WHERE id = $1")
            .bind(allocation_id)
            .execute(&mut *conn)
            .await
            .unwrap();
        drop(conn);

        let second = SeasonalCreditJob::new(&pool, &config, &email, None).run(now, false).await.unwrap();
        assert_eq!(second.expired_allocations_deleted, 1);

        let mut conn = pool.acquire().await.unwrap();
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credit_allocations WHERE id = $1")
            .bind(allocation_id)
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(remaining, 0);

        // The grant and expiry history survives, detached from the pruned allocation
        let detached: Vec<(Option<AllocationId>, CreditTransactionType)> = sqlx::query_as(
            "SELECT allocation_id, transaction_type FROM credit_transactions WHERE tenant_id = $1 ORDER BY created_at",
        )
        .bind(tenant.id)
        .fetch_all(&mut *conn)
        .await
        .unwrap();
        assert_eq!(detached.len(), 2);
        assert!(detached.iter().all(|(allocation, _)| allocation.is_none()));
        assert_eq!(detached[1].1, CreditTransactionType::Expiry);
        assert_eq!(Credits::new(&mut conn).balance(tenant.id).await.unwrap(), Decimal::ZERO);
    }
}
