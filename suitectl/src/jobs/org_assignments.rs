//! Reconcile identity-provider organization membership with tenant membership.
//!
//! Tenants whose organization could not be created at onboarding, and users who were never
//! added to their tenant's organization, end up here.

use serde::Serialize;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};

use crate::{
    api::models::tenants::IdentitySync,
    config::{FixOrgAssignmentsArgs, IdentityConfig},
    db::{
        handlers::{Repository, Tenants, Users},
        models::{tenants::TenantDBResponse, users::UserDBResponse},
    },
    identity::IdentityProvider,
    onboarding::{place_member, provider_roles},
};

/// Counts for one run. In a dry run they describe the planned changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrgAssignmentReport {
    pub dry_run: bool,
    pub tenants_checked: u64,
    pub users_checked: u64,
    /// Users without an identity-provider account
    pub users_skipped: u64,
    pub added: u64,
    pub invited: u64,
    pub removed: u64,
    pub orgs_created: u64,
    pub failures: u64,
}

impl OrgAssignmentReport {
    pub fn has_failures(&self) -> bool {
        self.failures > 0
    }
}

pub struct OrgAssignmentFixer<'a> {
    pool: &'a PgPool,
    provider: &'a dyn IdentityProvider,
    identity: &'a IdentityConfig,
    args: &'a FixOrgAssignmentsArgs,
}

impl<'a> OrgAssignmentFixer<'a> {
    pub fn new(pool: &'a PgPool, provider: &'a dyn IdentityProvider, identity: &'a IdentityConfig, args: &'a FixOrgAssignmentsArgs) -> Self {
        Self {
            pool,
            provider,
            identity,
            args,
        }
    }

    #[instrument(skip(self), fields(dry_run = self.args.dry_run, tenant = ?self.args.tenant), err)]
    pub async fn run(&self) -> anyhow::Result<OrgAssignmentReport> {
        let mut report = OrgAssignmentReport {
            dry_run: self.args.dry_run,
            ..Default::default()
        };

        let tenants = {
            let mut conn = self.pool.acquire().await?;
            let mut repo = Tenants::new(&mut conn);
            match self.args.tenant {
                Some(id) => vec![repo.get_by_id(id).await?.ok_or_else(|| anyhow::anyhow!("tenant {id} not found"))?],
                None => repo.list_all().await?,
            }
        };

        for tenant in tenants {
            report.tenants_checked += 1;
            let Some(org_code) = self.ensure_organization(&tenant, &mut report).await? else {
                continue;
            };
            let users = {
                let mut conn = self.pool.acquire().await?;
                Users::new(&mut conn).list_all_in_tenant(tenant.id).await?
            };
            for user in users {
                self.fix_user(&org_code, &user, &mut report).await;
            }
        }

        info!(?report, "Organization assignment run finished");
        Ok(report)
    }

    /// The tenant's org code, creating the organization when allowed. `None` means skip the tenant.
    async fn ensure_organization(&self, tenant: &TenantDBResponse, report: &mut OrgAssignmentReport) -> anyhow::Result<Option<String>> {
        if let Some(code) = &tenant.identity_org_code {
            return Ok(Some(code.clone()));
        }
        if !self.args.create_missing_orgs {
            warn!(tenant_id = %tenant.id, "Tenant has no identity organization, pass --create-missing-orgs to create it");
            return Ok(None);
        }
        if self.args.dry_run {
            info!(tenant_id = %tenant.id, "Would create identity organization");
            report.orgs_created += 1;
            return Ok(None);
        }

        match self.provider.create_organization(&tenant.name, &tenant.id.to_string()).await {
            Ok(code) => {
                let mut conn = self.pool.acquire().await?;
                Tenants::new(&mut conn).set_identity_org_code(tenant.id, &code).await?;
                info!(tenant_id = %tenant.id, org_code = %code, "Created identity organization");
                report.orgs_created += 1;
                Ok(Some(code))
            }
            Err(e) => {
                error!(tenant_id = %tenant.id, error = %e, "Failed to create identity organization");
                report.failures += 1;
                Ok(None)
            }
        }
    }

    async fn fix_user(&self, org_code: &str, user: &UserDBResponse, report: &mut OrgAssignmentReport) {
        let Some(external_user_id) = user.external_user_id.as_deref() else {
            report.users_skipped += 1;
            return;
        };
        report.users_checked += 1;

        let organizations = match self.provider.get_user_organizations(external_user_id).await {
            Ok(orgs) => orgs,
            Err(e) => {
                error!(user_id = %user.id, error = %e, "Failed to fetch user organizations");
                report.failures += 1;
                return;
            }
        };

        if !organizations.iter().any(|o| o == org_code) {
            if self.args.dry_run {
                info!(user_id = %user.id, %org_code, "Would add user to organization");
                report.added += 1;
            } else {
                let roles = provider_roles(self.identity, &user.roles);
                match place_member(self.pool, self.provider, org_code, user, roles).await {
                    IdentitySync::Synced => report.added += 1,
                    IdentitySync::Invited => report.invited += 1,
                    IdentitySync::Pending => report.failures += 1,
                }
            }
        }

        if !self.args.remove_stale {
            return;
        }
        let stale = organizations
            .iter()
            .filter(|o| o.as_str() != org_code && !self.identity.ignored_org_codes.contains(o));
        for other in stale {
            if self.args.dry_run {
                info!(user_id = %user.id, org_code = %other, "Would remove user from stale organization");
                report.removed += 1;
                continue;
            }
            match self.provider.remove_user_from_organization(other, external_user_id).await {
                Ok(()) => {
                    info!(user_id = %user.id, org_code = %other, "Removed user from stale organization");
                    report.removed += 1;
                }
                Err(e) => {
                    error!(user_id = %user.id, org_code = %other, error = %e, "Failed to remove user from organization");
                    report.failures += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::config::DummyIdentityConfig;
    use crate::identity::dummy::DummyProvider;
    use crate::test_utils::{create_test_tenant, create_test_user_with_roles};

    fn identity_config() -> IdentityConfig {
        IdentityConfig {
            ignored_org_codes: vec!["org_staff".to_string()],
            ..Default::default()
        }
    }

    async fn set_external_id(pool: &PgPool, user: &UserDBResponse, external_id: &str) {
        sqlx::query("UPDATE users SET external_user_id = $2 WHERE id = $1")
            .bind(user.id)
            .bind(external_id)
            .execute(pool)
            .await
            .unwrap();
    }

    #[sqlx::test]
    #[test_log::test]
    async fn creates_missing_org_and_adds_members(pool: PgPool) {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        let tenant = create_test_tenant(&pool, "no-org").await;
        let admin = create_test_user_with_roles(&pool, tenant.id, "admin@no-org.test", vec![Role::TenantAdmin]).await;
        set_external_id(&pool, &admin, "kp_admin").await;
        create_test_user_with_roles(&pool, tenant.id, "noid@no-org.test", vec![Role::Member]).await;

        let identity = identity_config();
        let args = FixOrgAssignmentsArgs {
            create_missing_orgs: true,
            ..Default::default()
        };
        let report = OrgAssignmentFixer::new(&pool, &provider, &identity, &args).run().await.unwrap();

        assert_eq!(report.orgs_created, 1);
        assert_eq!(report.added, 1);
        assert_eq!(report.users_skipped, 1);
        assert!(!report.has_failures());

        let mut conn = pool.acquire().await.unwrap();
        let stored = Tenants::new(&mut conn).get_by_id(tenant.id).await.unwrap().unwrap();
        let org = stored.identity_org_code.unwrap();
        assert_eq!(provider.get_user_organizations("kp_admin").await.unwrap(), vec![org]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn tenants_without_org_are_skipped_unless_asked(pool: PgPool) {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        create_test_tenant(&pool, "skipped").await;

        let identity = identity_config();
        let args = FixOrgAssignmentsArgs::default();
        let report = OrgAssignmentFixer::new(&pool, &provider, &identity, &args).run().await.unwrap();
        assert_eq!(report.tenants_checked, 1);
        assert_eq!(report.orgs_created, 0);
        assert!(provider.organization_names().await.is_empty());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn removes_stale_memberships_but_keeps_ignored_orgs(pool: PgPool) {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        let tenant = create_test_tenant(&pool, "stale").await;
        let org = provider.create_organization(&tenant.name, &tenant.id.to_string()).await.unwrap();
        {
            let mut conn = pool.acquire().await.unwrap();
            Tenants::new(&mut conn).set_identity_org_code(tenant.id, &org).await.unwrap();
        }
        let user = create_test_user_with_roles(&pool, tenant.id, "mover@stale.test", vec![Role::Member]).await;
        set_external_id(&pool, &user, "kp_mover").await;
        provider.seed_membership("kp_mover", &org).await;
        provider.seed_membership("kp_mover", "org_previous").await;
        provider.seed_membership("kp_mover", "org_staff").await;

        let identity = identity_config();
        let dry = FixOrgAssignmentsArgs {
            dry_run: true,
            remove_stale: true,
            ..Default::default()
        };
        let planned = OrgAssignmentFixer::new(&pool, &provider, &identity, &dry).run().await.unwrap();
        assert_eq!(planned.removed, 1);
        assert_eq!(provider.get_user_organizations("kp_mover").await.unwrap().len(), 3);

        let args = FixOrgAssignmentsArgs {
            remove_stale: true,
            ..Default::default()
        };
        let report = OrgAssignmentFixer::new(&pool, &provider, &identity, &args).run().await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 0);
        let mut remaining = provider.get_user_organizations("kp_mover").await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec![org, "org_staff".to_string()]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn failed_add_and_invite_is_counted(pool: PgPool) {
        let provider = DummyProvider::new(DummyIdentityConfig {
            reject_add_for: vec!["kp_rejected".to_string()],
        });
        let tenant = create_test_tenant(&pool, "broken-org").await;
        // The org code points at an organization the provider does not know, so invites fail too
        {
            let mut conn = pool.acquire().await.unwrap();
            Tenants::new(&mut conn).set_identity_org_code(tenant.id, "org_missing").await.unwrap();
        }
        let user = create_test_user_with_roles(&pool, tenant.id, "rejected@broken.test", vec![Role::Member]).await;
        set_external_id(&pool, &user, "kp_rejected").await;

        let identity = identity_config();
        let args = FixOrgAssignmentsArgs::default();
        let report = OrgAssignmentFixer::new(&pool, &provider, &identity, &args).run().await.unwrap();
        assert!(report.has_failures());
        assert_eq!(report.failures, 1);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn unknown_tenant_filter_is_an_error(pool: PgPool) {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        let identity = identity_config();
        let args = FixOrgAssignmentsArgs {
            tenant: Some(uuid::Uuid::new_v4()),
            ..Default::default()
        };
        assert!(OrgAssignmentFixer::new(&pool, &provider, &identity, &args).run().await.is_err());
    }
}
