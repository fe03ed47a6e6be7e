//! Tenant onboarding and identity-provider membership.
//!
//! Onboarding writes the tenant, the caller's tenant roles, the subscription and the first
//! credit allocation in one database transaction. The identity-provider organization is created
//! only after that commits; if the provider is unreachable the tenant is still usable and the
//! org-assignment job links it later.

pub mod slug;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sqlx::{Connection, PgPool};
use tracing::{info, instrument, warn};

use crate::{
    AppState,
    api::models::{
        onboarding::OnboardRequest,
        tenants::IdentitySync,
        users::{CurrentUser, Role},
    },
    config::{IdentityConfig, PlanConfig},
    db::{
        errors::DbError,
        handlers::{Credits, Repository, Subscriptions, Tenants, Users},
        models::{
            credits::{CreditGrantDBRequest, CreditTransactionType},
            subscriptions::{SubscriptionCreateDBRequest, SubscriptionDBResponse, SubscriptionStatus},
            tenants::{TenantCreateDBRequest, TenantDBResponse},
            users::{UserDBResponse, UserUpdateDBRequest},
        },
    },
    errors::{Error, Result},
    identity::{self, IdentityProvider, MemberRef, Membership},
    types::abbrev_uuid,
};

const NAME_MIN_LEN: usize = 2;
const NAME_MAX_LEN: usize = 100;

/// Everything onboarding produced.
#[derive(Debug, Clone)]
pub struct Onboarded {
    pub tenant: TenantDBResponse,
    pub subscription: SubscriptionDBResponse,
    /// The caller after joining the tenant, for reissuing their session
    pub user: UserDBResponse,
    pub credits_granted: Decimal,
    pub identity_sync: IdentitySync,
}

pub fn onboarding_source_id(tenant_id: uuid::Uuid) -> String {
    format!("onboarding:{tenant_id}")
}

fn bad_request(message: impl Into<String>) -> Error {
    Error::BadRequest { message: message.into() }
}

/// Checked onboarding input.
struct Validated<'a> {
    name: &'a str,
    slug: String,
    plan: &'a PlanConfig,
}

fn validate<'a>(state: &'a AppState, request: &'a OnboardRequest) -> Result<Validated<'a>> {
    let name = request.company_name.trim();
    let name_len = name.chars().count();
    if !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&name_len) {
        return Err(bad_request(format!(
            "Company name must be between {NAME_MIN_LEN} and {NAME_MAX_LEN} characters"
        )));
    }
    if !request.accepted_terms {
        return Err(bad_request("The terms of service must be accepted"));
    }

    let slug = match request.slug.as_deref().filter(|s| !s.trim().is_empty()) {
        Some(given) => slug::normalize(given),
        None => slug::slugify(name),
    };
    slug::validate(&slug).map_err(|reason| bad_request(format!("Invalid organization URL '{slug}': {reason}")))?;

    let plan_code = request.plan_code.as_deref().unwrap_or(&state.config.default_plan);
    let plan = state
        .config
        .plan(plan_code)
        .ok_or_else(|| bad_request(format!("Unknown plan '{plan_code}'")))?;

    Ok(Validated { name, slug, plan })
}

fn slug_conflict() -> Error {
    Error::Conflict {
        message: "This organization URL is already taken".to_string(),
    }
}

fn already_onboarded() -> Error {
    Error::Conflict {
        message: "You already belong to an organization".to_string(),
    }
}

/// Create a tenant for `caller` and make them its administrator.
#[instrument(skip(state, caller, request), fields(user_id = %abbrev_uuid(&caller.id)), err)]
pub async fn onboard(state: &AppState, caller: &CurrentUser, request: &OnboardRequest) -> Result<Onboarded> {
    let input = validate(state, request)?;
    let now = Utc::now();

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut tx = conn.begin().await.map_err(DbError::from)?;

    // The session may predate a tenant assignment, so check the stored user
    let stored = Users::new(&mut tx).get_by_id(caller.id).await?.ok_or(Error::Unauthenticated { message: None })?;
    if stored.tenant_id.is_some() {
        return Err(already_onboarded());
    }

    let mut tenants = Tenants::new(&mut tx);
    if !tenants.slug_available(&input.slug).await? {
        return Err(slug_conflict());
    }
    let tenant = tenants
        .create(&TenantCreateDBRequest {
            name: input.name.to_string(),
            slug: input.slug.clone(),
            industry: request.industry.clone(),
            company_size: request.company_size.clone(),
            country: request.country.clone(),
        })
        .await
        .map_err(|e| {
            // Lost a race with a concurrent onboarding for the same slug
            if e.is_unique_violation_on("tenants_slug_unique") { slug_conflict() } else { e.into() }
        })?;

    let mut users = Users::new(&mut tx);
    // A concurrent onboarding for the same caller may have committed since the check above
    let mut user = users
        .claim_for_tenant(caller.id, tenant.id, &Role::tenant_owner_roles())
        .await?
        .ok_or_else(already_onboarded)?;
    if let Some(display_name) = request.admin_display_name.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        user = users
            .update(
                caller.id,
                &UserUpdateDBRequest {
                    display_name: Some(display_name.to_string()),
                    ..Default::default()
                },
            )
            .await?;
    }

    let trial_ends_at = (input.plan.trial_days > 0).then(|| now + Duration::days(i64::from(input.plan.trial_days)));
    let subscription = Subscriptions::new(&mut tx)
        .create(&SubscriptionCreateDBRequest {
            tenant_id: tenant.id,
            plan_code: input.plan.code.clone(),
            status: if trial_ends_at.is_some() {
                SubscriptionStatus::Trialing
            } else {
                SubscriptionStatus::Active
            },
            trial_ends_at,
            current_period_end: trial_ends_at,
        })
        .await?;

    let credits_granted = input.plan.onboarding_credits;
    if credits_granted > Decimal::ZERO {
        let expires_at = match state.config.credits.onboarding_grant_validity {
            Some(validity) => Some(now + chrono::Duration::from_std(validity).map_err(|e| Error::Internal {
                operation: format!("compute onboarding credit expiry: {e}"),
            })?),
            None => None,
        };
        Credits::new(&mut tx)
            .grant(&CreditGrantDBRequest {
                tenant_id: tenant.id,
                user_id: Some(caller.id),
                transaction_type: CreditTransactionType::OnboardingGrant,
                amount: credits_granted,
                expires_at,
                source_id: onboarding_source_id(tenant.id),
                description: Some(format!("Welcome credits ({} plan)", input.plan.name)),
            })
            .await?;
    }

    let tenant = Tenants::new(&mut tx).mark_onboarded(tenant.id).await?;
    tx.commit().await.map_err(DbError::from)?;
    drop(conn);

    info!(tenant_id = %tenant.id, slug = %tenant.slug, plan = %input.plan.code, "Tenant onboarded");
    if credits_granted > Decimal::ZERO
        && let Some(metrics) = &state.credit_metrics
    {
        metrics.record_grant(CreditTransactionType::OnboardingGrant, credits_granted);
    }

    let (tenant, identity_sync) = link_organization(state, tenant, &user).await;

    Ok(Onboarded {
        tenant,
        subscription,
        user,
        credits_granted,
        identity_sync,
    })
}

/// Create the tenant's identity organization and place its first admin in it.
///
/// Failures are logged and reported as [`IdentitySync::Pending`].
async fn link_organization(state: &AppState, tenant: TenantDBResponse, admin: &UserDBResponse) -> (TenantDBResponse, IdentitySync) {
    let provider = state.identity.as_ref();
    let org_code = match provider.create_organization(&tenant.name, &tenant.id.to_string()).await {
        Ok(code) => code,
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Could not create identity organization, will retry from the org-assignment job");
            return (tenant, IdentitySync::Pending);
        }
    };

    let tenant = match store_org_code(state, &tenant, &org_code).await {
        Ok(updated) => updated,
        Err(e) => {
            warn!(tenant_id = %tenant.id, error = %e, "Could not store identity organization code");
            return (tenant, IdentitySync::Pending);
        }
    };

    let roles = provider_roles(&state.config.identity, &admin.roles);
    let sync = place_member(&state.db, provider, &org_code, admin, roles).await;
    (tenant, sync)
}

async fn store_org_code(state: &AppState, tenant: &TenantDBResponse, org_code: &str) -> Result<TenantDBResponse> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    Ok(Tenants::new(&mut conn).set_identity_org_code(tenant.id, org_code).await?)
}

/// Identity-provider roles for a user holding the given tenant roles.
pub fn provider_roles<'a>(config: &'a IdentityConfig, roles: &[Role]) -> &'a [String] {
    if roles.contains(&Role::TenantAdmin) {
        &config.admin_roles
    } else {
        &config.member_roles
    }
}

/// Add or invite `user` into `org_code`, remembering the provider id an invite creates.
pub async fn place_member(
    db: &PgPool,
    provider: &dyn IdentityProvider,
    org_code: &str,
    user: &UserDBResponse,
    roles: &[String],
) -> IdentitySync {
    let member = MemberRef {
        external_user_id: user.external_user_id.as_deref(),
        email: &user.email,
        display_name: user.display_name.as_deref(),
    };
    match identity::add_or_invite(provider, org_code, &member, roles).await {
        Ok(Membership::Added) => IdentitySync::Synced,
        Ok(Membership::Invited { external_user_id }) => {
            if let (None, Some(new_id)) = (&user.external_user_id, external_user_id)
                && let Err(e) = link_external_id(db, user, new_id).await
            {
                warn!(user_id = %user.id, error = %e, "Could not store invited user's identity id");
            }
            IdentitySync::Invited
        }
        Err(e) => {
            warn!(user_id = %user.id, %org_code, error = %e, "Could not place user in identity organization");
            IdentitySync::Pending
        }
    }
}

async fn link_external_id(db: &PgPool, user: &UserDBResponse, external_user_id: String) -> Result<()> {
    let mut conn = db.acquire().await.map_err(DbError::from)?;
    Users::new(&mut conn)
        .update(
            user.id,
            &UserUpdateDBRequest {
                external_user_id: Some(external_user_id),
                ..Default::default()
            },
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::handlers::Credits;
    use crate::identity::dummy::DummyProvider;
    use crate::test_utils::{create_test_app_state, create_test_tenant, create_test_user_without_tenant};
    use axum::http::StatusCode;
    use sqlx::PgPool;
    use std::sync::Arc;

    fn request(name: &str) -> OnboardRequest {
        OnboardRequest {
            company_name: name.to_string(),
            slug: None,
            industry: Some("Retail".to_string()),
            company_size: Some("11-50".to_string()),
            country: Some("DE".to_string()),
            admin_display_name: Some("Ada Owner".to_string()),
            plan_code: None,
            accepted_terms: true,
        }
    }

    #[sqlx::test]
    #[test_log::test]
    async fn onboarding_creates_tenant_subscription_and_credits(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let caller = create_test_user_without_tenant(&pool, "founder@acme.test", Some("kp_founder")).await;

        let onboarded = onboard(&state, &caller.clone().into(), &request("Acme Widgets")).await.unwrap();

        assert_eq!(onboarded.tenant.slug, "acme-widgets");
        assert!(onboarded.tenant.onboarded_at.is_some());
        assert!(onboarded.tenant.identity_org_code.is_some());
        assert_eq!(onboarded.identity_sync, IdentitySync::Synced);
        assert_eq!(onboarded.user.tenant_id, Some(onboarded.tenant.id));
        assert!(onboarded.user.roles.contains(&Role::TenantAdmin));
        assert_eq!(onboarded.user.display_name.as_deref(), Some("Ada Owner"));
        // Default starter plan has a trial
        assert_eq!(onboarded.subscription.status, SubscriptionStatus::Trialing);

        let mut conn = pool.acquire().await.unwrap();
        let mut credits = Credits::new(&mut conn);
        assert_eq!(credits.balance(onboarded.tenant.id).await.unwrap(), onboarded.credits_granted);
        let allocations = credits.list_allocations(onboarded.tenant.id, false).await.unwrap();
        assert!(allocations[0].expires_at.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn second_onboarding_for_same_user_conflicts(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let caller = create_test_user_without_tenant(&pool, "twice@acme.test", Some("kp_twice")).await;
        let caller: CurrentUser = caller.into();

        onboard(&state, &caller, &request("First Co")).await.unwrap();
        let err = onboard(&state, &caller, &request("Second Co")).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn concurrent_onboardings_for_same_user_create_one_tenant(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let caller: CurrentUser = create_test_user_without_tenant(&pool, "eager@acme.test", Some("kp_eager")).await.into();

        let alpha_request = request("Alpha Co");
        let beta_request = request("Beta Co");
        let (alpha, beta) = tokio::join!(
            onboard(&state, &caller, &alpha_request),
            onboard(&state, &caller, &beta_request)
        );

        let (won, lost) = match (alpha, beta) {
            (Ok(won), Err(lost)) | (Err(lost), Ok(won)) => (won, lost),
            (Ok(_), Ok(_)) => panic!("both onboardings committed"),
            (Err(a), Err(b)) => panic!("both onboardings failed: {a}, {b}"),
        };
        assert_eq!(lost.status_code(), StatusCode::CONFLICT);

        let tenants: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM tenants").fetch_one(&pool).await.unwrap();
        assert_eq!(tenants, 1);
        let grants: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM credit_allocations").fetch_one(&pool).await.unwrap();
        assert_eq!(grants, 1);

        let mut conn = pool.acquire().await.unwrap();
        let stored = Users::new(&mut conn).get_by_id(caller.id).await.unwrap().unwrap();
        assert_eq!(stored.tenant_id, Some(won.tenant.id));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn taken_slug_conflicts(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        create_test_tenant(&pool, "taken-co").await;
        let caller = create_test_user_without_tenant(&pool, "late@acme.test", None).await;

        let err = onboard(&state, &caller.into(), &request("Taken Co")).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn invalid_input_is_rejected_before_writing(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let caller: CurrentUser = create_test_user_without_tenant(&pool, "v@acme.test", None).await.into();

        let mut no_terms = request("Valid Name");
        no_terms.accepted_terms = false;
        let mut bad_plan = request("Valid Name");
        bad_plan.plan_code = Some("enterprise-gold".to_string());
        let mut bad_slug = request("Valid Name");
        bad_slug.slug = Some("-nope".to_string());

        for req in [request("A"), no_terms, bad_plan, bad_slug] {
            let err = onboard(&state, &caller, &req).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }

        let mut conn = pool.acquire().await.unwrap();
        assert!(Users::new(&mut conn).get_by_id(caller.id).await.unwrap().unwrap().tenant_id.is_none());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn users_without_identity_account_are_invited(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let caller = create_test_user_without_tenant(&pool, "noid@acme.test", None).await;

        let onboarded = onboard(&state, &caller.into(), &request("Invite Co")).await.unwrap();
        assert_eq!(onboarded.identity_sync, IdentitySync::Invited);

        let mut conn = pool.acquire().await.unwrap();
        let stored = Users::new(&mut conn).get_user_by_email("noid@acme.test").await.unwrap().unwrap();
        assert_eq!(stored.external_user_id.as_deref(), Some("kp_invited_noid@acme.test"));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn rejected_add_falls_back_to_invite(pool: PgPool) {
        let mut state = create_test_app_state(pool.clone()).await;
        let provider = Arc::new(DummyProvider::new(crate::config::DummyIdentityConfig {
            reject_add_for: vec!["kp_rejected".to_string()],
        }));
        state.identity = provider.clone() as Arc<dyn IdentityProvider>;
        let caller = create_test_user_without_tenant(&pool, "rejected@acme.test", Some("kp_rejected")).await;

        // Add is rejected but the invite fallback still succeeds
        let onboarded = onboard(&state, &caller.into(), &request("Fallback Co")).await.unwrap();
        assert_eq!(onboarded.identity_sync, IdentitySync::Invited);
        assert_eq!(provider.invited_emails().await, vec!["rejected@acme.test".to_string()]);
    }
}
