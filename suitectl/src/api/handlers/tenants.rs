//! HTTP handlers for the caller's own tenant and its members.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::Json,
};
use tracing::{info, warn};

use super::credits::balance_response;
use crate::{
    AppState,
    api::models::{
        pagination::PaginatedResponse,
        subscriptions::SubscriptionResponse,
        tenants::{CurrentTenantResponse, IdentitySync, TenantInviteResponse, TenantResponse, TenantUpdate},
        users::{ListUsersQuery, Role, TenantUserInvite, UserResponse},
    },
    auth::permissions::{RequiresPermission, operation, resource},
    db::{
        errors::DbError,
        handlers::{Repository, Subscriptions, Tenants, Users, users::UserFilter},
        models::{
            tenants::{TenantDBResponse, TenantUpdateDBRequest},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    email::EmailService,
    errors::{Error, Result},
    onboarding::{place_member, provider_roles},
    types::TenantId,
};

const NAME_MIN_LEN: usize = 2;
const NAME_MAX_LEN: usize = 100;

async fn load_tenant(state: &AppState, tenant_id: TenantId) -> Result<TenantDBResponse> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    Tenants::new(&mut conn).get_by_id(tenant_id).await?.ok_or_else(|| Error::NotFound {
        resource: "Tenant".to_string(),
        id: tenant_id.to_string(),
    })
}

/// Trim optional profile text, treating blank as "leave unchanged".
fn clean(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Get the caller's organization
#[utoipa::path(
    get,
    path = "/tenants/current",
    tag = "tenants",
    summary = "Get current organization",
    description = "The caller's organization with its subscription, credit balance and member count",
    responses(
        (status = 200, description = "Organization", body = CurrentTenantResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "Caller has no organization"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_current_tenant(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Tenants, operation::ReadOwn>,
) -> Result<Json<CurrentTenantResponse>> {
    let tenant_id = perm.tenant_id()?;
    let tenant = load_tenant(&state, tenant_id).await?;

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let subscription = Subscriptions::new(&mut conn)
        .get_by_tenant(tenant_id)
        .await?
        .map(|s| {
            let plan = state.config.plan(&s.plan_code);
            SubscriptionResponse::new(s, plan)
        });
    let member_count = Users::new(&mut conn).count(&UserFilter::new(0, 1).in_tenant(tenant_id)).await?;
    let credits = balance_response(&mut conn, &state.config, tenant_id).await?;

    Ok(Json(CurrentTenantResponse {
        tenant: tenant.into(),
        subscription,
        credits,
        member_count,
    }))
}

/// Update the caller's organization profile
#[utoipa::path(
    patch,
    path = "/tenants/current",
    tag = "tenants",
    summary = "Update current organization",
    request_body = TenantUpdate,
    responses(
        (status = 200, description = "Updated organization", body = TenantResponse),
        (status = 400, description = "Invalid name"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn update_current_tenant(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Tenants, operation::UpdateOwn>,
    Json(update): Json<TenantUpdate>,
) -> Result<Json<TenantResponse>> {
    let tenant_id = perm.tenant_id()?;

    let name = clean(&update.name);
    if let Some(name) = &name
        && !(NAME_MIN_LEN..=NAME_MAX_LEN).contains(&name.chars().count())
    {
        return Err(Error::BadRequest {
            message: format!("Name must be between {NAME_MIN_LEN} and {NAME_MAX_LEN} characters"),
        });
    }

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let tenant = Tenants::new(&mut conn)
        .update(
            tenant_id,
            &TenantUpdateDBRequest {
                name,
                industry: clean(&update.industry),
                company_size: clean(&update.company_size),
                country: clean(&update.country),
                status: None,
            },
        )
        .await?;

    Ok(Json(tenant.into()))
}

/// List members of the caller's organization
#[utoipa::path(
    get,
    path = "/tenants/current/users",
    tag = "tenants",
    summary = "List organization members",
    params(ListUsersQuery),
    responses(
        (status = 200, description = "Page of members", body = PaginatedResponse<UserResponse>),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin or BillingManager"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn list_tenant_users(
    State(state): State<AppState>,
    Query(query): Query<ListUsersQuery>,
    perm: RequiresPermission<resource::Users, operation::ReadOwn>,
) -> Result<Json<PaginatedResponse<UserResponse>>> {
    let tenant_id = perm.tenant_id()?;
    let (skip, limit) = query.pagination.params();
    let filter = UserFilter::new(skip, limit).in_tenant(tenant_id).with_search(query.search);

    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let mut repo = Users::new(&mut conn);
    let users = repo.list(&filter).await?;
    let total_count = repo.count(&filter).await?;

    Ok(Json(PaginatedResponse::new(
        users.into_iter().map(UserResponse::from).collect(),
        total_count,
        skip,
        limit,
    )))
}

fn validate_invite(invite: &TenantUserInvite) -> Result<(String, Vec<Role>)> {
    let email = invite.email.trim().to_lowercase();
    let valid_email = email
        .split_once('@')
        .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.') && !email.contains(char::is_whitespace));
    if !valid_email {
        return Err(Error::BadRequest {
            message: format!("'{}' is not a valid email address", invite.email),
        });
    }
    if invite.roles.contains(&Role::PlatformManager) {
        return Err(Error::BadRequest {
            message: "PlatformManager cannot be granted by an organization".to_string(),
        });
    }
    let roles = if invite.roles.is_empty() { vec![Role::Member] } else { invite.roles.clone() };
    Ok((email, roles))
}

/// Add a member to the caller's organization
#[utoipa::path(
    post,
    path = "/tenants/current/users",
    tag = "tenants",
    summary = "Invite a member",
    description = "Create the member locally, then add them to the organization at the identity provider, \
                   inviting them by email when they have no account there yet.",
    request_body = TenantUserInvite,
    responses(
        (status = 201, description = "Member added", body = TenantInviteResponse),
        (status = 400, description = "Invalid email or roles"),
        (status = 401, description = "Unauthorized"),
        (status = 403, description = "Requires TenantAdmin"),
        (status = 409, description = "The user already belongs to an organization or operates the platform"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn invite_tenant_user(
    State(state): State<AppState>,
    perm: RequiresPermission<resource::Users, operation::CreateOwn>,
    Json(invite): Json<TenantUserInvite>,
) -> Result<(StatusCode, Json<TenantInviteResponse>)> {
    let tenant_id = perm.tenant_id()?;
    let (email, roles) = validate_invite(&invite)?;
    let tenant = load_tenant(&state, tenant_id).await?;

    let user = {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        let mut users = Users::new(&mut conn);
        match users.get_user_by_email(&email).await? {
            Some(existing) if existing.is_admin || existing.roles.contains(&Role::PlatformManager) => {
                return Err(Error::Conflict {
                    message: "Platform operators cannot be invited into an organization".to_string(),
                });
            }
            Some(existing) if existing.tenant_id.is_some() => return Err(already_member()),
            // Signed in before but never onboarded: claim them, unless another claim got there first
            Some(existing) => users
                .claim_for_tenant(existing.id, tenant_id, &roles)
                .await?
                .ok_or_else(already_member)?,
            None => {
                users
                    .create(&UserCreateDBRequest {
                        tenant_id: Some(tenant_id),
                        email: email.clone(),
                        display_name: clean(&invite.display_name),
                        external_user_id: None,
                        auth_source: "invite".to_string(),
                        is_admin: false,
                        roles,
                    })
                    .await?
            }
        }
    };
    info!(tenant_id = %tenant_id, user_id = %user.id, invited_by = %perm.user.id, "Added user to tenant");

    let identity_sync = match &tenant.identity_org_code {
        Some(org_code) => {
            let provider_roles = provider_roles(&state.config.identity, &user.roles);
            place_member(&state.db, state.identity.as_ref(), org_code, &user, provider_roles).await
        }
        None => IdentitySync::Pending,
    };

    notify_member(&state, &tenant, &user).await;

    // Reload: placing an invited user may have linked their identity
    let user = {
        let mut conn = state.db.acquire().await.map_err(DbError::from)?;
        Users::new(&mut conn).get_by_id(user.id).await?.unwrap_or(user)
    };

    Ok((
        StatusCode::CREATED,
        Json(TenantInviteResponse {
            user: user.into(),
            identity_sync,
        }),
    ))
}

fn already_member() -> Error {
    Error::Conflict {
        message: "This user already belongs to an organization".to_string(),
    }
}

/// Best effort: the membership stands even if the notice cannot be sent.
async fn notify_member(state: &AppState, tenant: &TenantDBResponse, user: &UserDBResponse) {
    let result = match EmailService::new(&state.config) {
        Ok(email) => email.send_member_added(&user.email, user.display_name.as_deref(), &tenant.name).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        warn!(user_id = %user.id, error = %e, "Failed to send member notice");
    }
}
