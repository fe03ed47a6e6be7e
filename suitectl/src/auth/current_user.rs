use crate::db::errors::DbError;
use crate::{
    AppState,
    api::models::users::CurrentUser,
    auth::session,
    config::Config,
    db::{
        handlers::{Repository, Users},
        models::users::{UserCreateDBRequest, UserDBResponse, UserUpdateDBRequest},
    },
    errors::{Error, Result},
};
use axum::{extract::FromRequestParts, http::request::Parts};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, info, instrument, trace};

/// Last-login timestamps are only rewritten when older than this.
const LAST_LOGIN_RESOLUTION: Duration = Duration::minutes(5);

/// Extract user from JWT session cookie if present and valid
/// Returns:
/// - None: No JWT cookie present
/// - Some(Ok(user)): Valid JWT found and verified
/// - Some(Err(error)): JWT cookie present but invalid/malformed
#[instrument(skip(parts, config))]
fn try_jwt_session_auth(parts: &Parts, config: &Config) -> Option<Result<CurrentUser>> {
    let cookie_header = parts.headers.get(axum::http::header::COOKIE)?;

    let cookie_str = match cookie_header.to_str() {
        Ok(s) => s,
        Err(e) => {
            return Some(Err(Error::BadRequest {
                message: format!("Invalid cookie header: {e}"),
            }));
        }
    };
    let cookie_name = &config.auth.session.cookie_name;

    let mut last_error = None;
    for cookie in cookie_str.split(';') {
        if let Some((name, value)) = cookie.trim().split_once('=')
            && name == cookie_name
        {
            match session::verify_session_token(value, config) {
                Ok(user) => return Some(Ok(user)),
                // Expired tokens are expected; keep looking in case the cookie is duplicated
                Err(e) => last_error = Some(e),
            }
        }
    }
    last_error.map(Err)
}

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts
        .headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Extract user from the headers set by the SSO proxy in front of the identity provider
/// Returns:
/// - None: No proxy header present
/// - Some(Ok(user)): Known (or newly created) user
/// - Some(Err(error)): Proxy header present but user lookup/creation failed
#[instrument(skip(parts, config, db))]
async fn try_proxy_header_auth(parts: &Parts, config: &Config, db: &PgPool) -> Option<Result<CurrentUser>> {
    let external_user_id = header(parts, &config.auth.proxy_header.header_name)?;
    let email = header(parts, &config.auth.proxy_header.email_header_name);
    Some(resolve_proxy_user(config, db, external_user_id, email).await)
}

async fn resolve_proxy_user(config: &Config, db: &PgPool, external_user_id: &str, email: Option<&str>) -> Result<CurrentUser> {
    let mut tx = db.begin().await.map_err(DbError::from)?;
    let mut users = Users::new(&mut tx);

    let user = match users.get_user_by_external_id(external_user_id).await? {
        Some(user) => user,
        None => match email {
            // Users invited by email get linked on first sign-in
            Some(email) => match users.get_user_by_email(email).await? {
                Some(existing) if existing.external_user_id.is_none() => {
                    info!(user_id = %existing.id, "Linking existing user to identity-provider account");
                    users
                        .update(
                            existing.id,
                            &UserUpdateDBRequest {
                                external_user_id: Some(external_user_id.to_string()),
                                ..Default::default()
                            },
                        )
                        .await?
                }
                Some(_) => {
                    return Err(Error::Unauthenticated {
                        message: Some("This email is linked to a different identity".to_string()),
                    });
                }
                None => create_proxy_user(config, &mut users, external_user_id, email).await?,
            },
            None => {
                return Err(Error::Unauthenticated {
                    message: Some("Unknown user and no email header provided".to_string()),
                });
            }
        },
    };

    touch_last_login(&mut users, &user).await?;
    tx.commit().await.map_err(DbError::from)?;
    Ok(user.into())
}

async fn create_proxy_user(config: &Config, users: &mut Users<'_>, external_user_id: &str, email: &str) -> Result<UserDBResponse> {
    if !config.auth.proxy_header.auto_create_users {
        return Err(Error::Unauthenticated {
            message: Some("User is not registered".to_string()),
        });
    }
    // New users have no tenant and no roles until they onboard or are invited
    let user = users
        .create(&UserCreateDBRequest {
            tenant_id: None,
            email: email.to_string(),
            display_name: None,
            external_user_id: Some(external_user_id.to_string()),
            auth_source: "proxy-header".to_string(),
            is_admin: false,
            roles: vec![],
        })
        .await?;
    info!(user_id = %user.id, "Auto-created user from proxy headers");
    Ok(user)
}

async fn touch_last_login(users: &mut Users<'_>, user: &UserDBResponse) -> Result<()> {
    let stale = user.last_login.is_none_or(|at| Utc::now() - at > LAST_LOGIN_RESOLUTION);
    if stale {
        users.update_last_login(user.id).await?;
    }
    Ok(())
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = Error;

    /// Session cookie first, then proxy headers. Either succeeding is enough.
    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let mut auth_errors = Vec::new();

        match try_jwt_session_auth(parts, &state.config) {
            Some(Ok(user)) => {
                debug!("Found JWT session authenticated user: {}", user.id);
                return Ok(user);
            }
            Some(Err(e)) => {
                trace!("JWT session authentication failed: {:?}", e);
                auth_errors.push(("JWT session", e));
            }
            None => trace!("No JWT session authentication attempted"),
        }

        if state.config.auth.proxy_header.enabled {
            match try_proxy_header_auth(parts, &state.config, &state.db).await {
                Some(Ok(user)) => {
                    debug!("Found proxy header authenticated user: {}", user.id);
                    return Ok(user);
                }
                Some(Err(e)) => {
                    trace!("Proxy header authentication failed: {:?}", e);
                    // Surface server-side failures instead of masking them as 401s
                    if !matches!(e, Error::Unauthenticated { .. }) {
                        return Err(e);
                    }
                    auth_errors.push(("Proxy header", e));
                }
                None => trace!("No proxy header authentication attempted"),
            }
        }

        match auth_errors.pop() {
            Some((_, Error::Unauthenticated { message })) => Err(Error::Unauthenticated { message }),
            _ => Err(Error::Unauthenticated { message: None }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::users::Role;
    use crate::test_utils::{create_test_app_state, create_test_tenant, create_test_user};
    use axum::http::{Request, StatusCode};

    fn parts_with(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder().uri("http://localhost/test");
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_auto_create_unknown_proxy_user(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let mut parts = parts_with(&[("x-suite-user", "kp_new"), ("x-suite-email", "new@acme.test")]);

        let user = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.email, "new@acme.test");
        assert_eq!(user.external_user_id.as_deref(), Some("kp_new"));
        assert!(user.tenant_id.is_none());
        assert!(user.roles.is_empty());

        let mut conn = pool.acquire().await.unwrap();
        let stored = Users::new(&mut conn).get_user_by_external_id("kp_new").await.unwrap().unwrap();
        assert_eq!(stored.auth_source, "proxy-header");
        assert!(stored.last_login.is_some());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_invited_user_is_linked_by_email(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let tenant = create_test_tenant(&pool, "linked").await;
        let invited = create_test_user(&pool, Some(tenant.id), "invited@acme.test").await;

        let mut parts = parts_with(&[("x-suite-user", "kp_invited"), ("x-suite-email", "Invited@acme.test")]);
        let user = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.id, invited.id);
        assert_eq!(user.tenant_id, Some(tenant.id));
        assert!(user.has_role(Role::Member));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_session_cookie_wins_over_proxy_headers(pool: PgPool) {
        let state = create_test_app_state(pool.clone()).await;
        let tenant = create_test_tenant(&pool, "cookie").await;
        let db_user = create_test_user(&pool, Some(tenant.id), "cookie@acme.test").await;
        let token = session::create_session_token(&CurrentUser::from(db_user.clone()), &state.config).unwrap();

        let cookie = format!("{}={token}", state.config.auth.session.cookie_name);
        let mut parts = parts_with(&[("cookie", &cookie), ("x-suite-user", "kp_other"), ("x-suite-email", "other@acme.test")]);
        let user = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.id, db_user.id);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_missing_credentials_are_unauthorized(pool: PgPool) {
        let state = create_test_app_state(pool).await;
        let mut parts = parts_with(&[]);
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_auto_create_can_be_disabled(pool: PgPool) {
        let mut state = create_test_app_state(pool).await;
        state.config.auth.proxy_header.auto_create_users = false;
        let mut parts = parts_with(&[("x-suite-user", "kp_stranger"), ("x-suite-email", "stranger@acme.test")]);
        let err = CurrentUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
    }
}
