use axum::extract::State;

use crate::{
    AppState,
    api::models::{
        auth::{AuthResponse, AuthSuccessResponse, LogoutResponse, SessionResponse, WithCookie},
        users::{CurrentUser, UserResponse},
    },
    auth::session,
    db::{
        errors::DbError,
        handlers::{Repository, Users},
    },
    errors::Error,
};

/// Exchange proxy-header authentication for a session cookie
#[utoipa::path(
    post,
    path = "/authentication/session",
    tag = "authentication",
    summary = "Start a session",
    description = "Issue a session cookie for the caller. The user is reloaded so the cookie carries current roles and tenant.",
    responses(
        (status = 200, description = "Session started", body = AuthResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn create_session(State(state): State<AppState>, current_user: CurrentUser) -> Result<SessionResponse, Error> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;
    let user = Users::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .ok_or_else(|| Error::Unauthenticated {
            message: Some("User no longer exists".to_string()),
        })?;

    let token = session::create_session_token(&CurrentUser::from(user.clone()), &state.config)?;
    let cookie = session::session_cookie(&token, &state.config);

    Ok(WithCookie::new(
        AuthResponse {
            user: UserResponse::from(user),
            message: "Session started".to_string(),
        },
        cookie,
    ))
}

/// Logout (clear session)
#[utoipa::path(
    post,
    path = "/authentication/logout",
    tag = "authentication",
    responses(
        (status = 200, description = "Logout successful", body = AuthSuccessResponse),
    )
)]
#[tracing::instrument(skip_all)]
pub async fn logout(State(state): State<AppState>) -> Result<LogoutResponse, Error> {
    Ok(WithCookie::new(
        AuthSuccessResponse {
            message: "Logout successful".to_string(),
        },
        session::clear_session_cookie(&state.config),
    ))
}
