//! HTTP handlers for the onboarding wizard.

use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};

use crate::{
    AppState,
    api::models::{
        auth::WithCookie,
        onboarding::{
            OnboardRequest, OnboardResponse, OnboardingStatusResponse, OnboardingStep, SlugAvailabilityQuery, SlugAvailabilityResponse,
        },
        subscriptions::SubscriptionResponse,
        users::CurrentUser,
    },
    auth::session,
    db::{
        errors::DbError,
        handlers::{Repository, Tenants, Users},
    },
    errors::{Error, Result},
    onboarding::{self, slug},
};

/// Create the caller's organization
#[utoipa::path(
    post,
    path = "/onboarding/onboard",
    tag = "onboarding",
    summary = "Onboard a new organization",
    description = "Create a tenant with the caller as its administrator, start its subscription and grant the plan's welcome credits. \
                   The response replaces the session cookie so it carries the new tenant.",
    request_body = OnboardRequest,
    responses(
        (status = 201, description = "Organization created", body = OnboardResponse),
        (status = 400, description = "Invalid company name, slug, plan or terms not accepted"),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "Caller already has an organization, or the slug is taken"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn onboard(
    State(state): State<AppState>,
    current_user: CurrentUser,
    Json(request): Json<OnboardRequest>,
) -> Result<WithCookie<OnboardResponse>> {
    let onboarded = onboarding::onboard(&state, &current_user, &request).await?;

    let token = session::create_session_token(&CurrentUser::from(onboarded.user), &state.config)?;
    let plan = state.config.plan(&onboarded.subscription.plan_code);
    let body = OnboardResponse {
        tenant: onboarded.tenant.into(),
        subscription: SubscriptionResponse::new(onboarded.subscription, plan),
        credits_granted: onboarded.credits_granted,
        identity_sync: onboarded.identity_sync,
    };

    Ok(WithCookie::new(body, session::session_cookie(&token, &state.config)).with_status(StatusCode::CREATED))
}

/// Where the caller is in the onboarding flow
#[utoipa::path(
    get,
    path = "/onboarding/status",
    tag = "onboarding",
    summary = "Get onboarding status",
    responses(
        (status = 200, description = "Onboarding status", body = OnboardingStatusResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn get_status(State(state): State<AppState>, current_user: CurrentUser) -> Result<Json<OnboardingStatusResponse>> {
    let mut conn = state.db.acquire().await.map_err(DbError::from)?;

    // Read the stored user: a session cookie issued before onboarding has no tenant
    let tenant_id = Users::new(&mut conn)
        .get_by_id(current_user.id)
        .await?
        .and_then(|user| user.tenant_id);

    let tenant = match tenant_id {
        Some(id) => Tenants::new(&mut conn).get_by_id(id).await?,
        None => None,
    };

    let response = match tenant {
        None => OnboardingStatusResponse {
            onboarded: false,
            tenant_id: None,
            step: OnboardingStep::CreateOrganization,
        },
        Some(tenant) => OnboardingStatusResponse {
            onboarded: tenant.onboarded_at.is_some(),
            tenant_id: Some(tenant.id),
            step: if tenant.identity_org_code.is_some() {
                OnboardingStep::Complete
            } else {
                OnboardingStep::IdentitySync
            },
        },
    };
    Ok(Json(response))
}

/// Check whether an organization URL can be used
#[utoipa::path(
    get,
    path = "/onboarding/slug-availability",
    tag = "onboarding",
    summary = "Check slug availability",
    params(SlugAvailabilityQuery),
    responses(
        (status = 200, description = "Availability of the normalised slug", body = SlugAvailabilityResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(
        ("CookieAuth" = []),
        ("X-Suite-User" = [])
    )
)]
#[tracing::instrument(skip_all)]
pub async fn slug_availability(
    State(state): State<AppState>,
    _user: CurrentUser,
    Query(query): Query<SlugAvailabilityQuery>,
) -> Result<Json<SlugAvailabilityResponse>> {
    let slug = slug::normalize(&query.slug);
    if let Err(reason) = slug::validate(&slug) {
        return Ok(Json(SlugAvailabilityResponse {
            slug,
            available: false,
            reason: Some(reason.to_string()),
        }));
    }

    let mut conn = state.db.acquire().await.map_err(|e| Error::Database(e.into()))?;
    let available = Tenants::new(&mut conn).slug_available(&slug).await?;
    Ok(Json(SlugAvailabilityResponse {
        reason: (!available).then(|| "already taken".to_string()),
        slug,
        available,
    }))
}

#[cfg(test)]
mod tests {
    use crate::test_utils::{add_auth_headers, create_test_app, create_test_tenant, create_test_user_without_tenant, json_decimal};
    use axum::http::{StatusCode, header};
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_onboard_creates_tenant_and_reissues_session(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let user = create_test_user_without_tenant(&pool, "founder@acme.test", Some("kp_founder")).await;
        let headers = add_auth_headers(&user);

        let response = app
            .post("/api/v1/onboarding/onboard")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({
                "company_name": "Acme Widgets",
                "country": "NL",
                "accepted_terms": true
            }))
            .await;

        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["tenant"]["slug"], "acme-widgets");
        assert_eq!(body["subscription"]["status"], "trialing");
        assert_eq!(body["credits_granted"], "500");
        assert_eq!(body["identity_sync"], "synced");

        let set_cookie = response.header(header::SET_COOKIE);
        let cookie = set_cookie.to_str().unwrap().split(';').next().unwrap().to_string();

        // The reissued cookie already knows about the tenant
        let response = app.get("/api/v1/credits/balance").add_header("cookie", &cookie).await;
        response.assert_status(StatusCode::OK);
        let balance: Value = response.json();
        assert_eq!(json_decimal(&balance["balance"]), Decimal::from(500));
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_onboard_rejects_unaccepted_terms(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let user = create_test_user_without_tenant(&pool, "hasty@acme.test", Some("kp_hasty")).await;
        let headers = add_auth_headers(&user);

        let response = app
            .post("/api/v1/onboarding/onboard")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "company_name": "Hasty Co" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_status_follows_onboarding(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        let user = create_test_user_without_tenant(&pool, "stepper@acme.test", Some("kp_stepper")).await;
        let headers = add_auth_headers(&user);

        let response = app
            .get("/api/v1/onboarding/status")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        response.assert_status(StatusCode::OK);
        let body: Value = response.json();
        assert_eq!(body["onboarded"], false);
        assert_eq!(body["step"], "create_organization");

        app.post("/api/v1/onboarding/onboard")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .json(&json!({ "company_name": "Stepper", "accepted_terms": true }))
            .await
            .assert_status(StatusCode::CREATED);

        let response = app
            .get("/api/v1/onboarding/status")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await;
        let body: Value = response.json();
        assert_eq!(body["onboarded"], true);
        assert_eq!(body["step"], "complete");
        assert!(body["tenant_id"].is_string());
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_slug_availability(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        create_test_tenant(&pool, "taken-slug").await;
        let user = create_test_user_without_tenant(&pool, "curious@acme.test", Some("kp_curious")).await;
        let headers = add_auth_headers(&user);

        let check = |slug: &'static str| {
            app.get("/api/v1/onboarding/slug-availability")
                .add_query_param("slug", slug)
                .add_header(&headers[0].0, &headers[0].1)
                .add_header(&headers[1].0, &headers[1].1)
        };

        let body: Value = check(" Taken-Slug ").await.json();
        assert_eq!(body["slug"], "taken-slug");
        assert_eq!(body["available"], false);
        assert_eq!(body["reason"], "already taken");

        let body: Value = check("free-slug").await.json();
        assert_eq!(body["available"], true);
        assert!(body["reason"].is_null());

        let body: Value = check("no").await.json();
        assert_eq!(body["available"], false);
        assert_eq!(body["reason"], "must be at least 3 characters");
    }
}
