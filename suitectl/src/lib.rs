//! # suitectl: control plane for the business suite
//!
//! `suitectl` is the backend behind the business suite dashboard. It owns the multi-tenant
//! side of the platform: organizations (tenants) and their members, the onboarding wizard,
//! plan subscriptions, a prepaid credit ledger that tracked operations draw down, and the
//! integrations with the identity provider (Kinde) and the payment provider (Stripe).
//!
//! ## Architecture
//!
//! The application is built on [Axum](https://github.com/tokio-rs/axum) for the HTTP layer and
//! uses PostgreSQL for all persistence.
//!
//! ### Request Flow
//!
//! Users sign in at the identity provider through an SSO proxy, which forwards their provider
//! user id and email as trusted headers. The API resolves those headers (or a session cookie
//! issued from them) to a local user, checks the user's roles against the resource being
//! accessed, and scopes every "own" operation to the user's tenant. Handlers work through the
//! repositories in [`db`].
//!
//! ### Core Components
//!
//! The **API layer** ([`api`]) serves the dashboard under `/api/v1/*`, plus session endpoints
//! under `/authentication/*` and the payment provider's webhook at `/webhooks/payments`.
//!
//! The **authentication layer** ([`auth`]) resolves the caller and implements role-based
//! access control.
//!
//! The **database layer** ([`db`]) uses the repository pattern. The credit ledger keeps a
//! per-tenant balance row, credit allocations with optional expiry, and an append-only
//! transaction log whose `source_id` makes every grant and debit idempotent.
//!
//! **Maintenance jobs** ([`jobs`]) expire seasonal credits, warn tenants before credits expire,
//! prune old rows and repair identity-provider organization memberships. They run from cron
//! through `suitectl jobs ...`; the seasonal job can also run in-server on the replica that
//! holds the leader lock.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use suitectl::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = suitectl::config::Args::parse();
//!     let config = Config::load(&args)?;
//!
//!     suitectl::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     let app = Application::new(config).await?;
//!     app.serve(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Database Setup
//!
//! The server runs migrations on startup:
//!
//! ```no_run
//! # use sqlx::PgPool;
//! # async fn example(pool: PgPool) -> Result<(), sqlx::migrate::MigrateError> {
//! suitectl::migrator().run(&pool).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module for configuration options.
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
mod email;
pub mod errors;
pub mod identity;
pub mod jobs;
mod leader_election;
mod metrics;
pub mod onboarding;
mod openapi;
mod payment_providers;
pub mod telemetry;
mod types;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

use crate::{
    api::models::users::Role,
    config::CorsOrigin,
    db::handlers::{Repository, Users},
    db::models::users::UserCreateDBRequest,
    identity::IdentityProvider,
    metrics::CreditMetrics,
    openapi::ApiDoc,
    payment_providers::PaymentProvider,
};
use axum::{
    Router,
    http::{self, HeaderValue},
    routing::{get, patch, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::{Arc, atomic::AtomicBool};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, error, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use types::{TenantId, UserId};

/// Application state shared across all request handlers.
///
/// - `db`: PostgreSQL connection pool
/// - `config`: Application configuration loaded from file and environment
/// - `identity`: organization-management provider
/// - `payment`: payment provider, absent when billing is not configured
/// - `credit_metrics`: ledger counters (when metrics are enabled)
/// - `is_leader`: whether this replica holds the leader lock
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .db(pool)
///     .config(config)
///     .identity(identity)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub identity: Arc<dyn IdentityProvider>,
    pub payment: Option<Arc<dyn PaymentProvider>>,
    pub credit_metrics: Option<CreditMetrics>,
    #[builder(default = Arc::new(AtomicBool::new(false)))]
    pub is_leader: Arc<AtomicBool>,
}

/// Get the suitectl database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Open the connection pool described by `config.database`.
pub async fn connect_database(config: &Config) -> anyhow::Result<PgPool> {
    let settings = &config.database.pool;
    let pool = PgPoolOptions::new()
        .max_connections(settings.max_connections)
        .min_connections(settings.min_connections)
        .acquire_timeout(settings.acquire_timeout)
        .idle_timeout(settings.idle_timeout)
        .connect(&config.database.url)
        .await?;
    Ok(pool)
}

/// Create the initial platform manager if it doesn't exist.
///
/// Idempotent: an existing user with this email is left untouched. Platform managers have no
/// tenant; they administer every organization.
#[instrument(skip(db), err)]
pub async fn create_initial_admin_user(email: &str, db: &PgPool) -> anyhow::Result<UserId> {
    let mut tx = db.begin().await?;
    let mut user_repo = Users::new(&mut tx);

    if let Some(existing_user) = user_repo.get_user_by_email(email).await? {
        tx.commit().await?;
        return Ok(existing_user.id);
    }

    let created_user = user_repo
        .create(&UserCreateDBRequest {
            tenant_id: None,
            email: email.to_string(),
            display_name: None,
            external_user_id: None,
            auth_source: "system".to_string(),
            is_admin: true,
            roles: vec![Role::PlatformManager],
        })
        .await?;

    tx.commit().await?;
    info!(user_id = %created_user.id, "Created initial platform manager");
    Ok(created_user.id)
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let mut origins = Vec::new();
    for origin in &config.auth.security.cors.allowed_origins {
        let header_value = match origin {
            CorsOrigin::Wildcard => "*".parse::<HeaderValue>()?,
            CorsOrigin::Url(url) => url.as_str().trim_end_matches('/').parse::<HeaderValue>()?,
        };
        origins.push(header_value);
    }

    let mut cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_credentials(config.auth.security.cors.allow_credentials)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::PATCH])
        .allow_headers([http::header::CONTENT_TYPE])
        .expose_headers(vec![http::header::LOCATION]);

    if let Some(max_age) = config.auth.security.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

fn render_registry(registry: &prometheus::Registry) -> String {
    use prometheus::{Encoder, TextEncoder};

    let mut buffer = vec![];
    if let Err(e) = TextEncoder::new().encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "Failed to encode credit metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Build the main application router with all endpoints and middleware.
///
/// - Session routes at `/authentication/*`
/// - Dashboard API at `/api/v1/*`
/// - Payment webhooks at `/webhooks/payments`
/// - API reference at `/admin/docs`
/// - Optional Prometheus metrics at `/internal/metrics`
/// - CORS and tracing middleware
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers;

    // Authentication routes (at root level, next to the SSO proxy's own paths)
    let auth_routes = Router::new()
        .route("/authentication/session", post(handlers::auth::create_session))
        .route("/authentication/logout", post(handlers::auth::logout))
        .with_state(state.clone());

    let api_routes = Router::new()
        // Onboarding
        .route("/onboarding/onboard", post(handlers::onboarding::onboard))
        .route("/onboarding/status", get(handlers::onboarding::get_status))
        .route("/onboarding/slug-availability", get(handlers::onboarding::slug_availability))
        // The caller's organization
        .route(
            "/tenants/current",
            get(handlers::tenants::get_current_tenant).patch(handlers::tenants::update_current_tenant),
        )
        .route(
            "/tenants/current/users",
            get(handlers::tenants::list_tenant_users).post(handlers::tenants::invite_tenant_user),
        )
        // Credit ledger
        .route("/credits/balance", get(handlers::credits::get_balance))
        .route("/credits/transactions", get(handlers::credits::list_transactions))
        .route("/credits/allocations", get(handlers::credits::list_allocations))
        // Usage
        .route("/usage", post(handlers::usage::record_usage))
        .route("/usage/summary", get(handlers::usage::get_usage_summary))
        .route("/usage/daily", get(handlers::usage::get_daily_usage))
        // Plans, subscriptions and payments
        .route("/plans", get(handlers::subscriptions::list_plans))
        .route("/subscriptions/current", get(handlers::subscriptions::get_current_subscription))
        .route("/subscriptions/checkout", post(handlers::subscriptions::subscription_checkout))
        .route("/payments", post(handlers::payments::create_payment))
        .route("/payments/{id}", patch(handlers::payments::process_payment))
        .route("/billing/portal", post(handlers::payments::create_billing_portal))
        // Platform administration
        .route("/admin/organizations", get(handlers::admin::list_organizations))
        .route(
            "/admin/organizations/{id}",
            get(handlers::admin::get_organization).patch(handlers::admin::update_organization),
        )
        .route(
            "/admin/organizations/{id}/credits",
            post(handlers::admin::adjust_organization_credits),
        )
        .with_state(state.clone());

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        // Webhook routes (external services, authenticated by signature)
        .route("/webhooks/payments", post(handlers::payments::webhook_handler))
        .with_state(state.clone())
        .merge(auth_routes)
        .nest("/api/v1", api_routes)
        .merge(Scalar::with_url("/admin/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(cors_layer);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        let credit_registry = state
            .credit_metrics
            .as_ref()
            .map(|m| m.registry().clone())
            .unwrap_or_default();

        router = router
            .route(
                "/internal/metrics",
                get(|| async move {
                    let mut body = metric_handle.render();
                    body.push_str(&render_registry(&credit_registry));
                    body
                }),
            )
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Container for background services and their lifecycle management.
///
/// - Leader election over a PostgreSQL advisory lock
/// - The in-server seasonal credit schedule, which only acts while this replica leads
///
/// When dropped, the `drop_guard` cancels the shutdown token, signalling all tasks to stop.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
    // Pub so that we can disarm it if we want to
    pub drop_guard: Option<tokio_util::sync::DropGuard>,
}

impl BackgroundServices {
    /// Gracefully shutdown all background tasks
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

fn setup_background_services(
    pool: PgPool,
    config: Config,
    credit_metrics: Option<CreditMetrics>,
    is_leader: Arc<AtomicBool>,
    shutdown_token: CancellationToken,
) -> BackgroundServices {
    let drop_guard = shutdown_token.clone().drop_guard();
    let mut background_tasks = Vec::new();

    if config.leader_election.enabled {
        info!("Starting leader election - will attempt to acquire leadership");
        let handle = tokio::spawn(leader_election::leader_election_task(
            pool.clone(),
            config.leader_election.interval,
            is_leader.clone(),
            leader_election::LEADER_LOCK_ID,
            shutdown_token.clone(),
        ));
        background_tasks.push(handle);
    } else {
        info!("Launching without leader election: running as leader");
        is_leader.store(true, std::sync::atomic::Ordering::Relaxed);
    }

    if config.seasonal_credits.schedule.enabled {
        let schedule_shutdown = shutdown_token.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) =
                jobs::seasonal_credits::run_schedule(pool, config, credit_metrics, is_leader, schedule_shutdown).await
            {
                error!(error = %e, "Seasonal credit schedule stopped");
            }
        });
        background_tasks.push(handle);
    }

    BackgroundServices {
        background_tasks,
        shutdown_token,
        drop_guard: Some(drop_guard),
    }
}

/// Main application struct that owns all resources and lifecycle.
///
/// 1. **Create**: [`Application::new`] connects to the database, runs migrations, creates the
///    initial platform manager, builds the providers and starts background services
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown signal resolves, background services stop and the pool closes
pub struct Application {
    router: Router,
    config: Config,
    pool: PgPool,
    bg_services: BackgroundServices,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        Self::new_with_pool(config, None).await
    }

    /// Like [`Application::new`], reusing `pool` instead of connecting when one is given
    pub async fn new_with_pool(config: Config, pool: Option<PgPool>) -> anyhow::Result<Self> {
        debug!("Starting suite control plane with configuration: {:#?}", config);

        let pool = match pool {
            Some(pool) => pool,
            None => connect_database(&config).await?,
        };
        migrator().run(&pool).await?;
        create_initial_admin_user(&config.admin_email, &pool).await?;

        let identity = identity::create_provider(&config.identity)?;
        let payment = config
            .payment
            .as_ref()
            .map(payment_providers::create_provider)
            .transpose()?
            .map(Arc::<dyn PaymentProvider>::from);

        let credit_metrics = if config.enable_metrics {
            Some(CreditMetrics::new(&prometheus::Registry::new())?)
        } else {
            None
        };

        let is_leader = Arc::new(AtomicBool::new(false));
        let bg_services = setup_background_services(
            pool.clone(),
            config.clone(),
            credit_metrics.clone(),
            is_leader.clone(),
            CancellationToken::new(),
        );

        let app_state = AppState::builder()
            .db(pool.clone())
            .config(config.clone())
            .identity(identity)
            .maybe_payment(payment)
            .maybe_credit_metrics(credit_metrics)
            .is_leader(is_leader)
            .build();

        let router = build_router(&app_state)?;

        Ok(Self {
            router,
            config,
            pool,
            bg_services,
        })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router).expect("Failed to create test server");
        (server, self.bg_services)
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "Suite control plane listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        info!("Closing database connections...");
        self.pool.close().await;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::{Application, create_initial_admin_user};
    use crate::{
        api::models::users::Role,
        db::handlers::Users,
        test_utils::{add_auth_headers, create_test_app, create_test_config, create_test_tenant, create_test_user},
    };
    use axum::http::StatusCode;
    use sqlx::PgPool;

    #[sqlx::test]
    #[test_log::test]
    async fn test_create_initial_admin_user_is_idempotent(pool: PgPool) {
        let first = create_initial_admin_user("root@suite.test", &pool).await.unwrap();
        let second = create_initial_admin_user("root@suite.test", &pool).await.unwrap();
        assert_eq!(first, second);

        let mut conn = pool.acquire().await.unwrap();
        let user = Users::new(&mut conn).get_user_by_email("root@suite.test").await.unwrap().unwrap();
        assert!(user.is_admin);
        assert_eq!(user.tenant_id, None);
        assert_eq!(user.roles, vec![Role::PlatformManager]);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_health_and_docs_are_public(pool: PgPool) {
        let app = create_test_app(pool).await;
        app.get("/healthz").await.assert_status(StatusCode::OK);
        app.get("/admin/docs").await.assert_status(StatusCode::OK);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_api_requires_authentication(pool: PgPool) {
        let app = create_test_app(pool.clone()).await;
        app.get("/api/v1/credits/balance").await.assert_status(StatusCode::UNAUTHORIZED);

        let tenant = create_test_tenant(&pool, "authed").await;
        let user = create_test_user(&pool, Some(tenant.id), "member@authed.test").await;
        let headers = add_auth_headers(&user);
        app.get("/api/v1/credits/balance")
            .add_header(&headers[0].0, &headers[0].1)
            .add_header(&headers[1].0, &headers[1].1)
            .await
            .assert_status(StatusCode::OK);
    }

    #[sqlx::test]
    #[test_log::test]
    async fn test_application_serves_with_configured_admin(pool: PgPool) {
        let mut config = create_test_config();
        config.admin_email = "platform@suite.test".to_string();

        let (server, bg_services) = Application::new_with_pool(config, Some(pool.clone()))
            .await
            .unwrap()
            .into_test_server();
        server.get("/healthz").await.assert_status(StatusCode::OK);

        let mut conn = pool.acquire().await.unwrap();
        let admin = Users::new(&mut conn).get_user_by_email("platform@suite.test").await.unwrap();
        assert!(admin.is_some());
        bg_services.shutdown().await;
    }
}
