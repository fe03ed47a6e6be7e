//! Test utilities for integration testing (available with `test-utils` feature).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use axum_test::TestServer;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::PgPool;

use crate::{
    AppState,
    api::models::users::Role,
    config::{
        Config, CreditsConfig, DummyPaymentConfig, EmailConfig, EmailTransportConfig, LeaderElectionConfig, PaymentConfig, PlanConfig,
        PoolSettings,
    },
    db::{
        handlers::{Repository, Subscriptions, Tenants, Users},
        models::{
            subscriptions::{SubscriptionCreateDBRequest, SubscriptionDBResponse, SubscriptionStatus},
            tenants::{TenantCreateDBRequest, TenantDBResponse},
            users::{UserCreateDBRequest, UserDBResponse},
        },
    },
    metrics::CreditMetrics,
    types::TenantId,
};

pub fn create_test_config() -> Config {
    let email_dir = std::env::temp_dir().join(format!("suitectl-test-emails-{}", std::process::id()));
    let defaults = Config::default();

    let mut plans = defaults.plans.clone();
    plans.push(PlanConfig {
        code: "pro".to_string(),
        name: "Pro".to_string(),
        price_id: Some("price_pro".to_string()),
        monthly_credits: Decimal::from(5000),
        onboarding_credits: Decimal::from(500),
        trial_days: 0,
    });

    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        admin_email: "platform@suite.test".to_string(),
        secret_key: Some("test-secret-key-for-testing-only".to_string()),
        payment: Some(PaymentConfig::Dummy(DummyPaymentConfig { amount: Decimal::from(10) })),
        plans,
        credits: CreditsConfig {
            operation_costs: HashMap::from([
                ("invoice.create".to_string(), Decimal::from(2)),
                ("report.view".to_string(), Decimal::ZERO),
            ]),
            ..Default::default()
        },
        email: EmailConfig {
            transport: EmailTransportConfig::File {
                path: email_dir.to_string_lossy().to_string(),
            },
            ..Default::default()
        },
        leader_election: LeaderElectionConfig {
            enabled: false,
            ..Default::default()
        },
        enable_metrics: false,
        ..defaults
    };
    config.database.pool = PoolSettings {
        max_connections: 2,
        min_connections: 0,
        ..Default::default()
    };
    config.seasonal_credits.schedule.enabled = false;
    config
}

pub async fn create_test_app_state(pool: PgPool) -> AppState {
    let config = create_test_config();
    let identity = crate::identity::create_provider(&config.identity).expect("Failed to create identity provider");
    let payment = config
        .payment
        .as_ref()
        .map(|p| crate::payment_providers::create_provider(p).expect("Failed to create payment provider"))
        .map(Arc::from);
    let credit_metrics = CreditMetrics::new(&prometheus::Registry::new()).expect("Failed to register credit metrics");

    AppState::builder()
        .db(pool)
        .config(config)
        .identity(identity)
        .maybe_payment(payment)
        .credit_metrics(credit_metrics)
        .is_leader(Arc::new(AtomicBool::new(true)))
        .build()
}

pub async fn create_test_app(pool: PgPool) -> TestServer {
    let state = create_test_app_state(pool).await;
    let router = crate::build_router(&state).expect("Failed to build router");
    TestServer::new(router).expect("Failed to create test server")
}

/// Create a tenant without a subscription. Use [`create_test_subscription`] when a test needs one.
pub async fn create_test_tenant(pool: &PgPool, slug: &str) -> TenantDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Tenants::new(&mut conn)
        .create(&TenantCreateDBRequest {
            name: slug.replace('-', " "),
            slug: slug.to_string(),
            industry: None,
            company_size: None,
            country: None,
        })
        .await
        .expect("Failed to create test tenant")
}

pub async fn create_test_subscription(pool: &PgPool, tenant_id: TenantId) -> SubscriptionDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Subscriptions::new(&mut conn)
        .create(&SubscriptionCreateDBRequest {
            tenant_id,
            plan_code: "starter".to_string(),
            status: SubscriptionStatus::Trialing,
            trial_ends_at: Some(Utc::now() + Duration::days(14)),
            current_period_end: None,
        })
        .await
        .expect("Failed to create test subscription")
}

async fn insert_user(pool: &PgPool, request: UserCreateDBRequest) -> UserDBResponse {
    let mut conn = pool.acquire().await.expect("Failed to acquire connection");
    Users::new(&mut conn).create(&request).await.expect("Failed to create test user")
}

/// Create a user with no identity link, as an invite would. Members get the Member role.
pub async fn create_test_user(pool: &PgPool, tenant_id: Option<TenantId>, email: &str) -> UserDBResponse {
    let roles = if tenant_id.is_some() { vec![Role::Member] } else { Vec::new() };
    insert_user(
        pool,
        UserCreateDBRequest {
            tenant_id,
            email: email.to_string(),
            display_name: None,
            external_user_id: None,
            auth_source: "test".to_string(),
            is_admin: false,
            roles,
        },
    )
    .await
}

pub async fn create_test_user_with_roles(pool: &PgPool, tenant_id: TenantId, email: &str, roles: Vec<Role>) -> UserDBResponse {
    insert_user(
        pool,
        UserCreateDBRequest {
            tenant_id: Some(tenant_id),
            email: email.to_string(),
            display_name: None,
            external_user_id: None,
            auth_source: "test".to_string(),
            is_admin: false,
            roles,
        },
    )
    .await
}

pub async fn create_test_user_without_tenant(pool: &PgPool, email: &str, external_user_id: Option<&str>) -> UserDBResponse {
    insert_user(
        pool,
        UserCreateDBRequest {
            tenant_id: None,
            email: email.to_string(),
            display_name: None,
            external_user_id: external_user_id.map(str::to_string),
            auth_source: "proxy-header".to_string(),
            is_admin: false,
            roles: Vec::new(),
        },
    )
    .await
}

pub async fn create_test_platform_manager(pool: &PgPool, email: &str) -> UserDBResponse {
    insert_user(
        pool,
        UserCreateDBRequest {
            tenant_id: None,
            email: email.to_string(),
            display_name: None,
            external_user_id: None,
            auth_source: "test".to_string(),
            is_admin: true,
            roles: vec![Role::PlatformManager],
        },
    )
    .await
}

/// Proxy headers that authenticate as `user`. Users without an identity link are matched by
/// email on first request and get linked to a stable id derived from their database id.
pub fn add_auth_headers(user: &UserDBResponse) -> Vec<(String, String)> {
    let config = create_test_config();
    let external_id = user
        .external_user_id
        .clone()
        .unwrap_or_else(|| format!("kp_{}", user.id.simple()));

    vec![
        (config.auth.proxy_header.header_name, external_id),
        (config.auth.proxy_header.email_header_name, user.email.clone()),
    ]
}

/// Decimals are serialized as strings; parse either form.
pub fn json_decimal(value: &Value) -> Decimal {
    match value {
        Value::String(s) => s.parse().expect("Invalid decimal string"),
        Value::Number(n) => n.to_string().parse().expect("Invalid decimal number"),
        other => panic!("Expected a decimal, got {other}"),
    }
}

pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
