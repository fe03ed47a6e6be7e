//! OpenAPI documentation for the control plane.
//!
//! [`ApiDoc`] covers the session endpoints at `/authentication/*`, the payment webhook, and
//! the versioned API nested under `/api/v1`. It is rendered at `/admin/docs`.

use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, SecurityScheme},
};

use crate::{
    api::{handlers, models},
    db::models::{
        credits::{AllocationType, CreditTransactionType},
        subscriptions::SubscriptionStatus,
        tenants::TenantStatus,
    },
};

/// Cookie sessions for the dashboard, proxy headers for everything behind the auth proxy.
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.security_schemes.insert(
            "CookieAuth".to_string(),
            SecurityScheme::ApiKey(ApiKey::Cookie(ApiKeyValue::with_description(
                "suite_session",
                "Session cookie issued by `POST /authentication/session`.",
            ))),
        );
        components.security_schemes.insert(
            "X-Suite-User".to_string(),
            SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                "x-suite-user",
                "Identity-provider user id set by the authenticating proxy. \
                 Sent together with `x-suite-email`.",
            ))),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::onboarding::onboard,
        handlers::onboarding::get_status,
        handlers::onboarding::slug_availability,
        handlers::tenants::get_current_tenant,
        handlers::tenants::update_current_tenant,
        handlers::tenants::list_tenant_users,
        handlers::tenants::invite_tenant_user,
        handlers::credits::get_balance,
        handlers::credits::list_transactions,
        handlers::credits::list_allocations,
        handlers::usage::record_usage,
        handlers::usage::get_usage_summary,
        handlers::usage::get_daily_usage,
        handlers::subscriptions::list_plans,
        handlers::subscriptions::get_current_subscription,
        handlers::subscriptions::subscription_checkout,
        handlers::payments::create_payment,
        handlers::payments::process_payment,
        handlers::payments::create_billing_portal,
        handlers::admin::list_organizations,
        handlers::admin::get_organization,
        handlers::admin::update_organization,
        handlers::admin::adjust_organization_credits,
    ),
    components(schemas(
        models::onboarding::OnboardRequest,
        models::onboarding::OnboardResponse,
        models::onboarding::OnboardingStep,
        models::onboarding::OnboardingStatusResponse,
        models::onboarding::SlugAvailabilityResponse,
        models::tenants::TenantResponse,
        models::tenants::CurrentTenantResponse,
        models::tenants::TenantUpdate,
        models::tenants::IdentitySync,
        models::tenants::TenantInviteResponse,
        models::users::Role,
        models::users::TenantUserInvite,
        models::users::UserResponse,
        models::credits::BalanceResponse,
        models::credits::CreditTransactionResponse,
        models::credits::CreditAllocationResponse,
        models::usage::UsageRecordRequest,
        models::usage::UsageRecordResponse,
        models::usage::OperationUsage,
        models::usage::UsageSummaryResponse,
        models::usage::DailyUsage,
        models::subscriptions::PlanResponse,
        models::subscriptions::SubscriptionResponse,
        models::subscriptions::SubscriptionCheckoutRequest,
        models::payments::CreditCheckoutRequest,
        models::payments::CheckoutResponse,
        models::payments::PaymentProcessedResponse,
        models::payments::BillingPortalResponse,
        models::admin::OrganizationSummary,
        models::admin::OrganizationDetail,
        models::admin::OrganizationUpdate,
        models::admin::CreditAdjustmentType,
        models::admin::OrganizationCreditAdjustment,
        models::admin::OrganizationCreditAdjustmentResponse,
        TenantStatus,
        SubscriptionStatus,
        CreditTransactionType,
        AllocationType,
    )),
)]
struct V1ApiDoc;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::auth::create_session,
        handlers::auth::logout,
        handlers::payments::webhook_handler,
    ),
    components(schemas(models::auth::AuthResponse, models::auth::AuthSuccessResponse)),
    nest((path = "/api/v1", api = V1ApiDoc)),
    modifiers(&SecurityAddon),
    tags(
        (name = "authentication", description = "Dashboard session cookies for proxy-authenticated users."),
        (name = "onboarding", description = "Create an organization and check onboarding progress."),
        (name = "tenants", description = "The caller's organization and its members."),
        (name = "credits", description = "Credit balance, ledger transactions and allocations.

Credits are spent from the allocation that expires soonest. Allocations without an expiry are used last."),
        (name = "usage", description = "Record tracked operations and read usage aggregates."),
        (name = "subscriptions", description = "Plans and plan changes."),
        (name = "payments", description = "Credit top-ups, checkout processing, the billing portal and signed provider webhooks."),
        (name = "admin", description = "Platform management of every organization. Requires the PlatformManager role."),
    ),
    info(
        title = "Business Suite Control Plane API",
        version = "1.0.0",
        description = "Multi-tenant organization, subscription and credit management.

## Authentication

Requests are authenticated by the auth proxy through the `x-suite-user` and `x-suite-email` headers,
or by the session cookie issued from `POST /authentication/session`.

## Errors

Most errors are returned as plain text with the matching HTTP status. Running out of credits returns `402`.",
    ),
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::ApiDoc;
    use utoipa::OpenApi;

    #[test]
    fn test_versioned_paths_are_nested() {
        let doc = ApiDoc::openapi();
        let paths: Vec<&String> = doc.paths.paths.keys().collect();

        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/onboarding/onboard"));
        assert!(paths.iter().any(|p| p.as_str() == "/api/v1/admin/organizations/{id}/credits"));
        assert!(paths.iter().any(|p| p.as_str() == "/authentication/session"));
        assert!(paths.iter().any(|p| p.as_str() == "/webhooks/payments"));
    }

    #[test]
    fn test_security_schemes_are_registered() {
        let doc = ApiDoc::openapi();
        let schemes = &doc.components.expect("components").security_schemes;
        assert!(schemes.contains_key("CookieAuth"));
        assert!(schemes.contains_key("X-Suite-User"));
    }
}
