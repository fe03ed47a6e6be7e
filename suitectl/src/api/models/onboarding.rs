//! Onboarding wizard payloads.

use crate::api::models::subscriptions::SubscriptionResponse;
use crate::api::models::tenants::{IdentitySync, TenantResponse};
use crate::types::TenantId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OnboardRequest {
    pub company_name: String,
    /// URL slug; derived from the company name when absent
    pub slug: Option<String>,
    pub industry: Option<String>,
    pub company_size: Option<String>,
    pub country: Option<String>,
    /// Display name for the onboarding user
    pub admin_display_name: Option<String>,
    /// Plan to start on; the configured default plan when absent
    pub plan_code: Option<String>,
    #[serde(default)]
    pub accepted_terms: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OnboardResponse {
    pub tenant: TenantResponse,
    pub subscription: SubscriptionResponse,
    #[schema(value_type = String)]
    pub credits_granted: Decimal,
    pub identity_sync: IdentitySync,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStep {
    /// No tenant yet: show the company form
    CreateOrganization,
    /// Tenant exists but the identity organization link is incomplete
    IdentitySync,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OnboardingStatusResponse {
    pub onboarded: bool,
    #[schema(value_type = Option<String>, format = "uuid")]
    pub tenant_id: Option<TenantId>,
    pub step: OnboardingStep,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct SlugAvailabilityQuery {
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SlugAvailabilityResponse {
    /// The slug after normalisation
    pub slug: String,
    pub available: bool,
    /// Why the slug cannot be used, when it is invalid
    pub reason: Option<String>,
}
