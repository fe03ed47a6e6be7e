//! Plans and subscriptions.

use crate::config::PlanConfig;
use crate::db::models::subscriptions::{SubscriptionDBResponse, SubscriptionStatus};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PlanResponse {
    pub code: String,
    pub name: String,
    #[schema(value_type = String)]
    pub monthly_credits: Decimal,
    #[schema(value_type = String)]
    pub onboarding_credits: Decimal,
    pub trial_days: u32,
    /// Whether the plan can be bought through checkout
    pub purchasable: bool,
    pub is_default: bool,
}

impl PlanResponse {
    pub fn from_config(plan: &PlanConfig, default_plan: &str) -> Self {
        Self {
            code: plan.code.clone(),
            name: plan.name.clone(),
            monthly_credits: plan.monthly_credits,
            onboarding_credits: plan.onboarding_credits,
            trial_days: plan.trial_days,
            purchasable: plan.price_id.is_some(),
            is_default: plan.code == default_plan,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionResponse {
    pub plan_code: String,
    /// Display name, absent when the plan is no longer configured
    pub plan_name: Option<String>,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    /// Whether a billing portal session can be opened
    pub has_billing_account: bool,
}

impl SubscriptionResponse {
    pub fn new(db: SubscriptionDBResponse, plan: Option<&PlanConfig>) -> Self {
        Self {
            plan_name: plan.map(|p| p.name.clone()),
            plan_code: db.plan_code,
            status: db.status,
            trial_ends_at: db.trial_ends_at,
            current_period_start: db.current_period_start,
            current_period_end: db.current_period_end,
            canceled_at: db.canceled_at,
            has_billing_account: db.provider_customer_id.is_some(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SubscriptionCheckoutRequest {
    pub plan_code: String,
}
