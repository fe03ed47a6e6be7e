//! Database models for tenant subscriptions.

use crate::types::{SubscriptionId, TenantId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "subscription_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    /// Map a payment-provider status string. Unknown statuses are treated as past due.
    pub fn from_provider(status: &str) -> Self {
        match status {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "canceled" | "incomplete_expired" => Self::Canceled,
            _ => Self::PastDue,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionCreateDBRequest {
    pub tenant_id: TenantId,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Changes mirrored from the payment provider. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdateDBRequest {
    pub plan_code: Option<String>,
    pub status: Option<SubscriptionStatus>,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionDBResponse {
    pub id: SubscriptionId,
    pub tenant_id: TenantId,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub provider_customer_id: Option<String>,
    pub provider_subscription_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
