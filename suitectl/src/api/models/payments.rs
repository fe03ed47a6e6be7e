use crate::types::TenantId;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Credit top-up request. Providers with a fixed amount ignore `currency_units`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct CreditCheckoutRequest {
    /// Whole currency units to pay (default 10)
    pub currency_units: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CheckoutResponse {
    pub session_id: String,
    /// Where to send the browser
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentProcessedResponse {
    Credits {
        #[schema(value_type = String, format = "uuid")]
        tenant_id: TenantId,
        #[schema(value_type = String)]
        credits_added: Decimal,
        already_processed: bool,
    },
    Subscription {
        #[schema(value_type = String, format = "uuid")]
        tenant_id: TenantId,
        plan_code: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BillingPortalResponse {
    pub url: String,
}
