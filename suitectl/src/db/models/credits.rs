//! Database models for the credit ledger.

use crate::types::{AllocationId, TenantId, TransactionId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Kind of bucket a grant lands in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "credit_allocation_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    Onboarding,
    Seasonal,
    Subscription,
    Purchase,
    Grant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, sqlx::Type, PartialEq, Eq, ToSchema)]
#[sqlx(type_name = "credit_transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CreditTransactionType {
    OnboardingGrant,
    SubscriptionGrant,
    SeasonalGrant,
    Purchase,
    AdminGrant,
    AdminRemoval,
    Usage,
    Expiry,
}

impl CreditTransactionType {
    /// Whether this transaction adds credits to the balance.
    pub fn is_credit(self) -> bool {
        matches!(
            self,
            Self::OnboardingGrant | Self::SubscriptionGrant | Self::SeasonalGrant | Self::Purchase | Self::AdminGrant
        )
    }

    /// Allocation bucket used for grants of this type.
    pub fn allocation_type(self) -> Option<AllocationType> {
        match self {
            Self::OnboardingGrant => Some(AllocationType::Onboarding),
            Self::SubscriptionGrant => Some(AllocationType::Subscription),
            Self::SeasonalGrant => Some(AllocationType::Seasonal),
            Self::Purchase => Some(AllocationType::Purchase),
            Self::AdminGrant => Some(AllocationType::Grant),
            Self::AdminRemoval | Self::Usage | Self::Expiry => None,
        }
    }
}

/// Request to add credits to a tenant
#[derive(Debug, Clone)]
pub struct CreditGrantDBRequest {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub transaction_type: CreditTransactionType,
    pub amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    /// Idempotency key; a second grant with the same value returns the first transaction
    pub source_id: String,
    pub description: Option<String>,
}

impl CreditGrantDBRequest {
    /// Admin grant with a generated source id
    pub fn admin_grant(
        tenant_id: TenantId,
        grantor_id: UserId,
        amount: Decimal,
        expires_at: Option<DateTime<Utc>>,
        description: Option<String>,
    ) -> Self {
        let transaction_type = if expires_at.is_some() {
            CreditTransactionType::SeasonalGrant
        } else {
            CreditTransactionType::AdminGrant
        };
        Self {
            tenant_id,
            user_id: Some(grantor_id),
            transaction_type,
            amount,
            expires_at,
            source_id: format!("admin:{}:{}", grantor_id, uuid::Uuid::new_v4()),
            description,
        }
    }
}

/// Request to remove credits from a tenant
#[derive(Debug, Clone)]
pub struct CreditDebitDBRequest {
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub transaction_type: CreditTransactionType,
    pub amount: Decimal,
    pub source_id: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditTransactionDBResponse {
    pub id: TransactionId,
    pub tenant_id: TenantId,
    pub user_id: Option<UserId>,
    pub transaction_type: CreditTransactionType,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub source_id: String,
    pub description: Option<String>,
    pub allocation_id: Option<AllocationId>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CreditAllocationDBResponse {
    pub id: AllocationId,
    pub tenant_id: TenantId,
    pub allocation_type: AllocationType,
    pub amount: Decimal,
    pub remaining: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiry_warning_sent_at: Option<DateTime<Utc>>,
    pub expired_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Ledger write result. `replayed` is set when the source id was already recorded.
#[derive(Debug, Clone)]
pub struct RecordedTransaction {
    pub transaction: CreditTransactionDBResponse,
    pub replayed: bool,
}

#[derive(Debug, Clone)]
pub enum DebitOutcome {
    Applied(RecordedTransaction),
    Insufficient { available: Decimal },
}

/// Result of expiring a single allocation
#[derive(Debug, Clone)]
pub struct ExpiredAllocation {
    pub allocation_id: AllocationId,
    pub tenant_id: TenantId,
    pub expired_amount: Decimal,
    pub transaction: Option<CreditTransactionDBResponse>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grant_types_map_to_allocation_buckets() {
        assert_eq!(
            CreditTransactionType::OnboardingGrant.allocation_type(),
            Some(AllocationType::Onboarding)
        );
        assert_eq!(CreditTransactionType::Usage.allocation_type(), None);
        assert!(CreditTransactionType::Purchase.is_credit());
        assert!(!CreditTransactionType::Expiry.is_credit());
    }

    #[test]
    fn admin_grant_with_expiry_is_seasonal() {
        let tenant = uuid::Uuid::new_v4();
        let admin = uuid::Uuid::new_v4();
        let plain = CreditGrantDBRequest::admin_grant(tenant, admin, Decimal::from(5), None, None);
        assert_eq!(plain.transaction_type, CreditTransactionType::AdminGrant);

        let seasonal = CreditGrantDBRequest::admin_grant(tenant, admin, Decimal::from(5), Some(Utc::now()), None);
        assert_eq!(seasonal.transaction_type, CreditTransactionType::SeasonalGrant);
        assert_ne!(plain.source_id, seasonal.source_id);
    }
}
