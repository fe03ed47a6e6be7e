use prometheus::{Counter, CounterVec, IntCounterVec, Opts, Registry};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::db::models::credits::CreditTransactionType;

/// Ledger counters, labelled by transaction type.
#[derive(Clone)]
pub struct CreditMetrics {
    granted: CounterVec,
    debited: CounterVec,
    expired: Counter,
    rejections: IntCounterVec,
    registry: Registry,
}

fn label(kind: CreditTransactionType) -> &'static str {
    match kind {
        CreditTransactionType::OnboardingGrant => "onboarding_grant",
        CreditTransactionType::SubscriptionGrant => "subscription_grant",
        CreditTransactionType::SeasonalGrant => "seasonal_grant",
        CreditTransactionType::Purchase => "purchase",
        CreditTransactionType::AdminGrant => "admin_grant",
        CreditTransactionType::AdminRemoval => "admin_removal",
        CreditTransactionType::Usage => "usage",
        CreditTransactionType::Expiry => "expiry",
    }
}

impl CreditMetrics {
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let granted = CounterVec::new(
            Opts::new("suite_credits_granted_total", "Credits added to tenant balances"),
            &["transaction_type"],
        )?;
        registry.register(Box::new(granted.clone()))?;

        let debited = CounterVec::new(
            Opts::new("suite_credits_debited_total", "Credits removed from tenant balances"),
            &["transaction_type"],
        )?;
        registry.register(Box::new(debited.clone()))?;

        let expired = Counter::new("suite_credits_expired_total", "Credits lost to allocation expiry")?;
        registry.register(Box::new(expired.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "suite_credit_rejections_total",
                "Operations rejected because the tenant balance was too low",
            ),
            &["operation"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        Ok(Self {
            granted,
            debited,
            expired,
            rejections,
            registry: registry.clone(),
        })
    }

    pub fn record_grant(&self, kind: CreditTransactionType, amount: Decimal) {
        self.granted.with_label_values(&[label(kind)]).inc_by(as_f64(amount));
    }

    pub fn record_debit(&self, kind: CreditTransactionType, amount: Decimal) {
        self.debited.with_label_values(&[label(kind)]).inc_by(as_f64(amount));
    }

    pub fn record_expiry(&self, amount: Decimal) {
        self.expired.inc_by(as_f64(amount));
    }

    pub fn record_rejection(&self, operation: &str) {
        self.rejections.with_label_values(&[operation]).inc();
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Counters only go up, so anything unrepresentable or negative counts as zero.
fn as_f64(amount: Decimal) -> f64 {
    amount.to_f64().filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    fn render(registry: &Registry) -> String {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn counters_render_with_labels() {
        let registry = Registry::new();
        let metrics = CreditMetrics::new(&registry).unwrap();

        metrics.record_grant(CreditTransactionType::Purchase, Decimal::new(1250, 2));
        metrics.record_debit(CreditTransactionType::Usage, Decimal::from(3));
        metrics.record_expiry(Decimal::from(7));
        metrics.record_rejection("report_export");

        let output = render(&registry);
        assert!(output.contains(r#"suite_credits_granted_total{transaction_type="purchase"} 12.5"#));
        assert!(output.contains(r#"suite_credits_debited_total{transaction_type="usage"} 3"#));
        assert!(output.contains("suite_credits_expired_total 7"));
        assert!(output.contains(r#"suite_credit_rejections_total{operation="report_export"} 1"#));
    }

    #[test]
    fn negative_amounts_are_ignored() {
        let registry = Registry::new();
        let metrics = CreditMetrics::new(&registry).unwrap();
        metrics.record_grant(CreditTransactionType::AdminGrant, Decimal::from(-5));
        assert!(render(&registry).contains(r#"suite_credits_granted_total{transaction_type="admin_grant"} 0"#));
    }

    #[test]
    fn registering_twice_on_one_registry_fails() {
        let registry = Registry::new();
        CreditMetrics::new(&registry).unwrap();
        assert!(CreditMetrics::new(&registry).is_err());
    }
}
