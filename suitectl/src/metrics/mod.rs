//! Prometheus metrics for the credit ledger.
//!
//! HTTP request metrics come from `axum-prometheus`; the collectors here live on their own
//! [`prometheus::Registry`] and are appended to the `/internal/metrics` output.

mod credits;

pub use credits::CreditMetrics;
