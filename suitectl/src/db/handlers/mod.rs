//! Repository implementations for database access.
//!
//! - [`Tenants`]: customer organizations
//! - [`Users`]: user accounts and their roles
//! - [`Subscriptions`]: one plan subscription per tenant
//! - [`Credits`]: the credit ledger (balances, allocations, transactions)
//! - [`UsageLogs`]: tracked operations and aggregates
//!
//! Tenants and users implement the generic [`Repository`] trait; the ledger-style repositories
//! expose purpose-built methods instead.

pub mod credits;
pub mod repository;
pub mod subscriptions;
pub mod tenants;
pub mod usage;
pub mod users;

pub use credits::Credits;
pub use repository::Repository;
pub use subscriptions::Subscriptions;
pub use tenants::Tenants;
pub use usage::UsageLogs;
pub use users::Users;
