//! API request and response data models.
//!
//! These are the public HTTP contract and are kept separate from the database models in
//! [`crate::db::models`], so storage can change without breaking clients. Every type is
//! annotated with `utoipa` for the generated OpenAPI document.
//!
//! - [`tenants`], [`onboarding`]: the caller's organization and how it is created
//! - [`users`]: user profiles, roles and the authenticated caller
//! - [`credits`], [`usage`]: ledger views and tracked operations
//! - [`subscriptions`], [`payments`]: plans, checkout and billing
//! - [`admin`]: platform-wide organization management
//! - [`auth`]: session cookies

pub mod admin;
pub mod auth;
pub mod credits;
pub mod onboarding;
pub mod pagination;
pub mod payments;
pub mod subscriptions;
pub mod tenants;
pub mod usage;
pub mod users;
