//! HTTP request handlers for all API endpoints.
//!
//! Handlers are organized by resource. Each one validates its input, checks the caller's
//! permissions through the [`crate::auth::permissions::RequiresPermission`] extractor, and
//! works through the repositories in [`crate::db::handlers`].
//!
//! # Handler Modules
//!
//! - [`admin`]: platform management of every organization
//! - [`auth`]: session cookies for proxy-authenticated users
//! - [`credits`]: the caller's balance, ledger and allocations
//! - [`onboarding`]: the organization creation wizard
//! - [`payments`]: credit checkout, session processing, billing portal and webhooks
//! - [`subscriptions`]: plans and plan checkout
//! - [`tenants`]: the caller's organization and its members
//! - [`usage`]: recording tracked operations and reading usage aggregates
//!
//! # Error Handling
//!
//! Handlers return [`crate::errors::Error`], which converts to the matching HTTP status and
//! a user-safe message.

pub mod admin;
pub mod auth;
pub mod credits;
pub mod onboarding;
pub mod payments;
pub mod subscriptions;
pub mod tenants;
pub mod usage;
