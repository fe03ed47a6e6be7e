//! API layer for HTTP request handling and data models.
//!
//! - **[`handlers`]**: Axum route handlers for all API endpoints
//! - **[`models`]**: Request/response data structures for API communication
//!
//! # API Structure
//!
//! - **Authentication** (`/authentication/*`): session cookie issue and logout
//! - **Onboarding** (`/api/v1/onboarding/*`): organization creation wizard
//! - **Tenants** (`/api/v1/tenants/current*`): the caller's organization and members
//! - **Credits & Usage** (`/api/v1/credits/*`, `/api/v1/usage*`): ledger and tracked operations
//! - **Billing** (`/api/v1/plans`, `/api/v1/subscriptions/*`, `/api/v1/payments*`,
//!   `/api/v1/billing/portal`): plans, checkout and the provider portal
//! - **Admin** (`/api/v1/admin/organizations*`): platform management
//! - **Webhooks** (`/webhooks/payments`): signed payment provider events
//!
//! # OpenAPI Documentation
//!
//! All endpoints are documented with `utoipa`. The rendered reference is served at
//! `/admin/docs` when the server is running.

pub mod handlers;
pub mod models;
