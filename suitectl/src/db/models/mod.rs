//! Database record models.
//!
//! These are distinct from the API models in [`crate::api::models`] so storage and API
//! representations can evolve independently; API models implement `From` the DB responses.

pub mod credits;
pub mod subscriptions;
pub mod tenants;
pub mod usage;
pub mod users;
