//! Identity / organization-management provider abstraction.
//!
//! Tenants map one-to-one onto provider organizations (`tenants.identity_org_code`) and users
//! onto provider users (`users.external_user_id`). The provider owns login; this crate only
//! keeps organization membership in step with tenant membership.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{IdentityConfig, IdentityProviderConfig};

pub mod dummy;
pub mod kinde;

pub type Result<T> = std::result::Result<T, IdentityError>;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("identity provider request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("identity provider returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("identity provider authentication failed: {0}")]
    Auth(String),

    #[error("unexpected identity provider response: {0}")]
    InvalidResponse(String),

    #[error("{0} not found at identity provider")]
    NotFound(String),

    #[error("user could not be added ({add}) or invited ({invite})")]
    AddAndInviteFailed { add: String, invite: String },
}

/// A user to place into an organization.
#[derive(Debug, Clone)]
pub struct MemberRef<'a> {
    pub external_user_id: Option<&'a str>,
    pub email: &'a str,
    pub display_name: Option<&'a str>,
}

/// How a user ended up in an organization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Membership {
    Added,
    /// Invited by email; carries the provider user id when the provider created one
    Invited { external_user_id: Option<String> },
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Create an organization and return its code.
    async fn create_organization(&self, name: &str, external_id: &str) -> Result<String>;

    /// Codes of all organizations the user belongs to.
    async fn get_user_organizations(&self, external_user_id: &str) -> Result<Vec<String>>;

    async fn add_user_to_organization(&self, org_code: &str, external_user_id: &str, roles: &[String]) -> Result<()>;

    async fn remove_user_from_organization(&self, org_code: &str, external_user_id: &str) -> Result<()>;

    /// Create (or re-invite) a user by email directly inside an organization.
    async fn invite_user(&self, org_code: &str, email: &str, display_name: Option<&str>) -> Result<Option<String>>;
}

pub fn create_provider(config: &IdentityConfig) -> anyhow::Result<Arc<dyn IdentityProvider>> {
    Ok(match &config.provider {
        IdentityProviderConfig::Kinde(kinde) => Arc::new(kinde::KindeProvider::new(kinde.clone())?),
        IdentityProviderConfig::Dummy(dummy) => Arc::new(dummy::DummyProvider::new(dummy.clone())),
    })
}

/// Put a user into an organization: add them directly, and if that fails (or they have no
/// provider account yet) invite them by email instead.
pub async fn add_or_invite(
    provider: &dyn IdentityProvider,
    org_code: &str,
    member: &MemberRef<'_>,
    roles: &[String],
) -> Result<Membership> {
    let add_error = match member.external_user_id {
        Some(user_id) => match provider.add_user_to_organization(org_code, user_id, roles).await {
            Ok(()) => {
                info!(org_code, "Added user to organization");
                return Ok(Membership::Added);
            }
            Err(e) => {
                warn!(org_code, error = %e, "Adding user to organization failed, falling back to invite");
                e.to_string()
            }
        },
        None => "user has no identity provider account".to_string(),
    };

    match provider.invite_user(org_code, member.email, member.display_name).await {
        Ok(external_user_id) => {
            info!(org_code, "Invited user to organization");
            Ok(Membership::Invited { external_user_id })
        }
        Err(e) => Err(IdentityError::AddAndInviteFailed {
            add: add_error,
            invite: e.to_string(),
        }),
    }
}
