//! In-memory identity provider for development and tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::RwLock;

use crate::config::DummyIdentityConfig;
use crate::identity::{IdentityError, IdentityProvider, Result};

#[derive(Debug, Default)]
struct State {
    /// org code -> name
    organizations: HashMap<String, String>,
    /// user id -> org codes
    memberships: HashMap<String, BTreeSet<String>>,
    invited: Vec<String>,
}

pub struct DummyProvider {
    config: DummyIdentityConfig,
    state: RwLock<State>,
}

impl DummyProvider {
    pub fn new(config: DummyIdentityConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::default()),
        }
    }

    /// Emails invited so far, in order.
    pub async fn invited_emails(&self) -> Vec<String> {
        self.state.read().await.invited.clone()
    }

    pub async fn organization_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().await.organizations.values().cloned().collect();
        names.sort();
        names
    }

    /// Place a user into an organization without going through the provider API.
    pub async fn seed_membership(&self, external_user_id: &str, org_code: &str) {
        let mut state = self.state.write().await;
        state.organizations.entry(org_code.to_string()).or_insert_with(|| org_code.to_string());
        state
            .memberships
            .entry(external_user_id.to_string())
            .or_default()
            .insert(org_code.to_string());
    }
}

fn invited_user_id(email: &str) -> String {
    format!("kp_invited_{}", email.to_lowercase())
}

#[async_trait]
impl IdentityProvider for DummyProvider {
    async fn create_organization(&self, name: &str, external_id: &str) -> Result<String> {
        let code = format!("org_{}", external_id.replace('-', ""));
        self.state.write().await.organizations.insert(code.clone(), name.to_string());
        tracing::info!(%code, "Dummy identity provider created organization");
        Ok(code)
    }

    async fn get_user_organizations(&self, external_user_id: &str) -> Result<Vec<String>> {
        let state = self.state.read().await;
        Ok(state
            .memberships
            .get(external_user_id)
            .map(|orgs| orgs.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn add_user_to_organization(&self, org_code: &str, external_user_id: &str, _roles: &[String]) -> Result<()> {
        if self.config.reject_add_for.iter().any(|id| id == external_user_id) {
            return Err(IdentityError::Api {
                status: 400,
                body: format!("user {external_user_id} cannot be added"),
            });
        }
        let mut state = self.state.write().await;
        if !state.organizations.contains_key(org_code) {
            return Err(IdentityError::NotFound(format!("organization {org_code}")));
        }
        state
            .memberships
            .entry(external_user_id.to_string())
            .or_default()
            .insert(org_code.to_string());
        Ok(())
    }

    async fn remove_user_from_organization(&self, org_code: &str, external_user_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let removed = state
            .memberships
            .get_mut(external_user_id)
            .map(|orgs| orgs.remove(org_code))
            .unwrap_or(false);
        if removed {
            Ok(())
        } else {
            Err(IdentityError::NotFound(format!("membership of {external_user_id} in {org_code}")))
        }
    }

    async fn invite_user(&self, org_code: &str, email: &str, _display_name: Option<&str>) -> Result<Option<String>> {
        let mut state = self.state.write().await;
        if !state.organizations.contains_key(org_code) {
            return Err(IdentityError::NotFound(format!("organization {org_code}")));
        }
        let user_id = invited_user_id(email);
        state.memberships.entry(user_id.clone()).or_default().insert(org_code.to_string());
        state.invited.push(email.to_string());
        Ok(Some(user_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_requires_membership() {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        provider.seed_membership("kp_1", "org_a").await;
        provider.seed_membership("kp_1", "org_b").await;

        provider.remove_user_from_organization("org_a", "kp_1").await.unwrap();
        assert_eq!(provider.get_user_organizations("kp_1").await.unwrap(), vec!["org_b".to_string()]);
        assert!(provider.remove_user_from_organization("org_a", "kp_1").await.is_err());
    }

    #[tokio::test]
    async fn organization_codes_derive_from_external_id() {
        let provider = DummyProvider::new(DummyIdentityConfig::default());
        let code = provider.create_organization("Acme", "0000-1111").await.unwrap();
        assert_eq!(code, "org_00001111");
        assert_eq!(provider.organization_names().await, vec!["Acme".to_string()]);
    }
}
