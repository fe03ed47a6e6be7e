//! Kinde management API client.
//!
//! Authenticates with the client-credentials grant; the machine-to-machine token is cached
//! until shortly before it expires.

use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};
use url::Url;

use crate::config::KindeConfig;
use crate::identity::{IdentityError, IdentityProvider, Result};

const TOKEN_KEY: &str = "m2m";
/// Tokens are refreshed this long before Kinde would reject them.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AccessToken {
    value: String,
    lifetime: Duration,
}

struct TokenExpiry;

impl Expiry<&'static str, AccessToken> for TokenExpiry {
    fn expire_after_create(&self, _key: &&'static str, token: &AccessToken, _created_at: Instant) -> Option<Duration> {
        Some(token.lifetime.saturating_sub(TOKEN_REFRESH_MARGIN))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Deserialize)]
struct CreateOrganizationResponse {
    organization: Option<OrganizationCode>,
}

#[derive(Debug, Deserialize)]
struct OrganizationCode {
    code: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    #[serde(default)]
    organizations: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreateUserResponse {
    id: Option<String>,
}

pub struct KindeProvider {
    client: Client,
    base_url: Url,
    config: KindeConfig,
    tokens: Cache<&'static str, AccessToken>,
}

impl KindeProvider {
    pub fn new(config: KindeConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let base_url = config.domain.clone();
        if base_url.cannot_be_a_base() {
            anyhow::bail!("Kinde domain {base_url} cannot carry a path");
        }
        let tokens = Cache::builder().max_capacity(1).expire_after(TokenExpiry).build();
        Ok(Self {
            client,
            base_url,
            config,
            tokens,
        })
    }

    async fn access_token(&self) -> Result<String> {
        self.tokens
            .try_get_with(TOKEN_KEY, self.fetch_token())
            .await
            .map(|token| token.value)
            .map_err(|e| IdentityError::Auth(e.to_string()))
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        debug!("Requesting Kinde management API token");
        let audience = self.config.audience();
        let response = self
            .client
            .post(self.endpoint(&["oauth2", "token"])?)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret.as_str()),
                ("audience", audience.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = ensure_success(response).await?.json().await?;
        Ok(AccessToken {
            value: token.access_token,
            lifetime: Duration::from_secs(token.expires_in),
        })
    }

    /// Management API URL; each segment is percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut full = vec!["api", "v1"];
        full.extend_from_slice(segments);
        self.endpoint(&full)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| IdentityError::InvalidResponse(format!("{} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == StatusCode::NOT_FOUND {
        return Err(IdentityError::NotFound(body));
    }
    Err(IdentityError::Api {
        status: status.as_u16(),
        body,
    })
}

fn split_name(display_name: Option<&str>) -> (Option<&str>, Option<&str>) {
    match display_name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => match name.split_once(' ') {
            Some((given, family)) => (Some(given), Some(family.trim())),
            None => (Some(name), None),
        },
        None => (None, None),
    }
}

#[async_trait]
impl IdentityProvider for KindeProvider {
    #[instrument(skip(self), err)]
    async fn create_organization(&self, name: &str, external_id: &str) -> Result<String> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&["organization"])?)
            .bearer_auth(token)
            .json(&json!({ "name": name, "external_id": external_id }))
            .send()
            .await?;
        let created: CreateOrganizationResponse = ensure_success(response).await?.json().await?;
        created
            .organization
            .map(|org| org.code)
            .ok_or_else(|| IdentityError::InvalidResponse("organization code missing".to_string()))
    }

    #[instrument(skip(self), err)]
    async fn get_user_organizations(&self, external_user_id: &str) -> Result<Vec<String>> {
        let token = self.access_token().await?;
        let response = self
            .client
            .get(self.url(&["user"])?)
            .bearer_auth(token)
            .query(&[("id", external_user_id), ("expand", "organizations")])
            .send()
            .await?;
        let user: UserResponse = ensure_success(response).await?.json().await?;
        Ok(user.organizations)
    }

    #[instrument(skip(self, roles), err)]
    async fn add_user_to_organization(&self, org_code: &str, external_user_id: &str, roles: &[String]) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .post(self.url(&["organizations", org_code, "users"])?)
            .bearer_auth(token)
            .json(&json!({ "users": [{ "id": external_user_id, "roles": roles }] }))
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn remove_user_from_organization(&self, org_code: &str, external_user_id: &str) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .client
            .delete(self.url(&["organizations", org_code, "users", external_user_id])?)
            .bearer_auth(token)
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    #[instrument(skip(self, email, display_name), err)]
    async fn invite_user(&self, org_code: &str, email: &str, display_name: Option<&str>) -> Result<Option<String>> {
        let token = self.access_token().await?;
        let (given_name, family_name) = split_name(display_name);
        let response = self
            .client
            .post(self.url(&["user"])?)
            .bearer_auth(token)
            .json(&json!({
                "profile": { "given_name": given_name, "family_name": family_name },
                "organization_code": org_code,
                "identities": [{ "type": "email", "details": { "email": email } }],
            }))
            .send()
            .await?;
        let created: CreateUserResponse = ensure_success(response).await?.json().await?;
        Ok(created.id)
    }
}
