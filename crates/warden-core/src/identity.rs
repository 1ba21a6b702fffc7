//! ---
//! warden_section: "06-security-access-control"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Role membership lookups against the identity service."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;
use url::Url;
use warden_model::{AuthzError, Result};

/// Delegated role membership lookup.
#[async_trait]
pub trait RoleDirectory: Send + Sync {
    /// User ids holding `role_id`; an unknown role has no members.
    async fn members_of(&self, role_id: &str) -> Result<Vec<String>>;
}

/// Role directory backed by the identity service's REST API
/// (`GET {base}/roles/{role}/members` answering a JSON array of user ids).
#[derive(Debug, Clone)]
pub struct HttpRoleDirectory {
    client: reqwest::Client,
    base: Url,
}

impl HttpRoleDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|err| {
            AuthzError::invalid(format!("invalid identity service url '{base_url}': {err}"))
        })?;
        if base.cannot_be_a_base() {
            return Err(AuthzError::invalid(format!(
                "identity service url '{base_url}' cannot be used as a base"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| AuthzError::transient(format!("identity client setup failed: {err}")))?;
        Ok(Self { client, base })
    }

    fn members_url(&self, role_id: &str) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().extend(["roles", role_id, "members"]);
        }
        url
    }
}

#[async_trait]
impl RoleDirectory for HttpRoleDirectory {
    async fn members_of(&self, role_id: &str) -> Result<Vec<String>> {
        let url = self.members_url(role_id);
        debug!(role = role_id, url = %url, "looking up role members");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| AuthzError::transient(format!("role lookup for '{role_id}' failed: {err}")))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let response = response.error_for_status().map_err(|err| {
            AuthzError::transient(format!("role lookup for '{role_id}' failed: {err}"))
        })?;
        response.json::<Vec<String>>().await.map_err(|err| {
            AuthzError::transient(format!("role lookup for '{role_id}' returned bad body: {err}"))
        })
    }
}

/// Fixed role table for tests and deployments without an identity service.
#[derive(Debug, Clone, Default)]
pub struct StaticRoleDirectory {
    members: HashMap<String, Vec<String>>,
}

impl StaticRoleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role<I, S>(mut self, role_id: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.members
            .insert(role_id.into(), members.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl RoleDirectory for StaticRoleDirectory {
    async fn members_of(&self, role_id: &str) -> Result<Vec<String>> {
        Ok(self.members.get(role_id).cloned().unwrap_or_default())
    }
}
