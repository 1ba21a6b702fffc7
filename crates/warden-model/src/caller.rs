//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};

/// Identity a permission check is evaluated for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: String,
    #[serde(default)]
    pub group_ids: Vec<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
}

impl Principal {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Self::default()
        }
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_ids = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.role_ids = roles.into_iter().map(Into::into).collect();
        self
    }
}

/// Pre-validated identity of the caller of a write or admin operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    pub principal: Principal,
    pub system_admin: bool,
}

#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default)]
    realm_access: RealmAccess,
}

#[derive(Debug, Default, Deserialize)]
struct RealmAccess {
    #[serde(default)]
    roles: Vec<String>,
}

impl Caller {
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            system_admin: false,
        }
    }

    pub fn admin(principal: Principal) -> Self {
        Self {
            principal,
            system_admin: true,
        }
    }

    /// Build a caller from a JWT whose signature the gateway already checked.
    ///
    /// `sub` becomes the user id, `groups` the group ids and
    /// `realm_access.roles` the role ids; holding `admin_role` marks the
    /// caller as system administrator.
    pub fn from_bearer_token(token: &str, admin_role: &str) -> Result<Self> {
        let token = token.trim();
        let token = token
            .strip_prefix("Bearer ")
            .or_else(|| token.strip_prefix("bearer "))
            .unwrap_or(token);
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthzError::invalid("token is not a JWT"))?;
        let decoded = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|err| AuthzError::invalid(format!("token payload is not base64: {err}")))?;
        let claims: TokenClaims = serde_json::from_slice(&decoded)
            .map_err(|err| AuthzError::invalid(format!("token claims unreadable: {err}")))?;
        if claims.sub.trim().is_empty() {
            return Err(AuthzError::invalid("token has no subject"));
        }
        let system_admin = claims.realm_access.roles.iter().any(|r| r == admin_role);
        Ok(Self {
            principal: Principal {
                user_id: claims.sub,
                group_ids: claims.groups,
                role_ids: claims.realm_access.roles,
            },
            system_admin,
        })
    }

    pub fn user_id(&self) -> &str {
        &self.principal.user_id
    }

    pub fn group_ids(&self) -> &[String] {
        &self.principal.group_ids
    }

    pub fn role_ids(&self) -> &[String] {
        &self.principal.role_ids
    }

    pub fn is_system_admin(&self) -> bool {
        self.system_admin
    }

    pub fn is_in_group(&self, group: &str) -> bool {
        self.principal.group_ids.iter().any(|g| g == group)
    }
}
