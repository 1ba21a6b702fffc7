//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};
use crate::permission::PermissionBits;

/// Separates a resource id from its variant suffix (`device-1$variant`).
pub const ID_MODIFIER_SEPARATOR: char = '$';

/// Principal key to permission bits.
pub type PermissionMap = BTreeMap<String, PermissionBits>;

/// Split a caller-supplied id into its storage id and optional modifier.
pub fn split_id_modifier(id: &str) -> (&str, Option<&str>) {
    match id.split_once(ID_MODIFIER_SEPARATOR) {
        Some((base, modifier)) => (base, Some(modifier)),
        None => (id, None),
    }
}

/// Storage id for a caller-supplied id.
pub fn strip_id_modifier(id: &str) -> &str {
    split_id_modifier(id).0
}

/// Validate a caller-supplied resource id and return its storage form.
pub fn storage_id(id: &str) -> Result<&str> {
    let base = strip_id_modifier(id);
    if base.trim().is_empty() {
        return Err(AuthzError::invalid(format!("invalid resource id '{id}'")));
    }
    Ok(base)
}

/// The three independent permission sources of one resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcePermissions {
    #[serde(default)]
    pub users: PermissionMap,
    #[serde(default)]
    pub groups: PermissionMap,
    #[serde(default)]
    pub roles: PermissionMap,
}

impl ResourcePermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user: impl Into<String>, bits: PermissionBits) -> Self {
        self.users.insert(user.into(), bits);
        self
    }

    pub fn with_group(mut self, group: impl Into<String>, bits: PermissionBits) -> Self {
        self.groups.insert(group.into(), bits);
        self
    }

    pub fn with_role(mut self, role: impl Into<String>, bits: PermissionBits) -> Self {
        self.roles.insert(role.into(), bits);
        self
    }

    pub fn has_admin_user(&self) -> bool {
        self.users.values().any(|bits| bits.administrate)
    }

    /// Reject a permission set without at least one administrating user.
    pub fn validate(&self) -> Result<()> {
        if !self.has_admin_user() {
            return Err(AuthzError::invalid(
                "permissions must grant administrate to at least one user",
            ));
        }
        Ok(())
    }

    /// Fill in every default entry whose key is not already present.
    pub fn merge_defaults(&mut self, defaults: &ResourcePermissions) {
        let pairs = [
            (&mut self.users, &defaults.users),
            (&mut self.groups, &defaults.groups),
            (&mut self.roles, &defaults.roles),
        ];
        for (target, source) in pairs {
            for (key, bits) in source {
                target.entry(key.clone()).or_insert(*bits);
            }
        }
    }

    /// Drop entries that grant nothing.
    pub fn compact(&mut self) {
        self.users.retain(|_, bits| !bits.is_empty());
        self.groups.retain(|_, bits| !bits.is_empty());
        self.roles.retain(|_, bits| !bits.is_empty());
    }
}

/// One permission-bearing entity, unique per `(topic_id, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub topic_id: String,
    pub id: String,
    pub permissions: ResourcePermissions,
    /// The latest write has been confirmed through the transport loop.
    #[serde(default)]
    pub synced: bool,
    /// Unix nanoseconds of the write that produced the current state.
    #[serde(default)]
    pub last_write_timestamp: i64,
}

impl Resource {
    pub fn new(
        topic_id: impl Into<String>,
        id: impl Into<String>,
        permissions: ResourcePermissions,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            id: id.into(),
            permissions,
            synced: false,
            last_write_timestamp: 0,
        }
    }
}
