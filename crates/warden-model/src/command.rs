//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};
use crate::resource::ResourcePermissions;

/// Kind of a change command carried over the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    /// Replace the permission set of a resource.
    Rights,
    /// Announce a resource; creates it with defaults plus owner when absent.
    Put,
    /// Remove a resource.
    Delete,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Rights => "RIGHTS",
            CommandKind::Put => "PUT",
            CommandKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of CQRS propagation for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<ResourcePermissions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Producer-side unix nanoseconds used for ordering.
    pub timestamp: i64,
}

impl Command {
    pub fn rights(
        resource_id: impl Into<String>,
        permissions: ResourcePermissions,
        timestamp: i64,
    ) -> Self {
        Self {
            kind: CommandKind::Rights,
            resource_id: resource_id.into(),
            permissions: Some(permissions),
            owner: None,
            timestamp,
        }
    }

    pub fn put(resource_id: impl Into<String>, owner: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: CommandKind::Put,
            resource_id: resource_id.into(),
            permissions: None,
            owner: Some(owner.into()),
            timestamp,
        }
    }

    pub fn delete(resource_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: CommandKind::Delete,
            resource_id: resource_id.into(),
            permissions: None,
            owner: None,
            timestamp,
        }
    }

    /// Structural checks a consumer applies before touching storage.
    pub fn validate(&self) -> Result<()> {
        if self.resource_id.trim().is_empty() {
            return Err(AuthzError::invalid("command without resource id"));
        }
        match self.kind {
            CommandKind::Rights => match &self.permissions {
                Some(permissions) => permissions.validate(),
                None => Err(AuthzError::invalid(format!(
                    "RIGHTS command for '{}' carries no permissions",
                    self.resource_id
                ))),
            },
            CommandKind::Put => match self.owner.as_deref() {
                Some(owner) if !owner.trim().is_empty() => Ok(()),
                _ => Err(AuthzError::invalid(format!(
                    "PUT command for '{}' carries no owner",
                    self.resource_id
                ))),
            },
            CommandKind::Delete => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::PermissionBits;

    #[test]
    fn wire_form_uses_upper_case_kinds() {
        let command = Command::delete("dev-1", 42);
        let json = serde_json::to_value(&command).unwrap();
        assert_eq!(json["kind"], "DELETE");
        assert_eq!(json["timestamp"], 42);
        assert!(json.get("permissions").is_none());
    }

    #[test]
    fn validation_per_kind() {
        assert!(Command::delete("dev-1", 1).validate().is_ok());
        assert!(Command::put("dev-1", " ", 1).validate().is_err());
        assert!(Command::rights("dev-1", ResourcePermissions::new(), 1)
            .validate()
            .is_err());
        let admin = ResourcePermissions::new().with_user("u1", PermissionBits::all());
        assert!(Command::rights("dev-1", admin, 1).validate().is_ok());
        let mut missing = Command::delete("dev-1", 1);
        missing.kind = CommandKind::Rights;
        assert!(missing.validate().is_err());
    }
}
