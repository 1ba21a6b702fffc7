//! ---
//! warden_section: "06-security-access-control"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Write-path authorization of permission changes."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Decides whether a caller may replace a resource's permission set.
//!
//! A non-admin caller needs `administrate` on an existing resource; the first
//! write to an absent resource is open to anyone. On top of that, every
//! group or role entry the change adds or widens (compared with the current
//! permissions, or with the topic defaults for a new resource) must name a
//! group or role the caller belongs to. Group membership is read from the
//! caller's token; role membership is asked of the [`RoleDirectory`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use warden_model::{AuthzError, Caller, PermissionBits, PermissionMap, ResourcePermissions, Result, Right};
use warden_storage::effective_permissions;

use crate::identity::RoleDirectory;
use crate::bounded;

pub struct WriteAuthorizer {
    roles: Arc<dyn RoleDirectory>,
    identity_timeout: Duration,
}

impl WriteAuthorizer {
    pub fn new(roles: Arc<dyn RoleDirectory>, identity_timeout: Duration) -> Self {
        Self {
            roles,
            identity_timeout,
        }
    }

    /// `existing` is the stored permission set, `None` for a new resource;
    /// `defaults` are the topic defaults merged into new resources.
    pub async fn check_edit_permission(
        &self,
        caller: &Caller,
        existing: Option<&ResourcePermissions>,
        defaults: &ResourcePermissions,
        requested: &ResourcePermissions,
    ) -> Result<()> {
        if caller.is_system_admin() {
            return Ok(());
        }
        if let Some(current) = existing {
            let held = effective_permissions(current, &caller.principal);
            if !held.has(Right::Administrate) {
                return Err(AuthzError::forbidden(format!(
                    "user '{}' does not administrate this resource",
                    caller.user_id()
                )));
            }
        }
        let baseline = existing.unwrap_or(defaults);

        for group in widened(&baseline.groups, &requested.groups) {
            if !caller.is_in_group(group) {
                return Err(AuthzError::forbidden(format!(
                    "user '{}' is not a member of group '{group}'",
                    caller.user_id()
                )));
            }
        }

        for role in widened(&baseline.roles, &requested.roles) {
            let members = bounded(
                self.identity_timeout,
                "role membership lookup",
                self.roles.members_of(role),
            )
            .await
            .inspect_err(|err| warn!(role, error = %err, "role membership lookup failed"))?;
            if !members.iter().any(|member| member == caller.user_id()) {
                return Err(AuthzError::forbidden(format!(
                    "user '{}' is not a member of role '{role}'",
                    caller.user_id()
                )));
            }
            debug!(role, user = caller.user_id(), "role membership confirmed");
        }
        Ok(())
    }
}

/// Keys whose requested bits are not covered by the baseline bits.
fn widened<'a>(
    baseline: &'a PermissionMap,
    requested: &'a PermissionMap,
) -> impl Iterator<Item = &'a str> + 'a {
    requested.iter().filter_map(move |(key, bits)| {
        let before = baseline.get(key).copied().unwrap_or_else(PermissionBits::none);
        (!before.contains(*bits)).then_some(key.as_str())
    })
}
