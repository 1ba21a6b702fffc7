//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Domain model shared by every Warden crate: permission bits and requests,
//! resources and their permission sources, topics, change commands, caller
//! identity and the error taxonomy.

pub mod caller;
pub mod command;
pub mod error;
pub mod permission;
pub mod resource;
pub mod topic;

pub use caller::{Caller, Principal};
pub use command::{Command, CommandKind};
pub use error::{AuthzError, Result};
pub use permission::{PermissionBits, PermissionRequest, Right};
pub use resource::{
    split_id_modifier, storage_id, strip_id_modifier, PermissionMap, Resource,
    ResourcePermissions, ID_MODIFIER_SEPARATOR,
};
pub use topic::{validate_topic_name, Topic, TransportIdentity};
