//! ---
//! warden_section: "04-domain-model"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Permission domain types and error taxonomy."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};

use crate::error::{AuthzError, Result};
use crate::resource::ResourcePermissions;

/// A named resource kind with its own transport and default permissions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    /// Transport channel name; empty means "same as `id`".
    #[serde(default)]
    pub event_topic_name: String,
    /// Empty means "configured default".
    #[serde(default)]
    pub consumer_group: String,
    /// Writes are applied locally without an event round-trip.
    #[serde(default)]
    pub no_transport: bool,
    #[serde(default)]
    pub ensure_transport_init: bool,
    #[serde(default)]
    pub partition_count: Option<u32>,
    #[serde(default)]
    pub disabled_consumer: bool,
    /// Seed permissions merged into every newly created resource.
    #[serde(default)]
    pub default_permissions: ResourcePermissions,
    #[serde(default)]
    pub last_update_timestamp: i64,
}

/// The part of a topic whose change forces its transport to be reopened.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportIdentity {
    pub event_topic_name: String,
    pub consumer_group: String,
    pub no_transport: bool,
    pub disabled_consumer: bool,
}

impl Topic {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// Fill the transport name and consumer group when left empty.
    pub fn with_defaults(mut self, default_consumer_group: &str) -> Self {
        if self.event_topic_name.is_empty() {
            self.event_topic_name = self.id.clone();
        }
        if self.consumer_group.is_empty() {
            self.consumer_group = default_consumer_group.to_owned();
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_topic_name(&self.id)?;
        if !self.event_topic_name.is_empty() {
            validate_topic_name(&self.event_topic_name)?;
        }
        if matches!(self.partition_count, Some(0)) {
            return Err(AuthzError::invalid(format!(
                "topic '{}' partition count must be positive",
                self.id
            )));
        }
        Ok(())
    }

    pub fn transport_identity(&self) -> TransportIdentity {
        TransportIdentity {
            event_topic_name: self.event_topic_name.clone(),
            consumer_group: self.consumer_group.clone(),
            no_transport: self.no_transport,
            disabled_consumer: self.disabled_consumer,
        }
    }

    pub fn uses_transport(&self) -> bool {
        !self.no_transport
    }
}

/// Topic and channel names: non-empty, at most 249 of `[A-Za-z0-9._-]`.
pub fn validate_topic_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 249
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if !valid {
        return Err(AuthzError::invalid(format!("invalid topic identifier '{name}'")));
    }
    Ok(())
}
