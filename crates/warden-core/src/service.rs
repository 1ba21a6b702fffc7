//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Operation surface consumed by the request layer.
//!
//! Read operations go straight to storage. Writes are authorized, stored
//! locally as unsynced and committed through the [`TopicRegistry`]; the
//! consumer-side apply later confirms them.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use warden_common::unix_nanos_now;
use warden_model::{
    storage_id, validate_topic_name, AuthzError, Caller, Command, CommandKind, PermissionBits,
    PermissionRequest, Principal, Resource, ResourcePermissions, Result, Right, Topic,
};
use warden_storage::{effective_permissions, Page, Storage};

use crate::authorizer::WriteAuthorizer;
use crate::notifier::{CompletionKey, CompletionNotifier, CompletionWaiter};
use crate::registry::TopicRegistry;
use crate::{bounded, CoreSettings};

/// Result of an accepted write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    /// Resource id as supplied by the caller, modifier included.
    pub resource_id: String,
    pub timestamp: i64,
    /// `Some` when a completion wait was performed: whether the consumer-side
    /// apply was observed before the timeout.
    pub confirmed: Option<bool>,
}

/// Effective bits of one requested id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputedPermissions {
    pub id: String,
    pub permissions: PermissionBits,
}

pub struct PermissionService {
    storage: Arc<dyn Storage>,
    registry: Arc<TopicRegistry>,
    authorizer: WriteAuthorizer,
    notifier: CompletionNotifier,
    settings: CoreSettings,
}

impl PermissionService {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<TopicRegistry>,
        authorizer: WriteAuthorizer,
        notifier: CompletionNotifier,
        settings: CoreSettings,
    ) -> Self {
        Self {
            storage,
            registry,
            authorizer,
            notifier,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub async fn check_permissions(
        &self,
        topic_id: &str,
        resource_id: &str,
        principal: &Principal,
        request: PermissionRequest,
    ) -> Result<bool> {
        validate_topic_name(topic_id)?;
        let id = storage_id(resource_id)?;
        bounded(
            self.settings.storage_timeout,
            "permission check",
            self.storage.check_permissions(topic_id, id, principal, request),
        )
        .await
    }

    /// Every requested id maps to its result; unknown ids map to `false`.
    pub async fn check_permissions_bulk(
        &self,
        topic_id: &str,
        resource_ids: &[String],
        principal: &Principal,
        request: PermissionRequest,
    ) -> Result<BTreeMap<String, bool>> {
        validate_topic_name(topic_id)?;
        let storage_ids = unique_storage_ids(resource_ids)?;
        let granted = bounded(
            self.settings.storage_timeout,
            "bulk permission check",
            self.storage
                .check_permissions_bulk(topic_id, &storage_ids, principal, request),
        )
        .await?;
        resource_ids
            .iter()
            .map(|id| {
                let base = storage_id(id)?;
                Ok((id.clone(), granted.get(base).copied().unwrap_or(false)))
            })
            .collect()
    }

    pub async fn list_accessible_ids(
        &self,
        topic_id: &str,
        principal: &Principal,
        request: PermissionRequest,
        page: Page,
    ) -> Result<Vec<String>> {
        validate_topic_name(topic_id)?;
        bounded(
            self.settings.storage_timeout,
            "accessible id listing",
            self.storage
                .list_accessible_ids(topic_id, principal, request, page),
        )
        .await
    }

    pub async fn list_accessible_resources(
        &self,
        topic_id: &str,
        principal: &Principal,
        request: PermissionRequest,
        page: Page,
    ) -> Result<Vec<Resource>> {
        validate_topic_name(topic_id)?;
        bounded(
            self.settings.storage_timeout,
            "accessible resource listing",
            self.storage
                .list_accessible_resources(topic_id, principal, request, page),
        )
        .await
    }

    pub async fn list_resources_with_admin_right(
        &self,
        topic_id: &str,
        principal: &Principal,
        page: Page,
    ) -> Result<Vec<Resource>> {
        validate_topic_name(topic_id)?;
        bounded(
            self.settings.storage_timeout,
            "administered resource listing",
            self.storage
                .list_resources_with_admin_right(topic_id, principal, page),
        )
        .await
    }

    /// Effective bits per requested id, in request order. Unknown ids get no bits.
    pub async fn list_computed_permissions(
        &self,
        topic_id: &str,
        resource_ids: &[String],
        principal: &Principal,
    ) -> Result<Vec<ComputedPermissions>> {
        validate_topic_name(topic_id)?;
        let storage_ids = unique_storage_ids(resource_ids)?;
        let computed = bounded(
            self.settings.storage_timeout,
            "computed permission listing",
            self.storage
                .computed_permissions(topic_id, &storage_ids, principal),
        )
        .await?;
        resource_ids
            .iter()
            .map(|id| {
                let base = storage_id(id)?;
                Ok(ComputedPermissions {
                    id: id.clone(),
                    permissions: computed.get(base).copied().unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Stored resource for system admins and administrators of it.
    pub async fn get_resource(
        &self,
        caller: &Caller,
        topic_id: &str,
        resource_id: &str,
    ) -> Result<Resource> {
        validate_topic_name(topic_id)?;
        let id = storage_id(resource_id)?;
        let resource = self
            .lookup(topic_id, id)
            .await?
            .ok_or_else(|| AuthzError::not_found(format!("resource '{topic_id}/{id}'")))?;
        require_administrate(caller, &resource)?;
        Ok(resource)
    }

    /// Replace the permission set of a resource, creating it on first write.
    pub async fn set_permission(
        &self,
        caller: &Caller,
        topic_id: &str,
        resource_id: &str,
        mut permissions: ResourcePermissions,
        wait: bool,
    ) -> Result<WriteOutcome> {
        validate_topic_name(topic_id)?;
        let id = storage_id(resource_id)?.to_owned();
        permissions.compact();
        permissions.validate()?;

        let topic = self.active_topic(topic_id).await?;
        let existing = self.lookup(topic_id, &id).await?;
        self.authorizer
            .check_edit_permission(
                caller,
                existing.as_ref().map(|resource| &resource.permissions),
                &topic.default_permissions,
                &permissions,
            )
            .await?;
        if existing.is_none() {
            permissions.merge_defaults(&topic.default_permissions);
        }

        let timestamp = next_timestamp(existing.as_ref());
        let waiter = self.waiter_for(&topic, wait, &id, CommandKind::Rights, timestamp);
        if !topic.no_transport {
            let local = Resource::new(topic_id, id.clone(), permissions.clone());
            let ignored = bounded(
                self.settings.storage_timeout,
                "resource write",
                self.storage.set_resource(local, timestamp, true),
            )
            .await?;
            if ignored {
                debug!(topic = topic_id, resource = %id, "local write superseded by a newer one");
            }
        }
        self.registry
            .commit(topic_id, Command::rights(id.clone(), permissions, timestamp))
            .await?;
        info!(
            topic = topic_id,
            resource = %id,
            user = caller.user_id(),
            created = existing.is_none(),
            timestamp,
            "permissions committed"
        );
        Ok(self.finish(resource_id, timestamp, waiter).await)
    }

    /// Delete a resource; requires system admin or `administrate`.
    pub async fn remove_resource(
        &self,
        caller: &Caller,
        topic_id: &str,
        resource_id: &str,
        wait: bool,
    ) -> Result<WriteOutcome> {
        validate_topic_name(topic_id)?;
        let id = storage_id(resource_id)?.to_owned();
        let topic = self.active_topic(topic_id).await?;
        let existing = self
            .lookup(topic_id, &id)
            .await?
            .ok_or_else(|| AuthzError::not_found(format!("resource '{topic_id}/{id}'")))?;
        require_administrate(caller, &existing)?;

        let timestamp = next_timestamp(Some(&existing));
        let waiter = self.waiter_for(&topic, wait, &id, CommandKind::Delete, timestamp);
        if !topic.no_transport {
            bounded(
                self.settings.storage_timeout,
                "resource delete",
                self.storage.delete_resource(topic_id, &id),
            )
            .await?;
        }
        self.registry
            .commit(topic_id, Command::delete(id.clone(), timestamp))
            .await?;
        info!(topic = topic_id, resource = %id, user = caller.user_id(), "resource removed");
        Ok(self.finish(resource_id, timestamp, waiter).await)
    }

    /// Announce a resource created elsewhere; it is created with the topic
    /// defaults plus `owner: rwxa` unless it already exists.
    pub async fn announce_resource(
        &self,
        topic_id: &str,
        resource_id: &str,
        owner: &str,
    ) -> Result<()> {
        validate_topic_name(topic_id)?;
        let id = storage_id(resource_id)?;
        if owner.trim().is_empty() {
            return Err(AuthzError::invalid("announced resource needs an owner"));
        }
        self.active_topic(topic_id).await?;
        self.registry
            .commit(topic_id, Command::put(id, owner, unix_nanos_now()))
            .await
    }

    pub async fn list_topics(&self, caller: &Caller) -> Result<Vec<Topic>> {
        require_system_admin(caller)?;
        bounded(
            self.settings.storage_timeout,
            "topic listing",
            self.storage.list_topics(),
        )
        .await
    }

    pub async fn get_topic(&self, caller: &Caller, topic_id: &str) -> Result<Topic> {
        require_system_admin(caller)?;
        validate_topic_name(topic_id)?;
        bounded(
            self.settings.storage_timeout,
            "topic read",
            self.storage.get_topic(topic_id),
        )
        .await
    }

    /// Create or update a topic and reconcile transports.
    pub async fn set_topic(&self, caller: &Caller, topic: Topic) -> Result<Topic> {
        require_system_admin(caller)?;
        topic.validate()?;
        let mut topic = topic.with_defaults(&self.settings.default_consumer_group);
        topic.default_permissions.compact();
        topic.last_update_timestamp = unix_nanos_now();
        bounded(
            self.settings.storage_timeout,
            "topic write",
            self.storage.set_topic(topic.clone()),
        )
        .await?;
        info!(topic = %topic.id, user = caller.user_id(), "topic stored");
        self.registry.refresh_topics().await?;
        Ok(topic)
    }

    /// Delete a topic with all its resources and tear down its transport.
    pub async fn delete_topic(&self, caller: &Caller, topic_id: &str) -> Result<()> {
        require_system_admin(caller)?;
        validate_topic_name(topic_id)?;
        bounded(
            self.settings.storage_timeout,
            "topic read",
            self.storage.get_topic(topic_id),
        )
        .await?;
        // Drain the consumer first so no apply lands after the data is gone.
        self.registry.close_topic(topic_id).await;
        bounded(
            self.settings.storage_timeout,
            "topic delete",
            self.storage.delete_topic(topic_id),
        )
        .await?;
        info!(topic = topic_id, user = caller.user_id(), "topic deleted");
        self.registry.refresh_topics().await?;
        Ok(())
    }

    async fn active_topic(&self, topic_id: &str) -> Result<Topic> {
        if let Some(topic) = self.registry.topic(topic_id).await {
            return Ok(topic);
        }
        self.registry.refresh_topics().await?;
        self.registry
            .topic(topic_id)
            .await
            .ok_or_else(|| AuthzError::not_found(format!("topic '{topic_id}'")))
    }

    async fn lookup(&self, topic_id: &str, id: &str) -> Result<Option<Resource>> {
        match bounded(
            self.settings.storage_timeout,
            "resource read",
            self.storage.get_resource(topic_id, id),
        )
        .await
        {
            Ok(resource) => Ok(Some(resource)),
            Err(AuthzError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Completion waits only make sense where a local consumer applies the command.
    fn waiter_for(
        &self,
        topic: &Topic,
        wait: bool,
        id: &str,
        kind: CommandKind,
        timestamp: i64,
    ) -> Option<CompletionWaiter> {
        let consumed_here = !topic.no_transport && !topic.disabled_consumer;
        (wait && consumed_here).then(|| {
            self.notifier
                .register(CompletionKey::new(topic.id.clone(), id, kind, timestamp))
        })
    }

    async fn finish(
        &self,
        resource_id: &str,
        timestamp: i64,
        waiter: Option<CompletionWaiter>,
    ) -> WriteOutcome {
        let confirmed = match waiter {
            Some(waiter) => Some(waiter.wait(self.settings.completion_timeout).await),
            None => None,
        };
        WriteOutcome {
            resource_id: resource_id.to_owned(),
            timestamp,
            confirmed,
        }
    }
}

fn require_system_admin(caller: &Caller) -> Result<()> {
    if caller.is_system_admin() {
        Ok(())
    } else {
        Err(AuthzError::forbidden(format!(
            "user '{}' is not a system administrator",
            caller.user_id()
        )))
    }
}

fn require_administrate(caller: &Caller, resource: &Resource) -> Result<()> {
    if caller.is_system_admin()
        || effective_permissions(&resource.permissions, &caller.principal).has(Right::Administrate)
    {
        return Ok(());
    }
    Err(AuthzError::forbidden(format!(
        "user '{}' does not administrate '{}'",
        caller.user_id(),
        resource.id
    )))
}

/// Wall clock, but strictly after the write being replaced.
fn next_timestamp(existing: Option<&Resource>) -> i64 {
    let now = unix_nanos_now();
    match existing {
        Some(resource) if resource.last_write_timestamp >= now => resource.last_write_timestamp + 1,
        _ => now,
    }
}

fn unique_storage_ids(resource_ids: &[String]) -> Result<Vec<String>> {
    let mut unique = BTreeSet::new();
    for id in resource_ids {
        unique.insert(storage_id(id)?.to_owned());
    }
    Ok(unique.into_iter().collect())
}
