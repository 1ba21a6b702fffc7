//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! The single "apply a change command" path, used by transport consumers and
//! by topics without transport alike.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;
use warden_metrics::SyncMetrics;
use warden_model::{
    AuthzError, Command, CommandKind, PermissionBits, Resource, ResourcePermissions, Result,
};
use warden_storage::Storage;
use warden_transport::CommandHandler;

use crate::bounded;
use crate::notifier::{CompletionKey, CompletionNotifier};

pub struct TopicCommandHandler {
    topic_id: String,
    storage: Arc<dyn Storage>,
    notifier: CompletionNotifier,
    metrics: Option<SyncMetrics>,
    storage_timeout: Duration,
}

impl TopicCommandHandler {
    pub fn new(
        topic_id: impl Into<String>,
        storage: Arc<dyn Storage>,
        notifier: CompletionNotifier,
        metrics: Option<SyncMetrics>,
        storage_timeout: Duration,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            storage,
            notifier,
            metrics,
            storage_timeout,
        }
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    /// Apply `command` to storage. Returns `true` when it changed nothing.
    pub async fn apply(&self, command: &Command) -> Result<bool> {
        command.validate()?;
        let ignored = match command.kind {
            CommandKind::Rights => self.apply_rights(command).await?,
            CommandKind::Put => self.apply_put(command).await?,
            CommandKind::Delete => {
                bounded(
                    self.storage_timeout,
                    "resource delete",
                    self.storage.delete_resource(&self.topic_id, &command.resource_id),
                )
                .await?;
                false
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.record_applied(&self.topic_id, command.kind.as_str());
            if ignored {
                metrics.record_ignored(&self.topic_id);
            }
        }
        debug!(
            topic = %self.topic_id,
            resource = %command.resource_id,
            kind = %command.kind,
            timestamp = command.timestamp,
            ignored,
            "command applied"
        );
        self.notifier.signal(&CompletionKey::new(
            self.topic_id.clone(),
            command.resource_id.clone(),
            command.kind,
            command.timestamp,
        ));
        Ok(ignored)
    }

    async fn apply_rights(&self, command: &Command) -> Result<bool> {
        let permissions = command
            .permissions
            .clone()
            .ok_or_else(|| AuthzError::invalid("RIGHTS command without permissions"))?;
        let resource = Resource {
            synced: true,
            ..Resource::new(self.topic_id.clone(), command.resource_id.clone(), permissions)
        };
        let ignored = bounded(
            self.storage_timeout,
            "resource write",
            self.storage.set_resource(resource, command.timestamp, true),
        )
        .await?;
        if ignored {
            // An equal timestamp is the echo of our own local write.
            bounded(
                self.storage_timeout,
                "sync confirmation",
                self.storage.mark_resource_as_synced(
                    &self.topic_id,
                    &command.resource_id,
                    command.timestamp,
                ),
            )
            .await?;
        }
        Ok(ignored)
    }

    async fn apply_put(&self, command: &Command) -> Result<bool> {
        let owner = command
            .owner
            .as_deref()
            .ok_or_else(|| AuthzError::invalid("PUT command without owner"))?;
        match bounded(
            self.storage_timeout,
            "resource read",
            self.storage.get_resource(&self.topic_id, &command.resource_id),
        )
        .await
        {
            Ok(_) => return Ok(true),
            Err(AuthzError::NotFound(_)) => {}
            Err(err) => return Err(err),
        }
        let defaults = match bounded(
            self.storage_timeout,
            "topic read",
            self.storage.get_topic(&self.topic_id),
        )
        .await
        {
            Ok(topic) => topic.default_permissions,
            Err(AuthzError::NotFound(_)) => ResourcePermissions::new(),
            Err(err) => return Err(err),
        };
        let mut permissions = ResourcePermissions::new().with_user(owner, PermissionBits::all());
        permissions.merge_defaults(&defaults);
        let resource = Resource {
            synced: true,
            ..Resource::new(self.topic_id.clone(), command.resource_id.clone(), permissions)
        };
        bounded(
            self.storage_timeout,
            "resource write",
            self.storage.set_resource(resource, command.timestamp, true),
        )
        .await
    }
}

#[async_trait]
impl CommandHandler for TopicCommandHandler {
    async fn handle(&self, command: Command) -> Result<()> {
        self.apply(&command).await.map(|_| ())
    }
}
