//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Owner of the live topic set and its transports.
//!
//! [`TopicRegistry::refresh_topics`] reconciles the active set against the
//! topics in storage: new topics are opened, removed topics and topics whose
//! transport identity changed (or whose consumer failed) are closed first
//! and reopened as needed. Permission reads never touch the registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use warden_metrics::SyncMetrics;
use warden_model::{AuthzError, Command, CommandKind, Resource, Result, Topic};
use warden_storage::Storage;
use warden_transport::{CommandHandler, TopicTransport, TransportProvider};

use crate::applier::TopicCommandHandler;
use crate::notifier::CompletionNotifier;
use crate::{bounded, CoreSettings};

struct ActiveTopic {
    config: Topic,
    handler: Arc<TopicCommandHandler>,
    transport: Option<Box<dyn TopicTransport>>,
}

impl ActiveTopic {
    fn needs_reopen(&self, desired: &Topic) -> bool {
        self.config.transport_identity() != desired.transport_identity()
            || self
                .transport
                .as_ref()
                .is_some_and(|transport| transport.consumer_failed())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
    pub active: usize,
}

pub struct TopicRegistry {
    storage: Arc<dyn Storage>,
    provider: Arc<dyn TransportProvider>,
    notifier: CompletionNotifier,
    metrics: Option<SyncMetrics>,
    settings: CoreSettings,
    active: RwLock<BTreeMap<String, ActiveTopic>>,
}

impl TopicRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn TransportProvider>,
        notifier: CompletionNotifier,
        metrics: Option<SyncMetrics>,
        settings: CoreSettings,
    ) -> Self {
        Self {
            storage,
            provider,
            notifier,
            metrics,
            settings,
            active: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bring the active set in line with the topics stored.
    pub async fn refresh_topics(&self) -> Result<RefreshSummary> {
        let desired: BTreeMap<String, Topic> = bounded(
            self.settings.storage_timeout,
            "topic listing",
            self.storage.list_topics(),
        )
        .await?
        .into_iter()
        .map(|topic| {
            let topic = topic.with_defaults(&self.settings.default_consumer_group);
            (topic.id.clone(), topic)
        })
        .collect();

        let mut active = self.active.write().await;
        let mut summary = RefreshSummary::default();

        let stale: Vec<String> = active
            .iter()
            .filter(|(id, entry)| match desired.get(*id) {
                Some(topic) => entry.needs_reopen(topic),
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            if let Some(mut entry) = active.remove(&id) {
                if let Some(transport) = entry.transport.as_mut() {
                    transport.close().await;
                }
                info!(topic = %id, "topic closed");
                summary.closed.push(id);
            }
        }

        for (id, topic) in &desired {
            if let Some(entry) = active.get_mut(id) {
                entry.config = topic.clone();
                continue;
            }
            match self.open(topic).await {
                Ok(entry) => {
                    info!(
                        topic = %id,
                        channel = %topic.event_topic_name,
                        no_transport = topic.no_transport,
                        consumer = entry.transport.is_some() && !topic.disabled_consumer,
                        "topic opened"
                    );
                    active.insert(id.clone(), entry);
                    summary.opened.push(id.clone());
                }
                Err(err) => error!(topic = %id, error = %err, "failed to open topic transport"),
            }
        }

        summary.active = active.len();
        if let Some(metrics) = &self.metrics {
            metrics.set_active_topics(active.len());
        }
        debug!(
            opened = summary.opened.len(),
            closed = summary.closed.len(),
            active = summary.active,
            "topics reconciled"
        );
        Ok(summary)
    }

    async fn open(&self, topic: &Topic) -> Result<ActiveTopic> {
        let handler = Arc::new(TopicCommandHandler::new(
            topic.id.clone(),
            self.storage.clone(),
            self.notifier.clone(),
            self.metrics.clone(),
            self.settings.storage_timeout,
        ));
        if topic.no_transport {
            return Ok(ActiveTopic {
                config: topic.clone(),
                handler,
                transport: None,
            });
        }
        if topic.ensure_transport_init {
            let partitions = topic
                .partition_count
                .unwrap_or(self.settings.default_partitions);
            if let Err(err) = self
                .provider
                .ensure_topic(&topic.event_topic_name, partitions)
                .await
            {
                warn!(topic = %topic.id, error = %err, "channel provisioning failed");
            }
        }
        let consumer = if topic.disabled_consumer {
            None
        } else {
            Some(handler.clone() as Arc<dyn CommandHandler>)
        };
        let transport = self.provider.open_for_topic(topic, consumer).await?;
        Ok(ActiveTopic {
            config: topic.clone(),
            handler,
            transport: Some(transport),
        })
    }

    /// Publish `command`, or apply it directly for topics without transport.
    pub async fn commit(&self, topic_id: &str, command: Command) -> Result<()> {
        if !self.is_active(topic_id).await {
            self.refresh_topics().await?;
        }
        let active = self.active.read().await;
        let entry = active
            .get(topic_id)
            .ok_or_else(|| AuthzError::not_found(format!("topic '{topic_id}' is not active")))?;
        let Some(transport) = entry.transport.as_ref() else {
            return entry.handler.apply(&command).await.map(|_| ());
        };

        bounded(self.settings.publish_timeout, "publish", async {
            transport.publish(&command).await.map_err(AuthzError::from)
        })
        .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_published(topic_id, command.kind.as_str());
        }
        if entry.config.disabled_consumer && command.kind == CommandKind::Rights {
            // Nothing here will ever consume it; a successful publish is the
            // only confirmation available.
            bounded(
                self.settings.storage_timeout,
                "sync confirmation",
                self.storage.mark_resource_as_synced(
                    topic_id,
                    &command.resource_id,
                    command.timestamp,
                ),
            )
            .await?;
        }
        Ok(())
    }

    /// Republish the stored state of `resource` with its original timestamp.
    pub async fn republish(&self, resource: &Resource) -> Result<()> {
        let command = Command::rights(
            resource.id.clone(),
            resource.permissions.clone(),
            resource.last_write_timestamp,
        );
        self.commit(&resource.topic_id, command).await
    }

    pub async fn is_active(&self, topic_id: &str) -> bool {
        self.active.read().await.contains_key(topic_id)
    }

    pub async fn active_topic_ids(&self) -> Vec<String> {
        self.active.read().await.keys().cloned().collect()
    }

    /// Configuration of an active topic, defaults filled in.
    pub async fn topic(&self, topic_id: &str) -> Option<Topic> {
        self.active
            .read()
            .await
            .get(topic_id)
            .map(|entry| entry.config.clone())
    }

    /// Whether the topic currently runs a consumer that has not failed.
    pub async fn consumer_running(&self, topic_id: &str) -> bool {
        self.active.read().await.get(topic_id).is_some_and(|entry| {
            !entry.config.disabled_consumer
                && entry
                    .transport
                    .as_ref()
                    .is_some_and(|transport| !transport.consumer_failed())
        })
    }

    /// Drop `topic_id` from the active set and close its transport, waiting
    /// for the consumer to stop. Returns `false` when the topic was not active.
    pub async fn close_topic(&self, topic_id: &str) -> bool {
        let removed = self.active.write().await.remove(topic_id);
        let Some(mut entry) = removed else {
            return false;
        };
        if let Some(transport) = entry.transport.as_mut() {
            transport.close().await;
        }
        let remaining = self.active.read().await.len();
        if let Some(metrics) = &self.metrics {
            metrics.set_active_topics(remaining);
        }
        info!(topic = %topic_id, "topic closed");
        true
    }

    /// Close every transport; used on shutdown.
    pub async fn close_all(&self) {
        let mut active = self.active.write().await;
        let closing = std::mem::take(&mut *active);
        for (id, mut entry) in closing {
            if let Some(transport) = entry.transport.as_mut() {
                transport.close().await;
            }
            debug!(topic = %id, "topic closed on shutdown");
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_active_topics(0);
        }
        info!("all topic transports closed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use warden_model::{PermissionBits, ResourcePermissions};
    use warden_storage::MemoryStorage;
    use warden_transport::MemoryBroker;

    fn registry(storage: &MemoryStorage, broker: &MemoryBroker) -> TopicRegistry {
        TopicRegistry::new(
            Arc::new(storage.clone()),
            Arc::new(broker.clone()),
            CompletionNotifier::new(),
            None,
            CoreSettings::default(),
        )
    }

    #[tokio::test]
    async fn refresh_converges_on_stored_topics() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1);
        let registry = registry(&storage, &broker);
        for id in ["a", "b", "c"] {
            storage.set_topic(Topic::new(id)).await.unwrap();
        }
        let first = registry.refresh_topics().await.unwrap();
        assert_eq!(first.opened, ["a", "b", "c"]);
        assert_eq!(registry.active_topic_ids().await, ["a", "b", "c"]);

        storage.delete_topic("b").await.unwrap();
        storage.set_topic(Topic::new("d")).await.unwrap();
        let second = registry.refresh_topics().await.unwrap();
        assert_eq!(second.closed, ["b"]);
        assert_eq!(second.opened, ["d"]);
        assert_eq!(registry.active_topic_ids().await, ["a", "c", "d"]);

        let idle = registry.refresh_topics().await.unwrap();
        assert!(idle.opened.is_empty() && idle.closed.is_empty());
        registry.close_all().await;
        assert!(registry.active_topic_ids().await.is_empty());
    }

    #[tokio::test]
    async fn identity_change_reopens_topic() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1);
        let registry = registry(&storage, &broker);
        storage.set_topic(Topic::new("devices")).await.unwrap();
        registry.refresh_topics().await.unwrap();

        let moved = Topic {
            event_topic_name: "device-events".into(),
            ensure_transport_init: true,
            partition_count: Some(3),
            ..Topic::new("devices")
        };
        storage.set_topic(moved).await.unwrap();
        let summary = registry.refresh_topics().await.unwrap();
        assert_eq!(summary.closed, ["devices"]);
        assert_eq!(summary.opened, ["devices"]);
        assert_eq!(broker.partition_count("device-events"), Some(3));

        // Only defaults changed: no reopen.
        let relaxed = Topic {
            event_topic_name: "device-events".into(),
            default_permissions: ResourcePermissions::new()
                .with_group("g1", PermissionBits::all()),
            ..Topic::new("devices")
        };
        storage.set_topic(relaxed).await.unwrap();
        let summary = registry.refresh_topics().await.unwrap();
        assert!(summary.closed.is_empty());
        let active = registry.topic("devices").await.unwrap();
        assert!(active.default_permissions.groups.contains_key("g1"));
        registry.close_all().await;
    }

    #[tokio::test]
    async fn no_transport_commits_apply_synchronously() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1);
        let registry = registry(&storage, &broker);
        let local = Topic {
            no_transport: true,
            ..Topic::new("local")
        };
        storage.set_topic(local).await.unwrap();

        let permissions = ResourcePermissions::new().with_user("u1", PermissionBits::all());
        registry
            .commit("local", Command::rights("dev-1", permissions, 5))
            .await
            .unwrap();
        let stored = storage.get_resource("local", "dev-1").await.unwrap();
        assert!(stored.synced);
        assert!(!broker.channel_exists("local"));
        assert!(!registry.consumer_running("local").await);
    }

    #[tokio::test]
    async fn close_topic_stops_its_consumer_only() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1);
        let registry = registry(&storage, &broker);
        for id in ["devices", "reports"] {
            storage.set_topic(Topic::new(id)).await.unwrap();
        }
        registry.refresh_topics().await.unwrap();

        assert!(registry.close_topic("devices").await);
        assert!(!registry.close_topic("devices").await);
        assert!(!registry.consumer_running("devices").await);
        assert_eq!(registry.active_topic_ids().await, ["reports"]);
        assert!(registry.consumer_running("reports").await);
        registry.close_all().await;
    }

    #[tokio::test]
    async fn commit_to_unknown_topic_is_not_found() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1);
        let registry = registry(&storage, &broker);
        let err = registry
            .commit("ghost", Command::delete("dev-1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthzError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_consumer_is_reopened_by_next_refresh() {
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(1).with_retry_policy(warden_transport::RetryPolicy::new(
            Duration::from_millis(5),
            Duration::from_millis(20),
        ));
        let registry = registry(&storage, &broker);
        storage.set_topic(Topic::new("devices")).await.unwrap();
        registry.refresh_topics().await.unwrap();

        storage.inject_write_failures(usize::MAX);
        let permissions = ResourcePermissions::new().with_user("u1", PermissionBits::all());
        registry
            .commit("devices", Command::rights("dev-1", permissions, 5))
            .await
            .unwrap();
        for _ in 0..200 {
            if !registry.consumer_running("devices").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!registry.consumer_running("devices").await);

        storage.inject_write_failures(0);
        let summary = registry.refresh_topics().await.unwrap();
        assert_eq!(summary.closed, ["devices"]);
        assert_eq!(summary.opened, ["devices"]);
        for _ in 0..200 {
            if storage.get_resource("devices", "dev-1").await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(storage.get_resource("devices", "dev-1").await.unwrap().synced);
        registry.close_all().await;
    }
}
