//! ---
//! warden_section: "03-persistence-storage"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Storage contract, permission engine and backends."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;
use warden_model::{AuthzError, Resource, Result, Topic};

use crate::Storage;

type ResourceKey = (String, String);

#[derive(Debug, Default)]
struct Tables {
    topics: BTreeMap<String, Topic>,
    resources: BTreeMap<ResourceKey, Resource>,
}

/// In-memory backend suitable for development and tests.
///
/// All tables sit behind one lock, so each mutation is atomic with respect
/// to every reader.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
    failing_writes: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` resource writes fail with a transient error.
    pub fn inject_write_failures(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    pub fn resource_count(&self) -> usize {
        self.tables.read().resources.len()
    }

    fn take_injected_failure(&self) -> Result<()> {
        let consumed = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match consumed {
            Ok(_) => Err(AuthzError::transient("injected storage write failure")),
            Err(_) => Ok(()),
        }
    }
}

fn key(topic_id: &str, id: &str) -> ResourceKey {
    (topic_id.to_owned(), id.to_owned())
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get_resource(&self, topic_id: &str, id: &str) -> Result<Resource> {
        self.tables
            .read()
            .resources
            .get(&key(topic_id, id))
            .cloned()
            .ok_or_else(|| AuthzError::not_found(format!("resource '{topic_id}/{id}'")))
    }

    async fn get_resources(&self, topic_id: &str, ids: &[String]) -> Result<Vec<Resource>> {
        let tables = self.tables.read();
        Ok(ids
            .iter()
            .filter_map(|id| tables.resources.get(&key(topic_id, id)).cloned())
            .collect())
    }

    async fn scan_resources(&self, topic_id: &str) -> Result<Vec<Resource>> {
        let tables = self.tables.read();
        let start = (topic_id.to_owned(), String::new());
        Ok(tables
            .resources
            .range(start..)
            .take_while(|((topic, _), _)| topic == topic_id)
            .map(|(_, resource)| resource.clone())
            .collect())
    }

    async fn set_resource(
        &self,
        mut resource: Resource,
        timestamp: i64,
        prevent_older_updates: bool,
    ) -> Result<bool> {
        self.take_injected_failure()?;
        let mut tables = self.tables.write();
        if !tables.topics.contains_key(&resource.topic_id) {
            return Err(AuthzError::not_found(format!(
                "topic '{}'",
                resource.topic_id
            )));
        }
        let slot = key(&resource.topic_id, &resource.id);
        if prevent_older_updates {
            if let Some(stored) = tables.resources.get(&slot) {
                if stored.last_write_timestamp >= timestamp {
                    debug!(
                        topic = %resource.topic_id,
                        resource = %resource.id,
                        stored = stored.last_write_timestamp,
                        incoming = timestamp,
                        "ignored stale resource write"
                    );
                    return Ok(true);
                }
            }
        }
        resource.last_write_timestamp = timestamp;
        tables.resources.insert(slot, resource);
        Ok(false)
    }

    async fn delete_resource(&self, topic_id: &str, id: &str) -> Result<()> {
        self.take_injected_failure()?;
        self.tables.write().resources.remove(&key(topic_id, id));
        Ok(())
    }

    async fn list_topics(&self) -> Result<Vec<Topic>> {
        Ok(self.tables.read().topics.values().cloned().collect())
    }

    async fn get_topic(&self, topic_id: &str) -> Result<Topic> {
        self.tables
            .read()
            .topics
            .get(topic_id)
            .cloned()
            .ok_or_else(|| AuthzError::not_found(format!("topic '{topic_id}'")))
    }

    async fn set_topic(&self, topic: Topic) -> Result<()> {
        self.tables.write().topics.insert(topic.id.clone(), topic);
        Ok(())
    }

    async fn delete_topic(&self, topic_id: &str) -> Result<()> {
        let mut tables = self.tables.write();
        tables.topics.remove(topic_id);
        tables.resources.retain(|(topic, _), _| topic != topic_id);
        Ok(())
    }

    async fn list_unsynced_resources(&self, older_than: i64) -> Result<Vec<Resource>> {
        Ok(self
            .tables
            .read()
            .resources
            .values()
            .filter(|resource| !resource.synced && resource.last_write_timestamp < older_than)
            .cloned()
            .collect())
    }

    async fn mark_resource_as_synced(
        &self,
        topic_id: &str,
        id: &str,
        timestamp: i64,
    ) -> Result<bool> {
        let mut tables = self.tables.write();
        match tables.resources.get_mut(&key(topic_id, id)) {
            Some(resource) if resource.last_write_timestamp == timestamp => {
                resource.synced = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
