//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use warden_common::unix_nanos_before;
use warden_metrics::SyncMetrics;
use warden_model::Result;
use warden_storage::Storage;

use crate::bounded;
use crate::registry::TopicRegistry;

/// Republishes writes whose transport round-trip was never confirmed.
pub struct SyncWatchdog {
    storage: Arc<dyn Storage>,
    registry: Arc<TopicRegistry>,
    age_limit: Duration,
    storage_timeout: Duration,
    metrics: Option<SyncMetrics>,
}

impl SyncWatchdog {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<TopicRegistry>,
        age_limit: Duration,
        storage_timeout: Duration,
        metrics: Option<SyncMetrics>,
    ) -> Self {
        Self {
            storage,
            registry,
            age_limit,
            storage_timeout,
            metrics,
        }
    }

    /// One scan; returns how many resources were republished.
    pub async fn run_once(&self) -> Result<usize> {
        let cutoff = unix_nanos_before(self.age_limit);
        let stale = bounded(
            self.storage_timeout,
            "unsynced resource listing",
            self.storage.list_unsynced_resources(cutoff),
        )
        .await?;
        let mut republished = 0;
        for resource in stale {
            if !self.registry.is_active(&resource.topic_id).await {
                debug!(topic = %resource.topic_id, resource = %resource.id, "skipping unsynced resource of inactive topic");
                continue;
            }
            match self.registry.republish(&resource).await {
                Ok(()) => {
                    republished += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_republished(&resource.topic_id);
                    }
                    info!(
                        topic = %resource.topic_id,
                        resource = %resource.id,
                        timestamp = resource.last_write_timestamp,
                        "republished unsynced resource"
                    );
                }
                Err(err) => warn!(
                    topic = %resource.topic_id,
                    resource = %resource.id,
                    error = %err,
                    "republish failed"
                ),
            }
        }
        Ok(republished)
    }
}
