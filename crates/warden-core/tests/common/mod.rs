//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use warden_core::{CoreSettings, PermissionService, StaticRoleDirectory, TopicRegistry, Warden};
use warden_metrics::{new_registry, SyncMetrics};
use warden_model::{Caller, PermissionBits, Principal, ResourcePermissions, Topic};
use warden_storage::{MemoryStorage, Storage};
use warden_transport::{MemoryBroker, RetryPolicy};

pub struct Harness {
    pub storage: MemoryStorage,
    pub broker: MemoryBroker,
    pub metrics: SyncMetrics,
    pub warden: Warden,
}

/// Fast timings for tests; override fields per scenario.
pub fn settings() -> CoreSettings {
    CoreSettings {
        sync_age_limit: Duration::from_millis(1),
        completion_timeout: Duration::from_secs(5),
        retry: RetryPolicy::new(Duration::from_millis(5), Duration::from_millis(200)),
        ..CoreSettings::default()
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::build(settings(), |storage| Arc::new(storage))
    }

    /// Assemble over `wrap(storage)`; the harness keeps the bare memory tables.
    pub fn build(
        settings: CoreSettings,
        wrap: impl FnOnce(MemoryStorage) -> Arc<dyn Storage>,
    ) -> Self {
        let metrics = SyncMetrics::new(new_registry()).expect("metrics register");
        let storage = MemoryStorage::new();
        let broker = MemoryBroker::new(2)
            .with_retry_policy(settings.retry)
            .with_metrics(Some(metrics.clone()));
        let roles = StaticRoleDirectory::new().with_role("auditors", ["alice"]);
        let warden = Warden::assemble(
            wrap(storage.clone()),
            Arc::new(broker.clone()),
            Arc::new(roles),
            Some(metrics.clone()),
            settings,
        );
        Self {
            storage,
            broker,
            metrics,
            warden,
        }
    }

    pub fn service(&self) -> Arc<PermissionService> {
        self.warden.service()
    }

    pub fn registry(&self) -> Arc<TopicRegistry> {
        self.warden.registry()
    }

    pub async fn topic(&self, topic: Topic) {
        self.service()
            .set_topic(&root(), topic)
            .await
            .expect("topic stored");
    }

    pub async fn close(&self) {
        self.registry().close_all().await;
    }
}

pub fn root() -> Caller {
    Caller::admin(Principal::user("root"))
}

pub fn user(id: &str, groups: &[&str]) -> Caller {
    Caller::new(Principal::user(id).with_groups(groups.iter().copied()))
}

pub fn bits(text: &str) -> PermissionBits {
    text.parse().expect("valid bits")
}

pub fn owner(user: &str) -> ResourcePermissions {
    ResourcePermissions::new().with_user(user, bits("rwxa"))
}

/// Poll `check` until it yields true or five seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
