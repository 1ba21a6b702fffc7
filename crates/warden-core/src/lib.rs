//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Core runtime of the Warden authorization service.

use std::future::Future;
use std::time::Duration;

use warden_common::AppConfig;
use warden_model::{AuthzError, Result};
use warden_transport::RetryPolicy;

pub mod applier;
pub mod authorizer;
pub mod identity;
pub mod notifier;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod watchdog;

pub use applier::TopicCommandHandler;
pub use authorizer::WriteAuthorizer;
pub use identity::{HttpRoleDirectory, RoleDirectory, StaticRoleDirectory};
pub use notifier::{CompletionKey, CompletionNotifier, CompletionWaiter};
pub use registry::{RefreshSummary, TopicRegistry};
pub use runtime::{topic_from_seed, RuntimeHandle, Warden};
pub use service::{ComputedPermissions, PermissionService, WriteOutcome};
pub use watchdog::SyncWatchdog;

/// Tunables shared by the registry, the service and the background tasks.
#[derive(Debug, Clone)]
pub struct CoreSettings {
    pub default_consumer_group: String,
    pub default_partitions: u32,
    pub storage_timeout: Duration,
    pub publish_timeout: Duration,
    pub identity_timeout: Duration,
    pub completion_timeout: Duration,
    pub sync_age_limit: Duration,
    pub topic_refresh_interval: Duration,
    pub sync_check_interval: Duration,
    pub retry: RetryPolicy,
}

impl CoreSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_consumer_group: config.transport.default_consumer_group.clone(),
            default_partitions: config.transport.default_partitions,
            storage_timeout: config.timeouts.storage,
            publish_timeout: config.timeouts.publish,
            identity_timeout: config.timeouts.identity,
            completion_timeout: config.sync.completion_timeout,
            sync_age_limit: config.sync.sync_age_limit,
            topic_refresh_interval: config.sync.topic_refresh_interval,
            sync_check_interval: config.sync.sync_check_interval,
            retry: RetryPolicy::new(config.sync.retry_step, config.sync.retry_budget),
        }
    }
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Run `call` with a deadline; an elapsed deadline is a transient failure.
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(AuthzError::transient(format!(
            "{what} timed out after {}ms",
            limit.as_millis()
        ))),
    }
}
