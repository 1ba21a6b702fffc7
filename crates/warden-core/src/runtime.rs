//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Primary orchestration and lifecycle management."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use warden_common::{unix_nanos_now, AppConfig, SeedPermissions, TopicSeed};
use warden_metrics::SyncMetrics;
use warden_model::{AuthzError, PermissionBits, PermissionMap, ResourcePermissions, Topic};
use warden_storage::Storage;
use warden_transport::TransportProvider;

use crate::authorizer::WriteAuthorizer;
use crate::identity::RoleDirectory;
use crate::notifier::CompletionNotifier;
use crate::registry::TopicRegistry;
use crate::service::PermissionService;
use crate::watchdog::SyncWatchdog;
use crate::CoreSettings;

/// Fully wired service, not yet running.
pub struct Warden {
    storage: Arc<dyn Storage>,
    registry: Arc<TopicRegistry>,
    service: Arc<PermissionService>,
    watchdog: Arc<SyncWatchdog>,
    settings: CoreSettings,
}

impl Warden {
    pub fn assemble(
        storage: Arc<dyn Storage>,
        provider: Arc<dyn TransportProvider>,
        roles: Arc<dyn RoleDirectory>,
        metrics: Option<SyncMetrics>,
        settings: CoreSettings,
    ) -> Self {
        let notifier = CompletionNotifier::new();
        let registry = Arc::new(TopicRegistry::new(
            storage.clone(),
            provider,
            notifier.clone(),
            metrics.clone(),
            settings.clone(),
        ));
        let authorizer = WriteAuthorizer::new(roles, settings.identity_timeout);
        let service = Arc::new(PermissionService::new(
            storage.clone(),
            registry.clone(),
            authorizer,
            notifier,
            settings.clone(),
        ));
        let watchdog = Arc::new(SyncWatchdog::new(
            storage.clone(),
            registry.clone(),
            settings.sync_age_limit,
            settings.storage_timeout,
            metrics,
        ));
        Self {
            storage,
            registry,
            service,
            watchdog,
            settings,
        }
    }

    pub fn service(&self) -> Arc<PermissionService> {
        self.service.clone()
    }

    pub fn registry(&self) -> Arc<TopicRegistry> {
        self.registry.clone()
    }

    pub fn watchdog(&self) -> Arc<SyncWatchdog> {
        self.watchdog.clone()
    }

    /// Store every configured topic that storage does not know yet.
    pub async fn seed_topics(&self, config: &AppConfig) -> Result<usize> {
        let mut seeded = 0;
        for (id, seed) in &config.topics {
            match self.storage.get_topic(id).await {
                Ok(_) => {
                    debug!(topic = %id, "seed topic already stored");
                    continue;
                }
                Err(AuthzError::NotFound(_)) => {}
                Err(err) => return Err(err).with_context(|| format!("failed to look up topic {id}")),
            }
            let mut topic = topic_from_seed(id, seed)
                .with_context(|| format!("invalid seed for topic {id}"))?
                .with_defaults(&self.settings.default_consumer_group);
            topic.last_update_timestamp = unix_nanos_now();
            self.storage
                .set_topic(topic)
                .await
                .with_context(|| format!("failed to seed topic {id}"))?;
            info!(topic = %id, "topic seeded from configuration");
            seeded += 1;
        }
        Ok(seeded)
    }

    /// Reconcile once, then start the refresh and watchdog tickers.
    pub async fn start(self) -> Result<RuntimeHandle> {
        let summary = self
            .registry
            .refresh_topics()
            .await
            .context("initial topic reconciliation failed")?;
        info!(active = summary.active, "initial topics opened");

        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let refresh = {
            let registry = self.registry.clone();
            spawn_ticker(
                "topic-refresh",
                self.settings.topic_refresh_interval,
                shutdown_rx.resubscribe(),
                move || {
                    let registry = registry.clone();
                    async move {
                        if let Err(err) = registry.refresh_topics().await {
                            warn!(error = %err, "topic reconciliation failed");
                        }
                    }
                },
            )
        };
        let watchdog = {
            let watchdog = self.watchdog.clone();
            spawn_ticker(
                "sync-watchdog",
                self.settings.sync_check_interval,
                shutdown_rx,
                move || {
                    let watchdog = watchdog.clone();
                    async move {
                        match watchdog.run_once().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "sync watchdog republished resources"),
                            Err(err) => warn!(error = %err, "sync watchdog scan failed"),
                        }
                    }
                },
            )
        };

        info!("warden runtime started");
        Ok(RuntimeHandle {
            shutdown: shutdown_tx,
            tasks: vec![refresh, watchdog],
            registry: self.registry,
            service: self.service,
        })
    }
}

fn spawn_ticker<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; the caller already ran one pass.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(task = name, "ticker shutdown");
                    break;
                }
                _ = interval.tick() => tick().await,
            }
        }
    })
}

/// Running background tasks; shut down to drain consumers and stop tickers.
pub struct RuntimeHandle {
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    registry: Arc<TopicRegistry>,
    service: Arc<PermissionService>,
}

impl RuntimeHandle {
    pub fn service(&self) -> Arc<PermissionService> {
        self.service.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(());
        for joined in join_all(self.tasks).await {
            if let Err(err) = joined {
                error!(error = %err, "background task join error");
            }
        }
        self.registry.close_all().await;
        info!("warden runtime shutdown complete");
        Ok(())
    }
}

/// Topic described by a configuration seed.
pub fn topic_from_seed(id: &str, seed: &TopicSeed) -> warden_model::Result<Topic> {
    let topic = Topic {
        event_topic_name: seed.event_topic_name.clone().unwrap_or_default(),
        consumer_group: seed.consumer_group.clone().unwrap_or_default(),
        no_transport: seed.no_transport,
        ensure_transport_init: seed.ensure_transport_init,
        partition_count: seed.partition_count,
        disabled_consumer: seed.disabled_consumer,
        default_permissions: seed_permissions(&seed.default_permissions)?,
        ..Topic::new(id)
    };
    topic.validate()?;
    Ok(topic)
}

fn seed_permissions(seed: &SeedPermissions) -> warden_model::Result<ResourcePermissions> {
    fn parse<'a>(
        entries: impl IntoIterator<Item = (&'a String, &'a String)>,
    ) -> warden_model::Result<PermissionMap> {
        entries
            .into_iter()
            .map(|(key, bits)| Ok((key.clone(), bits.parse::<PermissionBits>()?)))
            .collect()
    }
    Ok(ResourcePermissions {
        users: parse(&seed.users)?,
        groups: parse(&seed.groups)?,
        roles: parse(&seed.roles)?,
    })
}
