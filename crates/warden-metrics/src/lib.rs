//! ---
//! warden_section: "05-observability"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Metrics collection and export utilities."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Prometheus instrumentation of the sync engine and its scrape endpoint.

use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

mod exporter;

pub use exporter::{serve_metrics, MetricsServer};

const NAMESPACE: &str = "warden";

pub type SharedRegistry = Arc<Registry>;

pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

fn counter(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry
        .register(Box::new(counter.clone()))
        .with_context(|| format!("registering {NAMESPACE}_{name}"))?;
    Ok(counter)
}

/// Counters and gauges of the CQRS sync engine, labelled by topic id.
///
/// Cloning shares the underlying collectors.
#[derive(Clone, Debug)]
pub struct SyncMetrics {
    published: IntCounterVec,
    applied: IntCounterVec,
    ignored: IntCounterVec,
    retries: IntCounterVec,
    consumer_failures: IntCounterVec,
    republished: IntCounterVec,
    active_topics: IntGauge,
}

impl SyncMetrics {
    /// Register every collector on `registry`; fails if already registered there.
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let registry = registry.as_ref();
        let active_topics = IntGauge::with_opts(
            Opts::new("active_topics", "Topics with an open transport").namespace(NAMESPACE),
        )?;
        registry
            .register(Box::new(active_topics.clone()))
            .context("registering warden_active_topics")?;

        Ok(Self {
            published: counter(
                registry,
                "commands_published_total",
                "Change commands handed to a topic transport",
                &["topic", "kind"],
            )?,
            applied: counter(
                registry,
                "commands_applied_total",
                "Change commands applied to storage by a consumer",
                &["topic", "kind"],
            )?,
            ignored: counter(
                registry,
                "commands_ignored_total",
                "Commands skipped because storage held an equal or newer write",
                &["topic"],
            )?,
            retries: counter(
                registry,
                "apply_retries_total",
                "Apply attempts repeated after a transient failure",
                &["topic"],
            )?,
            consumer_failures: counter(
                registry,
                "consumer_failures_total",
                "Consumers stopped after exhausting their retry budget",
                &["topic"],
            )?,
            republished: counter(
                registry,
                "watchdog_republished_total",
                "Unsynced resources republished by the sync watchdog",
                &["topic"],
            )?,
            active_topics,
        })
    }

    pub fn record_published(&self, topic: &str, kind: &str) {
        self.published.with_label_values(&[topic, kind]).inc();
    }

    pub fn record_applied(&self, topic: &str, kind: &str) {
        self.applied.with_label_values(&[topic, kind]).inc();
    }

    pub fn record_ignored(&self, topic: &str) {
        self.ignored.with_label_values(&[topic]).inc();
    }

    pub fn record_retry(&self, topic: &str) {
        self.retries.with_label_values(&[topic]).inc();
    }

    pub fn record_consumer_failure(&self, topic: &str) {
        self.consumer_failures.with_label_values(&[topic]).inc();
    }

    pub fn record_republished(&self, topic: &str) {
        self.republished.with_label_values(&[topic]).inc();
    }

    pub fn set_active_topics(&self, count: usize) {
        self.active_topics.set(i64::try_from(count).unwrap_or(i64::MAX));
    }

    pub fn applied(&self, topic: &str, kind: &str) -> u64 {
        self.applied.with_label_values(&[topic, kind]).get()
    }

    pub fn republished(&self, topic: &str) -> u64 {
        self.republished.with_label_values(&[topic]).get()
    }
}
