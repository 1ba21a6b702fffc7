//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
mod common;

use std::time::Duration;

use common::{eventually, owner, root, Harness};
use warden_model::{Command, Topic};
use warden_storage::Storage;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn older_commands_do_not_overwrite_newer_state() {
    let harness = Harness::new();
    harness.topic(Topic::new("devices")).await;
    let registry = harness.registry();

    registry
        .commit("devices", Command::rights("dev-1", owner("u100"), 100))
        .await
        .unwrap();
    registry
        .commit("devices", Command::rights("dev-1", owner("u50"), 50))
        .await
        .unwrap();

    let metrics = harness.metrics.clone();
    assert!(eventually(|| {
        let metrics = metrics.clone();
        async move { metrics.applied("devices", "RIGHTS") == 2 }
    })
    .await);
    let stored = harness.storage.get_resource("devices", "dev-1").await.unwrap();
    assert_eq!(stored.last_write_timestamp, 100);
    assert!(stored.permissions.users.contains_key("u100"));
    assert!(stored.synced);
    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_republishes_lost_writes() {
    let harness = Harness::new();
    harness.topic(Topic::new("devices")).await;
    harness.broker.drop_next_publishes("devices", 1);

    let outcome = harness
        .service()
        .set_permission(&root(), "devices", "dev-5", owner("u1"), false)
        .await
        .unwrap();
    let stored = harness.storage.get_resource("devices", "dev-5").await.unwrap();
    assert!(!stored.synced);
    assert_eq!(harness.broker.record_count("devices"), 0);

    tokio::time::sleep(Duration::from_millis(20)).await;
    let republished = harness.warden.watchdog().run_once().await.unwrap();
    assert_eq!(republished, 1);
    assert_eq!(harness.metrics.republished("devices"), 1);

    let storage = harness.storage.clone();
    assert!(eventually(|| {
        let storage = storage.clone();
        async move {
            storage
                .get_resource("devices", "dev-5")
                .await
                .is_ok_and(|resource| resource.synced)
        }
    })
    .await);
    let stored = harness.storage.get_resource("devices", "dev-5").await.unwrap();
    assert_eq!(stored.last_write_timestamp, outcome.timestamp);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(harness.warden.watchdog().run_once().await.unwrap(), 0);
    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watchdog_skips_inactive_topics() {
    let harness = Harness::new();
    // Stored directly, so the registry never opens it.
    harness.storage.set_topic(Topic::new("retired")).await.unwrap();
    let mut stale = warden_model::Resource::new("retired", "r-1", owner("u1"));
    stale.last_write_timestamp = 1;
    harness.storage.set_resource(stale, 1, false).await.unwrap();

    assert_eq!(harness.warden.watchdog().run_once().await.unwrap(), 0);
    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn transient_apply_failures_are_retried() {
    let harness = Harness::new();
    harness.topic(Topic::new("devices")).await;
    harness.storage.inject_write_failures(2);

    harness
        .registry()
        .commit("devices", Command::rights("dev-1", owner("u1"), 10))
        .await
        .unwrap();
    let storage = harness.storage.clone();
    assert!(eventually(|| {
        let storage = storage.clone();
        async move { storage.get_resource("devices", "dev-1").await.is_ok() }
    })
    .await);
    assert!(harness.registry().consumer_running("devices").await);
    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_consumer_is_reopened_and_replays() {
    let harness = Harness::new();
    harness.topic(Topic::new("devices")).await;
    let registry = harness.registry();
    harness.storage.inject_write_failures(10_000);

    registry
        .commit("devices", Command::rights("dev-9", owner("u1"), 10))
        .await
        .unwrap();
    let watched = registry.clone();
    assert!(eventually(|| {
        let watched = watched.clone();
        async move { !watched.consumer_running("devices").await }
    })
    .await);
    assert!(harness.storage.get_resource("devices", "dev-9").await.is_err());

    harness.storage.inject_write_failures(0);
    let summary = registry.refresh_topics().await.unwrap();
    assert_eq!(summary.opened, ["devices"]);
    assert_eq!(summary.closed, ["devices"]);

    let storage = harness.storage.clone();
    assert!(eventually(|| {
        let storage = storage.clone();
        async move {
            storage
                .get_resource("devices", "dev-9")
                .await
                .is_ok_and(|resource| resource.synced)
        }
    })
    .await);
    assert!(registry.consumer_running("devices").await);
    harness.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reconfigured_topic_gets_a_new_transport() {
    let harness = Harness::new();
    harness.topic(Topic::new("devices")).await;
    assert!(harness.broker.channel_exists("devices"));

    harness
        .topic(Topic {
            event_topic_name: "devices-v2".to_string(),
            ..Topic::new("devices")
        })
        .await;
    assert!(harness.broker.channel_exists("devices-v2"));
    assert_eq!(harness.registry().active_topic_ids().await, ["devices"]);

    harness
        .service()
        .set_permission(&root(), "devices", "dev-1", owner("u1"), true)
        .await
        .unwrap();
    assert_eq!(harness.broker.record_count("devices-v2"), 1);
    assert_eq!(harness.broker.record_count("devices"), 0);
    harness.close().await;
}
