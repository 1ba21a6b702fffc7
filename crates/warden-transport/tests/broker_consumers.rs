//! ---
//! warden_section: "02-messaging-transport"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Change-command codec, transport contract and consumers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use warden_model::{AuthzError, Command, Topic};
use warden_transport::{CommandHandler, MemoryBroker, RetryPolicy, TransportProvider};

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, i64)>>,
    broken: AtomicBool,
}

#[async_trait]
impl CommandHandler for Recorder {
    async fn handle(&self, command: Command) -> Result<(), AuthzError> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(AuthzError::transient("storage unavailable"));
        }
        self.seen.lock().push((command.resource_id, command.timestamp));
        Ok(())
    }
}

impl Recorder {
    fn seen(&self) -> Vec<(String, i64)> {
        self.seen.lock().clone()
    }
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 4s");
}

fn topic() -> Topic {
    Topic {
        partition_count: Some(4),
        ..Topic::new("devices")
    }
    .with_defaults("warden")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_key_order_is_preserved_across_partitions() {
    let broker = MemoryBroker::new(1);
    let recorder = Arc::new(Recorder::default());
    let mut transport = broker
        .open_for_topic(&topic(), Some(recorder.clone()))
        .await
        .unwrap();

    for timestamp in 1..=20 {
        let id = format!("dev-{}", timestamp % 5);
        transport
            .publish(&Command::delete(id, timestamp))
            .await
            .unwrap();
    }
    eventually(|| recorder.seen().len() == 20).await;

    for key in 0..5 {
        let id = format!("dev-{key}");
        let stamps: Vec<i64> = recorder
            .seen()
            .into_iter()
            .filter(|(seen, _)| *seen == id)
            .map(|(_, ts)| ts)
            .collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted, "{id} delivered out of order");
    }
    transport.close().await;
    assert_eq!(broker.committed_count("devices", "warden"), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reopened_consumer_resumes_after_committed_offset() {
    let broker = MemoryBroker::new(1);
    let first = Arc::new(Recorder::default());
    let mut transport = broker
        .open_for_topic(&topic(), Some(first.clone()))
        .await
        .unwrap();
    transport.publish(&Command::delete("dev-1", 1)).await.unwrap();
    eventually(|| first.seen().len() == 1).await;
    transport.close().await;

    let second = Arc::new(Recorder::default());
    let mut transport = broker
        .open_for_topic(&topic(), Some(second.clone()))
        .await
        .unwrap();
    transport.publish(&Command::delete("dev-2", 2)).await.unwrap();
    eventually(|| second.seen().len() == 1).await;
    assert_eq!(second.seen(), [("dev-2".to_string(), 2)]);
    transport.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_consumer_replays_uncommitted_record_on_reopen() {
    let broker = MemoryBroker::new(1).with_retry_policy(RetryPolicy::new(
        Duration::from_millis(10),
        Duration::from_millis(50),
    ));
    let broken = Arc::new(Recorder::default());
    broken.broken.store(true, Ordering::SeqCst);
    let mut transport = broker
        .open_for_topic(&topic(), Some(broken.clone()))
        .await
        .unwrap();
    transport.publish(&Command::delete("dev-1", 7)).await.unwrap();
    eventually(|| transport.consumer_failed()).await;
    transport.close().await;
    assert_eq!(broker.committed_count("devices", "warden"), 0);

    let healthy = Arc::new(Recorder::default());
    let mut transport = broker
        .open_for_topic(&topic(), Some(healthy.clone()))
        .await
        .unwrap();
    eventually(|| healthy.seen().len() == 1).await;
    assert_eq!(healthy.seen(), [("dev-1".to_string(), 7)]);
    transport.close().await;
}
