//! ---
//! warden_section: "02-messaging-transport"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Change-command codec, transport contract and consumers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Partitioned in-process broker, primarily for tests and single-node runs.
//!
//! Channels hold append-only partitions; every consumer group keeps its own
//! committed offset per partition, so a reopened consumer resumes after the
//! last committed record.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use warden_metrics::SyncMetrics;
use warden_model::{Command, Topic};

use crate::codec::{encode_command, Record};
use crate::consumer::{spawn_consumer, ConsumerHandle, RecordStream, RetryPolicy};
use crate::{CommandHandler, Result, TopicTransport, TransportError, TransportProvider};

/// Stable partition for a key (FNV-1a).
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % partitions.max(1) as u64) as usize
}

#[derive(Debug)]
struct Channel {
    name: String,
    partitions: Vec<Mutex<Vec<Record>>>,
    committed: Mutex<HashMap<(String, usize), u64>>,
    arrived: Notify,
    drop_next: AtomicUsize,
}

impl Channel {
    fn new(name: &str, partitions: u32) -> Self {
        Self {
            name: name.to_owned(),
            partitions: (0..partitions.max(1)).map(|_| Mutex::new(Vec::new())).collect(),
            committed: Mutex::new(HashMap::new()),
            arrived: Notify::new(),
            drop_next: AtomicUsize::new(0),
        }
    }

    fn append(&self, key: &str, payload: Vec<u8>) -> Option<Record> {
        let dropped = self
            .drop_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if dropped {
            warn!(channel = %self.name, key, "dropping published record");
            return None;
        }
        let partition = partition_for(key, self.partitions.len());
        let record = {
            let mut log = self.partitions[partition].lock();
            let record = Record {
                key: key.to_owned(),
                payload,
                partition,
                offset: log.len() as u64,
            };
            log.push(record.clone());
            record
        };
        self.arrived.notify_waiters();
        Some(record)
    }

    fn committed_positions(&self, group: &str) -> Vec<u64> {
        let committed = self.committed.lock();
        (0..self.partitions.len())
            .map(|partition| {
                committed
                    .get(&(group.to_owned(), partition))
                    .copied()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// First unread record across partitions, advancing `positions`.
    fn poll(&self, positions: &mut [u64]) -> Option<Record> {
        for (partition, position) in positions.iter_mut().enumerate() {
            let log = self.partitions[partition].lock();
            if let Some(record) = log.get(*position as usize) {
                *position += 1;
                return Some(record.clone());
            }
        }
        None
    }
}

/// In-memory [`TransportProvider`].
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    channels: Arc<Mutex<HashMap<String, Arc<Channel>>>>,
    default_partitions: u32,
    retry: RetryPolicy,
    metrics: Option<SyncMetrics>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(1)
    }
}

impl MemoryBroker {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            default_partitions: default_partitions.max(1),
            retry: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_metrics(mut self, metrics: Option<SyncMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    fn channel(&self, name: &str, partitions: u32) -> Arc<Channel> {
        self.channels
            .lock()
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(Channel::new(name, partitions)))
            .clone()
    }

    /// Silently discard the next `count` records published to `channel`.
    pub fn drop_next_publishes(&self, channel: &str, count: usize) {
        self.channel(channel, self.default_partitions)
            .drop_next
            .store(count, Ordering::SeqCst);
    }

    pub fn channel_exists(&self, channel: &str) -> bool {
        self.channels.lock().contains_key(channel)
    }

    pub fn partition_count(&self, channel: &str) -> Option<usize> {
        self.channels
            .lock()
            .get(channel)
            .map(|channel| channel.partitions.len())
    }

    /// Records appended to `channel` across all partitions.
    pub fn record_count(&self, channel: &str) -> usize {
        self.channels.lock().get(channel).map_or(0, |channel| {
            channel.partitions.iter().map(|log| log.lock().len()).sum()
        })
    }

    /// Records `group` has committed on `channel` across all partitions.
    pub fn committed_count(&self, channel: &str, group: &str) -> u64 {
        self.channels.lock().get(channel).map_or(0, |channel| {
            channel.committed_positions(group).iter().sum()
        })
    }
}

#[async_trait]
impl TransportProvider for MemoryBroker {
    async fn open_for_topic(
        &self,
        topic: &Topic,
        handler: Option<Arc<dyn CommandHandler>>,
    ) -> Result<Box<dyn TopicTransport>> {
        let partitions = topic.partition_count.unwrap_or(self.default_partitions);
        let channel = self.channel(&topic.event_topic_name, partitions);
        let consumer = handler.map(|handler| {
            let stream = MemoryStream {
                positions: channel.committed_positions(&topic.consumer_group),
                channel: channel.clone(),
                group: topic.consumer_group.clone(),
            };
            spawn_consumer(
                topic.id.clone(),
                stream,
                handler,
                self.retry,
                self.metrics.clone(),
            )
        });
        info!(
            topic = %topic.id,
            channel = %channel.name,
            group = %topic.consumer_group,
            consumer = consumer.is_some(),
            "memory transport opened"
        );
        Ok(Box::new(MemoryTransport {
            topic: topic.id.clone(),
            channel: Some(channel),
            consumer,
        }))
    }

    async fn ensure_topic(&self, channel: &str, partitions: u32) -> Result<()> {
        let created = self.channel(channel, partitions);
        debug!(
            channel,
            partitions = created.partitions.len(),
            "channel provisioned"
        );
        Ok(())
    }
}

struct MemoryTransport {
    topic: String,
    channel: Option<Arc<Channel>>,
    consumer: Option<ConsumerHandle>,
}

#[async_trait]
impl TopicTransport for MemoryTransport {
    async fn publish(&self, command: &Command) -> Result<()> {
        let channel = self
            .channel
            .as_ref()
            .ok_or_else(|| TransportError::Closed(self.topic.clone()))?;
        let payload = encode_command(command)?;
        if let Some(record) = channel.append(&command.resource_id, payload) {
            debug!(
                topic = %self.topic,
                resource = %record.key,
                partition = record.partition,
                offset = record.offset,
                kind = %command.kind,
                "command published"
            );
        }
        Ok(())
    }

    fn consumer_failed(&self) -> bool {
        self.consumer
            .as_ref()
            .is_some_and(|consumer| consumer.has_failed())
    }

    async fn close(&mut self) {
        if let Some(mut consumer) = self.consumer.take() {
            consumer.stop().await;
        }
        self.channel = None;
        info!(topic = %self.topic, "memory transport closed");
    }
}

struct MemoryStream {
    channel: Arc<Channel>,
    group: String,
    positions: Vec<u64>,
}

#[async_trait]
impl RecordStream for MemoryStream {
    async fn next(&mut self) -> Option<Record> {
        loop {
            let notified = self.channel.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(record) = self.channel.poll(&mut self.positions) {
                return Some(record);
            }
            notified.await;
        }
    }

    async fn commit(&mut self, record: &Record) -> Result<()> {
        let mut committed = self.channel.committed.lock();
        let slot = committed
            .entry((self.group.clone(), record.partition))
            .or_insert(0);
        *slot = (*slot).max(record.offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_stable_and_bounded() {
        for key in ["dev-1", "dev-2", "", "a-much-longer-resource-identifier"] {
            let first = partition_for(key, 7);
            assert!(first < 7);
            assert_eq!(first, partition_for(key, 7));
        }
        assert_eq!(partition_for("dev-1", 0), 0);
    }

    #[tokio::test]
    async fn publishing_creates_channel_and_honours_drops() {
        let broker = MemoryBroker::new(3);
        let topic = Topic::new("devices").with_defaults("warden");
        let transport = broker.open_for_topic(&topic, None).await.unwrap();
        assert_eq!(broker.partition_count("devices"), Some(3));

        broker.drop_next_publishes("devices", 1);
        transport.publish(&Command::delete("dev-1", 1)).await.unwrap();
        transport.publish(&Command::delete("dev-1", 2)).await.unwrap();
        assert_eq!(broker.record_count("devices"), 1);
        assert!(!transport.consumer_failed());
    }

    #[tokio::test]
    async fn closed_transport_refuses_publish() {
        let broker = MemoryBroker::default();
        let topic = Topic::new("devices").with_defaults("warden");
        let mut transport = broker.open_for_topic(&topic, None).await.unwrap();
        transport.close().await;
        assert!(matches!(
            transport.publish(&Command::delete("dev-1", 1)).await,
            Err(TransportError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn ensure_topic_keeps_existing_layout() {
        let broker = MemoryBroker::new(1);
        broker.ensure_topic("devices", 4).await.unwrap();
        broker.ensure_topic("devices", 8).await.unwrap();
        assert_eq!(broker.partition_count("devices"), Some(4));
    }
}
