//! ---
//! warden_section: "02-messaging-transport"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Change-command codec, transport contract and consumers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Consumer driver shared by every transport backend.
//!
//! Records are pulled one at a time, decoded and handed to the topic's
//! [`CommandHandler`]. A record is committed only after the handler
//! succeeded or rejected it as invalid; transient failures are retried with
//! linear backoff until the retry budget runs out, at which point the
//! consumer stops without committing so the record is replayed on reopen.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use warden_metrics::SyncMetrics;
use warden_model::{AuthzError, Command};

use crate::codec::{decode_command, Record};
use crate::{CommandHandler, Result, TransportError};

/// Source of records for one consumer group on one channel.
#[async_trait]
pub trait RecordStream: Send + 'static {
    /// Next record in delivery order; `None` once the channel is gone.
    /// Must be cancel-safe: dropping the future loses no record.
    async fn next(&mut self) -> Option<Record>;

    /// Mark `record` and everything before it in its partition as consumed.
    async fn commit(&mut self, record: &Record) -> Result<()>;
}

/// Linear backoff: attempt `n` waits `n * step`, bounded by `budget` overall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub step: Duration,
    pub budget: Duration,
}

impl RetryPolicy {
    pub const fn new(step: Duration, budget: Duration) -> Self {
        Self { step, budget }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(600))
    }
}

/// Why a consumer loop ended.
#[derive(Debug)]
pub enum ConsumerExit {
    Stopped,
    /// The underlying channel went away.
    Closed,
    Fatal(TransportError),
}

/// Start/stop handle of a background consumer task.
#[derive(Debug)]
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<ConsumerExit>>,
    failed: Arc<AtomicBool>,
}

impl ConsumerHandle {
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    /// Signal the loop and wait for it to finish. The in-flight record, if
    /// any, is abandoned uncommitted.
    pub async fn stop(&mut self) -> Option<ConsumerExit> {
        let _ = self.stop.send(true);
        let task = self.task.take()?;
        match task.await {
            Ok(exit) => Some(exit),
            Err(err) => {
                error!(error = %err, "consumer task panicked");
                None
            }
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        let _ = self.stop.send(true);
    }
}

/// Spawn a consumer loop for `topic` on the current runtime.
pub fn spawn_consumer<S: RecordStream>(
    topic: impl Into<String>,
    stream: S,
    handler: Arc<dyn CommandHandler>,
    policy: RetryPolicy,
    metrics: Option<SyncMetrics>,
) -> ConsumerHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let failed = Arc::new(AtomicBool::new(false));
    let consumer = Consumer {
        topic: topic.into(),
        handler,
        policy,
        metrics,
        stop: stop_rx,
        failed: failed.clone(),
    };
    let task = tokio::spawn(consumer.run(stream));
    ConsumerHandle {
        stop: stop_tx,
        task: Some(task),
        failed,
    }
}

enum Outcome {
    Applied,
    Rejected(AuthzError),
    Cancelled,
    Failed(TransportError),
}

struct Consumer {
    topic: String,
    handler: Arc<dyn CommandHandler>,
    policy: RetryPolicy,
    metrics: Option<SyncMetrics>,
    stop: watch::Receiver<bool>,
    failed: Arc<AtomicBool>,
}

impl Consumer {
    async fn run<S: RecordStream>(mut self, mut stream: S) -> ConsumerExit {
        info!(topic = %self.topic, "consumer started");
        let exit = self.consume(&mut stream).await;
        match &exit {
            ConsumerExit::Fatal(err) => {
                self.failed.store(true, Ordering::SeqCst);
                if let Some(metrics) = &self.metrics {
                    metrics.record_consumer_failure(&self.topic);
                }
                error!(topic = %self.topic, error = %err, "consumer stopped on fatal error");
            }
            ConsumerExit::Closed => warn!(topic = %self.topic, "consumer channel closed"),
            ConsumerExit::Stopped => info!(topic = %self.topic, "consumer stopped"),
        }
        exit
    }

    async fn consume<S: RecordStream>(&mut self, stream: &mut S) -> ConsumerExit {
        loop {
            let record = tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return ConsumerExit::Stopped,
                next = stream.next() => match next {
                    Some(record) => record,
                    None => return ConsumerExit::Closed,
                },
            };

            match decode_command(&record.payload) {
                Ok(command) => match self.apply(command).await {
                    Outcome::Applied => {}
                    Outcome::Rejected(err) => warn!(
                        topic = %self.topic,
                        resource = %record.key,
                        error = %err,
                        "command rejected; skipping"
                    ),
                    Outcome::Cancelled => return ConsumerExit::Stopped,
                    Outcome::Failed(err) => return ConsumerExit::Fatal(err),
                },
                Err(err) => warn!(
                    topic = %self.topic,
                    resource = %record.key,
                    offset = record.offset,
                    error = %err,
                    "undecodable record; skipping"
                ),
            }

            if let Err(err) = stream.commit(&record).await {
                return ConsumerExit::Fatal(err);
            }
        }
    }

    async fn apply(&mut self, command: Command) -> Outcome {
        let started = Instant::now();
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match self.handler.handle(command.clone()).await {
                Ok(()) => {
                    debug!(
                        topic = %self.topic,
                        resource = %command.resource_id,
                        kind = %command.kind,
                        attempt,
                        "command applied"
                    );
                    return Outcome::Applied;
                }
                Err(err @ AuthzError::Fatal(_)) => {
                    return Outcome::Failed(TransportError::Handler(err));
                }
                Err(err) if !err.is_retryable() => return Outcome::Rejected(err),
                Err(err) => err,
            };

            let delay = self.policy.delay(attempt);
            if started.elapsed() + delay > self.policy.budget {
                return Outcome::Failed(TransportError::BudgetExhausted {
                    attempts: attempt,
                    budget: self.policy.budget,
                    last: err,
                });
            }
            warn!(
                topic = %self.topic,
                resource = %command.resource_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "apply failed; retrying"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_retry(&self.topic);
            }
            tokio::select! {
                biased;
                _ = stopped(&mut self.stop) => return Outcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

/// Resolves once the stop flag is raised or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        if *stop.borrow_and_update() {
            return;
        }
        if stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;
    use crate::codec::encode_command;

    #[derive(Clone, Default)]
    struct Script {
        pending: Arc<Mutex<VecDeque<Record>>>,
        committed: Arc<Mutex<Vec<u64>>>,
        arrived: Arc<Notify>,
    }

    impl Script {
        fn push(&self, command: &Command) {
            let mut pending = self.pending.lock();
            let offset = pending.len() as u64 + self.committed.lock().len() as u64;
            pending.push_back(Record {
                key: command.resource_id.clone(),
                payload: encode_command(command).unwrap(),
                partition: 0,
                offset,
            });
            self.arrived.notify_one();
        }

        fn push_raw(&self, payload: &[u8]) {
            self.pending.lock().push_back(Record {
                key: "raw".into(),
                payload: payload.to_vec(),
                partition: 0,
                offset: 99,
            });
            self.arrived.notify_one();
        }
    }

    #[async_trait]
    impl RecordStream for Script {
        async fn next(&mut self) -> Option<Record> {
            loop {
                let notified = self.arrived.notified();
                if let Some(record) = self.pending.lock().pop_front() {
                    return Some(record);
                }
                notified.await;
            }
        }

        async fn commit(&mut self, record: &Record) -> Result<()> {
            self.committed.lock().push(record.offset);
            Ok(())
        }
    }

    /// Fails the first `failures` calls with a transient error.
    struct Flaky {
        failures: AtomicUsize,
        calls: AtomicUsize,
        error: AuthzError,
    }

    impl Flaky {
        fn new(failures: usize, error: AuthzError) -> Arc<Self> {
            Arc::new(Self {
                failures: AtomicUsize::new(failures),
                calls: AtomicUsize::new(0),
                error,
            })
        }
    }

    #[async_trait]
    impl CommandHandler for Flaky {
        async fn handle(&self, _command: Command) -> std::result::Result<(), AuthzError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(())
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..20_000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_then_commits() {
        let script = Script::default();
        let handler = Flaky::new(3, AuthzError::transient("storage down"));
        let mut consumer = spawn_consumer(
            "devices",
            script.clone(),
            handler.clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(600)),
            None,
        );
        script.push(&Command::delete("dev-1", 1));
        let committed = script.committed.clone();
        wait_for(|| committed.lock().len() == 1).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        assert!(!consumer.has_failed());
        assert!(matches!(consumer.stop().await, Some(ConsumerExit::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_budget_is_fatal_and_uncommitted() {
        let script = Script::default();
        let handler = Flaky::new(usize::MAX, AuthzError::transient("storage down"));
        let mut consumer = spawn_consumer(
            "devices",
            script.clone(),
            handler.clone(),
            RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(10)),
            None,
        );
        script.push(&Command::delete("dev-1", 1));
        wait_for(|| consumer.has_failed()).await;
        assert!(script.committed.lock().is_empty());
        // 1 + 2 + 3 + 4 = 10 seconds of backoff fit the budget, the fifth delay does not.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 5);
        assert!(matches!(
            consumer.stop().await,
            Some(ConsumerExit::Fatal(TransportError::BudgetExhausted { attempts: 5, .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_and_undecodable_records_are_skipped() {
        let script = Script::default();
        let handler = Flaky::new(1, AuthzError::invalid("no admin"));
        let mut consumer = spawn_consumer(
            "devices",
            script.clone(),
            handler.clone(),
            RetryPolicy::default(),
            None,
        );
        script.push_raw(b"not json");
        script.push(&Command::delete("dev-1", 1));
        script.push(&Command::delete("dev-2", 2));
        let committed = script.committed.clone();
        wait_for(|| committed.lock().len() == 3).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        consumer.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_backoff() {
        let script = Script::default();
        let handler = Flaky::new(usize::MAX, AuthzError::transient("storage down"));
        let mut consumer = spawn_consumer(
            "devices",
            script.clone(),
            handler.clone(),
            RetryPolicy::new(Duration::from_secs(60), Duration::from_secs(3_600)),
            None,
        );
        script.push(&Command::delete("dev-1", 1));
        let calls = handler.clone();
        wait_for(|| calls.calls.load(Ordering::SeqCst) >= 1).await;
        let exit = tokio::time::timeout(Duration::from_secs(1), consumer.stop())
            .await
            .unwrap();
        assert!(matches!(exit, Some(ConsumerExit::Stopped)));
        assert!(script.committed.lock().is_empty());
    }
}
