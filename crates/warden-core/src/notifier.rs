//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Topic lifecycle, CQRS apply loop and write-path authorization."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::debug;
use warden_model::CommandKind;

/// What a completion wait is waiting for.
///
/// The command timestamp is part of the key: applying another write to the
/// same resource never resolves a wait for this one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompletionKey {
    pub topic_id: String,
    pub resource_id: String,
    pub kind: CommandKind,
    pub timestamp: i64,
}

impl CompletionKey {
    pub fn new(
        topic_id: impl Into<String>,
        resource_id: impl Into<String>,
        kind: CommandKind,
        timestamp: i64,
    ) -> Self {
        Self {
            topic_id: topic_id.into(),
            resource_id: resource_id.into(),
            kind,
            timestamp,
        }
    }
}

type Waiters = HashMap<CompletionKey, Vec<(u64, oneshot::Sender<()>)>>;

/// Side channel between the write path and the consumer-side apply.
#[derive(Debug, Clone, Default)]
pub struct CompletionNotifier {
    waiters: Arc<Mutex<Waiters>>,
    next_id: Arc<AtomicU64>,
}

impl CompletionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest before publishing so an early signal is not missed.
    pub fn register(&self, key: CompletionKey) -> CompletionWaiter {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().entry(key.clone()).or_default().push((id, tx));
        CompletionWaiter {
            key,
            id,
            rx: Some(rx),
            notifier: self.clone(),
        }
    }

    /// Resolve every waiter registered for `key`; returns how many were woken.
    pub fn signal(&self, key: &CompletionKey) -> usize {
        let Some(waiters) = self.waiters.lock().remove(key) else {
            return 0;
        };
        let mut woken = 0;
        for (_, tx) in waiters {
            if tx.send(()).is_ok() {
                woken += 1;
            }
        }
        debug!(
            topic = %key.topic_id,
            resource = %key.resource_id,
            kind = %key.kind,
            timestamp = key.timestamp,
            woken,
            "completion signalled"
        );
        woken
    }

    pub fn pending(&self) -> usize {
        self.waiters.lock().values().map(Vec::len).sum()
    }

    fn forget(&self, key: &CompletionKey, id: u64) {
        let mut waiters = self.waiters.lock();
        if let Some(list) = waiters.get_mut(key) {
            list.retain(|(waiter, _)| *waiter != id);
            if list.is_empty() {
                waiters.remove(key);
            }
        }
    }
}

/// One registered completion wait. Dropping it deregisters the waiter.
#[derive(Debug)]
pub struct CompletionWaiter {
    key: CompletionKey,
    id: u64,
    rx: Option<oneshot::Receiver<()>>,
    notifier: CompletionNotifier,
}

impl CompletionWaiter {
    pub fn key(&self) -> &CompletionKey {
        &self.key
    }

    /// `true` if the signal arrived before `timeout` elapsed.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        let Some(rx) = self.rx.take() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }
}

impl Drop for CompletionWaiter {
    fn drop(&mut self) {
        self.notifier.forget(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(resource: &str) -> CompletionKey {
        CompletionKey::new("devices", resource, CommandKind::Rights, 7)
    }

    #[tokio::test]
    async fn signal_before_wait_is_not_lost() {
        let notifier = CompletionNotifier::new();
        let waiter = notifier.register(key("dev-1"));
        assert_eq!(notifier.signal(&key("dev-1")), 1);
        assert!(waiter.wait(Duration::from_millis(10)).await);
        assert_eq!(notifier.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unmatched_wait_times_out_and_deregisters() {
        let notifier = CompletionNotifier::new();
        let waiter = notifier.register(key("dev-1"));
        let other = notifier.register(CompletionKey::new("devices", "dev-1", CommandKind::Delete, 7));
        assert_eq!(notifier.signal(&key("dev-2")), 0);
        assert!(!waiter.wait(Duration::from_secs(5)).await);
        assert_eq!(notifier.pending(), 1);
        drop(other);
        assert_eq!(notifier.pending(), 0);
    }

    #[tokio::test]
    async fn one_signal_wakes_all_waiters_of_a_key() {
        let notifier = CompletionNotifier::new();
        let first = notifier.register(key("dev-1"));
        let second = notifier.register(key("dev-1"));
        assert_eq!(notifier.signal(&key("dev-1")), 2);
        assert!(first.wait(Duration::from_millis(10)).await);
        assert!(second.wait(Duration::from_millis(10)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn apply_of_another_write_does_not_resolve_wait() {
        let notifier = CompletionNotifier::new();
        let waiter = notifier.register(key("dev-1"));
        let stale = CompletionKey::new("devices", "dev-1", CommandKind::Rights, 3);
        assert_eq!(notifier.signal(&stale), 0);
        assert_eq!(notifier.pending(), 1);
        assert!(!waiter.wait(Duration::from_secs(1)).await);
    }
}
