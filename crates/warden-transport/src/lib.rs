//! ---
//! warden_section: "02-messaging-transport"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Change-command codec, transport contract and consumers."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
//! Per-topic CQRS transport: a producer publishing change commands keyed by
//! resource id and an optional background consumer applying them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use warden_model::{AuthzError, Command, Topic};

pub mod codec;
pub mod consumer;
pub mod memory;

/// Shared result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Failures of the transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("publish to '{channel}' failed: {reason}")]
    Publish { channel: String, reason: String },
    #[error("transport for '{0}' is closed")]
    Closed(String),
    #[error("handler rejected command: {0}")]
    Handler(#[source] AuthzError),
    #[error("retry budget of {budget:?} exhausted after {attempts} attempts: {last}")]
    BudgetExhausted {
        attempts: u32,
        budget: Duration,
        last: AuthzError,
    },
}

impl From<TransportError> for AuthzError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Handler(inner) => inner,
            TransportError::BudgetExhausted { .. } => AuthzError::Fatal(err.to_string()),
            other => AuthzError::Transient(other.to_string()),
        }
    }
}

/// Applies one change command to local state.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command) -> std::result::Result<(), AuthzError>;
}

/// Open transport of one topic.
#[async_trait]
pub trait TopicTransport: Send + Sync {
    /// Publish `command` keyed by its resource id.
    async fn publish(&self, command: &Command) -> Result<()>;

    /// Whether the background consumer stopped on an unrecoverable error.
    fn consumer_failed(&self) -> bool;

    /// Stop the consumer, wait for it to drain and release the producer.
    async fn close(&mut self);
}

/// Opens per-topic transports.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Open a producer for `topic` and, when `handler` is given, a consumer
    /// feeding every received command to it.
    async fn open_for_topic(
        &self,
        topic: &Topic,
        handler: Option<Arc<dyn CommandHandler>>,
    ) -> Result<Box<dyn TopicTransport>>;

    /// Provision the underlying channel. Idempotent.
    async fn ensure_topic(&self, channel: &str, partitions: u32) -> Result<()>;
}

pub use codec::{decode_command, encode_command, Record};
pub use consumer::{spawn_consumer, ConsumerExit, ConsumerHandle, RecordStream, RetryPolicy};
pub use memory::MemoryBroker;
