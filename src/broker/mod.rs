//! Broker gateway: capability traits over the message broker.
//!
//! Three handle kinds per document topic:
//!
//! ```text
//! ┌──────────┐  send            ┌───────────────┐
//! │ Producer │ ───────────────► │               │
//! └──────────┘                  │  doc topic    │
//! ┌──────────┐  receive + ack   │ persistent:// │
//! │ Consumer │ ◄─────────────── │ tenant/ns/…   │
//! └──────────┘                  │               │
//! ┌──────────┐  read_next from  │               │
//! │ Reader   │ ◄─── checkpoint ─┤ (compacted)   │
//! └──────────┘                  └───────────────┘
//! ```
//!
//! `pulsar.rs` backs these with the Apache Pulsar client; `memory.rs` is the
//! in-process implementation the tests drive. Checkpoints are opaque bytes
//! minted and validated by the gateway that produced them.

pub mod memory;
pub mod pulsar;

pub use self::memory::MemoryBroker;
pub use self::pulsar::{PulsarBroker, PulsarConnector};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::frame::{self, FrameKind};

/// Broker failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("broker send failed: {0}")]
    Send(String),
    #[error("broker receive failed: {0}")]
    Receive(String),
    #[error("invalid checkpoint encoding: {0}")]
    InvalidCheckpoint(String),
    #[error("broker handle already closed")]
    Closed,
}

/// Opaque broker message id in the owning gateway's canonical binary form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint(Vec<u8>);

impl Checkpoint {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.clone()
    }
}

/// One message published to a document topic.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    /// Kind byte followed by the raw frame body.
    pub payload: Vec<u8>,
    /// Unique per publish so topic compaction never swallows an update.
    pub partition_key: String,
    /// Observational properties (`messageType`, `docName`).
    pub properties: Vec<(String, String)>,
}

impl TopicMessage {
    pub fn new(kind: FrameKind, body: &[u8], doc: &str) -> Self {
        Self {
            payload: frame::encode_topic_payload(kind, body),
            partition_key: format!("{doc}-{}", Uuid::new_v4().simple()),
            properties: vec![
                ("messageType".to_string(), kind.message_type().to_string()),
                ("docName".to_string(), doc.to_string()),
            ],
        }
    }
}

/// One message delivered by a consumer or reader.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub payload: Vec<u8>,
    pub checkpoint: Checkpoint,
}

/// Factory surface of the broker client.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a producer on `topic` with a unique `name`.
    async fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn BrokerProducer>, BrokerError>;

    /// Open a shared-subscription consumer on `topic`.
    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError>;

    /// Open a replay reader with compacted-view reads, starting after
    /// `start` when given, else at the earliest message of the topic.
    async fn create_reader(
        &self,
        topic: &str,
        start: Option<&Checkpoint>,
    ) -> Result<Box<dyn BrokerReader>, BrokerError>;

    /// Validate and revive a checkpoint from its stored binary form.
    fn checkpoint_from_bytes(&self, bytes: &[u8]) -> Result<Checkpoint, BrokerError>;

    /// Probe liveness: short-lived producer on the health topic, one byte.
    async fn health_check(&self) -> bool;

    /// Idempotent shutdown of the client.
    async fn close(&self);
}

#[async_trait]
pub trait BrokerProducer: Send {
    /// Enqueue one message. Delivery acknowledgements are not awaited on
    /// this path; failures surface in the log only.
    async fn send(&mut self, message: TopicMessage) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Idempotent; already-closed is not an error.
    async fn close(&mut self);
}

#[async_trait]
pub trait BrokerConsumer: Send {
    /// Next message, or `Ok(None)` once the consumer is disconnected.
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>, BrokerError>;

    async fn ack(&mut self, checkpoint: &Checkpoint) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Idempotent; already-closed is not an error.
    async fn close(&mut self);
}

#[async_trait]
pub trait BrokerReader: Send {
    /// Next message, or `Ok(None)` when `timeout` elapses first. Timeouts
    /// are not failures; they bound the replay window.
    async fn read_next(&mut self, timeout: Duration)
        -> Result<Option<ReceivedMessage>, BrokerError>;

    /// Idempotent; already-closed is not an error.
    async fn close(&mut self);
}

/// Builds broker clients; the supervisor uses it to rebuild after a
/// confirmed disconnect.
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError>;
}
