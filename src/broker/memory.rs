//! In-process broker.
//!
//! Topics are vectors of stored messages behind a process-wide map; each
//! subscribed consumer sees every message published after it subscribed, and
//! readers replay the backlog from a checkpoint with compacted-view
//! semantics (latest message per partition key wins). This is the backend
//! the integration tests drive, and it carries two failure knobs: a health
//! toggle for the supervisor and a fail-next counter for the producer
//! retry path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    Broker, BrokerConnector, BrokerConsumer, BrokerError, BrokerProducer, BrokerReader,
    Checkpoint, ReceivedMessage, TopicMessage,
};

const WAKE_CAPACITY: usize = 64;

/// One message retained by a topic.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    pub partition_key: String,
    pub properties: Vec<(String, String)>,
}

struct Topic {
    messages: Vec<Arc<StoredMessage>>,
    wake: broadcast::Sender<()>,
}

impl Topic {
    fn new() -> Self {
        let (wake, _) = broadcast::channel(WAKE_CAPACITY);
        Self {
            messages: Vec::new(),
            wake,
        }
    }
}

/// A client handle onto the shared in-process topic state. Clones share the
/// same client generation; `reconnected()` starts a fresh generation over
/// the same topics, the way a rebuilt broker client would.
#[derive(Clone)]
pub struct MemoryBroker {
    topics: Arc<Mutex<HashMap<String, Topic>>>,
    healthy: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    close_signal: CancellationToken,
    producer_failures: Arc<AtomicU32>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: Arc::new(Mutex::new(HashMap::new())),
            healthy: Arc::new(AtomicBool::new(true)),
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: CancellationToken::new(),
            producer_failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fresh client generation over the same topic state. Handles of the
    /// old generation stay closed; topic history survives.
    pub fn reconnected(&self) -> Self {
        Self {
            topics: self.topics.clone(),
            healthy: self.healthy.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            close_signal: CancellationToken::new(),
            producer_failures: self.producer_failures.clone(),
        }
    }

    /// Toggle the health probe result.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Make the next `n` `create_producer` calls fail with a transient
    /// connection error.
    pub fn fail_next_producer_creations(&self, n: u32) {
        self.producer_failures.store(n, Ordering::SeqCst);
    }

    /// All messages published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Arc<StoredMessage>> {
        self.topics
            .lock()
            .get(topic)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// Seed a topic directly, bypassing a producer. Returns the checkpoint
    /// of the stored message.
    pub fn seed(&self, topic: &str, payload: Vec<u8>, partition_key: &str) -> Checkpoint {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        entry.messages.push(Arc::new(StoredMessage {
            payload,
            partition_key: partition_key.to_string(),
            properties: Vec::new(),
        }));
        let offset = entry.messages.len() as u64 - 1;
        let _ = entry.wake.send(());
        offset_checkpoint(offset)
    }

    fn publish(&self, topic: &str, message: TopicMessage) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        entry.messages.push(Arc::new(StoredMessage {
            payload: message.payload,
            partition_key: message.partition_key,
            properties: message.properties,
        }));
        let _ = entry.wake.send(());
    }

    fn subscribe_wake(&self, topic: &str) -> (broadcast::Receiver<()>, usize) {
        let mut topics = self.topics.lock();
        let entry = topics.entry(topic.to_string()).or_insert_with(Topic::new);
        (entry.wake.subscribe(), entry.messages.len())
    }

    /// Message at `offset`, applying the compacted view when asked: a
    /// message superseded by a later one with the same partition key is
    /// skipped. Returns the (possibly advanced) offset and the message.
    fn next_from(
        &self,
        topic: &str,
        mut offset: usize,
        compacted: bool,
    ) -> Option<(usize, Arc<StoredMessage>)> {
        let topics = self.topics.lock();
        let entry = topics.get(topic)?;
        while offset < entry.messages.len() {
            let msg = &entry.messages[offset];
            let superseded = compacted
                && entry.messages[offset + 1..]
                    .iter()
                    .any(|later| later.partition_key == msg.partition_key);
            if superseded {
                offset += 1;
                continue;
            }
            return Some((offset, msg.clone()));
        }
        None
    }
}

fn offset_checkpoint(offset: u64) -> Checkpoint {
    Checkpoint::new(offset.to_le_bytes().to_vec())
}

fn checkpoint_offset(checkpoint: &Checkpoint) -> Result<u64, BrokerError> {
    let bytes: [u8; 8] = checkpoint
        .as_bytes()
        .try_into()
        .map_err(|_| BrokerError::InvalidCheckpoint("expected 8 offset bytes".to_string()))?;
    Ok(u64::from_le_bytes(bytes))
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn create_producer(
        &self,
        topic: &str,
        _name: &str,
    ) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let failures = self.producer_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.producer_failures.store(failures - 1, Ordering::SeqCst);
            return Err(BrokerError::Connection("producer disconnected".to_string()));
        }
        Ok(Box::new(MemoryProducer {
            broker: self.clone(),
            topic: topic.to_string(),
            closed: false,
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        _subscription: &str,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let (wake, cursor) = self.subscribe_wake(topic);
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            topic: topic.to_string(),
            cursor,
            wake,
            connected: true,
        }))
    }

    async fn create_reader(
        &self,
        topic: &str,
        start: Option<&Checkpoint>,
    ) -> Result<Box<dyn BrokerReader>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let cursor = match start {
            Some(checkpoint) => checkpoint_offset(checkpoint)? as usize + 1,
            None => 0,
        };
        let (wake, _) = self.subscribe_wake(topic);
        Ok(Box::new(MemoryReader {
            broker: self.clone(),
            topic: topic.to_string(),
            cursor,
            wake,
            closed: false,
        }))
    }

    fn checkpoint_from_bytes(&self, bytes: &[u8]) -> Result<Checkpoint, BrokerError> {
        let checkpoint = Checkpoint::new(bytes.to_vec());
        checkpoint_offset(&checkpoint)?;
        Ok(checkpoint)
    }

    async fn health_check(&self) -> bool {
        self.healthy.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Disconnects every consumer of this client generation; topic
        // history stays for the next generation.
        self.close_signal.cancel();
    }
}

struct MemoryProducer {
    broker: MemoryBroker,
    topic: String,
    closed: bool,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&mut self, message: TopicMessage) -> Result<(), BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        if !self.broker.health_check().await {
            return Err(BrokerError::Send("broker unavailable".to_string()));
        }
        self.broker.publish(&self.topic, message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed && !self.broker.closed.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

struct MemoryConsumer {
    broker: MemoryBroker,
    topic: String,
    cursor: usize,
    wake: broadcast::Receiver<()>,
    connected: bool,
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>, BrokerError> {
        loop {
            if !self.connected || self.broker.closed.load(Ordering::SeqCst) {
                self.connected = false;
                return Ok(None);
            }
            if let Some((offset, msg)) = self.broker.next_from(&self.topic, self.cursor, false) {
                self.cursor = offset + 1;
                return Ok(Some(ReceivedMessage {
                    payload: msg.payload.clone(),
                    checkpoint: offset_checkpoint(offset as u64),
                }));
            }
            tokio::select! {
                _ = self.broker.close_signal.cancelled() => {
                    self.connected = false;
                    return Ok(None);
                }
                wake = self.wake.recv() => match wake {
                    Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        self.connected = false;
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn ack(&mut self, _checkpoint: &Checkpoint) -> Result<(), BrokerError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn close(&mut self) {
        self.connected = false;
    }
}

struct MemoryReader {
    broker: MemoryBroker,
    topic: String,
    cursor: usize,
    wake: broadcast::Receiver<()>,
    closed: bool,
}

#[async_trait]
impl BrokerReader for MemoryReader {
    async fn read_next(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, BrokerError> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((offset, msg)) = self.broker.next_from(&self.topic, self.cursor, true) {
                self.cursor = offset + 1;
                return Ok(Some(ReceivedMessage {
                    payload: msg.payload.clone(),
                    checkpoint: offset_checkpoint(offset as u64),
                }));
            }
            match tokio::time::timeout_at(deadline, self.wake.recv()).await {
                Ok(Ok(())) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(BrokerError::Receive("topic dropped".to_string()))
                }
                Err(_) => return Ok(None),
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
    }
}

/// Connector handing out the same shared in-process broker.
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl BrokerConnector for MemoryConnector {
    async fn connect(&self) -> Result<std::sync::Arc<dyn Broker>, BrokerError> {
        self.broker.set_healthy(true);
        Ok(std::sync::Arc::new(self.broker.reconnected()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[tokio::test]
    async fn test_consumer_sees_messages_after_subscribe() {
        let broker = MemoryBroker::new();
        let mut producer = broker.create_producer("t", "p").await.unwrap();
        producer
            .send(TopicMessage::new(FrameKind::Sync, &[1], "d"))
            .await
            .unwrap();

        // Subscribed after the first publish: only the second arrives.
        let mut consumer = broker.subscribe("t", "s").await.unwrap();
        producer
            .send(TopicMessage::new(FrameKind::Sync, &[2], "d"))
            .await
            .unwrap();

        let msg = consumer.receive().await.unwrap().unwrap();
        assert_eq!(msg.payload, vec![0x00, 2]);
    }

    #[tokio::test]
    async fn test_every_consumer_receives_every_message() {
        let broker = MemoryBroker::new();
        let mut a = broker.subscribe("t", "t-subscription").await.unwrap();
        let mut b = broker.subscribe("t", "t-subscription").await.unwrap();

        let mut producer = broker.create_producer("t", "p").await.unwrap();
        producer
            .send(TopicMessage::new(FrameKind::Awareness, &[5], "d"))
            .await
            .unwrap();

        assert_eq!(a.receive().await.unwrap().unwrap().payload, vec![0x01, 5]);
        assert_eq!(b.receive().await.unwrap().unwrap().payload, vec![0x01, 5]);
    }

    #[tokio::test]
    async fn test_reader_replays_backlog_from_checkpoint() {
        let broker = MemoryBroker::new();
        broker.seed("t", vec![0x00, 1], "k1");
        let cp = broker.seed("t", vec![0x00, 2], "k2");
        broker.seed("t", vec![0x00, 3], "k3");

        // From the start: all three.
        let mut reader = broker.create_reader("t", None).await.unwrap();
        let mut seen = Vec::new();
        while let Some(msg) = reader.read_next(Duration::from_millis(20)).await.unwrap() {
            seen.push(msg.payload[1]);
        }
        assert_eq!(seen, vec![1, 2, 3]);

        // From the checkpoint: only what follows it.
        let mut reader = broker.create_reader("t", Some(&cp)).await.unwrap();
        let msg = reader.read_next(Duration::from_millis(20)).await.unwrap();
        assert_eq!(msg.unwrap().payload, vec![0x00, 3]);
        let done = reader.read_next(Duration::from_millis(20)).await.unwrap();
        assert!(done.is_none());
    }

    #[tokio::test]
    async fn test_reader_compacted_view_keeps_latest_per_key() {
        let broker = MemoryBroker::new();
        broker.seed("t", vec![0x00, 1], "same");
        broker.seed("t", vec![0x00, 2], "same");
        broker.seed("t", vec![0x00, 3], "other");

        let mut reader = broker.create_reader("t", None).await.unwrap();
        let mut seen = Vec::new();
        while let Some(msg) = reader.read_next(Duration::from_millis(20)).await.unwrap() {
            seen.push(msg.payload[1]);
        }
        // The first "same" message is superseded.
        assert_eq!(seen, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_reader_timeout_is_not_an_error() {
        let broker = MemoryBroker::new();
        let mut reader = broker.create_reader("empty", None).await.unwrap();
        let result = reader.read_next(Duration::from_millis(10)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_producer_failure_knob() {
        let broker = MemoryBroker::new();
        broker.fail_next_producer_creations(1);
        assert!(broker.create_producer("t", "p").await.is_err());
        assert!(broker.create_producer("t", "p").await.is_ok());
    }

    #[tokio::test]
    async fn test_close_disconnects_consumers() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.subscribe("t", "s").await.unwrap();
        let receive = tokio::spawn(async move { consumer.receive().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        broker.close().await;
        let result = receive.await.unwrap().unwrap();
        assert!(result.is_none(), "closed broker must disconnect consumers");
    }

    #[tokio::test]
    async fn test_checkpoint_validation() {
        let broker = MemoryBroker::new();
        assert!(broker.checkpoint_from_bytes(&7u64.to_le_bytes()).is_ok());
        assert!(broker.checkpoint_from_bytes(&[1, 2, 3]).is_err());
    }

    #[tokio::test]
    async fn test_health_toggle() {
        let broker = MemoryBroker::new();
        assert!(broker.health_check().await);
        broker.set_healthy(false);
        assert!(!broker.health_check().await);
    }
}
