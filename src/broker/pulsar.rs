//! Apache Pulsar gateway.
//!
//! Everything Pulsar-specific lives behind the broker traits: raw payloads
//! in and out, message ids flattened into the 24-byte checkpoint form
//! (ledger, entry, partition, batch index), shared subscriptions per
//! document, and a non-durable compacted reader for replay. Sends are
//! enqueue-then-detach; the delivery receipt is awaited on a spawned task
//! that only logs failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use pulsar::consumer::{ConsumerOptions, InitialPosition, Message as ConsumerMessage};
use pulsar::message::proto::MessageIdData;
use pulsar::message::Payload;
use pulsar::producer::{Message as ProducerMessage, Producer};
use pulsar::reader::Reader;
use pulsar::{
    Authentication, Consumer, DeserializeMessage, Pulsar, SerializeMessage, SubType,
    TokioExecutor,
};
use uuid::Uuid;

use crate::config::BrokerConfig;

use super::{
    Broker, BrokerConnector, BrokerConsumer, BrokerError, BrokerProducer, BrokerReader,
    Checkpoint, ReceivedMessage, TopicMessage,
};

/// 2×u64 + 2×i32, little endian.
const CHECKPOINT_LEN: usize = 24;

/// Payload marker: deliver the raw bytes, no schema.
struct RawPayload;

impl DeserializeMessage for RawPayload {
    type Output = Vec<u8>;

    fn deserialize_message(payload: &Payload) -> Self::Output {
        payload.data.clone()
    }
}

/// Outbound wrapper so a fully-formed `producer::Message` passes through
/// serialization untouched.
struct RawMessage(ProducerMessage);

impl SerializeMessage for RawMessage {
    fn serialize_message(input: Self) -> Result<ProducerMessage, pulsar::Error> {
        Ok(input.0)
    }
}

fn encode_message_id(id: &MessageIdData) -> Checkpoint {
    let mut bytes = Vec::with_capacity(CHECKPOINT_LEN);
    bytes.extend_from_slice(&id.ledger_id.to_le_bytes());
    bytes.extend_from_slice(&id.entry_id.to_le_bytes());
    bytes.extend_from_slice(&id.partition.unwrap_or(-1).to_le_bytes());
    bytes.extend_from_slice(&id.batch_index.unwrap_or(-1).to_le_bytes());
    Checkpoint::new(bytes)
}

fn decode_message_id(bytes: &[u8]) -> Result<MessageIdData, BrokerError> {
    if bytes.len() != CHECKPOINT_LEN {
        return Err(BrokerError::InvalidCheckpoint(format!(
            "expected {CHECKPOINT_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let ledger_id = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
    let entry_id = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
    let partition = i32::from_le_bytes(bytes[16..20].try_into().unwrap_or_default());
    let batch_index = i32::from_le_bytes(bytes[20..24].try_into().unwrap_or_default());
    Ok(MessageIdData {
        ledger_id,
        entry_id,
        partition: Some(partition),
        batch_index: Some(batch_index),
        ..Default::default()
    })
}

pub struct PulsarBroker {
    client: Pulsar<TokioExecutor>,
    health_topic: String,
}

impl PulsarBroker {
    /// Connect a new client per the broker configuration.
    pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let mut builder = Pulsar::builder(config.url.clone(), TokioExecutor);
        if let Some(token) = &config.token {
            builder = builder.with_auth(Authentication {
                name: "token".to_string(),
                data: token.clone().into_bytes(),
            });
        }
        let client = builder
            .build()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            health_topic: config.health_topic(),
        })
    }
}

#[async_trait]
impl Broker for PulsarBroker {
    async fn create_producer(
        &self,
        topic: &str,
        name: &str,
    ) -> Result<Box<dyn BrokerProducer>, BrokerError> {
        let producer = self
            .client
            .producer()
            .with_topic(topic)
            .with_name(name)
            .build()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Box::new(PulsarProducer {
            inner: Some(producer),
        }))
    }

    async fn subscribe(
        &self,
        topic: &str,
        subscription: &str,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        let consumer: Consumer<RawPayload, TokioExecutor> = self
            .client
            .consumer()
            .with_topic(topic)
            .with_consumer_name(format!("relay-{}", Uuid::new_v4().simple()))
            .with_subscription(subscription)
            .with_subscription_type(SubType::Shared)
            .with_options(ConsumerOptions {
                initial_position: InitialPosition::Latest,
                ..Default::default()
            })
            .build()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Box::new(PulsarConsumer {
            inner: Some(consumer),
            pending: None,
            connected: true,
        }))
    }

    async fn create_reader(
        &self,
        topic: &str,
        start: Option<&Checkpoint>,
    ) -> Result<Box<dyn BrokerReader>, BrokerError> {
        let start_message_id = match start {
            Some(checkpoint) => Some(decode_message_id(checkpoint.as_bytes())?),
            None => None,
        };
        let reader: Reader<RawPayload, TokioExecutor> = self
            .client
            .reader()
            .with_topic(topic)
            .with_consumer_name(format!("replay-{}", Uuid::new_v4().simple()))
            .with_options(ConsumerOptions {
                durable: Some(false),
                read_compacted: Some(true),
                start_message_id,
                initial_position: InitialPosition::Earliest,
                ..Default::default()
            })
            .into_reader()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Box::new(PulsarReader {
            inner: Some(reader),
        }))
    }

    fn checkpoint_from_bytes(&self, bytes: &[u8]) -> Result<Checkpoint, BrokerError> {
        decode_message_id(bytes)?;
        Ok(Checkpoint::new(bytes.to_vec()))
    }

    async fn health_check(&self) -> bool {
        let result: Result<(), pulsar::Error> = async {
            let mut producer = self
                .client
                .producer()
                .with_topic(self.health_topic.as_str())
                .with_name(format!("health-{}", Uuid::new_v4().simple()))
                .build()
                .await?;
            let receipt = producer
                .send_non_blocking(RawMessage(ProducerMessage {
                    payload: vec![0u8],
                    ..Default::default()
                }))
                .await?;
            receipt.await?;
            Ok(())
        }
        .await;
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("broker health probe failed: {e}");
                false
            }
        }
    }

    async fn close(&self) {
        // The client tears its connections down on drop; nothing to await.
        debug!("pulsar client close requested");
    }
}

struct PulsarProducer {
    inner: Option<Producer<TokioExecutor>>,
}

#[async_trait]
impl BrokerProducer for PulsarProducer {
    async fn send(&mut self, message: TopicMessage) -> Result<(), BrokerError> {
        let producer = self.inner.as_mut().ok_or(BrokerError::Closed)?;
        let outbound = ProducerMessage {
            payload: message.payload,
            partition_key: Some(message.partition_key),
            properties: message.properties.into_iter().collect(),
            ..Default::default()
        };
        let receipt = producer
            .send_non_blocking(RawMessage(outbound))
            .await
            .map_err(|e| BrokerError::Send(e.to_string()))?;
        // Do not hold the publish path hostage to the broker ack.
        tokio::spawn(async move {
            if let Err(e) = receipt.await {
                warn!("broker publish not acknowledged: {e}");
            }
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.is_some()
    }

    async fn close(&mut self) {
        self.inner.take();
    }
}

struct PulsarConsumer {
    inner: Option<Consumer<RawPayload, TokioExecutor>>,
    /// Last delivered message, kept until the caller acks its checkpoint.
    pending: Option<ConsumerMessage<RawPayload>>,
    connected: bool,
}

#[async_trait]
impl BrokerConsumer for PulsarConsumer {
    async fn receive(&mut self) -> Result<Option<ReceivedMessage>, BrokerError> {
        let consumer = match self.inner.as_mut() {
            Some(consumer) => consumer,
            None => return Ok(None),
        };
        match consumer.next().await {
            Some(Ok(msg)) => {
                let received = ReceivedMessage {
                    payload: msg.payload.data.clone(),
                    checkpoint: encode_message_id(msg.message_id()),
                };
                self.pending = Some(msg);
                Ok(Some(received))
            }
            Some(Err(e)) => Err(BrokerError::Receive(e.to_string())),
            None => {
                self.connected = false;
                Ok(None)
            }
        }
    }

    async fn ack(&mut self, checkpoint: &Checkpoint) -> Result<(), BrokerError> {
        let consumer = self.inner.as_mut().ok_or(BrokerError::Closed)?;
        match self.pending.take() {
            Some(msg) if encode_message_id(msg.message_id()) == *checkpoint => consumer
                .ack(&msg)
                .await
                .map_err(|e| BrokerError::Receive(e.to_string())),
            _ => Err(BrokerError::InvalidCheckpoint(
                "ack does not match the last delivered message".to_string(),
            )),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected && self.inner.is_some()
    }

    async fn close(&mut self) {
        self.connected = false;
        self.inner.take();
    }
}

struct PulsarReader {
    inner: Option<Reader<RawPayload, TokioExecutor>>,
}

#[async_trait]
impl BrokerReader for PulsarReader {
    async fn read_next(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ReceivedMessage>, BrokerError> {
        let reader = self.inner.as_mut().ok_or(BrokerError::Closed)?;
        match tokio::time::timeout(timeout, reader.next()).await {
            Ok(Some(Ok(msg))) => Ok(Some(ReceivedMessage {
                payload: msg.payload.data.clone(),
                checkpoint: encode_message_id(msg.message_id()),
            })),
            Ok(Some(Err(e))) => Err(BrokerError::Receive(e.to_string())),
            Ok(None) => Err(BrokerError::Receive("reader stream ended".to_string())),
            Err(_) => Ok(None),
        }
    }

    async fn close(&mut self) {
        self.inner.take();
    }
}

/// Rebuilds Pulsar clients for the supervisor.
pub struct PulsarConnector {
    config: BrokerConfig,
}

impl PulsarConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl BrokerConnector for PulsarConnector {
    async fn connect(&self) -> Result<Arc<dyn Broker>, BrokerError> {
        Ok(Arc::new(PulsarBroker::connect(&self.config).await?))
    }
}
