//! The per-document actor: fan-in/fan-out between local peers and the
//! broker topic.
//!
//! ```text
//! peer A ──┐                                    ┌── producer ──► topic
//! peer B ──┼── command channel ──► DocActor ────┤
//! peer C ──┘        ▲                │          └── snapshots ──► store
//!                   │                ▼
//!              ingest task ◄──── consumer ◄──────── topic
//! ```
//!
//! The actor task is the single writer for the document's CRDT state,
//! awareness state and peer map. Origins are explicit command variants:
//! `PeerFrame` publishes to the broker after applying, `BrokerFrame` never
//! does — that asymmetry is the loop-breaker that keeps traffic from
//! oscillating between instances.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use yrs::sync::{Awareness, AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::broker::{
    Broker, BrokerConsumer, BrokerError, BrokerProducer, Checkpoint, TopicMessage,
};
use crate::config::{BrokerConfig, ReplayTuning, StorageMode};
use crate::context::RelayContext;
use crate::frame::{self, FrameKind};
use crate::registry::DocRegistry;
use crate::snapshot::{snapshot_key, now_secs, SnapshotError, SnapshotRecord, SnapshotStore};

/// Commands queued into the actor's command channel.
const COMMAND_QUEUE: usize = 256;
/// Outbound broker messages buffered before the publish path blocks.
const PUBLISH_QUEUE: usize = 64;
/// Frames buffered per peer before the peer is considered lagging.
pub const PEER_QUEUE: usize = 64;

/// Init-stage retry policy.
const CREATE_ATTEMPTS: u32 = 3;
const CREATE_BACKOFF: Duration = Duration::from_secs(1);

/// Canonical v1 encoding of an update carrying no structs and no deletes.
/// Clients with nothing to send answer sync step 1 with exactly this.
const EMPTY_UPDATE_V1: &[u8] = &[0, 0];

/// Actor failures surfaced to whoever awaited creation or attachment.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error("document actor closed")]
    Closed,
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

pub(crate) enum DocCommand {
    Attach {
        peer: Uuid,
        tx: mpsc::Sender<Bytes>,
        ack: oneshot::Sender<()>,
    },
    Detach {
        peer: Uuid,
    },
    PeerFrame {
        peer: Uuid,
        message: Message,
    },
    BrokerFrame {
        kind: FrameKind,
        body: Vec<u8>,
        checkpoint: Checkpoint,
    },
    Close {
        ack: oneshot::Sender<()>,
    },
}

/// Cheap handle to a running actor. Cloned per peer session.
#[derive(Clone)]
pub struct DocHandle {
    name: Arc<str>,
    instance: Uuid,
    tx: mpsc::Sender<DocCommand>,
}

impl DocHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Register a peer and wait for its handshake frames to be queued.
    pub async fn attach(&self, peer: Uuid, tx: mpsc::Sender<Bytes>) -> Result<(), DocError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(DocCommand::Attach { peer, tx, ack })
            .await
            .map_err(|_| DocError::Closed)?;
        done.await.map_err(|_| DocError::Closed)
    }

    /// Remove a peer. Safe to call on an already-closed actor.
    pub async fn detach(&self, peer: Uuid) {
        let _ = self.tx.send(DocCommand::Detach { peer }).await;
    }

    /// Dispatch one decoded frame received from `peer`.
    pub async fn frame(&self, peer: Uuid, message: Message) -> Result<(), DocError> {
        self.tx
            .send(DocCommand::PeerFrame { peer, message })
            .await
            .map_err(|_| DocError::Closed)
    }

    /// Idempotent close; resolves when tear-down has run.
    pub async fn close(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .tx
            .send(DocCommand::Close { ack })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

struct PeerRecord {
    tx: mpsc::Sender<Bytes>,
    awareness_ids: HashSet<u64>,
}

pub(crate) struct DocActor {
    name: Arc<str>,
    instance: Uuid,
    mode: StorageMode,
    snapshot_interval: u64,
    awareness: Awareness,
    peers: HashMap<Uuid, PeerRecord>,
    ever_attached: bool,
    publish_tx: mpsc::Sender<TopicMessage>,
    store: Option<Arc<dyn SnapshotStore>>,
    registry: Weak<DocRegistry>,
    ingest_token: CancellationToken,
    /// Broker id of the last sync message folded into the doc.
    checkpoint: Option<Checkpoint>,
    /// Running count of folded broker sync messages.
    folded: u64,
    /// `folded` value at the last snapshot write.
    last_snapshot_at: u64,
}

impl DocActor {
    /// Create the actor for `name`: restore from snapshot, replay the topic,
    /// open producer and consumer, then start the actor/ingest/publisher
    /// tasks. Runs on the registry's single in-flight creation slot.
    pub(crate) async fn spawn(
        ctx: RelayContext,
        name: String,
        registry: Weak<DocRegistry>,
    ) -> Result<DocHandle, DocError> {
        let broker = ctx.broker();
        let config = &ctx.config;
        let topic = config.broker.topic(&name);
        let mode = config.storage.mode;
        let interval = config.storage.snapshot_interval;
        let store = if mode.persists() { ctx.store.clone() } else { None };

        let awareness = Awareness::new(Doc::new());
        let mut checkpoint: Option<Checkpoint> = None;
        let mut folded: u64 = 0;

        if let Some(store) = &store {
            restore_snapshot(
                store.as_ref(),
                broker.as_ref(),
                &name,
                &awareness,
                &mut checkpoint,
                &mut folded,
            )
            .await?;
        }

        let mut snapshot_written_at = folded;
        if mode.replays() {
            let replayed = replay_topic(
                broker.as_ref(),
                &topic,
                &name,
                &awareness,
                &mut checkpoint,
                &mut folded,
                interval,
                &config.timing.replay,
            )
            .await?;
            if replayed >= interval {
                let record_store = store.as_ref().map(|s| s.as_ref());
                if let Some(store) = record_store {
                    match write_snapshot(store, &name, &awareness, &checkpoint, folded).await {
                        Ok(()) => {
                            snapshot_written_at = folded;
                            info!("doc {name}: replay snapshot written ({folded} messages folded)");
                        }
                        Err(e) => warn!("doc {name}: replay snapshot failed: {e}"),
                    }
                }
            }
        }

        let producer_name = format!("{name}-{}", Uuid::new_v4().simple());
        let producer = retry("create producer", || {
            broker.create_producer(&topic, &producer_name)
        })
        .await?;
        let subscription = BrokerConfig::subscription(&name);
        let consumer = retry("subscribe consumer", || {
            broker.subscribe(&topic, &subscription)
        })
        .await?;

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE);
        let (publish_tx, publish_rx) = mpsc::channel(PUBLISH_QUEUE);
        let ingest_token = CancellationToken::new();
        let instance = Uuid::new_v4();
        let name: Arc<str> = name.into();

        let actor = DocActor {
            name: name.clone(),
            instance,
            mode,
            snapshot_interval: interval,
            awareness,
            peers: HashMap::new(),
            ever_attached: false,
            publish_tx,
            store,
            registry,
            ingest_token: ingest_token.clone(),
            checkpoint,
            folded,
            last_snapshot_at: snapshot_written_at,
        };

        ctx.cleanup.spawn(publisher_task(name.clone(), producer, publish_rx));
        ctx.cleanup
            .spawn(ingest_task(name.clone(), consumer, cmd_tx.clone(), ingest_token));
        ctx.cleanup.spawn(actor.run(cmd_rx));

        info!("doc {name}: actor running (mode {mode:?}, {folded} messages folded)");
        Ok(DocHandle {
            name,
            instance,
            tx: cmd_tx,
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        let mut close_acks: Vec<oneshot::Sender<()>> = Vec::new();
        let reason = loop {
            let Some(cmd) = rx.recv().await else {
                break "command channel dropped";
            };
            match cmd {
                DocCommand::Attach { peer, tx, ack } => {
                    self.attach_peer(peer, tx).await;
                    let _ = ack.send(());
                }
                DocCommand::Detach { peer } => {
                    self.detach_many(vec![peer]).await;
                }
                DocCommand::PeerFrame { peer, message } => {
                    self.handle_peer_message(peer, message).await;
                }
                DocCommand::BrokerFrame {
                    kind,
                    body,
                    checkpoint,
                } => {
                    self.handle_broker_frame(kind, body, checkpoint).await;
                }
                DocCommand::Close { ack } => {
                    close_acks.push(ack);
                    break "close requested";
                }
            }
            if self.ever_attached && self.peers.is_empty() {
                break "last peer detached";
            }
        };

        // Drain racing close requests so their awaiters resolve too.
        while let Ok(cmd) = rx.try_recv() {
            if let DocCommand::Close { ack } = cmd {
                close_acks.push(ack);
            }
        }

        self.shutdown(reason).await;
        for ack in close_acks {
            let _ = ack.send(());
        }
    }

    async fn attach_peer(&mut self, peer: Uuid, tx: mpsc::Sender<Bytes>) {
        self.ever_attached = true;
        self.peers.insert(
            peer,
            PeerRecord {
                tx: tx.clone(),
                awareness_ids: HashSet::new(),
            },
        );

        // Server-initiated handshake: sync step 1, then the full awareness
        // snapshot when there is one.
        let step1 = {
            let txn = self.awareness.doc().transact();
            Message::Sync(SyncMessage::SyncStep1(txn.state_vector())).encode_v1()
        };
        let _ = tx.send(Bytes::from(step1)).await;

        match self.awareness.update() {
            Ok(update) if !update.clients.is_empty() => {
                let frame = Message::Awareness(update).encode_v1();
                let _ = tx.send(Bytes::from(frame)).await;
            }
            Ok(_) => {}
            Err(e) => warn!("doc {}: awareness snapshot failed: {e}", self.name),
        }
        debug!("doc {}: peer {peer} attached ({} total)", self.name, self.peers.len());
    }

    async fn handle_peer_message(&mut self, peer: Uuid, message: Message) {
        match message {
            Message::Sync(SyncMessage::SyncStep1(remote_sv)) => {
                let reply = {
                    let txn = self.awareness.doc().transact();
                    txn.encode_state_as_update_v1(&remote_sv)
                };
                // Reply even when there is nothing missing; an empty update
                // is a no-op for the peer.
                let frame = Message::Sync(SyncMessage::SyncStep2(reply)).encode_v1();
                self.send_to(peer, frame).await;
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                self.apply_local_update(peer, update).await;
            }
            Message::Awareness(update) => {
                self.apply_local_awareness(peer, update).await;
            }
            Message::AwarenessQuery => match self.awareness.update() {
                Ok(update) if !update.clients.is_empty() => {
                    let frame = Message::Awareness(update).encode_v1();
                    self.send_to(peer, frame).await;
                }
                Ok(_) => {}
                Err(e) => warn!("doc {}: awareness query failed: {e}", self.name),
            },
            other => {
                warn!(
                    "doc {}: dropping unsupported frame from peer {peer}: {other:?}",
                    self.name
                );
            }
        }
    }

    /// Apply a peer-originated CRDT update, fan it out to the other local
    /// peers and publish it once.
    async fn apply_local_update(&mut self, origin: Uuid, update: Vec<u8>) {
        if update.as_slice() == EMPTY_UPDATE_V1 {
            debug!("doc {}: no-op update from {origin}", self.name);
            return;
        }
        let decoded = match Update::decode_v1(&update) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("doc {}: dropping undecodable update from {origin}: {e}", self.name);
                return;
            }
        };
        {
            let mut txn = self.awareness.doc().transact_mut();
            if let Err(e) = txn.apply_update(decoded) {
                warn!("doc {}: update from {origin} failed to apply: {e}", self.name);
                return;
            }
        }

        let frame = Bytes::from(frame::sync_update_frame(update.clone()));
        let dead = self.broadcast(Some(origin), frame);
        self.detach_many(dead).await;
        self.publish(FrameKind::Sync, update).await;
    }

    /// Apply a peer-originated awareness diff and track which client ids
    /// the peer now controls, for removal when it drops.
    async fn apply_local_awareness(&mut self, origin: Uuid, update: AwarenessUpdate) {
        if let Some(record) = self.peers.get_mut(&origin) {
            for (client, entry) in &update.clients {
                if &*entry.json == "null" {
                    record.awareness_ids.remove(client);
                } else {
                    record.awareness_ids.insert(*client);
                }
            }
        }

        let body = update.encode_v1();
        let frame = Bytes::from(Message::Awareness(update.clone()).encode_v1());
        if let Err(e) = self.awareness.apply_update(update) {
            warn!("doc {}: awareness diff from {origin} rejected: {e}", self.name);
            return;
        }

        let dead = self.broadcast(Some(origin), frame);
        self.detach_many(dead).await;
        self.publish(FrameKind::Awareness, body).await;
    }

    /// Apply a broker-originated frame. Never publishes back.
    async fn handle_broker_frame(&mut self, kind: FrameKind, body: Vec<u8>, checkpoint: Checkpoint) {
        match kind {
            FrameKind::Sync => {
                if body.as_slice() == EMPTY_UPDATE_V1 {
                    return;
                }
                let decoded = match Update::decode_v1(&body) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("doc {}: undecodable broker update: {e}", self.name);
                        return;
                    }
                };
                {
                    let mut txn = self.awareness.doc().transact_mut();
                    if let Err(e) = txn.apply_update(decoded) {
                        warn!("doc {}: broker update failed to apply: {e}", self.name);
                        return;
                    }
                }
                self.checkpoint = Some(checkpoint);
                self.folded += 1;

                let frame = Bytes::from(frame::sync_update_frame(body));
                let dead = self.broadcast(None, frame);
                self.detach_many(dead).await;
                self.maybe_snapshot().await;
            }
            FrameKind::Awareness => {
                let update = match AwarenessUpdate::decode_v1(&body) {
                    Ok(update) => update,
                    Err(e) => {
                        warn!("doc {}: undecodable broker awareness diff: {e}", self.name);
                        return;
                    }
                };
                let frame = Bytes::from(Message::Awareness(update.clone()).encode_v1());
                if let Err(e) = self.awareness.apply_update(update) {
                    warn!("doc {}: broker awareness diff rejected: {e}", self.name);
                    return;
                }
                let dead = self.broadcast(None, frame);
                self.detach_many(dead).await;
            }
        }
    }

    /// Fan a frame out to every attached peer except `skip`. Lagging peers
    /// lose the frame with a warning; closed peers are returned for detach.
    fn broadcast(&mut self, skip: Option<Uuid>, frame: Bytes) -> Vec<Uuid> {
        let mut dead = Vec::new();
        for (peer, record) in &self.peers {
            if Some(*peer) == skip {
                continue;
            }
            match record.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("doc {}: peer {peer} lagging, frame dropped", self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*peer),
            }
        }
        dead
    }

    async fn send_to(&mut self, peer: Uuid, frame: Vec<u8>) {
        let closed = match self.peers.get(&peer) {
            Some(record) => record.tx.try_send(Bytes::from(frame)).is_err(),
            None => false,
        };
        if closed {
            self.detach_many(vec![peer]).await;
        }
    }

    /// Detach peers, including any that turn out dead while broadcasting
    /// the awareness removals this produces.
    async fn detach_many(&mut self, mut queue: Vec<Uuid>) {
        while let Some(peer) = queue.pop() {
            let Some(record) = self.peers.remove(&peer) else {
                continue;
            };
            debug!("doc {}: peer {peer} detached ({} left)", self.name, self.peers.len());
            if record.awareness_ids.is_empty() {
                continue;
            }
            for client in &record.awareness_ids {
                self.awareness.remove_state(*client);
            }
            match self
                .awareness
                .update_with_clients(record.awareness_ids.iter().copied())
            {
                Ok(update) => {
                    let body = update.encode_v1();
                    let frame = Bytes::from(Message::Awareness(update).encode_v1());
                    queue.extend(self.broadcast(None, frame));
                    // Local origin: the removal must reach other instances.
                    self.publish(FrameKind::Awareness, body).await;
                }
                Err(e) => warn!(
                    "doc {}: failed to encode awareness removal for {peer}: {e}",
                    self.name
                ),
            }
        }
    }

    /// Queue a broker publish. Blocks when the publisher queue is full;
    /// local delivery already happened, so broker back-pressure never
    /// delays peers retroactively.
    async fn publish(&self, kind: FrameKind, body: Vec<u8>) {
        let message = TopicMessage::new(kind, &body, &self.name);
        if self.publish_tx.send(message).await.is_err() {
            warn!("doc {}: publisher gone, message lost on broker path", self.name);
        }
    }

    async fn maybe_snapshot(&mut self) {
        if !self.mode.persists() {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        if self.folded < self.last_snapshot_at + self.snapshot_interval {
            return;
        }
        match write_snapshot(store.as_ref(), &self.name, &self.awareness, &self.checkpoint, self.folded)
            .await
        {
            Ok(()) => {
                self.last_snapshot_at = self.folded;
                info!("doc {}: snapshot written ({} messages folded)", self.name, self.folded);
            }
            Err(e) => warn!("doc {}: snapshot write failed: {e}", self.name),
        }
    }

    async fn shutdown(self, reason: &str) {
        info!("doc {}: closing ({reason})", self.name);

        // Deregister before tearing down so the next lookup creates a fresh
        // actor instead of finding this one.
        if let Some(registry) = self.registry.upgrade() {
            registry.remove_instance(&self.name, self.instance);
        }

        if self.mode.persists() {
            if let Some(store) = &self.store {
                match write_snapshot(store.as_ref(), &self.name, &self.awareness, &self.checkpoint, self.folded)
                    .await
                {
                    Ok(()) => info!("doc {}: final snapshot written", self.name),
                    Err(e) => warn!("doc {}: final snapshot failed: {e}", self.name),
                }
            }
        }

        self.ingest_token.cancel();
        // Dropping `publish_tx` lets the publisher drain its queue and
        // close the producer.
    }
}

/// Forward broker messages into the actor, acknowledging each one.
async fn ingest_task(
    name: Arc<str>,
    mut consumer: Box<dyn BrokerConsumer>,
    cmd_tx: mpsc::Sender<DocCommand>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            received = consumer.receive() => match received {
                Ok(Some(message)) => {
                    let checkpoint = message.checkpoint.clone();
                    match frame::decode_topic_payload(&message.payload) {
                        Ok((kind, body)) => {
                            let cmd = DocCommand::BrokerFrame {
                                kind,
                                body: body.to_vec(),
                                checkpoint: checkpoint.clone(),
                            };
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("doc {name}: dropping invalid broker payload: {e}"),
                    }
                    if let Err(e) = consumer.ack(&checkpoint).await {
                        warn!("doc {name}: ack failed: {e}");
                    }
                }
                Ok(None) => {
                    warn!("doc {name}: consumer disconnected, awaiting supervisor reconnect");
                    break;
                }
                Err(e) => {
                    warn!("doc {name}: broker receive failed: {e}");
                }
            }
        }
    }
    consumer.close().await;
}

/// Drain the publish queue into the producer. Send failures are logged and
/// the message is lost on the broker path only; snapshot + replay
/// re-converges later.
async fn publisher_task(
    name: Arc<str>,
    mut producer: Box<dyn BrokerProducer>,
    mut rx: mpsc::Receiver<TopicMessage>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = producer.send(message).await {
            warn!("doc {name}: broker publish failed: {e}");
        }
    }
    producer.close().await;
}

/// Load and validate the stored snapshot. Malformed records (bad JSON, bad
/// state bytes, un-decodable checkpoint) are cleared and treated as absent.
async fn restore_snapshot(
    store: &dyn SnapshotStore,
    broker: &dyn Broker,
    name: &str,
    awareness: &Awareness,
    checkpoint: &mut Option<Checkpoint>,
    folded: &mut u64,
) -> Result<(), DocError> {
    let key = snapshot_key(name);
    let bytes = retry("load snapshot", || store.get(&key)).await?;
    let Some(bytes) = bytes else {
        debug!("doc {name}: no snapshot, starting empty");
        return Ok(());
    };

    let malformed = |error: String| async move {
        warn!("doc {name}: snapshot malformed, clearing: {error}");
        if let Err(e) = store.delete(&key).await {
            warn!("doc {name}: failed to clear malformed snapshot: {e}");
        }
    };

    let record = match SnapshotRecord::decode(&bytes) {
        Ok(record) => record,
        Err(e) => {
            malformed(e.to_string()).await;
            return Ok(());
        }
    };
    let restored_checkpoint = match &record.checkpoint {
        Some(encoded) => match broker.checkpoint_from_bytes(encoded) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                malformed(e.to_string()).await;
                return Ok(());
            }
        },
        None => None,
    };
    let update = match Update::decode_v1(&record.state) {
        Ok(update) => update,
        Err(e) => {
            malformed(e.to_string()).await;
            return Ok(());
        }
    };

    {
        let mut txn = awareness.doc().transact_mut();
        if let Err(e) = txn.apply_update(update) {
            warn!("doc {name}: snapshot state failed to apply, starting empty: {e}");
            return Ok(());
        }
    }
    *checkpoint = restored_checkpoint;
    *folded = record.message_count;
    info!("doc {name}: snapshot restored ({} messages folded)", record.message_count);
    Ok(())
}

/// Fold topic history forward from the checkpoint. Bounded by the snapshot
/// interval, by consecutive read timeouts, and by a wall-clock cap; only
/// sync messages are folded, awareness is ephemeral. Returns the number of
/// newly folded messages.
#[allow(clippy::too_many_arguments)]
async fn replay_topic(
    broker: &dyn Broker,
    topic: &str,
    name: &str,
    awareness: &Awareness,
    checkpoint: &mut Option<Checkpoint>,
    folded: &mut u64,
    interval: u64,
    tuning: &ReplayTuning,
) -> Result<u64, DocError> {
    let start = checkpoint.clone();
    let mut reader = retry("open replay reader", || {
        broker.create_reader(topic, start.as_ref())
    })
    .await?;

    let deadline = Instant::now() + tuning.wall_clock_cap();
    let mut consecutive_timeouts = 0u32;
    let mut replayed = 0u64;

    while replayed < interval
        && consecutive_timeouts < tuning.max_consecutive_timeouts
        && Instant::now() < deadline
    {
        match reader.read_next(tuning.read_timeout()).await {
            Ok(Some(message)) => {
                consecutive_timeouts = 0;
                match frame::decode_topic_payload(&message.payload) {
                    Ok((FrameKind::Sync, body)) => {
                        let update = match Update::decode_v1(body) {
                            Ok(update) => update,
                            Err(e) => {
                                warn!("doc {name}: replay skipped undecodable update: {e}");
                                continue;
                            }
                        };
                        let applied = {
                            let mut txn = awareness.doc().transact_mut();
                            txn.apply_update(update)
                        };
                        match applied {
                            Ok(()) => {
                                *checkpoint = Some(message.checkpoint);
                                *folded += 1;
                                replayed += 1;
                            }
                            Err(e) => warn!("doc {name}: replay update failed to apply: {e}"),
                        }
                    }
                    Ok((FrameKind::Awareness, _)) => {}
                    Err(e) => warn!("doc {name}: replay skipped invalid payload: {e}"),
                }
            }
            Ok(None) => consecutive_timeouts += 1,
            Err(e) => {
                warn!("doc {name}: replay read failed: {e}");
                break;
            }
        }
    }

    reader.close().await;
    debug!("doc {name}: replay folded {replayed} messages");
    Ok(replayed)
}

async fn write_snapshot(
    store: &dyn SnapshotStore,
    name: &str,
    awareness: &Awareness,
    checkpoint: &Option<Checkpoint>,
    folded: u64,
) -> Result<(), SnapshotError> {
    let state = {
        let txn = awareness.doc().transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    };
    let record = SnapshotRecord {
        state,
        checkpoint: checkpoint.as_ref().map(|c| c.to_vec()),
        message_count: folded,
        timestamp: now_secs(),
    };
    store.put(&snapshot_key(name), record.encode()).await
}

/// Retry an init stage up to three times with a one-second back-off.
async fn retry<T, E, F, Fut>(what: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < CREATE_ATTEMPTS => {
                warn!("{what} failed (attempt {attempt}/{CREATE_ATTEMPTS}): {e}");
                attempt += 1;
                tokio::time::sleep(CREATE_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}
