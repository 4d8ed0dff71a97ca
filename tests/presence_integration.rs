//! Awareness (presence) integration tests.
//!
//! Drives the awareness sub-protocol through the full network stack:
//! presence diffs fan out to other peers, survive the broker hop, and are
//! withdrawn when the owning peer disconnects.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use yrs::sync::awareness::AwarenessUpdateEntry;
use yrs::sync::{AwarenessUpdate, Message, SyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact};

use y_relay::{
    AllowAll, DocRegistry, MemoryBroker, RelayConfig, RelayContext, RelayServer, ReplayTuning,
    StorageMode,
};

// ─── Helpers ─────────────────────────────────────────────────────────────────

struct TestInstance {
    addr: SocketAddr,
    shutdown: CancellationToken,
    registry: Arc<DocRegistry>,
    ctx: RelayContext,
}

impl TestInstance {
    async fn start(broker: &MemoryBroker) -> Self {
        let mut config = RelayConfig::default();
        config.storage.mode = StorageMode::None;
        config.timing.replay = ReplayTuning::for_testing();
        let ctx = RelayContext::new(config, Arc::new(broker.clone()), None);
        let registry = DocRegistry::new();
        let server = RelayServer::new(ctx.clone(), registry.clone(), Arc::new(AllowAll));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server_shutdown = shutdown.clone();
        tokio::spawn(async move {
            server.run_on(listener, server_shutdown).await.unwrap();
        });

        TestInstance {
            addr,
            shutdown,
            registry,
            ctx,
        }
    }

    fn url(&self, doc: &str) -> String {
        format!("ws://{}/{doc}", self.addr)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.registry.close_all().await;
        self.ctx.cleanup.shutdown().await;
    }
}

/// Sync client that additionally records every awareness entry it sees,
/// keyed by awareness client id ("null" json marks a removal).
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    doc: Doc,
    awareness: HashMap<u64, String>,
}

impl TestClient {
    async fn connect(url: &str) -> Self {
        let (mut ws, _) = connect_async(url).await.expect("client should connect");
        let step1 = Message::Sync(SyncMessage::SyncStep1(StateVector::default())).encode_v1();
        ws.send(WsMessage::Binary(step1.into()))
            .await
            .expect("handshake send should succeed");
        Self {
            ws,
            doc: Doc::new(),
            awareness: HashMap::new(),
        }
    }

    fn handle(&mut self, message: Message) -> Option<Vec<u8>> {
        match message {
            Message::Sync(SyncMessage::SyncStep1(sv)) => {
                let reply = {
                    let txn = self.doc.transact();
                    txn.encode_state_as_update_v1(&sv)
                };
                Some(Message::Sync(SyncMessage::SyncStep2(reply)).encode_v1())
            }
            Message::Sync(SyncMessage::SyncStep2(update))
            | Message::Sync(SyncMessage::Update(update)) => {
                if let Ok(decoded) = yrs::Update::decode_v1(&update) {
                    let mut txn = self.doc.transact_mut();
                    let _ = txn.apply_update(decoded);
                }
                None
            }
            Message::Awareness(update) => {
                for (client, entry) in &update.clients {
                    self.awareness.insert(*client, entry.json.to_string());
                }
                None
            }
            _ => None,
        }
    }

    async fn pump_for(&mut self, limit: Duration) {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Ok(Some(Ok(WsMessage::Binary(data)))) => {
                    if let Ok(message) = Message::decode_v1(&data) {
                        if let Some(reply) = self.handle(message) {
                            let _ = self.ws.send(WsMessage::Binary(reply.into())).await;
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
                Ok(_) => break,
                Err(_) => break,
            }
        }
    }

    async fn pump_until(
        &mut self,
        limit: Duration,
        mut done: impl FnMut(&HashMap<u64, String>) -> bool,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if done(&self.awareness) {
                return true;
            }
            self.pump_for(Duration::from_millis(100)).await;
        }
        done(&self.awareness)
    }

    /// Announce awareness state for `client` with the given payload.
    async fn announce(&mut self, client: u64, clock: u32, json: &str) {
        let mut clients = HashMap::new();
        clients.insert(
            client,
            AwarenessUpdateEntry {
                clock,
                json: json.into(),
            },
        );
        let frame = Message::Awareness(AwarenessUpdate { clients }).encode_v1();
        self.ws
            .send(WsMessage::Binary(frame.into()))
            .await
            .expect("send should succeed");
    }
}

fn awareness_publishes(broker: &MemoryBroker, topic: &str) -> Vec<AwarenessUpdate> {
    broker
        .published(topic)
        .iter()
        .filter(|m| m.payload.first() == Some(&0x01))
        .filter_map(|m| AwarenessUpdate::decode_v1(&m.payload[1..]).ok())
        .collect()
}

// ─── Scenarios ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_awareness_fans_out_to_other_peers() {
    let broker = MemoryBroker::new();
    let instance = TestInstance::start(&broker).await;

    let mut a = TestClient::connect(&instance.url("doc")).await;
    a.pump_for(Duration::from_millis(100)).await;
    let mut b = TestClient::connect(&instance.url("doc")).await;
    b.pump_for(Duration::from_millis(100)).await;

    a.announce(42, 1, "{\"cursor\":3}").await;

    let seen = b
        .pump_until(Duration::from_secs(3), |awareness| {
            awareness.get(&42).is_some_and(|json| json != "null")
        })
        .await;
    assert!(seen, "B never observed awareness client 42");

    instance.stop().await;
}

#[tokio::test]
async fn test_awareness_removed_when_peer_disconnects() {
    let broker = MemoryBroker::new();
    let instance = TestInstance::start(&broker).await;
    let topic = instance.ctx.config.broker.topic("doc");

    let mut a = TestClient::connect(&instance.url("doc")).await;
    a.pump_for(Duration::from_millis(100)).await;
    let mut b = TestClient::connect(&instance.url("doc")).await;
    b.pump_for(Duration::from_millis(100)).await;

    a.announce(42, 1, "{\"cursor\":0}").await;
    assert!(
        b.pump_until(Duration::from_secs(3), |awareness| awareness
            .contains_key(&42))
            .await
    );

    // A disconnects; the relay withdraws every id A controlled.
    drop(a);

    let removed = b
        .pump_until(Duration::from_secs(3), |awareness| {
            awareness.get(&42).is_some_and(|json| json == "null")
        })
        .await;
    assert!(removed, "client 42 was not withdrawn after A disconnected");

    // The removal diff also went to the broker for other instances: one
    // add, one remove.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let updates = awareness_publishes(&broker, &topic);
    assert_eq!(updates.len(), 2);
    let last = &updates[1];
    assert!(last
        .clients
        .get(&42)
        .is_some_and(|entry| &*entry.json == "null"));

    instance.stop().await;
}

#[tokio::test]
async fn test_awareness_crosses_instances() {
    let broker = MemoryBroker::new();
    let x = TestInstance::start(&broker).await;
    let y = TestInstance::start(&broker).await;

    let mut b = TestClient::connect(&y.url("doc")).await;
    b.pump_for(Duration::from_millis(100)).await;
    let mut a = TestClient::connect(&x.url("doc")).await;
    a.pump_for(Duration::from_millis(100)).await;

    a.announce(7, 1, "{\"user\":\"ana\"}").await;

    let seen = b
        .pump_until(Duration::from_secs(3), |awareness| {
            awareness.contains_key(&7)
        })
        .await;
    assert!(seen, "awareness never crossed the broker");

    x.stop().await;
    y.stop().await;
}

#[tokio::test]
async fn test_late_peer_receives_awareness_snapshot() {
    let broker = MemoryBroker::new();
    let instance = TestInstance::start(&broker).await;

    let mut a = TestClient::connect(&instance.url("doc")).await;
    a.pump_for(Duration::from_millis(100)).await;
    a.announce(9, 1, "{\"user\":\"ana\"}").await;
    a.pump_for(Duration::from_millis(200)).await;

    // B attaches afterwards; the handshake carries the full awareness
    // snapshot.
    let mut b = TestClient::connect(&instance.url("doc")).await;
    let seen = b
        .pump_until(Duration::from_secs(3), |awareness| {
            awareness.contains_key(&9)
        })
        .await;
    assert!(seen, "late joiner missed the awareness snapshot");

    instance.stop().await;
}

#[tokio::test]
async fn test_awareness_idempotent_under_duplicate_delivery() {
    let broker = MemoryBroker::new();
    let instance = TestInstance::start(&broker).await;

    let mut a = TestClient::connect(&instance.url("doc")).await;
    a.pump_for(Duration::from_millis(100)).await;
    let mut b = TestClient::connect(&instance.url("doc")).await;
    b.pump_for(Duration::from_millis(100)).await;

    // The same diff twice: state must equal a single delivery.
    a.announce(11, 1, "{\"cursor\":5}").await;
    a.announce(11, 1, "{\"cursor\":5}").await;

    assert!(
        b.pump_until(Duration::from_secs(3), |awareness| awareness
            .get(&11)
            .is_some_and(|json| json == "{\"cursor\":5}"))
            .await
    );

    instance.stop().await;
}
