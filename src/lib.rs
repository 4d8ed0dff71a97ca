//! # y-relay — stateless relay for Yjs-style collaborative editing
//!
//! Clients connect over WebSocket to any instance and name a document; all
//! instances cooperate through a per-document broker topic, and an
//! S3-compatible object store holds compacted snapshots so a fresh instance
//! restores without replaying the whole topic.
//!
//! ## Architecture
//!
//! ```text
//!            ┌────────────── instance ──────────────┐
//! peer A ──► │ PeerSession ─┐                       │
//! peer B ──► │ PeerSession ─┼─► DocActor (per doc)  │
//!            │              │     │ ▲               │
//!            │  DocRegistry ┘     ▼ │               │
//!            │           producer / consumer        │
//!            └──────────────────│─▲─────────────────┘
//!                               ▼ │
//!                   persistent://…/doc-{name}  (broker)
//!                               │
//!                   snapshots/{name}.snapshot  (object store)
//! ```
//!
//! ## Modules
//!
//! - [`frame`] — frame kinds and the broker payload layout
//! - [`actor`] — the per-document fan-in/fan-out engine
//! - [`registry`] — name → actor map with single-flight creation
//! - [`session`] — socket read loop, handshake, keep-alive
//! - [`broker`] — gateway traits, Pulsar and in-memory backends
//! - [`snapshot`] — snapshot record codec and object-store backend
//! - [`supervisor`] — broker health probe and client rebuild
//! - [`cleanup`] — tear-down task tracker awaited at shutdown
//! - [`server`] — WebSocket accept path
//! - [`config`] / [`auth`] / [`context`] — wiring

pub mod actor;
pub mod auth;
pub mod broker;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod frame;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod supervisor;

// Re-exports for convenience
pub use actor::{DocError, DocHandle};
pub use auth::{AllowAll, AuthStrategy, BearerToken};
pub use broker::{
    Broker, BrokerConnector, BrokerConsumer, BrokerError, BrokerProducer, BrokerReader,
    Checkpoint, MemoryBroker, PulsarBroker, PulsarConnector, ReceivedMessage, TopicMessage,
};
pub use cleanup::CleanupTracker;
pub use config::{
    BrokerConfig, ConfigError, ObjectStoreConfig, RelayConfig, ReplayTuning, StorageConfig,
    StorageMode, TimingConfig,
};
pub use context::RelayContext;
pub use frame::{FrameError, FrameKind};
pub use registry::DocRegistry;
pub use server::{RelayServer, ServerError};
pub use snapshot::{ObjectSnapshotStore, SnapshotError, SnapshotRecord, SnapshotStore};
pub use supervisor::BrokerSupervisor;
