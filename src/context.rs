//! Shared dependency bundle.
//!
//! Constructed once at startup and passed down; there is no global state.
//! The broker slot is swappable because the supervisor rebuilds the client
//! on confirmed disconnect — actors capture whatever client is current when
//! they are created.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::broker::Broker;
use crate::cleanup::CleanupTracker;
use crate::config::RelayConfig;
use crate::snapshot::SnapshotStore;

#[derive(Clone)]
pub struct RelayContext {
    pub config: Arc<RelayConfig>,
    broker: Arc<RwLock<Arc<dyn Broker>>>,
    pub store: Option<Arc<dyn SnapshotStore>>,
    pub cleanup: CleanupTracker,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        store: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker: Arc::new(RwLock::new(broker)),
            store,
            cleanup: CleanupTracker::new(),
        }
    }

    /// The current broker client.
    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.read().clone()
    }

    /// Swap in a rebuilt broker client. Only the supervisor calls this.
    pub fn replace_broker(&self, broker: Arc<dyn Broker>) {
        *self.broker.write() = broker;
    }
}
