//! Broker connection supervisor.
//!
//! Probes the shared broker client on an interval. A failed probe triggers
//! a serialised reconnect: re-probe under the lock (another task may have
//! already rebuilt), swap in a fresh client, then destroy every actor — the
//! rebuild invalidated all of their producers and consumers, and the next
//! lookup recreates them against the new client.

use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::broker::BrokerConnector;
use crate::context::RelayContext;
use crate::registry::DocRegistry;

pub struct BrokerSupervisor {
    ctx: RelayContext,
    registry: Arc<DocRegistry>,
    connector: Arc<dyn BrokerConnector>,
    /// At most one reconnect in flight.
    reconnect_lock: tokio::sync::Mutex<()>,
}

impl BrokerSupervisor {
    pub fn new(
        ctx: RelayContext,
        registry: Arc<DocRegistry>,
        connector: Arc<dyn BrokerConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry,
            connector,
            reconnect_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Probe loop; runs until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut probe = tokio::time::interval(self.ctx.config.timing.health_probe_interval());
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = probe.tick() => {
                    if !self.ctx.broker().health_check().await {
                        self.reconnect().await;
                    }
                }
            }
        }
        debug!("broker supervisor stopped");
    }

    /// Rebuild the client after a confirmed failure.
    pub async fn reconnect(&self) {
        let _guard = self.reconnect_lock.lock().await;

        // Another reconnect may have fixed things while we waited.
        if self.ctx.broker().health_check().await {
            debug!("broker recovered while waiting for reconnect slot");
            return;
        }

        warn!("broker unhealthy, rebuilding client");
        match self.connector.connect().await {
            Ok(fresh) => {
                let stale = self.ctx.broker();
                self.ctx.replace_broker(fresh);
                let actors = self.registry.len();
                self.registry.close_all().await;
                stale.close().await;
                info!("broker client rebuilt, {actors} actors reset");
            }
            Err(e) => {
                error!("broker rebuild failed, retrying on next probe: {e}");
            }
        }
    }
}
