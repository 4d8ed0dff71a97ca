//! Process-wide document registry.
//!
//! Maps document names to live actor handles. Creation is de-duplicated per
//! name: concurrent lookups for a missing document wait on the same
//! creation, and a failed creation is evicted before the error surfaces so
//! the next lookup retries from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::actor::{DocActor, DocError, DocHandle};
use crate::context::RelayContext;

#[derive(Default)]
pub struct DocRegistry {
    entries: Mutex<HashMap<String, Arc<OnceCell<DocHandle>>>>,
}

impl DocRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Live actor for `name`, creating it on demand. At most one creation
    /// runs per name; other callers wait for its outcome.
    pub async fn get(
        self: &Arc<Self>,
        ctx: &RelayContext,
        name: &str,
    ) -> Result<DocHandle, DocError> {
        loop {
            let cell = {
                let mut entries = self.entries.lock();
                entries
                    .entry(name.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            let result = cell
                .get_or_try_init(|| {
                    DocActor::spawn(ctx.clone(), name.to_string(), Arc::downgrade(self))
                })
                .await;

            match result {
                Ok(handle) if !handle.is_closed() => return Ok(handle.clone()),
                Ok(stale) => {
                    // The actor died since it registered; evict and retry
                    // with a fresh one.
                    debug!("doc {name}: stale registry entry, recreating");
                    self.remove_instance(name, stale.instance());
                }
                Err(e) => {
                    self.remove_cell(name, &cell);
                    return Err(e);
                }
            }
        }
    }

    /// Drop the entry for `name` if it still belongs to `instance`. Called
    /// by a closing actor before it tears down, so a later `get` always
    /// creates a fresh actor.
    pub(crate) fn remove_instance(&self, name: &str, instance: Uuid) {
        let mut entries = self.entries.lock();
        let matches = entries
            .get(name)
            .and_then(|cell| cell.get())
            .map(|handle| handle.instance() == instance)
            .unwrap_or(false);
        if matches {
            entries.remove(name);
        }
    }

    /// Drop a never-initialized entry after a failed creation.
    fn remove_cell(&self, name: &str, cell: &Arc<OnceCell<DocHandle>>) {
        let mut entries = self.entries.lock();
        if let Some(current) = entries.get(name) {
            if Arc::ptr_eq(current, cell) && current.get().is_none() {
                entries.remove(name);
            }
        }
    }

    /// Number of registered documents.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Close every actor and wait for each tear-down. Used when the broker
    /// client is rebuilt and at process shutdown.
    pub async fn close_all(&self) {
        let handles: Vec<DocHandle> = {
            let mut entries = self.entries.lock();
            entries
                .drain()
                .filter_map(|(_, cell)| cell.get().cloned())
                .collect()
        };
        for handle in handles {
            handle.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::config::{RelayConfig, ReplayTuning};
    use std::time::Duration;

    fn ctx(broker: &MemoryBroker) -> RelayContext {
        let mut config = RelayConfig::default();
        config.timing.replay = ReplayTuning::for_testing();
        RelayContext::new(config, Arc::new(broker.clone()), None)
    }

    #[tokio::test]
    async fn test_same_name_returns_same_actor() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        let a = registry.get(&ctx, "doc").await.unwrap();
        let b = registry.get(&ctx, "doc").await.unwrap();
        assert_eq!(a.instance(), b.instance());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_names_get_distinct_actors() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        let a = registry.get(&ctx, "one").await.unwrap();
        let b = registry.get(&ctx, "two").await.unwrap();
        assert_ne!(a.instance(), b.instance());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_gets_share_one_creation() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                registry.get(&ctx, "doc").await.unwrap().instance()
            }));
        }

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(task.await.unwrap());
        }
        instances.dedup();
        assert_eq!(instances.len(), 1, "all callers must share one actor");
    }

    #[tokio::test]
    async fn test_failed_creation_is_retryable() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        // Exhaust the three creation attempts.
        broker.fail_next_producer_creations(3);
        assert!(registry.get(&ctx, "doc").await.is_err());
        assert!(registry.is_empty(), "failed entry must be evicted");

        // The broker recovered; the next lookup starts from scratch.
        let handle = registry.get(&ctx, "doc").await.unwrap();
        assert!(!handle.is_closed());
    }

    #[tokio::test]
    async fn test_closed_actor_is_replaced() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        let first = registry.get(&ctx, "doc").await.unwrap();
        let first_instance = first.instance();
        first.close().await;

        let second = registry.get(&ctx, "doc").await.unwrap();
        assert_ne!(second.instance(), first_instance);
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let broker = MemoryBroker::new();
        let ctx = ctx(&broker);
        let registry = DocRegistry::new();

        registry.get(&ctx, "a").await.unwrap();
        registry.get(&ctx, "b").await.unwrap();
        registry.close_all().await;
        assert!(registry.is_empty());

        // Handles are dead after close_all.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = registry.get(&ctx, "a").await.unwrap();
        assert!(!fresh.is_closed());
    }
}
