//! Durable document snapshots.
//!
//! A snapshot is one blob per document under `snapshots/{doc}.snapshot`:
//!
//! ```text
//! {
//!   "state":         base64 CRDT state-as-update,
//!   "checkpoint":    base64 broker message id | null,
//!   "message_count": folded broker messages so far,
//!   "timestamp":     seconds since epoch
//! }
//! ```
//!
//! The store reports "absent" as `Ok(None)` so callers can tell a missing
//! snapshot from a failing backend, and the codec reports "malformed"
//! distinctly so the actor can clear a corrupt object and restart replay
//! from the earliest topic position.

pub mod object;

pub use object::ObjectSnapshotStore;

use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Snapshot failures.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// The stored record could not be decoded; the caller should clear it
    /// and proceed as if absent.
    #[error("malformed snapshot record: {0}")]
    Malformed(String),
    /// Backend failure other than not-found.
    #[error("snapshot store error: {0}")]
    Store(String),
}

/// Object key for a document's snapshot.
pub fn snapshot_key(doc: &str) -> String {
    format!("snapshots/{doc}.snapshot")
}

/// Seconds since the unix epoch, for the snapshot timestamp.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Blob store for snapshots. "Not found" is `Ok(None)`, never an error.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), SnapshotError>;
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SnapshotError>;
    async fn delete(&self, key: &str) -> Result<(), SnapshotError>;
}

/// A decoded snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    /// CRDT state encoded as a single update.
    pub state: Vec<u8>,
    /// Broker message id of the last message folded into `state`, in the
    /// gateway's canonical binary form. `None` when the snapshot was taken
    /// without a broker checkpoint (mode `object`).
    pub checkpoint: Option<Vec<u8>>,
    /// Running count of folded broker messages; monotonic per document.
    pub message_count: u64,
    /// Creation time, seconds since epoch.
    pub timestamp: u64,
}

#[derive(Serialize, Deserialize)]
struct WireRecord {
    state: String,
    checkpoint: Option<String>,
    message_count: u64,
    timestamp: u64,
}

impl SnapshotRecord {
    pub fn encode(&self) -> Vec<u8> {
        let wire = WireRecord {
            state: BASE64.encode(&self.state),
            checkpoint: self.checkpoint.as_ref().map(|c| BASE64.encode(c)),
            message_count: self.message_count,
            timestamp: self.timestamp,
        };
        // A struct of strings and integers cannot fail to serialize.
        serde_json::to_vec(&wire).unwrap_or_default()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let wire: WireRecord = serde_json::from_slice(bytes)
            .map_err(|e| SnapshotError::Malformed(e.to_string()))?;
        let state = BASE64
            .decode(&wire.state)
            .map_err(|e| SnapshotError::Malformed(format!("state: {e}")))?;
        let checkpoint = match wire.checkpoint {
            Some(encoded) => Some(
                BASE64
                    .decode(&encoded)
                    .map_err(|e| SnapshotError::Malformed(format!("checkpoint: {e}")))?,
            ),
            None => None,
        };
        Ok(SnapshotRecord {
            state,
            checkpoint,
            message_count: wire.message_count,
            timestamp: wire.timestamp,
        })
    }
}
