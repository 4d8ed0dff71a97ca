//! Relay configuration.
//!
//! The whole surface is a value: constructed at `main`, passed down, never
//! global. Every field has a default so a bare `RelayConfig::default()` runs
//! against a local broker with persistence disabled.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("storage mode {0:?} requires a [storage.store] section")]
    MissingStore(StorageMode),
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen port for the WebSocket endpoint.
    pub port: u16,
    pub broker: BrokerConfig,
    pub storage: StorageConfig,
    pub timing: TimingConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            broker: BrokerConfig::default(),
            storage: StorageConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Load from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot be wired up at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.mode != StorageMode::None && self.storage.store.is_none() {
            return Err(ConfigError::MissingStore(self.storage.mode));
        }
        Ok(())
    }
}

/// Broker connection and topic naming.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub url: String,
    pub token: Option<String>,
    pub tenant: String,
    pub namespace: String,
    pub topic_prefix: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "pulsar://127.0.0.1:6650".to_string(),
            token: None,
            tenant: "public".to_string(),
            namespace: "default".to_string(),
            topic_prefix: "doc-".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Full topic path for a document.
    pub fn topic(&self, doc: &str) -> String {
        format!(
            "persistent://{}/{}/{}{doc}",
            self.tenant, self.namespace, self.topic_prefix
        )
    }

    /// Dedicated topic used by the supervisor's health probe.
    pub fn health_topic(&self) -> String {
        format!(
            "persistent://{}/{}/{}health-check",
            self.tenant, self.namespace, self.topic_prefix
        )
    }

    /// Per-document shared subscription name.
    pub fn subscription(doc: &str) -> String {
        format!("{doc}-subscription")
    }
}

/// Persistence mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// No durable state; join the broker topic live.
    #[serde(rename = "none")]
    None,
    /// Object-store snapshots only, no checkpointed replay.
    #[serde(rename = "object")]
    Object,
    /// Snapshots plus checkpointed topic replay on actor creation.
    #[serde(rename = "broker+object")]
    BrokerObject,
}

impl StorageMode {
    pub fn persists(self) -> bool {
        self != StorageMode::None
    }

    pub fn replays(self) -> bool {
        self == StorageMode::BrokerObject
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub mode: StorageMode,
    /// Folded broker messages between snapshots, and the replay window cap.
    pub snapshot_interval: u64,
    pub store: Option<ObjectStoreConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mode: StorageMode::None,
            snapshot_interval: 30,
            store: None,
        }
    }
}

/// S3-compatible object store credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
}

/// Keep-alive, probe, shutdown and replay timings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub ping_interval_secs: u64,
    pub health_probe_secs: u64,
    pub shutdown_grace_secs: u64,
    pub replay: ReplayTuning,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: 30,
            health_probe_secs: 30,
            shutdown_grace_secs: 30,
            replay: ReplayTuning::default(),
        }
    }
}

impl TimingConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn health_probe_interval(&self) -> Duration {
        Duration::from_secs(self.health_probe_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Replay bounds: a per-read timeout, a consecutive-timeout budget, and a
/// wall-clock cap independent of both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayTuning {
    pub read_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub wall_clock_cap_ms: u64,
}

impl Default for ReplayTuning {
    fn default() -> Self {
        Self {
            read_timeout_ms: 2_000,
            max_consecutive_timeouts: 3,
            wall_clock_cap_ms: 15_000,
        }
    }
}

impl ReplayTuning {
    /// Tight bounds for tests (short reads, single timeout, 3 s cap).
    pub fn for_testing() -> Self {
        Self {
            read_timeout_ms: 500,
            max_consecutive_timeouts: 1,
            wall_clock_cap_ms: 3_000,
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn wall_clock_cap(&self) -> Duration {
        Duration::from_millis(self.wall_clock_cap_ms)
    }
}
