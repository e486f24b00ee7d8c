//! # Configuration Management Module
//!
//! All tunables for the delivery layer, presence tracking and FiMesh transfers are read
//! from a single TOML file. Every section has defaults, so a minimal file only needs the
//! values that differ.
//!
//! ## Configuration Structure
//!
//! - [`NodeConfig`] - Own node identities, radio interface and primary channel
//! - [`DeliveryConfig`] - Retry, deferral and pacing budget for text messages
//! - [`PresenceConfig`] - Online window and optional active probing
//! - [`FimeshConfig`] - File transfer window, timeouts and directories
//! - [`StorageConfig`] - Where message and transfer records live
//! - [`LoggingConfig`] - Logging level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshrelay::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("FiMesh outbox: {}/out", config.fimesh.base_dir);
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [node]
//! own_node_ids = ["!a1b2c3d4"]
//! interface = 1
//! channel = 0
//!
//! [delivery]
//! max_direct_attempts = 3
//! max_total_attempts = 9
//!
//! [fimesh]
//! enabled = true
//! max_window_size = 10
//! ```

use anyhow::{anyhow, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::codec;
use crate::delivery::DeliveryTuning;
use crate::fimesh::FimeshTuning;
use crate::meshtastic::parse_hex_node_id;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub fimesh: FimeshConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node ids owned by this bot (one per attached radio). Messages addressed to any of
    /// these are purged instead of sent.
    #[serde(default)]
    pub own_node_ids: Vec<String>,
    /// Radio interface index used for outgoing traffic (1-based)
    #[serde(default = "default_interface")]
    pub interface: u8,
    /// Channel index for direct messages and FiMesh frames
    #[serde(default)]
    pub channel: u32,
}

fn default_interface() -> u8 {
    1
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            own_node_ids: Vec::new(),
            interface: 1,
            channel: 0,
        }
    }
}

impl NodeConfig {
    /// Own node ids that parse; invalid entries are reported and skipped.
    pub fn own_ids(&self) -> Vec<u32> {
        self.own_node_ids
            .iter()
            .filter_map(|raw| {
                let parsed = parse_hex_node_id(raw);
                if parsed.is_none() {
                    log::warn!("Ignoring unparseable own node id '{}'", raw);
                }
                parsed
            })
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Consecutive failed attempts within one call before the message is deferred
    pub max_direct_attempts: u32,
    /// Lifetime attempt ceiling; reaching it marks the message undelivered
    pub max_total_attempts: u32,
    /// Sleep between direct attempts, indexed by attempt within the call (last value repeats)
    pub direct_backoff_ms: Vec<u64>,
    /// Deferral step: next retry = now + defer_step_secs * defer_count
    pub defer_step_secs: u64,
    /// A `sent` message must be at least this old before a resend pass touches it
    pub resend_min_age_secs: u64,
    /// Largest text (bytes) put into a single radio message
    pub max_text_bytes: usize,
    /// Token refill interval for the shared send pacer (0 disables pacing)
    pub send_gap_ms: u64,
    /// Tokens available in a burst before pacing kicks in
    pub send_burst: u32,
    /// How often the driver runs a resend pass over known nodes
    pub resend_interval_secs: u64,
    /// Terminal message records older than this are pruned
    pub prune_after_hours: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_direct_attempts: 3,
            max_total_attempts: 9,
            direct_backoff_ms: vec![1000, 2000, 4000],
            defer_step_secs: 60,
            resend_min_age_secs: 30,
            max_text_bytes: 200, // ~30 bytes below the 230-byte frame for protocol overhead
            send_gap_ms: 1000,
            send_burst: 4,
            resend_interval_secs: 30,
            prune_after_hours: 72,
        }
    }
}

impl DeliveryConfig {
    pub fn to_tuning(&self) -> DeliveryTuning {
        DeliveryTuning {
            max_direct_attempts: self.max_direct_attempts.max(1),
            max_total_attempts: self.max_total_attempts.max(1),
            direct_backoff: self
                .direct_backoff_ms
                .iter()
                .map(|ms| std::time::Duration::from_millis(*ms))
                .collect(),
            defer_step: Duration::seconds(self.defer_step_secs as i64),
            resend_min_age: Duration::seconds(self.resend_min_age_secs as i64),
            max_text_bytes: self.max_text_bytes.clamp(16, 230),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// A node heard within this many seconds counts as online
    pub online_window_secs: u64,
    /// Probe stale nodes with a want-ack ping before declaring them offline
    pub use_probe: bool,
    /// How long to wait for the probe ACK
    pub probe_timeout_secs: u64,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_window_secs: 1800,
            use_probe: false,
            probe_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FimeshConfig {
    pub enabled: bool,
    /// Root of the `in/`, `in/temp/`, `out/`, `out/sent/` and `hash/` directories
    pub base_dir: String,
    /// Compressed bytes carried by one DAT frame
    pub chunk_size: usize,
    pub initial_window: u32,
    pub max_window_size: u32,
    pub base_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub backoff_factor: u32,
    pub max_retries: u32,
    pub total_timeout_secs: u64,
    pub pong_timeout_secs: u64,
    pub download_idle_timeout_secs: u64,
    pub download_total_timeout_secs: u64,
    /// Driver tick period
    pub tick_ms: u64,
    /// Outbox scan period
    pub scan_interval_secs: u64,
    /// Refuse to upload files larger than this
    pub max_file_bytes: u64,
}

impl Default for FimeshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_dir: "fimesh".to_string(),
            chunk_size: 140,
            initial_window: 2,
            max_window_size: 10,
            base_timeout_secs: 180,
            max_timeout_secs: 600,
            backoff_factor: 2,
            max_retries: 5,
            total_timeout_secs: 1800,
            pong_timeout_secs: 60,
            download_idle_timeout_secs: 300,
            download_total_timeout_secs: 1800,
            tick_ms: 1000,
            scan_interval_secs: 30,
            max_file_bytes: 1024 * 1024,
        }
    }
}

impl FimeshConfig {
    pub fn to_tuning(&self) -> FimeshTuning {
        let max_window_size = self.max_window_size.max(1);
        FimeshTuning {
            chunk_size: self.chunk_size.clamp(codec::MIN_CHUNK_PAYLOAD, codec::MAX_CHUNK_PAYLOAD),
            initial_window: self.initial_window.clamp(1, max_window_size),
            max_window_size,
            base_timeout: Duration::seconds(self.base_timeout_secs as i64),
            max_timeout: Duration::seconds(self.max_timeout_secs.max(self.base_timeout_secs) as i64),
            backoff_factor: self.backoff_factor.max(1),
            max_retries: self.max_retries,
            total_timeout: Duration::seconds(self.total_timeout_secs as i64),
            pong_timeout: Duration::seconds(self.pong_timeout_secs as i64),
            download_idle_timeout: Duration::seconds(self.download_idle_timeout_secs as i64),
            download_total_timeout: Duration::seconds(self.download_total_timeout_secs as i64),
            max_file_bytes: self.max_file_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("meshrelay.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}
