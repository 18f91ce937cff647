use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::media::MediaConstraints;
use crate::signaling::rtc::DEFAULT_ICE_SERVERS;

/// Client settings. Every field has a default, so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// how long an inbound call rings before it is missed
    pub ring_timeout_secs: u64,
    /// period of the elapsed-time ticker of an active call
    pub tick_interval_ms: u64,
    /// delay before the automatic reconnect of a dropped channel
    pub reconnect_delay_secs: u64,
    /// size of the recent contacts list
    pub history_limit: usize,
    /// acquire local media as soon as the channel opens
    pub acquire_on_connect: bool,
    /// log in with the persisted identity on start
    pub auto_login: bool,
    pub ice_servers: Vec<String>,
    pub constraints: MediaConstraints,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ring_timeout_secs: 30,
            tick_interval_ms: 1000,
            reconnect_delay_secs: 5,
            history_limit: 5,
            acquire_on_connect: true,
            auto_login: true,
            ice_servers: DEFAULT_ICE_SERVERS.iter().map(|s| s.to_string()).collect(),
            constraints: MediaConstraints::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&contents).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn ring_timeout(&self) -> Duration {
        Duration::from_secs(self.ring_timeout_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        // a zero period would make the ticker panic
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}
