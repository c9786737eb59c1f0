// Replica configuration

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Which kind of lease a replica asks for when it acquires or receives one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaseKindConfig {
    #[default]
    Expiration,
    Epoch,
}

/// Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Maximum tolerated clock offset between nodes
    pub max_clock_offset: u64,
    /// Length of an expiration-based lease
    pub lease_duration: u64,
    /// How long to wait for consensus to commit a lease change
    pub proposal_timeout: u64,
    pub lease_kind: LeaseKindConfig,
    /// Keys the timestamp cache tracks individually before folding the
    /// oldest into its low water mark
    pub timestamp_cache_size: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            max_clock_offset: 500,
            lease_duration: 6_000,
            proposal_timeout: 3_000,
            lease_kind: LeaseKindConfig::Expiration,
            timestamp_cache_size: crate::tscache::DEFAULT_CAPACITY,
        }
    }
}

impl ReplicaConfig {
    /// Loads a JSON config. Missing fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config = serde_json::from_str(&contents)?;
        tracing::debug!(path = %path.as_ref().display(), ?config, "loaded replica config");
        Ok(config)
    }

    pub fn max_clock_offset(&self) -> Duration {
        Duration::from_millis(self.max_clock_offset)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration)
    }

    pub fn proposal_timeout(&self) -> Duration {
        Duration::from_millis(self.proposal_timeout)
    }
}
