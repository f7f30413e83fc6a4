//! Raft configuration

use crate::{RaftError, Result};
use std::time::Duration;

/// Configuration for a Raft node
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Minimum election timeout
    ///
    /// This is the minimum time a follower waits before starting an election.
    /// The actual timeout is randomized between min and max to avoid split votes.
    pub election_timeout_min: Duration,

    /// Maximum election timeout
    pub election_timeout_max: Duration,

    /// Heartbeat interval (how often leader sends AppendEntries)
    ///
    /// Should be significantly smaller than election timeout to prevent
    /// followers from timing out.
    pub heartbeat_interval: Duration,

    /// How long a single outbound RPC may take before it counts as lost
    pub rpc_timeout: Duration,

    /// Maximum number of entries to send in a single AppendEntries RPC
    pub max_append_entries: usize,

    /// Capacity hint for apply channels created by callers
    pub apply_channel_capacity: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            // Election timeout between 150-300ms (Raft paper recommendation)
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),

            // Heartbeat every 50ms (well below election timeout minimum)
            heartbeat_interval: Duration::from_millis(50),

            rpc_timeout: Duration::from_millis(100),

            max_append_entries: 100,

            apply_channel_capacity: 128,
        }
    }
}

impl RaftConfig {
    /// Check the timing relationships the election and replication engines rely on
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(RaftError::InvalidConfig(
                "election_timeout_min must be less than election_timeout_max".into(),
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(RaftError::InvalidConfig(
                "heartbeat_interval must be less than election_timeout_min".into(),
            ));
        }
        if self.rpc_timeout.is_zero() {
            return Err(RaftError::InvalidConfig(
                "rpc_timeout must be greater than 0".into(),
            ));
        }
        if self.max_append_entries == 0 {
            return Err(RaftError::InvalidConfig(
                "max_append_entries must be greater than 0".into(),
            ));
        }
        if self.apply_channel_capacity == 0 {
            return Err(RaftError::InvalidConfig(
                "apply_channel_capacity must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for RaftConfig
pub struct RaftConfigBuilder {
    config: RaftConfig,
}

impl RaftConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RaftConfig::default(),
        }
    }

    pub fn election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.config.election_timeout_min = min;
        self.config.election_timeout_max = max;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc_timeout = timeout;
        self
    }

    pub fn max_append_entries(mut self, max: usize) -> Self {
        self.config.max_append_entries = max;
        self
    }

    pub fn apply_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.apply_channel_capacity = capacity;
        self
    }

    pub fn build(self) -> Result<RaftConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RaftConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
