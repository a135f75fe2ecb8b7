//! # config
//!
//! why: keep every timing knob of a peer in one explicit, per-instance value
//! relations: owned by node.rs, read by raft-node's timer, replication and apply tasks
//! what: RaftConfig with defaults, json loading, validation, randomized election timeout

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{RaftError, Result};

/// Configuration for Raft timing and buffering. Durations are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    /// Minimum election timeout
    pub election_timeout_min: u64,
    /// Maximum election timeout (exclusive)
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats
    pub heartbeat_interval: u64,
    /// Upper bound on a single outbound rpc
    pub rpc_timeout: u64,
    /// Capacity of the apply channel handed to the service
    pub apply_buffer: usize,
    /// Emit per-rpc debug events for this peer
    pub debug: bool,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            apply_buffer: 256,
            debug: false,
        }
    }
}

impl RaftConfig {
    /// Parse a (possibly partial) json document; missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| RaftError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(RaftError::InvalidConfig(msg));

        if self.election_timeout_min == 0 || self.heartbeat_interval == 0 || self.rpc_timeout == 0 {
            return invalid("timeouts and intervals must be non-zero".into());
        }
        if self.election_timeout_min >= self.election_timeout_max {
            return invalid(format!(
                "election_timeout_min ({}) must be below election_timeout_max ({})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return invalid(format!(
                "heartbeat_interval ({}) must be below election_timeout_min ({})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }
        if self.rpc_timeout >= self.election_timeout_max {
            return invalid(format!(
                "rpc_timeout ({}) must be below election_timeout_max ({})",
                self.rpc_timeout, self.election_timeout_max
            ));
        }
        if self.apply_buffer == 0 {
            return invalid("apply_buffer must be at least 1".into());
        }
        Ok(())
    }

    /// A fresh timeout drawn uniformly from `[min, max)`.
    pub fn random_election_timeout(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.election_timeout_min..self.election_timeout_max);
        Duration::from_millis(ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_deadline(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }
}
