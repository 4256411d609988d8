//! Configuration for the shared state table.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::NodeId;

/// Shared state table configuration.
///
/// Carries this process's identity, the full peer address table, and the
/// timing knobs of the predicate and failure-detection workers.
#[derive(Debug, Clone)]
pub struct SstConfig {
    /// This peer's identifier.
    pub local_id: NodeId,
    /// Address table: peer id to side-channel (ip, port). Must contain
    /// `local_id`; iteration is ordered by peer id, which fixes row ranks.
    pub peers: BTreeMap<NodeId, SocketAddr>,
    /// Polling interval of the predicate scan worker.
    /// Default: 1ms
    pub predicate_poll_interval: Duration,
    /// Interval between heartbeat writes.
    /// Default: 1ms
    pub heartbeat_interval: Duration,
    /// A peer whose heartbeat has not advanced for this long is classified
    /// as failed.
    /// Default: 100ms
    pub liveness_window: Duration,
    /// How long to keep retrying side-channel connection establishment.
    /// Default: 10s
    pub connect_timeout: Duration,
}

impl Default for SstConfig {
    fn default() -> Self {
        Self {
            local_id: 0,
            peers: BTreeMap::new(),
            predicate_poll_interval: Duration::from_millis(1),
            heartbeat_interval: Duration::from_millis(1),
            liveness_window: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl SstConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the local peer id.
    pub fn with_local_id(mut self, local_id: NodeId) -> Self {
        self.local_id = local_id;
        self
    }

    /// Add a peer to the address table.
    pub fn with_peer(mut self, id: NodeId, addr: SocketAddr) -> Self {
        self.peers.insert(id, addr);
        self
    }

    /// Replace the whole address table.
    pub fn with_peers(mut self, peers: BTreeMap<NodeId, SocketAddr>) -> Self {
        self.peers = peers;
        self
    }

    /// Set the predicate polling interval.
    pub fn with_predicate_poll_interval(mut self, interval: Duration) -> Self {
        self.predicate_poll_interval = interval;
        self
    }

    /// Set the heartbeat write interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the liveness window.
    pub fn with_liveness_window(mut self, window: Duration) -> Self {
        self.liveness_window = window;
        self
    }

    /// Set the side-channel connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.peers.is_empty() {
            return Err(Error::InvalidConfig("peer address table is empty".into()));
        }
        if !self.peers.contains_key(&self.local_id) {
            return Err(Error::InvalidConfig(format!(
                "local id {} is not in the peer address table",
                self.local_id
            )));
        }
        if self.liveness_window <= self.heartbeat_interval {
            return Err(Error::InvalidConfig(
                "liveness window must exceed the heartbeat interval".into(),
            ));
        }
        Ok(())
    }

    /// Member ids in ascending order; a member's position is its row rank.
    pub fn members(&self) -> Vec<NodeId> {
        self.peers.keys().copied().collect()
    }
}
