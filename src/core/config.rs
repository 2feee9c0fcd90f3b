//! Raft timing configuration.

use std::time::Duration;

/// Configuration for Raft timing parameters
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Interval between heartbeats sent by the leader (default: 150ms).
    /// Must be strictly less than `election_timeout_min`.
    pub heartbeat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
        }
    }
}

impl RaftConfig {
    /// Create a new config with a custom heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Create a new config with a custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Panics if the timing constraints don't hold. Checked once at server
    /// construction so builder calls can be chained in any order.
    pub(crate) fn validate(&self) {
        assert!(
            self.election_timeout_min <= self.election_timeout_max,
            "election timeout min must not exceed max"
        );
        assert!(
            self.heartbeat_interval < self.election_timeout_min,
            "heartbeat interval must be strictly less than the minimum election timeout"
        );
    }

    /// Roll a fresh random election timeout within the configured window.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}
