//! Tunables for a DHT node.
//!
//! | Field | Default | Meaning |
//! |-------|---------|---------|
//! | `k` | 20 | bucket size and replication factor |
//! | `c1` | 16 | static proof-of-work difficulty (leading zero bits) |
//! | `c2` | 8 | dynamic proof-of-work difficulty |
//! | `max_concurrent_messages` | 3 | outstanding RPCs per action |
//! | `operation_timeout` | 10s | wall-clock deadline of one action |
//! | `response_timeout` | 2s | per-RPC wait before the request counts as failed |
//! | `eviction_policy` | `DropNew` | what happens when a bucket is full |
//! | `refresh_interval` | 10min | how often the binary runs `refresh()` |

use std::time::Duration;

use anyhow::{Result, bail};

pub const DEFAULT_K: usize = 20;
pub const DEFAULT_C1: u32 = 16;
pub const DEFAULT_C2: u32 = 8;
pub const DEFAULT_MAX_CONCURRENT_MESSAGES: usize = 3;
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Behaviour of [`RoutingTable::insert`](crate::routing::RoutingTable::insert)
/// when the target bucket already holds `k` peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Drop the newcomer; incumbents are only removed after a reported timeout.
    #[default]
    DropNew,
    /// Probe the least-recently-seen incumbent and replace it if it stays silent.
    PingOldest,
}

#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub k: usize,
    pub c1: u32,
    pub c2: u32,
    pub max_concurrent_messages: usize,
    pub operation_timeout: Duration,
    pub response_timeout: Duration,
    pub eviction_policy: EvictionPolicy,
    pub refresh_interval: Duration,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            c1: DEFAULT_C1,
            c2: DEFAULT_C2,
            max_concurrent_messages: DEFAULT_MAX_CONCURRENT_MESSAGES,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            eviction_policy: EvictionPolicy::default(),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        }
    }
}

impl DhtConfig {
    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_difficulty(mut self, c1: u32, c2: u32) -> Self {
        self.c1 = c1;
        self.c2 = c2;
        self
    }

    pub fn with_max_concurrent_messages(mut self, n: usize) -> Self {
        self.max_concurrent_messages = n;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_eviction_policy(mut self, policy: EvictionPolicy) -> Self {
        self.eviction_policy = policy;
        self
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Reject settings under which actions could never make progress.
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("k must be at least 1");
        }
        if self.max_concurrent_messages == 0 {
            bail!("max_concurrent_messages must be at least 1");
        }
        if self.c1 > 160 || self.c2 > 160 {
            bail!("proof-of-work difficulty cannot exceed 160 bits");
        }
        if self.response_timeout.is_zero() || self.operation_timeout.is_zero() {
            bail!("timeouts must be non-zero");
        }
        if self.response_timeout > self.operation_timeout {
            bail!(
                "response_timeout ({:?}) exceeds operation_timeout ({:?})",
                self.response_timeout,
                self.operation_timeout
            );
        }
        Ok(())
    }
}
