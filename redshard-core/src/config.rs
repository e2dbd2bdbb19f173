//! Configuration for pools and the cluster router.

use std::time::Duration;

/// What `Pool::get` does when no pooled connection is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnEmpty {
    /// Block until a connection is checked back in.
    Wait,
    /// Wait up to the given duration, then dial a fresh connection. The
    /// extra connection does not count against the pool size; whether it is
    /// kept on check-in is decided by the [`OnFull`] policy.
    CreateAfter(Duration),
    /// Wait up to the given duration, then fail with `Error::PoolEmpty`.
    ErrAfter(Duration),
}

/// What `Pool::put` does when the main buffer is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnFull {
    /// Close the surplus connection.
    Close,
    /// Park surplus connections in a bounded overflow buffer. A background
    /// drainer closes one overflow connection per tick while the main
    /// buffer is also full, so overflow occupancy decays once load drops.
    Buffer {
        /// Overflow capacity.
        size: usize,
        /// Cadence of the background drainer.
        drain_interval: Duration,
    },
}

/// Sizing and policy knobs for a single node's connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of connections kept hot.
    pub size: usize,
    /// Behavior when a checkout finds the pool empty.
    pub on_empty: OnEmpty,
    /// Behavior when a check-in finds the pool full.
    pub on_full: OnFull,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: 4,
            on_empty: OnEmpty::CreateAfter(Duration::from_secs(1)),
            on_full: OnFull::Close,
        }
    }
}

impl PoolConfig {
    /// Set the number of hot connections.
    #[must_use]
    pub const fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the empty-checkout policy.
    #[must_use]
    pub const fn with_on_empty(mut self, on_empty: OnEmpty) -> Self {
        self.on_empty = on_empty;
        self
    }

    /// Set the full-check-in policy.
    #[must_use]
    pub const fn with_on_full(mut self, on_full: OnFull) -> Self {
        self.on_full = on_full;
        self
    }
}

/// Configuration for the cluster router.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Addresses used to bootstrap the first topology sync. Any reachable
    /// cluster member works; the synced topology replaces this list.
    pub seeds: Vec<String>,
    /// Per-node pool configuration.
    pub pool: PoolConfig,
    /// How many redirects (or transport-error retries) a single command may
    /// follow beyond its first attempt.
    pub max_redirects: usize,
    /// Deadline applied to each command issued through the router,
    /// including topology syncs.
    pub operation_timeout: Duration,
}

impl ClusterConfig {
    /// Build a configuration from seed addresses.
    pub fn new<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            seeds: seeds.into_iter().map(Into::into).collect(),
            pool: PoolConfig::default(),
            max_redirects: 3,
            operation_timeout: Duration::from_secs(30),
        }
    }

    /// Set the per-node pool configuration.
    #[must_use]
    pub const fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Set the redirect budget.
    #[must_use]
    pub const fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the per-command deadline.
    #[must_use]
    pub const fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }
}
