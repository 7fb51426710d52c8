//! Runtime configuration.

use gqlbind_cache::FetchPolicy;
use std::time::Duration;

/// Runtime configuration shared by a registry and its sessions.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// How long a query handle stays live after its last listener leaves.
    pub grace_period: Duration,

    /// Fetch policy for definitions that do not name one.
    pub default_fetch_policy: FetchPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(5),
            default_fetch_policy: FetchPolicy::CacheFirst,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the grace period.
    pub fn grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Sets the default fetch policy.
    pub fn default_fetch_policy(mut self, policy: FetchPolicy) -> Self {
        self.default_fetch_policy = policy;
        self
    }
}
