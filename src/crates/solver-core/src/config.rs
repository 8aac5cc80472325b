//! Registry configuration surface (§7a).
//!
//! `solver-core` is a library, not a CLI: there is no wire-format config to parse. What it does
//! expose is a small, explicit set of tunables that would otherwise be magic numbers, using the
//! same `with_*` builder convention the rest of this codebase uses for its own config structs.

use std::time::Duration;

/// Tunables for a [`Registry`](crate::registry::Registry).
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// How long `Registry::get` waits for a not-yet-created job id before giving up (§4.1,
    /// default 3s).
    pub job_lookup_deadline: Duration,
    /// Capacity of the `mpsc` channel backing each job's progress stream.
    pub progress_channel_capacity: usize,
    /// Whether slow-cache computation is offered at all. Vertices with no inputs never need it;
    /// disabling it entirely avoids the per-index bookkeeping for backends that don't use it.
    pub slow_cache_enabled: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            job_lookup_deadline: Duration::from_secs(3),
            progress_channel_capacity: 64,
            slow_cache_enabled: true,
        }
    }
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job_lookup_deadline(mut self, deadline: Duration) -> Self {
        self.job_lookup_deadline = deadline;
        self
    }

    pub fn with_progress_channel_capacity(mut self, capacity: usize) -> Self {
        self.progress_channel_capacity = capacity;
        self
    }

    pub fn with_slow_cache_enabled(mut self, enabled: bool) -> Self {
        self.slow_cache_enabled = enabled;
        self
    }
}
