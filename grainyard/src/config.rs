//! Silo configuration.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Semantic configuration for one silo.
///
/// Every tunable the runtime recognizes lives here; hosting-level concerns
/// (config file parsing, CLI flags) are a collaborator's job. Values are
/// plain data — construct with [`SiloConfig::default`] and override fields,
/// or go through [`crate::runtime::SiloBuilder`].
#[derive(Debug, Clone)]
pub struct SiloConfig {
    /// Namespace every grain identity on this cluster lives in.
    pub namespace: String,

    /// Granularity of the activation collection time wheel.
    pub collection_quantum: Duration,

    /// Default idle time before an activation is collected.
    pub collection_age_default: Duration,

    /// Idle-age overrides per grain kind.
    pub collection_age_per_kind: HashMap<String, Duration>,

    /// Maximum directory forwarding hops before a definite failure.
    pub hop_limit: u8,

    /// Default per-call deadline.
    pub response_timeout: Duration,

    /// How long a disconnected client's state is retained for reconnect.
    pub client_drop_timeout: Duration,

    /// Maximum cache-invalidation retries on a single call.
    pub max_forward_count: u8,

    /// Number of short delays a joining silo waits for its first handoff
    /// split before serving directory reads regardless.
    pub initial_stabilization_delays: u32,

    /// Length of each stabilization delay.
    pub initial_stabilization_step: Duration,

    /// Grain kinds whose activations permit turn interleaving.
    pub reentrant_kinds: HashSet<String>,

    /// Backing membership provider identifier.
    pub membership: String,

    /// Bound on the directory read-through cache.
    pub directory_cache_capacity: usize,

    /// Backoff between transient-fault routing retries.
    pub retry_backoff: Duration,
}

impl SiloConfig {
    /// Idle age limit for a grain kind, honoring per-kind overrides.
    pub fn collection_age(&self, kind: &str) -> Duration {
        self.collection_age_per_kind
            .get(kind)
            .copied()
            .unwrap_or(self.collection_age_default)
    }

    /// Whether activations of this kind interleave suspended turns.
    pub fn is_reentrant(&self, kind: &str) -> bool {
        self.reentrant_kinds.contains(kind)
    }

    /// Lifetime of gateway reply-route cache entries.
    pub fn reply_route_ttl(&self) -> Duration {
        self.response_timeout * 5
    }
}

impl Default for SiloConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            collection_quantum: Duration::from_secs(60),
            collection_age_default: Duration::from_secs(600),
            collection_age_per_kind: HashMap::new(),
            hop_limit: 6,
            response_timeout: Duration::from_secs(30),
            client_drop_timeout: Duration::from_secs(60),
            max_forward_count: 2,
            initial_stabilization_delays: 80,
            initial_stabilization_step: Duration::from_millis(50),
            reentrant_kinds: HashSet::new(),
            membership: "shared".to_string(),
            directory_cache_capacity: 10_000,
            retry_backoff: Duration::from_millis(25),
        }
    }
}
