/// Configuration types for chainwatch.
///
/// Parsed from `config/audit.yaml`; every field has a default so partial
/// files are accepted.
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tuning knobs for the group-chain auditor.
///
/// ```yaml
/// num_pre_probes: 25
/// num_post_probes: 25
/// parallelism: 5
/// root_freshness_ms: 60000
/// merkle_movement_trigger: 1000
/// lru_size: 1000
/// lock_table_size: 1000
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditParams {
    /// Samples re-checked from the already-verified part of the chain.
    pub num_pre_probes: usize,
    /// Samples drawn from the part of the chain this audit newly certifies.
    pub num_post_probes: usize,
    /// Index lookups allowed in flight per audit.
    pub parallelism: usize,
    /// Maximum age of a root before it must be refreshed to justify a skip (in milliseconds).
    ///
    /// Zero means a root is never fresh enough to skip without a refresh.
    pub root_freshness_ms: u64,
    /// Global seqnos the index must advance past the last audit before re-auditing.
    pub merkle_movement_trigger: u64,
    /// Groups whose audit history is cached.
    pub lru_size: usize,
    /// Idle per-group audit locks kept before eviction.
    pub lock_table_size: usize,
    /// Fixed seed for probe sampling; random when unset.
    pub rng_seed: Option<u64>,
}

impl Default for AuditParams {
    fn default() -> Self {
        Self {
            num_pre_probes: 25,
            num_post_probes: 25,
            parallelism: 5,
            root_freshness_ms: 60_000,
            merkle_movement_trigger: 1000,
            lru_size: 1000,
            lock_table_size: 1000,
            rng_seed: None,
        }
    }
}

impl AuditParams {
    pub fn root_freshness(&self) -> Duration {
        Duration::from_millis(self.root_freshness_ms)
    }
}
