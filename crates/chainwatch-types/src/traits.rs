/// Trait contracts between the auditor and its collaborators.
///
/// The auditor codes against these interfaces, never against a concrete
/// index client, so fault-injecting doubles can stand in for the real index
/// without touching audit logic. All traits live here so every crate can
/// depend on them without cycles.
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::AuditError;
use crate::model::*;

// ============================================================
// Index Collaborators
// ============================================================

/// Historical lookups against the global merkle index.
///
/// Implementations must be safe to call concurrently and idempotent: the
/// same `(group_id, seqno)` always yields the same answer unless the index
/// itself was corrupted.
#[async_trait]
pub trait IndexLookup: Send + Sync {
    /// Return the group's leaf as the index recorded it at global `seqno`.
    ///
    /// `Ok` with `leaf: None` means the index held nothing for the group at
    /// that point. Transport problems are `AuditError::LookupFailure`.
    async fn lookup_leaf_at_seqno(
        &self,
        group_id: &GroupId,
        seqno: Seqno,
    ) -> Result<LeafLookup, AuditError>;
}

/// Source of trusted merkle roots.
#[async_trait]
pub trait RootProvider: Send + Sync {
    /// Fetch the current root from the index.
    async fn current_trusted_root(&self) -> Result<MerkleRoot, AuditError>;

    /// Return a root fetched no longer than `max_age` ago, fetching if needed.
    async fn root_as_of_time(&self, max_age: Duration) -> Result<MerkleRoot, AuditError>;
}

/// Supplies the chain being audited. The auditor never mutates it.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    async fn load_chain(&self, group_id: &GroupId, is_public: bool)
        -> Result<ChainSnapshot, AuditError>;
}

// ============================================================
// Auditor Contract
// ============================================================

/// The audit entry point exposed to the group-management layer.
///
/// Called after a group's chain is loaded or refreshed and before the chain
/// is trusted for membership or key decisions.
#[async_trait]
pub trait GroupAuditor: Send + Sync {
    /// Audit `chain` against the index as of `trusted_root`.
    ///
    /// Returns the newest audit record for the group, which is the cached one
    /// when the audit was skipped.
    async fn audit_group(
        &self,
        group_id: &GroupId,
        is_public: bool,
        chain: &ChainSnapshot,
        trusted_root: &MerkleRoot,
        mode: AuditMode,
    ) -> Result<AuditRecord, AuditError>;

    /// The group's cached audit history, without auditing.
    fn audit_history(&self, group_id: &GroupId) -> Option<AuditHistory>;
}
