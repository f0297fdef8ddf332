//! Audit gatekeeper.
//!
//! Decides whether a group needs a full audit or may reuse its last one:
//! - no audit on record: audit
//! - root too old to judge index movement: refresh the root first
//! - index moved less than the movement trigger since the last audit: skip
//! - otherwise: audit

use std::time::Duration;

use chrono::{DateTime, Utc};

use chainwatch_types::config::AuditParams;
use chainwatch_types::model::{AuditRecord, MerkleRoot};

/// Why an audit has to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditReason {
    /// Nothing cached for the group.
    NoHistory,
    /// The caller asked for a full re-verification.
    Forced,
    /// The index advanced at least the movement trigger since the last audit.
    MerkleMoved { moved: u64 },
}

/// Outcome of a gatekeeper evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Audit(AuditReason),
    /// Reuse the last audit record.
    Skip,
    /// The root is stale; fetch a fresh one and ask again.
    RefreshRoot,
}

/// Throttles audits to "the index has moved enough since we last checked".
#[derive(Debug, Clone)]
pub struct Gatekeeper {
    root_freshness: Duration,
    merkle_movement_trigger: u64,
}

impl Gatekeeper {
    pub fn new(params: &AuditParams) -> Self {
        Self {
            root_freshness: params.root_freshness(),
            merkle_movement_trigger: params.merkle_movement_trigger,
        }
    }

    /// Evaluate with the root-freshness rule in force.
    pub fn should_audit(
        &self,
        last: Option<&AuditRecord>,
        root: &MerkleRoot,
        now: DateTime<Utc>,
    ) -> GateDecision {
        self.evaluate(last, root, Some(now))
    }

    /// Evaluate after a refresh attempt.
    ///
    /// The root is the freshest the provider could give, so its age is no
    /// longer held against it.
    pub fn should_audit_refreshed(&self, last: Option<&AuditRecord>, root: &MerkleRoot) -> GateDecision {
        self.evaluate(last, root, None)
    }

    fn evaluate(
        &self,
        last: Option<&AuditRecord>,
        root: &MerkleRoot,
        now: Option<DateTime<Utc>>,
    ) -> GateDecision {
        let Some(last) = last else {
            return GateDecision::Audit(AuditReason::NoHistory);
        };

        if let Some(now) = now {
            if root.is_older_than(self.root_freshness, now) {
                return GateDecision::RefreshRoot;
            }
        }

        let moved = root.seqno.distance_from(last.observed_root_seqno);
        if moved < self.merkle_movement_trigger {
            GateDecision::Skip
        } else {
            GateDecision::Audit(AuditReason::MerkleMoved { moved })
        }
    }
}
