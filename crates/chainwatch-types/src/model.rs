/// Shared data types used across all chainwatch crates.
///
/// Chains, merkle roots and leaves, and audit records. Every crate imports
/// these, so collaborators and the auditor agree on one vocabulary.
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::errors::AuditError;

/// Most recent index observations and verified links kept per group.
pub const MAX_RETAINED_SAMPLES: usize = 1024;

/// Most recent audit records kept per group.
pub const MAX_RETAINED_RECORDS: usize = 128;

// ============================================================
// Identifiers
// ============================================================

/// Opaque, stable identifier of an audited group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Position within a group chain or within the global merkle index.
///
/// Chain seqnos start at 1. Zero means "nothing yet" (an empty chain, or a
/// group the index has no leaf for).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Seqno(pub u64);

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn next(self) -> Seqno {
        Seqno(self.0.saturating_add(1))
    }

    /// Distance from `earlier` up to `self`, zero if `earlier` is ahead.
    pub fn distance_from(self, earlier: Seqno) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl fmt::Display for Seqno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Self {
        Seqno(value)
    }
}

/// Content hash identifying one chain link. Compared by equality only.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkId([u8; 32]);

impl LinkId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// SHA-256 of arbitrary link content.
    pub fn digest(content: &[u8]) -> Self {
        Self(Sha256::digest(content).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix keeps log lines readable.
        write!(f, "LinkId(")?;
        for byte in &self.0[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

// ============================================================
// Merkle Index Types
// ============================================================

/// A trusted snapshot of the global index at some global seqno.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleRoot {
    /// Global seqno of this root.
    pub seqno: Seqno,
    /// When this root was obtained from the index.
    pub fetched_at: DateTime<Utc>,
}

impl MerkleRoot {
    pub fn new(seqno: Seqno, fetched_at: DateTime<Utc>) -> Self {
        Self { seqno, fetched_at }
    }

    /// A root fetched right now.
    pub fn fetched_now(seqno: Seqno) -> Self {
        Self::new(seqno, Utc::now())
    }

    /// How long ago this root was fetched. Clock skew into the future counts as zero.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_older_than(&self, max_age: Duration, now: DateTime<Utc>) -> bool {
        self.age(now) > max_age
    }

    /// The root with the higher seqno; the more recently fetched one on a tie.
    pub fn newer(self, other: MerkleRoot) -> MerkleRoot {
        if (other.seqno, other.fetched_at) > (self.seqno, self.fetched_at) {
            other
        } else {
            self
        }
    }
}

/// The chain position the index recorded for one side (public or private) of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafTail {
    /// Chain seqno the index believed was current.
    pub seqno: Seqno,
    /// Link ID of that chain position.
    pub link_id: LinkId,
}

/// The index's recorded state for one group as of some root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleLeaf {
    pub group_id: GroupId,
    /// Tail of the group's private chain, if the index has one.
    pub private: Option<LeafTail>,
    /// Tail of the group's public chain, if the index has one.
    pub public: Option<LeafTail>,
}

impl MerkleLeaf {
    pub fn tail(&self, is_public: bool) -> Option<&LeafTail> {
        if is_public {
            self.public.as_ref()
        } else {
            self.private.as_ref()
        }
    }

    pub fn tail_mut(&mut self, is_public: bool) -> Option<&mut LeafTail> {
        if is_public {
            self.public.as_mut()
        } else {
            self.private.as_mut()
        }
    }
}

/// Answer to a historical leaf lookup.
///
/// `leaf` is `None` when the index held nothing for the group at that seqno.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafLookup {
    pub leaf: Option<MerkleLeaf>,
    /// Root the leaf was read under; its seqno equals the requested seqno.
    pub root: MerkleRoot,
}

// ============================================================
// Chain Types
// ============================================================

/// One position of a group chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub seqno: Seqno,
    pub link_id: LinkId,
    /// First global-index seqno whose state reflects this link.
    pub merkle_seqno: Seqno,
}

/// The caller's read-only view of a group chain at audit time.
///
/// Links are contiguous from seqno 1 with non-decreasing anchors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainSnapshot {
    links: Vec<ChainLink>,
}

impl ChainSnapshot {
    /// Build a snapshot, rejecting chains that break the numbering or anchor rules.
    pub fn new(links: Vec<ChainLink>) -> Result<Self, AuditError> {
        if links.is_empty() {
            return Err(AuditError::InvalidChain("chain has no links".to_string()));
        }

        let mut seen = HashSet::with_capacity(links.len());
        let mut prev_anchor = Seqno::ZERO;
        for (i, link) in links.iter().enumerate() {
            let expected = Seqno(i as u64 + 1);
            if link.seqno != expected {
                return Err(AuditError::InvalidChain(format!(
                    "expected seqno {expected}, found {}",
                    link.seqno
                )));
            }
            if !seen.insert(link.link_id) {
                return Err(AuditError::InvalidChain(format!(
                    "link {} repeats an earlier link ID",
                    link.seqno
                )));
            }
            if link.merkle_seqno < prev_anchor {
                return Err(AuditError::InvalidChain(format!(
                    "link {} anchored at merkle seqno {} before its predecessor ({prev_anchor})",
                    link.seqno, link.merkle_seqno
                )));
            }
            prev_anchor = link.merkle_seqno;
        }

        Ok(Self { links })
    }

    pub fn last_seqno(&self) -> Seqno {
        Seqno(self.links.len() as u64)
    }

    /// Merkle seqno recorded by the tail link.
    pub fn head_merkle_seqno(&self) -> Seqno {
        self.links
            .last()
            .map(|link| link.merkle_seqno)
            .unwrap_or(Seqno::ZERO)
    }

    pub fn link(&self, seqno: Seqno) -> Option<&ChainLink> {
        let idx = usize::try_from(seqno.0.checked_sub(1)?).ok()?;
        self.links.get(idx)
    }

    pub fn links(&self) -> &[ChainLink] {
        &self.links
    }
}

// ============================================================
// Audit Types
// ============================================================

/// How the caller wants an audit to be run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditMode {
    /// Audit only when the gatekeeper says enough has changed.
    #[default]
    Standard,
    /// Always re-verify, ignoring the gatekeeper's skip decision.
    Force,
    /// The caller just created the group; a fresh one-link chain is recorded without probing.
    JustCreated,
}

/// Result of one completed audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Chain position verified up to.
    pub max_chain_seqno: Seqno,
    /// Seqno of the trusted root the audit ran against.
    pub observed_root_seqno: Seqno,
    pub completed_at: DateTime<Utc>,
    /// Global seqnos looked up, ascending.
    pub probes: Vec<Seqno>,
    pub mode: AuditMode,
}

/// Ordered audits of one group, newest last, plus what they learned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHistory {
    pub group_id: GroupId,
    /// Whether the audited chain is the group's public one.
    pub public: bool,
    pub records: Vec<AuditRecord>,
    /// Global seqno to the chain seqno the index reported there.
    pub observations: BTreeMap<Seqno, Seqno>,
    /// Chain seqno to the link ID confirmed by the index.
    pub verified_links: BTreeMap<Seqno, LinkId>,
}

impl AuditHistory {
    pub fn new(group_id: GroupId, public: bool) -> Self {
        Self {
            group_id,
            public,
            records: Vec::new(),
            observations: BTreeMap::new(),
            verified_links: BTreeMap::new(),
        }
    }

    pub fn last(&self) -> Option<&AuditRecord> {
        self.records.last()
    }

    /// Highest verified chain seqno, zero before the first audit.
    pub fn max_chain_seqno(&self) -> Seqno {
        self.last()
            .map(|record| record.max_chain_seqno)
            .unwrap_or(Seqno::ZERO)
    }

    /// Append a record. The watermark never regresses: a record below the
    /// current one is raised to it.
    pub fn push(&mut self, mut record: AuditRecord) {
        record.max_chain_seqno = record.max_chain_seqno.max(self.max_chain_seqno());
        self.records.push(record);
        if self.records.len() > MAX_RETAINED_RECORDS {
            let excess = self.records.len() - MAX_RETAINED_RECORDS;
            self.records.drain(..excess);
        }
    }

    pub fn record_observations(&mut self, observations: impl IntoIterator<Item = (Seqno, Seqno)>) {
        self.observations.extend(observations);
        retain_newest(&mut self.observations);
    }

    pub fn record_verified_links(&mut self, links: impl IntoIterator<Item = (Seqno, LinkId)>) {
        self.verified_links.extend(links);
        retain_newest(&mut self.verified_links);
    }
}

fn retain_newest<V>(map: &mut BTreeMap<Seqno, V>) {
    while map.len() > MAX_RETAINED_SAMPLES {
        map.pop_first();
    }
}
