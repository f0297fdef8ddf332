//! In-memory global merkle index.
//!
//! Every publish advances the global seqno by one. Each group keeps the
//! list of leaves it had at the seqnos where it changed, so a lookup at any
//! past seqno answers with the leaf as of that state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{GroupId, LeafLookup, LeafTail, LinkId, MerkleLeaf, MerkleRoot, Seqno};
use chainwatch_types::traits::{IndexLookup, RootProvider};

#[derive(Debug, Default)]
struct IndexState {
    seqno: Seqno,
    /// Leaf snapshots keyed by the global seqno they took effect at, ascending.
    groups: HashMap<GroupId, Vec<(Seqno, MerkleLeaf)>>,
}

impl IndexState {
    fn leaf_at(&self, group_id: &GroupId, seqno: Seqno) -> Option<MerkleLeaf> {
        let changes = self.groups.get(group_id)?;
        let idx = changes.partition_point(|(at, _)| *at <= seqno);
        idx.checked_sub(1).map(|i| changes[i].1.clone())
    }
}

/// Append-only global index held in memory.
///
/// Starts empty at seqno 0; the first published state is seqno 1.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: RwLock<IndexState>,
    lookups: AtomicU64,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new global state in which `group_id`'s tail on one side is `tail`.
    ///
    /// Returns the seqno of the new state.
    pub fn publish(&self, group_id: &GroupId, is_public: bool, tail: LeafTail) -> Seqno {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let seqno = state.seqno.next();
        state.seqno = seqno;

        let mut leaf = state.leaf_at(group_id, seqno).unwrap_or_else(|| MerkleLeaf {
            group_id: group_id.clone(),
            private: None,
            public: None,
        });
        if is_public {
            leaf.public = Some(tail);
        } else {
            leaf.private = Some(tail);
        }
        state
            .groups
            .entry(group_id.clone())
            .or_default()
            .push((seqno, leaf));

        trace!(group_id = %group_id, is_public, tail_seqno = %tail.seqno, merkle_seqno = %seqno, "published leaf");
        seqno
    }

    /// Publish `states` global states that touch no tracked group.
    pub fn advance(&self, states: u64) -> Seqno {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.seqno = Seqno(state.seqno.get() + states);
        state.seqno
    }

    /// Replace the link ID the index shows for chain seqno `chain_seqno`,
    /// in every state that has it as the tail. Returns the number of states changed.
    ///
    /// Simulates a server rewriting history it already published.
    pub fn rewrite_link(
        &self,
        group_id: &GroupId,
        is_public: bool,
        chain_seqno: Seqno,
        link_id: LinkId,
    ) -> usize {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let Some(changes) = state.groups.get_mut(group_id) else {
            return 0;
        };
        let mut rewritten = 0;
        for (_, leaf) in changes.iter_mut() {
            if let Some(tail) = leaf.tail_mut(is_public) {
                if tail.seqno == chain_seqno {
                    tail.link_id = link_id;
                    rewritten += 1;
                }
            }
        }
        rewritten
    }

    /// Current global seqno.
    pub fn seqno(&self) -> Seqno {
        self.state.read().unwrap_or_else(PoisonError::into_inner).seqno
    }

    /// Current root, stamped with the present time.
    pub fn root(&self) -> MerkleRoot {
        MerkleRoot::fetched_now(self.seqno())
    }

    /// The group's leaf as of global seqno `seqno`.
    pub fn leaf_at(&self, group_id: &GroupId, seqno: Seqno) -> Option<MerkleLeaf> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .leaf_at(group_id, seqno)
    }

    /// Number of lookups answered or refused so far.
    pub fn lookups(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl IndexLookup for MemoryIndex {
    async fn lookup_leaf_at_seqno(
        &self,
        group_id: &GroupId,
        seqno: Seqno,
    ) -> Result<LeafLookup, AuditError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if seqno == Seqno::ZERO || seqno > state.seqno {
            return Err(AuditError::lookup(format!(
                "merkle seqno {seqno} is not published (index is at {})",
                state.seqno
            ))
            .at_probe(seqno));
        }
        Ok(LeafLookup {
            leaf: state.leaf_at(group_id, seqno),
            root: MerkleRoot::fetched_now(seqno),
        })
    }
}

#[async_trait]
impl RootProvider for MemoryIndex {
    async fn current_trusted_root(&self) -> Result<MerkleRoot, AuditError> {
        Ok(self.root())
    }

    /// The index is local, so its current root is always fresh enough.
    async fn root_as_of_time(&self, _max_age: Duration) -> Result<MerkleRoot, AuditError> {
        Ok(self.root())
    }
}
