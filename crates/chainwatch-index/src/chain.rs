//! Chain fixtures: build a group chain while publishing it to an index.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{ChainLink, ChainSnapshot, GroupId, LeafTail, LinkId, Seqno};
use chainwatch_types::traits::ChainProvider;

use crate::memory::MemoryIndex;

/// Appends links to one side of a group's chain and publishes each new tail
/// to a [`MemoryIndex`], recording the global seqno it landed at as the
/// link's anchor.
#[derive(Debug, Clone)]
pub struct ChainBuilder {
    group_id: GroupId,
    is_public: bool,
    links: Vec<ChainLink>,
}

impl ChainBuilder {
    pub fn new(group_id: GroupId, is_public: bool) -> Self {
        Self {
            group_id,
            is_public,
            links: Vec::new(),
        }
    }

    pub fn group_id(&self) -> &GroupId {
        &self.group_id
    }

    pub fn last_seqno(&self) -> Seqno {
        self.links.last().map(|link| link.seqno).unwrap_or(Seqno::ZERO)
    }

    /// Derive the next link's ID from the group, side, seqno, and previous link.
    fn next_link_id(&self, seqno: Seqno) -> LinkId {
        let mut content = format!("{}:{}:{}", self.group_id, self.is_public, seqno).into_bytes();
        if let Some(prev) = self.links.last() {
            content.extend_from_slice(prev.link_id.as_bytes());
        }
        LinkId::digest(&content)
    }

    /// Append one link in its own global state.
    pub fn append(&mut self, index: &MemoryIndex) -> ChainLink {
        let seqno = self.last_seqno().next();
        let link_id = self.next_link_id(seqno);
        let merkle_seqno = index.publish(&self.group_id, self.is_public, LeafTail { seqno, link_id });
        let link = ChainLink {
            seqno,
            link_id,
            merkle_seqno,
        };
        self.links.push(link);
        link
    }

    /// Append `count` links that land in the same global state.
    pub fn append_batch(&mut self, index: &MemoryIndex, count: usize) -> Vec<ChainLink> {
        if count == 0 {
            return Vec::new();
        }
        let mut staged = Vec::with_capacity(count);
        for _ in 0..count {
            let seqno = self.last_seqno().next();
            let link_id = self.next_link_id(seqno);
            // Anchor is filled in once the batch is published.
            self.links.push(ChainLink {
                seqno,
                link_id,
                merkle_seqno: Seqno::ZERO,
            });
            staged.push(self.links.len() - 1);
        }

        let tail = &self.links[self.links.len() - 1];
        let anchor = index.publish(
            &self.group_id,
            self.is_public,
            LeafTail {
                seqno: tail.seqno,
                link_id: tail.link_id,
            },
        );
        staged
            .into_iter()
            .map(|i| {
                self.links[i].merkle_seqno = anchor;
                self.links[i]
            })
            .collect()
    }

    /// The whole chain built so far.
    pub fn snapshot(&self) -> Result<ChainSnapshot, AuditError> {
        ChainSnapshot::new(self.links.clone())
    }

    /// The chain as a member who stopped loading after `seqno` would see it.
    pub fn snapshot_through(&self, seqno: Seqno) -> Result<ChainSnapshot, AuditError> {
        ChainSnapshot::new(
            self.links
                .iter()
                .filter(|link| link.seqno <= seqno)
                .copied()
                .collect(),
        )
    }
}

/// In-memory [`ChainProvider`] keyed by group and side.
#[derive(Debug, Default)]
pub struct ChainStore {
    chains: RwLock<HashMap<(GroupId, bool), ChainSnapshot>>,
}

impl ChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, group_id: GroupId, is_public: bool, chain: ChainSnapshot) {
        self.chains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((group_id, is_public), chain);
    }
}

#[async_trait]
impl ChainProvider for ChainStore {
    async fn load_chain(&self, group_id: &GroupId, is_public: bool) -> Result<ChainSnapshot, AuditError> {
        self.chains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(group_id.clone(), is_public))
            .cloned()
            .ok_or_else(|| {
                let side = if is_public { "public" } else { "private" };
                AuditError::InvalidChain(format!("no {side} chain loaded for group {group_id}"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_records_anchor() {
        let index = MemoryIndex::new();
        let mut builder = ChainBuilder::new(GroupId::new("team"), false);
        index.advance(4);

        let link = builder.append(&index);
        assert_eq!(link.seqno, Seqno(1));
        assert_eq!(link.merkle_seqno, Seqno(5));

        let leaf = index.leaf_at(builder.group_id(), Seqno(5)).unwrap();
        assert_eq!(leaf.private.unwrap().link_id, link.link_id);
    }

    #[test]
    fn test_batch_shares_one_anchor() {
        let index = MemoryIndex::new();
        let mut builder = ChainBuilder::new(GroupId::new("team"), false);
        builder.append(&index);

        let batch = builder.append_batch(&index, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].merkle_seqno, batch[1].merkle_seqno);
        assert_eq!(index.seqno(), Seqno(2));

        let tail = index.leaf_at(builder.group_id(), Seqno(2)).unwrap().private.unwrap();
        assert_eq!(tail.seqno, Seqno(3));
        assert!(builder.snapshot().is_ok());
    }

    #[test]
    fn test_link_ids_are_distinct_across_groups_and_sides() {
        let index = MemoryIndex::new();
        let a = ChainBuilder::new(GroupId::new("a"), false).append(&index);
        let b = ChainBuilder::new(GroupId::new("b"), false).append(&index);
        let a_public = ChainBuilder::new(GroupId::new("a"), true).append(&index);
        assert_ne!(a.link_id, b.link_id);
        assert_ne!(a.link_id, a_public.link_id);
    }

    #[test]
    fn test_snapshot_through_truncates() {
        let index = MemoryIndex::new();
        let mut builder = ChainBuilder::new(GroupId::new("team"), false);
        for _ in 0..5 {
            builder.append(&index);
        }
        let snapshot = builder.snapshot_through(Seqno(3)).unwrap();
        assert_eq!(snapshot.last_seqno(), Seqno(3));
        assert!(builder.snapshot_through(Seqno::ZERO).is_err());
    }

    #[tokio::test]
    async fn test_chain_store_loads_by_side() {
        let index = MemoryIndex::new();
        let mut builder = ChainBuilder::new(GroupId::new("team"), true);
        builder.append(&index);

        let store = ChainStore::new();
        store.insert(GroupId::new("team"), true, builder.snapshot().unwrap());

        assert!(store.load_chain(&GroupId::new("team"), true).await.is_ok());
        let err = store.load_chain(&GroupId::new("team"), false).await.unwrap_err();
        assert!(matches!(err, AuditError::InvalidChain(_)));
    }
}
