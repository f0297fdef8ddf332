//! Fault injection for index lookups.

use std::sync::Arc;

use async_trait::async_trait;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{GroupId, LeafLookup, LinkId, MerkleLeaf, Seqno};
use chainwatch_types::traits::IndexLookup;

type Corruptor = dyn Fn(&mut MerkleLeaf) + Send + Sync;

/// An [`IndexLookup`] that rewrites every leaf the inner index returns.
///
/// Lets tests play a misbehaving server against an honest chain.
pub struct TamperingIndex {
    inner: Arc<dyn IndexLookup>,
    corrupt: Box<Corruptor>,
}

impl TamperingIndex {
    pub fn new(
        inner: Arc<dyn IndexLookup>,
        corrupt: impl Fn(&mut MerkleLeaf) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            corrupt: Box::new(corrupt),
        }
    }

    /// Flip the first byte of every tail's link ID.
    pub fn flip_link_ids(inner: Arc<dyn IndexLookup>) -> Self {
        Self::new(inner, |leaf| {
            for tail in [leaf.private.as_mut(), leaf.public.as_mut()].into_iter().flatten() {
                let mut bytes = *tail.link_id.as_bytes();
                bytes[0] ^= 0xff;
                tail.link_id = LinkId::from_bytes(bytes);
            }
        })
    }

    /// Report every tail `by` links further along than it is.
    pub fn shift_seqnos(inner: Arc<dyn IndexLookup>, by: u64) -> Self {
        Self::new(inner, move |leaf| {
            for tail in [leaf.private.as_mut(), leaf.public.as_mut()].into_iter().flatten() {
                tail.seqno = Seqno(tail.seqno.get() + by);
            }
        })
    }
}

#[async_trait]
impl IndexLookup for TamperingIndex {
    async fn lookup_leaf_at_seqno(
        &self,
        group_id: &GroupId,
        seqno: Seqno,
    ) -> Result<LeafLookup, AuditError> {
        let mut answer = self.inner.lookup_leaf_at_seqno(group_id, seqno).await?;
        if let Some(leaf) = answer.leaf.as_mut() {
            (self.corrupt)(leaf);
        }
        Ok(answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryIndex;
    use chainwatch_types::model::LeafTail;

    fn published() -> (Arc<MemoryIndex>, GroupId, LinkId) {
        let index = Arc::new(MemoryIndex::new());
        let team = GroupId::new("team");
        let link_id = LinkId::digest(b"link-1");
        index.publish(&team, false, LeafTail { seqno: Seqno(1), link_id });
        (index, team, link_id)
    }

    #[tokio::test]
    async fn test_flip_link_ids() {
        let (index, team, link_id) = published();
        let tampering = TamperingIndex::flip_link_ids(index);

        let tail = tampering
            .lookup_leaf_at_seqno(&team, Seqno(1))
            .await
            .unwrap()
            .leaf
            .unwrap()
            .private
            .unwrap();
        assert_ne!(tail.link_id, link_id);
        assert_eq!(tail.link_id.as_bytes()[0], link_id.as_bytes()[0] ^ 0xff);
        assert_eq!(tail.link_id.as_bytes()[1..], link_id.as_bytes()[1..]);
    }

    #[tokio::test]
    async fn test_shift_seqnos() {
        let (index, team, _) = published();
        let tampering = TamperingIndex::shift_seqnos(index, 5);

        let leaf = tampering.lookup_leaf_at_seqno(&team, Seqno(1)).await.unwrap().leaf.unwrap();
        assert_eq!(leaf.private.unwrap().seqno, Seqno(6));
        assert!(leaf.public.is_none());
    }

    #[tokio::test]
    async fn test_absent_leaf_passes_through() {
        let (index, _, _) = published();
        let tampering = TamperingIndex::flip_link_ids(index);

        let answer = tampering
            .lookup_leaf_at_seqno(&GroupId::new("other"), Seqno(1))
            .await
            .unwrap();
        assert!(answer.leaf.is_none());
    }
}
