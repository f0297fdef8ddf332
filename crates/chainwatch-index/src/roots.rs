//! Root provider that reuses a recently fetched root.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::MerkleRoot;
use chainwatch_types::traits::RootProvider;

/// Wraps a [`RootProvider`] and remembers the newest root it returned.
///
/// [`RootProvider::root_as_of_time`] answers from memory when the remembered
/// root is young enough and fetches otherwise. The remembered root never
/// moves backwards, even if the source briefly serves an older one.
pub struct CachedRootProvider {
    source: Arc<dyn RootProvider>,
    latest: Mutex<Option<MerkleRoot>>,
    fetches: AtomicU64,
}

impl CachedRootProvider {
    pub fn new(source: Arc<dyn RootProvider>) -> Self {
        Self {
            source,
            latest: Mutex::new(None),
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of times the source was asked for its current root.
    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// The newest root seen so far.
    pub fn latest(&self) -> Option<MerkleRoot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember(&self, root: MerkleRoot) -> MerkleRoot {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let newest = match latest.take() {
            Some(previous) => previous.newer(root),
            None => root,
        };
        *latest = Some(newest.clone());
        newest
    }
}

#[async_trait]
impl RootProvider for CachedRootProvider {
    async fn current_trusted_root(&self) -> Result<MerkleRoot, AuditError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let fetched = self.source.current_trusted_root().await?;
        debug!(seqno = %fetched.seqno, "fetched merkle root");
        Ok(self.remember(fetched))
    }

    async fn root_as_of_time(&self, max_age: Duration) -> Result<MerkleRoot, AuditError> {
        if let Some(root) = self.latest() {
            if !root.is_older_than(max_age, Utc::now()) {
                return Ok(root);
            }
        }
        self.current_trusted_root().await
    }
}
