//! Probe executor.
//!
//! Runs historical index lookups on a fixed pool of workers:
//! - at most `parallelism` lookups in flight
//! - workers drain a shared queue and stop on a shared cancellation token
//! - the first failure cancels the siblings and is returned tagged with its probe
//! - caller cancellation returns promptly; stragglers are aborted, never awaited

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{GroupId, LeafLookup, MerkleLeaf, MerkleRoot, Seqno};
use chainwatch_types::traits::IndexLookup;

/// One answered probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub merkle_seqno: Seqno,
    pub leaf: Option<MerkleLeaf>,
    pub root: MerkleRoot,
}

type WorkerMessage = (Seqno, Result<LeafLookup, AuditError>);

/// Bounded-concurrency runner for index lookups.
pub struct ProbeExecutor {
    index: Arc<dyn IndexLookup>,
    parallelism: usize,
    /// Lookups started, shared with whoever wants to observe probe volume.
    issued: Arc<AtomicU64>,
}

impl ProbeExecutor {
    pub fn new(index: Arc<dyn IndexLookup>, parallelism: usize) -> Self {
        Self {
            index,
            parallelism: parallelism.max(1),
            issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Count started lookups into `counter` instead of a private one.
    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.issued = counter;
        self
    }

    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    /// Look up `group_id` at every seqno in `seqnos`.
    ///
    /// Returns results sorted by seqno, or the first error encountered.
    pub async fn run(
        &self,
        group_id: &GroupId,
        seqnos: Vec<Seqno>,
        cancel: &CancellationToken,
    ) -> Result<Vec<ProbeResult>, AuditError> {
        let total = seqnos.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        if cancel.is_cancelled() {
            return Err(AuditError::Cancelled("cancelled before probing".to_string()));
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(seqnos)));
        let stop = cancel.child_token();
        // Room for every result, so a worker never blocks on a collector that has given up.
        let (tx, mut rx) = mpsc::channel::<WorkerMessage>(total);

        let mut workers = JoinSet::new();
        for _ in 0..self.parallelism.min(total) {
            let queue = Arc::clone(&queue);
            let index = Arc::clone(&self.index);
            let issued = Arc::clone(&self.issued);
            let group_id = group_id.clone();
            let stop = stop.clone();
            let tx = tx.clone();

            workers.spawn(async move {
                loop {
                    let next = queue
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .pop_front();
                    let Some(seqno) = next else {
                        break;
                    };

                    let outcome = tokio::select! {
                        biased;
                        _ = stop.cancelled() => break,
                        outcome = async {
                            // Counted only once the lookup actually starts.
                            issued.fetch_add(1, Ordering::Relaxed);
                            index.lookup_leaf_at_seqno(&group_id, seqno).await
                        } => outcome,
                    };

                    let failed = outcome.is_err();
                    if tx.send((seqno, outcome)).await.is_err() || failed {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut results = Vec::with_capacity(total);
        while results.len() < total {
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    stop.cancel();
                    debug!(group_id = %group_id, answered = results.len(), total, "probing cancelled by caller");
                    return Err(AuditError::Cancelled("cancelled while probing".to_string()));
                }
                received = rx.recv() => received,
            };

            let Some((seqno, outcome)) = received else {
                // Every worker exited without delivering all results (a worker panicked).
                stop.cancel();
                return Err(AuditError::lookup("probe workers exited before answering every probe"));
            };

            match outcome.and_then(|lookup| validate(group_id, seqno, lookup)) {
                Ok(result) => results.push(result),
                Err(e) => {
                    stop.cancel();
                    workers.abort_all();
                    let e = e.at_probe(seqno);
                    warn!(group_id = %group_id, merkle_seqno = %seqno, error = %e, "probe failed, abandoning remaining probes");
                    return Err(e);
                }
            }
        }

        results.sort_by_key(|result| result.merkle_seqno);
        Ok(results)
    }
}

/// Reject answers for a different state or group than the one asked about.
fn validate(group_id: &GroupId, seqno: Seqno, lookup: LeafLookup) -> Result<ProbeResult, AuditError> {
    if lookup.root.seqno != seqno {
        return Err(AuditError::lookup(format!(
            "index answered with root {} for probe {seqno}",
            lookup.root.seqno
        )));
    }
    if let Some(leaf) = &lookup.leaf {
        if &leaf.group_id != group_id {
            return Err(AuditError::lookup(format!(
                "index answered with a leaf for {} instead of {group_id}",
                leaf.group_id
            )));
        }
    }
    Ok(ProbeResult {
        merkle_seqno: seqno,
        leaf: lookup.leaf,
        root: lookup.root,
    })
}
