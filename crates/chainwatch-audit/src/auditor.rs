//! Group-chain auditor.
//!
//! Orchestrates one audit per call:
//! 1. Take the group's audit lock
//! 2. Load the cached audit history
//! 3. Ask the gatekeeper whether an audit is due (refreshing a stale root first)
//! 4. Plan probes over verified and newly reachable history
//! 5. Run them on the bounded probe executor
//! 6. Cross-check the answers with the consistency checker
//! 7. On success, append an audit record and commit the history to the cache
//!
//! A failed or cancelled audit leaves the cache exactly as it was, so the
//! next attempt starts again from the same verified floor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chainwatch_types::config::AuditParams;
use chainwatch_types::errors::AuditError;
use chainwatch_types::model::*;
use chainwatch_types::traits::{ChainProvider, GroupAuditor, IndexLookup, RootProvider};

use crate::cache::AuditCache;
use crate::checker::{self, CheckOutcome};
use crate::executor::ProbeExecutor;
use crate::gatekeeper::{AuditReason, GateDecision, Gatekeeper};
use crate::locks::GroupLocks;
use crate::plan::{plan_probes, ProbePhase};

/// Cancellation and deadline for one audit call.
#[derive(Debug, Clone, Default)]
pub struct AuditContext {
    cancel: CancellationToken,
    deadline: Option<tokio::time::Instant>,
}

impl AuditContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that gives up `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(tokio::time::Instant::now() + timeout),
        }
    }

    /// Context driven by an existing cancellation token.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Audits group chains against the global merkle index.
pub struct Auditor {
    index: Arc<dyn IndexLookup>,
    roots: Arc<dyn RootProvider>,
    cache: AuditCache,
    locks: GroupLocks,
    params: watch::Receiver<AuditParams>,
    /// Present when this auditor owns its params rather than following a loader.
    params_tx: Option<watch::Sender<AuditParams>>,
    rng: Mutex<StdRng>,
    probes_issued: Arc<AtomicU64>,
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("cached_groups", &self.cache.len())
            .field("probes_issued", &self.probes_issued())
            .finish()
    }
}

impl Auditor {
    /// Create an auditor with fixed params (overridable via [`Auditor::set_params`]).
    pub fn new(
        params: AuditParams,
        index: Arc<dyn IndexLookup>,
        roots: Arc<dyn RootProvider>,
    ) -> Self {
        let (tx, rx) = watch::channel(params);
        Self::build(rx, Some(tx), index, roots)
    }

    /// Create an auditor that follows params published by a config loader.
    ///
    /// Cache and lock-table capacities are taken from the params current at
    /// construction; later changes apply to probing and gating only.
    pub fn with_params_watch(
        params: watch::Receiver<AuditParams>,
        index: Arc<dyn IndexLookup>,
        roots: Arc<dyn RootProvider>,
    ) -> Self {
        Self::build(params, None, index, roots)
    }

    fn build(
        params: watch::Receiver<AuditParams>,
        params_tx: Option<watch::Sender<AuditParams>>,
        index: Arc<dyn IndexLookup>,
        roots: Arc<dyn RootProvider>,
    ) -> Self {
        let (cache, locks, rng) = {
            let current = params.borrow();
            let rng = match current.rng_seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            (
                AuditCache::new(current.lru_size),
                GroupLocks::new(current.lock_table_size),
                rng,
            )
        };
        Self {
            index,
            roots,
            cache,
            locks,
            params,
            params_tx,
            rng: Mutex::new(rng),
            probes_issued: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Params the next audit will use.
    pub fn params(&self) -> AuditParams {
        self.params.borrow().clone()
    }

    /// Replace the params for subsequent audits.
    ///
    /// Fails for auditors that follow a config loader; change the file instead.
    pub fn set_params(&self, params: AuditParams) -> Result<(), AuditError> {
        match &self.params_tx {
            Some(tx) => {
                tx.send_replace(params);
                Ok(())
            }
            None => Err(AuditError::Config(
                "audit params are managed by a config loader".to_string(),
            )),
        }
    }

    /// Total index lookups started by this auditor.
    pub fn probes_issued(&self) -> u64 {
        self.probes_issued.load(Ordering::Relaxed)
    }

    /// The group's cached audit history, without auditing or touching recency.
    pub fn history(&self, group_id: &GroupId) -> Option<AuditHistory> {
        self.cache.peek(group_id).map(|history| (*history).clone())
    }

    /// The group's cached audit history as pretty JSON, for operational tooling.
    pub fn export_history(&self, group_id: &GroupId) -> Result<Option<String>, AuditError> {
        match self.cache.peek(group_id) {
            Some(history) => Ok(Some(serde_json::to_string_pretty(&*history)?)),
            None => Ok(None),
        }
    }

    /// Load a group's chain from `chains`, fetch the current root, and audit.
    pub async fn audit_from_provider(
        &self,
        ctx: &AuditContext,
        group_id: &GroupId,
        is_public: bool,
        chains: &dyn ChainProvider,
        mode: AuditMode,
    ) -> Result<AuditRecord, AuditError> {
        let cancel = ctx.cancel.child_token();
        let (chain, root) = run_guarded(ctx, &cancel, async {
            let chain = chains.load_chain(group_id, is_public).await?;
            let root = self.roots.current_trusted_root().await?;
            Ok((chain, root))
        })
        .await?;
        self.audit(ctx, group_id, is_public, &chain, &root, mode).await
    }

    /// Audit `chain` for `group_id` against the index as of `trusted_root`.
    ///
    /// Returns the group's newest audit record: a new one when an audit ran,
    /// the cached one when the gatekeeper skipped. Tamper evidence comes back
    /// as [`AuditError::LinkIdMismatch`] or [`AuditError::Rollback`].
    pub async fn audit(
        &self,
        ctx: &AuditContext,
        group_id: &GroupId,
        is_public: bool,
        chain: &ChainSnapshot,
        trusted_root: &MerkleRoot,
        mode: AuditMode,
    ) -> Result<AuditRecord, AuditError> {
        let cancel = ctx.cancel.child_token();
        let work = self.audit_serialized(&cancel, group_id, is_public, chain, trusted_root, mode);

        let result = run_guarded(ctx, &cancel, work).await;

        if let Err(e) = &result {
            if e.is_tamper_evidence() {
                warn!(group_id = %group_id, is_public, error = %e, "group chain audit found tamper evidence");
            } else {
                debug!(group_id = %group_id, is_public, error = %e, "group chain audit failed");
            }
        }
        result
    }

    async fn audit_serialized(
        &self,
        cancel: &CancellationToken,
        group_id: &GroupId,
        is_public: bool,
        chain: &ChainSnapshot,
        trusted_root: &MerkleRoot,
        mode: AuditMode,
    ) -> Result<AuditRecord, AuditError> {
        let _guard = self.locks.lock(group_id).await;
        let params = self.params();

        let cached = self.cache.get(group_id).filter(|history| {
            if history.public != is_public {
                warn!(
                    group_id = %group_id,
                    cached_public = history.public,
                    is_public,
                    "cached audit history is for the other visibility, ignoring it"
                );
                return false;
            }
            true
        });
        let history = cached.as_deref();
        let last = history.and_then(AuditHistory::last);

        if mode == AuditMode::JustCreated && history.is_none() && chain.last_seqno() == Seqno(1) {
            ensure_root_covers(chain, trusted_root)?;
            debug!(group_id = %group_id, "recording audit for freshly created group without probing");
            return Ok(self.commit(
                group_id,
                is_public,
                history,
                chain,
                trusted_root,
                Vec::new(),
                CheckOutcome::default(),
                mode,
            ));
        }

        let gate = Gatekeeper::new(&params);
        let mut root = trusted_root.clone();
        let decision = match mode {
            AuditMode::Force => GateDecision::Audit(AuditReason::Forced),
            AuditMode::Standard | AuditMode::JustCreated => {
                match gate.should_audit(last, &root, Utc::now()) {
                    GateDecision::RefreshRoot => {
                        let fresh = self.roots.root_as_of_time(params.root_freshness()).await?;
                        debug!(
                            group_id = %group_id,
                            stale_seqno = %root.seqno,
                            fresh_seqno = %fresh.seqno,
                            "refreshed stale merkle root before gating"
                        );
                        root = root.newer(fresh);
                        gate.should_audit_refreshed(last, &root)
                    }
                    decision => decision,
                }
            }
        };

        let reason = match (decision, last) {
            (GateDecision::Audit(reason), _) => reason,
            (_, Some(last)) => {
                debug!(
                    group_id = %group_id,
                    root_seqno = %root.seqno,
                    last_root_seqno = %last.observed_root_seqno,
                    "merkle index has not moved enough, skipping audit"
                );
                return Ok(last.clone());
            }
            // Skip and refresh are never returned without history.
            (_, None) => AuditReason::NoHistory,
        };

        ensure_root_covers(chain, &root)?;

        let verified_through = history.map(AuditHistory::max_chain_seqno).unwrap_or(Seqno::ZERO);
        let plan = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            plan_probes(
                chain,
                verified_through,
                &root,
                params.num_pre_probes,
                params.num_post_probes,
                &mut *rng,
            )?
        };
        debug!(
            group_id = %group_id,
            ?reason,
            verified_through = %verified_through,
            last_seqno = %chain.last_seqno(),
            pre_probes = plan.count(ProbePhase::Pre),
            post_probes = plan.count(ProbePhase::Post),
            "running group chain audit"
        );

        let merkle_seqnos = plan.merkle_seqnos();
        let executor = ProbeExecutor::new(Arc::clone(&self.index), params.parallelism)
            .with_counter(Arc::clone(&self.probes_issued));
        let results = executor.run(group_id, merkle_seqnos.clone(), cancel).await?;

        let outcome = checker::check(group_id, is_public, chain, &results, history)?;

        Ok(self.commit(
            group_id,
            is_public,
            history,
            chain,
            &root,
            merkle_seqnos,
            outcome,
            mode,
        ))
    }

    /// Append a record for a passed audit and publish the new history.
    #[allow(clippy::too_many_arguments)]
    fn commit(
        &self,
        group_id: &GroupId,
        is_public: bool,
        previous: Option<&AuditHistory>,
        chain: &ChainSnapshot,
        root: &MerkleRoot,
        probes: Vec<Seqno>,
        outcome: CheckOutcome,
        mode: AuditMode,
    ) -> AuditRecord {
        let mut history = previous
            .cloned()
            .unwrap_or_else(|| AuditHistory::new(group_id.clone(), is_public));

        let probe_count = probes.len();
        history.push(AuditRecord {
            id: Uuid::new_v4(),
            max_chain_seqno: chain.last_seqno(),
            observed_root_seqno: root.seqno,
            completed_at: Utc::now(),
            probes,
            mode,
        });
        history.record_observations(outcome.observations);
        history.record_verified_links(outcome.verified_links);

        // push() never leaves the history empty.
        let record = history.records[history.records.len() - 1].clone();
        info!(
            group_id = %group_id,
            is_public,
            max_chain_seqno = %record.max_chain_seqno,
            root_seqno = %record.observed_root_seqno,
            probes = probe_count,
            "group chain audit passed"
        );
        self.cache.put(group_id.clone(), history);
        record
    }
}

/// Run `work` until it finishes, the context is cancelled, or its deadline passes.
async fn run_guarded<T>(
    ctx: &AuditContext,
    cancel: &CancellationToken,
    work: impl Future<Output = Result<T, AuditError>>,
) -> Result<T, AuditError> {
    let guarded = async {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AuditError::Cancelled("audit cancelled by caller".to_string())),
            result = work => result,
        }
    };

    match ctx.deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, guarded).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                Err(AuditError::Cancelled("audit deadline exceeded".to_string()))
            }
        },
        None => guarded.await,
    }
}

/// A root can only vouch for links it already covers.
fn ensure_root_covers(chain: &ChainSnapshot, root: &MerkleRoot) -> Result<(), AuditError> {
    if chain.head_merkle_seqno() > root.seqno {
        return Err(AuditError::RootBehindChain {
            root: root.seqno,
            anchor: chain.head_merkle_seqno(),
        });
    }
    Ok(())
}

#[async_trait]
impl GroupAuditor for Auditor {
    async fn audit_group(
        &self,
        group_id: &GroupId,
        is_public: bool,
        chain: &ChainSnapshot,
        trusted_root: &MerkleRoot,
        mode: AuditMode,
    ) -> Result<AuditRecord, AuditError> {
        self.audit(&AuditContext::new(), group_id, is_public, chain, trusted_root, mode)
            .await
    }

    fn audit_history(&self, group_id: &GroupId) -> Option<AuditHistory> {
        self.history(group_id)
    }
}
