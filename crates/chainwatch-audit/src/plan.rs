//! Probe selection.
//!
//! Splits the chain into the range earlier audits verified and the range
//! this audit newly certifies, samples each without replacement, and maps
//! every sampled link to the global-index seqno to look up.

use std::collections::BTreeSet;

use rand::Rng;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{ChainLink, ChainSnapshot, MerkleRoot, Seqno};

/// Which part of the chain a probe samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbePhase {
    /// Spot re-check of already-verified history.
    Pre,
    /// Newly reachable history this audit certifies.
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedProbe {
    pub chain_seqno: Seqno,
    /// Global seqno to look the group up at.
    pub merkle_seqno: Seqno,
    pub phase: ProbePhase,
}

/// The probes one audit will run, ordered by chain seqno.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbePlan {
    pub probes: Vec<PlannedProbe>,
}

impl ProbePlan {
    /// Distinct global seqnos to look up, ascending. Links anchored at the
    /// same global seqno share a lookup.
    pub fn merkle_seqnos(&self) -> Vec<Seqno> {
        self.probes
            .iter()
            .map(|probe| probe.merkle_seqno)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn count(&self, phase: ProbePhase) -> usize {
        self.probes.iter().filter(|probe| probe.phase == phase).count()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }
}

/// Global seqno at which to probe for `link`.
///
/// The smallest global seqno that already reflects the link and is covered
/// by the trusted root: the link's anchor itself, inclusive on both ends.
/// An anchor past the root is an error rather than a clamp, since a clamped
/// probe would land on a state that predates the link.
pub fn probe_seqno_for(link: &ChainLink, root: &MerkleRoot) -> Result<Seqno, AuditError> {
    if link.merkle_seqno > root.seqno {
        return Err(AuditError::RootBehindChain {
            root: root.seqno,
            anchor: link.merkle_seqno,
        });
    }
    Ok(link.merkle_seqno)
}

/// Sample up to `count` distinct values from `start..=end`, ascending.
///
/// Ranges no larger than `count` are taken whole.
fn sample_range<R: Rng + ?Sized>(start: u64, end: u64, count: usize, rng: &mut R) -> Vec<u64> {
    if start > end || count == 0 {
        return Vec::new();
    }
    let len = end - start + 1;
    match usize::try_from(len) {
        Ok(len) if len > count => {
            let mut picked: Vec<u64> = rand::seq::index::sample(rng, len, count)
                .into_iter()
                .map(|i| start + i as u64)
                .collect();
            picked.sort_unstable();
            picked
        }
        _ if len <= count as u64 => (start..=end).collect(),
        // Longer than usize can index: sample offsets directly.
        _ => {
            let mut picked = BTreeSet::new();
            while picked.len() < count {
                picked.insert(rng.gen_range(start..=end));
            }
            picked.into_iter().collect()
        }
    }
}

/// Build the probe plan for one audit.
///
/// `verified_through` is the watermark of the last successful audit (zero
/// if none); it is clipped to the chain's own tail when the local chain is
/// behind it.
pub fn plan_probes<R: Rng + ?Sized>(
    chain: &ChainSnapshot,
    verified_through: Seqno,
    root: &MerkleRoot,
    num_pre_probes: usize,
    num_post_probes: usize,
    rng: &mut R,
) -> Result<ProbePlan, AuditError> {
    let last = chain.last_seqno().get();
    let verified = verified_through.get().min(last);

    let pre = sample_range(1, verified, num_pre_probes, rng);
    let post = sample_range(verified + 1, last, num_post_probes, rng);

    let mut probes = Vec::with_capacity(pre.len() + post.len());
    for (phase, seqnos) in [(ProbePhase::Pre, pre), (ProbePhase::Post, post)] {
        for seqno in seqnos {
            let link = chain.link(Seqno(seqno)).ok_or_else(|| {
                AuditError::InvalidChain(format!("chain has no link at sampled seqno {seqno}"))
            })?;
            probes.push(PlannedProbe {
                chain_seqno: link.seqno,
                merkle_seqno: probe_seqno_for(link, root)?,
                phase,
            });
        }
    }

    Ok(ProbePlan { probes })
}
