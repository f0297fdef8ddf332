//! Consistency checker.
//!
//! Cross-checks three sets of `(global seqno, chain seqno)` samples: the
//! local chain's own anchors, the leaves probed by this audit, and the
//! observations kept from earlier audits.
//!
//! 1. Monotonicity: ordered by global seqno, chain seqno never decreases,
//!    and two index answers for the same global seqno agree. A violation
//!    means the server rewound or forked the group's visible history.
//! 2. Identity: every probed leaf names the link the local chain holds at
//!    that position, and links verified by earlier audits are unchanged.
//!
//! Monotonicity runs first; once positions disagree, comparing link IDs at
//! those positions says nothing new.

use std::collections::BTreeMap;

use tracing::debug;

use chainwatch_types::errors::AuditError;
use chainwatch_types::model::{AuditHistory, ChainSnapshot, GroupId, LeafTail, LinkId, Seqno};

use crate::executor::ProbeResult;

/// Tie-break order at equal global seqno: the chain's anchors come first, so
/// an index answer at a link's own anchor must already include that link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Source {
    Chain,
    History,
    Probe,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    merkle_seqno: Seqno,
    source: Source,
    chain_seqno: Seqno,
}

/// What a passing check learned, to be folded into the group's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckOutcome {
    /// Global seqno to chain seqno, as the index reported.
    pub observations: Vec<(Seqno, Seqno)>,
    /// Chain seqno to link ID confirmed by the index.
    pub verified_links: Vec<(Seqno, LinkId)>,
}

/// Check probed leaves against the local chain and prior observations.
pub fn check(
    group_id: &GroupId,
    is_public: bool,
    chain: &ChainSnapshot,
    probes: &[ProbeResult],
    history: Option<&AuditHistory>,
) -> Result<CheckOutcome, AuditError> {
    let observed: Vec<(Seqno, Option<LeafTail>)> = probes
        .iter()
        .map(|probe| {
            let tail = probe
                .leaf
                .as_ref()
                .and_then(|leaf| leaf.tail(is_public))
                .copied();
            (probe.merkle_seqno, tail)
        })
        .collect();

    check_monotonic(group_id, chain, &observed, history)?;
    let verified_links = check_identity(group_id, chain, &observed, history)?;

    Ok(CheckOutcome {
        observations: observed
            .iter()
            .map(|(merkle_seqno, tail)| (*merkle_seqno, tail_seqno(tail)))
            .collect(),
        verified_links,
    })
}

fn tail_seqno(tail: &Option<LeafTail>) -> Seqno {
    tail.map(|t| t.seqno).unwrap_or(Seqno::ZERO)
}

fn rollback(group_id: &GroupId, at: Sample, prior: Sample) -> AuditError {
    AuditError::Rollback {
        group_id: group_id.clone(),
        merkle_seqno: at.merkle_seqno,
        chain_seqno: at.chain_seqno,
        prior_merkle_seqno: prior.merkle_seqno,
        prior_chain_seqno: prior.chain_seqno,
    }
}

fn check_monotonic(
    group_id: &GroupId,
    chain: &ChainSnapshot,
    observed: &[(Seqno, Option<LeafTail>)],
    history: Option<&AuditHistory>,
) -> Result<(), AuditError> {
    let mut samples: Vec<Sample> = chain
        .links()
        .iter()
        .map(|link| Sample {
            merkle_seqno: link.merkle_seqno,
            source: Source::Chain,
            chain_seqno: link.seqno,
        })
        .collect();

    if let Some(history) = history {
        samples.extend(history.observations.iter().map(|(merkle_seqno, chain_seqno)| Sample {
            merkle_seqno: *merkle_seqno,
            source: Source::History,
            chain_seqno: *chain_seqno,
        }));
    }
    samples.extend(observed.iter().map(|(merkle_seqno, tail)| Sample {
        merkle_seqno: *merkle_seqno,
        source: Source::Probe,
        chain_seqno: tail_seqno(tail),
    }));

    samples.sort_by_key(|s| (s.merkle_seqno, s.source, s.chain_seqno));

    // The index must give one answer per global state, across audits too.
    let mut answers: BTreeMap<Seqno, Sample> = BTreeMap::new();
    for sample in samples.iter().filter(|s| s.source != Source::Chain) {
        match answers.get(&sample.merkle_seqno) {
            Some(prior) if prior.chain_seqno != sample.chain_seqno => {
                return Err(rollback(group_id, *sample, *prior));
            }
            Some(_) => {}
            None => {
                answers.insert(sample.merkle_seqno, *sample);
            }
        }
    }

    let mut highest: Option<Sample> = None;
    for sample in samples {
        match highest {
            Some(prior) if sample.chain_seqno < prior.chain_seqno => {
                return Err(rollback(group_id, sample, prior));
            }
            Some(prior) if sample.chain_seqno == prior.chain_seqno => {}
            _ => highest = Some(sample),
        }
    }
    Ok(())
}

fn check_identity(
    group_id: &GroupId,
    chain: &ChainSnapshot,
    observed: &[(Seqno, Option<LeafTail>)],
    history: Option<&AuditHistory>,
) -> Result<Vec<(Seqno, LinkId)>, AuditError> {
    let mut verified = Vec::with_capacity(observed.len());

    for (merkle_seqno, tail) in observed {
        let Some(tail) = tail else {
            continue;
        };
        let Some(link) = chain.link(tail.seqno) else {
            // The index is ahead of this (stale) local chain; nothing local to compare.
            debug!(
                group_id = %group_id,
                merkle_seqno = %merkle_seqno,
                chain_seqno = %tail.seqno,
                last_seqno = %chain.last_seqno(),
                "index tail beyond local chain, skipping identity check"
            );
            continue;
        };
        if link.link_id != tail.link_id {
            return Err(AuditError::LinkIdMismatch {
                group_id: group_id.clone(),
                chain_seqno: tail.seqno,
                merkle_seqno: *merkle_seqno,
                expected: link.link_id,
                found: tail.link_id,
            });
        }
        verified.push((tail.seqno, tail.link_id));
    }

    if let Some(history) = history {
        for (seqno, link_id) in &history.verified_links {
            let Some(link) = chain.link(*seqno) else {
                continue;
            };
            if link.link_id != *link_id {
                return Err(AuditError::LinkIdMismatch {
                    group_id: group_id.clone(),
                    chain_seqno: *seqno,
                    merkle_seqno: link.merkle_seqno,
                    expected: *link_id,
                    found: link.link_id,
                });
            }
        }
    }

    Ok(verified)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainwatch_types::model::{ChainLink, MerkleLeaf, MerkleRoot};

    fn link_id(n: u64) -> LinkId {
        LinkId::digest(format!("link-{n}").as_bytes())
    }

    /// Chain of `len` links, link `n` anchored at global seqno `10 * n`.
    fn chain(len: u64) -> ChainSnapshot {
        ChainSnapshot::new(
            (1..=len)
                .map(|n| ChainLink {
                    seqno: Seqno(n),
                    link_id: link_id(n),
                    merkle_seqno: Seqno(10 * n),
                })
                .collect(),
        )
        .unwrap()
    }

    fn probe(merkle_seqno: u64, chain_seqno: u64, id: LinkId) -> ProbeResult {
        ProbeResult {
            merkle_seqno: Seqno(merkle_seqno),
            leaf: Some(MerkleLeaf {
                group_id: GroupId::new("g"),
                private: Some(LeafTail {
                    seqno: Seqno(chain_seqno),
                    link_id: id,
                }),
                public: None,
            }),
            root: MerkleRoot::fetched_now(Seqno(merkle_seqno)),
        }
    }

    /// Honest probe at link `n`'s anchor.
    fn honest(n: u64) -> ProbeResult {
        probe(10 * n, n, link_id(n))
    }

    fn gid() -> GroupId {
        GroupId::new("g")
    }

    #[test]
    fn test_consistent_probes_pass() {
        let chain = chain(5);
        let probes = vec![honest(1), honest(3), honest(5)];
        let outcome = check(&gid(), false, &chain, &probes, None).unwrap();

        assert_eq!(
            outcome.observations,
            vec![(Seqno(10), Seqno(1)), (Seqno(30), Seqno(3)), (Seqno(50), Seqno(5))]
        );
        assert_eq!(outcome.verified_links.len(), 3);
    }

    #[test]
    fn test_flipped_link_id_is_mismatch() {
        let chain = chain(3);
        let mut bytes = *link_id(2).as_bytes();
        bytes[0] ^= 0xff;
        let probes = vec![honest(1), probe(20, 2, LinkId::from_bytes(bytes))];

        let err = check(&gid(), false, &chain, &probes, None).unwrap_err();
        assert!(matches!(
            err,
            AuditError::LinkIdMismatch { chain_seqno: Seqno(2), merkle_seqno: Seqno(20), .. }
        ));
        assert!(err.to_string().contains("linkID mismatch"));
    }

    #[test]
    fn test_decreasing_probes_are_rollback() {
        let chain = chain(5);
        // Later global state reports an earlier chain position.
        let probes = vec![probe(30, 4, link_id(4)), probe(40, 3, link_id(3))];

        let err = check(&gid(), false, &chain, &probes, None).unwrap_err();
        assert!(err.to_string().contains("rollback"), "unexpected: {err}");
        assert!(matches!(err, AuditError::Rollback { .. }));
    }

    #[test]
    fn test_inflated_seqno_is_rollback_against_chain_anchors() {
        let chain = chain(3);
        // Index claims seqno 6 at link 1's anchor; link 2 anchors later at seqno 2.
        let probes = vec![probe(10, 6, link_id(1)), probe(20, 7, link_id(2))];

        let err = check(&gid(), false, &chain, &probes, None).unwrap_err();
        assert_eq!(
            err,
            AuditError::Rollback {
                group_id: gid(),
                merkle_seqno: Seqno(20),
                chain_seqno: Seqno(2),
                prior_merkle_seqno: Seqno(10),
                prior_chain_seqno: Seqno(6),
            }
        );
    }

    #[test]
    fn test_index_missing_anchored_link_is_rollback() {
        let chain = chain(3);
        // At link 3's anchor the index still shows link 2.
        let probes = vec![probe(30, 2, link_id(2))];
        let err = check(&gid(), false, &chain, &probes, None).unwrap_err();
        assert!(matches!(
            err,
            AuditError::Rollback { merkle_seqno: Seqno(30), chain_seqno: Seqno(2), .. }
        ));
    }

    #[test]
    fn test_absent_leaf_is_rollback() {
        let chain = chain(2);
        let probes = vec![ProbeResult {
            merkle_seqno: Seqno(20),
            leaf: None,
            root: MerkleRoot::fetched_now(Seqno(20)),
        }];
        let err = check(&gid(), false, &chain, &probes, None).unwrap_err();
        assert!(matches!(err, AuditError::Rollback { chain_seqno: Seqno::ZERO, .. }));
    }

    #[test]
    fn test_wrong_visibility_side_is_absent() {
        let chain = chain(1);
        // Only a private tail exists, but the public chain is audited.
        let err = check(&gid(), true, &chain, &[honest(1)], None).unwrap_err();
        assert!(err.is_tamper_evidence());
    }

    #[test]
    fn test_stale_local_chain_passes() {
        // Local chain stops at 3; the index already has 5 at link 3's anchor
        // because links 4 and 5 landed in the same global state.
        let chain = chain(3);
        let probes = vec![honest(2), probe(30, 5, LinkId::digest(b"unknown"))];
        let outcome = check(&gid(), false, &chain, &probes, None).unwrap();
        assert_eq!(outcome.verified_links, vec![(Seqno(2), link_id(2))]);
    }

    #[test]
    fn test_history_observation_catches_later_rewind() {
        let chain = chain(4);
        let mut history = AuditHistory::new(gid(), false);
        history.record_observations([(Seqno(35), Seqno(4))]);

        // Index now claims link 3 at a later state than the earlier observation of 4.
        let probes = vec![probe(36, 3, link_id(3))];
        let err = check(&gid(), false, &chain, &probes, Some(&history)).unwrap_err();
        assert!(matches!(
            err,
            AuditError::Rollback { prior_merkle_seqno: Seqno(35), prior_chain_seqno: Seqno(4), .. }
        ));
    }

    #[test]
    fn test_conflicting_answers_for_same_state_are_rollback() {
        let chain = chain(3);
        let mut history = AuditHistory::new(gid(), false);
        history.record_observations([(Seqno(20), Seqno(2))]);

        let probes = vec![probe(20, 3, link_id(3))];
        let err = check(&gid(), false, &chain, &probes, Some(&history)).unwrap_err();
        assert!(matches!(err, AuditError::Rollback { merkle_seqno: Seqno(20), .. }));
    }

    #[test]
    fn test_previously_verified_link_changed_is_mismatch() {
        let chain = chain(3);
        let mut history = AuditHistory::new(gid(), false);
        history.record_verified_links([(Seqno(2), LinkId::digest(b"forked"))]);

        let err = check(&gid(), false, &chain, &[honest(3)], Some(&history)).unwrap_err();
        assert!(matches!(err, AuditError::LinkIdMismatch { chain_seqno: Seqno(2), .. }));
    }

    #[test]
    fn test_shared_anchor_requires_latest_link() {
        // Links 1 and 2 both anchored at seqno 10.
        let links = vec![
            ChainLink {
                seqno: Seqno(1),
                link_id: link_id(1),
                merkle_seqno: Seqno(10),
            },
            ChainLink {
                seqno: Seqno(2),
                link_id: link_id(2),
                merkle_seqno: Seqno(10),
            },
        ];
        let chain = ChainSnapshot::new(links).unwrap();

        check(&gid(), false, &chain, &[probe(10, 2, link_id(2))], None).unwrap();
        assert!(check(&gid(), false, &chain, &[probe(10, 1, link_id(1))], None).is_err());
    }
}
