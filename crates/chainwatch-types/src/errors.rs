use crate::model::{GroupId, LinkId, Seqno};

/// Unified error type for chainwatch.
///
/// `LinkIdMismatch` and `Rollback` are tamper evidence: the index and the
/// locally held chain disagree in a way an honest server cannot produce.
/// Callers must stop trusting the group's chain when they see one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuditError {
    /// The index recorded a different link at a chain position than the local chain holds.
    #[error(
        "group chain linkID mismatch for {group_id} at chain seqno {chain_seqno} \
         (merkle seqno {merkle_seqno}): expected {expected}, index has {found}"
    )]
    LinkIdMismatch {
        group_id: GroupId,
        chain_seqno: Seqno,
        merkle_seqno: Seqno,
        expected: LinkId,
        found: LinkId,
    },

    /// Chain position regressed while the global seqno advanced.
    #[error(
        "group chain rollback for {group_id}: merkle seqno {merkle_seqno} shows chain seqno \
         {chain_seqno}, but merkle seqno {prior_merkle_seqno} already showed {prior_chain_seqno}"
    )]
    Rollback {
        group_id: GroupId,
        merkle_seqno: Seqno,
        chain_seqno: Seqno,
        prior_merkle_seqno: Seqno,
        prior_chain_seqno: Seqno,
    },

    /// The index collaborator could not answer (network, timeout, bad response).
    #[error("index lookup failed{}: {reason}", probe_suffix(.merkle_seqno))]
    LookupFailure {
        /// Probe seqno the failure came from, when it came from a probe.
        merkle_seqno: Option<Seqno>,
        reason: String,
    },

    /// The caller cancelled the audit or its deadline passed.
    #[error("audit cancelled: {0}")]
    Cancelled(String),

    /// The caller supplied a chain that breaks numbering or anchoring rules.
    #[error("invalid chain: {0}")]
    InvalidChain(String),

    /// The chain claims anchors the trusted root does not yet cover.
    #[error("trusted root at merkle seqno {root} is behind chain anchor {anchor}")]
    RootBehindChain { root: Seqno, anchor: Seqno },

    /// Error from configuration loading or validation.
    #[error("config error: {0}")]
    Config(String),

    /// Serialization or deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

fn probe_suffix(merkle_seqno: &Option<Seqno>) -> String {
    match merkle_seqno {
        Some(seqno) => format!(" at merkle seqno {seqno}"),
        None => String::new(),
    }
}

/// Coarse classification of an [`AuditError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditErrorKind {
    LinkIdMismatch,
    Rollback,
    LookupFailure,
    Cancelled,
    InvalidInput,
    Internal,
}

impl AuditError {
    pub fn lookup(reason: impl Into<String>) -> Self {
        AuditError::LookupFailure {
            merkle_seqno: None,
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> AuditErrorKind {
        match self {
            AuditError::LinkIdMismatch { .. } => AuditErrorKind::LinkIdMismatch,
            AuditError::Rollback { .. } => AuditErrorKind::Rollback,
            AuditError::LookupFailure { .. } => AuditErrorKind::LookupFailure,
            AuditError::Cancelled(_) => AuditErrorKind::Cancelled,
            AuditError::InvalidChain(_) | AuditError::RootBehindChain { .. } => {
                AuditErrorKind::InvalidInput
            }
            AuditError::Config(_) | AuditError::Serialization(_) => AuditErrorKind::Internal,
        }
    }

    /// Whether this error is evidence the server altered group history.
    pub fn is_tamper_evidence(&self) -> bool {
        matches!(
            self.kind(),
            AuditErrorKind::LinkIdMismatch | AuditErrorKind::Rollback
        )
    }

    /// Whether the caller may simply retry the audit later.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), AuditErrorKind::LookupFailure)
    }

    /// Attach the probe seqno to a lookup failure that lacks one.
    pub fn at_probe(self, seqno: Seqno) -> Self {
        match self {
            AuditError::LookupFailure {
                merkle_seqno: None,
                reason,
            } => AuditError::LookupFailure {
                merkle_seqno: Some(seqno),
                reason,
            },
            other => other,
        }
    }
}

impl From<serde_json::Error> for AuditError {
    fn from(err: serde_json::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for AuditError {
    fn from(err: serde_yaml::Error) -> Self {
        AuditError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tamper_classification() {
        let rollback = AuditError::Rollback {
            group_id: GroupId::new("g"),
            merkle_seqno: Seqno(9),
            chain_seqno: Seqno(2),
            prior_merkle_seqno: Seqno(7),
            prior_chain_seqno: Seqno(3),
        };
        assert!(rollback.is_tamper_evidence());
        assert!(!rollback.is_retryable());
        assert!(rollback.to_string().contains("rollback"));

        let lookup = AuditError::lookup("connection reset");
        assert!(!lookup.is_tamper_evidence());
        assert!(lookup.is_retryable());
        assert_eq!(AuditError::Cancelled("stop".into()).kind(), AuditErrorKind::Cancelled);
    }

    #[test]
    fn test_mismatch_message_names_link_ids() {
        let err = AuditError::LinkIdMismatch {
            group_id: GroupId::new("g"),
            chain_seqno: Seqno(2),
            merkle_seqno: Seqno(5),
            expected: LinkId::from_bytes([1; 32]),
            found: LinkId::from_bytes([2; 32]),
        };
        assert!(err.to_string().contains("linkID mismatch"));
        assert!(err.to_string().contains(&"01".repeat(32)));
    }

    #[test]
    fn test_at_probe_tags_only_untagged_lookups() {
        let tagged = AuditError::lookup("timeout").at_probe(Seqno(4));
        assert_eq!(
            tagged,
            AuditError::LookupFailure {
                merkle_seqno: Some(Seqno(4)),
                reason: "timeout".to_string()
            }
        );
        assert!(tagged.to_string().contains("at merkle seqno 4"));

        let retagged = tagged.clone().at_probe(Seqno(9));
        assert_eq!(retagged, tagged);

        let cancelled = AuditError::Cancelled("x".into()).at_probe(Seqno(1));
        assert_eq!(cancelled.kind(), AuditErrorKind::Cancelled);
    }
}
