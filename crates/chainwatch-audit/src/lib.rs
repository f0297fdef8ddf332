/// Group-chain auditing for the chainwatch framework.
///
/// Verifies that a group's signature chain is faithfully reflected in the
/// global merkle index:
/// - **Auditor**: Per-group serialized audits, commit only on success
/// - **Cache**: Bounded LRU of per-group audit history
/// - **Checker**: Link-identity and rollback detection over probe answers
/// - **Executor**: Bounded-parallel, fail-fast, cancellable index lookups
/// - **Gatekeeper**: Root freshness and merkle-movement throttling
/// - **Locks**: Bounded table of per-group audit locks
/// - **Plan**: Pre/post probe sampling over the chain
pub mod auditor;
pub mod cache;
pub mod checker;
pub mod executor;
pub mod gatekeeper;
pub mod locks;
pub mod plan;

pub use auditor::{AuditContext, Auditor};
pub use cache::AuditCache;
pub use gatekeeper::{AuditReason, GateDecision, Gatekeeper};
