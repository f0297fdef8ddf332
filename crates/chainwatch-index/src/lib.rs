/// Index-side components for the chainwatch auditor.
///
/// In-process stand-ins for the global merkle index and its clients:
/// - **Memory**: Append-only in-memory index with per-seqno leaf history
/// - **Roots**: Root provider that reuses a recently fetched root
/// - **Tamper**: Lookup adapter that corrupts answers, for fault injection
/// - **Chain**: Chain builder that publishes links and records their anchors
pub mod chain;
pub mod memory;
pub mod roots;
pub mod tamper;

pub use chain::{ChainBuilder, ChainStore};
pub use memory::MemoryIndex;
pub use roots::CachedRootProvider;
pub use tamper::TamperingIndex;
