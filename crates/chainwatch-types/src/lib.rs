/// Shared types, traits, and errors for the chainwatch group-chain auditor.
///
/// This crate is the foundation that the other chainwatch crates depend on.
/// It contains:
/// - **Trait contracts** (`traits`) for the index, root, and chain collaborators
/// - **Shared data types** (`model`) for chains, merkle roots, leaves, and audit records
/// - **Error types** (`errors`) for unified error handling
/// - **Config types** (`config`, `config_loader`) for audit parameters
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod model;
pub mod traits;

// Re-export commonly used types at the crate root for convenience.
pub use config::AuditParams;
pub use errors::{AuditError, AuditErrorKind};
pub use model::*;
pub use traits::*;
