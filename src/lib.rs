//! mirrorsync - streaming reconciliation for hierarchical storage
//!
//! Computes the difference between two independently produced, ascending
//! listings (object-store prefixes or filesystem trees) and applies a
//! bounded set of copy/remove tasks under operator policy, on an adaptive
//! parallel executor with memory-aware admission.
//!
//! The entry point is [`mirror::prepare_reconciliation`]; backends plug in
//! through the [`endpoint::StorageEndpoint`] contract.

pub mod cancel;
pub mod diff;
pub mod endpoint;
pub mod error;
pub mod mirror;
pub mod scheduler;
pub mod types;

pub use cancel::CancelToken;
pub use error::{MirrorError, Result};
pub use mirror::{prepare_reconciliation, MirrorPolicy, ReconcileSummary, Reconciliation};
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
