//! Bank transaction reconciliation: import, deduplication, matching and settlement

pub mod canonicalize;
pub mod core;
pub mod dedup;
pub mod matcher;
pub mod settlement;

pub use canonicalize::Canonicalizer;
pub use self::core::Reconciler;
pub use dedup::{batch_checksum, compute_fingerprint, DedupOutcome, Deduplicator};
pub use matcher::{CandidateScope, MatchOutcome, Matcher};
pub use settlement::{SettlementApplier, SettlementRequest};
