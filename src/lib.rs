//! # Bank Reconciliation Core
//!
//! Reconciles imported bank transactions against outstanding invoices and
//! bills owned by an external accounting ledger.
//!
//! ## Features
//!
//! - **Canonicalization**: parser rows become typed transactions with normalized counterparty and reference
//! - **Idempotent import**: fingerprint or bank id deduplication enforced at the store
//! - **Heuristic matching**: weighted amount, reference, counterparty and date scoring with explanations
//! - **Safe settlement**: guarded, compensated application and reversal against the ledger
//! - **Storage abstraction**: trait-based store and ledger seams with in-memory implementations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bank_reconciliation_core::{
//!     utils::{MemoryLedger, MemoryStore},
//!     RawRow, ReconcileConfig, Reconciler,
//! };
//!
//! # async fn run() -> bank_reconciliation_core::ReconcileResult<()> {
//! let reconciler = Reconciler::new(
//!     MemoryStore::new(),
//!     MemoryLedger::new(),
//!     ReconcileConfig::default(),
//! )?;
//!
//! let rows = vec![RawRow::new("2024-03-10", "1500.00", "Payment INV-2024-007", "EUR")];
//! let batch = reconciler.import_batch("tenant", "main-account", &rows).await?;
//! let summary = reconciler.auto_match("tenant", "main-account").await?;
//! println!("{} imported, {} matched", batch.imported, summary.matched);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod reconciliation;
pub mod traits;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use config::*;
pub use reconciliation::*;
pub use traits::*;
pub use types::*;
