//! Traits for the external ledger, persistence and row validation

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use num_traits::Zero;

use crate::types::*;

/// Read-side query surface and settlement API of the accounting ledger.
///
/// Obligations are owned by the ledger. The reconciliation core only reads
/// snapshots and changes balances through `record_settlement` /
/// `restore_settlement`, never by mutating an `Obligation` it holds.
#[async_trait]
pub trait ObligationSource: Send + Sync {
    /// List obligations of one direction that are still owed and due inside `window`
    async fn list_outstanding_obligations(
        &self,
        tenant_id: &str,
        direction: ObligationType,
        window: DateWindow,
    ) -> ReconcileResult<Vec<Obligation>>;

    /// Get a single obligation by ID
    async fn get_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> ReconcileResult<Option<Obligation>>;

    /// Decrement the amount due, guarded by `amount_due >= amount`.
    ///
    /// Fails with `InsufficientObligationBalance` when the guard does not hold.
    async fn record_settlement(&self, obligation_id: &str, amount: &BigDecimal)
        -> ReconcileResult<()>;

    /// Give back an amount previously recorded with `record_settlement`
    async fn restore_settlement(
        &self,
        obligation_id: &str,
        amount: &BigDecimal,
    ) -> ReconcileResult<()>;
}

/// Transactional store for transactions, settlements and import batches.
///
/// Every method is a single atomic unit. Uniqueness and conditional updates
/// are enforced here, at the point of durable write, so that concurrent
/// callers are serialized by the store rather than by in-memory checks.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Insert a transaction unless one with the same `(tenant_id, account_id, dedup_key)` exists
    async fn insert_transaction_if_absent(
        &self,
        transaction: &Transaction,
    ) -> ReconcileResult<InsertOutcome>;

    /// Get a transaction by ID
    async fn get_transaction(&self, transaction_id: &str) -> ReconcileResult<Option<Transaction>>;

    /// List an account's transactions, optionally restricted to some states
    async fn list_transactions(
        &self,
        tenant_id: &str,
        account_id: &str,
        states: &[TransactionState],
    ) -> ReconcileResult<Vec<Transaction>>;

    /// Move a transaction between UNMATCHED and SUGGESTED if it is still in `from`.
    ///
    /// Returns `false` when the transaction was no longer in `from`.
    async fn transition_state(
        &self,
        transaction_id: &str,
        from: TransactionState,
        to: TransactionState,
    ) -> ReconcileResult<bool>;

    /// Append an application record and decrement the transaction's unsettled
    /// amount by `amount_applied + write_off`, guarded by `state != MATCHED`
    /// and `unsettled >= amount_applied + write_off`.
    /// The transaction becomes MATCHED when nothing remains unsettled.
    async fn commit_settlement(&self, settlement: &Settlement) -> ReconcileResult<Transaction>;

    /// Claim an application for reversal and return it.
    ///
    /// At most one claim per settlement can be outstanding. Fails with
    /// `AlreadyReversed` when the settlement is reversed or already claimed.
    async fn begin_reversal(&self, settlement_id: &str) -> ReconcileResult<Settlement>;

    /// Drop a claim taken by `begin_reversal` without reversing
    async fn release_reversal(&self, settlement_id: &str) -> ReconcileResult<()>;

    /// Append a reversal record and give its amount back to the transaction,
    /// guarded by the original settlement not having been reversed yet.
    /// Clears any reversal claim. The transaction returns to UNMATCHED.
    async fn commit_reversal(&self, reversal: &Settlement) -> ReconcileResult<Transaction>;

    /// Get a settlement record by ID
    async fn get_settlement(&self, settlement_id: &str) -> ReconcileResult<Option<Settlement>>;

    /// All settlement records (applications and reversals) for a transaction, oldest first
    async fn list_settlements(&self, transaction_id: &str) -> ReconcileResult<Vec<Settlement>>;

    /// Persist the audit record of an import
    async fn save_import_batch(&self, batch: &ImportBatch) -> ReconcileResult<()>;

    /// Get an import batch by ID
    async fn get_import_batch(&self, batch_id: &str) -> ReconcileResult<Option<ImportBatch>>;

    /// Find an earlier import of the same rows into the same account
    async fn find_import_batch_by_checksum(
        &self,
        tenant_id: &str,
        account_id: &str,
        checksum: &str,
    ) -> ReconcileResult<Option<ImportBatch>>;
}

/// Trait for implementing custom import validation rules
pub trait RowValidator: Send + Sync {
    /// Validate a raw row before it is parsed
    fn validate_row(&self, row: &RawRow) -> ReconcileResult<()>;

    /// Validate the canonical transaction built from a row
    fn validate_transaction(&self, transaction: &Transaction) -> ReconcileResult<()>;
}

/// Default row validator with basic rules
pub struct DefaultRowValidator;

impl RowValidator for DefaultRowValidator {
    fn validate_row(&self, row: &RawRow) -> ReconcileResult<()> {
        if row.date.trim().is_empty() {
            return Err(ReconcileError::InvalidRow("Date is missing".to_string()));
        }

        if row.amount.trim().is_empty() {
            return Err(ReconcileError::InvalidRow("Amount is missing".to_string()));
        }

        Ok(())
    }

    fn validate_transaction(&self, transaction: &Transaction) -> ReconcileResult<()> {
        if transaction.amount.is_zero() {
            return Err(ReconcileError::InvalidRow(
                "Zero amount cannot settle anything".to_string(),
            ));
        }

        Ok(())
    }
}
