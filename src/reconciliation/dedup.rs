//! Fingerprinting and duplicate rejection for imported transactions.
//!
//! Duplicates are rejected by the store's `(tenant_id, account_id, dedup_key)`
//! uniqueness at insertion time, so concurrent imports of overlapping files
//! cannot both insert the same real-world event.

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::traits::ReconciliationStore;
use crate::types::*;

/// Computes the content fingerprint of a transaction.
///
/// SHA-256 over tenant id, account id, posted date, amount (trailing zeros removed),
/// currency and the normalized description.
pub fn compute_fingerprint(
    tenant_id: &str,
    account_id: &str,
    posted_date: NaiveDate,
    amount: &BigDecimal,
    currency: &str,
    normalized_description: &str,
) -> String {
    let mut hasher = Sha256::new();

    hasher.update(tenant_id.as_bytes());
    hasher.update(b"|");
    hasher.update(account_id.as_bytes());
    hasher.update(b"|");
    hasher.update(posted_date.format("%Y-%m-%d").to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(amount.normalized().to_string().as_bytes());
    hasher.update(b"|");
    hasher.update(currency.to_uppercase().as_bytes());
    hasher.update(b"|");
    hasher.update(normalized_description.as_bytes());

    hex::encode(hasher.finalize())
}

/// Checksum of a submitted batch: SHA-256 over every row, in order
pub fn batch_checksum(rows: &[RawRow]) -> String {
    let mut hasher = Sha256::new();

    for row in rows {
        for field in [
            Some(row.date.as_str()),
            Some(row.amount.as_str()),
            Some(row.description.as_str()),
            row.currency.as_deref(),
            row.reference.as_deref(),
            row.counterparty.as_deref(),
            row.external_id.as_deref(),
        ] {
            hasher.update(field.unwrap_or("").as_bytes());
            hasher.update(b"\x1f");
        }
        hasher.update(b"\x1e");
    }

    hex::encode(hasher.finalize())
}

/// Result of admitting one canonical transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupOutcome {
    /// Stored as a new transaction
    Imported { transaction_id: String },
    /// Already present in the account; skipped
    Duplicate { existing_id: String },
}

/// Admits transactions of one batch into the store.
///
/// Identical rows inside one batch are distinct events (two equal card
/// payments on the same day), so each repeat of a fingerprint gets an
/// occurrence suffix. The numbering depends only on row order, which keeps
/// re-imports of the same file idempotent.
pub struct Deduplicator<'a, S: ReconciliationStore + ?Sized> {
    store: &'a S,
    occurrences: HashMap<String, u32>,
}

impl<'a, S: ReconciliationStore + ?Sized> Deduplicator<'a, S> {
    pub fn new(store: &'a S) -> Self {
        Self {
            store,
            occurrences: HashMap::new(),
        }
    }

    /// Assign the final fingerprint and insert unless already present
    pub async fn admit(&mut self, mut transaction: Transaction) -> ReconcileResult<DedupOutcome> {
        if transaction.external_id.is_none() {
            let seen = self
                .occurrences
                .entry(transaction.fingerprint.clone())
                .or_insert(0);
            *seen += 1;
            if *seen > 1 {
                transaction.fingerprint = format!("{}:{}", transaction.fingerprint, seen);
            }
        }

        match self.store.insert_transaction_if_absent(&transaction).await? {
            InsertOutcome::Inserted => Ok(DedupOutcome::Imported {
                transaction_id: transaction.id,
            }),
            InsertOutcome::Duplicate { existing_id } => {
                tracing::debug!(
                    account_id = %transaction.account_id,
                    dedup_key = %transaction.dedup_key(),
                    existing_id = %existing_id,
                    "Skipping duplicate transaction"
                );
                Ok(DedupOutcome::Duplicate { existing_id })
            }
        }
    }
}
