//! Main reconciler that drives imports, matching passes and settlements

use bigdecimal::BigDecimal;
use num_traits::Signed;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::ReconcileConfig;
use crate::reconciliation::canonicalize::Canonicalizer;
use crate::reconciliation::dedup::{batch_checksum, DedupOutcome, Deduplicator};
use crate::reconciliation::matcher::{CandidateScope, MatchOutcome, Matcher};
use crate::reconciliation::settlement::{SettlementApplier, SettlementRequest};
use crate::traits::*;
use crate::types::*;
use crate::utils::validate_identifier;

/// Reconciliation system that orchestrates import, matching and settlement
pub struct Reconciler<S: ReconciliationStore, L: ObligationSource> {
    store: Arc<S>,
    ledger: Arc<L>,
    config: ReconcileConfig,
    canonicalizer: Canonicalizer,
    matcher: Matcher,
    applier: SettlementApplier<S, L>,
}

impl<S: ReconciliationStore, L: ObligationSource> Reconciler<S, L> {
    /// Create a new reconciler owning its store and ledger
    pub fn new(store: S, ledger: L, config: ReconcileConfig) -> ReconcileResult<Self> {
        Self::with_shared(Arc::new(store), Arc::new(ledger), config)
    }

    /// Create a new reconciler over a store and ledger shared with other callers
    pub fn with_shared(
        store: Arc<S>,
        ledger: Arc<L>,
        config: ReconcileConfig,
    ) -> ReconcileResult<Self> {
        config.validate()?;

        Ok(Self {
            canonicalizer: Canonicalizer::new(&config.import),
            matcher: Matcher::new(config.matching.clone()),
            applier: SettlementApplier::new(store.clone(), ledger.clone())
                .with_write_off_limit(config.matching.amount_epsilon.clone()),
            store,
            ledger,
            config,
        })
    }

    /// Replace the row validator used during import
    pub fn with_validator(mut self, validator: Box<dyn RowValidator>) -> Self {
        self.canonicalizer = Canonicalizer::with_validator(&self.config.import, validator);
        self
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    // Import operations
    /// Import parsed rows into an account
    pub async fn import_batch(
        &self,
        tenant_id: &str,
        account_id: &str,
        rows: &[RawRow],
    ) -> ReconcileResult<ImportBatchResult> {
        let never_cancelled = AtomicBool::new(false);
        self.import_batch_cancellable(tenant_id, account_id, rows, &never_cancelled)
            .await
    }

    /// Import parsed rows, stopping between rows once `cancel` is set.
    ///
    /// Rows committed before cancellation stay committed; the result and the
    /// stored batch are flagged as cancelled.
    pub async fn import_batch_cancellable(
        &self,
        tenant_id: &str,
        account_id: &str,
        rows: &[RawRow],
        cancel: &AtomicBool,
    ) -> ReconcileResult<ImportBatchResult> {
        validate_identifier("Tenant ID", tenant_id)?;
        validate_identifier("Account ID", account_id)?;

        let checksum = batch_checksum(rows);
        if let Some(previous) = self
            .store
            .find_import_batch_by_checksum(tenant_id, account_id, &checksum)
            .await?
        {
            tracing::info!(
                tenant_id,
                account_id,
                previous_batch_id = %previous.id,
                "Identical batch was imported before; rows will be reported as duplicates"
            );
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut dedup = Deduplicator::new(self.store.as_ref());
        let mut result = ImportBatchResult {
            batch_id: batch_id.clone(),
            imported: 0,
            duplicates: 0,
            errors: Vec::new(),
            cancelled: false,
            transaction_ids: Vec::new(),
        };

        for (row_index, row) in rows.iter().enumerate() {
            if cancel.load(Ordering::SeqCst) {
                tracing::warn!(
                    tenant_id,
                    account_id,
                    batch_id = %batch_id,
                    row_index,
                    "Import cancelled"
                );
                result.cancelled = true;
                break;
            }

            let admitted = match self
                .canonicalizer
                .canonicalize(tenant_id, account_id, &batch_id, row)
            {
                Ok(transaction) => dedup.admit(transaction).await,
                Err(e) => Err(e),
            };

            match admitted {
                Ok(DedupOutcome::Imported { transaction_id }) => {
                    result.imported += 1;
                    result.transaction_ids.push(transaction_id);
                }
                Ok(DedupOutcome::Duplicate { .. }) => result.duplicates += 1,
                Err(e) => {
                    tracing::debug!(row_index, error = %e, "Row rejected");
                    result.errors.push(RowError {
                        row_index,
                        message: e.to_string(),
                    });
                }
            }
        }

        self.store
            .save_import_batch(&ImportBatch {
                id: batch_id,
                tenant_id: tenant_id.to_string(),
                account_id: account_id.to_string(),
                source_checksum: checksum,
                imported_at: chrono::Utc::now().naive_utc(),
                imported: result.imported,
                duplicates: result.duplicates,
                errors: result.errors.len(),
                cancelled: result.cancelled,
            })
            .await?;

        tracing::info!(
            tenant_id,
            account_id,
            batch_id = %result.batch_id,
            imported = result.imported,
            duplicates = result.duplicates,
            errors = result.errors.len(),
            cancelled = result.cancelled,
            "Import batch finished"
        );

        Ok(result)
    }

    // Matching operations
    /// Ranked candidates for one transaction, highest confidence first.
    ///
    /// Cross-currency obligations are included (capped and flagged) when the
    /// configuration allows it. A fully settled transaction has no suggestions.
    pub async fn get_suggestions(
        &self,
        transaction_id: &str,
    ) -> ReconcileResult<Vec<MatchSuggestion>> {
        let transaction = self.require_transaction(transaction_id).await?;
        let Some(direction) = transaction.direction() else {
            return Ok(Vec::new());
        };
        if transaction.state == TransactionState::Matched {
            return Ok(Vec::new());
        }

        let window = self.matcher.search_window(transaction.posted_date);
        let snapshot = self
            .fetch_snapshot(&transaction.tenant_id, direction, window)
            .await?;

        let scope = if self.config.matching.include_cross_currency {
            CandidateScope::IncludeCrossCurrency
        } else {
            CandidateScope::SameCurrency
        };

        let mut ranked = self.matcher.rank(&transaction, &snapshot, scope);
        ranked.truncate(self.config.matching.max_suggestions);
        Ok(ranked)
    }

    /// Run the matcher over every open transaction in an account.
    ///
    /// Unique, exact, same-currency candidates above the threshold are settled
    /// automatically; candidates in the suggestion band move the transaction to
    /// SUGGESTED; transactions without candidates end up UNMATCHED. If the
    /// ledger is unavailable the pass is aborted before anything changes.
    pub async fn auto_match(
        &self,
        tenant_id: &str,
        account_id: &str,
    ) -> ReconcileResult<AutoMatchSummary> {
        let mut open: Vec<Transaction> = self
            .store
            .list_transactions(
                tenant_id,
                account_id,
                &[TransactionState::Unmatched, TransactionState::Suggested],
            )
            .await?
            .into_iter()
            .filter(|tx| tx.direction().is_some() && tx.unsettled_amount.is_positive())
            .collect();
        open.sort_by_key(|tx| tx.posted_date);

        let mut receivables = self
            .snapshot_for(tenant_id, ObligationType::Receivable, &open)
            .await?;
        let mut payables = self
            .snapshot_for(tenant_id, ObligationType::Payable, &open)
            .await?;

        let mut summary = AutoMatchSummary::default();
        for transaction in &open {
            let snapshot = match transaction.direction() {
                Some(ObligationType::Receivable) => &mut receivables,
                Some(ObligationType::Payable) => &mut payables,
                None => continue,
            };

            let ranked =
                self.matcher
                    .rank(transaction, snapshot.as_slice(), CandidateScope::SameCurrency);

            match self.matcher.classify(&ranked) {
                MatchOutcome::AutoMatch(candidates) => {
                    let settled = self
                        .settle_first(transaction, &candidates, snapshot.as_mut_slice())
                        .await;
                    match settled {
                        Some(settlement) => {
                            let fully_settled =
                                settlement.transaction_amount() == transaction.unsettled_amount;
                            summary.settlement_ids.push(settlement.id);
                            if fully_settled {
                                summary.matched += 1;
                            } else {
                                summary.unmatched += 1;
                            }
                        }
                        None => {
                            self.mark_suggested(transaction).await?;
                            summary.suggested += 1;
                        }
                    }
                }
                MatchOutcome::Suggest(_) => {
                    self.mark_suggested(transaction).await?;
                    summary.suggested += 1;
                }
                MatchOutcome::NoCandidate => {
                    if transaction.state == TransactionState::Suggested {
                        self.store
                            .transition_state(
                                &transaction.id,
                                TransactionState::Suggested,
                                TransactionState::Unmatched,
                            )
                            .await?;
                    }
                    summary.unmatched += 1;
                }
            }
        }

        tracing::info!(
            tenant_id,
            account_id,
            matched = summary.matched,
            suggested = summary.suggested,
            unmatched = summary.unmatched,
            "Auto-match pass finished"
        );

        Ok(summary)
    }

    /// Manually reject pending suggestions: SUGGESTED -> UNMATCHED
    pub async fn dismiss_suggestions(&self, transaction_id: &str) -> ReconcileResult<Transaction> {
        let moved = self
            .store
            .transition_state(
                transaction_id,
                TransactionState::Suggested,
                TransactionState::Unmatched,
            )
            .await?;
        if !moved {
            return Err(ReconcileError::Validation(format!(
                "Transaction {} has no pending suggestions",
                transaction_id
            )));
        }

        self.require_transaction(transaction_id).await
    }

    // Settlement operations
    /// Apply a transaction amount against an obligation in the same currency
    pub async fn apply_match(
        &self,
        transaction_id: &str,
        obligation_id: &str,
        amount: BigDecimal,
        actor: Actor,
    ) -> ReconcileResult<Settlement> {
        self.applier
            .apply(SettlementRequest::new(
                transaction_id,
                obligation_id,
                amount,
                actor,
            ))
            .await
    }

    /// Apply a match across currencies. Only a named user may do this.
    pub async fn apply_cross_currency_match(
        &self,
        transaction_id: &str,
        obligation_id: &str,
        amount: BigDecimal,
        actor: Actor,
    ) -> ReconcileResult<Settlement> {
        self.applier
            .apply(
                SettlementRequest::new(transaction_id, obligation_id, amount, actor)
                    .allowing_cross_currency(),
            )
            .await
    }

    /// Reverse a settlement, returning the transaction to UNMATCHED
    pub async fn reverse_settlement(
        &self,
        settlement_id: &str,
        actor: Actor,
    ) -> ReconcileResult<Settlement> {
        self.applier.reverse(settlement_id, actor).await
    }

    // Queries
    /// Get a transaction by ID
    pub async fn get_transaction(
        &self,
        transaction_id: &str,
    ) -> ReconcileResult<Option<Transaction>> {
        self.store.get_transaction(transaction_id).await
    }

    /// List an account's transactions; an empty state filter lists all
    pub async fn list_transactions(
        &self,
        tenant_id: &str,
        account_id: &str,
        states: &[TransactionState],
    ) -> ReconcileResult<Vec<Transaction>> {
        self.store
            .list_transactions(tenant_id, account_id, states)
            .await
    }

    /// Settlement history of a transaction, oldest first
    pub async fn list_settlements(&self, transaction_id: &str) -> ReconcileResult<Vec<Settlement>> {
        self.store.list_settlements(transaction_id).await
    }

    /// Get the audit record of an import
    pub async fn get_import_batch(&self, batch_id: &str) -> ReconcileResult<Option<ImportBatch>> {
        self.store.get_import_batch(batch_id).await
    }

    async fn require_transaction(&self, transaction_id: &str) -> ReconcileResult<Transaction> {
        self.store
            .get_transaction(transaction_id)
            .await?
            .ok_or_else(|| ReconcileError::TransactionNotFound(transaction_id.to_string()))
    }

    /// Fetch outstanding obligations, degrading to an empty snapshot on timeout
    async fn fetch_snapshot(
        &self,
        tenant_id: &str,
        direction: ObligationType,
        window: DateWindow,
    ) -> ReconcileResult<Vec<Obligation>> {
        let budget = Duration::from_millis(self.config.import.snapshot_timeout_ms);
        let fetch = self
            .ledger
            .list_outstanding_obligations(tenant_id, direction, window);

        match tokio::time::timeout(budget, fetch).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(
                    tenant_id,
                    ?direction,
                    timeout_ms = self.config.import.snapshot_timeout_ms,
                    "Obligation snapshot timed out; treating as no candidates"
                );
                Ok(Vec::new())
            }
        }
    }

    /// One snapshot covering the search windows of every transaction of a direction
    async fn snapshot_for(
        &self,
        tenant_id: &str,
        direction: ObligationType,
        transactions: &[Transaction],
    ) -> ReconcileResult<Vec<Obligation>> {
        let window = transactions
            .iter()
            .filter(|tx| tx.direction() == Some(direction))
            .map(|tx| self.matcher.search_window(tx.posted_date))
            .reduce(|a, b| a.union(&b));

        match window {
            Some(window) => self.fetch_snapshot(tenant_id, direction, window).await,
            None => Ok(Vec::new()),
        }
    }

    /// Try candidates in order until one settles; keeps the snapshot current.
    ///
    /// Candidates are exact within the amount epsilon, so a transaction
    /// residue left after covering the obligation is written off with it.
    async fn settle_first(
        &self,
        transaction: &Transaction,
        candidates: &[MatchSuggestion],
        snapshot: &mut [Obligation],
    ) -> Option<Settlement> {
        for candidate in candidates {
            let amount = if candidate.obligation_amount_due < transaction.unsettled_amount {
                candidate.obligation_amount_due.clone()
            } else {
                transaction.unsettled_amount.clone()
            };

            let residue = &transaction.unsettled_amount - &amount;
            let request = SettlementRequest::new(
                &transaction.id,
                &candidate.obligation_id,
                amount,
                Actor::Auto,
            )
            .absorbing(residue);
            match self.applier.apply(request).await {
                Ok(settlement) => {
                    if let Some(obligation) = snapshot
                        .iter_mut()
                        .find(|o| o.id == candidate.obligation_id)
                    {
                        obligation.amount_due -= &settlement.amount_applied;
                    }
                    return Some(settlement);
                }
                Err(e) => {
                    tracing::warn!(
                        transaction_id = %transaction.id,
                        obligation_id = %candidate.obligation_id,
                        error = %e,
                        "Automatic settlement rejected, trying next candidate"
                    );
                }
            }
        }

        None
    }

    async fn mark_suggested(&self, transaction: &Transaction) -> ReconcileResult<()> {
        if transaction.state == TransactionState::Unmatched {
            let moved = self
                .store
                .transition_state(
                    &transaction.id,
                    TransactionState::Unmatched,
                    TransactionState::Suggested,
                )
                .await?;
            if !moved {
                tracing::debug!(
                    transaction_id = %transaction.id,
                    "Transaction changed state during the pass; leaving it as is"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MatchConfig;
    use crate::utils::{EnhancedRowValidator, MemoryLedger, MemoryStore};
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn amount(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    fn receivable(id: &str, name: &str, due: &str, currency: &str, day: u32) -> Obligation {
        Obligation::new(
            id.to_string(),
            "t1".to_string(),
            name.to_string(),
            currency.to_string(),
            amount(due),
            NaiveDate::from_ymd_opt(2024, 3, day).unwrap(),
            None,
            ObligationType::Receivable,
        )
    }

    fn reconciler(ledger: MemoryLedger) -> Reconciler<MemoryStore, MemoryLedger> {
        Reconciler::new(MemoryStore::new(), ledger, ReconcileConfig::default()).unwrap()
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ReconcileConfig {
            matching: MatchConfig {
                date_window_days: 0,
                ..MatchConfig::default()
            },
            ..ReconcileConfig::default()
        };
        assert!(Reconciler::new(MemoryStore::new(), MemoryLedger::new(), config).is_err());
    }

    #[tokio::test]
    async fn test_import_reports_row_errors_without_aborting() {
        let reconciler = reconciler(MemoryLedger::new());
        let rows = vec![
            RawRow::new("2024-03-10", "12.50", "Coffee", "EUR"),
            RawRow::new("not a date", "12.50", "Coffee", "EUR"),
            RawRow::new("2024-03-11", "0.00", "Nothing", "EUR"),
            RawRow::new("2024-03-12", "-40.00", "Fuel", "EUR"),
        ];

        let result = reconciler.import_batch("t1", "acc", &rows).await.unwrap();

        assert_eq!(result.imported, 2);
        assert_eq!(result.duplicates, 0);
        let failed: Vec<usize> = result.errors.iter().map(|e| e.row_index).collect();
        assert_eq!(failed, vec![1, 2]);

        let batch = reconciler
            .get_import_batch(&result.batch_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(batch.imported, 2);
        assert_eq!(batch.errors, 2);
        assert!(!batch.cancelled);
    }

    #[tokio::test]
    async fn test_custom_validator_applies_to_import() {
        let reconciler =
            reconciler(MemoryLedger::new()).with_validator(Box::new(EnhancedRowValidator));
        let rows = vec![RawRow::new("2024-03-10", "12.50", "  ", "EUR")];

        let result = reconciler.import_batch("t1", "acc", &rows).await.unwrap();
        assert_eq!(result.imported, 0);
        assert_eq!(result.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected() {
        let reconciler = reconciler(MemoryLedger::new());
        let result = reconciler.import_batch("t1", "bad account", &[]).await;
        assert!(matches!(result, Err(ReconcileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_suggestions_are_truncated_and_ranked() {
        let ledger = MemoryLedger::new();
        for (i, day) in [1u32, 2, 3, 4, 5, 6, 7].iter().enumerate() {
            ledger
                .add_obligation(receivable(&format!("inv{}", i), "Acme", "99.00", "EUR", *day))
                .unwrap();
        }
        let reconciler = Reconciler::new(
            MemoryStore::new(),
            ledger,
            ReconcileConfig {
                matching: MatchConfig {
                    max_suggestions: 3,
                    ..MatchConfig::default()
                },
                ..ReconcileConfig::default()
            },
        )
        .unwrap();

        let rows =
            vec![RawRow::new("2024-03-10", "99.00", "Payment", "EUR").with_counterparty("Acme")];
        let imported = reconciler.import_batch("t1", "acc", &rows).await.unwrap();

        let suggestions = reconciler
            .get_suggestions(&imported.transaction_ids[0])
            .await
            .unwrap();
        assert_eq!(suggestions.len(), 3);
        assert!(suggestions
            .windows(2)
            .all(|w| w[0].confidence >= w[1].confidence));
        assert_eq!(suggestions[0].obligation_id, "inv6");
    }

    #[tokio::test]
    async fn test_dismiss_suggestions() {
        let ledger = MemoryLedger::new();
        ledger
            .add_obligation(receivable("inv1", "Baltic Commerce", "250.00", "EUR", 1))
            .unwrap();
        ledger
            .add_obligation(receivable("inv2", "Baltic Commerce", "250.00", "EUR", 5))
            .unwrap();
        let reconciler = reconciler(ledger);

        let rows = vec![RawRow::new("2024-03-10", "250.00", "Payment", "EUR")
            .with_counterparty("Baltic Commerce")];
        let imported = reconciler.import_batch("t1", "acc", &rows).await.unwrap();
        let tx_id = &imported.transaction_ids[0];

        let summary = reconciler.auto_match("t1", "acc").await.unwrap();
        assert_eq!(summary.suggested, 1);

        let dismissed = reconciler.dismiss_suggestions(tx_id).await.unwrap();
        assert_eq!(dismissed.state, TransactionState::Unmatched);

        let again = reconciler.dismiss_suggestions(tx_id).await;
        assert!(matches!(again, Err(ReconcileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_snapshot_timeout_degrades_to_no_candidates() {
        let ledger = MemoryLedger::new().with_latency(Duration::from_millis(200));
        ledger
            .add_obligation(receivable("inv1", "Acme", "10.00", "EUR", 10))
            .unwrap();
        let mut config = ReconcileConfig::default();
        config.import.snapshot_timeout_ms = 20;
        let reconciler = Reconciler::new(MemoryStore::new(), ledger, config).unwrap();

        let rows = vec![RawRow::new("2024-03-10", "10.00", "Acme", "EUR")];
        let imported = reconciler.import_batch("t1", "acc", &rows).await.unwrap();

        let suggestions = reconciler
            .get_suggestions(&imported.transaction_ids[0])
            .await
            .unwrap();
        assert!(suggestions.is_empty());

        let summary = reconciler.auto_match("t1", "acc").await.unwrap();
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.matched, 0);
    }

    #[tokio::test]
    async fn test_matched_transaction_has_no_suggestions() {
        let ledger = MemoryLedger::new();
        ledger
            .add_obligation(receivable("inv1", "Acme", "10.00", "EUR", 10))
            .unwrap();
        let reconciler = reconciler(ledger);
        let rows = vec![RawRow::new("2024-03-10", "10.00", "Acme", "EUR")];
        let imported = reconciler.import_batch("t1", "acc", &rows).await.unwrap();
        let tx_id = &imported.transaction_ids[0];

        reconciler
            .apply_match(tx_id, "inv1", amount("10.00"), Actor::user("ann"))
            .await
            .unwrap();

        assert!(reconciler.get_suggestions(tx_id).await.unwrap().is_empty());
    }
}
