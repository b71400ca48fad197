//! Settlement application and reversal

use bigdecimal::BigDecimal;
use num_traits::{Signed, Zero};
use std::sync::Arc;

use crate::traits::*;
use crate::types::*;
use crate::utils::validate_positive_amount;

/// Parameters for applying a transaction against an obligation
#[derive(Debug, Clone)]
pub struct SettlementRequest {
    pub transaction_id: String,
    pub obligation_id: String,
    pub amount: BigDecimal,
    pub actor: Actor,
    /// Explicit user override of a currency mismatch; refused for `Actor::Auto`
    pub allow_cross_currency: bool,
    /// Transaction residue closed alongside `amount` but not applied to the obligation
    pub write_off: BigDecimal,
}

impl SettlementRequest {
    pub fn new(
        transaction_id: &str,
        obligation_id: &str,
        amount: BigDecimal,
        actor: Actor,
    ) -> Self {
        Self {
            transaction_id: transaction_id.to_string(),
            obligation_id: obligation_id.to_string(),
            amount,
            actor,
            allow_cross_currency: false,
            write_off: BigDecimal::zero(),
        }
    }

    pub fn allowing_cross_currency(mut self) -> Self {
        self.allow_cross_currency = true;
        self
    }

    /// Also close `residue` of the transaction, up to the applier's write-off limit
    pub fn absorbing(mut self, residue: BigDecimal) -> Self {
        self.write_off = residue;
        self
    }
}

/// Applies and reverses settlements.
///
/// Each operation makes one guarded call to the ledger and one atomic commit
/// to the store. When the commit is rejected, the ledger call is compensated
/// before the error is returned, so obligations and the settlement table never
/// drift apart. No lock is held across the ledger call.
pub struct SettlementApplier<S: ReconciliationStore, L: ObligationSource> {
    store: Arc<S>,
    ledger: Arc<L>,
    max_write_off: BigDecimal,
}

impl<S: ReconciliationStore, L: ObligationSource> SettlementApplier<S, L> {
    /// Create a new settlement applier that accepts no write-offs
    pub fn new(store: Arc<S>, ledger: Arc<L>) -> Self {
        Self {
            store,
            ledger,
            max_write_off: BigDecimal::zero(),
        }
    }

    /// Accept write-offs up to `limit` per settlement
    pub fn with_write_off_limit(mut self, limit: BigDecimal) -> Self {
        self.max_write_off = limit;
        self
    }

    /// Apply part or all of a transaction against an obligation
    pub async fn apply(&self, request: SettlementRequest) -> ReconcileResult<Settlement> {
        validate_positive_amount(&request.amount)?;
        if request.write_off.is_negative() || request.write_off > self.max_write_off {
            return Err(ReconcileError::InvalidAmount(format!(
                "Write-off {} outside the accepted range [0, {}]",
                request.write_off, self.max_write_off
            )));
        }

        let transaction = self
            .store
            .get_transaction(&request.transaction_id)
            .await?
            .ok_or_else(|| ReconcileError::TransactionNotFound(request.transaction_id.clone()))?;

        if transaction.state == TransactionState::Matched {
            return Err(ReconcileError::AlreadySettled(transaction.id));
        }

        let settled = &request.amount + &request.write_off;
        if settled > transaction.unsettled_amount {
            return Err(ReconcileError::InvalidAmount(format!(
                "Amount {} exceeds unsettled amount {} of transaction {}",
                settled, transaction.unsettled_amount, transaction.id
            )));
        }

        let obligation = self
            .ledger
            .get_obligation(&transaction.tenant_id, &request.obligation_id)
            .await?
            .ok_or_else(|| ReconcileError::ObligationNotFound(request.obligation_id.clone()))?;

        if transaction.direction() != Some(obligation.obligation_type) {
            return Err(ReconcileError::Validation(format!(
                "Transaction {} cannot settle {:?} obligation {}",
                transaction.id, obligation.obligation_type, obligation.id
            )));
        }

        let cross_currency = transaction.currency != obligation.currency;
        if cross_currency && (!request.allow_cross_currency || request.actor.is_auto()) {
            return Err(ReconcileError::CrossCurrencyNotAllowed {
                transaction_currency: transaction.currency.clone(),
                obligation_currency: obligation.currency.clone(),
            });
        }

        if request.amount > obligation.amount_due {
            return Err(ReconcileError::InsufficientObligationBalance {
                obligation_id: obligation.id.clone(),
                requested: request.amount.clone(),
                remaining: obligation.amount_due.clone(),
            });
        }

        self.ledger
            .record_settlement(&obligation.id, &request.amount)
            .await?;

        let settlement = Settlement::application(
            &transaction,
            &obligation.id,
            request.amount.clone(),
            request.actor.clone(),
            cross_currency,
        )
        .with_write_off(request.write_off.clone());

        match self.store.commit_settlement(&settlement).await {
            Ok(updated) => {
                tracing::info!(
                    transaction_id = %updated.id,
                    obligation_id = %obligation.id,
                    settlement_id = %settlement.id,
                    amount = %settlement.amount_applied,
                    write_off = %settlement.write_off,
                    actor = %settlement.applied_by,
                    state = ?updated.state,
                    "Settlement applied"
                );
                Ok(settlement)
            }
            Err(e) => {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    obligation_id = %obligation.id,
                    error = %e,
                    "Settlement commit rejected, restoring obligation balance"
                );
                if let Err(restore_error) = self
                    .ledger
                    .restore_settlement(&obligation.id, &request.amount)
                    .await
                {
                    tracing::error!(
                        obligation_id = %obligation.id,
                        amount = %request.amount,
                        error = %restore_error,
                        "Failed to restore obligation balance after rejected settlement"
                    );
                }
                Err(e)
            }
        }
    }

    /// Reverse an application, returning the transaction to UNMATCHED.
    ///
    /// The settlement is claimed in the store before the ledger is touched,
    /// so concurrent reversals of one settlement restore the obligation once.
    pub async fn reverse(&self, settlement_id: &str, actor: Actor) -> ReconcileResult<Settlement> {
        let original = self.store.begin_reversal(settlement_id).await?;

        if let Err(e) = self
            .ledger
            .restore_settlement(&original.obligation_id, &original.amount_applied)
            .await
        {
            self.release_claim(settlement_id).await;
            return Err(e);
        }

        let reversal = original.reversal(actor);
        match self.store.commit_reversal(&reversal).await {
            Ok(updated) => {
                tracing::info!(
                    transaction_id = %updated.id,
                    obligation_id = %original.obligation_id,
                    settlement_id = %original.id,
                    reversal_id = %reversal.id,
                    actor = %reversal.applied_by,
                    "Settlement reversed"
                );
                Ok(reversal)
            }
            Err(e) => {
                tracing::warn!(
                    settlement_id = %original.id,
                    error = %e,
                    "Reversal commit rejected, re-applying obligation balance"
                );
                if let Err(reapply_error) = self
                    .ledger
                    .record_settlement(&original.obligation_id, &original.amount_applied)
                    .await
                {
                    tracing::error!(
                        obligation_id = %original.obligation_id,
                        amount = %original.amount_applied,
                        error = %reapply_error,
                        "Failed to re-apply obligation balance after rejected reversal"
                    );
                }
                self.release_claim(settlement_id).await;
                Err(e)
            }
        }
    }

    async fn release_claim(&self, settlement_id: &str) {
        if let Err(e) = self.store.release_reversal(settlement_id).await {
            tracing::error!(
                settlement_id,
                error = %e,
                "Failed to release reversal claim"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportConfig;
    use crate::reconciliation::canonicalize::Canonicalizer;
    use crate::utils::{MemoryLedger, MemoryStore};
    use chrono::NaiveDate;
    use std::str::FromStr;

    struct Fixture {
        store: Arc<MemoryStore>,
        ledger: Arc<MemoryLedger>,
        applier: SettlementApplier<MemoryStore, MemoryLedger>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let applier = SettlementApplier::new(store.clone(), ledger.clone());
        Fixture {
            store,
            ledger,
            applier,
        }
    }

    fn amount(value: &str) -> BigDecimal {
        BigDecimal::from_str(value).unwrap()
    }

    async fn import(store: &MemoryStore, row: RawRow) -> Transaction {
        let tx = Canonicalizer::new(&ImportConfig::default())
            .canonicalize("t1", "acc", "b1", &row)
            .unwrap();
        store.insert_transaction_if_absent(&tx).await.unwrap();
        tx
    }

    fn invoice(id: &str, due: &str, currency: &str) -> Obligation {
        Obligation::new(
            id.to_string(),
            "t1".to_string(),
            "Nordic Solutions".to_string(),
            currency.to_string(),
            amount(due),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            Some(id.to_uppercase()),
            ObligationType::Receivable,
        )
    }

    #[tokio::test]
    async fn test_full_settlement_marks_transaction_matched() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "1500.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "1500.00", "Payment", "EUR")).await;

        let settlement = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("1500.00"), Actor::Auto))
            .await
            .unwrap();

        assert_eq!(settlement.amount_applied, amount("1500.00"));
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Matched);
        assert_eq!(stored.unsettled_amount, amount("0"));
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("0"));

        let again = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("1.00"), Actor::Auto))
            .await;
        assert!(matches!(again, Err(ReconcileError::AlreadySettled(_))));
    }

    #[tokio::test]
    async fn test_partial_settlement_keeps_transaction_open() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "600.00", "EUR")).unwrap();
        f.ledger.add_obligation(invoice("inv2", "400.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "1000.00", "Payment", "EUR")).await;

        f.applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("600.00"), Actor::user("ann")))
            .await
            .unwrap();
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Unmatched);
        assert!(stored.is_partially_settled());
        assert_eq!(stored.unsettled_amount, amount("400.00"));

        let too_much = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv2", amount("500.00"), Actor::user("ann")))
            .await;
        assert!(matches!(too_much, Err(ReconcileError::InvalidAmount(_))));

        f.applier
            .apply(SettlementRequest::new(&tx.id, "inv2", amount("400.00"), Actor::user("ann")))
            .await
            .unwrap();
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Matched);
        assert_eq!(f.store.list_settlements(&tx.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insufficient_obligation_balance() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "100.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "150.00", "Payment", "EUR")).await;

        let result = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("150.00"), Actor::user("ann")))
            .await;

        assert!(matches!(
            result,
            Err(ReconcileError::InsufficientObligationBalance { .. })
        ));
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("100.00"));
        assert!(f.store.list_settlements(&tx.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cross_currency_requires_user_override() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "100.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "100.00", "Payment", "USD")).await;

        let plain = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::user("ann")))
            .await;
        assert!(matches!(plain, Err(ReconcileError::CrossCurrencyNotAllowed { .. })));

        let auto_override = f
            .applier
            .apply(
                SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::Auto)
                    .allowing_cross_currency(),
            )
            .await;
        assert!(matches!(
            auto_override,
            Err(ReconcileError::CrossCurrencyNotAllowed { .. })
        ));

        let settlement = f
            .applier
            .apply(
                SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::user("ann"))
                    .allowing_cross_currency(),
            )
            .await
            .unwrap();
        assert!(settlement.cross_currency);
    }

    #[tokio::test]
    async fn test_wrong_direction_rejected() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "100.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "-100.00", "Payment", "EUR")).await;

        let result = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::user("ann")))
            .await;
        assert!(matches!(result, Err(ReconcileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_reverse_restores_both_sides_once() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "250.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "250.00", "Payment", "EUR")).await;
        let settlement = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("250.00"), Actor::Auto))
            .await
            .unwrap();

        let reversal = f
            .applier
            .reverse(&settlement.id, Actor::user("ann"))
            .await
            .unwrap();
        assert_eq!(reversal.reverses.as_deref(), Some(settlement.id.as_str()));

        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Unmatched);
        assert_eq!(stored.unsettled_amount, amount("250.00"));
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("250.00"));

        let twice = f.applier.reverse(&settlement.id, Actor::user("ann")).await;
        assert!(matches!(twice, Err(ReconcileError::AlreadyReversed(_))));

        let of_reversal = f.applier.reverse(&reversal.id, Actor::user("ann")).await;
        assert!(matches!(of_reversal, Err(ReconcileError::Validation(_))));
    }

    #[tokio::test]
    async fn test_write_off_is_bounded_by_limit() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "100.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "100.01", "Payment", "EUR")).await;

        let unlimited = f
            .applier
            .apply(
                SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::Auto)
                    .absorbing(amount("0.01")),
            )
            .await;
        assert!(matches!(unlimited, Err(ReconcileError::InvalidAmount(_))));

        let applier = SettlementApplier::new(f.store.clone(), f.ledger.clone())
            .with_write_off_limit(amount("0.01"));
        let too_large = applier
            .apply(
                SettlementRequest::new(&tx.id, "inv1", amount("99.90"), Actor::Auto)
                    .absorbing(amount("0.11")),
            )
            .await;
        assert!(matches!(too_large, Err(ReconcileError::InvalidAmount(_))));
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("100.00"));

        let settlement = applier
            .apply(
                SettlementRequest::new(&tx.id, "inv1", amount("100.00"), Actor::Auto)
                    .absorbing(amount("0.01")),
            )
            .await
            .unwrap();
        assert_eq!(settlement.transaction_amount(), amount("100.01"));
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Matched);
    }

    #[tokio::test]
    async fn test_reversal_claim_blocks_a_second_reversal() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "250.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "250.00", "Payment", "EUR")).await;
        let settlement = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("250.00"), Actor::Auto))
            .await
            .unwrap();

        f.store.begin_reversal(&settlement.id).await.unwrap();
        let blocked = f.applier.reverse(&settlement.id, Actor::user("ann")).await;
        assert!(matches!(blocked, Err(ReconcileError::AlreadyReversed(_))));
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("0"));

        f.store.release_reversal(&settlement.id).await.unwrap();
        f.applier
            .reverse(&settlement.id, Actor::user("ann"))
            .await
            .unwrap();
        let obligation = f.ledger.get_obligation("t1", "inv1").await.unwrap().unwrap();
        assert_eq!(obligation.amount_due, amount("250.00"));
    }

    #[tokio::test]
    async fn test_failed_ledger_restore_releases_the_claim() {
        let f = fixture();
        f.ledger.add_obligation(invoice("inv1", "250.00", "EUR")).unwrap();
        let tx = import(&f.store, RawRow::new("2024-03-10", "250.00", "Payment", "EUR")).await;
        let settlement = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("250.00"), Actor::Auto))
            .await
            .unwrap();

        f.ledger.set_available(false);
        let offline = f.applier.reverse(&settlement.id, Actor::user("ann")).await;
        assert!(matches!(
            offline,
            Err(ReconcileError::ObligationSourceUnavailable(_))
        ));

        f.ledger.set_available(true);
        f.applier
            .reverse(&settlement.id, Actor::user("ann"))
            .await
            .unwrap();
        let stored = f.store.get_transaction(&tx.id).await.unwrap().unwrap();
        assert_eq!(stored.unsettled_amount, amount("250.00"));
    }

    #[tokio::test]
    async fn test_missing_records() {
        let f = fixture();
        let missing_tx = f
            .applier
            .apply(SettlementRequest::new("nope", "inv1", amount("1"), Actor::Auto))
            .await;
        assert!(matches!(missing_tx, Err(ReconcileError::TransactionNotFound(_))));

        let tx = import(&f.store, RawRow::new("2024-03-10", "10.00", "Payment", "EUR")).await;
        let missing_obligation = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "nope", amount("1"), Actor::Auto))
            .await;
        assert!(matches!(
            missing_obligation,
            Err(ReconcileError::ObligationNotFound(_))
        ));

        let missing_settlement = f.applier.reverse("nope", Actor::Auto).await;
        assert!(matches!(
            missing_settlement,
            Err(ReconcileError::SettlementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let f = fixture();
        let tx = import(&f.store, RawRow::new("2024-03-10", "10.00", "Payment", "EUR")).await;
        let result = f
            .applier
            .apply(SettlementRequest::new(&tx.id, "inv1", amount("0"), Actor::Auto))
            .await;
        assert!(matches!(result, Err(ReconcileError::InvalidAmount(_))));
    }
}
