//! In-memory store and ledger implementations for testing

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use num_traits::Zero;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::traits::*;
use crate::types::*;

#[derive(Debug, Default)]
struct StoreState {
    /// Insertion-ordered transactions
    transactions: Vec<Transaction>,
    positions: HashMap<String, usize>,
    /// `(tenant_id, account_id, dedup_key)` -> transaction id
    dedup_index: HashMap<(String, String, String), String>,
    /// Append-only settlement ledger
    settlements: Vec<Settlement>,
    /// Settlements claimed by an in-flight reversal
    reversals_in_flight: HashSet<String>,
    batches: HashMap<String, ImportBatch>,
}

impl StoreState {
    fn transaction_mut(&mut self, transaction_id: &str) -> ReconcileResult<&mut Transaction> {
        let position = *self
            .positions
            .get(transaction_id)
            .ok_or_else(|| ReconcileError::TransactionNotFound(transaction_id.to_string()))?;
        Ok(&mut self.transactions[position])
    }
}

/// In-memory reconciliation store for testing and development.
///
/// All tables sit behind one lock so that each trait method is a single
/// atomic unit, the same guarantee a database transaction gives.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl MemoryStore {
    /// Create a new memory store instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear all data (useful for testing)
    pub fn clear(&self) -> ReconcileResult<()> {
        *self.write()? = StoreState::default();
        Ok(())
    }

    fn read(&self) -> ReconcileResult<RwLockReadGuard<'_, StoreState>> {
        self.state
            .read()
            .map_err(|_| ReconcileError::Storage("Store lock poisoned".to_string()))
    }

    fn write(&self) -> ReconcileResult<RwLockWriteGuard<'_, StoreState>> {
        self.state
            .write()
            .map_err(|_| ReconcileError::Storage("Store lock poisoned".to_string()))
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn insert_transaction_if_absent(
        &self,
        transaction: &Transaction,
    ) -> ReconcileResult<InsertOutcome> {
        let mut state = self.write()?;
        let key = (
            transaction.tenant_id.clone(),
            transaction.account_id.clone(),
            transaction.dedup_key(),
        );

        if let Some(existing_id) = state.dedup_index.get(&key) {
            return Ok(InsertOutcome::Duplicate {
                existing_id: existing_id.clone(),
            });
        }

        if state.positions.contains_key(&transaction.id) {
            return Err(ReconcileError::Storage(format!(
                "Transaction {} already exists",
                transaction.id
            )));
        }

        let position = state.transactions.len();
        state.transactions.push(transaction.clone());
        state.positions.insert(transaction.id.clone(), position);
        state.dedup_index.insert(key, transaction.id.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn get_transaction(&self, transaction_id: &str) -> ReconcileResult<Option<Transaction>> {
        let state = self.read()?;
        Ok(state
            .positions
            .get(transaction_id)
            .map(|&position| state.transactions[position].clone()))
    }

    async fn list_transactions(
        &self,
        tenant_id: &str,
        account_id: &str,
        states: &[TransactionState],
    ) -> ReconcileResult<Vec<Transaction>> {
        let state = self.read()?;
        let filtered: Vec<Transaction> = state
            .transactions
            .iter()
            .filter(|tx| tx.tenant_id == tenant_id && tx.account_id == account_id)
            .filter(|tx| states.is_empty() || states.contains(&tx.state))
            .cloned()
            .collect();
        Ok(filtered)
    }

    async fn transition_state(
        &self,
        transaction_id: &str,
        from: TransactionState,
        to: TransactionState,
    ) -> ReconcileResult<bool> {
        if from == TransactionState::Matched || to == TransactionState::Matched {
            return Err(ReconcileError::Validation(
                "MATCHED is only reachable through a settlement".to_string(),
            ));
        }

        let mut state = self.write()?;
        let transaction = state.transaction_mut(transaction_id)?;
        if transaction.state != from {
            return Ok(false);
        }

        transaction.state = to;
        transaction.touch();
        Ok(true)
    }

    async fn commit_settlement(&self, settlement: &Settlement) -> ReconcileResult<Transaction> {
        let mut state = self.write()?;
        let transaction = state.transaction_mut(&settlement.transaction_id)?;

        if transaction.state == TransactionState::Matched {
            return Err(ReconcileError::AlreadySettled(transaction.id.clone()));
        }
        let settled = settlement.transaction_amount();
        if settled > transaction.unsettled_amount {
            return Err(ReconcileError::InvalidAmount(format!(
                "Amount {} exceeds unsettled amount {} of transaction {}",
                settled, transaction.unsettled_amount, transaction.id
            )));
        }

        transaction.unsettled_amount -= &settled;
        if transaction.unsettled_amount.is_zero() {
            transaction.state = TransactionState::Matched;
        }
        transaction.touch();
        let updated = transaction.clone();

        state.settlements.push(settlement.clone());
        Ok(updated)
    }

    async fn begin_reversal(&self, settlement_id: &str) -> ReconcileResult<Settlement> {
        let mut state = self.write()?;
        let original = state
            .settlements
            .iter()
            .find(|s| s.id == settlement_id)
            .cloned()
            .ok_or_else(|| ReconcileError::SettlementNotFound(settlement_id.to_string()))?;

        if original.is_reversal() {
            return Err(ReconcileError::Validation(format!(
                "Settlement {} is itself a reversal",
                settlement_id
            )));
        }
        let reversed = state
            .settlements
            .iter()
            .any(|s| s.reverses.as_deref() == Some(settlement_id));
        if reversed || !state.reversals_in_flight.insert(settlement_id.to_string()) {
            return Err(ReconcileError::AlreadyReversed(settlement_id.to_string()));
        }

        Ok(original)
    }

    async fn release_reversal(&self, settlement_id: &str) -> ReconcileResult<()> {
        self.write()?.reversals_in_flight.remove(settlement_id);
        Ok(())
    }

    async fn commit_reversal(&self, reversal: &Settlement) -> ReconcileResult<Transaction> {
        let mut state = self.write()?;
        let original_id = reversal.reverses.clone().ok_or_else(|| {
            ReconcileError::Validation(format!("Settlement {} is not a reversal", reversal.id))
        })?;

        if !state
            .settlements
            .iter()
            .any(|s| s.id == original_id && !s.is_reversal())
        {
            return Err(ReconcileError::SettlementNotFound(original_id));
        }
        if state
            .settlements
            .iter()
            .any(|s| s.reverses.as_deref() == Some(original_id.as_str()))
        {
            return Err(ReconcileError::AlreadyReversed(original_id));
        }

        let transaction = state.transaction_mut(&reversal.transaction_id)?;
        let restored = &transaction.unsettled_amount + &reversal.transaction_amount();
        if restored > transaction.absolute_amount() {
            return Err(ReconcileError::InvalidAmount(format!(
                "Reversal of {} would exceed the amount of transaction {}",
                reversal.transaction_amount(),
                transaction.id
            )));
        }

        transaction.unsettled_amount = restored;
        transaction.state = TransactionState::Unmatched;
        transaction.touch();
        let updated = transaction.clone();

        state.reversals_in_flight.remove(&original_id);
        state.settlements.push(reversal.clone());
        Ok(updated)
    }

    async fn get_settlement(&self, settlement_id: &str) -> ReconcileResult<Option<Settlement>> {
        Ok(self
            .read()?
            .settlements
            .iter()
            .find(|s| s.id == settlement_id)
            .cloned())
    }

    async fn list_settlements(&self, transaction_id: &str) -> ReconcileResult<Vec<Settlement>> {
        Ok(self
            .read()?
            .settlements
            .iter()
            .filter(|s| s.transaction_id == transaction_id)
            .cloned()
            .collect())
    }

    async fn save_import_batch(&self, batch: &ImportBatch) -> ReconcileResult<()> {
        self.write()?.batches.insert(batch.id.clone(), batch.clone());
        Ok(())
    }

    async fn get_import_batch(&self, batch_id: &str) -> ReconcileResult<Option<ImportBatch>> {
        Ok(self.read()?.batches.get(batch_id).cloned())
    }

    async fn find_import_batch_by_checksum(
        &self,
        tenant_id: &str,
        account_id: &str,
        checksum: &str,
    ) -> ReconcileResult<Option<ImportBatch>> {
        Ok(self
            .read()?
            .batches
            .values()
            .filter(|b| {
                b.tenant_id == tenant_id
                    && b.account_id == account_id
                    && b.source_checksum == checksum
            })
            .min_by_key(|b| b.imported_at)
            .cloned())
    }
}

/// In-memory accounting ledger holding invoices and bills.
///
/// Can be switched offline or slowed down to exercise the failure paths of
/// callers.
#[derive(Debug, Clone)]
pub struct MemoryLedger {
    obligations: Arc<RwLock<HashMap<String, Obligation>>>,
    available: Arc<AtomicBool>,
    latency: Option<Duration>,
}

impl MemoryLedger {
    /// Create a new, empty ledger
    pub fn new() -> Self {
        Self {
            obligations: Arc::new(RwLock::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
            latency: None,
        }
    }

    /// Delay every obligation listing by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Simulate the ledger going offline or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Add or replace an obligation
    pub fn add_obligation(&self, obligation: Obligation) -> ReconcileResult<()> {
        self.write()?.insert(obligation.id.clone(), obligation);
        Ok(())
    }

    /// Sum of `amount_due` over every obligation
    pub fn total_amount_due(&self) -> ReconcileResult<BigDecimal> {
        Ok(self
            .read()?
            .values()
            .fold(BigDecimal::zero(), |acc, o| acc + &o.amount_due))
    }

    fn ensure_available(&self) -> ReconcileResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ReconcileError::ObligationSourceUnavailable(
                "Ledger is offline".to_string(),
            ))
        }
    }

    fn read(&self) -> ReconcileResult<RwLockReadGuard<'_, HashMap<String, Obligation>>> {
        self.obligations
            .read()
            .map_err(|_| ReconcileError::Storage("Ledger lock poisoned".to_string()))
    }

    fn write(&self) -> ReconcileResult<RwLockWriteGuard<'_, HashMap<String, Obligation>>> {
        self.obligations
            .write()
            .map_err(|_| ReconcileError::Storage("Ledger lock poisoned".to_string()))
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObligationSource for MemoryLedger {
    async fn list_outstanding_obligations(
        &self,
        tenant_id: &str,
        direction: ObligationType,
        window: DateWindow,
    ) -> ReconcileResult<Vec<Obligation>> {
        self.ensure_available()?;
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut outstanding: Vec<Obligation> = self
            .read()?
            .values()
            .filter(|o| {
                o.tenant_id == tenant_id
                    && o.obligation_type == direction
                    && o.is_outstanding()
                    && window.contains(o.due_date)
            })
            .cloned()
            .collect();
        outstanding.sort_by(|a, b| a.due_date.cmp(&b.due_date).then_with(|| a.id.cmp(&b.id)));
        Ok(outstanding)
    }

    async fn get_obligation(
        &self,
        tenant_id: &str,
        obligation_id: &str,
    ) -> ReconcileResult<Option<Obligation>> {
        self.ensure_available()?;
        Ok(self
            .read()?
            .get(obligation_id)
            .filter(|o| o.tenant_id == tenant_id)
            .cloned())
    }

    async fn record_settlement(
        &self,
        obligation_id: &str,
        amount: &BigDecimal,
    ) -> ReconcileResult<()> {
        self.ensure_available()?;
        let mut obligations = self.write()?;
        let obligation = obligations
            .get_mut(obligation_id)
            .ok_or_else(|| ReconcileError::ObligationNotFound(obligation_id.to_string()))?;

        if obligation.amount_due < *amount {
            return Err(ReconcileError::InsufficientObligationBalance {
                obligation_id: obligation_id.to_string(),
                requested: amount.clone(),
                remaining: obligation.amount_due.clone(),
            });
        }

        obligation.amount_due -= amount;
        Ok(())
    }

    async fn restore_settlement(
        &self,
        obligation_id: &str,
        amount: &BigDecimal,
    ) -> ReconcileResult<()> {
        self.ensure_available()?;
        let mut obligations = self.write()?;
        let obligation = obligations
            .get_mut(obligation_id)
            .ok_or_else(|| ReconcileError::ObligationNotFound(obligation_id.to_string()))?;

        let restored = &obligation.amount_due + amount;
        if restored > obligation.original_amount {
            return Err(ReconcileError::InvalidAmount(format!(
                "Restoring {} would exceed the original amount of obligation {}",
                amount, obligation_id
            )));
        }

        obligation.amount_due = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::str::FromStr;

    fn due(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
    }

    fn bill(id: &str, amount: &str, day: u32) -> Obligation {
        Obligation::new(
            id.to_string(),
            "t1".to_string(),
            "Supplier".to_string(),
            "EUR".to_string(),
            BigDecimal::from_str(amount).unwrap(),
            due(day),
            None,
            ObligationType::Payable,
        )
    }

    #[tokio::test]
    async fn test_ledger_guards_balance() {
        let ledger = MemoryLedger::new();
        ledger.add_obligation(bill("b1", "100.00", 5)).unwrap();

        ledger
            .record_settlement("b1", &BigDecimal::from(60))
            .await
            .unwrap();
        let result = ledger.record_settlement("b1", &BigDecimal::from(50)).await;
        assert!(matches!(
            result,
            Err(ReconcileError::InsufficientObligationBalance { .. })
        ));

        ledger
            .restore_settlement("b1", &BigDecimal::from(60))
            .await
            .unwrap();
        assert!(ledger
            .restore_settlement("b1", &BigDecimal::from(1))
            .await
            .is_err());
        assert_eq!(ledger.total_amount_due().unwrap(), BigDecimal::from(100));
    }

    #[tokio::test]
    async fn test_ledger_lists_outstanding_in_window() {
        let ledger = MemoryLedger::new();
        ledger.add_obligation(bill("b2", "10.00", 20)).unwrap();
        ledger.add_obligation(bill("b1", "10.00", 5)).unwrap();
        ledger.add_obligation(bill("paid", "0", 6)).unwrap();
        ledger.add_obligation(bill("late", "10.00", 30)).unwrap();

        let listed = ledger
            .list_outstanding_obligations(
                "t1",
                ObligationType::Payable,
                DateWindow::new(due(1), due(25)),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);

        let receivables = ledger
            .list_outstanding_obligations(
                "t1",
                ObligationType::Receivable,
                DateWindow::new(due(1), due(25)),
            )
            .await
            .unwrap();
        assert!(receivables.is_empty());
    }

    #[tokio::test]
    async fn test_offline_ledger() {
        let ledger = MemoryLedger::new();
        ledger.set_available(false);

        let result = ledger.get_obligation("t1", "b1").await;
        assert!(matches!(
            result,
            Err(ReconcileError::ObligationSourceUnavailable(_))
        ));
    }

    fn transaction(id: &str, tenant_id: &str) -> Transaction {
        let now = chrono::Utc::now().naive_utc();
        Transaction {
            id: id.to_string(),
            tenant_id: tenant_id.to_string(),
            account_id: "acc".to_string(),
            import_batch_id: "b1".to_string(),
            posted_date: due(1),
            amount: BigDecimal::from(5),
            currency: "EUR".to_string(),
            description: "x".to_string(),
            normalized_description: "x".to_string(),
            counterparty: None,
            reference: None,
            external_id: None,
            fingerprint: "f".to_string(),
            state: TransactionState::Unmatched,
            unsettled_amount: BigDecimal::from(5),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_dedup_index_is_scoped_to_tenant() {
        let store = MemoryStore::new();

        let first = store
            .insert_transaction_if_absent(&transaction("tx1", "t1"))
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);

        let same_tenant = store
            .insert_transaction_if_absent(&transaction("tx2", "t1"))
            .await
            .unwrap();
        assert_eq!(
            same_tenant,
            InsertOutcome::Duplicate {
                existing_id: "tx1".to_string()
            }
        );

        let other_tenant = store
            .insert_transaction_if_absent(&transaction("tx3", "t2"))
            .await
            .unwrap();
        assert_eq!(other_tenant, InsertOutcome::Inserted);
    }

    #[tokio::test]
    async fn test_reversal_claim_is_exclusive() {
        let store = MemoryStore::new();
        let tx = transaction("tx1", "t1");
        store.insert_transaction_if_absent(&tx).await.unwrap();
        let settlement = Settlement::application(&tx, "b1", BigDecimal::from(5), Actor::Auto, false);
        store.commit_settlement(&settlement).await.unwrap();

        let claimed = store.begin_reversal(&settlement.id).await.unwrap();
        assert_eq!(claimed.id, settlement.id);
        assert!(matches!(
            store.begin_reversal(&settlement.id).await,
            Err(ReconcileError::AlreadyReversed(_))
        ));

        let reversal = claimed.reversal(Actor::user("ann"));
        let restored = store.commit_reversal(&reversal).await.unwrap();
        assert_eq!(restored.unsettled_amount, BigDecimal::from(5));
        assert!(matches!(
            store.begin_reversal(&settlement.id).await,
            Err(ReconcileError::AlreadyReversed(_))
        ));
        assert!(matches!(
            store.begin_reversal(&reversal.id).await,
            Err(ReconcileError::Validation(_))
        ));
        assert!(matches!(
            store.begin_reversal("missing").await,
            Err(ReconcileError::SettlementNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_transition_state_is_conditional() {
        let store = MemoryStore::new();
        let tx = transaction("tx1", "t1");
        store.insert_transaction_if_absent(&tx).await.unwrap();

        assert!(store
            .transition_state("tx1", TransactionState::Unmatched, TransactionState::Suggested)
            .await
            .unwrap());
        assert!(!store
            .transition_state("tx1", TransactionState::Unmatched, TransactionState::Suggested)
            .await
            .unwrap());
        assert!(store
            .transition_state("tx1", TransactionState::Suggested, TransactionState::Matched)
            .await
            .is_err());

        let stored = store.get_transaction("tx1").await.unwrap().unwrap();
        assert_eq!(stored.state, TransactionState::Suggested);
        assert_eq!(stored.version, 2);

        let suggested = store
            .list_transactions("t1", "acc", &[TransactionState::Suggested])
            .await
            .unwrap();
        assert_eq!(suggested.len(), 1);
        assert!(store
            .list_transactions("t1", "acc", &[TransactionState::Matched])
            .await
            .unwrap()
            .is_empty());
    }
}
