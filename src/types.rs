//! Core types and data structures for the reconciliation system

use bigdecimal::BigDecimal;
use chrono::{Days, NaiveDate, NaiveDateTime};
use num_traits::{Signed, Zero};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Matching state of an imported bank transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionState {
    /// No settlement covers the full amount and no suggestion is pending
    Unmatched,
    /// Candidates were found in the suggestion band, awaiting manual action
    Suggested,
    /// The full amount has been settled against one or more obligations
    Matched,
}

/// Direction of an outstanding obligation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObligationType {
    /// An unpaid invoice - settled by money coming in
    Receivable,
    /// An unpaid bill - settled by money going out
    Payable,
}

impl ObligationType {
    /// Obligation direction a signed bank amount can settle.
    /// Inflows settle receivables, outflows settle payables.
    pub fn for_amount(amount: &BigDecimal) -> Option<Self> {
        if amount.is_positive() {
            Some(ObligationType::Receivable)
        } else if amount.is_negative() {
            Some(ObligationType::Payable)
        } else {
            None
        }
    }
}

/// A row as yielded by an external bank file parser.
///
/// Date and amount are kept as text; turning them into typed values is the
/// canonicalizer's job so that malformed rows are reported per row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawRow {
    pub date: String,
    pub amount: String,
    pub description: String,
    /// Source currency; falls back to the configured default when empty
    pub currency: Option<String>,
    /// Structured payment reference, if the format carries one
    pub reference: Option<String>,
    /// Structured counterparty name, if the format carries one
    pub counterparty: Option<String>,
    /// Bank-assigned unique id, preferred over the derived fingerprint
    pub external_id: Option<String>,
}

impl RawRow {
    /// Create a row with the mandatory fields
    pub fn new(date: &str, amount: &str, description: &str, currency: &str) -> Self {
        Self {
            date: date.to_string(),
            amount: amount.to_string(),
            description: description.to_string(),
            currency: Some(currency.to_string()),
            ..Default::default()
        }
    }

    pub fn with_reference(mut self, reference: &str) -> Self {
        self.reference = Some(reference.to_string());
        self
    }

    pub fn with_counterparty(mut self, counterparty: &str) -> Self {
        self.counterparty = Some(counterparty.to_string());
        self
    }

    pub fn with_external_id(mut self, external_id: &str) -> Self {
        self.external_id = Some(external_id.to_string());
        self
    }
}

/// Canonical bank transaction owned by an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier for the transaction
    pub id: String,
    /// Tenant owning the account
    pub tenant_id: String,
    /// Bank account the transaction was imported into
    pub account_id: String,
    /// Import batch that created this transaction
    pub import_batch_id: String,
    /// Booking date reported by the bank
    pub posted_date: NaiveDate,
    /// Signed amount: positive for inflows, negative for outflows
    pub amount: BigDecimal,
    /// ISO 4217 currency code, upper case
    pub currency: String,
    /// Description exactly as the bank reported it
    pub description: String,
    /// Case-folded, whitespace-collapsed description
    pub normalized_description: String,
    /// Normalized counterparty name (structured or extracted from the description)
    pub counterparty: Option<String>,
    /// Normalized reference: alphanumerics only, lower case
    pub reference: Option<String>,
    /// Bank-assigned unique id
    pub external_id: Option<String>,
    /// Content fingerprint used for deduplication
    pub fingerprint: String,
    /// Current matching state
    pub state: TransactionState,
    /// Absolute amount not yet covered by active settlements
    pub unsettled_amount: BigDecimal,
    /// Bumped on every state change
    pub version: u64,
    /// When the transaction was created
    pub created_at: NaiveDateTime,
    /// When the transaction was last updated
    pub updated_at: NaiveDateTime,
}

impl Transaction {
    /// Obligation direction this transaction can settle
    pub fn direction(&self) -> Option<ObligationType> {
        ObligationType::for_amount(&self.amount)
    }

    /// Key the store enforces uniqueness on within a tenant's account.
    /// A bank-provided external id takes precedence over the fingerprint.
    pub fn dedup_key(&self) -> String {
        match &self.external_id {
            Some(external_id) => format!("ext:{}", external_id),
            None => format!("fp:{}", self.fingerprint),
        }
    }

    /// Absolute transaction amount
    pub fn absolute_amount(&self) -> BigDecimal {
        self.amount.abs()
    }

    /// Whether some, but not all, of the amount has been settled
    pub fn is_partially_settled(&self) -> bool {
        !self.unsettled_amount.is_zero() && self.unsettled_amount < self.absolute_amount()
    }

    pub(crate) fn touch(&mut self) {
        self.version += 1;
        self.updated_at = chrono::Utc::now().naive_utc();
    }
}

/// Read projection of an invoice or bill owned by the external ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Obligation {
    pub id: String,
    pub tenant_id: String,
    /// Ledger-side counterparty identifier
    pub counterparty_id: Option<String>,
    /// Counterparty display name as recorded on the invoice or bill
    pub counterparty_name: String,
    pub currency: String,
    /// Amount originally owed
    pub original_amount: BigDecimal,
    /// Amount still owed; decreases as settlements are recorded
    pub amount_due: BigDecimal,
    pub due_date: NaiveDate,
    /// Invoice or bill number
    pub reference: Option<String>,
    pub obligation_type: ObligationType,
}

impl Obligation {
    /// Create a fully outstanding obligation
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        tenant_id: String,
        counterparty_name: String,
        currency: String,
        amount: BigDecimal,
        due_date: NaiveDate,
        reference: Option<String>,
        obligation_type: ObligationType,
    ) -> Self {
        Self {
            id,
            tenant_id,
            counterparty_id: None,
            counterparty_name,
            currency,
            original_amount: amount.clone(),
            amount_due: amount,
            due_date,
            reference,
            obligation_type,
        }
    }

    /// Whether anything is still owed
    pub fn is_outstanding(&self) -> bool {
        self.amount_due.is_positive()
    }
}

/// Inclusive date range used to bound candidate searches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Window of `days` on either side of `date`, clamped to the calendar range
    pub fn around(date: NaiveDate, days: i64) -> Self {
        let span = Days::new(days.unsigned_abs());
        Self {
            start: date.checked_sub_days(span).unwrap_or(NaiveDate::MIN),
            end: date.checked_add_days(span).unwrap_or(NaiveDate::MAX),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Smallest window covering both windows
    pub fn union(&self, other: &DateWindow) -> DateWindow {
        DateWindow {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Who applied or reversed a settlement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    /// The automatic matching pass
    Auto,
    /// A named user acting through the manual match path
    User(String),
}

impl Actor {
    pub fn user(name: &str) -> Self {
        Actor::User(name.to_string())
    }

    pub fn is_auto(&self) -> bool {
        matches!(self, Actor::Auto)
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Auto => write!(f, "auto"),
            Actor::User(name) => write!(f, "{}", name),
        }
    }
}

/// Kind of a settlement ledger record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementKind {
    /// Applies a transaction amount against an obligation
    Application,
    /// Compensates an earlier application
    Reversal,
}

/// Durable, append-only record that a transaction was applied against an obligation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: String,
    pub tenant_id: String,
    pub transaction_id: String,
    pub obligation_id: String,
    /// Always positive; a reversal carries the amount it gives back
    pub amount_applied: BigDecimal,
    pub applied_at: NaiveDateTime,
    pub applied_by: Actor,
    pub kind: SettlementKind,
    /// For reversals, the settlement being compensated
    pub reverses: Option<String>,
    /// Set when a user explicitly overrode a currency mismatch
    pub cross_currency: bool,
    /// Transaction residue within the amount tolerance closed by this
    /// settlement without being applied to the obligation
    #[serde(default)]
    pub write_off: BigDecimal,
}

impl Settlement {
    /// Create a new application record
    pub fn application(
        transaction: &Transaction,
        obligation_id: &str,
        amount: BigDecimal,
        actor: Actor,
        cross_currency: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: transaction.tenant_id.clone(),
            transaction_id: transaction.id.clone(),
            obligation_id: obligation_id.to_string(),
            amount_applied: amount,
            applied_at: chrono::Utc::now().naive_utc(),
            applied_by: actor,
            kind: SettlementKind::Application,
            reverses: None,
            cross_currency,
            write_off: BigDecimal::zero(),
        }
    }

    /// Close a residue of the transaction along with the applied amount
    pub fn with_write_off(mut self, write_off: BigDecimal) -> Self {
        self.write_off = write_off;
        self
    }

    /// Part of the transaction this record settles or gives back
    pub fn transaction_amount(&self) -> BigDecimal {
        &self.amount_applied + &self.write_off
    }

    /// Create the compensating record for this settlement
    pub fn reversal(&self, actor: Actor) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: self.tenant_id.clone(),
            transaction_id: self.transaction_id.clone(),
            obligation_id: self.obligation_id.clone(),
            amount_applied: self.amount_applied.clone(),
            applied_at: chrono::Utc::now().naive_utc(),
            applied_by: actor,
            kind: SettlementKind::Reversal,
            reverses: Some(self.id.clone()),
            cross_currency: self.cross_currency,
            write_off: self.write_off.clone(),
        }
    }

    pub fn is_reversal(&self) -> bool {
        self.kind == SettlementKind::Reversal
    }
}

/// Field that contributed to a confidence score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchField {
    Amount,
    Reference,
    Counterparty,
    DateProximity,
}

/// One weighted component of a confidence score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldContribution {
    pub field: MatchField,
    /// Raw component score in [0, 1]
    pub score: f64,
    pub weight: f64,
    /// `score * weight`
    pub contribution: f64,
}

/// Ephemeral scoring result for a (transaction, obligation) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSuggestion {
    pub transaction_id: String,
    pub obligation_id: String,
    /// Weighted confidence in [0, 1]
    pub confidence: f64,
    /// Per-field contributions, in weight order
    pub explanation: Vec<FieldContribution>,
    /// Amounts agree within the configured epsilon
    pub exact_amount: bool,
    /// Transaction and obligation currencies differ
    pub cross_currency: bool,
    pub obligation_due_date: NaiveDate,
    pub obligation_amount_due: BigDecimal,
}

impl MatchSuggestion {
    /// Component score for a given field
    pub fn component(&self, field: MatchField) -> f64 {
        self.explanation
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.score)
            .unwrap_or(0.0)
    }

    /// Confidence quantized for tie detection and stable ordering
    pub fn confidence_key(&self) -> i64 {
        (self.confidence * 1_000_000.0).round() as i64
    }
}

/// Audit record of one import call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatch {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    /// SHA-256 over the submitted rows, in order
    pub source_checksum: String,
    pub imported_at: NaiveDateTime,
    pub imported: usize,
    pub duplicates: usize,
    pub errors: usize,
    /// The batch stopped early on request; committed rows stay committed
    pub cancelled: bool,
}

/// Row that could not be canonicalized or stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowError {
    /// Zero-based position of the row in the submitted batch
    pub row_index: usize,
    pub message: String,
}

/// Summary returned to the caller of an import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportBatchResult {
    pub batch_id: String,
    pub imported: usize,
    pub duplicates: usize,
    pub errors: Vec<RowError>,
    pub cancelled: bool,
    /// Ids of the newly created transactions, in row order
    pub transaction_ids: Vec<String>,
}

/// Outcome of running an account through the matcher
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoMatchSummary {
    pub matched: usize,
    pub suggested: usize,
    pub unmatched: usize,
    /// Settlements created during the pass
    pub settlement_ids: Vec<String>,
}

/// Result of an insert-if-absent against the transaction store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A transaction with the same dedup key already exists in the account
    Duplicate { existing_id: String },
}

/// Errors that can occur in the reconciliation system
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ReconcileError {
    #[error("Invalid row: {0}")]
    InvalidRow(String),
    #[error("Transaction already settled: {0}")]
    AlreadySettled(String),
    #[error("Insufficient balance on obligation {obligation_id}: requested {requested}, remaining {remaining}")]
    InsufficientObligationBalance {
        obligation_id: String,
        requested: BigDecimal,
        remaining: BigDecimal,
    },
    #[error("Cross-currency settlement not allowed: transaction in {transaction_currency}, obligation in {obligation_currency}")]
    CrossCurrencyNotAllowed {
        transaction_currency: String,
        obligation_currency: String,
    },
    #[error("Obligation source unavailable: {0}")]
    ObligationSourceUnavailable(String),
    #[error("Transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("Obligation not found: {0}")]
    ObligationNotFound(String),
    #[error("Settlement not found: {0}")]
    SettlementNotFound(String),
    #[error("Settlement already reversed: {0}")]
    AlreadyReversed(String),
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result type for reconciliation operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;
