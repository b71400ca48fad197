//! Confidence scoring of (transaction, obligation) pairs.
//!
//! Everything here is a pure function of the transaction, the obligation and
//! the configuration. The matcher never touches storage or the ledger, so it
//! can score any number of transactions concurrently.

use num_traits::{Signed, ToPrimitive};
use std::cmp::{Ordering, Reverse};
use std::collections::HashSet;

use crate::config::MatchConfig;
use crate::reconciliation::canonicalize::{normalize_counterparty, normalize_reference};
use crate::types::*;

/// Which obligations a ranking considers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateScope {
    /// Only obligations in the transaction's currency (automatic matching)
    SameCurrency,
    /// Also cross-currency obligations, capped and flagged (manual review)
    IncludeCrossCurrency,
}

/// Classification of a transaction's ranked candidates
#[derive(Debug, Clone, PartialEq)]
pub enum MatchOutcome {
    /// Candidates eligible for automatic settlement, best first.
    /// Later entries are only tried if earlier settlements are rejected.
    AutoMatch(Vec<MatchSuggestion>),
    /// Candidates in the suggestion band, awaiting manual confirmation
    Suggest(Vec<MatchSuggestion>),
    /// Nothing reached the suggestion floor
    NoCandidate,
}

/// Weighted heuristic matcher
#[derive(Debug, Clone)]
pub struct Matcher {
    config: MatchConfig,
}

impl Matcher {
    pub fn new(config: MatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Due-date window searched for a transaction dated `date`
    pub fn search_window(&self, date: chrono::NaiveDate) -> DateWindow {
        DateWindow::around(date, self.config.date_window_days)
    }

    /// Score one pair.
    ///
    /// Returns `None` when the obligation is not a candidate at all: wrong
    /// direction, nothing outstanding, or due outside the search window.
    pub fn score(
        &self,
        transaction: &Transaction,
        obligation: &Obligation,
    ) -> Option<MatchSuggestion> {
        if transaction.direction() != Some(obligation.obligation_type) {
            return None;
        }
        if !obligation.is_outstanding() || !transaction.unsettled_amount.is_positive() {
            return None;
        }

        let days_apart = (transaction.posted_date - obligation.due_date).num_days().abs();
        if days_apart > self.config.date_window_days {
            return None;
        }

        let (amount_score, exact_amount) = self.amount_score(transaction, obligation);
        let components = [
            (MatchField::Amount, amount_score, self.config.amount_weight),
            (
                MatchField::Reference,
                reference_score(transaction, obligation),
                self.config.reference_weight,
            ),
            (
                MatchField::Counterparty,
                counterparty_score(transaction, obligation),
                self.config.counterparty_weight,
            ),
            (
                MatchField::DateProximity,
                1.0 - days_apart as f64 / self.config.date_window_days as f64,
                self.config.date_weight,
            ),
        ];

        let explanation: Vec<FieldContribution> = components
            .iter()
            .map(|&(field, score, weight)| FieldContribution {
                field,
                score,
                weight,
                contribution: score * weight,
            })
            .collect();

        let cross_currency = transaction.currency != obligation.currency;
        let mut confidence: f64 = explanation.iter().map(|c| c.contribution).sum();
        if cross_currency {
            confidence = confidence.min(self.config.cross_currency_cap);
        }

        Some(MatchSuggestion {
            transaction_id: transaction.id.clone(),
            obligation_id: obligation.id.clone(),
            confidence: confidence.clamp(0.0, 1.0),
            explanation,
            exact_amount,
            cross_currency,
            obligation_due_date: obligation.due_date,
            obligation_amount_due: obligation.amount_due.clone(),
        })
    }

    /// Score every obligation and keep those at or above the suggestion floor.
    ///
    /// Ordered by confidence, then earliest due date, then largest balance.
    pub fn rank(
        &self,
        transaction: &Transaction,
        obligations: &[Obligation],
        scope: CandidateScope,
    ) -> Vec<MatchSuggestion> {
        let mut ranked: Vec<MatchSuggestion> = obligations
            .iter()
            .filter(|o| {
                scope == CandidateScope::IncludeCrossCurrency
                    || o.currency == transaction.currency
            })
            .filter_map(|o| self.score(transaction, o))
            .filter(|s| s.confidence >= self.config.suggestion_floor)
            .collect();

        ranked.sort_by(compare_candidates);
        ranked
    }

    /// Decide what to do with a ranked candidate list.
    ///
    /// A tie at the top always defers to manual review, even when every tied
    /// candidate would qualify on its own.
    pub fn classify(&self, ranked: &[MatchSuggestion]) -> MatchOutcome {
        let Some(top) = ranked.first() else {
            return MatchOutcome::NoCandidate;
        };

        let tied_at_top = ranked
            .get(1)
            .is_some_and(|second| second.confidence_key() == top.confidence_key());
        if tied_at_top || !self.is_auto_eligible(top) {
            return MatchOutcome::Suggest(ranked.to_vec());
        }

        let mut key_counts = std::collections::HashMap::new();
        for candidate in ranked {
            *key_counts.entry(candidate.confidence_key()).or_insert(0usize) += 1;
        }

        let eligible = ranked
            .iter()
            .filter(|c| self.is_auto_eligible(c) && key_counts[&c.confidence_key()] == 1)
            .cloned()
            .collect();

        MatchOutcome::AutoMatch(eligible)
    }

    /// Same currency, exact amount and confidence at the auto-match threshold
    pub fn is_auto_eligible(&self, suggestion: &MatchSuggestion) -> bool {
        !suggestion.cross_currency
            && suggestion.exact_amount
            && suggestion.confidence >= self.config.auto_match_threshold
    }

    fn amount_score(&self, transaction: &Transaction, obligation: &Obligation) -> (f64, bool) {
        let paid = transaction.unsettled_amount.to_f64().unwrap_or(0.0);
        let due = obligation.amount_due.to_f64().unwrap_or(0.0);
        let difference = (&transaction.unsettled_amount - &obligation.amount_due).abs();
        if difference <= self.config.amount_epsilon {
            return (1.0, true);
        }
        let difference = difference.to_f64().unwrap_or(f64::MAX);

        let largest = paid.max(due);
        if largest <= 0.0 || self.config.amount_tolerance_ratio <= 0.0 {
            return (0.0, false);
        }

        let relative = difference / largest;
        if relative > self.config.amount_tolerance_ratio {
            return (0.0, false);
        }

        let decay = 1.0 - relative / self.config.amount_tolerance_ratio;
        (self.config.partial_amount_ceiling * decay, false)
    }
}

/// Ranking order: confidence descending, earliest due date, largest balance,
/// then obligation id so equal candidates always come out in the same order.
fn compare_candidates(a: &MatchSuggestion, b: &MatchSuggestion) -> Ordering {
    Reverse(a.confidence_key())
        .cmp(&Reverse(b.confidence_key()))
        .then_with(|| a.obligation_due_date.cmp(&b.obligation_due_date))
        .then_with(|| b.obligation_amount_due.cmp(&a.obligation_amount_due))
        .then_with(|| a.obligation_id.cmp(&b.obligation_id))
}

/// Binary: the obligation number appears in the transaction reference, or,
/// when the bank gave no reference, as whole tokens of the description.
fn reference_score(transaction: &Transaction, obligation: &Obligation) -> f64 {
    let Some(wanted) = obligation.reference.as_deref().and_then(normalize_reference) else {
        return 0.0;
    };

    let found = match transaction.reference.as_deref() {
        Some(reference) => reference.contains(&wanted),
        None => description_mentions(&transaction.normalized_description, &wanted),
    };

    if found {
        1.0
    } else {
        0.0
    }
}

/// Whether a run of consecutive description tokens spells out `wanted`.
///
/// "inv 2024 007" and "inv-2024-007" both spell `inv2024007`, while
/// "inv-100" never spells `inv10`.
fn description_mentions(description: &str, wanted: &str) -> bool {
    let tokens: Vec<String> = description
        .split_whitespace()
        .filter_map(normalize_reference)
        .collect();

    (0..tokens.len()).any(|start| {
        let mut joined = String::new();
        for token in &tokens[start..] {
            joined.push_str(token);
            if joined == wanted {
                return true;
            }
            if !wanted.starts_with(joined.as_str()) {
                return false;
            }
        }
        false
    })
}

/// Jaccard similarity of the name token sets
fn counterparty_score(transaction: &Transaction, obligation: &Obligation) -> f64 {
    let Some(theirs) = normalize_counterparty(&obligation.counterparty_name) else {
        return 0.0;
    };
    let ours = match &transaction.counterparty {
        Some(name) => name.clone(),
        None => transaction.normalized_description.clone(),
    };

    token_jaccard(&ours, &theirs)
}

pub(crate) fn token_jaccard(a: &str, b: &str) -> f64 {
    let left: HashSet<&str> = a.split_whitespace().collect();
    let right: HashSet<&str> = b.split_whitespace().collect();
    if left.is_empty() || right.is_empty() {
        return 0.0;
    }

    let shared = left.intersection(&right).count();
    let total = left.union(&right).count();
    shared as f64 / total as f64
}
