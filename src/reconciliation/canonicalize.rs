//! Normalization of parser rows into canonical transactions

use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use num_traits::Signed;
use std::str::FromStr;

use crate::config::ImportConfig;
use crate::reconciliation::dedup::compute_fingerprint;
use crate::traits::*;
use crate::types::*;
use crate::utils::validate_currency_code;

/// Legal-entity designators dropped from the end of counterparty names,
/// after dots and slashes have been removed ("A/S" -> "as", "S.A." -> "sa").
const LEGAL_SUFFIXES: &[&str] = &[
    "ab", "ag", "aps", "as", "asa", "bv", "co", "company", "corp", "corporation", "gmbh", "inc",
    "incorporated", "kft", "limited", "llc", "llp", "ltd", "nv", "oy", "oyj", "ou", "oü", "plc",
    "sa", "sarl", "sas", "sia", "spa", "sro", "srl", "uab",
];

/// Bank boilerplate that precedes the counterparty in free-text descriptions
const DESCRIPTION_PREFIXES: &[&str] = &[
    "payment from",
    "payment to",
    "transfer from",
    "transfer to",
    "sepa credit transfer",
    "sepa credit",
    "sepa direct debit",
    "direct debit",
    "card purchase",
    "incoming payment",
    "outgoing payment",
    "pos",
];

/// Turns parser rows into canonical `Transaction`s
pub struct Canonicalizer {
    date_formats: Vec<String>,
    default_currency: Option<String>,
    validator: Box<dyn RowValidator>,
}

impl Canonicalizer {
    /// Create a new canonicalizer
    pub fn new(config: &ImportConfig) -> Self {
        Self::with_validator(config, Box::new(DefaultRowValidator))
    }

    /// Create a new canonicalizer with a custom validator
    pub fn with_validator(config: &ImportConfig, validator: Box<dyn RowValidator>) -> Self {
        Self {
            date_formats: config.date_formats.clone(),
            default_currency: config.default_currency.clone(),
            validator,
        }
    }

    /// Canonicalize one row. Fails with `InvalidRow` when the row cannot be used.
    pub fn canonicalize(
        &self,
        tenant_id: &str,
        account_id: &str,
        batch_id: &str,
        row: &RawRow,
    ) -> ReconcileResult<Transaction> {
        self.validator.validate_row(row)?;

        let posted_date = parse_date(&row.date, &self.date_formats)?;
        let amount = parse_amount(&row.amount)?;
        let currency = self.resolve_currency(row.currency.as_deref())?;

        let normalized_description = normalize_description(&row.description);
        let counterparty = row
            .counterparty
            .as_deref()
            .and_then(normalize_counterparty)
            .or_else(|| extract_counterparty(&row.description));
        let reference = row.reference.as_deref().and_then(normalize_reference);
        let external_id = row
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);

        let fingerprint = compute_fingerprint(
            tenant_id,
            account_id,
            posted_date,
            &amount,
            &currency,
            &normalized_description,
        );

        let now = chrono::Utc::now().naive_utc();
        let transaction = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            account_id: account_id.to_string(),
            import_batch_id: batch_id.to_string(),
            posted_date,
            unsettled_amount: amount.abs(),
            amount,
            currency,
            description: row.description.clone(),
            normalized_description,
            counterparty,
            reference,
            external_id,
            fingerprint,
            state: TransactionState::Unmatched,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.validator.validate_transaction(&transaction)?;

        Ok(transaction)
    }

    fn resolve_currency(&self, currency: Option<&str>) -> ReconcileResult<String> {
        let code = currency
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_uppercase)
            .or_else(|| self.default_currency.clone())
            .ok_or_else(|| ReconcileError::InvalidRow("Currency is missing".to_string()))?;

        validate_currency_code(&code).map_err(|e| ReconcileError::InvalidRow(e.to_string()))?;
        Ok(code)
    }
}

/// Parse a date using the first matching format
pub fn parse_date(value: &str, formats: &[String]) -> ReconcileResult<NaiveDate> {
    let value = value.trim();
    formats
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .ok_or_else(|| ReconcileError::InvalidRow(format!("Unparseable date '{}'", value)))
}

/// Parse a bank amount into a fixed-point decimal.
///
/// Accepts either `.` or `,` as decimal separator, thousands separators
/// (`,` `.` `'` and spaces), a leading sign and accounting-style parentheses.
pub fn parse_amount(value: &str) -> ReconcileResult<BigDecimal> {
    let invalid = || ReconcileError::InvalidRow(format!("Unparseable amount '{}'", value.trim()));

    let mut text: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\'')
        .collect();

    let mut negative = false;
    if text.starts_with('(') && text.ends_with(')') {
        negative = true;
        text = text[1..text.len() - 1].to_string();
    }
    if let Some(rest) = text.strip_prefix('-') {
        negative = !negative;
        text = rest.to_string();
    } else if let Some(rest) = text.strip_prefix('+') {
        text = rest.to_string();
    }

    if text.is_empty() || !text.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return Err(invalid());
    }

    let last_dot = text.rfind('.');
    let last_comma = text.rfind(',');
    let decimal_separator = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => Some(if dot > comma { '.' } else { ',' }),
        (Some(_), None) => single_separator_role(&text, '.'),
        (None, Some(_)) => single_separator_role(&text, ','),
        (None, None) => None,
    };

    let mut normalized = String::with_capacity(text.len() + 1);
    if negative {
        normalized.push('-');
    }
    for c in text.chars() {
        match c {
            '.' | ',' if Some(c) == decimal_separator => normalized.push('.'),
            '.' | ',' => {}
            digit => normalized.push(digit),
        }
    }

    BigDecimal::from_str(&normalized).map_err(|_| invalid())
}

/// Role of the only separator kind present: repeated separators and a single
/// comma followed by exactly three digits group thousands, anything else is
/// the decimal point.
fn single_separator_role(text: &str, separator: char) -> Option<char> {
    if text.matches(separator).count() > 1 {
        return None;
    }
    let decimals = text.rsplit(separator).next().map(str::len).unwrap_or(0);
    if decimals == 3 && separator == ',' {
        None
    } else {
        Some(separator)
    }
}

/// Case-fold and collapse whitespace
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Keep only alphanumerics, case-folded. Empty results become `None`.
pub fn normalize_reference(reference: &str) -> Option<String> {
    let normalized: String = reference
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect();

    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Case-fold, strip punctuation and drop trailing legal-entity designators
pub fn normalize_counterparty(name: &str) -> Option<String> {
    let folded: String = name
        .to_lowercase()
        .chars()
        .filter(|c| *c != '.' && *c != '/')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    let mut tokens: Vec<&str> = folded.split_whitespace().collect();
    while tokens.len() > 1 && tokens.last().is_some_and(|t| LEGAL_SUFFIXES.contains(t)) {
        tokens.pop();
    }

    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}

/// Best-effort counterparty from a free-text description: drop known bank
/// boilerplate, then keep the words before the first token carrying digits.
pub fn extract_counterparty(description: &str) -> Option<String> {
    let mut text = normalize_description(description);
    for prefix in DESCRIPTION_PREFIXES {
        if let Some(rest) = text.strip_prefix(prefix) {
            if rest.starts_with(|c: char| c.is_alphanumeric()) {
                continue;
            }
            text = rest.trim_start_matches([' ', ':', '-']).to_string();
            break;
        }
    }

    let words: Vec<&str> = text
        .split_whitespace()
        .take_while(|word| !word.chars().any(|c| c.is_ascii_digit()))
        .collect();

    normalize_counterparty(&words.join(" "))
}
