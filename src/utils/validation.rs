//! Validation utilities

use crate::traits::*;
use crate::types::*;
use bigdecimal::BigDecimal;
use chrono::Duration;
use num_traits::Zero;

/// Validate that an amount is positive
pub fn validate_positive_amount(amount: &BigDecimal) -> ReconcileResult<()> {
    if *amount <= BigDecimal::zero() {
        Err(ReconcileError::InvalidAmount(
            "Amount must be positive".to_string(),
        ))
    } else {
        Ok(())
    }
}

/// Validate a tenant or account identifier
pub fn validate_identifier(kind: &str, id: &str) -> ReconcileResult<()> {
    if id.trim().is_empty() {
        return Err(ReconcileError::Validation(format!("{} cannot be empty", kind)));
    }

    if id.len() > 64 {
        return Err(ReconcileError::Validation(format!(
            "{} cannot exceed 64 characters",
            kind
        )));
    }

    // Check for valid characters (alphanumeric, dashes, underscores)
    if !id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ReconcileError::Validation(format!(
            "{} can only contain alphanumeric characters, dashes, and underscores",
            kind
        )));
    }

    Ok(())
}

/// Validate an ISO 4217 style currency code (three upper-case letters)
pub fn validate_currency_code(code: &str) -> ReconcileResult<()> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(ReconcileError::Validation(format!(
            "Invalid currency code '{}'",
            code
        )))
    }
}

/// Validate that a bank description is within bounds
pub fn validate_description(description: &str) -> ReconcileResult<()> {
    if description.len() > 1000 {
        return Err(ReconcileError::InvalidRow(
            "Description cannot exceed 1000 characters".to_string(),
        ));
    }

    Ok(())
}

/// Stricter row validator: requires a description and rejects
/// transactions booked more than a day in the future
pub struct EnhancedRowValidator;

impl RowValidator for EnhancedRowValidator {
    fn validate_row(&self, row: &RawRow) -> ReconcileResult<()> {
        DefaultRowValidator.validate_row(row)?;

        if row.description.trim().is_empty() {
            return Err(ReconcileError::InvalidRow(
                "Description cannot be empty".to_string(),
            ));
        }

        validate_description(&row.description)
    }

    fn validate_transaction(&self, transaction: &Transaction) -> ReconcileResult<()> {
        DefaultRowValidator.validate_transaction(transaction)?;

        let latest = chrono::Utc::now().date_naive() + Duration::days(1);
        if transaction.posted_date > latest {
            return Err(ReconcileError::InvalidRow(format!(
                "Posted date {} is in the future",
                transaction.posted_date
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_positive_amount() {
        assert!(validate_positive_amount(&BigDecimal::from(1)).is_ok());
        assert!(validate_positive_amount(&BigDecimal::from(0)).is_err());
        assert!(validate_positive_amount(&BigDecimal::from(-5)).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("Account ID", "acc_01-main").is_ok());
        assert!(validate_identifier("Account ID", "  ").is_err());
        assert!(validate_identifier("Account ID", "acc 01").is_err());
        assert!(validate_identifier("Tenant ID", &"x".repeat(65)).is_err());
    }

    #[test]
    fn test_validate_currency_code() {
        assert!(validate_currency_code("EUR").is_ok());
        assert!(validate_currency_code("eur").is_err());
        assert!(validate_currency_code("EURO").is_err());
    }

    #[test]
    fn test_enhanced_validator_requires_description() {
        let row = RawRow::new("2024-03-10", "10.00", "   ", "EUR");
        assert!(EnhancedRowValidator.validate_row(&row).is_err());

        let row = RawRow::new("2024-03-10", "10.00", "Card payment", "EUR");
        assert!(EnhancedRowValidator.validate_row(&row).is_ok());
    }
}
