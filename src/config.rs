//! Tunable thresholds and import settings

use bigdecimal::BigDecimal;
use num_traits::Signed;
use serde::{Deserialize, Serialize};

use crate::types::*;

/// Largest accepted candidate search radius, in days
pub const MAX_DATE_WINDOW_DAYS: i64 = 3_660;

/// Matcher weights and thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchConfig {
    pub amount_weight: f64,
    pub reference_weight: f64,
    pub counterparty_weight: f64,
    pub date_weight: f64,
    /// Minimum confidence for automatic settlement (amount must also be exact)
    pub auto_match_threshold: f64,
    /// Minimum confidence for a pair to be surfaced at all
    pub suggestion_floor: f64,
    /// Candidate search radius around the transaction date, in days
    pub date_window_days: i64,
    /// Absolute difference still treated as an exact amount
    pub amount_epsilon: BigDecimal,
    /// Relative difference beyond which the amount earns no credit
    pub amount_tolerance_ratio: f64,
    /// Highest amount score a non-exact amount can earn
    pub partial_amount_ceiling: f64,
    /// Confidence ceiling for pairs in different currencies
    pub cross_currency_cap: f64,
    /// Surface cross-currency pairs from `get_suggestions`
    pub include_cross_currency: bool,
    /// Upper bound on the suggestions returned per transaction
    pub max_suggestions: usize,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            amount_weight: 0.40,
            reference_weight: 0.30,
            counterparty_weight: 0.20,
            date_weight: 0.10,
            auto_match_threshold: 0.85,
            suggestion_floor: 0.50,
            date_window_days: 45,
            amount_epsilon: BigDecimal::new(1.into(), 2),
            amount_tolerance_ratio: 0.05,
            partial_amount_ceiling: 0.8,
            cross_currency_cap: 0.50,
            include_cross_currency: true,
            max_suggestions: 5,
        }
    }
}

impl MatchConfig {
    pub fn validate(&self) -> ReconcileResult<()> {
        let weights = [
            ("amount_weight", self.amount_weight),
            ("reference_weight", self.reference_weight),
            ("counterparty_weight", self.counterparty_weight),
            ("date_weight", self.date_weight),
        ];
        for (name, weight) in weights {
            if !(0.0..=1.0).contains(&weight) {
                return Err(ReconcileError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, weight
                )));
            }
        }

        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ReconcileError::Config(format!(
                "Match weights must sum to 1, got {}",
                total
            )));
        }

        for (name, value) in [
            ("auto_match_threshold", self.auto_match_threshold),
            ("suggestion_floor", self.suggestion_floor),
            ("partial_amount_ceiling", self.partial_amount_ceiling),
            ("cross_currency_cap", self.cross_currency_cap),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ReconcileError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.suggestion_floor > self.auto_match_threshold {
            return Err(ReconcileError::Config(
                "suggestion_floor cannot exceed auto_match_threshold".to_string(),
            ));
        }

        if self.date_window_days <= 0 || self.date_window_days > MAX_DATE_WINDOW_DAYS {
            return Err(ReconcileError::Config(format!(
                "date_window_days must be within [1, {}], got {}",
                MAX_DATE_WINDOW_DAYS, self.date_window_days
            )));
        }

        if self.amount_epsilon.is_negative() || self.amount_tolerance_ratio < 0.0 {
            return Err(ReconcileError::Config(
                "Amount tolerances cannot be negative".to_string(),
            ));
        }

        if self.max_suggestions == 0 {
            return Err(ReconcileError::Config(
                "max_suggestions must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings for turning parser rows into transactions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Accepted `chrono` date formats, tried in order
    pub date_formats: Vec<String>,
    /// Currency assumed when a row carries none
    pub default_currency: Option<String>,
    /// Budget for one obligation snapshot fetch; on expiry the pass sees no candidates
    pub snapshot_timeout_ms: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            date_formats: vec![
                "%Y-%m-%d".to_string(),
                "%d.%m.%Y".to_string(),
                "%d/%m/%Y".to_string(),
                "%m/%d/%Y".to_string(),
            ],
            default_currency: None,
            snapshot_timeout_ms: 5_000,
        }
    }
}

impl ImportConfig {
    pub fn validate(&self) -> ReconcileResult<()> {
        if self.date_formats.is_empty() {
            return Err(ReconcileError::Config(
                "At least one date format is required".to_string(),
            ));
        }

        if let Some(currency) = &self.default_currency {
            crate::utils::validate_currency_code(currency)
                .map_err(|e| ReconcileError::Config(e.to_string()))?;
        }

        if self.snapshot_timeout_ms == 0 {
            return Err(ReconcileError::Config(
                "snapshot_timeout_ms must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Top-level configuration of a reconciler
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    pub matching: MatchConfig,
    pub import: ImportConfig,
}

impl ReconcileConfig {
    /// Parse a (possibly partial) JSON document; missing keys keep their defaults
    pub fn from_json_str(json: &str) -> ReconcileResult<Self> {
        let config: ReconcileConfig = serde_json::from_str(json)
            .map_err(|e| ReconcileError::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ReconcileResult<()> {
        self.matching.validate()?;
        self.import.validate()
    }
}
