//! Import a bank statement, match it against open invoices and bills, then reverse a settlement

use bank_reconciliation_core::utils::{MemoryLedger, MemoryStore};
use bank_reconciliation_core::{
    Actor, Obligation, ObligationSource, ObligationType, RawRow, ReconcileConfig, Reconciler,
    TransactionState,
};
use bigdecimal::BigDecimal;
use chrono::NaiveDate;
use std::str::FromStr;

const TENANT: &str = "acme-books";
const ACCOUNT: &str = "operating-eur";

fn obligation(
    id: &str,
    counterparty: &str,
    amount: &str,
    due: (i32, u32, u32),
    reference: Option<&str>,
    obligation_type: ObligationType,
) -> Result<Obligation, Box<dyn std::error::Error>> {
    let due_date = NaiveDate::from_ymd_opt(due.0, due.1, due.2).ok_or("invalid due date")?;
    Ok(Obligation::new(
        id.to_string(),
        TENANT.to_string(),
        counterparty.to_string(),
        "EUR".to_string(),
        BigDecimal::from_str(amount)?,
        due_date,
        reference.map(str::to_string),
        obligation_type,
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("🏦 Bank Reconciliation Core - Batch Example\n");

    // 1. Open items in the ledger
    let ledger = MemoryLedger::new();
    for item in [
        obligation(
            "inv-007",
            "Nordic Solutions AS",
            "1500.00",
            (2024, 3, 1),
            Some("INV-2024-007"),
            ObligationType::Receivable,
        )?,
        obligation(
            "inv-011",
            "Baltic Commerce SIA",
            "250.00",
            (2024, 3, 5),
            None,
            ObligationType::Receivable,
        )?,
        obligation(
            "inv-012",
            "Baltic Commerce SIA",
            "250.00",
            (2024, 3, 15),
            None,
            ObligationType::Receivable,
        )?,
        obligation(
            "bill-301",
            "Power Co",
            "80.25",
            (2024, 3, 1),
            None,
            ObligationType::Payable,
        )?,
    ] {
        println!(
            "  📄 {} {:?} {} due {}",
            item.id, item.obligation_type, item.amount_due, item.due_date
        );
        ledger.add_obligation(item)?;
    }
    println!();

    let reconciler = Reconciler::new(
        MemoryStore::new(),
        ledger.clone(),
        ReconcileConfig::default(),
    )?;

    // 2. Import the statement twice; the second run is all duplicates
    let rows = vec![
        RawRow::new("2024-03-10", "1500.00", "SEPA CREDIT TRANSFER Nordic Solutions AS", "EUR")
            .with_reference("INV-2024-007"),
        RawRow::new("10.03.2024", "250,00", "Payment from Baltic Commerce SIA", "EUR"),
        RawRow::new("2024-03-02", "-80.25", "Direct debit Power Co", "EUR"),
        RawRow::new("2024-03-04", "-4.50", "Card purchase Coffee House", "EUR"),
        RawRow::new("2024-03-04", "not money", "Broken row", "EUR"),
    ];

    for run in 1..=2 {
        let result = reconciler.import_batch(TENANT, ACCOUNT, &rows).await?;
        println!(
            "📥 Import run {}: {} imported, {} duplicates, {} errors",
            run,
            result.imported,
            result.duplicates,
            result.errors.len()
        );
        for error in &result.errors {
            println!("    ✗ row {}: {}", error.row_index, error.message);
        }
    }
    println!();

    // 3. Automatic matching
    let summary = reconciler.auto_match(TENANT, ACCOUNT).await?;
    println!(
        "🤖 Auto-match: {} matched, {} suggested, {} unmatched\n",
        summary.matched, summary.suggested, summary.unmatched
    );

    // 4. Suggestions awaiting review
    let pending = reconciler
        .list_transactions(TENANT, ACCOUNT, &[TransactionState::Suggested])
        .await?;
    for tx in &pending {
        println!("🔎 {} {} {}", tx.posted_date, tx.amount, tx.description);
        for suggestion in reconciler.get_suggestions(&tx.id).await? {
            println!(
                "    → {} confidence {:.3}{}",
                suggestion.obligation_id,
                suggestion.confidence,
                if suggestion.cross_currency { " (cross-currency)" } else { "" }
            );
            for part in &suggestion.explanation {
                println!("        {:?}: {:.2} x {:.2}", part.field, part.score, part.weight);
            }
        }
    }
    println!();

    // 5. Reverse the first automatic settlement
    if let Some(settlement_id) = summary.settlement_ids.first() {
        let reversal = reconciler
            .reverse_settlement(settlement_id, Actor::user("controller"))
            .await?;
        let restored = ledger
            .get_obligation(TENANT, &reversal.obligation_id)
            .await?
            .map(|o| o.amount_due.to_string())
            .unwrap_or_default();
        println!(
            "↩️  Reversed settlement {} on {}; amount due back to {}",
            settlement_id, reversal.obligation_id, restored
        );
    }

    println!(
        "\n✅ Done. Total still due across the ledger: {}",
        ledger.total_amount_due()?
    );
    Ok(())
}
