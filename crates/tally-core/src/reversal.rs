//! # Reversal Rules
//!
//! Preconditions and ceilings for voids, refunds and item returns.
//!
//! Storage backends evaluate these inside the same critical section that
//! writes the reversal, against committed state.
//!
//! ```text
//! ┌──────────────┬───────────────────────────────────────────────────────────┐
//! │ Void         │ status == paid, no refunds, no item returns              │
//! │ Refund       │ status == paid, Σ refunds + amount ≤ total               │
//! │ Item return  │ per SKU: Σ returned + requested ≤ purchased              │
//! └──────────────┴───────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Utc};

use crate::error::{LedgerError, LedgerResult};
use crate::pricing::{normalize_cart, CartLine};
use crate::types::{
    LotSource, NewLot, ReturnLine, StockMap, Transaction, TransactionStatus,
};

/// Checks a transaction can be voided.
///
/// `has_reversals` is true when any refund or item return references it.
pub fn ensure_voidable(tx: &Transaction, has_reversals: bool) -> LedgerResult<()> {
    if tx.status != TransactionStatus::Paid {
        return Err(LedgerError::invalid(format!(
            "transaction {} is {} and cannot be voided",
            tx.id,
            tx.status.as_str()
        )));
    }
    if has_reversals {
        return Err(LedgerError::invalid(format!(
            "transaction {} has refunds or returns and cannot be voided",
            tx.id
        )));
    }
    Ok(())
}

/// Checks a refund of `amount_cents` fits under the ceiling and returns the
/// status the transaction moves to.
///
/// ## Example
/// ```rust
/// # use tally_core::reversal::refund_outcome;
/// # use tally_core::types::TransactionStatus;
/// assert_eq!(refund_outcome(5000, 4000, 1000).unwrap(), TransactionStatus::Refunded);
/// assert_eq!(refund_outcome(5000, 2000, 2000).unwrap(), TransactionStatus::Paid);
/// assert!(refund_outcome(5000, 4000, 2000).is_err());
/// ```
pub fn refund_outcome(
    total_cents: i64,
    refunded_cents: i64,
    amount_cents: i64,
) -> LedgerResult<TransactionStatus> {
    if amount_cents <= 0 {
        return Err(LedgerError::invalid("refund amount must be positive"));
    }
    let remaining = total_cents - refunded_cents;
    if amount_cents > remaining {
        return Err(LedgerError::invalid(format!(
            "refund of {amount_cents} exceeds remaining refundable amount {remaining}"
        )));
    }
    if amount_cents == remaining {
        Ok(TransactionStatus::Refunded)
    } else {
        Ok(TransactionStatus::Paid)
    }
}

/// Checks a refund against a transaction's status and prior refunds.
pub fn check_refund(
    tx: &Transaction,
    refunded_cents: i64,
    amount_cents: i64,
) -> LedgerResult<TransactionStatus> {
    if tx.status != TransactionStatus::Paid {
        return Err(LedgerError::invalid(format!(
            "transaction {} is {} and cannot be refunded",
            tx.id,
            tx.status.as_str()
        )));
    }
    refund_outcome(tx.total_cents, refunded_cents, amount_cents)
}

/// Prices a return request against the original sale.
///
/// Requested lines are normalised first. Each SKU must have been bought on
/// `tx` and must not exceed `purchased − already_returned`.
pub fn plan_return(
    tx: &Transaction,
    already_returned: &StockMap,
    requested: &[CartLine],
) -> LedgerResult<Vec<ReturnLine>> {
    if tx.status != TransactionStatus::Paid {
        return Err(LedgerError::invalid(format!(
            "transaction {} is {} and cannot take returns",
            tx.id,
            tx.status.as_str()
        )));
    }

    let requested = normalize_cart(requested)?;
    if requested.is_empty() {
        return Err(LedgerError::invalid("return has no items"));
    }

    let purchased = tx.purchased_quantities();
    requested
        .into_iter()
        .map(|line| {
            let sale_line = tx.line(&line.sku).ok_or_else(|| {
                LedgerError::invalid(format!(
                    "sku {} was not sold on transaction {}",
                    line.sku, tx.id
                ))
            })?;
            let bought = purchased.get(&line.sku).copied().unwrap_or(0);
            let returned = already_returned.get(&line.sku).copied().unwrap_or(0);
            let returnable = bought - returned;
            if line.quantity > returnable {
                return Err(LedgerError::invalid(format!(
                    "cannot return {} of {}: {} returnable",
                    line.quantity, line.sku, returnable
                )));
            }
            Ok(ReturnLine {
                amount_cents: sale_line.unit_price_cents * line.quantity,
                sku: line.sku,
                quantity: line.quantity,
                unit_price_cents: sale_line.unit_price_cents,
            })
        })
        .collect()
}

/// Caps a return credit at what is still refundable.
pub fn refundable_credit(credit_cents: i64, total_cents: i64, refunded_cents: i64) -> LedgerResult<i64> {
    let remaining = total_cents - refunded_cents;
    if remaining <= 0 {
        return Err(LedgerError::invalid("transaction has nothing left to refund"));
    }
    Ok(credit_cents.min(remaining))
}

/// Builds one restock lot per SKU of `quantities`, costed from the sale.
///
/// Restock lots have no expiry and point back at `source_ref`.
pub fn restock_lots(
    tx: &Transaction,
    quantities: &[(String, i64)],
    source: LotSource,
    source_ref: &str,
    at: DateTime<Utc>,
) -> Vec<NewLot> {
    quantities
        .iter()
        .filter(|(_, qty)| *qty > 0)
        .map(|(sku, qty)| NewLot {
            store_id: tx.store_id.clone(),
            sku: sku.clone(),
            lot_code: None,
            expiry_date: None,
            qty_received: *qty,
            unit_cost_cents: tx.line(sku).map_or(1, |l| l.unit_cost_cents()),
            source,
            source_ref: Some(source_ref.to_string()),
            received_at: at,
        })
        .collect()
}

/// Restock lots for voiding every line of `tx`.
pub fn void_restock_lots(tx: &Transaction, at: DateTime<Utc>) -> Vec<NewLot> {
    let quantities: Vec<(String, i64)> = tx
        .lines
        .iter()
        .map(|l| (l.sku.clone(), l.quantity))
        .collect();
    restock_lots(tx, &quantities, LotSource::Void, &tx.id, at)
}

// =============================================================================
// Unit Tests
// =============================================================================
