//! # FEFO Module
//!
//! First-Expired-First-Out ordering of lots and the allocation planner
//! both storage backends run inside their critical section.
//!
//! ## Ordering
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  1. Lots WITH an expiry date, earliest first                            │
//! │  2. Lots WITHOUT an expiry date                                         │
//! │  ties: received_at ascending, then lot id                               │
//! │                                                                         │
//! │  2024-01-10 (5) → 2024-02-01 (5) → no expiry (5)                        │
//! │  sale of 7:  take 5 ──────► take 2            untouched                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Planning is pure: [`plan_allocation`] decides what to take and the
//! backend applies the plan. A failed plan leaves nothing to undo.

use std::cmp::Ordering;

use chrono::NaiveDate;

use crate::error::{LedgerError, LedgerResult};
use crate::types::{Allocation, InventoryLot, LotDepletion, LotQuery, TrackingMode};

/// Total order used for every lot listing and depletion.
pub fn fefo_cmp(a: &InventoryLot, b: &InventoryLot) -> Ordering {
    let by_expiry = match (a.expiry_date, b.expiry_date) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_expiry
        .then_with(|| a.received_at.cmp(&b.received_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Sorts lots in place by [`fefo_cmp`].
pub fn sort_fefo(lots: &mut [InventoryLot]) {
    lots.sort_by(fefo_cmp);
}

/// Applies a [`LotQuery`] to an unordered set of lots.
pub fn select_lots<'a, I>(lots: I, query: &LotQuery) -> Vec<InventoryLot>
where
    I: IntoIterator<Item = &'a InventoryLot>,
{
    let mut selected: Vec<InventoryLot> = lots
        .into_iter()
        .filter(|lot| lot.store_id == query.store_id)
        .filter(|lot| query.sku.as_deref().map_or(true, |sku| lot.sku == sku))
        .filter(|lot| query.include_expired || !lot.is_expired(query.as_of))
        .cloned()
        .collect();
    sort_fefo(&mut selected);
    if let Some(limit) = query.limit {
        selected.truncate(limit);
    }
    selected
}

/// Quantity sellable as of `as_of` across the given lots.
pub fn sellable_quantity(lots: &[InventoryLot], as_of: NaiveDate) -> i64 {
    lots.iter()
        .filter(|lot| lot.qty_available > 0 && !lot.is_expired(as_of))
        .map(|lot| lot.qty_available)
        .sum()
}

/// Counter stock not represented by any lot (expired lots included).
///
/// This is what an `opening` or `adjustment` lot must hold to keep the
/// counter and the lot set in agreement.
pub fn uncovered_quantity(counter: i64, lots: &[InventoryLot]) -> i64 {
    let held: i64 = lots.iter().map(|lot| lot.qty_available).sum();
    (counter - held).max(0)
}

/// Plans taking `requested` units of `sku`.
///
/// - `Counter` mode compares against the counter alone.
/// - `Lots` mode needs the non-expired lot sum AND the counter to cover the
///   request; `available` reported on failure is the smaller of the two.
///
/// `lots` may be in any order and may contain other SKUs.
pub fn plan_allocation(
    sku: &str,
    mode: TrackingMode,
    counter: i64,
    lots: &[InventoryLot],
    requested: i64,
    as_of: NaiveDate,
) -> LedgerResult<Allocation> {
    if requested <= 0 {
        return Err(LedgerError::invalid(format!(
            "allocation quantity for {sku} must be positive"
        )));
    }

    let insufficient = |available: i64| LedgerError::InsufficientStock {
        sku: sku.to_string(),
        available: available.max(0),
        requested,
    };

    match mode {
        TrackingMode::Counter => {
            if counter < requested {
                return Err(insufficient(counter));
            }
            Ok(Allocation {
                sku: sku.to_string(),
                quantity: requested,
                mode,
                depletions: Vec::new(),
            })
        }
        TrackingMode::Lots => {
            let mut eligible: Vec<&InventoryLot> = lots
                .iter()
                .filter(|lot| lot.sku == sku && lot.qty_available > 0 && !lot.is_expired(as_of))
                .collect();
            eligible.sort_by(|a, b| fefo_cmp(a, b));

            let lot_sum: i64 = eligible.iter().map(|lot| lot.qty_available).sum();
            let available = lot_sum.min(counter);
            if available < requested {
                return Err(insufficient(available));
            }

            let mut remaining = requested;
            let mut depletions = Vec::new();
            for lot in eligible {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(lot.qty_available);
                depletions.push(LotDepletion {
                    lot_id: lot.id.clone(),
                    lot_code: lot.lot_code.clone(),
                    quantity: take,
                });
                remaining -= take;
            }

            Ok(Allocation {
                sku: sku.to_string(),
                quantity: requested,
                mode,
                depletions,
            })
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
