//! In-memory inventory book and the lot rules both backends share.
//!
//! ```text
//!  receive(lot) ──► Counter mode? ──yes──► opening lot for counter stock
//!       │                                   mode := Lots
//!       ▼
//!  push lot, counter += received
//!
//!  plan(sku, qty) ──► tally_core::fefo::plan_allocation   (no mutation)
//!  apply(plan)    ──► lots −= depletions, counter −= qty
//! ```

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use tally_core::fefo;
use tally_core::validation::validate_sku;
use tally_core::{
    Allocation, InventoryLot, LedgerError, LedgerResult, LotQuery, LotSource, NewLot, StockLevel,
    StockMap, TrackingMode,
};

// =============================================================================
// Shared Lot Rules
// =============================================================================

/// Rejects lots that could never be stored.
pub(crate) fn validate_new_lot(lot: &NewLot) -> LedgerResult<()> {
    validate_sku(&lot.sku)?;
    if lot.qty_received < 1 {
        return Err(LedgerError::invalid("lot quantity must be at least 1"));
    }
    if lot.unit_cost_cents < 1 {
        return Err(LedgerError::invalid("lot unit cost must be at least 1"));
    }
    Ok(())
}

/// Lot holding counter stock that predates a SKU's first lot.
pub(crate) fn opening_lot(level: &StockLevel, incoming: &NewLot) -> Option<NewLot> {
    if level.tracking_mode != TrackingMode::Counter || level.quantity <= 0 {
        return None;
    }
    Some(NewLot {
        store_id: incoming.store_id.clone(),
        sku: incoming.sku.clone(),
        lot_code: None,
        expiry_date: None,
        qty_received: level.quantity,
        unit_cost_cents: incoming.unit_cost_cents,
        source: LotSource::Opening,
        source_ref: None,
        received_at: incoming.received_at,
    })
}

/// Lot holding counter stock that no lot holds after an administrative raise.
///
/// `lots` are all lots of the store×SKU. Costed like the most recent receipt.
pub(crate) fn adjustment_lot(
    level: &StockLevel,
    lots: &[InventoryLot],
    at: DateTime<Utc>,
) -> Option<NewLot> {
    if level.tracking_mode != TrackingMode::Lots {
        return None;
    }
    let uncovered = fefo::uncovered_quantity(level.quantity, lots);
    if uncovered == 0 {
        return None;
    }
    let unit_cost_cents = lots
        .iter()
        .max_by(|a, b| a.received_at.cmp(&b.received_at).then_with(|| a.id.cmp(&b.id)))
        .map_or(1, |lot| lot.unit_cost_cents);
    Some(NewLot {
        store_id: level.store_id.clone(),
        sku: level.sku.clone(),
        lot_code: None,
        expiry_date: None,
        qty_received: uncovered,
        unit_cost_cents,
        source: LotSource::Adjustment,
        source_ref: None,
        received_at: at,
    })
}

/// Counter value after an administrative change.
pub(crate) fn adjusted_quantity(current: i64, set_to: Option<i64>, delta: i64) -> LedgerResult<i64> {
    match set_to {
        Some(qty) if qty < 0 => Err(LedgerError::invalid("stock quantity cannot be negative")),
        Some(qty) => Ok(qty),
        None if delta < 1 => Err(LedgerError::invalid("stock increase must be at least 1")),
        None => received_quantity(current, delta),
    }
}

/// Counter after taking `received` units in.
pub(crate) fn received_quantity(current: i64, received: i64) -> LedgerResult<i64> {
    current
        .checked_add(received)
        .ok_or_else(|| LedgerError::invalid("stock quantity overflows"))
}

// =============================================================================
// Inventory Book
// =============================================================================

type StockKey = (String, String);

fn key(store_id: &str, sku: &str) -> StockKey {
    (store_id.to_string(), sku.to_string())
}

/// Stock counters and lots of the in-memory backend.
#[derive(Debug, Default)]
pub(crate) struct InventoryBook {
    levels: HashMap<StockKey, StockLevel>,
    lots: HashMap<StockKey, Vec<InventoryLot>>,
}

impl InventoryBook {
    pub fn level(&self, store_id: &str, sku: &str) -> StockLevel {
        self.levels
            .get(&key(store_id, sku))
            .cloned()
            .unwrap_or_else(|| StockLevel {
                store_id: store_id.to_string(),
                sku: sku.to_string(),
                quantity: 0,
                tracking_mode: TrackingMode::Counter,
            })
    }

    pub fn stock_map(&self, store_id: &str, skus: &[String]) -> StockMap {
        skus.iter()
            .map(|sku| (sku.clone(), self.level(store_id, sku).quantity))
            .collect()
    }

    fn lots_of(&self, store_id: &str, sku: &str) -> &[InventoryLot] {
        self.lots
            .get(&key(store_id, sku))
            .map(|lots| lots.as_slice())
            .unwrap_or(&[])
    }

    /// Stores a lot, switching the SKU to lot tracking on first receipt.
    pub fn receive(&mut self, lot: NewLot) -> LedgerResult<InventoryLot> {
        validate_new_lot(&lot)?;

        let k = key(&lot.store_id, &lot.sku);
        let mut level = self.level(&lot.store_id, &lot.sku);
        let quantity = received_quantity(level.quantity, lot.qty_received)?;
        let bucket = self.lots.entry(k.clone()).or_default();

        if let Some(opening) = opening_lot(&level, &lot) {
            bucket.push(opening.into_lot());
        }
        level.tracking_mode = TrackingMode::Lots;

        let created = lot.into_lot();
        level.quantity = quantity;
        bucket.push(created.clone());
        self.levels.insert(k, level);

        Ok(created)
    }

    pub fn list(&self, query: &LotQuery) -> Vec<InventoryLot> {
        match &query.sku {
            Some(sku) => fefo::select_lots(self.lots_of(&query.store_id, sku), query),
            None => fefo::select_lots(self.lots.values().flatten(), query),
        }
    }

    /// Plans an allocation without touching state.
    pub fn plan(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
    ) -> LedgerResult<Allocation> {
        let level = self.level(store_id, sku);
        fefo::plan_allocation(
            sku,
            level.tracking_mode,
            level.quantity,
            self.lots_of(store_id, sku),
            quantity,
            as_of,
        )
    }

    /// Applies a plan produced by [`InventoryBook::plan`] under the same lock.
    pub fn apply(&mut self, store_id: &str, allocation: &Allocation) {
        let k = key(store_id, &allocation.sku);
        if let Some(lots) = self.lots.get_mut(&k) {
            for depletion in &allocation.depletions {
                if let Some(lot) = lots.iter_mut().find(|l| l.id == depletion.lot_id) {
                    lot.qty_available -= depletion.quantity;
                }
            }
        }
        if let Some(level) = self.levels.get_mut(&k) {
            level.quantity -= allocation.quantity;
        }
    }

    /// Sets (`set_to`) or increments (`delta`) the counter.
    pub fn adjust(
        &mut self,
        store_id: &str,
        sku: &str,
        set_to: Option<i64>,
        delta: i64,
        at: DateTime<Utc>,
    ) -> LedgerResult<StockLevel> {
        validate_sku(sku)?;
        let mut level = self.level(store_id, sku);
        level.quantity = adjusted_quantity(level.quantity, set_to, delta)?;

        if let Some(lot) = adjustment_lot(&level, self.lots_of(store_id, sku), at) {
            self.lots
                .entry(key(store_id, sku))
                .or_default()
                .push(lot.into_lot());
        }

        self.levels.insert(key(store_id, sku), level.clone());
        Ok(level)
    }
}
