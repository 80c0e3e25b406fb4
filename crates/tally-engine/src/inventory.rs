//! # Inventory Ledger
//!
//! Receiving, listing and allocating stock for one or more stores.
//!
//! Lots and counters are owned by the store behind [`LedgerStore`]; this
//! service validates input, stamps times and logs.
//!
//! ## Tracking Modes
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  Counter (default)          first lot received          Lots           │
//! │  ─────────────────   ─────────────────────────────►    ─────────────   │
//! │  counter only               counter stock becomes       FEFO over      │
//! │  check: counter ≥ qty       an `opening` lot            non-expired    │
//! │                                                         lots, capped   │
//! │                                                         by counter     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use chrono::NaiveDate;
use tally_core::validation::{validate_identifier, validate_sku};
use tally_core::{
    Allocation, InventoryLot, LedgerError, LedgerResult, LotQuery, LotSource, NewLot, StockLevel,
    StockMap,
};
use tally_db::LedgerStore;
use tracing::{debug, info, instrument};

use crate::{ledger, system_clock, Clock};

/// A receipt of stock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveLot {
    pub store_id: String,
    pub sku: String,
    pub qty_received: i64,
    pub unit_cost_cents: i64,
    pub expiry_date: Option<NaiveDate>,
    /// Generated when absent.
    pub lot_code: Option<String>,
    pub source: LotSource,
    pub source_ref: Option<String>,
}

impl ReceiveLot {
    /// A manual receipt without expiry.
    pub fn manual(store_id: impl Into<String>, sku: impl Into<String>, qty: i64, unit_cost_cents: i64) -> Self {
        ReceiveLot {
            store_id: store_id.into(),
            sku: sku.into(),
            qty_received: qty,
            unit_cost_cents,
            expiry_date: None,
            lot_code: None,
            source: LotSource::Manual,
            source_ref: None,
        }
    }

    pub fn expiring(mut self, date: NaiveDate) -> Self {
        self.expiry_date = Some(date);
        self
    }
}

/// Stock operations over the ledger store.
#[derive(Clone)]
pub struct InventoryLedger {
    store: Arc<dyn LedgerStore>,
    clock: Clock,
}

impl InventoryLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        InventoryLedger {
            store,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Today, by the ledger clock.
    pub fn today(&self) -> NaiveDate {
        (self.clock)().date_naive()
    }

    // =========================================================================
    // Counters
    // =========================================================================

    /// Counter per SKU; SKUs never stocked report 0.
    pub async fn get_stock(&self, store_id: &str, skus: &[String]) -> LedgerResult<StockMap> {
        validate_identifier("store_id", store_id)?;
        ledger(self.store.get_stock_map(store_id, skus).await)
    }

    pub async fn stock_level(&self, store_id: &str, sku: &str) -> LedgerResult<StockLevel> {
        validate_identifier("store_id", store_id)?;
        ledger(self.store.get_stock_level(store_id, sku).await)
    }

    /// Stock opname: sets the counter to a counted quantity.
    #[instrument(skip_all, fields(store_id = %store_id, sku = %sku))]
    pub async fn set_stock(&self, store_id: &str, sku: &str, quantity: i64) -> LedgerResult<StockLevel> {
        validate_identifier("store_id", store_id)?;
        let level = ledger(self.store.set_stock(store_id, sku, quantity, (self.clock)()).await)?;
        info!(quantity = level.quantity, mode = ?level.tracking_mode, "Stock set");
        Ok(level)
    }

    #[instrument(skip_all, fields(store_id = %store_id, sku = %sku))]
    pub async fn increase_stock(&self, store_id: &str, sku: &str, delta: i64) -> LedgerResult<StockLevel> {
        validate_identifier("store_id", store_id)?;
        let level = ledger(self.store.increase_stock(store_id, sku, delta, (self.clock)()).await)?;
        info!(delta, quantity = level.quantity, "Stock increased");
        Ok(level)
    }

    // =========================================================================
    // Lots
    // =========================================================================

    /// Receives a lot and raises the counter by its quantity.
    #[instrument(skip_all, fields(store_id = %receipt.store_id, sku = %receipt.sku))]
    pub async fn create_lot(&self, receipt: ReceiveLot) -> LedgerResult<InventoryLot> {
        validate_identifier("store_id", &receipt.store_id)?;
        validate_sku(&receipt.sku)?;
        if receipt.qty_received < 1 {
            return Err(LedgerError::invalid("qty_received must be at least 1"));
        }
        if receipt.unit_cost_cents < 1 {
            return Err(LedgerError::invalid("unit_cost must be at least 1"));
        }

        let lot = NewLot {
            store_id: receipt.store_id,
            sku: receipt.sku,
            lot_code: receipt.lot_code,
            expiry_date: receipt.expiry_date,
            qty_received: receipt.qty_received,
            unit_cost_cents: receipt.unit_cost_cents,
            source: receipt.source,
            source_ref: receipt.source_ref,
            received_at: (self.clock)(),
        };
        let created = ledger(self.store.create_inventory_lot(lot).await)?;

        info!(
            lot_code = %created.lot_code,
            qty = created.qty_received,
            expiry = ?created.expiry_date,
            source = created.source.as_str(),
            "Lot received"
        );
        Ok(created)
    }

    /// Lots in FEFO order, expiry judged against today.
    pub async fn list_lots(
        &self,
        store_id: &str,
        sku: Option<&str>,
        include_expired: bool,
        limit: Option<usize>,
    ) -> LedgerResult<Vec<InventoryLot>> {
        self.list_lots_as_of(store_id, sku, include_expired, limit, self.today())
            .await
    }

    pub async fn list_lots_as_of(
        &self,
        store_id: &str,
        sku: Option<&str>,
        include_expired: bool,
        limit: Option<usize>,
        as_of: NaiveDate,
    ) -> LedgerResult<Vec<InventoryLot>> {
        validate_identifier("store_id", store_id)?;
        let query = LotQuery {
            store_id: store_id.to_string(),
            sku: sku.map(str::to_string),
            include_expired,
            as_of,
            limit,
        };
        let lots = ledger(self.store.list_inventory_lots(&query).await)?;
        debug!(store_id, count = lots.len(), "Listed lots");
        Ok(lots)
    }

    /// Depletes `quantity` units of one SKU, FEFO, as of `as_of`.
    ///
    /// Fails with `InsufficientStock` without touching anything when the
    /// sellable quantity is short.
    #[instrument(skip_all, fields(store_id = %store_id, sku = %sku))]
    pub async fn allocate_for_sale(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
    ) -> LedgerResult<Allocation> {
        validate_identifier("store_id", store_id)?;
        validate_sku(sku)?;
        let allocation = ledger(
            self.store
                .allocate_for_sale(store_id, sku, quantity, as_of, (self.clock)())
                .await,
        )?;
        info!(
            quantity,
            lots = allocation.depletions.len(),
            "Allocated for sale"
        );
        Ok(allocation)
    }
}
