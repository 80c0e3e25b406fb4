//! # Ledger Store
//!
//! The storage port consumed by the checkout, reversal and inventory
//! services, and its two implementations.
//!
//! ## Backends
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      dyn LedgerStore                                    │
//! │                                                                         │
//! │   MemoryStore                         SqliteStore                      │
//! │   ─────────────────────────           ─────────────────────────        │
//! │   one tokio Mutex over all            BEGIN IMMEDIATE per mutation     │
//! │   ledger state                        UNIQUE(idempotency_key)          │
//! │   single node, tests                  durable, multi-connection        │
//! │                                                                         │
//! │   Both run the same tally-core planners inside their critical section  │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomicity
//! Every mutating method is one atomic unit: either all of its effects are
//! visible to the next reader or none are. Ceiling checks (stock, refunds,
//! returns) read committed state inside that same unit.

mod inventory;
mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tally_core::pricing::{normalize_cart, CartLine};
use tally_core::reversal;
use tally_core::validation::{
    validate_price_cents, validate_product_name, validate_rate_bps, validate_sku,
};
use tally_core::{
    Allocation, InventoryLot, ItemReturn, LedgerResult, LotQuery, LotSource, NewLot, Product,
    Refund, RefundStatus, StockLevel, StockMap, Transaction, TransactionStatus,
};
use uuid::Uuid;

use crate::error::DbResult;
use inventory::validate_new_lot;

// =============================================================================
// Outcomes
// =============================================================================

/// Result of committing a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckoutOutcome {
    /// The transaction was written and stock depleted.
    Created {
        transaction: Transaction,
        allocations: Vec<Allocation>,
    },
    /// A transaction already holds this idempotency key. Nothing was written.
    Duplicate(Transaction),
}

impl CheckoutOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            CheckoutOutcome::Created { transaction, .. } => transaction,
            CheckoutOutcome::Duplicate(transaction) => transaction,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, CheckoutOutcome::Duplicate(_))
    }
}

/// Result of recording an item return.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemReturnOutcome {
    Created {
        item_return: ItemReturn,
        refund: Option<Refund>,
        /// Lots created to restock the returned units.
        restocked: Vec<InventoryLot>,
        transaction: Transaction,
    },
    /// An item return already holds this idempotency key.
    Duplicate(ItemReturn),
}

/// Result of voiding a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoidOutcome {
    pub transaction: Transaction,
    pub restocked: Vec<InventoryLot>,
}

// =============================================================================
// Port
// =============================================================================

/// Storage port for the ledger.
///
/// Implementations own stock counters and lots exclusively; callers reach
/// them only through these methods.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ----- Transactions -----

    async fn find_transaction_by_idempotency(&self, key: &str) -> DbResult<Option<Transaction>>;

    async fn find_transaction_by_id(&self, id: &str) -> DbResult<Option<Transaction>>;

    /// Atomically: idempotency check, allocation of every line as of
    /// `as_of`, stock and lot depletion, transaction insert.
    ///
    /// Any line that cannot be allocated fails the whole checkout with
    /// `InsufficientStock` and leaves stock untouched.
    async fn create_checkout(&self, tx: Transaction, as_of: NaiveDate) -> DbResult<CheckoutOutcome>;

    /// Atomically: void guard, restock of every line as a `void` lot, status
    /// change.
    async fn void_transaction(&self, id: &str, reason: &str, at: DateTime<Utc>) -> DbResult<VoidOutcome>;

    // ----- Refunds and returns -----

    /// Atomically: ceiling check against committed refunds, insert, status
    /// change when the ceiling is reached. Returns the updated transaction.
    async fn create_refund(&self, refund: Refund) -> DbResult<Transaction>;

    /// Atomically: idempotency check, per-SKU return ceiling, restock as
    /// `return` lots, insert, and (when `refund_up_to_cents > 0`) a refund
    /// capped at the remaining refundable amount.
    async fn create_item_return(
        &self,
        item_return: ItemReturn,
        refund_up_to_cents: i64,
    ) -> DbResult<ItemReturnOutcome>;

    async fn find_item_return_by_idempotency(&self, key: &str) -> DbResult<Option<ItemReturn>>;

    /// Cumulative returned quantity per SKU for a transaction.
    async fn returned_qty_by_transaction(&self, transaction_id: &str) -> DbResult<StockMap>;

    /// Sum of completed refunds for a transaction.
    async fn refunded_total(&self, transaction_id: &str) -> DbResult<i64>;

    async fn list_refunds(&self, transaction_id: &str) -> DbResult<Vec<Refund>>;

    async fn list_item_returns(&self, transaction_id: &str) -> DbResult<Vec<ItemReturn>>;

    // ----- Inventory -----

    /// Creates a lot and increments the store×SKU counter by its quantity.
    ///
    /// The first lot of a SKU switches it to lot tracking; counter stock not
    /// yet held by any lot becomes an `opening` lot.
    async fn create_inventory_lot(&self, lot: NewLot) -> DbResult<InventoryLot>;

    /// Lots in FEFO order.
    async fn list_inventory_lots(&self, query: &LotQuery) -> DbResult<Vec<InventoryLot>>;

    /// Allocates and depletes one SKU outside of a checkout.
    async fn allocate_for_sale(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
        at: DateTime<Utc>,
    ) -> DbResult<Allocation>;

    /// Counter per requested SKU; SKUs never stocked report 0.
    async fn get_stock_map(&self, store_id: &str, skus: &[String]) -> DbResult<StockMap>;

    async fn get_stock_level(&self, store_id: &str, sku: &str) -> DbResult<StockLevel>;

    /// Sets the counter (stock opname). Raising a lot-tracked SKU above what
    /// its lots hold creates an `adjustment` lot for the difference.
    async fn set_stock(&self, store_id: &str, sku: &str, quantity: i64, at: DateTime<Utc>) -> DbResult<StockLevel>;

    /// Adds to the counter, with the same lot rule as [`LedgerStore::set_stock`].
    async fn increase_stock(&self, store_id: &str, sku: &str, delta: i64, at: DateTime<Utc>) -> DbResult<StockLevel>;

    // ----- Catalog -----

    /// Products keyed by SKU; unknown SKUs are absent.
    async fn get_products_by_skus(&self, skus: &[String]) -> DbResult<HashMap<String, Product>>;

    async fn upsert_product(&self, product: Product, updated_at: DateTime<Utc>) -> DbResult<()>;
}

// =============================================================================
// Shared Critical-Section Steps
// =============================================================================
// Both backends call these after loading committed state and before writing.

/// Units demanded per SKU, in first-seen order.
pub(crate) fn line_demand(tx: &Transaction) -> LedgerResult<Vec<CartLine>> {
    let lines: Vec<CartLine> = tx
        .lines
        .iter()
        .map(|l| CartLine::new(l.sku.as_str(), l.quantity))
        .collect();
    normalize_cart(&lines)
}

/// A void ready to be written.
pub(crate) struct SettledVoid {
    pub transaction: Transaction,
    pub restock: Vec<NewLot>,
}

pub(crate) fn settle_void(
    mut tx: Transaction,
    has_reversals: bool,
    reason: &str,
    at: DateTime<Utc>,
) -> LedgerResult<SettledVoid> {
    reversal::ensure_voidable(&tx, has_reversals)?;
    let restock = reversal::void_restock_lots(&tx, at);
    for lot in &restock {
        validate_new_lot(lot)?;
    }
    tx.status = TransactionStatus::Voided;
    tx.void_reason = Some(reason.to_string());
    tx.voided_at = Some(at);
    Ok(SettledVoid {
        transaction: tx,
        restock,
    })
}

/// An item return ready to be written.
pub(crate) struct SettledReturn {
    pub item_return: ItemReturn,
    pub refund: Option<Refund>,
    pub status: TransactionStatus,
    pub restock: Vec<NewLot>,
}

/// Re-prices the return against committed returns and refunds.
///
/// Lines and credit are recomputed from the original sale, so a stale
/// caller-side quote can never exceed the ceilings.
pub(crate) fn settle_item_return(
    tx: &Transaction,
    already_returned: &StockMap,
    refunded_cents: i64,
    mut item_return: ItemReturn,
    refund_up_to_cents: i64,
) -> LedgerResult<SettledReturn> {
    let requested: Vec<CartLine> = item_return
        .lines
        .iter()
        .map(|l| CartLine::new(l.sku.as_str(), l.quantity))
        .collect();
    let lines = reversal::plan_return(tx, already_returned, &requested)?;
    item_return.credit_cents = lines.iter().map(|l| l.amount_cents).sum();
    item_return.lines = lines;

    let mut status = tx.status;
    let mut refund = None;
    if refund_up_to_cents > 0 {
        let amount = reversal::refundable_credit(refund_up_to_cents, tx.total_cents, refunded_cents)?;
        status = reversal::check_refund(tx, refunded_cents, amount)?;
        let issued = Refund {
            id: Uuid::new_v4().to_string(),
            transaction_id: tx.id.clone(),
            amount_cents: amount,
            status: RefundStatus::Completed,
            reason: item_return.reason.clone(),
            item_return_id: Some(item_return.id.clone()),
            created_at: item_return.created_at,
        };
        item_return.refund_id = Some(issued.id.clone());
        refund = Some(issued);
    }

    let quantities: Vec<(String, i64)> = item_return
        .lines
        .iter()
        .map(|l| (l.sku.clone(), l.quantity))
        .collect();
    let restock = reversal::restock_lots(
        tx,
        &quantities,
        LotSource::Return,
        &item_return.id,
        item_return.created_at,
    );
    for lot in &restock {
        validate_new_lot(lot)?;
    }

    Ok(SettledReturn {
        item_return,
        refund,
        status,
        restock,
    })
}

/// Catalog rows both backends accept.
pub(crate) fn validate_product(product: &Product) -> LedgerResult<()> {
    validate_sku(&product.sku)?;
    validate_product_name(&product.name)?;
    validate_price_cents(product.price_cents)?;
    validate_rate_bps("margin", product.margin_bps)?;
    Ok(())
}
