//! # SQLite Ledger Store
//!
//! Durable [`LedgerStore`] over a [`SqlitePool`].
//!
//! ## Critical Sections
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │  acquire conn ─► BEGIN IMMEDIATE ─► read ─► plan ─► write ─► COMMIT  │
//! │                        │                                     │       │
//! │                  write lock taken               any Err ─► ROLLBACK  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `BEGIN IMMEDIATE` takes SQLite's write lock before the first read, so
//! two writers never plan against the same committed state. Readers keep
//! running against WAL snapshots.
//!
//! A writer that cannot get the lock within `busy_timeout` fails with
//! [`DbError::Busy`], which callers may retry.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tally_core::fefo;
use tally_core::reversal;
use tally_core::validation::validate_sku;
use tally_core::{
    Allocation, InventoryLot, ItemReturn, LedgerError, LotQuery, NewLot, PaymentMethod,
    PaymentSplit, Product, Refund, ReturnLine, ReturnMode, StockLevel, StockMap, TrackingMode,
    Transaction, TransactionLine, TransactionStatus,
};
use tracing::{debug, warn};

use super::inventory::{
    adjusted_quantity, adjustment_lot, opening_lot, received_quantity, validate_new_lot,
};
use super::{
    line_demand, settle_item_return, settle_void, validate_product, CheckoutOutcome,
    ItemReturnOutcome, LedgerStore, VoidOutcome,
};
use crate::error::{DbError, DbResult};

const TRANSACTION_KEY_COLUMN: &str = "transactions.idempotency_key";
const RETURN_KEY_COLUMN: &str = "item_returns.idempotency_key";

const LOT_COLUMNS: &str = "id, store_id, sku, lot_code, expiry_date, qty_received, \
    qty_available, unit_cost_cents, source, source_ref, received_at";

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct TransactionRow {
    id: String,
    store_id: String,
    terminal_id: String,
    idempotency_key: String,
    payment_method: PaymentMethod,
    payment_reference: Option<String>,
    subtotal_cents: i64,
    discount_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    cash_received_cents: i64,
    change_cents: i64,
    status: TransactionStatus,
    manual_override: bool,
    void_reason: Option<String>,
    voided_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TransactionRow {
    fn into_transaction(self, lines: Vec<TransactionLine>, splits: Vec<PaymentSplit>) -> Transaction {
        Transaction {
            id: self.id,
            store_id: self.store_id,
            terminal_id: self.terminal_id,
            idempotency_key: self.idempotency_key,
            payment_method: self.payment_method,
            payment_reference: self.payment_reference,
            payment_splits: splits,
            lines,
            subtotal_cents: self.subtotal_cents,
            discount_cents: self.discount_cents,
            tax_cents: self.tax_cents,
            total_cents: self.total_cents,
            cash_received_cents: self.cash_received_cents,
            change_cents: self.change_cents,
            status: self.status,
            manual_override: self.manual_override,
            void_reason: self.void_reason,
            voided_at: self.voided_at,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LineRow {
    sku: String,
    name: String,
    quantity: i64,
    unit_price_cents: i64,
    margin_bps: i64,
    line_total_cents: i64,
}

impl From<LineRow> for TransactionLine {
    fn from(row: LineRow) -> Self {
        TransactionLine {
            sku: row.sku,
            name: row.name,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            margin_bps: bps_from_column(row.margin_bps),
            line_total_cents: row.line_total_cents,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SplitRow {
    method: PaymentMethod,
    amount_cents: i64,
    reference: Option<String>,
}

impl From<SplitRow> for PaymentSplit {
    fn from(row: SplitRow) -> Self {
        PaymentSplit {
            method: row.method,
            amount_cents: row.amount_cents,
            reference: row.reference,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ItemReturnRow {
    id: String,
    transaction_id: String,
    store_id: String,
    idempotency_key: Option<String>,
    mode: ReturnMode,
    credit_cents: i64,
    exchange_transaction_id: Option<String>,
    additional_payment_cents: i64,
    refund_id: Option<String>,
    reason: Option<String>,
    created_at: DateTime<Utc>,
}

impl ItemReturnRow {
    fn into_item_return(self, lines: Vec<ReturnLine>) -> ItemReturn {
        ItemReturn {
            id: self.id,
            transaction_id: self.transaction_id,
            store_id: self.store_id,
            idempotency_key: self.idempotency_key,
            mode: self.mode,
            lines,
            credit_cents: self.credit_cents,
            exchange_transaction_id: self.exchange_transaction_id,
            additional_payment_cents: self.additional_payment_cents,
            refund_id: self.refund_id,
            reason: self.reason,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProductRow {
    sku: String,
    name: String,
    price_cents: i64,
    margin_bps: i64,
    is_active: bool,
}

impl From<ProductRow> for Product {
    fn from(row: ProductRow) -> Self {
        Product {
            sku: row.sku,
            name: row.name,
            price_cents: row.price_cents,
            margin_bps: bps_from_column(row.margin_bps),
            is_active: row.is_active,
        }
    }
}

/// Basis points are CHECK-constrained to 0..=10000 in the schema.
fn bps_from_column(value: i64) -> u32 {
    u32::try_from(value.clamp(0, 10_000)).unwrap_or(0)
}

// =============================================================================
// Store
// =============================================================================

/// Ledger persisted in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// A pooled connection inside `BEGIN IMMEDIATE`.
    async fn write_lock(&self) -> DbResult<WriteTx> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

// ----- Write lock -----

type WriteTx = sqlx::Transaction<'static, Sqlite>;

/// Commits on `Ok`, rolls back on `Err`. Dropping the transaction before
/// either happens also rolls back, so a cancelled caller never returns a
/// connection to the pool with the write lock still held.
async fn finish<T>(tx: WriteTx, result: DbResult<T>) -> DbResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(err)
        }
    }
}

// ----- Transactions -----

async fn load_transaction(conn: &mut SqliteConnection, id: &str) -> DbResult<Option<Transaction>> {
    let row: Option<TransactionRow> = sqlx::query_as("SELECT * FROM transactions WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(Some(hydrate_transaction(conn, row).await?)),
        None => Ok(None),
    }
}

async fn load_transaction_by_key(
    conn: &mut SqliteConnection,
    key: &str,
) -> DbResult<Option<Transaction>> {
    let row: Option<TransactionRow> =
        sqlx::query_as("SELECT * FROM transactions WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    match row {
        Some(row) => Ok(Some(hydrate_transaction(conn, row).await?)),
        None => Ok(None),
    }
}

async fn require_transaction(conn: &mut SqliteConnection, id: &str) -> DbResult<Transaction> {
    load_transaction(conn, id)
        .await?
        .ok_or_else(|| LedgerError::not_found("transaction", id).into())
}

async fn hydrate_transaction(conn: &mut SqliteConnection, row: TransactionRow) -> DbResult<Transaction> {
    let lines: Vec<LineRow> = sqlx::query_as(
        "SELECT sku, name, quantity, unit_price_cents, margin_bps, line_total_cents \
         FROM transaction_lines WHERE transaction_id = ? ORDER BY line_no",
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?;

    let splits: Vec<SplitRow> = sqlx::query_as(
        "SELECT method, amount_cents, reference \
         FROM payment_splits WHERE transaction_id = ? ORDER BY split_no",
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(row.into_transaction(
        lines.into_iter().map(Into::into).collect(),
        splits.into_iter().map(Into::into).collect(),
    ))
}

async fn insert_transaction(conn: &mut SqliteConnection, tx: &Transaction) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO transactions (id, store_id, terminal_id, idempotency_key, payment_method, \
         payment_reference, subtotal_cents, discount_cents, tax_cents, total_cents, \
         cash_received_cents, change_cents, status, manual_override, void_reason, voided_at, \
         created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&tx.id)
    .bind(&tx.store_id)
    .bind(&tx.terminal_id)
    .bind(&tx.idempotency_key)
    .bind(tx.payment_method)
    .bind(tx.payment_reference.as_deref())
    .bind(tx.subtotal_cents)
    .bind(tx.discount_cents)
    .bind(tx.tax_cents)
    .bind(tx.total_cents)
    .bind(tx.cash_received_cents)
    .bind(tx.change_cents)
    .bind(tx.status)
    .bind(tx.manual_override)
    .bind(tx.void_reason.as_deref())
    .bind(tx.voided_at)
    .bind(tx.created_at)
    .execute(&mut *conn)
    .await?;

    for (line_no, line) in tx.lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO transaction_lines (transaction_id, line_no, sku, name, quantity, \
             unit_price_cents, margin_bps, line_total_cents) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&tx.id)
        .bind(line_no as i64)
        .bind(&line.sku)
        .bind(&line.name)
        .bind(line.quantity)
        .bind(line.unit_price_cents)
        .bind(i64::from(line.margin_bps))
        .bind(line.line_total_cents)
        .execute(&mut *conn)
        .await?;
    }

    for (split_no, split) in tx.payment_splits.iter().enumerate() {
        sqlx::query(
            "INSERT INTO payment_splits (transaction_id, split_no, method, amount_cents, reference) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&tx.id)
        .bind(split_no as i64)
        .bind(split.method)
        .bind(split.amount_cents)
        .bind(split.reference.as_deref())
        .execute(&mut *conn)
        .await?;
    }

    Ok(())
}

async fn update_status(conn: &mut SqliteConnection, tx: &Transaction) -> DbResult<()> {
    sqlx::query("UPDATE transactions SET status = ?, void_reason = ?, voided_at = ? WHERE id = ?")
        .bind(tx.status)
        .bind(tx.void_reason.as_deref())
        .bind(tx.voided_at)
        .bind(&tx.id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ----- Reversals -----

async fn sum_refunds(conn: &mut SqliteConnection, transaction_id: &str) -> DbResult<i64> {
    let total: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount_cents), 0) FROM refunds \
         WHERE transaction_id = ? AND status = 'completed'",
    )
    .bind(transaction_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(total)
}

async fn sum_returned(conn: &mut SqliteConnection, transaction_id: &str) -> DbResult<StockMap> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT l.sku, SUM(l.quantity) FROM item_return_lines l \
         JOIN item_returns r ON r.id = l.item_return_id \
         WHERE r.transaction_id = ? GROUP BY l.sku",
    )
    .bind(transaction_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().collect())
}

async fn has_reversals(conn: &mut SqliteConnection, transaction_id: &str) -> DbResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT (SELECT COUNT(*) FROM refunds WHERE transaction_id = ?1) \
              + (SELECT COUNT(*) FROM item_returns WHERE transaction_id = ?1)",
    )
    .bind(transaction_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count > 0)
}

async fn insert_refund(conn: &mut SqliteConnection, refund: &Refund) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO refunds (id, transaction_id, amount_cents, status, reason, item_return_id, \
         created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&refund.id)
    .bind(&refund.transaction_id)
    .bind(refund.amount_cents)
    .bind(refund.status)
    .bind(refund.reason.as_deref())
    .bind(refund.item_return_id.as_deref())
    .bind(refund.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn insert_item_return(conn: &mut SqliteConnection, item_return: &ItemReturn) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO item_returns (id, transaction_id, store_id, idempotency_key, mode, \
         credit_cents, exchange_transaction_id, additional_payment_cents, refund_id, reason, \
         created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&item_return.id)
    .bind(&item_return.transaction_id)
    .bind(&item_return.store_id)
    .bind(item_return.idempotency_key.as_deref())
    .bind(item_return.mode)
    .bind(item_return.credit_cents)
    .bind(item_return.exchange_transaction_id.as_deref())
    .bind(item_return.additional_payment_cents)
    .bind(item_return.refund_id.as_deref())
    .bind(item_return.reason.as_deref())
    .bind(item_return.created_at)
    .execute(&mut *conn)
    .await?;

    for (line_no, line) in item_return.lines.iter().enumerate() {
        sqlx::query(
            "INSERT INTO item_return_lines (item_return_id, line_no, sku, quantity, \
             unit_price_cents, amount_cents) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item_return.id)
        .bind(line_no as i64)
        .bind(&line.sku)
        .bind(line.quantity)
        .bind(line.unit_price_cents)
        .bind(line.amount_cents)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn hydrate_item_return(conn: &mut SqliteConnection, row: ItemReturnRow) -> DbResult<ItemReturn> {
    let lines: Vec<ReturnLine> = sqlx::query_as(
        "SELECT sku, quantity, unit_price_cents, amount_cents FROM item_return_lines \
         WHERE item_return_id = ? ORDER BY line_no",
    )
    .bind(&row.id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(row.into_item_return(lines))
}

async fn load_item_return_by_key(
    conn: &mut SqliteConnection,
    key: &str,
) -> DbResult<Option<ItemReturn>> {
    let row: Option<ItemReturnRow> =
        sqlx::query_as("SELECT * FROM item_returns WHERE idempotency_key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    match row {
        Some(row) => Ok(Some(hydrate_item_return(conn, row).await?)),
        None => Ok(None),
    }
}

// ----- Inventory -----

async fn load_level(conn: &mut SqliteConnection, store_id: &str, sku: &str) -> DbResult<StockLevel> {
    let level: Option<StockLevel> = sqlx::query_as(
        "SELECT store_id, sku, quantity, tracking_mode FROM stock_levels \
         WHERE store_id = ? AND sku = ?",
    )
    .bind(store_id)
    .bind(sku)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(level.unwrap_or_else(|| StockLevel {
        store_id: store_id.to_string(),
        sku: sku.to_string(),
        quantity: 0,
        tracking_mode: TrackingMode::Counter,
    }))
}

async fn save_level(conn: &mut SqliteConnection, level: &StockLevel, at: DateTime<Utc>) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO stock_levels (store_id, sku, quantity, tracking_mode, updated_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(store_id, sku) DO UPDATE SET \
            quantity = excluded.quantity, \
            tracking_mode = excluded.tracking_mode, \
            updated_at = excluded.updated_at",
    )
    .bind(&level.store_id)
    .bind(&level.sku)
    .bind(level.quantity)
    .bind(level.tracking_mode)
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn load_lots(conn: &mut SqliteConnection, store_id: &str, sku: &str) -> DbResult<Vec<InventoryLot>> {
    let sql = format!(
        "SELECT {LOT_COLUMNS} FROM inventory_lots WHERE store_id = ? AND sku = ? \
         ORDER BY expiry_date IS NULL, expiry_date, received_at, id"
    );
    let lots = sqlx::query_as(&sql)
        .bind(store_id)
        .bind(sku)
        .fetch_all(&mut *conn)
        .await?;
    Ok(lots)
}

async fn insert_lot(conn: &mut SqliteConnection, lot: &InventoryLot) -> DbResult<()> {
    sqlx::query(
        "INSERT INTO inventory_lots (id, store_id, sku, lot_code, expiry_date, qty_received, \
         qty_available, unit_cost_cents, source, source_ref, received_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&lot.id)
    .bind(&lot.store_id)
    .bind(&lot.sku)
    .bind(&lot.lot_code)
    .bind(lot.expiry_date)
    .bind(lot.qty_received)
    .bind(lot.qty_available)
    .bind(lot.unit_cost_cents)
    .bind(lot.source)
    .bind(lot.source_ref.as_deref())
    .bind(lot.received_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Stores a lot, switching the SKU to lot tracking on first receipt.
async fn receive_lot(conn: &mut SqliteConnection, lot: NewLot) -> DbResult<InventoryLot> {
    validate_new_lot(&lot)?;

    let mut level = load_level(conn, &lot.store_id, &lot.sku).await?;
    let quantity = received_quantity(level.quantity, lot.qty_received)?;
    if let Some(opening) = opening_lot(&level, &lot) {
        insert_lot(conn, &opening.into_lot()).await?;
    }
    level.tracking_mode = TrackingMode::Lots;

    let created = lot.into_lot();
    insert_lot(conn, &created).await?;
    level.quantity = quantity;
    save_level(conn, &level, created.received_at).await?;

    Ok(created)
}

async fn receive_all(conn: &mut SqliteConnection, lots: Vec<NewLot>) -> DbResult<Vec<InventoryLot>> {
    let mut created = Vec::with_capacity(lots.len());
    for lot in lots {
        created.push(receive_lot(conn, lot).await?);
    }
    Ok(created)
}

async fn plan(
    conn: &mut SqliteConnection,
    store_id: &str,
    sku: &str,
    quantity: i64,
    as_of: NaiveDate,
) -> DbResult<Allocation> {
    let level = load_level(conn, store_id, sku).await?;
    let lots = load_lots(conn, store_id, sku).await?;
    Ok(fefo::plan_allocation(
        sku,
        level.tracking_mode,
        level.quantity,
        &lots,
        quantity,
        as_of,
    )?)
}

/// Applies a plan produced by [`plan`] inside the same write lock.
///
/// The guarded updates cannot miss under the lock; a miss means the plan
/// was stale and the whole unit is rolled back.
async fn apply(
    conn: &mut SqliteConnection,
    store_id: &str,
    allocation: &Allocation,
    at: DateTime<Utc>,
) -> DbResult<()> {
    for depletion in &allocation.depletions {
        let updated = sqlx::query(
            "UPDATE inventory_lots SET qty_available = qty_available - ?1 \
             WHERE id = ?2 AND qty_available >= ?1",
        )
        .bind(depletion.quantity)
        .bind(&depletion.lot_id)
        .execute(&mut *conn)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(DbError::Internal(format!(
                "lot {} changed during allocation",
                depletion.lot_code
            )));
        }
    }

    let updated = sqlx::query(
        "UPDATE stock_levels SET quantity = quantity - ?1, updated_at = ?2 \
         WHERE store_id = ?3 AND sku = ?4 AND quantity >= ?1",
    )
    .bind(allocation.quantity)
    .bind(at)
    .bind(store_id)
    .bind(&allocation.sku)
    .execute(&mut *conn)
    .await?;
    if updated.rows_affected() != 1 {
        return Err(DbError::Internal(format!(
            "stock for {} changed during allocation",
            allocation.sku
        )));
    }
    Ok(())
}

async fn adjust(
    conn: &mut SqliteConnection,
    store_id: &str,
    sku: &str,
    set_to: Option<i64>,
    delta: i64,
    at: DateTime<Utc>,
) -> DbResult<StockLevel> {
    validate_sku(sku)?;
    let mut level = load_level(conn, store_id, sku).await?;
    level.quantity = adjusted_quantity(level.quantity, set_to, delta)?;

    if level.tracking_mode == TrackingMode::Lots {
        let lots = load_lots(conn, store_id, sku).await?;
        if let Some(lot) = adjustment_lot(&level, &lots, at) {
            insert_lot(conn, &lot.into_lot()).await?;
        }
    }

    save_level(conn, &level, at).await?;
    Ok(level)
}

// ----- Units of work -----

async fn checkout_unit(
    conn: &mut SqliteConnection,
    tx: Transaction,
    as_of: NaiveDate,
) -> DbResult<CheckoutOutcome> {
    if let Some(existing) = load_transaction_by_key(conn, &tx.idempotency_key).await? {
        debug!(key = %tx.idempotency_key, "Idempotency key already committed");
        return Ok(CheckoutOutcome::Duplicate(existing));
    }

    let mut allocations = Vec::new();
    for line in line_demand(&tx)? {
        allocations.push(plan(conn, &tx.store_id, &line.sku, line.quantity, as_of).await?);
    }
    for allocation in &allocations {
        apply(conn, &tx.store_id, allocation, tx.created_at).await?;
    }
    insert_transaction(conn, &tx).await?;

    Ok(CheckoutOutcome::Created {
        transaction: tx,
        allocations,
    })
}

async fn allocate_unit(
    conn: &mut SqliteConnection,
    store_id: &str,
    sku: &str,
    quantity: i64,
    as_of: NaiveDate,
    at: DateTime<Utc>,
) -> DbResult<Allocation> {
    let allocation = plan(conn, store_id, sku, quantity, as_of).await?;
    apply(conn, store_id, &allocation, at).await?;
    Ok(allocation)
}

async fn void_unit(
    conn: &mut SqliteConnection,
    id: &str,
    reason: &str,
    at: DateTime<Utc>,
) -> DbResult<VoidOutcome> {
    let tx = require_transaction(conn, id).await?;
    let reversed = has_reversals(conn, id).await?;
    let settled = settle_void(tx, reversed, reason, at)?;

    let restocked = receive_all(conn, settled.restock).await?;
    update_status(conn, &settled.transaction).await?;

    Ok(VoidOutcome {
        transaction: settled.transaction,
        restocked,
    })
}

async fn refund_unit(conn: &mut SqliteConnection, refund: Refund) -> DbResult<Transaction> {
    let mut tx = require_transaction(conn, &refund.transaction_id).await?;
    let refunded = sum_refunds(conn, &tx.id).await?;
    tx.status = reversal::check_refund(&tx, refunded, refund.amount_cents)?;

    insert_refund(conn, &refund).await?;
    update_status(conn, &tx).await?;
    Ok(tx)
}

async fn item_return_unit(
    conn: &mut SqliteConnection,
    item_return: ItemReturn,
    refund_up_to_cents: i64,
) -> DbResult<ItemReturnOutcome> {
    if let Some(key) = &item_return.idempotency_key {
        if let Some(existing) = load_item_return_by_key(conn, key).await? {
            return Ok(ItemReturnOutcome::Duplicate(existing));
        }
    }

    let mut tx = require_transaction(conn, &item_return.transaction_id).await?;
    let already = sum_returned(conn, &tx.id).await?;
    let refunded = sum_refunds(conn, &tx.id).await?;
    let settled = settle_item_return(&tx, &already, refunded, item_return, refund_up_to_cents)?;

    let restocked = receive_all(conn, settled.restock).await?;
    insert_item_return(conn, &settled.item_return).await?;
    if let Some(refund) = &settled.refund {
        insert_refund(conn, refund).await?;
    }
    tx.status = settled.status;
    update_status(conn, &tx).await?;

    Ok(ItemReturnOutcome::Created {
        item_return: settled.item_return,
        refund: settled.refund,
        restocked,
        transaction: tx,
    })
}

// =============================================================================
// LedgerStore
// =============================================================================

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn find_transaction_by_idempotency(&self, key: &str) -> DbResult<Option<Transaction>> {
        let mut conn = self.pool.acquire().await?;
        load_transaction_by_key(&mut conn, key).await
    }

    async fn find_transaction_by_id(&self, id: &str) -> DbResult<Option<Transaction>> {
        let mut conn = self.pool.acquire().await?;
        load_transaction(&mut conn, id).await
    }

    async fn create_checkout(&self, tx: Transaction, as_of: NaiveDate) -> DbResult<CheckoutOutcome> {
        let key = tx.idempotency_key.clone();
        let mut db = self.write_lock().await?;
        let result = checkout_unit(&mut db, tx, as_of).await;

        match finish(db, result).await {
            // Lost a race on the key to a writer outside this process.
            Err(err) if err.is_unique_violation_on(TRANSACTION_KEY_COLUMN) => {
                debug!(key = %key, "Idempotency key committed concurrently");
                let mut conn = self.pool.acquire().await?;
                let existing = load_transaction_by_key(&mut conn, &key)
                    .await?
                    .ok_or(err)?;
                Ok(CheckoutOutcome::Duplicate(existing))
            }
            other => other,
        }
    }

    async fn void_transaction(&self, id: &str, reason: &str, at: DateTime<Utc>) -> DbResult<VoidOutcome> {
        let mut db = self.write_lock().await?;
        let result = void_unit(&mut db, id, reason, at).await;
        finish(db, result).await
    }

    async fn create_refund(&self, refund: Refund) -> DbResult<Transaction> {
        let mut db = self.write_lock().await?;
        let result = refund_unit(&mut db, refund).await;
        finish(db, result).await
    }

    async fn create_item_return(
        &self,
        item_return: ItemReturn,
        refund_up_to_cents: i64,
    ) -> DbResult<ItemReturnOutcome> {
        let key = item_return.idempotency_key.clone();
        let mut db = self.write_lock().await?;
        let result = item_return_unit(&mut db, item_return, refund_up_to_cents).await;

        match (finish(db, result).await, key) {
            (Err(err), Some(key)) if err.is_unique_violation_on(RETURN_KEY_COLUMN) => {
                let mut conn = self.pool.acquire().await?;
                let existing = load_item_return_by_key(&mut conn, &key)
                    .await?
                    .ok_or(err)?;
                Ok(ItemReturnOutcome::Duplicate(existing))
            }
            (other, _) => other,
        }
    }

    async fn find_item_return_by_idempotency(&self, key: &str) -> DbResult<Option<ItemReturn>> {
        let mut conn = self.pool.acquire().await?;
        load_item_return_by_key(&mut conn, key).await
    }

    async fn returned_qty_by_transaction(&self, transaction_id: &str) -> DbResult<StockMap> {
        let mut conn = self.pool.acquire().await?;
        sum_returned(&mut conn, transaction_id).await
    }

    async fn refunded_total(&self, transaction_id: &str) -> DbResult<i64> {
        let mut conn = self.pool.acquire().await?;
        sum_refunds(&mut conn, transaction_id).await
    }

    async fn list_refunds(&self, transaction_id: &str) -> DbResult<Vec<Refund>> {
        let refunds = sqlx::query_as(
            "SELECT id, transaction_id, amount_cents, status, reason, item_return_id, created_at \
             FROM refunds WHERE transaction_id = ? ORDER BY rowid",
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    async fn list_item_returns(&self, transaction_id: &str) -> DbResult<Vec<ItemReturn>> {
        let mut conn = self.pool.acquire().await?;
        let rows: Vec<ItemReturnRow> =
            sqlx::query_as("SELECT * FROM item_returns WHERE transaction_id = ? ORDER BY rowid")
                .bind(transaction_id)
                .fetch_all(&mut *conn)
                .await?;

        let mut returns = Vec::with_capacity(rows.len());
        for row in rows {
            returns.push(hydrate_item_return(&mut conn, row).await?);
        }
        Ok(returns)
    }

    async fn create_inventory_lot(&self, lot: NewLot) -> DbResult<InventoryLot> {
        let mut db = self.write_lock().await?;
        let result = receive_lot(&mut db, lot).await;
        finish(db, result).await
    }

    async fn list_inventory_lots(&self, query: &LotQuery) -> DbResult<Vec<InventoryLot>> {
        let limit = query
            .limit
            .map_or(-1, |limit| i64::try_from(limit).unwrap_or(i64::MAX));
        let sql = format!(
            "SELECT {LOT_COLUMNS} FROM inventory_lots \
             WHERE store_id = ?1 \
               AND (?2 IS NULL OR sku = ?2) \
               AND (?3 OR expiry_date IS NULL OR expiry_date >= ?4) \
             ORDER BY expiry_date IS NULL, expiry_date, received_at, id \
             LIMIT ?5"
        );
        let lots = sqlx::query_as(&sql)
            .bind(&query.store_id)
            .bind(query.sku.as_deref())
            .bind(query.include_expired)
            .bind(query.as_of)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(lots)
    }

    async fn allocate_for_sale(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
        at: DateTime<Utc>,
    ) -> DbResult<Allocation> {
        let mut db = self.write_lock().await?;
        let result = allocate_unit(&mut db, store_id, sku, quantity, as_of, at).await;
        finish(db, result).await
    }

    async fn get_stock_map(&self, store_id: &str, skus: &[String]) -> DbResult<StockMap> {
        let mut stock: StockMap = skus.iter().map(|sku| (sku.clone(), 0)).collect();
        if skus.is_empty() {
            return Ok(stock);
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT sku, quantity FROM stock_levels WHERE store_id = ",
        );
        qb.push_bind(store_id);
        qb.push(" AND sku IN (");
        let mut separated = qb.separated(", ");
        for sku in skus {
            separated.push_bind(sku.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<(String, i64)> = qb.build_query_as().fetch_all(&self.pool).await?;
        stock.extend(rows);
        Ok(stock)
    }

    async fn get_stock_level(&self, store_id: &str, sku: &str) -> DbResult<StockLevel> {
        let mut conn = self.pool.acquire().await?;
        load_level(&mut conn, store_id, sku).await
    }

    async fn set_stock(&self, store_id: &str, sku: &str, quantity: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        let mut db = self.write_lock().await?;
        let result = adjust(&mut db, store_id, sku, Some(quantity), 0, at).await;
        finish(db, result).await
    }

    async fn increase_stock(&self, store_id: &str, sku: &str, delta: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        let mut db = self.write_lock().await?;
        let result = adjust(&mut db, store_id, sku, None, delta, at).await;
        finish(db, result).await
    }

    async fn get_products_by_skus(&self, skus: &[String]) -> DbResult<HashMap<String, Product>> {
        if skus.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT sku, name, price_cents, margin_bps, is_active FROM products WHERE sku IN (",
        );
        let mut separated = qb.separated(", ");
        for sku in skus {
            separated.push_bind(sku.as_str());
        }
        separated.push_unseparated(")");

        let rows: Vec<ProductRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.sku.clone(), Product::from(row)))
            .collect())
    }

    async fn upsert_product(&self, product: Product, updated_at: DateTime<Utc>) -> DbResult<()> {
        validate_product(&product)?;
        sqlx::query(
            "INSERT INTO products (sku, name, price_cents, margin_bps, is_active, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(sku) DO UPDATE SET \
                name = excluded.name, \
                price_cents = excluded.price_cents, \
                margin_bps = excluded.margin_bps, \
                is_active = excluded.is_active, \
                updated_at = excluded.updated_at",
        )
        .bind(&product.sku)
        .bind(&product.name)
        .bind(product.price_cents)
        .bind(i64::from(product.margin_bps))
        .bind(product.is_active)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
