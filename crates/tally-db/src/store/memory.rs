//! In-memory ledger behind one coarse lock.
//!
//! Every method takes the same `tokio::sync::Mutex`, so idempotency lookup
//! and insert, allocation, and ceiling checks never interleave. Throughput
//! is one mutation at a time per store instance.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tally_core::{
    reversal, Allocation, InventoryLot, ItemReturn, LedgerError, LedgerResult, LotQuery, NewLot,
    Product, Refund, RefundStatus, StockLevel, StockMap, Transaction,
};
use tokio::sync::Mutex;
use tracing::debug;

use super::inventory::InventoryBook;
use super::{
    line_demand, settle_item_return, settle_void, validate_product, CheckoutOutcome,
    ItemReturnOutcome, LedgerStore, VoidOutcome,
};
use crate::error::DbResult;

#[derive(Debug, Default)]
struct LedgerState {
    inventory: InventoryBook,
    products: HashMap<String, Product>,
    transactions: HashMap<String, Transaction>,
    /// idempotency key → transaction id
    checkout_keys: HashMap<String, String>,
    /// transaction id → refunds, in creation order
    refunds: HashMap<String, Vec<Refund>>,
    /// transaction id → item returns, in creation order
    item_returns: HashMap<String, Vec<ItemReturn>>,
    /// idempotency key → (transaction id, item return id)
    return_keys: HashMap<String, (String, String)>,
}

impl LedgerState {
    fn transaction(&self, id: &str) -> LedgerResult<&Transaction> {
        self.transactions
            .get(id)
            .ok_or_else(|| LedgerError::not_found("transaction", id))
    }

    fn refunded_total(&self, transaction_id: &str) -> i64 {
        self.refunds
            .get(transaction_id)
            .map(|refunds| {
                refunds
                    .iter()
                    .filter(|r| r.status == RefundStatus::Completed)
                    .map(|r| r.amount_cents)
                    .sum()
            })
            .unwrap_or(0)
    }

    fn returned_quantities(&self, transaction_id: &str) -> StockMap {
        let mut qty = StockMap::new();
        for item_return in self.item_returns.get(transaction_id).into_iter().flatten() {
            for (sku, n) in item_return.quantities() {
                *qty.entry(sku).or_insert(0) += n;
            }
        }
        qty
    }

    fn has_reversals(&self, transaction_id: &str) -> bool {
        self.refunds.get(transaction_id).is_some_and(|r| !r.is_empty())
            || self.item_returns.get(transaction_id).is_some_and(|r| !r.is_empty())
    }

    fn item_return_by_key(&self, key: &str) -> Option<&ItemReturn> {
        let (tx_id, return_id) = self.return_keys.get(key)?;
        self.item_returns
            .get(tx_id)?
            .iter()
            .find(|r| &r.id == return_id)
    }

    /// Receives already-validated lots.
    fn restock(&mut self, lots: Vec<NewLot>) -> LedgerResult<Vec<InventoryLot>> {
        lots.into_iter()
            .map(|lot| self.inventory.receive(lot))
            .collect()
    }
}

/// Ledger held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<LedgerState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn find_transaction_by_idempotency(&self, key: &str) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .checkout_keys
            .get(key)
            .and_then(|id| state.transactions.get(id))
            .cloned())
    }

    async fn find_transaction_by_id(&self, id: &str) -> DbResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(id).cloned())
    }

    async fn create_checkout(&self, tx: Transaction, as_of: NaiveDate) -> DbResult<CheckoutOutcome> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state
            .checkout_keys
            .get(&tx.idempotency_key)
            .and_then(|id| state.transactions.get(id))
        {
            debug!(key = %tx.idempotency_key, "Idempotency key already committed");
            return Ok(CheckoutOutcome::Duplicate(existing.clone()));
        }

        // Plan every line before touching anything.
        let allocations = line_demand(&tx)?
            .iter()
            .map(|line| state.inventory.plan(&tx.store_id, &line.sku, line.quantity, as_of))
            .collect::<LedgerResult<Vec<Allocation>>>()?;

        for allocation in &allocations {
            state.inventory.apply(&tx.store_id, allocation);
        }
        state
            .checkout_keys
            .insert(tx.idempotency_key.clone(), tx.id.clone());
        state.transactions.insert(tx.id.clone(), tx.clone());

        Ok(CheckoutOutcome::Created {
            transaction: tx,
            allocations,
        })
    }

    async fn void_transaction(&self, id: &str, reason: &str, at: DateTime<Utc>) -> DbResult<VoidOutcome> {
        let mut state = self.state.lock().await;

        let tx = state.transaction(id)?.clone();
        let settled = settle_void(tx, state.has_reversals(id), reason, at)?;

        let restocked = state.restock(settled.restock)?;
        state
            .transactions
            .insert(id.to_string(), settled.transaction.clone());

        Ok(VoidOutcome {
            transaction: settled.transaction,
            restocked,
        })
    }

    async fn create_refund(&self, refund: Refund) -> DbResult<Transaction> {
        let mut state = self.state.lock().await;

        let refunded = state.refunded_total(&refund.transaction_id);
        let tx = state.transaction(&refund.transaction_id)?;
        let status = reversal::check_refund(tx, refunded, refund.amount_cents)?;

        let tx_id = refund.transaction_id.clone();
        state.refunds.entry(tx_id.clone()).or_default().push(refund);
        let tx = state
            .transactions
            .get_mut(&tx_id)
            .ok_or_else(|| LedgerError::not_found("transaction", tx_id.as_str()))?;
        tx.status = status;
        Ok(tx.clone())
    }

    async fn create_item_return(
        &self,
        item_return: ItemReturn,
        refund_up_to_cents: i64,
    ) -> DbResult<ItemReturnOutcome> {
        let mut state = self.state.lock().await;

        if let Some(key) = &item_return.idempotency_key {
            if let Some(existing) = state.item_return_by_key(key) {
                return Ok(ItemReturnOutcome::Duplicate(existing.clone()));
            }
        }

        let tx_id = item_return.transaction_id.clone();
        let already = state.returned_quantities(&tx_id);
        let refunded = state.refunded_total(&tx_id);
        let tx = state.transaction(&tx_id)?.clone();
        let settled = settle_item_return(&tx, &already, refunded, item_return, refund_up_to_cents)?;

        let restocked = state.restock(settled.restock)?;
        if let Some(key) = &settled.item_return.idempotency_key {
            state
                .return_keys
                .insert(key.clone(), (tx_id.clone(), settled.item_return.id.clone()));
        }
        state
            .item_returns
            .entry(tx_id.clone())
            .or_default()
            .push(settled.item_return.clone());
        if let Some(refund) = &settled.refund {
            state.refunds.entry(tx_id.clone()).or_default().push(refund.clone());
        }

        let mut transaction = tx;
        transaction.status = settled.status;
        state.transactions.insert(tx_id, transaction.clone());

        Ok(ItemReturnOutcome::Created {
            item_return: settled.item_return,
            refund: settled.refund,
            restocked,
            transaction,
        })
    }

    async fn find_item_return_by_idempotency(&self, key: &str) -> DbResult<Option<ItemReturn>> {
        let state = self.state.lock().await;
        Ok(state.item_return_by_key(key).cloned())
    }

    async fn returned_qty_by_transaction(&self, transaction_id: &str) -> DbResult<StockMap> {
        let state = self.state.lock().await;
        Ok(state.returned_quantities(transaction_id))
    }

    async fn refunded_total(&self, transaction_id: &str) -> DbResult<i64> {
        let state = self.state.lock().await;
        Ok(state.refunded_total(transaction_id))
    }

    async fn list_refunds(&self, transaction_id: &str) -> DbResult<Vec<Refund>> {
        let state = self.state.lock().await;
        Ok(state.refunds.get(transaction_id).cloned().unwrap_or_default())
    }

    async fn list_item_returns(&self, transaction_id: &str) -> DbResult<Vec<ItemReturn>> {
        let state = self.state.lock().await;
        Ok(state
            .item_returns
            .get(transaction_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn create_inventory_lot(&self, lot: NewLot) -> DbResult<InventoryLot> {
        let mut state = self.state.lock().await;
        Ok(state.inventory.receive(lot)?)
    }

    async fn list_inventory_lots(&self, query: &LotQuery) -> DbResult<Vec<InventoryLot>> {
        let state = self.state.lock().await;
        Ok(state.inventory.list(query))
    }

    async fn allocate_for_sale(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
        _at: DateTime<Utc>,
    ) -> DbResult<Allocation> {
        let mut state = self.state.lock().await;
        let allocation = state.inventory.plan(store_id, sku, quantity, as_of)?;
        state.inventory.apply(store_id, &allocation);
        Ok(allocation)
    }

    async fn get_stock_map(&self, store_id: &str, skus: &[String]) -> DbResult<StockMap> {
        let state = self.state.lock().await;
        Ok(state.inventory.stock_map(store_id, skus))
    }

    async fn get_stock_level(&self, store_id: &str, sku: &str) -> DbResult<StockLevel> {
        let state = self.state.lock().await;
        Ok(state.inventory.level(store_id, sku))
    }

    async fn set_stock(&self, store_id: &str, sku: &str, quantity: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        let mut state = self.state.lock().await;
        Ok(state.inventory.adjust(store_id, sku, Some(quantity), 0, at)?)
    }

    async fn increase_stock(&self, store_id: &str, sku: &str, delta: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        let mut state = self.state.lock().await;
        Ok(state.inventory.adjust(store_id, sku, None, delta, at)?)
    }

    async fn get_products_by_skus(&self, skus: &[String]) -> DbResult<HashMap<String, Product>> {
        let state = self.state.lock().await;
        Ok(skus
            .iter()
            .filter_map(|sku| state.products.get(sku).map(|p| (sku.clone(), p.clone())))
            .collect())
    }

    async fn upsert_product(&self, product: Product, _updated_at: DateTime<Utc>) -> DbResult<()> {
        validate_product(&product)?;
        let mut state = self.state.lock().await;
        state.products.insert(product.sku.clone(), product);
        Ok(())
    }
}
