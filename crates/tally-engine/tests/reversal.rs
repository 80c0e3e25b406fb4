//! Voids, refunds, item returns and exchanges against both backends.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rstest::rstest;
use tally_core::pricing::CartLine;
use tally_core::{
    Allocation, ErrorKind, InventoryLot, ItemReturn, LedgerError, LotQuery, LotSource, NewLot,
    PaymentMethod, Product, Refund, ReturnMode, StockLevel, StockMap, TaxRate, Transaction,
    TransactionStatus,
};
use tally_db::{
    CheckoutOutcome, DbError, DbResult, ItemReturnOutcome, LedgerStore, MemoryStore, VoidOutcome,
};
use tally_engine::{ExchangeRequest, RefundRequest, ReturnAction, ReturnRequest};

use common::{Backend, Ledger, TERMINAL};

async fn shop(backend: Backend) -> Ledger {
    let ledger = Ledger::open(backend).await;
    stock_shop(&ledger).await;
    ledger
}

async fn stock_shop(ledger: &Ledger) {
    ledger.product("SHIRT", 2_000).await;
    ledger.product("SOCKS", 500).await;
    ledger.product("COAT", 5_000).await;
    ledger.stock("SHIRT", 20).await;
    ledger.stock("SOCKS", 20).await;
    ledger.stock("COAT", 20).await;
}

fn refund(transaction_id: &str, amount_cents: i64) -> RefundRequest {
    RefundRequest {
        transaction_id: transaction_id.to_string(),
        amount_cents,
        reason: Some("customer request".into()),
    }
}

fn give_back(transaction_id: &str, key: &str, items: Vec<CartLine>) -> ReturnRequest {
    ReturnRequest {
        transaction_id: transaction_id.to_string(),
        idempotency_key: Some(key.to_string()),
        items,
        reason: Some("wrong size".into()),
        action: ReturnAction::Refund,
    }
}

fn exchange_for(
    transaction_id: &str,
    key: &str,
    items: Vec<CartLine>,
    new_items: Vec<CartLine>,
) -> ReturnRequest {
    ReturnRequest {
        action: ReturnAction::Exchange(ExchangeRequest {
            terminal_id: TERMINAL.to_string(),
            items: new_items,
            payment_method: PaymentMethod::Cash,
            payment_splits: vec![],
            payment_reference: None,
            cash_received_cents: 0,
            tax_rate: TaxRate::zero(),
        }),
        ..give_back(transaction_id, key, items)
    }
}

// =============================================================================
// Refunds and Voids
// =============================================================================

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_refunds_stop_at_the_total(#[case] backend: Backend) {
    let ledger = shop(backend).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("COAT", 1)]).await.unwrap();
    let id = sale.transaction_id.as_str();

    for _ in 0..2 {
        let receipt = ledger.reversal.refund(refund(id, 2_000)).await.unwrap();
        assert_eq!(receipt.transaction.status, TransactionStatus::Paid);
    }

    let err = ledger.reversal.refund(refund(id, 2_000)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

    let receipt = ledger.reversal.refund(refund(id, 1_000)).await.unwrap();
    assert_eq!(receipt.transaction.status, TransactionStatus::Refunded);

    let err = ledger.reversal.refund(refund(id, 1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

    let summary = ledger.reversal.refund_summary(id).await.unwrap();
    assert_eq!(summary.refunded_cents, 5_000);
    assert_eq!(summary.remaining_cents, 0);
    assert_eq!(summary.refunds.len(), 3);

    // refunds never move stock
    assert_eq!(ledger.on_hand("COAT").await, 19);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_void_and_refund_exclude_each_other(#[case] backend: Backend) {
    let ledger = shop(backend).await;

    let voided = ledger.sell("sale-1", vec![CartLine::new("SHIRT", 2)]).await.unwrap();
    let outcome = ledger
        .reversal
        .void(&voided.transaction_id, "rang up twice")
        .await
        .unwrap();
    assert_eq!(outcome.transaction.status, TransactionStatus::Voided);
    assert!(outcome.restocked.iter().all(|lot| lot.source == LotSource::Void));
    assert_eq!(ledger.on_hand("SHIRT").await, 20);

    let err = ledger
        .reversal
        .refund(refund(&voided.transaction_id, 100))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    let err = ledger
        .reversal
        .void(&voided.transaction_id, "again")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    assert_eq!(ledger.on_hand("SHIRT").await, 20);

    let refunded = ledger.sell("sale-2", vec![CartLine::new("SOCKS", 1)]).await.unwrap();
    ledger
        .reversal
        .refund(refund(&refunded.transaction_id, 500))
        .await
        .unwrap();
    let err = ledger
        .reversal
        .void(&refunded.transaction_id, "too late")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    assert_eq!(ledger.on_hand("SOCKS").await, 19);

    let err = ledger.reversal.void("no-such-sale", "typo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

// =============================================================================
// Item Returns
// =============================================================================

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_returns_never_exceed_purchased_quantity(#[case] backend: Backend) {
    let ledger = shop(backend).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SHIRT", 3)]).await.unwrap();
    let id = sale.transaction_id.as_str();
    assert_eq!(ledger.on_hand("SHIRT").await, 17);

    // the current price is not what the customer paid
    ledger.product("SHIRT", 2_500).await;

    let first = ledger
        .reversal
        .return_items(give_back(id, "ret-1", vec![CartLine::new("SHIRT", 2)]))
        .await
        .unwrap();
    assert!(!first.duplicate);
    assert_eq!(first.item_return.mode, ReturnMode::Refund);
    assert_eq!(first.item_return.credit_cents, 4_000);
    assert_eq!(first.refund.as_ref().map(|r| r.amount_cents), Some(4_000));
    assert_eq!(first.restocked.len(), 1);
    assert_eq!(first.restocked[0].source, LotSource::Return);
    assert_eq!(
        first.restocked[0].source_ref.as_deref(),
        Some(first.item_return.id.as_str())
    );
    assert_eq!(ledger.on_hand("SHIRT").await, 19);

    let err = ledger
        .reversal
        .return_items(give_back(id, "ret-2", vec![CartLine::new("SHIRT", 2)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

    let last = ledger
        .reversal
        .return_items(give_back(id, "ret-3", vec![CartLine::new("SHIRT", 1)]))
        .await
        .unwrap();
    assert_eq!(last.refund.as_ref().map(|r| r.amount_cents), Some(2_000));
    assert_eq!(ledger.on_hand("SHIRT").await, 20);

    let summary = ledger.reversal.refund_summary(id).await.unwrap();
    assert_eq!(summary.status, TransactionStatus::Refunded);
    assert_eq!(summary.item_returns.len(), 2);

    let err = ledger
        .reversal
        .return_items(give_back(id, "ret-4", vec![CartLine::new("SHIRT", 1)]))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_replayed_return_changes_nothing(#[case] backend: Backend) {
    let ledger = shop(backend).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SOCKS", 4)]).await.unwrap();
    let id = sale.transaction_id.as_str();

    let request = give_back(id, "ret-1", vec![CartLine::new("SOCKS", 1)]);
    let first = ledger.reversal.return_items(request.clone()).await.unwrap();
    let replay = ledger.reversal.return_items(request).await.unwrap();

    assert!(replay.duplicate);
    assert_eq!(replay.item_return.id, first.item_return.id);
    assert_eq!(replay.refund, first.refund);
    assert!(replay.restocked.is_empty());
    assert_eq!(ledger.on_hand("SOCKS").await, 17);
    assert_eq!(ledger.reversal.refund_summary(id).await.unwrap().refunded_cents, 500);
}

// =============================================================================
// Exchanges
// =============================================================================

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_exchange_refunds_unused_credit(#[case] backend: Backend) {
    let ledger = shop(backend).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SHIRT", 1)]).await.unwrap();
    let id = sale.transaction_id.as_str();

    let receipt = ledger
        .reversal
        .return_items(exchange_for(
            id,
            "ex-1",
            vec![CartLine::new("SHIRT", 1)],
            vec![CartLine::new("SOCKS", 2)],
        ))
        .await
        .unwrap();

    let secondary = receipt.exchange.as_ref().unwrap();
    assert_eq!(secondary.totals.subtotal_cents, 1_000);
    assert_eq!(secondary.totals.discount_cents, 1_000);
    assert_eq!(secondary.totals.total_cents, 0);

    assert_eq!(receipt.item_return.mode, ReturnMode::Exchange);
    assert_eq!(receipt.item_return.credit_cents, 2_000);
    assert_eq!(receipt.item_return.additional_payment_cents, 0);
    assert_eq!(
        receipt.item_return.exchange_transaction_id.as_deref(),
        Some(secondary.transaction_id.as_str())
    );
    assert_eq!(receipt.refund.as_ref().map(|r| r.amount_cents), Some(1_000));

    let tx = ledger.checkout.transaction(&secondary.transaction_id).await.unwrap();
    assert!(tx.manual_override);
    assert_eq!(tx.idempotency_key, "ex-1:exchange");

    assert_eq!(ledger.on_hand("SHIRT").await, 20);
    assert_eq!(ledger.on_hand("SOCKS").await, 18);
    let summary = ledger.reversal.refund_summary(id).await.unwrap();
    assert_eq!(summary.status, TransactionStatus::Paid);
    assert_eq!(summary.remaining_cents, 1_000);
}

#[rstest]
#[case::memory(Backend::Memory)]
#[case::sqlite(Backend::Sqlite)]
#[tokio::test]
async fn test_exchange_collects_the_difference(#[case] backend: Backend) {
    let ledger = shop(backend).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SOCKS", 2)]).await.unwrap();
    let id = sale.transaction_id.as_str();

    let mut request = exchange_for(
        id,
        "ex-1",
        vec![CartLine::new("SOCKS", 2)],
        vec![CartLine::new("SHIRT", 1)],
    );
    if let ReturnAction::Exchange(exchange) = &mut request.action {
        exchange.payment_method = PaymentMethod::Card;
        exchange.payment_reference = Some("APPROVAL-7".into());
    }

    let receipt = ledger.reversal.return_items(request.clone()).await.unwrap();
    let secondary = receipt.exchange.clone().unwrap();
    assert_eq!(secondary.totals.discount_cents, 1_000);
    assert_eq!(secondary.totals.total_cents, 1_000);
    assert_eq!(secondary.payment_method, PaymentMethod::Card);
    assert_eq!(receipt.item_return.additional_payment_cents, 1_000);
    assert!(receipt.refund.is_none());

    let replay = ledger.reversal.return_items(request).await.unwrap();
    assert!(replay.duplicate);
    assert_eq!(replay.item_return.id, receipt.item_return.id);
    let replayed = replay.exchange.unwrap();
    assert!(replayed.duplicate);
    assert_eq!(replayed.transaction_id, secondary.transaction_id);

    assert_eq!(ledger.on_hand("SOCKS").await, 20);
    assert_eq!(ledger.on_hand("SHIRT").await, 19);
}

/// Delegates to a [`MemoryStore`] but refuses every item return, as if a
/// concurrent return had taken the last returnable unit. With `refuse_voids`
/// set, voids fail as a lost storage connection.
struct RefusingReturns {
    inner: MemoryStore,
    refuse_voids: bool,
}

impl RefusingReturns {
    fn new(refuse_voids: bool) -> Self {
        RefusingReturns {
            inner: MemoryStore::new(),
            refuse_voids,
        }
    }
}

#[async_trait]
impl LedgerStore for RefusingReturns {
    async fn find_transaction_by_idempotency(&self, key: &str) -> DbResult<Option<Transaction>> {
        self.inner.find_transaction_by_idempotency(key).await
    }

    async fn find_transaction_by_id(&self, id: &str) -> DbResult<Option<Transaction>> {
        self.inner.find_transaction_by_id(id).await
    }

    async fn create_checkout(&self, tx: Transaction, as_of: NaiveDate) -> DbResult<CheckoutOutcome> {
        self.inner.create_checkout(tx, as_of).await
    }

    async fn void_transaction(&self, id: &str, reason: &str, at: DateTime<Utc>) -> DbResult<VoidOutcome> {
        if self.refuse_voids {
            return Err(DbError::ConnectionFailed("pool closed".into()));
        }
        self.inner.void_transaction(id, reason, at).await
    }

    async fn create_refund(&self, refund: Refund) -> DbResult<Transaction> {
        self.inner.create_refund(refund).await
    }

    async fn create_item_return(
        &self,
        _item_return: ItemReturn,
        _refund_up_to_cents: i64,
    ) -> DbResult<ItemReturnOutcome> {
        Err(DbError::Ledger(LedgerError::invalid(
            "cannot return 1 of SHIRT: 0 returnable",
        )))
    }

    async fn find_item_return_by_idempotency(&self, key: &str) -> DbResult<Option<ItemReturn>> {
        self.inner.find_item_return_by_idempotency(key).await
    }

    async fn returned_qty_by_transaction(&self, transaction_id: &str) -> DbResult<StockMap> {
        self.inner.returned_qty_by_transaction(transaction_id).await
    }

    async fn refunded_total(&self, transaction_id: &str) -> DbResult<i64> {
        self.inner.refunded_total(transaction_id).await
    }

    async fn list_refunds(&self, transaction_id: &str) -> DbResult<Vec<Refund>> {
        self.inner.list_refunds(transaction_id).await
    }

    async fn list_item_returns(&self, transaction_id: &str) -> DbResult<Vec<ItemReturn>> {
        self.inner.list_item_returns(transaction_id).await
    }

    async fn create_inventory_lot(&self, lot: NewLot) -> DbResult<InventoryLot> {
        self.inner.create_inventory_lot(lot).await
    }

    async fn list_inventory_lots(&self, query: &LotQuery) -> DbResult<Vec<InventoryLot>> {
        self.inner.list_inventory_lots(query).await
    }

    async fn allocate_for_sale(
        &self,
        store_id: &str,
        sku: &str,
        quantity: i64,
        as_of: NaiveDate,
        at: DateTime<Utc>,
    ) -> DbResult<Allocation> {
        self.inner.allocate_for_sale(store_id, sku, quantity, as_of, at).await
    }

    async fn get_stock_map(&self, store_id: &str, skus: &[String]) -> DbResult<StockMap> {
        self.inner.get_stock_map(store_id, skus).await
    }

    async fn get_stock_level(&self, store_id: &str, sku: &str) -> DbResult<StockLevel> {
        self.inner.get_stock_level(store_id, sku).await
    }

    async fn set_stock(&self, store_id: &str, sku: &str, quantity: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        self.inner.set_stock(store_id, sku, quantity, at).await
    }

    async fn increase_stock(&self, store_id: &str, sku: &str, delta: i64, at: DateTime<Utc>) -> DbResult<StockLevel> {
        self.inner.increase_stock(store_id, sku, delta, at).await
    }

    async fn get_products_by_skus(&self, skus: &[String]) -> DbResult<HashMap<String, Product>> {
        self.inner.get_products_by_skus(skus).await
    }

    async fn upsert_product(&self, product: Product, updated_at: DateTime<Utc>) -> DbResult<()> {
        self.inner.upsert_product(product, updated_at).await
    }
}

#[tokio::test]
async fn test_failed_exchange_voids_secondary_sale() {
    let ledger = Ledger::over(Arc::new(RefusingReturns::new(false)));
    stock_shop(&ledger).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SHIRT", 1)]).await.unwrap();

    let request = exchange_for(
        &sale.transaction_id,
        "ex-1",
        vec![CartLine::new("SHIRT", 1)],
        vec![CartLine::new("SOCKS", 3)],
    );
    let err = ledger.reversal.return_items(request.clone()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

    let secondary = ledger
        .store
        .find_transaction_by_idempotency("ex-1:exchange")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(secondary.status, TransactionStatus::Voided);
    assert_eq!(ledger.on_hand("SOCKS").await, 20);

    // the voided secondary is never reused
    let err = ledger.reversal.return_items(request).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    assert_eq!(ledger.on_hand("SOCKS").await, 20);
}

#[tokio::test]
async fn test_unvoidable_exchange_sale_is_named_in_error() {
    let ledger = Ledger::over(Arc::new(RefusingReturns::new(true)));
    stock_shop(&ledger).await;
    let sale = ledger.sell("sale-1", vec![CartLine::new("SHIRT", 1)]).await.unwrap();

    let request = exchange_for(
        &sale.transaction_id,
        "ex-1",
        vec![CartLine::new("SHIRT", 1)],
        vec![CartLine::new("SOCKS", 3)],
    );
    let err = ledger.reversal.return_items(request).await.unwrap_err();

    let secondary = ledger
        .store
        .find_transaction_by_idempotency("ex-1:exchange")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(secondary.status, TransactionStatus::Paid);
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(!err.is_transient());
    assert!(err.to_string().contains(&secondary.id), "{err}");
}
