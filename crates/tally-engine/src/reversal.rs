//! # Reversal Engine
//!
//! Voids, refunds and item returns (with or without an exchange).
//!
//! ## Reversal Paths
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  void(id)            paid ──► voided, every line restocked as `void`    │
//! │  refund(id, amt)     Σ refunds ≤ total; reaching total ──► refunded     │
//! │  return_items(...)   Σ returned ≤ purchased per SKU, restock `return`   │
//! │     │                                                                   │
//! │     ├── Refund    ──► refund of the credit (capped at what is left)     │
//! │     └── Exchange  ──► CheckoutEngine.checkout(                          │
//! │                          key + ":exchange", discount = credit,          │
//! │                          manual_override = true)                        │
//! │                        then refund of credit − discount applied         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Exchange Compensation
//! The secondary checkout commits before the item return is recorded. When
//! the item return then fails its re-validation (a concurrent return took
//! the last returnable unit, say), a secondary created by this call is
//! voided and the error surfaces.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::pricing::CartLine;
use tally_core::reversal::plan_return;
use tally_core::validation::validate_identifier;
use tally_core::{
    InventoryLot, ItemReturn, LedgerError, LedgerResult, PaymentMethod, PaymentSplit, Refund,
    RefundStatus, ReturnMode, TaxRate, Transaction, TransactionStatus, ValidationError,
    EXCHANGE_KEY_SUFFIX,
};
use tally_db::{ItemReturnOutcome, LedgerStore, VoidOutcome};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::checkout::{CheckoutEngine, CheckoutRequest, CheckoutResponse};
use crate::{ledger, system_clock, Clock};

// =============================================================================
// Requests / Receipts
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub transaction_id: String,
    pub amount_cents: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundReceipt {
    pub refund: Refund,
    /// The transaction after the refund; `refunded` once fully refunded.
    pub transaction: Transaction,
}

/// The new cart of an exchange and how any difference is paid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
    /// Terminal ringing up the exchange; the store is the original sale's.
    pub terminal_id: String,
    pub items: Vec<CartLine>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_splits: Vec<PaymentSplit>,
    #[serde(default)]
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub cash_received_cents: i64,
    #[serde(default)]
    pub tax_rate: TaxRate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ReturnAction {
    Refund,
    Exchange(ExchangeRequest),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnRequest {
    pub transaction_id: String,
    /// Required for exchanges.
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub items: Vec<CartLine>,
    #[serde(default)]
    pub reason: Option<String>,
    pub action: ReturnAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnReceipt {
    pub item_return: ItemReturn,
    pub refund: Option<Refund>,
    /// The secondary transaction of an exchange.
    pub exchange: Option<CheckoutResponse>,
    /// Empty on replay.
    pub restocked: Vec<InventoryLot>,
    pub duplicate: bool,
}

/// Refund position of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundSummary {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub total_cents: i64,
    pub refunded_cents: i64,
    pub remaining_cents: i64,
    pub refunds: Vec<Refund>,
    pub item_returns: Vec<ItemReturn>,
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone)]
pub struct ReversalEngine {
    store: Arc<dyn LedgerStore>,
    checkout: Arc<CheckoutEngine>,
    clock: Clock,
}

impl ReversalEngine {
    pub fn new(store: Arc<dyn LedgerStore>, checkout: Arc<CheckoutEngine>) -> Self {
        ReversalEngine {
            store,
            checkout,
            clock: system_clock(),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    // =========================================================================
    // Void
    // =========================================================================

    /// Voids a paid transaction and restocks all of its lines.
    ///
    /// ## Errors
    /// - `NotFound`: no such transaction
    /// - `InvalidTransaction`: not `paid`, or it already has refunds or
    ///   item returns
    #[instrument(skip_all, fields(transaction_id = %transaction_id))]
    pub async fn void(&self, transaction_id: &str, reason: &str) -> LedgerResult<VoidOutcome> {
        validate_identifier("transaction_id", transaction_id)?;
        if reason.trim().is_empty() {
            return Err(ValidationError::Required {
                field: "void reason".to_string(),
            }
            .into());
        }

        let outcome = ledger(
            self.store
                .void_transaction(transaction_id, reason.trim(), (self.clock)())
                .await,
        )?;
        info!(
            lots = outcome.restocked.len(),
            units = outcome.transaction.item_count(),
            "Transaction voided"
        );
        Ok(outcome)
    }

    // =========================================================================
    // Refund
    // =========================================================================

    /// Records a (possibly partial) refund. No stock moves.
    #[instrument(skip_all, fields(transaction_id = %request.transaction_id))]
    pub async fn refund(&self, request: RefundRequest) -> LedgerResult<RefundReceipt> {
        validate_identifier("transaction_id", &request.transaction_id)?;
        if request.amount_cents <= 0 {
            return Err(LedgerError::invalid("refund amount must be positive"));
        }

        let refund = Refund {
            id: Uuid::new_v4().to_string(),
            transaction_id: request.transaction_id,
            amount_cents: request.amount_cents,
            status: RefundStatus::Completed,
            reason: request.reason,
            item_return_id: None,
            created_at: (self.clock)(),
        };
        let transaction = match ledger(self.store.create_refund(refund.clone()).await) {
            Ok(tx) => tx,
            Err(err) => {
                warn!(amount = refund.amount_cents, error = %err, "Refund rejected");
                return Err(err);
            }
        };

        info!(
            refund_id = %refund.id,
            amount = refund.amount_cents,
            status = transaction.status.as_str(),
            "Refund recorded"
        );
        Ok(RefundReceipt {
            refund,
            transaction,
        })
    }

    // =========================================================================
    // Item Returns
    // =========================================================================

    /// Takes back items from a paid sale, refunding or exchanging the credit.
    ///
    /// Credit is priced at the original sale's unit prices. A replayed
    /// idempotency key returns the recorded item return unchanged.
    #[instrument(
        skip_all,
        fields(
            transaction_id = %request.transaction_id,
            idempotency_key = request.idempotency_key.as_deref().unwrap_or(""),
        )
    )]
    pub async fn return_items(&self, request: ReturnRequest) -> LedgerResult<ReturnReceipt> {
        validate_identifier("transaction_id", &request.transaction_id)?;
        if let Some(key) = &request.idempotency_key {
            validate_identifier("idempotency_key", key)?;
            if let Some(existing) = ledger(self.store.find_item_return_by_idempotency(key).await)? {
                return self.replayed_return(&request, existing).await;
            }
        }

        let tx = self.checkout.transaction(&request.transaction_id).await?;
        let already = ledger(self.store.returned_qty_by_transaction(&tx.id).await)?;
        let lines = plan_return(&tx, &already, &request.items)?;
        let credit: i64 = lines.iter().map(|l| l.amount_cents).sum();

        let now = (self.clock)();
        let item_return = ItemReturn {
            id: Uuid::new_v4().to_string(),
            transaction_id: tx.id.clone(),
            store_id: tx.store_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            mode: ReturnMode::Refund,
            lines,
            credit_cents: credit,
            exchange_transaction_id: None,
            additional_payment_cents: 0,
            refund_id: None,
            reason: request.reason.clone(),
            created_at: now,
        };

        match &request.action {
            ReturnAction::Refund => {
                let outcome = ledger(self.store.create_item_return(item_return, credit).await)?;
                self.finish_return(&request, outcome, None).await
            }
            ReturnAction::Exchange(exchange) => {
                self.exchange(&request, &tx, item_return, exchange).await
            }
        }
    }

    async fn exchange(
        &self,
        request: &ReturnRequest,
        tx: &Transaction,
        mut item_return: ItemReturn,
        exchange: &ExchangeRequest,
    ) -> LedgerResult<ReturnReceipt> {
        let key = request
            .idempotency_key
            .as_deref()
            .ok_or_else(|| LedgerError::from(ValidationError::Required {
                field: "idempotency_key".to_string(),
            }))?;
        let exchange_key = format!("{key}{EXCHANGE_KEY_SUFFIX}");

        // A secondary left behind by an earlier attempt is reused only while
        // it is still a live sale.
        if let Some(prior) = ledger(self.store.find_transaction_by_idempotency(&exchange_key).await)? {
            if prior.status != TransactionStatus::Paid {
                return Err(LedgerError::invalid(format!(
                    "exchange transaction {} is {}",
                    prior.id,
                    prior.status.as_str()
                )));
            }
        }

        let secondary = self
            .checkout
            .checkout(CheckoutRequest {
                store_id: tx.store_id.clone(),
                terminal_id: exchange.terminal_id.clone(),
                idempotency_key: exchange_key,
                payment_method: exchange.payment_method,
                payment_splits: exchange.payment_splits.clone(),
                payment_reference: exchange.payment_reference.clone(),
                cash_received_cents: exchange.cash_received_cents,
                discount_cents: item_return.credit_cents,
                tax_rate: exchange.tax_rate,
                manual_override: true,
                cart: exchange.items.clone(),
            })
            .await?;

        let remainder = item_return.credit_cents - secondary.totals.discount_cents;
        item_return.mode = ReturnMode::Exchange;
        item_return.exchange_transaction_id = Some(secondary.transaction_id.clone());
        item_return.additional_payment_cents = secondary.totals.total_cents;

        match ledger(self.store.create_item_return(item_return, remainder).await) {
            Ok(outcome) => self.finish_return(request, outcome, Some(secondary)).await,
            Err(err) if secondary.duplicate => Err(err),
            Err(err) => self.compensate(&secondary.transaction_id, err).await,
        }
    }

    /// Voids a secondary transaction whose item return failed, then hands
    /// back the return's error.
    ///
    /// When the void fails too, the secondary stays a paid sale; the error
    /// becomes a non-transient `Storage` failure naming it.
    async fn compensate<T>(&self, secondary_id: &str, cause: LedgerError) -> LedgerResult<T> {
        let reason = "exchange compensation";
        match self
            .store
            .void_transaction(secondary_id, reason, (self.clock)())
            .await
        {
            Ok(_) => {
                warn!(transaction_id = %secondary_id, "Exchange transaction voided");
                Err(cause)
            }
            Err(void_err) => {
                error!(
                    transaction_id = %secondary_id,
                    cause = %cause,
                    error = %void_err,
                    "Exchange transaction left paid after failed return"
                );
                Err(LedgerError::storage(
                    format!(
                        "exchange transaction {secondary_id} left paid: return failed ({cause}), \
                         void failed ({void_err})"
                    ),
                    false,
                ))
            }
        }
    }

    async fn finish_return(
        &self,
        request: &ReturnRequest,
        outcome: ItemReturnOutcome,
        exchange: Option<CheckoutResponse>,
    ) -> LedgerResult<ReturnReceipt> {
        match outcome {
            ItemReturnOutcome::Created {
                item_return,
                refund,
                restocked,
                transaction,
            } => {
                info!(
                    item_return_id = %item_return.id,
                    mode = ?item_return.mode,
                    credit = item_return.credit_cents,
                    refunded = refund.as_ref().map_or(0, |r| r.amount_cents),
                    status = transaction.status.as_str(),
                    "Item return recorded"
                );
                Ok(ReturnReceipt {
                    item_return,
                    refund,
                    exchange,
                    restocked,
                    duplicate: false,
                })
            }
            // Lost the race for the key to a concurrent request.
            ItemReturnOutcome::Duplicate(existing) => {
                self.replayed_return(request, existing).await
            }
        }
    }

    async fn replayed_return(
        &self,
        request: &ReturnRequest,
        existing: ItemReturn,
    ) -> LedgerResult<ReturnReceipt> {
        if existing.transaction_id != request.transaction_id {
            return Err(LedgerError::invalid(format!(
                "idempotency key belongs to a return on transaction {}",
                existing.transaction_id
            )));
        }
        debug!(item_return_id = %existing.id, "Idempotent return replay");

        let refund = match &existing.refund_id {
            Some(refund_id) => ledger(self.store.list_refunds(&existing.transaction_id).await)?
                .into_iter()
                .find(|r| &r.id == refund_id),
            None => None,
        };
        let exchange = match &existing.exchange_transaction_id {
            Some(id) => {
                let secondary = self.checkout.transaction(id).await?;
                Some(CheckoutResponse::from_transaction(&secondary, true))
            }
            None => None,
        };

        Ok(ReturnReceipt {
            item_return: existing,
            refund,
            exchange,
            restocked: Vec::new(),
            duplicate: true,
        })
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn refund_summary(&self, transaction_id: &str) -> LedgerResult<RefundSummary> {
        let tx = self.checkout.transaction(transaction_id).await?;
        let refunds = ledger(self.store.list_refunds(&tx.id).await)?;
        let item_returns = ledger(self.store.list_item_returns(&tx.id).await)?;
        let refunded: i64 = refunds.iter().map(|r| r.amount_cents).sum();

        Ok(RefundSummary {
            transaction_id: tx.id,
            status: tx.status,
            total_cents: tx.total_cents,
            refunded_cents: refunded,
            remaining_cents: (tx.total_cents - refunded).max(0),
            refunds,
            item_returns,
        })
    }

    /// Time by the engine clock.
    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_core::{ErrorKind, LotSource, Product};
    use tally_db::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    async fn setup() -> (Arc<MemoryStore>, Arc<CheckoutEngine>, ReversalEngine) {
        let store = Arc::new(MemoryStore::new());
        for (sku, price) in [("SHIRT", 2_000), ("SOCKS", 500)] {
            store
                .upsert_product(
                    Product {
                        sku: sku.into(),
                        name: sku.to_lowercase(),
                        price_cents: price,
                        margin_bps: 2_500,
                        is_active: true,
                    },
                    now(),
                )
                .await
                .unwrap();
            store.set_stock("S1", sku, 20, now()).await.unwrap();
        }
        let checkout = Arc::new(CheckoutEngine::new(store.clone()).with_clock(Arc::new(now)));
        let reversal = ReversalEngine::new(store.clone(), checkout.clone()).with_clock(Arc::new(now));
        (store, checkout, reversal)
    }

    async fn sell(checkout: &CheckoutEngine, key: &str, cart: Vec<CartLine>) -> String {
        checkout
            .checkout(CheckoutRequest {
                store_id: "S1".into(),
                terminal_id: "T1".into(),
                idempotency_key: key.into(),
                payment_method: PaymentMethod::Cash,
                payment_splits: vec![],
                payment_reference: None,
                cash_received_cents: 1_000_000,
                discount_cents: 0,
                tax_rate: TaxRate::zero(),
                manual_override: false,
                cart,
            })
            .await
            .unwrap()
            .transaction_id
    }

    #[tokio::test]
    async fn test_void_restocks_as_void_lots() {
        let (store, checkout, reversal) = setup().await;
        let id = sell(&checkout, "sale-1", vec![CartLine::new("SHIRT", 2)]).await;
        assert_eq!(store.get_stock_level("S1", "SHIRT").await.unwrap().quantity, 18);

        assert!(reversal.void(&id, "  ").await.is_err());

        let outcome = reversal.void(&id, "wrong customer").await.unwrap();
        assert_eq!(outcome.transaction.status, TransactionStatus::Voided);
        assert_eq!(outcome.transaction.void_reason.as_deref(), Some("wrong customer"));
        assert_eq!(outcome.restocked.len(), 1);
        assert_eq!(outcome.restocked[0].source, LotSource::Void);
        assert_eq!(outcome.restocked[0].source_ref.as_deref(), Some(id.as_str()));
        // 2000 at 25% margin
        assert_eq!(outcome.restocked[0].unit_cost_cents, 1_500);
        assert_eq!(store.get_stock_level("S1", "SHIRT").await.unwrap().quantity, 20);

        let err = reversal.void(&id, "again").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    }

    #[tokio::test]
    async fn test_refund_summary_tracks_partial_refunds() {
        let (_, checkout, reversal) = setup().await;
        let id = sell(&checkout, "sale-1", vec![CartLine::new("SOCKS", 4)]).await;

        let receipt = reversal
            .refund(RefundRequest {
                transaction_id: id.clone(),
                amount_cents: 500,
                reason: Some("damaged".into()),
            })
            .await
            .unwrap();
        assert_eq!(receipt.transaction.status, TransactionStatus::Paid);

        let summary = reversal.refund_summary(&id).await.unwrap();
        assert_eq!(summary.total_cents, 2_000);
        assert_eq!(summary.refunded_cents, 500);
        assert_eq!(summary.remaining_cents, 1_500);
        assert_eq!(summary.refunds.len(), 1);

        assert!(reversal
            .refund(RefundRequest {
                transaction_id: id.clone(),
                amount_cents: 0,
                reason: None,
            })
            .await
            .is_err());

        // partially refunded sales cannot be voided
        assert!(reversal.void(&id, "oops").await.is_err());
    }

    #[tokio::test]
    async fn test_refund_of_unknown_transaction_is_not_found() {
        let (_, _, reversal) = setup().await;
        let err = reversal
            .refund(RefundRequest {
                transaction_id: "missing".into(),
                amount_cents: 100,
                reason: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_exchange_requires_idempotency_key() {
        let (_, checkout, reversal) = setup().await;
        let id = sell(&checkout, "sale-1", vec![CartLine::new("SHIRT", 1)]).await;

        let err = reversal
            .return_items(ReturnRequest {
                transaction_id: id,
                idempotency_key: None,
                items: vec![CartLine::new("SHIRT", 1)],
                reason: None,
                action: ReturnAction::Exchange(ExchangeRequest {
                    terminal_id: "T1".into(),
                    items: vec![CartLine::new("SOCKS", 1)],
                    payment_method: PaymentMethod::Cash,
                    payment_splits: vec![],
                    payment_reference: None,
                    cash_received_cents: 0,
                    tax_rate: TaxRate::zero(),
                }),
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    }

    #[tokio::test]
    async fn test_return_of_unsold_sku_rejected() {
        let (store, checkout, reversal) = setup().await;
        let id = sell(&checkout, "sale-1", vec![CartLine::new("SHIRT", 1)]).await;

        let err = reversal
            .return_items(ReturnRequest {
                transaction_id: id,
                idempotency_key: Some("ret-1".into()),
                items: vec![CartLine::new("SOCKS", 1)],
                reason: None,
                action: ReturnAction::Refund,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
        assert!(store.find_item_return_by_idempotency("ret-1").await.unwrap().is_none());
    }
}
