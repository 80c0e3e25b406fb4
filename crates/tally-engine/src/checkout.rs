//! # Checkout Engine
//!
//! Turns a cart into a durable, idempotent sales transaction.
//!
//! ## Checkout Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         checkout(request)                               │
//! │                                                                         │
//! │  1. Idempotency fast path ── key seen? ──► return it, duplicate = true │
//! │  2. Shift gate (skipped on manual_override)                            │
//! │  3. Normalize cart (sum repeats, drop qty ≤ 0) + limits                │
//! │  4. Price against the live catalog ── unknown/inactive ──► Invalid     │
//! │  5. Totals: subtotal − min(discount, subtotal) + tax                   │
//! │  6. Payment: cash covers total / splits sum to total / reference       │
//! │       │                                                                 │
//! │       ▼  nothing has been written yet                                   │
//! │  7. LedgerStore::create_checkout  ─── one atomic unit ───              │
//! │       key re-check → allocate every line (FEFO) → deplete → insert      │
//! │       any line short ──► InsufficientStock, no stock touched           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Validation failures are reported before any mutation. The only failure
//! after step 7 begins is `InsufficientStock` (or a storage error), and it
//! leaves nothing behind.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::pricing::{compute_totals, normalize_cart, price_lines, CartLine, Totals};
use tally_core::validation::{
    validate_cart, validate_identifier, validate_payment, validate_rate_bps,
};
use tally_core::{
    LedgerError, LedgerResult, Money, PaymentMethod, PaymentSplit, TaxRate, Transaction,
    TransactionStatus, MAX_CART_ITEMS, MAX_ITEM_QUANTITY,
};
use tally_db::{CheckoutOutcome, LedgerStore};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{ledger, system_clock, Clock};

// =============================================================================
// Request / Response
// =============================================================================

/// Everything a terminal submits to ring up a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub store_id: String,
    pub terminal_id: String,

    /// Deduplicates resubmissions of the same sale. Globally unique.
    pub idempotency_key: String,

    pub payment_method: PaymentMethod,

    /// Legs of a `Split` payment; empty otherwise.
    #[serde(default)]
    pub payment_splits: Vec<PaymentSplit>,

    /// Approval code / transfer reference for non-cash payments.
    #[serde(default)]
    pub payment_reference: Option<String>,

    #[serde(default)]
    pub cash_received_cents: i64,

    /// Pre-computed promotion discount; capped at the subtotal.
    #[serde(default)]
    pub discount_cents: i64,

    #[serde(default)]
    pub tax_rate: TaxRate,

    /// Bypasses the shift gate.
    #[serde(default)]
    pub manual_override: bool,

    pub cart: Vec<CartLine>,
}

/// What the terminal shows after a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub payment_method: PaymentMethod,
    pub totals: Totals,
    pub cash_received_cents: i64,
    pub change_cents: i64,
    pub item_count: i64,
    /// True when the idempotency key had already been committed.
    pub duplicate: bool,
    pub created_at: DateTime<Utc>,
}

impl CheckoutResponse {
    pub fn from_transaction(tx: &Transaction, duplicate: bool) -> Self {
        CheckoutResponse {
            transaction_id: tx.id.clone(),
            status: tx.status,
            payment_method: tx.payment_method,
            totals: Totals {
                subtotal_cents: tx.subtotal_cents,
                discount_cents: tx.discount_cents,
                tax_cents: tx.tax_cents,
                total_cents: tx.total_cents,
            },
            cash_received_cents: tx.cash_received_cents,
            change_cents: tx.change_cents,
            item_count: tx.item_count(),
            duplicate,
            created_at: tx.created_at,
        }
    }
}

// =============================================================================
// Shift Gate
// =============================================================================

/// Precondition owned by shift bookkeeping: is this terminal open for sales?
#[async_trait]
pub trait ShiftGate: Send + Sync {
    /// Fails with `InvalidTransaction` when no shift is open.
    async fn ensure_open(&self, store_id: &str, terminal_id: &str) -> LedgerResult<()>;
}

/// Gate for deployments without shift tracking.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

#[async_trait]
impl ShiftGate for AlwaysOpen {
    async fn ensure_open(&self, _store_id: &str, _terminal_id: &str) -> LedgerResult<()> {
        Ok(())
    }
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckoutLimits {
    /// Distinct SKUs per cart after normalisation.
    pub max_cart_lines: usize,
    /// Units per SKU after normalisation.
    pub max_line_quantity: i64,
}

impl Default for CheckoutLimits {
    fn default() -> Self {
        CheckoutLimits {
            max_cart_lines: MAX_CART_ITEMS,
            max_line_quantity: MAX_ITEM_QUANTITY,
        }
    }
}

/// Prices carts and commits them through the ledger store.
#[derive(Clone)]
pub struct CheckoutEngine {
    store: Arc<dyn LedgerStore>,
    shift_gate: Arc<dyn ShiftGate>,
    limits: CheckoutLimits,
    clock: Clock,
}

impl CheckoutEngine {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        CheckoutEngine {
            store,
            shift_gate: Arc::new(AlwaysOpen),
            limits: CheckoutLimits::default(),
            clock: system_clock(),
        }
    }

    pub fn with_shift_gate(mut self, gate: Arc<dyn ShiftGate>) -> Self {
        self.shift_gate = gate;
        self
    }

    pub fn with_limits(mut self, limits: CheckoutLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn limits(&self) -> CheckoutLimits {
        self.limits
    }

    /// Rings up a sale. See the module docs for the full flow.
    ///
    /// ## Errors
    /// - `InvalidTransaction`: malformed request, unknown/inactive SKU,
    ///   payment mismatch, closed shift, key replayed from another terminal
    /// - `InsufficientStock`: some line cannot be allocated; nothing changed
    /// - `Storage`: the backend failed; retry with the same key
    #[instrument(
        skip_all,
        fields(
            store_id = %request.store_id,
            terminal_id = %request.terminal_id,
            idempotency_key = %request.idempotency_key,
        )
    )]
    pub async fn checkout(&self, request: CheckoutRequest) -> LedgerResult<CheckoutResponse> {
        validate_identifier("store_id", &request.store_id)?;
        validate_identifier("terminal_id", &request.terminal_id)?;
        validate_identifier("idempotency_key", &request.idempotency_key)?;

        if let Some(existing) =
            ledger(self.store.find_transaction_by_idempotency(&request.idempotency_key).await)?
        {
            return replay(&request, &existing);
        }

        if !request.manual_override {
            self.shift_gate
                .ensure_open(&request.store_id, &request.terminal_id)
                .await?;
        }

        let cart = normalize_cart(&request.cart)?;
        validate_cart(
            &cart,
            self.limits.max_cart_lines,
            self.limits.max_line_quantity,
        )?;
        validate_rate_bps("tax_rate", request.tax_rate.bps())?;

        let skus: Vec<String> = cart.iter().map(|line| line.sku.clone()).collect();
        let catalog = ledger(self.store.get_products_by_skus(&skus).await)?;
        let lines = price_lines(&cart, &catalog)?;

        let totals = compute_totals(
            &lines,
            Money::from_cents(request.discount_cents),
            request.tax_rate,
        )?;
        let settlement = validate_payment(
            request.payment_method,
            &request.payment_splits,
            request.cash_received_cents,
            request.payment_reference.as_deref(),
            totals.total_cents,
        )?;

        let now = (self.clock)();
        let tx = Transaction {
            id: Uuid::new_v4().to_string(),
            store_id: request.store_id.clone(),
            terminal_id: request.terminal_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            payment_method: request.payment_method,
            payment_reference: request.payment_reference.clone(),
            payment_splits: request.payment_splits.clone(),
            lines,
            subtotal_cents: totals.subtotal_cents,
            discount_cents: totals.discount_cents,
            tax_cents: totals.tax_cents,
            total_cents: totals.total_cents,
            cash_received_cents: settlement.cash_received_cents,
            change_cents: settlement.change_cents,
            status: TransactionStatus::Paid,
            manual_override: request.manual_override,
            void_reason: None,
            voided_at: None,
            created_at: now,
        };

        match ledger(self.store.create_checkout(tx, now.date_naive()).await) {
            Ok(CheckoutOutcome::Created { transaction, allocations }) => {
                info!(
                    transaction_id = %transaction.id,
                    total = transaction.total_cents,
                    lines = transaction.lines.len(),
                    lot_depletions = allocations.iter().map(|a| a.depletions.len()).sum::<usize>(),
                    "Checkout committed"
                );
                Ok(CheckoutResponse::from_transaction(&transaction, false))
            }
            // Another request with this key committed between the fast path
            // and the write.
            Ok(CheckoutOutcome::Duplicate(existing)) => replay(&request, &existing),
            Err(err) => {
                warn!(error = %err, "Checkout rejected");
                Err(err)
            }
        }
    }

    /// Looks a transaction up by id.
    pub async fn transaction(&self, id: &str) -> LedgerResult<Transaction> {
        ledger(self.store.find_transaction_by_id(id).await)?
            .ok_or_else(|| LedgerError::not_found("transaction", id))
    }
}

/// Answers a replayed key, which must come from the same store and terminal.
fn replay(request: &CheckoutRequest, existing: &Transaction) -> LedgerResult<CheckoutResponse> {
    if existing.store_id != request.store_id || existing.terminal_id != request.terminal_id {
        warn!(
            transaction_id = %existing.id,
            "Idempotency key reused from another store or terminal"
        );
        return Err(LedgerError::invalid(format!(
            "idempotency key {} belongs to another store or terminal",
            request.idempotency_key
        )));
    }
    debug!(transaction_id = %existing.id, "Idempotent replay");
    Ok(CheckoutResponse::from_transaction(existing, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tally_core::{ErrorKind, Product};
    use tally_db::MemoryStore;

    struct Closed;

    #[async_trait]
    impl ShiftGate for Closed {
        async fn ensure_open(&self, _store_id: &str, terminal_id: &str) -> LedgerResult<()> {
            Err(LedgerError::invalid(format!("no open shift on {terminal_id}")))
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    async fn engine() -> (Arc<MemoryStore>, CheckoutEngine) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_product(
                Product {
                    sku: "TEA".into(),
                    name: "Tea".into(),
                    price_cents: 1_500,
                    margin_bps: 3_000,
                    is_active: true,
                },
                now(),
            )
            .await
            .unwrap();
        store
            .upsert_product(
                Product {
                    sku: "OLD".into(),
                    name: "Discontinued".into(),
                    price_cents: 100,
                    margin_bps: 0,
                    is_active: false,
                },
                now(),
            )
            .await
            .unwrap();
        store.set_stock("S1", "TEA", 50, now()).await.unwrap();
        store.set_stock("S1", "OLD", 50, now()).await.unwrap();

        let engine = CheckoutEngine::new(store.clone()).with_clock(Arc::new(now));
        (store, engine)
    }

    fn request(key: &str, cart: Vec<CartLine>) -> CheckoutRequest {
        CheckoutRequest {
            store_id: "S1".into(),
            terminal_id: "T1".into(),
            idempotency_key: key.into(),
            payment_method: PaymentMethod::Cash,
            payment_splits: vec![],
            payment_reference: None,
            cash_received_cents: 100_000,
            discount_cents: 0,
            tax_rate: TaxRate::zero(),
            manual_override: false,
            cart,
        }
    }

    #[tokio::test]
    async fn test_repeated_skus_are_summed_and_zero_lines_dropped() {
        let (store, engine) = engine().await;
        let response = engine
            .checkout(request(
                "k1",
                vec![
                    CartLine::new("TEA", 2),
                    CartLine::new("OLD", 0),
                    CartLine::new("TEA", 1),
                ],
            ))
            .await
            .unwrap();

        assert_eq!(response.item_count, 3);
        assert_eq!(response.totals.subtotal_cents, 4_500);
        assert_eq!(response.created_at, now());

        let tx = engine.transaction(&response.transaction_id).await.unwrap();
        assert_eq!(tx.lines.len(), 1);
        assert_eq!(tx.lines[0].margin_bps, 3_000);
        assert_eq!(store.get_stock_level("S1", "TEA").await.unwrap().quantity, 47);
    }

    #[tokio::test]
    async fn test_inactive_or_unknown_sku_rejects_cart() {
        let (store, engine) = engine().await;
        for sku in ["OLD", "NOPE"] {
            let err = engine
                .checkout(request(sku, vec![CartLine::new("TEA", 1), CartLine::new(sku, 1)]))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
        }
        assert_eq!(store.get_stock_level("S1", "TEA").await.unwrap().quantity, 50);
    }

    #[tokio::test]
    async fn test_limits_apply_after_normalisation() {
        let (_, engine) = engine().await;
        let engine = engine.with_limits(CheckoutLimits {
            max_cart_lines: 1,
            max_line_quantity: 5,
        });

        let err = engine
            .checkout(request("k1", vec![CartLine::new("TEA", 3), CartLine::new("TEA", 3)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

        assert!(engine
            .checkout(request("k2", vec![CartLine::new("TEA", 5)]))
            .await
            .is_ok());
        assert!(engine.checkout(request("k3", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn test_overflowing_cart_and_rate_rejected() {
        let (store, engine) = engine().await;

        let huge = vec![CartLine::new("TEA", i64::MAX), CartLine::new("TEA", i64::MAX)];
        let err = engine.checkout(request("k1", huge)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

        let mut taxed = request("k2", vec![CartLine::new("TEA", 1)]);
        taxed.tax_rate = TaxRate::from_bps(10_001);
        let err = engine.checkout(taxed).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

        assert_eq!(store.get_stock_level("S1", "TEA").await.unwrap().quantity, 50);
    }

    #[tokio::test]
    async fn test_closed_shift_blocks_unless_overridden() {
        let (_, engine) = engine().await;
        let engine = engine.with_shift_gate(Arc::new(Closed));

        let err = engine
            .checkout(request("k1", vec![CartLine::new("TEA", 1)]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);

        let mut overridden = request("k1", vec![CartLine::new("TEA", 1)]);
        overridden.manual_override = true;
        let response = engine.checkout(overridden).await.unwrap();
        let tx = engine.transaction(&response.transaction_id).await.unwrap();
        assert!(tx.manual_override);
    }

    #[tokio::test]
    async fn test_key_replayed_from_other_terminal_rejected() {
        let (_, engine) = engine().await;
        engine
            .checkout(request("k1", vec![CartLine::new("TEA", 1)]))
            .await
            .unwrap();

        let mut other = request("k1", vec![CartLine::new("TEA", 1)]);
        other.terminal_id = "T2".into();
        let err = engine.checkout(other).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidTransaction);
    }

    #[tokio::test]
    async fn test_non_cash_payments_settle_without_change() {
        let (_, engine) = engine().await;

        let mut card = request("k1", vec![CartLine::new("TEA", 2)]);
        card.payment_method = PaymentMethod::Card;
        assert!(engine.checkout(card.clone()).await.is_err());

        card.payment_reference = Some("APPROVAL-42".into());
        let response = engine.checkout(card).await.unwrap();
        assert_eq!(response.cash_received_cents, 0);
        assert_eq!(response.change_cents, 0);

        let mut split = request("k2", vec![CartLine::new("TEA", 2)]);
        split.payment_method = PaymentMethod::Split;
        split.payment_splits = vec![
            PaymentSplit {
                method: PaymentMethod::Cash,
                amount_cents: 1_000,
                reference: None,
            },
            PaymentSplit {
                method: PaymentMethod::Qris,
                amount_cents: 2_000,
                reference: Some("QR-1".into()),
            },
        ];
        let response = engine.checkout(split.clone()).await.unwrap();
        assert_eq!(response.cash_received_cents, 1_000);

        split.idempotency_key = "k3".into();
        split.payment_splits[1].amount_cents = 1_999;
        assert!(engine.checkout(split).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_not_found() {
        let (_, engine) = engine().await;
        let err = engine.transaction("missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
