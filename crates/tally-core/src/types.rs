//! # Domain Types
//!
//! Core domain types shared by the engines and both storage backends.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  Transaction    │   │     Refund      │   │   ItemReturn    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  id (UUID)      │◄──│  transaction_id │   │  transaction_id │──┐    │
//! │  │  idempotency_key│   │  amount_cents   │   │  mode           │  │    │
//! │  │  lines (frozen) │   │  status         │   │  lines          │  │    │
//! │  │  status         │   └─────────────────┘   │  exchange tx ───┼──┘    │
//! │  └─────────────────┘                         └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  InventoryLot   │   │  StockLevel     │   │  TrackingMode   │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  expiry_date?   │   │  quantity       │   │  Counter        │       │
//! │  │  qty_available  │   │  tracking_mode  │   │  Lots           │       │
//! │  │  source         │   └─────────────────┘   └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Snapshot Pattern
//! Transaction lines copy price and margin at checkout time. Nothing reads
//! the live catalog for a transaction after it is created.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::money::Money;

/// Per-SKU quantities keyed by SKU.
pub type StockMap = HashMap<String, i64>;

// =============================================================================
// Rates
// =============================================================================

/// Tax rate represented in basis points (bps).
///
/// 1 basis point = 0.01%, so 1100 bps = 11%.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxRate(u32);

impl TaxRate {
    /// Creates a tax rate from basis points.
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        TaxRate(bps)
    }

    /// Creates a tax rate from whole percent.
    #[inline]
    pub const fn from_percent(pct: u32) -> Self {
        TaxRate(pct.saturating_mul(100))
    }

    /// Returns the rate in basis points.
    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }

    /// Zero tax rate.
    #[inline]
    pub const fn zero() -> Self {
        TaxRate(0)
    }
}

impl Default for TaxRate {
    fn default() -> Self {
        TaxRate::zero()
    }
}

/// Gross margin as a share of the selling price, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarginRate(u32);

impl MarginRate {
    #[inline]
    pub const fn from_bps(bps: u32) -> Self {
        MarginRate(bps)
    }

    #[inline]
    pub const fn bps(&self) -> u32 {
        self.0
    }
}

// =============================================================================
// Product
// =============================================================================

/// A catalog entry as the ledger consumes it.
///
/// The catalog is owned elsewhere; checkout only reads price, margin and
/// the active flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    /// Stock Keeping Unit - business identifier.
    pub sku: String,

    /// Display name, snapshotted onto transaction lines.
    pub name: String,

    /// Price in cents.
    pub price_cents: i64,

    /// Margin in basis points (2000 = 20%).
    pub margin_bps: u32,

    /// Inactive products cannot be sold.
    pub is_active: bool,
}

impl Product {
    /// Returns the price as Money.
    #[inline]
    pub fn price(&self) -> Money {
        Money::from_cents(self.price_cents)
    }

    /// Returns the margin rate.
    #[inline]
    pub fn margin(&self) -> MarginRate {
        MarginRate::from_bps(self.margin_bps)
    }
}

// =============================================================================
// Transaction Status
// =============================================================================

/// The status of a sales transaction.
///
/// ```text
///          ┌──────────► Voided   (terminal)
///   Paid ──┤
///          └──────────► Refunded (terminal, cumulative refunds == total)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Paid,
    Voided,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Paid => "paid",
            TransactionStatus::Voided => "voided",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

// =============================================================================
// Payment
// =============================================================================

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Physical cash; the only method that produces change.
    Cash,
    /// Card on an external terminal.
    Card,
    /// QR code payment.
    Qris,
    /// Bank transfer.
    Transfer,
    /// E-wallet.
    EWallet,
    /// Two or more methods, described by payment splits.
    Split,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Qris => "qris",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::EWallet => "e_wallet",
            PaymentMethod::Split => "split",
        }
    }
}

/// One leg of a split payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSplit {
    pub method: PaymentMethod,
    pub amount_cents: i64,
    /// Required for every non-cash leg.
    pub reference: Option<String>,
}

// =============================================================================
// Transaction
// =============================================================================

/// A priced line of a transaction. Frozen at checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLine {
    pub sku: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub margin_bps: u32,
    pub line_total_cents: i64,
}

impl TransactionLine {
    /// Unit cost implied by the snapshotted price and margin, at least 1.
    ///
    /// Used to cost restock lots created by voids and returns.
    pub fn unit_cost_cents(&self) -> i64 {
        let price = Money::from_cents(self.unit_price_cents);
        let cost = price - price.margin_share(MarginRate::from_bps(self.margin_bps));
        cost.cents().max(1)
    }
}

/// A committed sales transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub store_id: String,
    pub terminal_id: String,
    pub idempotency_key: String,
    pub payment_method: PaymentMethod,
    pub payment_reference: Option<String>,
    pub payment_splits: Vec<PaymentSplit>,
    pub lines: Vec<TransactionLine>,
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub cash_received_cents: i64,
    pub change_cents: i64,
    pub status: TransactionStatus,
    /// Set when the shift precondition was bypassed.
    pub manual_override: bool,
    pub void_reason: Option<String>,
    pub voided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Transaction {
    /// Total units across all lines.
    pub fn item_count(&self) -> i64 {
        self.lines.iter().map(|l| l.quantity).sum()
    }

    /// Purchased quantity per SKU.
    pub fn purchased_quantities(&self) -> StockMap {
        let mut qty = StockMap::new();
        for line in &self.lines {
            *qty.entry(line.sku.clone()).or_insert(0) += line.quantity;
        }
        qty
    }

    pub fn line(&self, sku: &str) -> Option<&TransactionLine> {
        self.lines.iter().find(|l| l.sku == sku)
    }
}

// =============================================================================
// Refunds and Returns
// =============================================================================

/// Refunds are recorded only once they have succeeded.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Completed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Refund {
    pub id: String,
    pub transaction_id: String,
    pub amount_cents: i64,
    pub status: RefundStatus,
    pub reason: Option<String>,
    /// Set when the refund was issued by an item return.
    pub item_return_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnMode {
    /// Credit goes back to the customer as a refund.
    Refund,
    /// Credit pays for a new cart.
    Exchange,
}

/// Returned units of one SKU, priced at the original sale's unit price.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ReturnLine {
    pub sku: String,
    pub quantity: i64,
    pub unit_price_cents: i64,
    pub amount_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemReturn {
    pub id: String,
    pub transaction_id: String,
    pub store_id: String,
    pub idempotency_key: Option<String>,
    pub mode: ReturnMode,
    pub lines: Vec<ReturnLine>,
    /// Value of the returned goods.
    pub credit_cents: i64,
    /// Secondary transaction created by an exchange.
    pub exchange_transaction_id: Option<String>,
    /// What the customer paid on top of the credit in an exchange.
    pub additional_payment_cents: i64,
    /// Refund issued for the credit (refund mode) or its unused remainder.
    pub refund_id: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ItemReturn {
    /// Returned quantity per SKU.
    pub fn quantities(&self) -> StockMap {
        let mut qty = StockMap::new();
        for line in &self.lines {
            *qty.entry(line.sku.clone()).or_insert(0) += line.quantity;
        }
        qty
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// How a store×SKU counter relates to its lots.
///
/// A SKU starts in `Counter` mode and switches to `Lots` when its first
/// lot arrives; it never switches back.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// Only the aggregate counter exists.
    #[default]
    Counter,
    /// Stock is also held in FEFO lots.
    Lots,
}

/// Aggregate stock for one store×SKU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct StockLevel {
    pub store_id: String,
    pub sku: String,
    pub quantity: i64,
    pub tracking_mode: TrackingMode,
}

/// Where a lot came from.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LotSource {
    Manual,
    PurchaseOrder,
    Return,
    Void,
    /// Counter stock that existed before the SKU's first lot.
    Opening,
    /// Administrative increase of a lot-tracked SKU.
    Adjustment,
}

impl LotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LotSource::Manual => "manual",
            LotSource::PurchaseOrder => "purchase_order",
            LotSource::Return => "return",
            LotSource::Void => "void",
            LotSource::Opening => "opening",
            LotSource::Adjustment => "adjustment",
        }
    }

    /// Prefix used in generated lot codes.
    pub fn code_prefix(&self) -> &'static str {
        match self {
            LotSource::Manual => "MAN",
            LotSource::PurchaseOrder => "PO",
            LotSource::Return => "RET",
            LotSource::Void => "VOID",
            LotSource::Opening => "OPEN",
            LotSource::Adjustment => "ADJ",
        }
    }
}

/// A discrete receipt of stock.
///
/// `qty_available` starts at `qty_received` and only decreases, through
/// checkout depletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct InventoryLot {
    pub id: String,
    pub store_id: String,
    pub sku: String,
    pub lot_code: String,
    pub expiry_date: Option<NaiveDate>,
    pub qty_received: i64,
    pub qty_available: i64,
    pub unit_cost_cents: i64,
    pub source: LotSource,
    pub source_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl InventoryLot {
    /// A lot is expired once its expiry date is strictly before `as_of`.
    pub fn is_expired(&self, as_of: NaiveDate) -> bool {
        matches!(self.expiry_date, Some(expiry) if expiry < as_of)
    }
}

/// A receipt event before it becomes a lot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLot {
    pub store_id: String,
    pub sku: String,
    /// Generated when absent.
    pub lot_code: Option<String>,
    pub expiry_date: Option<NaiveDate>,
    pub qty_received: i64,
    pub unit_cost_cents: i64,
    pub source: LotSource,
    pub source_ref: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl NewLot {
    /// Assigns identity and a lot code; `available` starts equal to `received`.
    pub fn into_lot(self) -> InventoryLot {
        let id = Uuid::new_v4();
        let lot_code = match self.lot_code {
            Some(code) if !code.trim().is_empty() => code,
            _ => generate_lot_code(self.source, self.received_at, &id),
        };
        InventoryLot {
            id: id.to_string(),
            store_id: self.store_id,
            sku: self.sku,
            lot_code,
            expiry_date: self.expiry_date,
            qty_received: self.qty_received,
            qty_available: self.qty_received,
            unit_cost_cents: self.unit_cost_cents,
            source: self.source,
            source_ref: self.source_ref,
            received_at: self.received_at,
        }
    }
}

/// `<SOURCE>-<YYYYMMDD>-<8 hex>`, e.g. `VOID-20240110-1A2B3C4D`.
pub fn generate_lot_code(source: LotSource, at: DateTime<Utc>, id: &Uuid) -> String {
    let hex = id.simple().to_string();
    format!(
        "{}-{}-{}",
        source.code_prefix(),
        at.format("%Y%m%d"),
        hex[..8].to_uppercase()
    )
}

/// Filter for listing lots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LotQuery {
    pub store_id: String,
    pub sku: Option<String>,
    pub include_expired: bool,
    /// Reference date for expiry.
    pub as_of: NaiveDate,
    pub limit: Option<usize>,
}

/// Units taken from one lot by a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotDepletion {
    pub lot_id: String,
    pub lot_code: String,
    pub quantity: i64,
}

/// Result of allocating one SKU for a sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub sku: String,
    pub quantity: i64,
    pub mode: TrackingMode,
    /// FEFO-ordered; empty in `Counter` mode.
    pub depletions: Vec<LotDepletion>,
}

// =============================================================================
// Unit Tests
// =============================================================================
