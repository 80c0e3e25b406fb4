//! # Pricing Module
//!
//! Turns a raw cart into priced, snapshotted lines and totals.
//!
//! ## Flow
//! ```text
//! raw cart ──► normalize_cart ──► price_lines ──► compute_totals
//!  (SKU, qty)    sum repeats       catalog          subtotal
//!                drop qty ≤ 0      snapshot         − discount (capped)
//!                                                   + tax (rounded once)
//!                                                   = total
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, LedgerResult};
use crate::money::Money;
use crate::types::{Product, TaxRate, TransactionLine};

/// One requested line of a cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartLine {
    pub sku: String,
    pub quantity: i64,
}

impl CartLine {
    pub fn new(sku: impl Into<String>, quantity: i64) -> Self {
        CartLine {
            sku: sku.into(),
            quantity,
        }
    }
}

/// Sums quantities of repeated SKUs and drops zero or negative lines.
///
/// Lines keep the order in which each SKU first appeared. A summed quantity
/// past `i64::MAX` is an invalid cart.
pub fn normalize_cart(lines: &[CartLine]) -> LedgerResult<Vec<CartLine>> {
    let mut order: Vec<CartLine> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for line in lines.iter().filter(|l| l.quantity > 0) {
        let sku = line.sku.trim();
        match index.get(sku) {
            Some(&i) => {
                order[i].quantity = order[i]
                    .quantity
                    .checked_add(line.quantity)
                    .ok_or_else(|| LedgerError::invalid(format!("quantity of {sku} overflows")))?;
            }
            None => {
                index.insert(sku.to_string(), order.len());
                order.push(CartLine::new(sku, line.quantity));
            }
        }
    }
    Ok(order)
}

/// Prices normalised lines against the catalog.
///
/// Any unknown or inactive SKU fails the whole cart.
pub fn price_lines(
    cart: &[CartLine],
    catalog: &HashMap<String, Product>,
) -> LedgerResult<Vec<TransactionLine>> {
    cart.iter()
        .map(|line| {
            let product = catalog
                .get(&line.sku)
                .ok_or_else(|| LedgerError::invalid(format!("unknown sku {}", line.sku)))?;
            if !product.is_active {
                return Err(LedgerError::invalid(format!(
                    "sku {} is not active",
                    line.sku
                )));
            }
            Ok(TransactionLine {
                sku: product.sku.clone(),
                name: product.name.clone(),
                quantity: line.quantity,
                unit_price_cents: product.price_cents,
                margin_bps: product.margin_bps,
                line_total_cents: product
                    .price()
                    .checked_times(line.quantity)
                    .ok_or_else(|| {
                        LedgerError::invalid(format!("line total of {} overflows", line.sku))
                    })?
                    .cents(),
            })
        })
        .collect()
}

/// Money totals of a priced cart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub subtotal_cents: i64,
    pub discount_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
}

/// Computes `subtotal − discount + tax`.
///
/// The discount is capped at the subtotal and tax is charged on the
/// discounted amount.
///
/// ## Example
/// ```rust
/// use tally_core::money::Money;
/// use tally_core::pricing::compute_totals;
/// use tally_core::types::{TaxRate, TransactionLine};
///
/// let lines = vec![TransactionLine {
///     sku: "TEA".into(),
///     name: "Tea".into(),
///     quantity: 2,
///     unit_price_cents: 1_500,
///     margin_bps: 0,
///     line_total_cents: 3_000,
/// }];
/// let totals = compute_totals(&lines, Money::from_cents(500), TaxRate::from_percent(10)).unwrap();
/// assert_eq!(totals.tax_cents, 250);
/// assert_eq!(totals.total_cents, 2_750);
/// ```
pub fn compute_totals(
    lines: &[TransactionLine],
    discount: Money,
    tax_rate: TaxRate,
) -> LedgerResult<Totals> {
    if discount.is_negative() {
        return Err(LedgerError::invalid("discount cannot be negative"));
    }

    let overflow = || LedgerError::invalid("cart total overflows");
    let subtotal = lines
        .iter()
        .map(|l| Money::from_cents(l.line_total_cents))
        .try_fold(Money::zero(), Money::checked_add)
        .ok_or_else(overflow)?;
    let discount = discount.min(subtotal);
    let taxable = (subtotal - discount).floor_zero();
    let tax = taxable.calculate_tax(tax_rate);
    let total = taxable.checked_add(tax).ok_or_else(overflow)?;

    Ok(Totals {
        subtotal_cents: subtotal.cents(),
        discount_cents: discount.cents(),
        tax_cents: tax.cents(),
        total_cents: total.cents(),
    })
}

// =============================================================================
// Unit Tests
// =============================================================================
