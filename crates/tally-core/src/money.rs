//! # Money
//!
//! Integer minor units (cents) for every amount the ledger stores or sums.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  unit price × qty ──► line total ──Σ──► subtotal                        │
//! │                                            │                            │
//! │                     − min(discount, subtotal)                           │
//! │                                            │                            │
//! │                     + tax (the one rounding step) ──► total             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Replaying the same cart must land on the same total, so nothing here
//! touches floating point.
//!
//! ```rust
//! use tally_core::money::Money;
//!
//! let line = Money::from_cents(1099).checked_times(3).unwrap();
//! assert_eq!(line.cents(), 3297);
//! assert_eq!(Money::from_cents(i64::MAX).checked_times(2), None);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;

use crate::types::{MarginRate, TaxRate};

const BPS_PER_UNIT: i128 = 10_000;

/// An amount in cents. Negative values only appear transiently.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    #[inline]
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    #[inline]
    pub const fn cents(self) -> i64 {
        self.0
    }

    #[inline]
    pub const fn zero() -> Self {
        Money(0)
    }

    #[inline]
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// Zero when negative.
    #[inline]
    pub const fn floor_zero(self) -> Self {
        if self.0 < 0 {
            Money(0)
        } else {
            self
        }
    }

    /// `None` past the range of `i64`.
    #[inline]
    pub const fn checked_times(self, qty: i64) -> Option<Self> {
        match self.0.checked_mul(qty) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    #[inline]
    pub const fn checked_add(self, rhs: Money) -> Option<Self> {
        match self.0.checked_add(rhs.0) {
            Some(cents) => Some(Money(cents)),
            None => None,
        }
    }

    /// Tax owed on this amount, rounded half away from zero.
    ///
    /// ```rust
    /// use tally_core::money::Money;
    /// use tally_core::types::TaxRate;
    ///
    /// // 1250 × 11% = 137.5
    /// assert_eq!(Money::from_cents(1250).calculate_tax(TaxRate::from_percent(11)).cents(), 138);
    /// ```
    pub fn calculate_tax(self, rate: TaxRate) -> Money {
        Money(scale_bps(self.0, rate.bps()))
    }

    /// The margin share of this amount, rounded like tax.
    pub fn margin_share(self, margin: MarginRate) -> Money {
        Money(scale_bps(self.0, margin.bps()))
    }
}

/// `amount × bps / 10000`, half away from zero.
fn scale_bps(amount: i64, bps: u32) -> i64 {
    let magnitude = (i128::from(amount).abs() * i128::from(bps) + BPS_PER_UNIT / 2) / BPS_PER_UNIT;
    let magnitude = magnitude as i64;
    if amount < 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Two decimals with a leading minus; currency symbols are left to callers.
impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let units = self.0.unsigned_abs();
        if self.0 < 0 {
            f.write_str("-")?;
        }
        write!(f, "{}.{:02}", units / 100, units % 100)
    }
}

impl Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Money) -> Money {
        Money(self.0 - rhs.0)
    }
}
