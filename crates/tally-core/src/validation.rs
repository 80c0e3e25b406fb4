//! # Validation Module
//!
//! Input validation that runs before any ledger mutation.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: THIS MODULE (pure)                                           │
//! │  ├── identifiers, SKUs, quantities, cart limits                        │
//! │  └── payment rules (cash, split, references)                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Storage critical section                                     │
//! │  ├── stock and lot availability                                        │
//! │  └── refund / return ceilings against committed state                  │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: SQLite constraints                                           │
//! │  ├── UNIQUE(idempotency_key)                                           │
//! │  └── CHECK(quantity >= 0), CHECK(0 <= qty_available <= qty_received)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use tally_core::validation::{validate_sku, validate_quantity};
//!
//! assert!(validate_sku("COKE-330").is_ok());
//! assert!(validate_quantity(5, 999).is_ok());
//! ```

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::pricing::CartLine;
use crate::types::{PaymentMethod, PaymentSplit};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Longest accepted store id, terminal id or idempotency key.
const MAX_IDENTIFIER_LEN: usize = 128;

// =============================================================================
// String Validators
// =============================================================================

/// Validates a SKU (Stock Keeping Unit).
///
/// ## Rules
/// - Must not be empty
/// - At most 50 characters
/// - Only alphanumeric characters, hyphens, underscores
pub fn validate_sku(sku: &str) -> ValidationResult<()> {
    let sku = sku.trim();

    if sku.is_empty() {
        return Err(ValidationError::Required {
            field: "sku".to_string(),
        });
    }

    if sku.len() > 50 {
        return Err(ValidationError::TooLong {
            field: "sku".to_string(),
            max: 50,
        });
    }

    if !sku
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
    {
        return Err(ValidationError::InvalidFormat {
            field: "sku".to_string(),
            reason: "must contain only letters, numbers, hyphens, and underscores".to_string(),
        });
    }

    Ok(())
}

/// Validates a product name: non-empty, at most 200 characters.
pub fn validate_product_name(name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: "name".to_string(),
        });
    }

    if name.len() > 200 {
        return Err(ValidationError::TooLong {
            field: "name".to_string(),
            max: 200,
        });
    }

    Ok(())
}

/// Validates an opaque identifier such as a store id or idempotency key.
pub fn validate_identifier(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_IDENTIFIER_LEN,
        });
    }

    Ok(())
}

// =============================================================================
// Numeric Validators
// =============================================================================

/// Validates a quantity value.
///
/// ## Rules
/// - Must be positive (> 0)
/// - Must not exceed `max`
pub fn validate_quantity(qty: i64, max: i64) -> ValidationResult<()> {
    if qty <= 0 {
        return Err(ValidationError::MustBePositive {
            field: "quantity".to_string(),
        });
    }

    if qty > max {
        return Err(ValidationError::OutOfRange {
            field: "quantity".to_string(),
            min: 1,
            max,
        });
    }

    Ok(())
}

/// Validates a price in cents. Zero is allowed (free items).
pub fn validate_price_cents(cents: i64) -> ValidationResult<()> {
    if cents < 0 {
        return Err(ValidationError::OutOfRange {
            field: "price".to_string(),
            min: 0,
            max: i64::MAX,
        });
    }

    Ok(())
}

/// Validates a rate in basis points: 0 to 10000 (0% to 100%).
pub fn validate_rate_bps(field: &str, bps: u32) -> ValidationResult<()> {
    if bps > 10_000 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min: 0,
            max: 10_000,
        });
    }

    Ok(())
}

// =============================================================================
// Collection Validators
// =============================================================================

/// Validates a normalised cart against the line and quantity limits.
pub fn validate_cart(lines: &[CartLine], max_lines: usize, max_quantity: i64) -> ValidationResult<()> {
    if lines.is_empty() {
        return Err(ValidationError::Required {
            field: "cart".to_string(),
        });
    }

    if lines.len() > max_lines {
        return Err(ValidationError::OutOfRange {
            field: "cart lines".to_string(),
            min: 1,
            max: max_lines as i64,
        });
    }

    for line in lines {
        validate_sku(&line.sku)?;
        validate_quantity(line.quantity, max_quantity)?;
    }

    Ok(())
}

// =============================================================================
// Payment Validators
// =============================================================================

/// What a validated payment settles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub cash_received_cents: i64,
    pub change_cents: i64,
}

/// Validates a payment against the transaction total.
///
/// ## Rules
/// ```text
/// ┌──────────────┬──────────────────────────────────────────────────────────┐
/// │ Cash         │ received ≥ total; change = received − total             │
/// │ Split        │ ≥ 2 legs, distinct methods, each leg ≥ 1,               │
/// │              │ non-cash legs carry a reference, Σ legs == total        │
/// │ Other        │ reference required; no change                            │
/// └──────────────┴──────────────────────────────────────────────────────────┘
/// ```
///
/// For splits, the cash leg (if any) is reported as cash received.
pub fn validate_payment(
    method: PaymentMethod,
    splits: &[PaymentSplit],
    cash_received_cents: i64,
    reference: Option<&str>,
    total_cents: i64,
) -> ValidationResult<Settlement> {
    if method != PaymentMethod::Split && !splits.is_empty() {
        return Err(ValidationError::NotAllowed {
            field: "payment_splits".to_string(),
            allowed: vec![PaymentMethod::Split.as_str().to_string()],
        });
    }

    match method {
        PaymentMethod::Cash => {
            if cash_received_cents < total_cents {
                return Err(ValidationError::OutOfRange {
                    field: "cash_received".to_string(),
                    min: total_cents,
                    max: i64::MAX,
                });
            }
            Ok(Settlement {
                cash_received_cents,
                change_cents: cash_received_cents - total_cents,
            })
        }
        PaymentMethod::Split => validate_splits(splits, total_cents),
        _ => {
            require_reference("payment_reference", reference)?;
            Ok(Settlement {
                cash_received_cents: 0,
                change_cents: 0,
            })
        }
    }
}

fn validate_splits(splits: &[PaymentSplit], total_cents: i64) -> ValidationResult<Settlement> {
    if splits.len() < 2 {
        return Err(ValidationError::OutOfRange {
            field: "payment_splits".to_string(),
            min: 2,
            max: i64::MAX,
        });
    }

    let mut seen = HashSet::new();
    let mut sum = 0i64;
    let mut cash = 0i64;
    for split in splits {
        if split.method == PaymentMethod::Split {
            return Err(ValidationError::InvalidFormat {
                field: "payment_splits".to_string(),
                reason: "a split leg cannot itself be split".to_string(),
            });
        }
        if !seen.insert(split.method) {
            return Err(ValidationError::Duplicate {
                field: "payment split method".to_string(),
                value: split.method.as_str().to_string(),
            });
        }
        if split.amount_cents < 1 {
            return Err(ValidationError::MustBePositive {
                field: "payment split amount".to_string(),
            });
        }
        if split.method == PaymentMethod::Cash {
            cash = split_sum(cash, split.amount_cents)?;
        } else {
            require_reference("payment split reference", split.reference.as_deref())?;
        }
        sum = split_sum(sum, split.amount_cents)?;
    }

    if sum != total_cents {
        return Err(ValidationError::Mismatch {
            field: "payment splits total".to_string(),
            expected: total_cents,
            actual: sum,
        });
    }

    Ok(Settlement {
        cash_received_cents: cash,
        change_cents: 0,
    })
}

fn split_sum(acc: i64, amount: i64) -> ValidationResult<i64> {
    acc.checked_add(amount).ok_or_else(|| ValidationError::OutOfRange {
        field: "payment splits total".to_string(),
        min: 1,
        max: i64::MAX,
    })
}

fn require_reference(field: &str, reference: Option<&str>) -> ValidationResult<()> {
    match reference {
        Some(r) if !r.trim().is_empty() => Ok(()),
        _ => Err(ValidationError::Required {
            field: field.to_string(),
        }),
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
