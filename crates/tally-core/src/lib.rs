//! # tally-core: Pure Ledger Logic for Tally
//!
//! Everything the checkout and reversal engines decide without touching
//! storage lives here: integer money, domain types, FEFO ordering and
//! allocation planning, cart pricing, and refund/return ceilings.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Architecture                               │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                    tally-engine                                 │   │
//! │  │   CheckoutEngine ──► ReversalEngine ──► InventoryLedger         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    tally-db (LedgerStore)                       │   │
//! │  │         MemoryStore (coarse lock) │ SqliteStore (BEGIN IMMEDIATE)│   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │ both call                              │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ tally-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐  │   │
//! │  │   │  types  │ │  money  │ │  fefo   │ │ pricing │ │reversal │  │   │
//! │  │   └─────────┘ └─────────┘ └─────────┘ └─────────┘ └─────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO LOCKS • PURE FUNCTIONS             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Product, Transaction, InventoryLot, ...)
//! - [`money`] - Money type with integer arithmetic
//! - [`error`] - The closed ledger error taxonomy
//! - [`validation`] - Field and payment validation
//! - [`fefo`] - First-expired-first-out ordering and allocation planning
//! - [`pricing`] - Cart normalisation, line pricing and totals
//! - [`reversal`] - Void, refund and return ceilings
//!
//! ## Example Usage
//!
//! ```rust
//! use tally_core::money::Money;
//! use tally_core::types::TaxRate;
//!
//! let net = Money::from_cents(10_000);
//! let tax = net.calculate_tax(TaxRate::from_percent(11));
//! assert_eq!(tax.cents(), 1_100);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod fefo;
pub mod money;
pub mod pricing;
pub mod reversal;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{ErrorKind, LedgerError, LedgerResult, ValidationError};
pub use money::Money;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Maximum distinct SKUs allowed in a single cart.
///
/// ## Business Reason
/// Prevents runaway carts and keeps one checkout's lock window bounded.
pub const MAX_CART_ITEMS: usize = 100;

/// Maximum quantity of a single SKU in a cart, after repeated lines are summed.
///
/// ## Business Reason
/// Catches typos such as 1000 instead of 10 at the register.
pub const MAX_ITEM_QUANTITY: i64 = 999;

/// Suffix appended to an exchange request's idempotency key to derive the
/// key of the secondary checkout it creates.
pub const EXCHANGE_KEY_SUFFIX: &str = ":exchange";
