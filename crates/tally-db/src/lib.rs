//! # tally-db: Ledger Storage for Tally
//!
//! The storage port the engines run against, plus its in-memory and SQLite
//! backends.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Tally Data Flow                                  │
//! │                                                                         │
//! │  CheckoutEngine / ReversalEngine / InventoryLedger (tally-engine)      │
//! │       │                                                                 │
//! │       ▼  Arc<dyn LedgerStore>                                           │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     tally-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  LedgerStore  │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │  (store/)     │    │  (embedded)  │  │   │
//! │  │   │               │    │               │    │              │  │   │
//! │  │   │ SqlitePool    │◄───│ SqliteStore   │    │ 001_ledger_  │  │   │
//! │  │   │ WAL, busy     │    │ MemoryStore   │    │ schema.sql   │  │   │
//! │  │   │ timeout       │    │               │    │              │  │   │
//! │  │   └───────────────┘    └───────────────┘    └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`store`] - The `LedgerStore` port and both backends
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tally_db::{Database, DbConfig, LedgerStore};
//!
//! let db = Database::new(DbConfig::new("path/to/tally.db")).await?;
//! let ledger = db.ledger();
//!
//! let stock = ledger.get_stock_map("store-1", &["MILK-1L".into()]).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};
pub use store::{
    CheckoutOutcome, ItemReturnOutcome, LedgerStore, MemoryStore, SqliteStore, VoidOutcome,
};
