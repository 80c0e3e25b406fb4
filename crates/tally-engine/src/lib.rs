//! # tally-engine: Checkout and Inventory Ledger Services
//!
//! The services a POS backend calls to sell, reverse and receive stock.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Ledger Services                                  │
//! │                                                                         │
//! │  ┌──────────────────┐  exchange   ┌──────────────────┐                 │
//! │  │  ReversalEngine  │────────────►│  CheckoutEngine  │                 │
//! │  │  void / refund / │  (client,   │  cart → priced   │                 │
//! │  │  return-exchange │  override)  │  transaction     │                 │
//! │  └────────┬─────────┘             └────────┬─────────┘                 │
//! │           │                                │                            │
//! │           │      ┌──────────────────┐      │                            │
//! │           │      │ InventoryLedger  │      │                            │
//! │           │      │ lots + counters  │      │                            │
//! │           │      └────────┬─────────┘      │                            │
//! │           ▼               ▼                ▼                            │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │              Arc<dyn LedgerStore>  (tally-db)                   │   │
//! │  │        MemoryStore (one lock)  |  SqliteStore (BEGIN IMMEDIATE) │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust,ignore
//! use std::sync::Arc;
//! use tally_engine::{open_store, CheckoutEngine, LedgerConfig, ReversalEngine};
//!
//! let config = LedgerConfig::load(None)?;
//! let store = open_store(&config).await?;
//!
//! let checkout = Arc::new(CheckoutEngine::new(store.clone()).with_limits(config.checkout.limits()));
//! let reversal = ReversalEngine::new(store, checkout.clone());
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod checkout;
pub mod config;
pub mod error;
pub mod inventory;
pub mod retry;
pub mod reversal;
pub mod telemetry;

// =============================================================================
// Re-exports
// =============================================================================

pub use checkout::{
    AlwaysOpen, CheckoutEngine, CheckoutLimits, CheckoutRequest, CheckoutResponse, ShiftGate,
};
pub use config::{LedgerConfig, StorageBackend};
pub use error::{ConfigError, ConfigResult};
pub use inventory::{InventoryLedger, ReceiveLot};
pub use retry::{with_retry, RetryPolicy};
pub use reversal::{
    ExchangeRequest, RefundReceipt, RefundRequest, RefundSummary, ReturnAction, ReturnReceipt,
    ReturnRequest, ReversalEngine,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::{LedgerError, LedgerResult};
use tally_db::{Database, DbResult, LedgerStore, MemoryStore};
use tracing::{error, info};

// =============================================================================
// Shared Plumbing
// =============================================================================

/// Source of "now" for timestamps and expiry checks.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Wall clock.
pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

/// Collapses a storage result into the ledger taxonomy, logging I/O failures.
pub(crate) fn ledger<T>(result: DbResult<T>) -> LedgerResult<T> {
    result.map_err(|err| {
        let err = LedgerError::from(err);
        if let LedgerError::Storage { message, transient } = &err {
            error!(%message, transient, "Storage failure");
        }
        err
    })
}

/// Opens the backend selected by `config.storage.backend`.
pub async fn open_store(config: &LedgerConfig) -> ConfigResult<Arc<dyn LedgerStore>> {
    match config.storage.backend {
        StorageBackend::Memory => {
            info!("Using in-memory ledger store");
            Ok(Arc::new(MemoryStore::new()))
        }
        StorageBackend::Sqlite => {
            let db = Database::new(config.storage.db_config()?).await?;
            info!("Using SQLite ledger store");
            Ok(Arc::new(db.ledger()))
        }
    }
}
