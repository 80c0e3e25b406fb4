//! Shared harness for the engine integration tests.
//!
//! Scenarios run per backend: the in-memory store, an isolated in-memory
//! SQLite database, and where writers contend, a SQLite file behind a
//! multi-connection pool.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use tally_core::pricing::CartLine;
use tally_core::{LedgerResult, PaymentMethod, Product, TaxRate};
use tally_db::{Database, DbConfig, LedgerStore, MemoryStore};
use tempfile::TempDir;
use tally_engine::{
    CheckoutEngine, CheckoutRequest, CheckoutResponse, Clock, InventoryLedger, ReversalEngine,
};

pub const STORE: &str = "S1";
pub const TERMINAL: &str = "T1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
    SqliteFile,
}

impl Backend {
    /// The store, plus the directory holding its file when there is one.
    pub async fn open(self) -> (Arc<dyn LedgerStore>, Option<TempDir>) {
        match self {
            Backend::Memory => (Arc::new(MemoryStore::new()), None),
            Backend::Sqlite => {
                let db = Database::new(DbConfig::in_memory()).await.unwrap();
                (Arc::new(db.ledger()), None)
            }
            Backend::SqliteFile => {
                let (store, dir) = sqlite_file(5).await;
                (store, Some(dir))
            }
        }
    }
}

/// A fresh SQLite file in a temporary directory, removed with the `TempDir`.
pub async fn sqlite_file(max_connections: u32) -> (Arc<dyn LedgerStore>, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = DbConfig::new(dir.path().join("tally.db")).max_connections(max_connections);
    let db = Database::new(config).await.unwrap();
    (Arc::new(db.ledger()), dir)
}

/// 2024-01-05 10:00 UTC.
pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 5, 10, 0, 0).unwrap()
}

pub fn fixed_clock() -> Clock {
    Arc::new(now)
}

/// The three services wired over one store.
pub struct Ledger {
    pub store: Arc<dyn LedgerStore>,
    pub checkout: Arc<CheckoutEngine>,
    pub reversal: ReversalEngine,
    pub inventory: InventoryLedger,
    _dir: Option<TempDir>,
}

impl Ledger {
    pub async fn open(backend: Backend) -> Self {
        let (store, dir) = backend.open().await;
        Ledger {
            _dir: dir,
            ..Self::over(store)
        }
    }

    /// Over a SQLite file whose pool holds `max_connections`.
    pub async fn on_file(max_connections: u32) -> Self {
        let (store, dir) = sqlite_file(max_connections).await;
        Ledger {
            _dir: Some(dir),
            ..Self::over(store)
        }
    }

    pub fn over(store: Arc<dyn LedgerStore>) -> Self {
        let checkout = Arc::new(CheckoutEngine::new(store.clone()).with_clock(fixed_clock()));
        let reversal =
            ReversalEngine::new(store.clone(), checkout.clone()).with_clock(fixed_clock());
        let inventory = InventoryLedger::new(store.clone()).with_clock(fixed_clock());
        Ledger {
            store,
            checkout,
            reversal,
            inventory,
            _dir: None,
        }
    }

    /// Active product with a 20% margin.
    pub async fn product(&self, sku: &str, price_cents: i64) {
        self.store
            .upsert_product(
                Product {
                    sku: sku.to_string(),
                    name: format!("{sku} item"),
                    price_cents,
                    margin_bps: 2_000,
                    is_active: true,
                },
                now(),
            )
            .await
            .unwrap();
    }

    pub async fn stock(&self, sku: &str, quantity: i64) {
        self.inventory.set_stock(STORE, sku, quantity).await.unwrap();
    }

    pub async fn on_hand(&self, sku: &str) -> i64 {
        self.inventory.stock_level(STORE, sku).await.unwrap().quantity
    }

    pub async fn sell(&self, key: &str, cart: Vec<CartLine>) -> LedgerResult<CheckoutResponse> {
        self.checkout.checkout(cash_sale(key, cart, 1_000_000)).await
    }
}

pub fn cash_sale(key: &str, cart: Vec<CartLine>, cash_received_cents: i64) -> CheckoutRequest {
    CheckoutRequest {
        store_id: STORE.to_string(),
        terminal_id: TERMINAL.to_string(),
        idempotency_key: key.to_string(),
        payment_method: PaymentMethod::Cash,
        payment_splits: vec![],
        payment_reference: None,
        cash_received_cents,
        discount_cents: 0,
        tax_rate: TaxRate::zero(),
        manual_override: false,
        cart,
    }
}
