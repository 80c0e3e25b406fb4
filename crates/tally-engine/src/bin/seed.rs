//! # Seed Data Generator
//!
//! Fills a ledger store with a demo catalog and opening stock.
//!
//! ## Usage
//! ```bash
//! # Seed the configured store for store S1 (default)
//! cargo run -p tally-engine --bin seed
//!
//! # Use an explicit config file and store id
//! cargo run -p tally-engine --bin seed -- --config ./tally.toml --store S2
//! ```
//!
//! ## Generated Stock
//! - Perishables get three lots each, expiring in 7, 21 and 60 days, so
//!   FEFO ordering is visible straight away
//! - Shelf-stable goods get plain counter stock
//! - Margins vary between 20% and 35%

use std::env;
use std::path::PathBuf;

use chrono::{Duration, Utc};
use tally_core::{LotSource, Product};
use tally_engine::telemetry::init_tracing;
use tally_engine::{open_store, with_retry, InventoryLedger, LedgerConfig, ReceiveLot};

/// (sku, name, price_cents, perishable)
const CATALOG: &[(&str, &str, i64, bool)] = &[
    ("DRY-MILK-1L", "Whole Milk 1L", 1_850, true),
    ("DRY-YOG-500", "Greek Yogurt 500g", 2_400, true),
    ("DRY-EGG-10", "Eggs (10)", 2_900, true),
    ("BAK-BREAD", "White Bread", 1_600, true),
    ("BAK-ROLL-6", "Dinner Rolls (6)", 1_200, true),
    ("BEV-WATER-600", "Mineral Water 600ml", 400, false),
    ("BEV-TEA-350", "Iced Tea 350ml", 650, false),
    ("BEV-COFFEE-200", "Ground Coffee 200g", 4_500, false),
    ("GRO-RICE-5KG", "Rice 5kg", 7_200, false),
    ("GRO-OIL-1L", "Cooking Oil 1L", 1_950, false),
    ("SNK-CHIPS", "Potato Chips", 950, false),
    ("HOM-SOAP", "Bar Soap", 550, false),
];

/// Days until expiry of each perishable lot.
const LOT_EXPIRIES: &[i64] = &[7, 21, 60];

const MARGINS_BPS: &[u32] = &[2_000, 2_500, 3_000, 3_500];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut config_path: Option<PathBuf> = None;
    let mut store_id = String::from("S1");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    config_path = Some(PathBuf::from(&args[i + 1]));
                    i += 1;
                }
            }
            "--store" | "-s" => {
                if i + 1 < args.len() {
                    store_id = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Tally Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <PATH>  Config file (default: platform config dir)");
                println!("  -s, --store <ID>     Store to stock (default: S1)");
                println!("  -h, --help           Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    init_tracing();
    let config = LedgerConfig::load(config_path)?;

    println!("🌱 Tally Seed Data Generator");
    println!("============================");
    println!("Backend: {}", config.storage.backend);
    if let Some(path) = config.storage.resolved_database_path() {
        println!("Database: {}", path.display());
    }
    println!("Store: {}", store_id);
    println!();

    let store = open_store(&config).await?;
    let inventory = InventoryLedger::new(store.clone());
    let policy = config.retry.policy();
    println!("✓ Store opened");

    let skus: Vec<String> = CATALOG.iter().map(|(sku, ..)| sku.to_string()).collect();
    let existing = inventory.get_stock(&store_id, &skus).await?;
    if existing.values().any(|qty| *qty > 0) {
        println!("⚠ Store {} already has stock", store_id);
        println!("  Skipping seed to avoid double receipts.");
        return Ok(());
    }

    println!();
    println!("Upserting catalog...");
    for (idx, (sku, name, price_cents, _)) in CATALOG.iter().enumerate() {
        store
            .upsert_product(
                Product {
                    sku: sku.to_string(),
                    name: name.to_string(),
                    price_cents: *price_cents,
                    margin_bps: MARGINS_BPS[idx % MARGINS_BPS.len()],
                    is_active: true,
                },
                Utc::now(),
            )
            .await?;
    }
    println!("✓ {} products", CATALOG.len());

    println!();
    println!("Receiving stock...");
    let today = inventory.today();
    let mut lots = 0;
    for (idx, (sku, _, price_cents, perishable)) in CATALOG.iter().enumerate() {
        let margin = MARGINS_BPS[idx % MARGINS_BPS.len()] as i64;
        let unit_cost = (price_cents - price_cents * margin / 10_000).max(1);

        if *perishable {
            for (n, days) in LOT_EXPIRIES.iter().enumerate() {
                let receipt = ReceiveLot {
                    source: LotSource::PurchaseOrder,
                    source_ref: Some(format!("PO-SEED-{:03}", idx * 10 + n)),
                    ..ReceiveLot::manual(&store_id, *sku, 12 + (n as i64) * 6, unit_cost)
                }
                .expiring(today + Duration::days(*days));

                let lot = with_retry(&policy, || inventory.create_lot(receipt.clone())).await?;
                println!(
                    "  {} {} × {} (expires {})",
                    lot.sku,
                    lot.lot_code,
                    lot.qty_received,
                    today + Duration::days(*days)
                );
                lots += 1;
            }
        } else {
            let qty = 40 + (idx as i64 % 5) * 10;
            with_retry(&policy, || inventory.set_stock(&store_id, sku, qty)).await?;
            println!("  {} counter = {}", sku, qty);
        }
    }

    println!();
    println!("✓ Seed complete! ({} lots received)", lots);

    Ok(())
}
