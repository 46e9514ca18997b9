//! Test support for the stock-control workspace.
//!
//! Deterministic wiring of the full subsystem over the embedded store: a
//! fixed clock base, a collecting notification sink, and a [`Harness`]
//! bundling the inventory service and reconciliation engine the way
//! production wires them, minus the database.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use stk_alerts::{AlertEngine, AlertSink};
use stk_audit::MemoryAudit;
use stk_inventory::InventoryService;
use stk_ledger::StockRecord;
use stk_reconcile::ReconcileEngine;
use stk_schemas::{ProductId, StockAlert};
use stk_store::{MemoryStore, StockStore};

/// Fixed clock base; scenarios pass `at(secs)` instead of wall time.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `t0` + `secs`.
pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

// ---------------------------------------------------------------------------
// CollectingSink
// ---------------------------------------------------------------------------

/// Notification sink that records every delivered alert.
#[derive(Default)]
pub struct CollectingSink {
    delivered: Mutex<Vec<StockAlert>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<StockAlert> {
        self.delivered
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn deliver(&self, alert: &StockAlert) -> anyhow::Result<()> {
        self.delivered
            .lock()
            .map_err(|_| anyhow::anyhow!("sink mutex poisoned"))?
            .push(alert.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// Fully wired subsystem over one shared [`MemoryStore`].
pub struct Harness {
    pub service: InventoryService,
    pub reconcile: ReconcileEngine,
    pub store: Arc<MemoryStore>,
    pub sink: Arc<CollectingSink>,
    pub audit: Arc<MemoryAudit>,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(CollectingSink::new());
        let audit = Arc::new(MemoryAudit::new());

        let service = InventoryService::new(
            store.clone(),
            store.clone(),
            AlertEngine::new(store.clone(), sink.clone()),
            audit.clone(),
        );
        let reconcile = ReconcileEngine::new(
            store.clone(),
            store.clone(),
            AlertEngine::new(store.clone(), sink.clone()),
            audit.clone(),
        );

        Self {
            service,
            reconcile,
            store,
            sink,
            audit,
        }
    }

    /// Seed one product at `t0`.
    pub async fn seed(&self, product: &str, total: i64, low: i64, critical: i64) -> ProductId {
        let product_id = ProductId::new(product);
        self.store
            .insert_stock(
                StockRecord::new(product_id.clone(), total, low, critical, t0())
                    .expect("valid seed record"),
            )
            .await
            .expect("seed stock");
        product_id
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
