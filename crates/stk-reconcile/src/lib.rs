//! Reconciliation engine.
//!
//! Aligns the stock ledger with physically counted quantities. The physical
//! count is authoritative: a non-zero discrepancy sets the ledger total to
//! the counted value, never touching `reserved_quantity`. Every sync,
//! adjusting or not, produces an immutable [`SyncRecord`] in the store and
//! a line in the audit log, so corrections are reviewable and reversible
//! (the record carries both the before and after quantities).
//!
//! Batch syncs process items independently: one bad count never aborts the
//! rest, and the caller receives a per-item report.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use stk_alerts::AlertEngine;
use stk_audit::AuditLog;
use stk_schemas::{InventoryError, ProductId, SyncRecord};
use stk_store::{StockStore, SyncStore};

// ---------------------------------------------------------------------------
// Outcome types
// ---------------------------------------------------------------------------

/// Result of one sync call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOutcome {
    pub sync_id: Uuid,
    /// `physical_count - system_quantity` at the time of the sync.
    pub discrepancy: i64,
    /// Whether a corrective adjustment was applied to the ledger.
    pub adjusted: bool,
    /// The adjustment left `reserved > total`; operator follow-up needed.
    pub over_reserved: bool,
}

/// One item of a batch sync.
#[derive(Clone, Debug)]
pub struct ItemOutcome {
    pub product_id: ProductId,
    pub result: Result<SyncOutcome, InventoryError>,
}

/// Aggregate batch report, referenced by `report_id` from operator tooling.
#[derive(Clone, Debug)]
pub struct SyncReport {
    pub report_id: Uuid,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
    pub outcomes: Vec<ItemOutcome>,
    pub adjusted_count: usize,
    pub failed_count: usize,
    /// Sum of discrepancies across successful items.
    pub total_discrepancy: i64,
}

// ---------------------------------------------------------------------------
// ReconcileEngine
// ---------------------------------------------------------------------------

/// Physical-count reconciliation over injected store, alerting, and audit
/// components.
pub struct ReconcileEngine {
    stock: Arc<dyn StockStore>,
    syncs: Arc<dyn SyncStore>,
    alerts: AlertEngine,
    audit: Arc<dyn AuditLog>,
}

impl ReconcileEngine {
    pub fn new(
        stock: Arc<dyn StockStore>,
        syncs: Arc<dyn SyncStore>,
        alerts: AlertEngine,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            stock,
            syncs,
            alerts,
            audit,
        }
    }

    /// Reconcile one product against a physical count.
    ///
    /// Zero discrepancy records the sync and changes nothing. Non-zero
    /// discrepancy sets `total = physical_count` atomically, leaves
    /// reservations untouched (flagging `over_reserved` when they now
    /// exceed the total), and re-evaluates alert thresholds against the
    /// corrected quantity.
    pub async fn sync(
        &self,
        product_id: &ProductId,
        physical_count: i64,
        performed_by: &str,
        notes: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, InventoryError> {
        if physical_count < 0 {
            return Err(InventoryError::InvalidQuantity {
                quantity: physical_count,
            });
        }
        if performed_by.trim().is_empty() {
            return Err(InventoryError::InvalidArgument {
                detail: "performed_by must not be blank".to_string(),
            });
        }

        let before = self
            .stock
            .load_stock(product_id)
            .await
            .map_err(InventoryError::from)?;
        let system_quantity = before.total_quantity;
        let discrepancy = physical_count - system_quantity;

        let (adjusted, over_reserved) = if discrepancy == 0 {
            (false, before.reserved_quantity > before.total_quantity)
        } else {
            let (after, over_reserved) = self
                .stock
                .set_total(product_id, physical_count, now)
                .await
                .map_err(InventoryError::from)?;
            if over_reserved {
                warn!(
                    product = %product_id,
                    reserved = after.reserved_quantity,
                    total = after.total_quantity,
                    "sync left product over-reserved; operator follow-up required"
                );
            }
            if let Err(err) = self.alerts.evaluate(&after, now).await {
                warn!(product = %product_id, error = %err, "alert evaluation failed after sync");
            }
            (true, over_reserved)
        };

        let record = SyncRecord {
            sync_id: Uuid::new_v4(),
            product_id: product_id.clone(),
            system_quantity,
            physical_count,
            discrepancy,
            adjusted,
            over_reserved,
            performed_by: performed_by.to_string(),
            notes: notes.to_string(),
            created_at: now,
        };
        self.syncs
            .record_sync(record.clone())
            .await
            .map_err(InventoryError::from)?;

        if let Err(err) = self.audit.append(
            "sync",
            json!({
                "sync_id": record.sync_id,
                "product_id": product_id.as_str(),
                "system_quantity": system_quantity,
                "physical_count": physical_count,
                "discrepancy": discrepancy,
                "adjusted": adjusted,
                "over_reserved": over_reserved,
                "performed_by": performed_by,
            }),
        ) {
            warn!(product = %product_id, error = %err, "audit append failed; sync record stands");
        }

        info!(
            product = %product_id,
            system = system_quantity,
            physical = physical_count,
            discrepancy,
            adjusted,
            "inventory sync"
        );
        Ok(SyncOutcome {
            sync_id: record.sync_id,
            discrepancy,
            adjusted,
            over_reserved,
        })
    }

    /// Reconcile a list of `(product, physical_count)` pairs independently,
    /// collecting per-item outcomes without aborting on individual errors.
    pub async fn sync_batch(
        &self,
        counts: Vec<(ProductId, i64)>,
        performed_by: &str,
        notes: &str,
        now: DateTime<Utc>,
    ) -> Result<SyncReport, InventoryError> {
        if performed_by.trim().is_empty() {
            return Err(InventoryError::InvalidArgument {
                detail: "performed_by must not be blank".to_string(),
            });
        }

        let mut report = SyncReport {
            report_id: Uuid::new_v4(),
            performed_by: performed_by.to_string(),
            created_at: now,
            outcomes: Vec::with_capacity(counts.len()),
            adjusted_count: 0,
            failed_count: 0,
            total_discrepancy: 0,
        };

        for (product_id, physical_count) in counts {
            let result = self
                .sync(&product_id, physical_count, performed_by, notes, now)
                .await;
            match &result {
                Ok(outcome) => {
                    if outcome.adjusted {
                        report.adjusted_count += 1;
                    }
                    report.total_discrepancy += outcome.discrepancy;
                }
                Err(err) => {
                    report.failed_count += 1;
                    warn!(product = %product_id, error = %err, "batch sync item failed");
                }
            }
            report.outcomes.push(ItemOutcome { product_id, result });
        }

        info!(
            report = %report.report_id,
            items = report.outcomes.len(),
            adjusted = report.adjusted_count,
            failed = report.failed_count,
            "batch inventory sync"
        );
        Ok(report)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stk_alerts::LogSink;
    use stk_audit::MemoryAudit;
    use stk_ledger::StockRecord;
    use stk_store::{AlertStore, MemoryStore, ReservationStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    async fn engine_with(
        products: &[(&str, i64, i64, i64)],
    ) -> (ReconcileEngine, Arc<MemoryStore>, Arc<MemoryAudit>) {
        let store = Arc::new(MemoryStore::new());
        for (id, total, low, critical) in products {
            store
                .insert_stock(
                    StockRecord::new(ProductId::new(*id), *total, *low, *critical, t0()).unwrap(),
                )
                .await
                .unwrap();
        }
        let audit = Arc::new(MemoryAudit::new());
        let alerts = AlertEngine::new(store.clone(), Arc::new(LogSink));
        let engine = ReconcileEngine::new(store.clone(), store.clone(), alerts, audit.clone());
        (engine, store, audit)
    }

    #[tokio::test]
    async fn matching_count_records_without_adjusting() {
        let (engine, store, _) = engine_with(&[("p-1", 50, 0, 0)]).await;
        let outcome = engine
            .sync(&ProductId::new("p-1"), 50, "ops@warehouse", "", t0())
            .await
            .unwrap();
        assert_eq!(outcome.discrepancy, 0);
        assert!(!outcome.adjusted);

        let record = store.load_stock(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(record.total_quantity, 50);
        assert_eq!(record.version, 1, "no ledger write for a clean sync");

        let history = store.sync_history(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].adjusted);
    }

    #[tokio::test]
    async fn shortfall_sets_authoritative_count() {
        let (engine, store, audit) = engine_with(&[("p-1", 50, 0, 0)]).await;
        let outcome = engine
            .sync(&ProductId::new("p-1"), 47, "ops@warehouse", "cycle count", t0())
            .await
            .unwrap();
        assert_eq!(outcome.discrepancy, -3);
        assert!(outcome.adjusted);
        assert!(!outcome.over_reserved);

        let record = store.load_stock(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(record.total_quantity, 47);

        let history = store.sync_history(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(history[0].system_quantity, 50);
        assert_eq!(history[0].physical_count, 47);
        assert!(history[0].adjusted);

        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "sync");
    }

    #[tokio::test]
    async fn adjustment_never_truncates_reservations() {
        let (engine, store, _) = engine_with(&[("p-1", 10, 0, 0)]).await;
        store
            .create_reservation(stk_reservation::Reservation::new(
                "r-1",
                ProductId::new("p-1"),
                6,
                t0(),
                chrono::Duration::seconds(900),
            ))
            .await
            .unwrap();

        let outcome = engine
            .sync(&ProductId::new("p-1"), 4, "ops@warehouse", "", t0())
            .await
            .unwrap();
        assert!(outcome.adjusted);
        assert!(outcome.over_reserved);

        let record = store.load_stock(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(record.total_quantity, 4);
        assert_eq!(record.reserved_quantity, 6);
    }

    #[tokio::test]
    async fn adjustment_reevaluates_thresholds() {
        let (engine, store, _) = engine_with(&[("p-1", 50, 5, 2)]).await;
        engine
            .sync(&ProductId::new("p-1"), 3, "ops@warehouse", "", t0())
            .await
            .unwrap();
        let open = store.open_alerts(None).await.unwrap();
        assert_eq!(open.len(), 1, "shrinking below low threshold fires an alert");
    }

    #[tokio::test]
    async fn sync_validates_inputs() {
        let (engine, _, _) = engine_with(&[("p-1", 10, 0, 0)]).await;
        assert!(matches!(
            engine
                .sync(&ProductId::new("p-1"), -1, "ops", "", t0())
                .await
                .unwrap_err(),
            InventoryError::InvalidQuantity { .. }
        ));
        assert!(matches!(
            engine
                .sync(&ProductId::new("p-1"), 5, "  ", "", t0())
                .await
                .unwrap_err(),
            InventoryError::InvalidArgument { .. }
        ));
        assert!(matches!(
            engine
                .sync(&ProductId::new("ghost"), 5, "ops", "", t0())
                .await
                .unwrap_err(),
            InventoryError::NotFound { .. }
        ));
    }

    #[tokio::test]
    async fn batch_collects_per_item_outcomes() {
        let (engine, store, _) = engine_with(&[("p-1", 10, 0, 0), ("p-2", 20, 0, 0)]).await;
        let report = engine
            .sync_batch(
                vec![
                    (ProductId::new("p-1"), 8),
                    (ProductId::new("ghost"), 5),
                    (ProductId::new("p-2"), 20),
                ],
                "ops@warehouse",
                "quarterly count",
                t0(),
            )
            .await
            .unwrap();

        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(report.adjusted_count, 1);
        assert_eq!(report.failed_count, 1);
        assert_eq!(report.total_discrepancy, -2);
        assert!(report.outcomes[0].result.is_ok());
        assert!(report.outcomes[1].result.is_err());
        assert!(report.outcomes[2].result.is_ok());

        // The failing middle item did not abort the rest.
        let record = store.load_stock(&ProductId::new("p-1")).await.unwrap();
        assert_eq!(record.total_quantity, 8);
    }
}
