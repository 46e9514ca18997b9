//! Alerting engine.
//!
//! Evaluates stock thresholds after every ledger mutation and on scheduled
//! scans, persisting at most one open alert per (product, severity) and
//! handing newly opened alerts to a notification collaborator.
//!
//! The engine decides *that* and *when* an alert fires; delivery channel
//! and recipient resolution belong to the [`AlertSink`] implementation.
//! Sink failures are logged and never fail or roll back the ledger
//! mutation that triggered the evaluation; alerting is best-effort, stock
//! correctness is not.
//!
//! Severities are evaluated independently: a total at or below the
//! critical threshold is necessarily at or below the low threshold too, so
//! both alerts may be open at once, and each resolves on its own as the
//! quantity recovers past its own threshold.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use stk_ledger::StockRecord;
use stk_schemas::{Severity, StockAlert};
use stk_store::{AlertStore, StoreError};

// ---------------------------------------------------------------------------
// AlertSink
// ---------------------------------------------------------------------------

/// Notification collaborator. Implementations choose channel and recipient
/// (email, push, the seller owning the product); this crate only hands them
/// the alert record.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &StockAlert) -> anyhow::Result<()>;
}

/// Default sink: structured log lines only. Useful for embedded
/// deployments and as the fallback when no notifier is wired.
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn deliver(&self, alert: &StockAlert) -> anyhow::Result<()> {
        tracing::info!(
            product = %alert.product_id,
            severity = alert.severity.as_str(),
            quantity = alert.current_quantity,
            threshold = alert.threshold,
            "stock alert"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// AlertEngine
// ---------------------------------------------------------------------------

/// Threshold evaluation over an [`AlertStore`] and an [`AlertSink`].
pub struct AlertEngine {
    store: Arc<dyn AlertStore>,
    sink: Arc<dyn AlertSink>,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn AlertStore>, sink: Arc<dyn AlertSink>) -> Self {
        Self { store, sink }
    }

    /// Evaluate one record, typically right after a ledger mutation.
    /// Returns the alerts newly opened by this evaluation (de-duplicated
    /// breaches and resolutions produce no entries).
    pub async fn evaluate(
        &self,
        record: &StockRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockAlert>, StoreError> {
        self.evaluate_with_low_threshold(record, record.low_stock_threshold, now)
            .await
    }

    /// Batch evaluation for the scheduler. `low_override`, when given,
    /// replaces every record's low threshold for this scan only. This is the
    /// hook for "show me everything under N" operator queries. The
    /// critical threshold is never overridden.
    pub async fn scan(
        &self,
        records: &[StockRecord],
        low_override: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockAlert>, StoreError> {
        let mut opened = Vec::new();
        for record in records {
            let low = low_override.unwrap_or(record.low_stock_threshold);
            opened.extend(self.evaluate_with_low_threshold(record, low, now).await?);
        }
        Ok(opened)
    }

    async fn evaluate_with_low_threshold(
        &self,
        record: &StockRecord,
        low_threshold: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<StockAlert>, StoreError> {
        let mut opened = Vec::new();
        let levels = [
            (Severity::Critical, record.critical_stock_threshold),
            (Severity::Low, low_threshold),
        ];
        for (severity, threshold) in levels {
            // Threshold comparisons use the total quantity: reservations
            // never trigger alerts, only true depletion does.
            if record.total_quantity <= threshold {
                let alert = StockAlert {
                    alert_id: Uuid::new_v4(),
                    product_id: record.product_id.clone(),
                    severity,
                    current_quantity: record.total_quantity,
                    threshold,
                    created_at: now,
                    resolved_at: None,
                };
                if self.store.open_alert(alert.clone()).await? {
                    self.deliver_best_effort(&alert).await;
                    opened.push(alert);
                }
            } else {
                let resolved = self
                    .store
                    .resolve_alerts(&record.product_id, severity, now)
                    .await?;
                if resolved > 0 {
                    debug!(
                        product = %record.product_id,
                        severity = severity.as_str(),
                        resolved,
                        "stock alert resolved"
                    );
                }
            }
        }
        Ok(opened)
    }

    async fn deliver_best_effort(&self, alert: &StockAlert) {
        if let Err(err) = self.sink.deliver(alert).await {
            warn!(
                product = %alert.product_id,
                severity = alert.severity.as_str(),
                error = %err,
                "alert delivery failed; ledger state is unaffected"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
