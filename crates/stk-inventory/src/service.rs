use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use stk_alerts::AlertEngine;
use stk_audit::AuditLog;
use stk_ledger::{availability, Availability, LedgerError, StockRecord, DEFAULT_RESERVATION_TTL_SECS};
use stk_reservation::Reservation;
use stk_schemas::{InventoryError, ProductId};
use stk_store::{Disposition, ReservationStore, Settlement, StockStore, StoreError};

use crate::types::{CommitLine, CommitReport, LineOutcome, ReservationTicket, SweepReport};

/// How many times a *transient* backend conflict is retried with fresh
/// state before surfacing `Conflict`. Business outcomes (insufficient
/// stock, duplicate id, terminal reservation) are never retried.
pub const MAX_TRANSIENT_RETRIES: u32 = 3;

/// Reservation manager + fulfillment committer over injected components.
///
/// Construct one per store wiring and share it (`&self` methods only). No
/// singletons: tests wire a `MemoryStore`, production wires PostgreSQL.
pub struct InventoryService {
    stock: Arc<dyn StockStore>,
    reservations: Arc<dyn ReservationStore>,
    alerts: AlertEngine,
    audit: Arc<dyn AuditLog>,
    default_ttl: Duration,
}

impl InventoryService {
    pub fn new(
        stock: Arc<dyn StockStore>,
        reservations: Arc<dyn ReservationStore>,
        alerts: AlertEngine,
        audit: Arc<dyn AuditLog>,
    ) -> Self {
        Self {
            stock,
            reservations,
            alerts,
            audit,
            default_ttl: Duration::seconds(DEFAULT_RESERVATION_TTL_SECS),
        }
    }

    /// Override the default reservation TTL (callers may still override per
    /// reservation).
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    // -----------------------------------------------------------------------
    // Availability
    // -----------------------------------------------------------------------

    /// Answer "can `requested_quantity` units be fulfilled now" from one
    /// consistent snapshot. No side effects.
    pub async fn check_availability(
        &self,
        product_id: &ProductId,
        requested_quantity: i64,
    ) -> Result<Availability, InventoryError> {
        let record = self
            .stock
            .load_stock(product_id)
            .await
            .map_err(InventoryError::from)?;
        availability(&record, requested_quantity).map_err(map_ledger)
    }

    // -----------------------------------------------------------------------
    // Reservation lifecycle
    // -----------------------------------------------------------------------

    /// Hold `quantity` units pending checkout. The hold expires `ttl` after
    /// `now` (default 900 s) unless committed or released first.
    pub async fn reserve(
        &self,
        product_id: &ProductId,
        quantity: i64,
        reservation_id: Option<String>,
        ttl: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<ReservationTicket, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity { quantity });
        }
        let ttl = match ttl {
            Some(t) if t <= Duration::zero() => {
                return Err(InventoryError::InvalidArgument {
                    detail: "reservation ttl must be positive".to_string(),
                })
            }
            Some(t) => t,
            None => self.default_ttl,
        };
        let reservation_id = match reservation_id {
            Some(id) if id.trim().is_empty() => {
                return Err(InventoryError::InvalidArgument {
                    detail: "reservation id must not be blank".to_string(),
                })
            }
            Some(id) => id,
            None => Uuid::new_v4().to_string(),
        };

        let reservation =
            Reservation::new(reservation_id, product_id.clone(), quantity, now, ttl);
        let (reservation, stock) = self
            .retry_transient(|| self.reservations.create_reservation(reservation.clone()))
            .await?;

        info!(
            product = %product_id,
            reservation = %reservation.reservation_id,
            quantity,
            expires_at = %reservation.expires_at,
            "reserved stock"
        );
        self.record_audit(
            "reserve",
            json!({
                "product_id": product_id.as_str(),
                "reservation_id": reservation.reservation_id,
                "quantity": quantity,
                "expires_at": reservation.expires_at.to_rfc3339(),
            }),
        );
        self.evaluate_alerts(&stock, now).await;

        Ok(ReservationTicket {
            reservation_id: reservation.reservation_id,
            product_id: product_id.clone(),
            quantity,
            expires_at: reservation.expires_at,
        })
    }

    /// Release an active reservation, returning its units to the available
    /// pool. Idempotent: releasing an already-settled reservation is a
    /// successful no-op returning 0.
    pub async fn release(
        &self,
        reservation_id: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, InventoryError> {
        let settlement = self
            .retry_transient(|| {
                self.reservations
                    .settle_reservation(reservation_id, Disposition::Release, now)
            })
            .await?;

        match settlement {
            Settlement::Settled { reservation, stock } => {
                info!(
                    reservation = reservation_id,
                    quantity = reservation.quantity,
                    "released reservation"
                );
                self.record_audit(
                    "release",
                    json!({
                        "product_id": reservation.product_id.as_str(),
                        "reservation_id": reservation_id,
                        "quantity": reservation.quantity,
                    }),
                );
                self.evaluate_alerts(&stock, now).await;
                Ok(reservation.quantity)
            }
            Settlement::AlreadyTerminal { state } => {
                debug!(
                    reservation = reservation_id,
                    state = state.as_str(),
                    "release no-op: reservation already settled"
                );
                Ok(0)
            }
        }
    }

    /// Expire every ACTIVE reservation past its deadline, reclaiming stock.
    ///
    /// Stateless over (`now`, store) and safe to invoke redundantly or
    /// concurrently: the store's one-shot terminal transition guarantees
    /// each reservation is reclaimed exactly once, and losers of a race
    /// with `release`/`commit` simply skip the row.
    pub async fn expire_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, InventoryError> {
        let candidates = self
            .reservations
            .list_expired(now)
            .await
            .map_err(InventoryError::from)?;

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };
        for candidate in candidates {
            let id = candidate.reservation_id.as_str();
            let settlement = self
                .retry_transient(|| {
                    self.reservations
                        .settle_reservation(id, Disposition::Expire, now)
                })
                .await;
            match settlement {
                Ok(Settlement::Settled { reservation, stock }) => {
                    report.expired += 1;
                    report.reclaimed_quantity += reservation.quantity;
                    self.record_audit(
                        "expire",
                        json!({
                            "product_id": reservation.product_id.as_str(),
                            "reservation_id": id,
                            "quantity": reservation.quantity,
                            "expired_at": reservation.expires_at.to_rfc3339(),
                        }),
                    );
                    self.evaluate_alerts(&stock, now).await;
                }
                Ok(Settlement::AlreadyTerminal { state }) => {
                    debug!(
                        reservation = id,
                        state = state.as_str(),
                        "sweep lost settlement race; skipping"
                    );
                }
                Err(err) => {
                    // One bad row must not abort the sweep; the next pass
                    // retries anything still ACTIVE.
                    warn!(reservation = id, error = %err, "sweep failed to expire reservation");
                }
            }
        }

        if report.expired > 0 {
            info!(
                examined = report.examined,
                expired = report.expired,
                reclaimed = report.reclaimed_quantity,
                "expiry sweep reclaimed stock"
            );
        }
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Fulfillment commits
    // -----------------------------------------------------------------------

    /// Convert an ACTIVE reservation into a permanent stock decrement.
    /// Returns the new total quantity.
    pub async fn commit_reservation(
        &self,
        reservation_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, InventoryError> {
        validate_reason(reason)?;
        let settlement = self
            .retry_transient(|| {
                self.reservations
                    .settle_reservation(reservation_id, Disposition::Commit, now)
            })
            .await?;

        match settlement {
            Settlement::Settled { reservation, stock } => {
                info!(
                    reservation = reservation_id,
                    product = %reservation.product_id,
                    quantity = reservation.quantity,
                    new_total = stock.total_quantity,
                    reason,
                    "committed reservation"
                );
                self.record_audit(
                    "commit",
                    json!({
                        "product_id": reservation.product_id.as_str(),
                        "reservation_id": reservation_id,
                        "quantity": reservation.quantity,
                        "new_total": stock.total_quantity,
                        "reason": reason,
                    }),
                );
                self.evaluate_alerts(&stock, now).await;
                Ok(stock.total_quantity)
            }
            Settlement::AlreadyTerminal { state } => Err(InventoryError::InvalidState {
                reservation_id: reservation_id.to_string(),
                state: state.as_str().to_string(),
            }),
        }
    }

    /// Permanent decrement with no prior reservation (legacy/offline
    /// orders). Never dips into stock promised to active reservations.
    pub async fn commit_direct(
        &self,
        product_id: &ProductId,
        quantity: i64,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, InventoryError> {
        if quantity <= 0 {
            return Err(InventoryError::InvalidQuantity { quantity });
        }
        validate_reason(reason)?;

        let stock = self
            .retry_transient(|| self.stock.commit_stock(product_id, quantity, now))
            .await?;

        info!(
            product = %product_id,
            quantity,
            new_total = stock.total_quantity,
            reason,
            "committed direct order"
        );
        self.record_audit(
            "commit",
            json!({
                "product_id": product_id.as_str(),
                "quantity": quantity,
                "new_total": stock.total_quantity,
                "reason": reason,
            }),
        );
        self.evaluate_alerts(&stock, now).await;
        Ok(stock.total_quantity)
    }

    /// Commit each line of a multi-line order independently. A failing line
    /// never rolls back lines already committed; the caller receives the
    /// full per-line report and decides whether to partially fulfill.
    pub async fn commit_lines(
        &self,
        lines: Vec<CommitLine>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CommitReport {
        let mut report = CommitReport::default();
        for line in lines {
            let result = match &line {
                CommitLine::Reservation { reservation_id } => {
                    self.commit_reservation(reservation_id, reason, now).await
                }
                CommitLine::Direct {
                    product_id,
                    quantity,
                } => self.commit_direct(product_id, *quantity, reason, now).await,
            };
            match &result {
                Ok(_) => report.committed += 1,
                Err(err) => {
                    report.failed += 1;
                    debug!(reason, error = %err, "order line failed to commit");
                }
            }
            report.outcomes.push(LineOutcome { line, result });
        }
        report
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    async fn retry_transient<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
    ) -> Result<T, InventoryError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempts = 0;
        loop {
            match op().await {
                Err(err) if err.is_transient() => {
                    attempts += 1;
                    if attempts >= MAX_TRANSIENT_RETRIES {
                        return Err(InventoryError::Conflict { retries: attempts });
                    }
                    debug!(attempts, error = %err, "transient store conflict; retrying");
                }
                other => return other.map_err(InventoryError::from),
            }
        }
    }

    /// Audit is mandatory to attempt, best-effort to land: a failed append
    /// never undoes the ledger mutation it describes.
    fn record_audit(&self, event_type: &str, payload: serde_json::Value) {
        if let Err(err) = self.audit.append(event_type, payload) {
            warn!(event_type, error = %err, "audit append failed; ledger state is unaffected");
        }
    }

    async fn evaluate_alerts(&self, record: &StockRecord, now: DateTime<Utc>) {
        if let Err(err) = self.alerts.evaluate(record, now).await {
            warn!(product = %record.product_id, error = %err, "alert evaluation failed");
        }
    }
}

fn validate_reason(reason: &str) -> Result<(), InventoryError> {
    if reason.trim().is_empty() {
        return Err(InventoryError::InvalidArgument {
            detail: "commit reason must not be blank".to_string(),
        });
    }
    Ok(())
}

fn map_ledger(err: LedgerError) -> InventoryError {
    match err {
        LedgerError::NonPositiveQuantity { quantity } => {
            InventoryError::InvalidQuantity { quantity }
        }
        LedgerError::Insufficient {
            requested,
            available,
        } => InventoryError::InsufficientStock {
            requested,
            available,
        },
        other => InventoryError::Store {
            detail: other.to_string(),
        },
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
    use stk_store::MemoryStore;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn p() -> ProductId {
        ProductId::new("p-1")
    }

    async fn service(total: i64, low: i64, critical: i64) -> (InventoryService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_stock(StockRecord::new(p(), total, low, critical, t0()).unwrap())
            .await
            .unwrap();
        let alerts = AlertEngine::new(store.clone(), Arc::new(LogSink));
        let svc = InventoryService::new(
            store.clone(),
            store.clone(),
            alerts,
            Arc::new(MemoryAudit::new()),
        );
        (svc, store)
    }

    #[tokio::test]
    async fn check_availability_validates_inputs() {
        let (svc, _) = service(10, 0, 0).await;
        let a = svc.check_availability(&p(), 4).await.unwrap();
        assert!(a.can_fulfill);
        assert_eq!(a.available, 10);

        let err = svc.check_availability(&p(), 0).await.unwrap_err();
        assert_eq!(err, InventoryError::InvalidQuantity { quantity: 0 });

        let err = svc
            .check_availability(&ProductId::new("ghost"), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reserve_defaults_ttl_and_generates_id() {
        let (svc, _) = service(10, 0, 0).await;
        let ticket = svc.reserve(&p(), 2, None, None, t0()).await.unwrap();
        assert!(!ticket.reservation_id.is_empty());
        assert_eq!(
            ticket.expires_at,
            t0() + Duration::seconds(DEFAULT_RESERVATION_TTL_SECS)
        );
    }

    #[tokio::test]
    async fn reserve_rejects_bad_arguments() {
        let (svc, _) = service(10, 0, 0).await;
        assert_eq!(
            svc.reserve(&p(), 0, None, None, t0()).await.unwrap_err(),
            InventoryError::InvalidQuantity { quantity: 0 }
        );
        assert!(matches!(
            svc.reserve(&p(), 1, Some("  ".into()), None, t0())
                .await
                .unwrap_err(),
            InventoryError::InvalidArgument { .. }
        ));
        assert!(matches!(
            svc.reserve(&p(), 1, None, Some(Duration::zero()), t0())
                .await
                .unwrap_err(),
            InventoryError::InvalidArgument { .. }
        ));
    }

    #[tokio::test]
    async fn reserve_surfaces_duplicate_and_insufficient() {
        let (svc, _) = service(3, 0, 0).await;
        svc.reserve(&p(), 2, Some("r-1".into()), None, t0())
            .await
            .unwrap();

        let err = svc
            .reserve(&p(), 1, Some("r-1".into()), None, t0())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::DuplicateReservation {
                reservation_id: "r-1".to_string()
            }
        );

        let err = svc
            .reserve(&p(), 2, Some("r-2".into()), None, t0())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                requested: 2,
                available: 1
            }
        );
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let (svc, store) = service(10, 0, 0).await;
        svc.reserve(&p(), 4, Some("r-1".into()), None, t0())
            .await
            .unwrap();

        assert_eq!(svc.release("r-1", t0()).await.unwrap(), 4);
        assert_eq!(svc.release("r-1", t0()).await.unwrap(), 0);

        let record = store.load_stock(&p()).await.unwrap();
        assert_eq!(record.reserved_quantity, 0, "decremented exactly once");

        let err = svc.release("ghost", t0()).await.unwrap_err();
        assert!(matches!(err, InventoryError::NotFound { .. }));
    }

    #[tokio::test]
    async fn commit_reservation_requires_active_state() {
        let (svc, _) = service(10, 0, 0).await;
        svc.reserve(&p(), 4, Some("r-1".into()), None, t0())
            .await
            .unwrap();
        svc.release("r-1", t0()).await.unwrap();

        let err = svc
            .commit_reservation("r-1", "order_77", t0())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::InvalidState {
                reservation_id: "r-1".to_string(),
                state: "RELEASED".to_string()
            }
        );
    }

    #[tokio::test]
    async fn commit_reservation_decrements_both_counters() {
        let (svc, store) = service(10, 0, 0).await;
        svc.reserve(&p(), 5, Some("r-1".into()), None, t0())
            .await
            .unwrap();
        let new_total = svc
            .commit_reservation("r-1", "order_1", t0())
            .await
            .unwrap();
        assert_eq!(new_total, 5);

        let record = store.load_stock(&p()).await.unwrap();
        assert_eq!(record.total_quantity, 5);
        assert_eq!(record.reserved_quantity, 0);
    }

    #[tokio::test]
    async fn commit_direct_respects_reserved_stock() {
        let (svc, _) = service(10, 0, 0).await;
        svc.reserve(&p(), 7, Some("r-1".into()), None, t0())
            .await
            .unwrap();

        let err = svc
            .commit_direct(&p(), 4, "order_2", t0())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            InventoryError::InsufficientStock {
                requested: 4,
                available: 3
            }
        );
        assert_eq!(svc.commit_direct(&p(), 3, "order_2", t0()).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn commit_requires_a_reason() {
        let (svc, _) = service(10, 0, 0).await;
        let err = svc.commit_direct(&p(), 1, "  ", t0()).await.unwrap_err();
        assert!(matches!(err, InventoryError::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn expire_sweep_reclaims_only_past_deadline() {
        let (svc, store) = service(10, 0, 0).await;
        svc.reserve(
            &p(),
            3,
            Some("r-old".into()),
            Some(Duration::seconds(1)),
            t0(),
        )
        .await
        .unwrap();
        svc.reserve(&p(), 2, Some("r-new".into()), None, t0())
            .await
            .unwrap();

        let report = svc.expire_sweep(t0() + Duration::seconds(2)).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.expired, 1);
        assert_eq!(report.reclaimed_quantity, 3);

        let record = store.load_stock(&p()).await.unwrap();
        assert_eq!(record.reserved_quantity, 2);

        // Re-running immediately is a harmless no-op.
        let report = svc.expire_sweep(t0() + Duration::seconds(2)).await.unwrap();
        assert_eq!(report.expired, 0);
    }

    #[tokio::test]
    async fn commit_lines_reports_per_line_without_rollback() {
        let (svc, store) = service(10, 0, 0).await;
        svc.reserve(&p(), 4, Some("r-1".into()), None, t0())
            .await
            .unwrap();

        let report = svc
            .commit_lines(
                vec![
                    CommitLine::Reservation {
                        reservation_id: "r-1".to_string(),
                    },
                    CommitLine::Direct {
                        product_id: ProductId::new("ghost"),
                        quantity: 1,
                    },
                    CommitLine::Direct {
                        product_id: p(),
                        quantity: 2,
                    },
                ],
                "order_9",
                t0(),
            )
            .await;

        assert_eq!(report.committed, 2);
        assert_eq!(report.failed, 1);
        assert!(!report.is_fully_committed());
        assert!(report.outcomes[0].result.is_ok());
        assert!(matches!(
            report.outcomes[1].result,
            Err(InventoryError::NotFound { .. })
        ));
        assert!(report.outcomes[2].result.is_ok());

        // The failed middle line rolled nothing back.
        let record = store.load_stock(&p()).await.unwrap();
        assert_eq!(record.total_quantity, 4);
    }
}
