use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stk_ledger::StockRecord;
use stk_reservation::{Reservation, ReservationState};
use stk_schemas::{ProductId, Severity, StockAlert, SyncRecord};

use crate::error::StoreError;

// ---------------------------------------------------------------------------
// StockStore
// ---------------------------------------------------------------------------

/// Ledger persistence. Each mutating method is one atomic operation: the
/// guard check and the write happen inside the store's critical section.
#[async_trait]
pub trait StockStore: Send + Sync {
    /// Seed a new product record. Fails with `AlreadyExists` on collision.
    async fn insert_stock(&self, record: StockRecord) -> Result<(), StoreError>;

    /// One consistent snapshot of a product's record.
    async fn load_stock(&self, product_id: &ProductId) -> Result<StockRecord, StoreError>;

    /// All records, ordered by product id (deterministic for scans).
    async fn list_stock(&self) -> Result<Vec<StockRecord>, StoreError>;

    /// Direct (unreserved) commit: `total -= quantity` iff
    /// `total - reserved >= quantity`. Returns the post-commit record.
    async fn commit_stock(
        &self,
        product_id: &ProductId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<StockRecord, StoreError>;

    /// Reconciliation adjustment: `total = physical_count`, reservations
    /// untouched. The `bool` reports `reserved > total` after the write.
    async fn set_total(
        &self,
        product_id: &ProductId,
        physical_count: i64,
        now: DateTime<Utc>,
    ) -> Result<(StockRecord, bool), StoreError>;
}

// ---------------------------------------------------------------------------
// ReservationStore
// ---------------------------------------------------------------------------

/// The terminal state a settlement drives the reservation into, and the
/// ledger effect that goes with it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// `reserved -= quantity`; units return to the available pool.
    Release,
    /// `total -= quantity; reserved -= quantity`; units leave the building.
    Commit,
    /// Same ledger effect as `Release`, driven by the sweep.
    Expire,
}

impl Disposition {
    pub fn terminal_state(&self) -> ReservationState {
        match self {
            Self::Release => ReservationState::Released,
            Self::Commit => ReservationState::Committed,
            Self::Expire => ReservationState::Expired,
        }
    }
}

/// Outcome of a settlement attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Settlement {
    /// This caller won the `Active -> terminal` race; the ledger effect has
    /// been applied exactly once.
    Settled {
        reservation: Reservation,
        stock: StockRecord,
    },
    /// Another caller settled first; no ledger effect was applied.
    AlreadyTerminal { state: ReservationState },
}

/// Reservation persistence, kept consistent with the ledger by combining
/// the state transition and its ledger effect into one atomic operation.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Atomically: verify availability, increment `reserved_quantity`, and
    /// insert the ACTIVE reservation row.
    ///
    /// Errors: `NotFound` (product), `Insufficient`, `DuplicateActive`
    /// (an ACTIVE reservation already carries this id; a terminal row's id
    /// may be reused and is replaced).
    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockRecord), StoreError>;

    async fn load_reservation(&self, reservation_id: &str) -> Result<Reservation, StoreError>;

    /// ACTIVE reservations with `expires_at < now`, ordered by deadline then
    /// id (deterministic sweeps).
    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError>;

    /// Atomically win (or lose) the `Active -> terminal` transition and, on
    /// a win, apply the disposition's ledger effect. Exactly one of the
    /// racing release/commit/expire callers observes `Settled`; the rest
    /// observe `AlreadyTerminal` and must no-op.
    ///
    /// A `Commit` against an over-reserved record whose total no longer
    /// covers the quantity fails with `Insufficient` and leaves the
    /// reservation ACTIVE.
    async fn settle_reservation(
        &self,
        reservation_id: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<Settlement, StoreError>;
}

// ---------------------------------------------------------------------------
// AlertStore
// ---------------------------------------------------------------------------

/// Persisted threshold-breach alerts with store-enforced de-duplication.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert `alert` unless an open alert for the same
    /// (product, severity) exists. Returns `true` if newly opened; the
    /// de-dup decision is atomic with the insert.
    async fn open_alert(&self, alert: StockAlert) -> Result<bool, StoreError>;

    /// Mark all open alerts for (product, severity) resolved at `now`.
    /// Returns how many were resolved.
    async fn resolve_alerts(
        &self,
        product_id: &ProductId,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError>;

    /// Open alerts, optionally filtered by product.
    async fn open_alerts(
        &self,
        product_id: Option<&ProductId>,
    ) -> Result<Vec<StockAlert>, StoreError>;
}

// ---------------------------------------------------------------------------
// SyncStore
// ---------------------------------------------------------------------------

/// Immutable reconciliation history.
#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn record_sync(&self, record: SyncRecord) -> Result<(), StoreError>;

    /// Sync records for one product, oldest first.
    async fn sync_history(&self, product_id: &ProductId) -> Result<Vec<SyncRecord>, StoreError>;
}
