use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stk_schemas::{InventoryError, ProductId};

/// Returned to the checkout workflow on a successful reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationTicket {
    pub reservation_id: String,
    pub product_id: ProductId,
    pub quantity: i64,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of one expiry sweep pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Reservations past their deadline when the sweep started.
    pub examined: usize,
    /// Reservations this sweep transitioned to EXPIRED.
    pub expired: usize,
    /// Units returned to the available pool by this sweep.
    pub reclaimed_quantity: i64,
}

/// One line of a multi-line order commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitLine {
    /// Commit a previously created reservation.
    Reservation { reservation_id: String },
    /// Direct commit with no prior reservation (legacy/offline order).
    Direct {
        product_id: ProductId,
        quantity: i64,
    },
}

/// Per-line result: the new total quantity on success, the error otherwise.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LineOutcome {
    pub line: CommitLine,
    pub result: Result<i64, InventoryError>,
}

/// Aggregate multi-line commit report. Lines are attempted independently;
/// a failed line never rolls back lines already committed; the order
/// workflow decides whether to fully or partially fulfill.
#[derive(Clone, Debug, Default)]
pub struct CommitReport {
    pub outcomes: Vec<LineOutcome>,
    pub committed: usize,
    pub failed: usize,
}

impl CommitReport {
    pub fn is_fully_committed(&self) -> bool {
        self.failed == 0
    }
}
