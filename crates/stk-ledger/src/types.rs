use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stk_schemas::{ProductId, Severity};

use crate::ops::LedgerError;

// ---------------------------------------------------------------------------
// StockRecord
// ---------------------------------------------------------------------------

/// Durable per-product stock record. The ledger exclusively owns
/// `total_quantity` and `reserved_quantity`; every mutation goes through the
/// transition functions in [`crate::ops`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    pub product_id: ProductId,
    /// Physically owned units.
    pub total_quantity: i64,
    /// Units held by active reservations.
    pub reserved_quantity: i64,
    /// `total <= low` opens a LOW alert.
    pub low_stock_threshold: i64,
    /// `total <= critical` opens a CRITICAL alert.
    pub critical_stock_threshold: i64,
    /// Monotonic mutation counter; bumped by every successful transition.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

impl StockRecord {
    /// Create a fresh record with no reservations.
    ///
    /// # Errors
    /// Rejects negative quantities or thresholds.
    pub fn new(
        product_id: ProductId,
        total_quantity: i64,
        low_stock_threshold: i64,
        critical_stock_threshold: i64,
        now: DateTime<Utc>,
    ) -> Result<Self, LedgerError> {
        if total_quantity < 0 {
            return Err(LedgerError::NegativeCount {
                count: total_quantity,
            });
        }
        if low_stock_threshold < 0 || critical_stock_threshold < 0 {
            return Err(LedgerError::NegativeCount {
                count: low_stock_threshold.min(critical_stock_threshold),
            });
        }
        Ok(Self {
            product_id,
            total_quantity,
            reserved_quantity: 0,
            low_stock_threshold,
            critical_stock_threshold,
            version: 1,
            updated_at: now,
        })
    }

    /// Units a new request may still claim. Clamped at zero: reconciliation
    /// can leave a record over-reserved (see [`crate::ops::set_total`]), and
    /// a negative figure is meaningless to callers.
    pub fn available(&self) -> i64 {
        (self.total_quantity - self.reserved_quantity).max(0)
    }

    /// Most severe breached threshold, if any. Compares the total quantity;
    /// reservations alone never breach a threshold.
    pub fn severity(&self) -> Option<Severity> {
        Severity::for_quantities(
            self.total_quantity,
            self.low_stock_threshold,
            self.critical_stock_threshold,
        )
    }

    /// `true` while `0 <= reserved <= total` holds.
    pub fn invariant_holds(&self) -> bool {
        self.reserved_quantity >= 0 && self.reserved_quantity <= self.total_quantity
    }
}

// ---------------------------------------------------------------------------
// Availability
// ---------------------------------------------------------------------------

/// Read-only availability snapshot answering "can N units be fulfilled now".
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: i64,
    pub can_fulfill: bool,
    pub in_stock: bool,
    /// Total quantity at or below the LOW threshold.
    pub low_stock: bool,
    /// Total quantity at or below the CRITICAL threshold.
    pub critical_stock: bool,
}

/// Compute availability for a requested quantity against one consistent
/// record snapshot. No side effects.
///
/// # Errors
/// `requested_quantity <= 0` is a caller error.
pub fn availability(
    record: &StockRecord,
    requested_quantity: i64,
) -> Result<Availability, LedgerError> {
    if requested_quantity <= 0 {
        return Err(LedgerError::NonPositiveQuantity {
            quantity: requested_quantity,
        });
    }
    let available = record.available();
    let severity = record.severity();
    Ok(Availability {
        available,
        can_fulfill: available >= requested_quantity,
        in_stock: available > 0,
        low_stock: severity.is_some(),
        critical_stock: severity == Some(Severity::Critical),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
