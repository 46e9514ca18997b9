//! Pure ledger transitions.
//!
//! Every function takes the current record by reference and returns the
//! post-transition record (version bumped, `updated_at` set) or an error;
//! the input is never half-applied. Stores wrap exactly one of these calls
//! in their atomic section, so whatever atomicity the store provides is the
//! atomicity the ledger gets.

use chrono::{DateTime, Utc};

use crate::types::StockRecord;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Invariant violations the ledger can surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Quantities handed to a transition must be strictly positive.
    NonPositiveQuantity { quantity: i64 },
    /// Counts (totals, thresholds, physical counts) must be non-negative.
    NegativeCount { count: i64 },
    /// Requested quantity exceeds available (total - reserved) stock.
    Insufficient { requested: i64, available: i64 },
    /// A decrement would drive `reserved_quantity` below zero; the caller
    /// is trying to settle more than was ever reserved.
    ReservedUnderflow { reserved: i64, requested: i64 },
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonPositiveQuantity { quantity } => {
                write!(f, "ledger invariant: quantity must be > 0, got {quantity}")
            }
            Self::NegativeCount { count } => {
                write!(f, "ledger invariant: count must be >= 0, got {count}")
            }
            Self::Insufficient {
                requested,
                available,
            } => write!(
                f,
                "insufficient stock: requested {requested}, available {available}"
            ),
            Self::ReservedUnderflow {
                reserved,
                requested,
            } => write!(
                f,
                "ledger invariant: cannot settle {requested} with only {reserved} reserved"
            ),
        }
    }
}

impl std::error::Error for LedgerError {}

fn validate_positive(quantity: i64) -> Result<(), LedgerError> {
    if quantity <= 0 {
        return Err(LedgerError::NonPositiveQuantity { quantity });
    }
    Ok(())
}

fn touched(record: &StockRecord, now: DateTime<Utc>) -> StockRecord {
    let mut next = record.clone();
    next.version += 1;
    next.updated_at = now;
    next
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Hold `quantity` units for a reservation: `reserved += quantity`, only
/// while `available >= quantity`.
pub fn reserve(
    record: &StockRecord,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<StockRecord, LedgerError> {
    validate_positive(quantity)?;
    let available = record.available();
    if available < quantity {
        return Err(LedgerError::Insufficient {
            requested: quantity,
            available,
        });
    }
    let mut next = touched(record, now);
    next.reserved_quantity += quantity;
    Ok(next)
}

/// Return `quantity` reserved units to the available pool (explicit release
/// or expiry): `reserved -= quantity`.
pub fn release(
    record: &StockRecord,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<StockRecord, LedgerError> {
    validate_positive(quantity)?;
    if record.reserved_quantity < quantity {
        return Err(LedgerError::ReservedUnderflow {
            reserved: record.reserved_quantity,
            requested: quantity,
        });
    }
    let mut next = touched(record, now);
    next.reserved_quantity -= quantity;
    Ok(next)
}

/// Convert a reservation into a permanent decrement:
/// `total -= quantity; reserved -= quantity`. The availability is unchanged
/// by construction; the units were already promised.
///
/// `total >= quantity` is enforced separately from the reserved guard: a
/// reconciliation may have left the record over-reserved, and the total must
/// never go negative.
pub fn commit_reserved(
    record: &StockRecord,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<StockRecord, LedgerError> {
    validate_positive(quantity)?;
    if record.reserved_quantity < quantity {
        return Err(LedgerError::ReservedUnderflow {
            reserved: record.reserved_quantity,
            requested: quantity,
        });
    }
    if record.total_quantity < quantity {
        return Err(LedgerError::Insufficient {
            requested: quantity,
            available: record.available(),
        });
    }
    let mut next = touched(record, now);
    next.total_quantity -= quantity;
    next.reserved_quantity -= quantity;
    Ok(next)
}

/// Permanent decrement without a prior reservation (legacy/offline orders):
/// `total -= quantity`, only while `total - reserved >= quantity`; a direct
/// commit can never dip into stock promised to reservations.
pub fn commit_direct(
    record: &StockRecord,
    quantity: i64,
    now: DateTime<Utc>,
) -> Result<StockRecord, LedgerError> {
    validate_positive(quantity)?;
    let available = record.available();
    if available < quantity {
        return Err(LedgerError::Insufficient {
            requested: quantity,
            available,
        });
    }
    let mut next = touched(record, now);
    next.total_quantity -= quantity;
    Ok(next)
}

/// Reconciliation adjustment: the physical count is authoritative, so
/// `total = physical_count` regardless of the previous value.
/// `reserved_quantity` is never altered; when the new total leaves
/// `reserved > total` the second tuple element is `true` so the caller can
/// flag the record for operator follow-up instead of silently truncating
/// active reservations.
pub fn set_total(
    record: &StockRecord,
    physical_count: i64,
    now: DateTime<Utc>,
) -> Result<(StockRecord, bool), LedgerError> {
    if physical_count < 0 {
        return Err(LedgerError::NegativeCount {
            count: physical_count,
        });
    }
    let mut next = touched(record, now);
    next.total_quantity = physical_count;
    let over_reserved = next.reserved_quantity > next.total_quantity;
    Ok((next, over_reserved))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use stk_schemas::ProductId;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn record(total: i64, reserved: i64) -> StockRecord {
        let mut r = StockRecord::new(ProductId::new("p-1"), total, 0, 0, t0()).unwrap();
        r.reserved_quantity = reserved;
        r
    }

    // --- reserve ---

    #[test]
    fn reserve_increments_reserved_only() {
        let r = record(10, 2);
        let next = reserve(&r, 3, t0()).unwrap();
        assert_eq!(next.total_quantity, 10);
        assert_eq!(next.reserved_quantity, 5);
        assert_eq!(next.version, r.version + 1);
        assert!(next.invariant_holds());
    }

    #[test]
    fn reserve_rejects_more_than_available() {
        let r = record(10, 8);
        let err = reserve(&r, 3, t0());
        assert_eq!(
            err,
            Err(LedgerError::Insufficient {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn reserve_allows_exactly_available() {
        let r = record(10, 8);
        let next = reserve(&r, 2, t0()).unwrap();
        assert_eq!(next.reserved_quantity, 10);
        assert_eq!(next.available(), 0);
    }

    #[test]
    fn reserve_rejects_zero_quantity() {
        let r = record(10, 0);
        assert_eq!(
            reserve(&r, 0, t0()),
            Err(LedgerError::NonPositiveQuantity { quantity: 0 })
        );
    }

    // --- release ---

    #[test]
    fn release_returns_units_to_pool() {
        let r = record(10, 4);
        let next = release(&r, 4, t0()).unwrap();
        assert_eq!(next.reserved_quantity, 0);
        assert_eq!(next.total_quantity, 10);
        assert_eq!(next.available(), 10);
    }

    #[test]
    fn release_guards_against_underflow() {
        let r = record(10, 1);
        assert_eq!(
            release(&r, 2, t0()),
            Err(LedgerError::ReservedUnderflow {
                reserved: 1,
                requested: 2
            })
        );
    }

    // --- commit_reserved ---

    #[test]
    fn commit_reserved_conserves_availability() {
        let r = record(10, 5);
        let before = r.available();
        let next = commit_reserved(&r, 5, t0()).unwrap();
        assert_eq!(next.total_quantity, 5);
        assert_eq!(next.reserved_quantity, 0);
        assert_eq!(next.available(), before);
    }

    #[test]
    fn commit_reserved_rejects_unreserved_quantity() {
        let r = record(10, 2);
        assert_eq!(
            commit_reserved(&r, 3, t0()),
            Err(LedgerError::ReservedUnderflow {
                reserved: 2,
                requested: 3
            })
        );
    }

    #[test]
    fn commit_reserved_never_drives_total_negative() {
        // Over-reserved record (reconciliation shrank the total).
        let r = record(2, 5);
        let err = commit_reserved(&r, 5, t0());
        assert_eq!(
            err,
            Err(LedgerError::Insufficient {
                requested: 5,
                available: 0
            })
        );
    }

    // --- commit_direct ---

    #[test]
    fn commit_direct_decrements_total_only() {
        let r = record(10, 0);
        let next = commit_direct(&r, 4, t0()).unwrap();
        assert_eq!(next.total_quantity, 6);
        assert_eq!(next.reserved_quantity, 0);
    }

    #[test]
    fn commit_direct_cannot_dip_into_reserved_stock() {
        // 10 total, 7 promised to reservations: only 3 may ship directly.
        let r = record(10, 7);
        assert!(commit_direct(&r, 3, t0()).is_ok());
        assert_eq!(
            commit_direct(&r, 4, t0()),
            Err(LedgerError::Insufficient {
                requested: 4,
                available: 3
            })
        );
    }

    // --- set_total ---

    #[test]
    fn set_total_is_authoritative() {
        let r = record(50, 0);
        let (next, over) = set_total(&r, 47, t0()).unwrap();
        assert_eq!(next.total_quantity, 47);
        assert!(!over);
    }

    #[test]
    fn set_total_preserves_reservations_and_flags_over_reserve() {
        let r = record(10, 6);
        let (next, over) = set_total(&r, 4, t0()).unwrap();
        assert_eq!(next.total_quantity, 4);
        assert_eq!(next.reserved_quantity, 6, "reservations are never truncated");
        assert!(over);
        assert_eq!(next.available(), 0);
    }

    #[test]
    fn set_total_rejects_negative_count() {
        let r = record(10, 0);
        assert_eq!(
            set_total(&r, -1, t0()),
            Err(LedgerError::NegativeCount { count: -1 })
        );
    }

    #[test]
    fn error_paths_do_not_mutate_input() {
        let r = record(10, 8);
        let _ = reserve(&r, 5, t0());
        assert_eq!(r.reserved_quantity, 8);
        assert_eq!(r.version, 1);
    }
}
