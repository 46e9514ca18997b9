//! stk-ledger
//!
//! The stock ledger and availability engine:
//! - Per-product record of total and reserved quantities (single source of
//!   truth for stock).
//! - Pure transition functions for every legal ledger mutation, each
//!   enforcing `0 <= reserved <= total` and refusing to mutate on error.
//! - Availability computation (`available = total - reserved`) with
//!   threshold flags against the *total* quantity.
//!
//! # Determinism
//! This crate is pure (no IO and no clock access). Callers supply
//! `now`. Two calls with the same inputs always produce identical records,
//! which is what makes the store-level atomic operations (which delegate
//! their arithmetic here) reviewable.

mod ops;
mod types;

pub use ops::{commit_direct, commit_reserved, release, reserve, set_total, LedgerError};
pub use types::{availability, Availability, StockRecord};

/// Default reservation time-to-live, seconds. Callers may override per
/// reservation; the sweep reclaims anything older.
pub const DEFAULT_RESERVATION_TTL_SECS: i64 = 900;
