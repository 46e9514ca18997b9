//! stk-inventory
//!
//! The operational core of the stock-control subsystem: availability
//! checks, reservation lifecycle (create / release / expire), and
//! fulfillment commits, wired over the injected store, alerting, and audit
//! components.
//!
//! # Concurrency
//! Every mutation is a single atomic store operation (see `stk-store`);
//! this crate adds caller-facing validation, bounded retry of *transient*
//! backend conflicts, audit records for each mutation, and threshold
//! re-evaluation after each mutation. Losing a race for the last unit is a
//! business outcome (`InsufficientStock`), never retried; losing a
//! reservation's terminal-state race is observed as a no-op.

mod service;
mod types;

pub use service::{InventoryService, MAX_TRANSIENT_RETRIES};
pub use types::{CommitLine, CommitReport, LineOutcome, ReservationTicket, SweepReport};
