//! stk-store
//!
//! The durable-store contract for the stock-control subsystem, and the
//! embedded in-process implementation.
//!
//! # Atomicity contract
//!
//! The stock ledger and the reservation set are the only shared mutable
//! resources in the subsystem, and every operation that mutates them is a
//! **single atomic operation on the store**: `create_reservation`
//! (availability check + reserved increment + row insert),
//! `settle_reservation` (one-shot `Active -> terminal` transition + ledger
//! effect), `commit_stock`, and `set_total`. Callers never read-then-write;
//! two concurrent reservations of the last unit are decided here, exactly
//! once each.
//!
//! [`MemoryStore`] provides that atomicity with a mutex around short
//! critical sections, delegating all arithmetic to `stk-ledger`'s pure
//! transitions. The PostgreSQL implementation (`stk-db`) provides it with
//! conditional single-statement updates and short transactions.

mod error;
mod memory;
mod traits;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use traits::{
    AlertStore, Disposition, ReservationStore, Settlement, StockStore, SyncStore,
};
