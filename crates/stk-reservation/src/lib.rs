//! Reservation state machine.
//!
//! # Design
//!
//! A reservation is a time-bounded hold on N units of one product. Its
//! lifecycle is an explicit finite-state machine:
//!
//! ```text
//!              Released (terminal)    (explicit release)
//!            ↗
//!   Active  →  Committed (terminal)   (order paid, stock decremented)
//!            ↘
//!              Expired (terminal)     (background sweep past expires_at)
//! ```
//!
//! Exactly one terminal transition may ever succeed. `release`, `commit`
//! and the expiry sweep race on the same reservation in production; the
//! store serializes them, and this state machine guarantees the losers see
//! [`TransitionError`] (or observe the terminal state and no-op) rather
//! than double-settling stock. No transition is reversible.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stk_schemas::ProductId;

// ---------------------------------------------------------------------------
// ReservationState
// ---------------------------------------------------------------------------

/// All states a reservation can occupy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationState {
    /// Holding stock; the only state that permits transitions.
    Active,
    /// Explicitly released by the caller. **Terminal.**
    Released,
    /// Converted into a permanent stock decrement. **Terminal.**
    Committed,
    /// Reclaimed by the expiry sweep. **Terminal.**
    Expired,
}

impl ReservationState {
    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Released => "RELEASED",
            Self::Committed => "COMMITTED",
            Self::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(Self::Active),
            "RELEASED" => Some(Self::Released),
            "COMMITTED" => Some(Self::Committed),
            "EXPIRED" => Some(Self::Expired),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// TransitionError
// ---------------------------------------------------------------------------

/// Returned when a transition is attempted outside the `Active` state.
///
/// Callers racing on the same reservation are expected to hit this: the
/// loser of a release/commit/expire race observes the winner's terminal
/// state here and must no-op, never re-touch the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionError {
    /// The state the reservation was in when the transition was attempted.
    pub from: ReservationState,
    /// The terminal state that was requested.
    pub to: ReservationState,
}

impl std::fmt::Display for TransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal reservation transition: {} -> {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for TransitionError {}

// ---------------------------------------------------------------------------
// Reservation
// ---------------------------------------------------------------------------

/// A time-bounded hold on `quantity` units of `product_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Caller-supplied or generated identifier; unique among active
    /// reservations.
    pub reservation_id: String,
    pub product_id: ProductId,
    pub quantity: i64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    /// Past this instant an `Active` reservation is eligible for the sweep.
    pub expires_at: DateTime<Utc>,
}

impl Reservation {
    /// Create an `Active` reservation expiring `ttl` after `created_at`.
    ///
    /// # Panics (debug only)
    /// Panics if `quantity` <= 0; validated upstream by the manager.
    pub fn new(
        reservation_id: impl Into<String>,
        product_id: ProductId,
        quantity: i64,
        created_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        debug_assert!(quantity > 0, "reservation quantity must be positive");
        Self {
            reservation_id: reservation_id.into(),
            product_id,
            quantity,
            state: ReservationState::Active,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    /// `true` for an `Active` reservation whose deadline has passed.
    /// Terminal reservations are never "expired"; they are settled.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == ReservationState::Active && self.expires_at < now
    }

    /// Apply the one-shot terminal transition.
    ///
    /// # Errors
    /// [`TransitionError`] unless the reservation is `Active` and `to` is a
    /// terminal state. The reservation is unchanged on error.
    pub fn transition(&mut self, to: ReservationState) -> Result<(), TransitionError> {
        if self.state != ReservationState::Active || !to.is_terminal() {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
