//! Shared record types and the error taxonomy for the stock-control
//! workspace.
//!
//! This crate is a leaf: every other crate depends on it and it depends on
//! nothing in the workspace. Types here are plain serde records with no IO
//! and no store wiring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProductId
// ---------------------------------------------------------------------------

/// Opaque product identifier (deterministic ordering for tests/logs).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProductId(pub String);

impl ProductId {
    pub fn new<S: Into<String>>(s: S) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ProductId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Severity
// ---------------------------------------------------------------------------

/// Stock alert severity. `Critical` outranks `Low`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Low,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Severity::Low),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }

    /// The most severe breached level for a total quantity against its
    /// thresholds, or `None` when neither threshold is breached.
    ///
    /// Comparisons use the *total* quantity; reservations do not trigger
    /// alerts; only true depletion does.
    pub fn for_quantities(total: i64, low_threshold: i64, critical_threshold: i64) -> Option<Self> {
        if total <= critical_threshold {
            Some(Severity::Critical)
        } else if total <= low_threshold {
            Some(Severity::Low)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// StockAlert
// ---------------------------------------------------------------------------

/// A persisted threshold-breach alert. At most one open (unresolved) alert
/// exists per (product, severity) at any time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAlert {
    pub alert_id: Uuid,
    pub product_id: ProductId,
    pub severity: Severity,
    /// Total quantity observed when the alert fired.
    pub current_quantity: i64,
    /// The threshold that was breached.
    pub threshold: i64,
    pub created_at: DateTime<Utc>,
    /// Set when quantity recovered above the threshold on a later
    /// evaluation; `None` while the alert is open.
    pub resolved_at: Option<DateTime<Utc>>,
}

impl StockAlert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

// ---------------------------------------------------------------------------
// SyncRecord
// ---------------------------------------------------------------------------

/// Immutable audit entry for one physical-count reconciliation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub sync_id: Uuid,
    pub product_id: ProductId,
    /// Ledger total at the time of the sync.
    pub system_quantity: i64,
    /// Externally supplied physical count (authoritative).
    pub physical_count: i64,
    /// `physical_count - system_quantity`.
    pub discrepancy: i64,
    /// Whether a corrective adjustment was applied to the ledger.
    pub adjusted: bool,
    /// Set when the adjustment left `reserved > total`; operator
    /// follow-up is required; active reservations are never truncated.
    pub over_reserved: bool,
    pub performed_by: String,
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// InventoryError
// ---------------------------------------------------------------------------

/// The error taxonomy surfaced by every contract operation in this
/// subsystem. Kinds, not causes: callers branch on the variant, operators
/// read the `Display` text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InventoryError {
    /// Unknown product or reservation id.
    NotFound { entity: &'static str, id: String },
    /// Requested quantity must be strictly positive.
    InvalidQuantity { quantity: i64 },
    /// Missing or malformed caller input (blank operator id, zero TTL, …).
    InvalidArgument { detail: String },
    /// Requested quantity exceeds currently available (post-reservation)
    /// stock. Terminal for this request and never retried.
    InsufficientStock { requested: i64, available: i64 },
    /// The reservation id collides with an active reservation.
    DuplicateReservation { reservation_id: String },
    /// Operation attempted on a reservation outside the required state.
    InvalidState { reservation_id: String, state: String },
    /// Lost a transient backend race repeatedly; safe to retry with fresh
    /// state. Distinct from `InsufficientStock`, which is terminal.
    Conflict { retries: u32 },
    /// Durable-store fault (connectivity, corruption guard, …).
    Store { detail: String },
}

impl std::fmt::Display for InventoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::InvalidQuantity { quantity } => {
                write!(f, "quantity must be > 0, got {quantity}")
            }
            Self::InvalidArgument { detail } => write!(f, "invalid argument: {detail}"),
            Self::InsufficientStock {
                requested,
                available,
            } => write!(
                f,
                "insufficient stock: requested {requested}, available {available}"
            ),
            Self::DuplicateReservation { reservation_id } => {
                write!(f, "reservation id already active: {reservation_id}")
            }
            Self::InvalidState {
                reservation_id,
                state,
            } => write!(f, "reservation {reservation_id} is {state}, expected ACTIVE"),
            Self::Conflict { retries } => {
                write!(f, "concurrent update conflict after {retries} retries")
            }
            Self::Store { detail } => write!(f, "store error: {detail}"),
        }
    }
}

impl std::error::Error for InventoryError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
