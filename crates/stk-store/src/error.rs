use stk_ledger::LedgerError;
use stk_schemas::InventoryError;

/// Errors surfaced by store implementations.
///
/// Business outcomes that the store must decide inside its atomic section
/// (`Insufficient`, `DuplicateActive`) are variants here; the manager maps
/// them onto the public [`InventoryError`] taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Unknown product or reservation id.
    NotFound { entity: &'static str, id: String },
    /// Insert collided with an existing row.
    AlreadyExists { entity: &'static str, id: String },
    /// A reservation with this id is currently ACTIVE.
    DuplicateActive { reservation_id: String },
    /// The availability guard rejected the request.
    Insufficient { requested: i64, available: i64 },
    /// The store refused an operation that would corrupt the ledger
    /// (reserved underflow, negative counts). Indicates a bug upstream.
    Invariant { detail: String },
    /// Transient backend race (e.g. serialization failure); retryable.
    Conflict { detail: String },
    /// Backend fault: connectivity, poisoned lock, decode failure.
    Backend { detail: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::AlreadyExists { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::DuplicateActive { reservation_id } => {
                write!(f, "reservation already active: {reservation_id}")
            }
            Self::Insufficient {
                requested,
                available,
            } => write!(
                f,
                "insufficient stock: requested {requested}, available {available}"
            ),
            Self::Invariant { detail } => write!(f, "store invariant violated: {detail}"),
            Self::Conflict { detail } => write!(f, "transient store conflict: {detail}"),
            Self::Backend { detail } => write!(f, "store backend error: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// Translate a pure-ledger rejection into a store error. `Insufficient`
    /// is the only expected business outcome; everything else means a caller
    /// bypassed upstream validation.
    pub fn from_ledger(err: LedgerError) -> Self {
        match err {
            LedgerError::Insufficient {
                requested,
                available,
            } => Self::Insufficient {
                requested,
                available,
            },
            other => Self::Invariant {
                detail: other.to_string(),
            },
        }
    }

    /// `true` for faults worth an internal bounded retry with fresh state.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<StoreError> for InventoryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => InventoryError::NotFound { entity, id },
            StoreError::Insufficient {
                requested,
                available,
            } => InventoryError::InsufficientStock {
                requested,
                available,
            },
            StoreError::DuplicateActive { reservation_id } => {
                InventoryError::DuplicateReservation { reservation_id }
            }
            StoreError::Conflict { .. } => InventoryError::Conflict { retries: 0 },
            StoreError::AlreadyExists { entity, id } => InventoryError::Store {
                detail: format!("{entity} already exists: {id}"),
            },
            StoreError::Invariant { detail } | StoreError::Backend { detail } => {
                InventoryError::Store { detail }
            }
        }
    }
}
