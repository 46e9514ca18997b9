//! Embedded in-process store.
//!
//! One mutex guards all four tables; every trait operation is a single
//! short critical section (no IO, no awaits while locked), which is what
//! makes each operation atomic and the whole store linearizable. All
//! quantity arithmetic is delegated to `stk-ledger`'s pure transitions so
//! the embedded and PostgreSQL backends share one set of semantics.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use stk_ledger::StockRecord;
use stk_reservation::{Reservation, ReservationState};
use stk_schemas::{ProductId, Severity, StockAlert, SyncRecord};

use crate::error::StoreError;
use crate::traits::{
    AlertStore, Disposition, ReservationStore, Settlement, StockStore, SyncStore,
};

#[derive(Default)]
struct Inner {
    stock: BTreeMap<ProductId, StockRecord>,
    reservations: BTreeMap<String, Reservation>,
    alerts: Vec<StockAlert>,
    syncs: Vec<SyncRecord>,
}

/// In-process implementation of every store trait. Cheap to construct per
/// test; suitable as the embedded backend for single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|_| StoreError::Backend {
            detail: "store mutex poisoned".to_string(),
        })
    }
}

#[async_trait]
impl StockStore for MemoryStore {
    async fn insert_stock(&self, record: StockRecord) -> Result<(), StoreError> {
        let mut g = self.locked()?;
        if g.stock.contains_key(&record.product_id) {
            return Err(StoreError::AlreadyExists {
                entity: "product",
                id: record.product_id.to_string(),
            });
        }
        g.stock.insert(record.product_id.clone(), record);
        Ok(())
    }

    async fn load_stock(&self, product_id: &ProductId) -> Result<StockRecord, StoreError> {
        let g = self.locked()?;
        g.stock
            .get(product_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "product",
                id: product_id.to_string(),
            })
    }

    async fn list_stock(&self) -> Result<Vec<StockRecord>, StoreError> {
        let g = self.locked()?;
        Ok(g.stock.values().cloned().collect())
    }

    async fn commit_stock(
        &self,
        product_id: &ProductId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<StockRecord, StoreError> {
        let mut g = self.locked()?;
        let record = g.stock.get(product_id).ok_or_else(|| StoreError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        })?;
        let next =
            stk_ledger::commit_direct(record, quantity, now).map_err(StoreError::from_ledger)?;
        g.stock.insert(product_id.clone(), next.clone());
        Ok(next)
    }

    async fn set_total(
        &self,
        product_id: &ProductId,
        physical_count: i64,
        now: DateTime<Utc>,
    ) -> Result<(StockRecord, bool), StoreError> {
        let mut g = self.locked()?;
        let record = g.stock.get(product_id).ok_or_else(|| StoreError::NotFound {
            entity: "product",
            id: product_id.to_string(),
        })?;
        let (next, over_reserved) =
            stk_ledger::set_total(record, physical_count, now).map_err(StoreError::from_ledger)?;
        g.stock.insert(product_id.clone(), next.clone());
        Ok((next, over_reserved))
    }
}

#[async_trait]
impl ReservationStore for MemoryStore {
    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockRecord), StoreError> {
        let mut g = self.locked()?;

        if let Some(existing) = g.reservations.get(&reservation.reservation_id) {
            if existing.state == ReservationState::Active {
                return Err(StoreError::DuplicateActive {
                    reservation_id: reservation.reservation_id.clone(),
                });
            }
        }

        let record = g
            .stock
            .get(&reservation.product_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "product",
                id: reservation.product_id.to_string(),
            })?;
        let next = stk_ledger::reserve(record, reservation.quantity, reservation.created_at)
            .map_err(StoreError::from_ledger)?;

        g.stock.insert(reservation.product_id.clone(), next.clone());
        g.reservations
            .insert(reservation.reservation_id.clone(), reservation.clone());
        Ok((reservation, next))
    }

    async fn load_reservation(&self, reservation_id: &str) -> Result<Reservation, StoreError> {
        let g = self.locked()?;
        g.reservations
            .get(reservation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "reservation",
                id: reservation_id.to_string(),
            })
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        let g = self.locked()?;
        let mut expired: Vec<Reservation> = g
            .reservations
            .values()
            .filter(|r| r.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.reservation_id.cmp(&b.reservation_id))
        });
        Ok(expired)
    }

    async fn settle_reservation(
        &self,
        reservation_id: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<Settlement, StoreError> {
        let mut g = self.locked()?;

        let mut reservation = g
            .reservations
            .get(reservation_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity: "reservation",
                id: reservation_id.to_string(),
            })?;
        if reservation.state.is_terminal() {
            return Ok(Settlement::AlreadyTerminal {
                state: reservation.state,
            });
        }

        let record = g
            .stock
            .get(&reservation.product_id)
            .ok_or_else(|| StoreError::Invariant {
                detail: format!(
                    "reservation {reservation_id} references missing product {}",
                    reservation.product_id
                ),
            })?;

        // Ledger effect first: a Commit whose total no longer covers the
        // quantity must fail while the reservation is still ACTIVE.
        let next = match disposition {
            Disposition::Release | Disposition::Expire => {
                stk_ledger::release(record, reservation.quantity, now)
            }
            Disposition::Commit => stk_ledger::commit_reserved(record, reservation.quantity, now),
        }
        .map_err(StoreError::from_ledger)?;

        reservation
            .transition(disposition.terminal_state())
            .map_err(|e| StoreError::Invariant {
                detail: e.to_string(),
            })?;

        g.stock
            .insert(reservation.product_id.clone(), next.clone());
        g.reservations
            .insert(reservation_id.to_string(), reservation.clone());
        Ok(Settlement::Settled {
            reservation,
            stock: next,
        })
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn open_alert(&self, alert: StockAlert) -> Result<bool, StoreError> {
        let mut g = self.locked()?;
        let already_open = g
            .alerts
            .iter()
            .any(|a| a.is_open() && a.product_id == alert.product_id && a.severity == alert.severity);
        if already_open {
            return Ok(false);
        }
        g.alerts.push(alert);
        Ok(true)
    }

    async fn resolve_alerts(
        &self,
        product_id: &ProductId,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut g = self.locked()?;
        let mut resolved = 0;
        for alert in g
            .alerts
            .iter_mut()
            .filter(|a| a.is_open() && a.product_id == *product_id && a.severity == severity)
        {
            alert.resolved_at = Some(now);
            resolved += 1;
        }
        Ok(resolved)
    }

    async fn open_alerts(
        &self,
        product_id: Option<&ProductId>,
    ) -> Result<Vec<StockAlert>, StoreError> {
        let g = self.locked()?;
        Ok(g.alerts
            .iter()
            .filter(|a| a.is_open() && product_id.map_or(true, |p| a.product_id == *p))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn record_sync(&self, record: SyncRecord) -> Result<(), StoreError> {
        let mut g = self.locked()?;
        g.syncs.push(record);
        Ok(())
    }

    async fn sync_history(&self, product_id: &ProductId) -> Result<Vec<SyncRecord>, StoreError> {
        let g = self.locked()?;
        Ok(g.syncs
            .iter()
            .filter(|s| s.product_id == *product_id)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
