//! PostgreSQL implementation of the stock-control store traits.
//!
//! Atomicity comes from conditional single-statement updates (the guard and
//! the write are one statement, re-evaluated under the row lock) and short
//! transactions where a reservation transition and its ledger effect must
//! land together. No statement in this crate reads-then-writes across a
//! round trip.
//!
//! Serialization failures and deadlocks (SQLSTATE 40001 / 40P01) surface as
//! `StoreError::Conflict`, which the manager retries a bounded number of
//! times with fresh state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use stk_ledger::StockRecord;
use stk_reservation::{Reservation, ReservationState};
use stk_schemas::{ProductId, Severity, StockAlert, SyncRecord};
use stk_store::{
    AlertStore, Disposition, ReservationStore, Settlement, StockStore, StoreError, SyncStore,
};

pub const ENV_DB_URL: &str = "STK_DATABASE_URL";

/// Connect to Postgres using STK_DATABASE_URL.
pub async fn connect_from_env() -> anyhow::Result<PgPool> {
    let url = std::env::var(ENV_DB_URL)
        .map_err(|_| anyhow::anyhow!("missing env var {ENV_DB_URL}"))?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&url)
        .await
        .map_err(|e| anyhow::anyhow!("failed to connect to Postgres: {e}"))?;

    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| anyhow::anyhow!("db migrate failed: {e}"))?;
    Ok(())
}

/// PostgreSQL-backed store. Cheap to clone (pool handle).
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Error + row mapping
// ---------------------------------------------------------------------------

fn db_code(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.to_string()),
        _ => None,
    }
}

/// Transient SQLSTATEs: serialization_failure, deadlock_detected.
fn map_sqlx(err: sqlx::Error) -> StoreError {
    match db_code(&err).as_deref() {
        Some("40001") | Some("40P01") => StoreError::Conflict {
            detail: err.to_string(),
        },
        _ => StoreError::Backend {
            detail: err.to_string(),
        },
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    db_code(err).as_deref() == Some("23505")
}

fn stock_from_row(row: &sqlx::postgres::PgRow) -> Result<StockRecord, StoreError> {
    let get = |e: sqlx::Error| StoreError::Backend {
        detail: format!("decode stock row: {e}"),
    };
    Ok(StockRecord {
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(get)?),
        total_quantity: row.try_get("total_quantity").map_err(get)?,
        reserved_quantity: row.try_get("reserved_quantity").map_err(get)?,
        low_stock_threshold: row.try_get("low_stock_threshold").map_err(get)?,
        critical_stock_threshold: row.try_get("critical_stock_threshold").map_err(get)?,
        version: row.try_get::<i64, _>("version").map_err(get)? as u64,
        updated_at: row.try_get("updated_at").map_err(get)?,
    })
}

fn reservation_from_row(row: &sqlx::postgres::PgRow) -> Result<Reservation, StoreError> {
    let get = |e: sqlx::Error| StoreError::Backend {
        detail: format!("decode reservation row: {e}"),
    };
    let state_raw: String = row.try_get("state").map_err(get)?;
    let state = ReservationState::parse(&state_raw).ok_or_else(|| StoreError::Invariant {
        detail: format!("unknown reservation state in db: {state_raw}"),
    })?;
    Ok(Reservation {
        reservation_id: row.try_get("reservation_id").map_err(get)?,
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(get)?),
        quantity: row.try_get("quantity").map_err(get)?,
        state,
        created_at: row.try_get("created_at").map_err(get)?,
        expires_at: row.try_get("expires_at").map_err(get)?,
    })
}

fn alert_from_row(row: &sqlx::postgres::PgRow) -> Result<StockAlert, StoreError> {
    let get = |e: sqlx::Error| StoreError::Backend {
        detail: format!("decode alert row: {e}"),
    };
    let severity_raw: String = row.try_get("severity").map_err(get)?;
    let severity = Severity::parse(&severity_raw).ok_or_else(|| StoreError::Invariant {
        detail: format!("unknown alert severity in db: {severity_raw}"),
    })?;
    Ok(StockAlert {
        alert_id: row.try_get("alert_id").map_err(get)?,
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(get)?),
        severity,
        current_quantity: row.try_get("current_quantity").map_err(get)?,
        threshold: row.try_get("threshold").map_err(get)?,
        created_at: row.try_get("created_at").map_err(get)?,
        resolved_at: row.try_get("resolved_at").map_err(get)?,
    })
}

const STOCK_COLUMNS: &str = "product_id, total_quantity, reserved_quantity, \
     low_stock_threshold, critical_stock_threshold, version, updated_at";

const RESERVATION_COLUMNS: &str =
    "reservation_id, product_id, quantity, state, created_at, expires_at";

// ---------------------------------------------------------------------------
// StockStore
// ---------------------------------------------------------------------------

#[async_trait]
impl StockStore for PgStore {
    async fn insert_stock(&self, record: StockRecord) -> Result<(), StoreError> {
        let res = sqlx::query(
            "insert into stock_records (product_id, total_quantity, reserved_quantity, \
             low_stock_threshold, critical_stock_threshold, version, updated_at) \
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.product_id.as_str())
        .bind(record.total_quantity)
        .bind(record.reserved_quantity)
        .bind(record.low_stock_threshold)
        .bind(record.critical_stock_threshold)
        .bind(record.version as i64)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match res {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(StoreError::AlreadyExists {
                entity: "product",
                id: record.product_id.to_string(),
            }),
            Err(e) => Err(map_sqlx(e)),
        }
    }

    async fn load_stock(&self, product_id: &ProductId) -> Result<StockRecord, StoreError> {
        let row = sqlx::query(&format!(
            "select {STOCK_COLUMNS} from stock_records where product_id = $1"
        ))
        .bind(product_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => stock_from_row(&row),
            None => Err(StoreError::NotFound {
                entity: "product",
                id: product_id.to_string(),
            }),
        }
    }

    async fn list_stock(&self) -> Result<Vec<StockRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {STOCK_COLUMNS} from stock_records order by product_id"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(stock_from_row).collect()
    }

    async fn commit_stock(
        &self,
        product_id: &ProductId,
        quantity: i64,
        now: DateTime<Utc>,
    ) -> Result<StockRecord, StoreError> {
        // Guard and decrement in one statement: the condition is
        // re-evaluated on the locked row, so a concurrent reserve cannot
        // slip between the check and the write.
        let row = sqlx::query(&format!(
            "update stock_records \
                set total_quantity = total_quantity - $2, \
                    version = version + 1, \
                    updated_at = $3 \
              where product_id = $1 \
                and total_quantity - reserved_quantity >= $2 \
          returning {STOCK_COLUMNS}"
        ))
        .bind(product_id.as_str())
        .bind(quantity)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => stock_from_row(&row),
            // Guard rejected: distinguish a missing product from
            // insufficient availability.
            None => {
                let current = self.load_stock(product_id).await?;
                Err(StoreError::Insufficient {
                    requested: quantity,
                    available: current.available(),
                })
            }
        }
    }

    async fn set_total(
        &self,
        product_id: &ProductId,
        physical_count: i64,
        now: DateTime<Utc>,
    ) -> Result<(StockRecord, bool), StoreError> {
        let row = sqlx::query(&format!(
            "update stock_records \
                set total_quantity = $2, \
                    version = version + 1, \
                    updated_at = $3 \
              where product_id = $1 \
          returning {STOCK_COLUMNS}"
        ))
        .bind(product_id.as_str())
        .bind(physical_count)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let record = stock_from_row(&row)?;
                let over_reserved = record.reserved_quantity > record.total_quantity;
                Ok((record, over_reserved))
            }
            None => Err(StoreError::NotFound {
                entity: "product",
                id: product_id.to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ReservationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ReservationStore for PgStore {
    async fn create_reservation(
        &self,
        reservation: Reservation,
    ) -> Result<(Reservation, StockRecord), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Claim the id first. A terminal row's id may be reused (the row is
        // replaced); an ACTIVE row wins the conflict and we bail out.
        let claimed = sqlx::query(
            "insert into reservations \
             (reservation_id, product_id, quantity, state, created_at, expires_at) \
             values ($1, $2, $3, 'ACTIVE', $4, $5) \
             on conflict (reservation_id) do update \
                set product_id = excluded.product_id, \
                    quantity = excluded.quantity, \
                    state = 'ACTIVE', \
                    created_at = excluded.created_at, \
                    expires_at = excluded.expires_at \
              where reservations.state <> 'ACTIVE' \
          returning reservation_id",
        )
        .bind(&reservation.reservation_id)
        .bind(reservation.product_id.as_str())
        .bind(reservation.quantity)
        .bind(reservation.created_at)
        .bind(reservation.expires_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        if claimed.is_none() {
            tx.rollback().await.map_err(map_sqlx)?;
            return Err(StoreError::DuplicateActive {
                reservation_id: reservation.reservation_id,
            });
        }

        let row = sqlx::query(&format!(
            "update stock_records \
                set reserved_quantity = reserved_quantity + $2, \
                    version = version + 1, \
                    updated_at = $3 \
              where product_id = $1 \
                and total_quantity - reserved_quantity >= $2 \
          returning {STOCK_COLUMNS}"
        ))
        .bind(reservation.product_id.as_str())
        .bind(reservation.quantity)
        .bind(reservation.created_at)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let record = stock_from_row(&row)?;
                tx.commit().await.map_err(map_sqlx)?;
                Ok((reservation, record))
            }
            None => {
                tx.rollback().await.map_err(map_sqlx)?;
                let current = self.load_stock(&reservation.product_id).await?;
                Err(StoreError::Insufficient {
                    requested: reservation.quantity,
                    available: current.available(),
                })
            }
        }
    }

    async fn load_reservation(&self, reservation_id: &str) -> Result<Reservation, StoreError> {
        let row = sqlx::query(&format!(
            "select {RESERVATION_COLUMNS} from reservations where reservation_id = $1"
        ))
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?;

        match row {
            Some(row) => reservation_from_row(&row),
            None => Err(StoreError::NotFound {
                entity: "reservation",
                id: reservation_id.to_string(),
            }),
        }
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> Result<Vec<Reservation>, StoreError> {
        let rows = sqlx::query(&format!(
            "select {RESERVATION_COLUMNS} from reservations \
              where state = 'ACTIVE' and expires_at < $1 \
              order by expires_at, reservation_id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;
        rows.iter().map(reservation_from_row).collect()
    }

    async fn settle_reservation(
        &self,
        reservation_id: &str,
        disposition: Disposition,
        now: DateTime<Utc>,
    ) -> Result<Settlement, StoreError> {
        let terminal = disposition.terminal_state();
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // One-shot transition: only the caller that flips ACTIVE gets a row
        // back and may touch the ledger.
        let won = sqlx::query(&format!(
            "update reservations set state = $2 \
              where reservation_id = $1 and state = 'ACTIVE' \
          returning {RESERVATION_COLUMNS}"
        ))
        .bind(reservation_id)
        .bind(terminal.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx)?;

        let reservation = match won {
            Some(row) => reservation_from_row(&row)?,
            None => {
                tx.rollback().await.map_err(map_sqlx)?;
                let existing = self.load_reservation(reservation_id).await?;
                return Ok(Settlement::AlreadyTerminal {
                    state: existing.state,
                });
            }
        };

        let stock_update = match disposition {
            Disposition::Release | Disposition::Expire => format!(
                "update stock_records \
                    set reserved_quantity = reserved_quantity - $2, \
                        version = version + 1, \
                        updated_at = $3 \
                  where product_id = $1 and reserved_quantity >= $2 \
              returning {STOCK_COLUMNS}"
            ),
            Disposition::Commit => format!(
                "update stock_records \
                    set total_quantity = total_quantity - $2, \
                        reserved_quantity = reserved_quantity - $2, \
                        version = version + 1, \
                        updated_at = $3 \
                  where product_id = $1 \
                    and reserved_quantity >= $2 \
                    and total_quantity >= $2 \
              returning {STOCK_COLUMNS}"
            ),
        };

        let row = sqlx::query(&stock_update)
            .bind(reservation.product_id.as_str())
            .bind(reservation.quantity)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        match row {
            Some(row) => {
                let stock = stock_from_row(&row)?;
                tx.commit().await.map_err(map_sqlx)?;
                Ok(Settlement::Settled { reservation, stock })
            }
            None => {
                // Guard rejected; the transition rolls back with us and the
                // reservation stays ACTIVE.
                tx.rollback().await.map_err(map_sqlx)?;
                let current = self.load_stock(&reservation.product_id).await?;
                if current.reserved_quantity < reservation.quantity {
                    Err(StoreError::Invariant {
                        detail: format!(
                            "reservation {reservation_id} holds {} but product {} has only {} reserved",
                            reservation.quantity,
                            reservation.product_id,
                            current.reserved_quantity
                        ),
                    })
                } else {
                    Err(StoreError::Insufficient {
                        requested: reservation.quantity,
                        available: current.available(),
                    })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AlertStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AlertStore for PgStore {
    async fn open_alert(&self, alert: StockAlert) -> Result<bool, StoreError> {
        // The partial unique index on open (product, severity) makes the
        // de-dup decision atomic with the insert.
        let res = sqlx::query(
            "insert into stock_alerts \
             (alert_id, product_id, severity, current_quantity, threshold, created_at, resolved_at) \
             values ($1, $2, $3, $4, $5, $6, null) \
             on conflict (product_id, severity) where resolved_at is null do nothing",
        )
        .bind(alert.alert_id)
        .bind(alert.product_id.as_str())
        .bind(alert.severity.as_str())
        .bind(alert.current_quantity)
        .bind(alert.threshold)
        .bind(alert.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;

        Ok(res.rows_affected() == 1)
    }

    async fn resolve_alerts(
        &self,
        product_id: &ProductId,
        severity: Severity,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let res = sqlx::query(
            "update stock_alerts set resolved_at = $3 \
              where product_id = $1 and severity = $2 and resolved_at is null",
        )
        .bind(product_id.as_str())
        .bind(severity.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(res.rows_affected() as usize)
    }

    async fn open_alerts(
        &self,
        product_id: Option<&ProductId>,
    ) -> Result<Vec<StockAlert>, StoreError> {
        let rows = match product_id {
            Some(p) => {
                sqlx::query(
                    "select alert_id, product_id, severity, current_quantity, threshold, \
                            created_at, resolved_at \
                       from stock_alerts \
                      where resolved_at is null and product_id = $1 \
                      order by created_at",
                )
                .bind(p.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "select alert_id, product_id, severity, current_quantity, threshold, \
                            created_at, resolved_at \
                       from stock_alerts \
                      where resolved_at is null \
                      order by created_at",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(map_sqlx)?;
        rows.iter().map(alert_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// SyncStore
// ---------------------------------------------------------------------------

#[async_trait]
impl SyncStore for PgStore {
    async fn record_sync(&self, record: SyncRecord) -> Result<(), StoreError> {
        sqlx::query(
            "insert into inventory_syncs \
             (sync_id, product_id, system_quantity, physical_count, discrepancy, \
              adjusted, over_reserved, performed_by, notes, created_at) \
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(record.sync_id)
        .bind(record.product_id.as_str())
        .bind(record.system_quantity)
        .bind(record.physical_count)
        .bind(record.discrepancy)
        .bind(record.adjusted)
        .bind(record.over_reserved)
        .bind(&record.performed_by)
        .bind(&record.notes)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn sync_history(&self, product_id: &ProductId) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(
            "select sync_id, product_id, system_quantity, physical_count, discrepancy, \
                    adjusted, over_reserved, performed_by, notes, created_at \
               from inventory_syncs \
              where product_id = $1 \
              order by created_at",
        )
        .bind(product_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                let get = |e: sqlx::Error| StoreError::Backend {
                    detail: format!("decode sync row: {e}"),
                };
                Ok(SyncRecord {
                    sync_id: row.try_get::<Uuid, _>("sync_id").map_err(get)?,
                    product_id: ProductId::new(
                        row.try_get::<String, _>("product_id").map_err(get)?,
                    ),
                    system_quantity: row.try_get("system_quantity").map_err(get)?,
                    physical_count: row.try_get("physical_count").map_err(get)?,
                    discrepancy: row.try_get("discrepancy").map_err(get)?,
                    adjusted: row.try_get("adjusted").map_err(get)?,
                    over_reserved: row.try_get("over_reserved").map_err(get)?,
                    performed_by: row.try_get("performed_by").map_err(get)?,
                    notes: row.try_get("notes").map_err(get)?,
                    created_at: row.try_get("created_at").map_err(get)?,
                })
            })
            .collect()
    }
}
