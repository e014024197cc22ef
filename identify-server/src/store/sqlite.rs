//! SQLite-backed identity store
//!
//! Each transaction holds one pooled connection for its whole lifetime and
//! releases it on commit or drop.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use identify_common::{Error, IdentityRecord, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool, Transaction};
use std::time::Instant;

use super::{IdentityStore, StoreTransaction};

const RECORD_COLUMNS: &str = "id, email, phone_number, linked_id, created_at, updated_at";

/// Identity store over a SQLite connection pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdentityStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let start = Instant::now();
        tracing::debug!("Connection acquisition requested");

        let tx = self.pool.begin().await?;

        let wait_ms = start.elapsed().as_millis();
        if wait_ms > 1000 {
            tracing::warn!(
                wait_ms = wait_ms,
                "SLOW CONNECTION ACQUISITION - Pool may be saturated"
            );
        } else {
            tracing::debug!(wait_ms = wait_ms, "Connection acquired");
        }

        Ok(Box::new(SqliteTransaction {
            tx,
            acquired_at: Instant::now(),
        }))
    }
}

/// Open SQLite transaction; rolls back when dropped uncommitted
pub struct SqliteTransaction {
    tx: Transaction<'static, Sqlite>,
    acquired_at: Instant,
}

fn record_from_row(row: &SqliteRow) -> Result<IdentityRecord> {
    Ok(IdentityRecord {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        phone_number: row.try_get("phone_number")?,
        linked_id: row.try_get("linked_id")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn find_by_email_or_phone(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Vec<IdentityRecord>> {
        let sql = format!(
            "SELECT {} FROM identities
             WHERE (email IS NOT NULL AND email = ?)
                OR (phone_number IS NOT NULL AND phone_number = ?)
             ORDER BY id ASC",
            RECORD_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(email)
            .bind(phone_number)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_id(&mut self, id: i64) -> Result<Option<IdentityRecord>> {
        let sql = format!("SELECT {} FROM identities WHERE id = ?", RECORD_COLUMNS);

        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn find_by_id_or_linked_id(&mut self, id: i64) -> Result<Vec<IdentityRecord>> {
        let sql = format!(
            "SELECT {} FROM identities WHERE id = ? OR linked_id = ? ORDER BY id ASC",
            RECORD_COLUMNS
        );

        let rows = sqlx::query(&sql)
            .bind(id)
            .bind(id)
            .fetch_all(&mut *self.tx)
            .await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_by_linked_ids(&mut self, ids: &[i64]) -> Result<Vec<IdentityRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM identities WHERE linked_id IN (",
            RECORD_COLUMNS
        ));
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id ASC");

        let rows = query.build().fetch_all(&mut *self.tx).await?;

        rows.iter().map(record_from_row).collect()
    }

    async fn insert(
        &mut self,
        email: Option<&str>,
        phone_number: Option<&str>,
        linked_id: Option<i64>,
    ) -> Result<IdentityRecord> {
        let now = Utc::now();
        let sql = format!(
            "INSERT INTO identities (email, phone_number, linked_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)
             RETURNING {}",
            RECORD_COLUMNS
        );

        let row = sqlx::query(&sql)
            .bind(email)
            .bind(phone_number)
            .bind(linked_id)
            .bind(now)
            .bind(now)
            .fetch_one(&mut *self.tx)
            .await?;

        record_from_row(&row)
    }

    async fn update_linked_id(&mut self, id: i64, linked_id: i64) -> Result<()> {
        let result = sqlx::query("UPDATE identities SET linked_id = ?, updated_at = ? WHERE id = ?")
            .bind(linked_id)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("identity record {}", id)));
        }

        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let held_ms = self.acquired_at.elapsed().as_millis();
        self.tx.commit().await?;

        if held_ms > 2000 {
            tracing::warn!(held_ms = held_ms, "LONG TRANSACTION - Connection held >2s");
        } else {
            tracing::debug!(held_ms = held_ms, "Connection released (commit)");
        }

        Ok(())
    }
}
