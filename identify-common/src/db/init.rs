//! Database initialization
//!
//! Creates the database file and identity schema on first run. Every step is
//! idempotent, so opening an existing database runs the same sequence.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Current schema version recorded in `schema_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Pool and connection settings for [`init_database`]
#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 10,
            busy_timeout_ms: 5000,
        }
    }
}

/// Open (creating if needed) the identity database and ensure its schema
pub async fn init_database(db_path: &Path, options: DatabaseOptions) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    // Connection-level pragmas go through the connect options so every
    // pooled connection gets them, not just the first one.
    let connect_options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(options.busy_timeout_ms));

    let pool = SqlitePoolOptions::new()
        .max_connections(options.max_connections)
        .connect_with(connect_options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema_version_table(&pool).await?;
    create_identities_table(&pool).await?;

    info!(
        max_connections = options.max_connections,
        busy_timeout_ms = options.busy_timeout_ms,
        "Database ready"
    );

    Ok(pool)
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the identities table and its lookup indices
///
/// AUTOINCREMENT keeps ids monotonic and never reused, which primary
/// election relies on.
pub async fn create_identities_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS identities (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            email TEXT,
            phone_number TEXT,
            linked_id INTEGER REFERENCES identities(id),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            CHECK (email IS NOT NULL OR phone_number IS NOT NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_email ON identities(email)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_phone ON identities(phone_number)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_identities_linked ON identities(linked_id)")
        .execute(pool)
        .await?;

    Ok(())
}
