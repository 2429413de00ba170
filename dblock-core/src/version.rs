//! The persisted schema version.
//!
//! The version lives in a single-row table which is created on first use.
use sqlx::{Acquire, PgConnection, PgPool};
use tracing::{info, instrument};

use crate::error::UpgradeError;
use crate::lock::LockKey;

/// SQLSTATE `undefined_table`.
const UNDEFINED_TABLE: &str = "42P01";

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS schema_version (
        singleton BOOLEAN PRIMARY KEY DEFAULT TRUE CHECK (singleton),
        version INTEGER NOT NULL DEFAULT 0
    )
";

/// Read the current schema version on `conn`, creating the backing record (at 0) if absent.
///
/// An initialized store is only read, never written.
///
/// # Errors
/// Returns [`UpgradeError::VersionRead`] if the query or initialization fails.
#[instrument(skip(conn))]
pub async fn get_version(conn: &mut PgConnection) -> Result<i32, UpgradeError> {
    if let Some(version) = read_version(conn)
        .await
        .map_err(UpgradeError::VersionRead)?
    {
        return Ok(version);
    }

    initialize(conn).await.map_err(UpgradeError::VersionRead)?;
    read_version(conn)
        .await
        .map_err(UpgradeError::VersionRead)?
        .ok_or(UpgradeError::VersionRead(sqlx::Error::RowNotFound))
}

/// [`get_version`] on a connection taken from `pool`.
///
/// # Errors
/// Returns [`UpgradeError::VersionRead`] if the database is unreachable or the read fails.
pub async fn current_version(pool: &PgPool) -> Result<i32, UpgradeError> {
    let mut conn = pool.acquire().await.map_err(UpgradeError::VersionRead)?;
    get_version(&mut conn).await
}

/// Write the schema version inside the caller's transaction. Does not commit.
///
/// The stored value never decreases: writing a smaller version is a no-op.
///
/// # Errors
/// Returns the database error, to be handled as part of the caller's transaction.
pub async fn set_version(txn: &mut PgConnection, version: i32) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE schema_version SET version = GREATEST(version, $1)")
        .bind(version)
        .execute(txn)
        .await?;
    Ok(())
}

async fn read_version(conn: &mut PgConnection) -> Result<Option<i32>, sqlx::Error> {
    match sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
        .fetch_optional(conn)
        .await
    {
        Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some(UNDEFINED_TABLE) => {
            Ok(None)
        }
        result => result,
    }
}

async fn initialize(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    let mut txn = conn.begin().await?;

    // Concurrent CREATE TABLE IF NOT EXISTS may still fail on the catalog, so serialize initializers.
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(init_lock_key().as_i64())
        .execute(&mut *txn)
        .await?;
    sqlx::query(CREATE_TABLE).execute(&mut *txn).await?;
    let created = sqlx::query(
        r"
        INSERT INTO schema_version (version)
        SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)
        ",
    )
    .execute(&mut *txn)
    .await?;

    txn.commit().await?;

    if created.rows_affected() > 0 {
        info!("initialized schema version to 0");
    }
    Ok(())
}

fn init_lock_key() -> LockKey {
    LockKey::hashed("schema_version:init", 0)
}
