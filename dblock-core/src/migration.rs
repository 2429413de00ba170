use std::path::Path;

use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::{Executor, PgConnection};
use tracing::debug;

/// A unit of work run inside the upgrade transaction.
///
/// The coordinator only looks at the outcome. Implementations must neither commit nor
/// roll back the transaction they are given.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Apply the migration.
    ///
    /// # Errors
    /// Any error aborts the upgrade and rolls the transaction back.
    async fn apply(&self, txn: &mut PgConnection) -> Result<()>;
}

/// Runs a SQL script, which may contain multiple statements.
///
/// An empty script only bumps the version.
#[derive(Debug, Clone)]
pub struct SqlMigration {
    name: String,
    sql: String,
}

impl SqlMigration {
    #[must_use]
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
        }
    }

    /// Load a script from a file.
    ///
    /// # Errors
    /// Returns an error if the file can't be read.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let sql = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("failed to read migration file: {}", path.display()))?;
        Ok(Self::new(path.display().to_string(), sql))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sql.trim().is_empty()
    }
}

#[async_trait]
impl Migration for SqlMigration {
    async fn apply(&self, txn: &mut PgConnection) -> Result<()> {
        if self.is_empty() {
            debug!(name = %self.name, "empty migration script");
            return Ok(());
        }
        // A query without arguments goes through the simple protocol, which allows several statements.
        txn.execute(self.sql.as_str())
            .await
            .wrap_err_with(|| format!("migration script {} failed", self.name))?;
        Ok(())
    }
}
