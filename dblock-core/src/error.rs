use std::time::Duration;

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of the upgrade protocol.
///
/// A contended lock is not an error: it sends the caller into the waiting path.
#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error("failed to read schema version")]
    VersionRead(#[source] sqlx::Error),
    #[error("failed to check advisory lock")]
    LockCheck(#[source] sqlx::Error),
    #[error("failed to start upgrade transaction")]
    BeginTransaction(#[source] sqlx::Error),
    #[error("failed to apply migration to version {target}")]
    UpgradeExecution {
        target: i32,
        #[source]
        source: BoxError,
    },
    #[error("failed to write schema version {target}")]
    VersionWrite {
        target: i32,
        #[source]
        source: sqlx::Error,
    },
    #[error("failed to commit upgrade to version {target}")]
    Commit {
        target: i32,
        #[source]
        source: sqlx::Error,
    },
    #[error(
        "schema upgrade to version {target} was not completed in {timeout:?} (last seen: {last_seen:?})"
    )]
    Timeout {
        target: i32,
        timeout: Duration,
        last_seen: Option<i32>,
    },
}
