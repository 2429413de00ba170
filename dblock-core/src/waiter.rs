//! Waiting for a peer to finish an upgrade.
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument};

use crate::error::UpgradeError;

/// Somewhere the current schema version can be read from.
#[async_trait]
pub trait VersionSource: Send + Sync {
    async fn current_version(&self) -> Result<i32, UpgradeError>;
}

#[async_trait]
impl VersionSource for PgPool {
    async fn current_version(&self) -> Result<i32, UpgradeError> {
        crate::version::current_version(self).await
    }
}

/// Polls a [`VersionSource`] at a fixed interval until a target version shows up or a deadline passes.
#[derive(Debug, Copy, Clone)]
pub struct PeerWaiter {
    timeout: Duration,
    interval: Duration,
}

impl PeerWaiter {
    #[must_use]
    pub const fn new(timeout: Duration, interval: Duration) -> Self {
        Self { timeout, interval }
    }

    /// Wait until `source` reports at least `target`, returning the version observed.
    ///
    /// Sleeps before every read, so a timeout is reported no earlier than the deadline
    /// and at most one interval after it.
    ///
    /// # Errors
    /// Returns [`UpgradeError::Timeout`] if the deadline elapses, or the first read error.
    #[instrument(skip(self, source))]
    pub async fn wait_for<S: VersionSource + ?Sized>(
        &self,
        source: &S,
        target: i32,
    ) -> Result<i32, UpgradeError> {
        let deadline = Instant::now() + self.timeout;
        let mut last_seen = None;
        while Instant::now() < deadline {
            time::sleep(self.interval).await;

            let version = source.current_version().await?;
            if version >= target {
                info!(version, "schema was upgraded by another instance");
                return Ok(version);
            }
            debug!(version, target, "still waiting for peer");
            last_seen = Some(version);
        }

        Err(UpgradeError::Timeout {
            target,
            timeout: self.timeout,
            last_seen,
        })
    }
}
