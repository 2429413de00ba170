//! Database-arbitrated mutual exclusion based on session-level advisory locks.
use blake2::digest::consts::U8;
use blake2::Digest;
use sqlx::{Connection, PgConnection};
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::error::UpgradeError;

/// Namespace used when no other is configured.
pub const DEFAULT_LOCK_NAMESPACE: &str = "schema_version";
/// Base of the additive key scheme used by older deployments.
pub const DEFAULT_LEGACY_BASE: i64 = 6877;

/// Key of a PostgreSQL advisory lock.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LockKey(i64);

impl LockKey {
    /// Derive a key from a namespace and a target version.
    #[must_use]
    pub fn hashed(namespace: &str, target: i32) -> Self {
        Self(generate_key(&format!("{namespace}:{target}")))
    }
    /// Additive key, `base + target`.
    #[must_use]
    pub const fn legacy(base: i64, target: i32) -> Self {
        Self(base.wrapping_add(target as i64))
    }
    #[must_use]
    pub const fn as_i64(self) -> i64 {
        self.0
    }

    /// Try to take the lock on the given session without blocking.
    ///
    /// Returns `None` if another session holds the lock, in which case `conn` is closed.
    ///
    /// # Errors
    /// Returns [`UpgradeError::LockCheck`] if the lock query fails.
    pub async fn try_acquire(
        self,
        mut conn: PgConnection,
    ) -> Result<Option<AdvisoryLockGuard>, UpgradeError> {
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.0)
            .fetch_one(&mut conn)
            .await
            .map_err(UpgradeError::LockCheck)?;
        if !acquired {
            debug!(key = self.0, "advisory lock held by another session");
            close_quietly(conn).await;
            return Ok(None);
        }
        debug!(key = self.0, "advisory lock acquired");
        Ok(Some(AdvisoryLockGuard {
            key: self,
            conn: Some(conn),
        }))
    }
}

/// How lock keys are derived from target versions.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LockScheme {
    /// BLAKE2b of `"{namespace}:{target}"`.
    Hashed { namespace: String },
    /// `base + target`.
    Legacy { base: i64 },
}

impl Default for LockScheme {
    fn default() -> Self {
        Self::Hashed {
            namespace: DEFAULT_LOCK_NAMESPACE.to_string(),
        }
    }
}

impl LockScheme {
    #[must_use]
    pub fn key_for(&self, target: i32) -> LockKey {
        match self {
            Self::Hashed { namespace } => LockKey::hashed(namespace, target),
            Self::Legacy { base } => LockKey::legacy(*base, target),
        }
    }
}

/// An acquired advisory lock together with the session owning it.
///
/// The lock lives as long as the session. Dropping the guard without calling
/// [`AdvisoryLockGuard::release`] closes the session, which makes the server drop the lock.
pub struct AdvisoryLockGuard {
    key: LockKey,
    conn: Option<PgConnection>,
}

impl AdvisoryLockGuard {
    /// The session holding the lock.
    #[allow(clippy::missing_panics_doc)]
    pub fn conn(&mut self) -> &mut PgConnection {
        self.conn.as_mut().expect("lock already released")
    }

    /// Release the lock and close its session.
    ///
    /// Failures are logged only. The session is closed either way, so the lock never outlives this call.
    pub async fn release(mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let key = self.key.0;
        match sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(&mut conn)
            .await
        {
            Ok(true) => debug!(key, "advisory lock released"),
            Ok(false) => warn!(key, "advisory lock is not held by current session"),
            Err(err) => warn!(key, %err, "failed to release advisory lock, closing session"),
        }
        close_quietly(conn).await;
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            warn!(
                key = self.key.0,
                "advisory lock guard dropped without release, closing its session"
            );
            // Outside a runtime the connection is dropped here, which closes the socket.
            if let Ok(handle) = Handle::try_current() {
                handle.spawn(close_quietly(conn));
            }
        }
    }
}

async fn close_quietly(conn: PgConnection) {
    if let Err(err) = conn.close().await {
        debug!(%err, "failed to close lock session");
    }
}

fn generate_key(s: &str) -> i64 {
    let mut hasher = blake2::Blake2b::<U8>::default();
    hasher.update(s.as_bytes());
    i64::from_le_bytes(hasher.finalize().into())
}
