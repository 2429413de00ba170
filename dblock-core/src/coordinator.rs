//! Coordinates a one-time schema upgrade between instances sharing a database.
//!
//! The protocol:
//! 1. Read the version. If it already reached the target, return.
//! 2. Try to take the advisory lock for the target, without blocking.
//! 3. If another instance holds it, poll the version until it reaches the target or time runs out.
//! 4. Otherwise read the version again under the lock, since a peer may have finished in between.
//! 5. Apply the migration and write the new version in one transaction, then release the lock.
use std::time::Duration;

use sqlx::{Acquire, PgConnection, PgPool, Postgres, Transaction};
use tracing::{info, instrument, warn};

use crate::error::UpgradeError;
use crate::lock::LockScheme;
use crate::migration::Migration;
use crate::version::{current_version, get_version, set_version};
use crate::waiter::PeerWaiter;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct UpgradeOptions {
    /// How long to wait for a peer holding the lock.
    pub timeout: Duration,
    /// Interval between version reads while waiting.
    pub poll_interval: Duration,
    pub lock_scheme: LockScheme,
}

impl Default for UpgradeOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            lock_scheme: LockScheme::default(),
        }
    }
}

/// Which way a successful call went.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum UpgradeOutcome {
    /// The schema was already at or beyond the target.
    UpToDate { current: i32 },
    /// Another instance performed the upgrade while this one waited.
    CaughtUp { current: i32 },
    /// This instance performed the upgrade.
    Upgraded { from: i32, to: i32 },
}

pub struct Upgrader<'a> {
    pool: &'a PgPool,
    options: UpgradeOptions,
}

impl<'a> Upgrader<'a> {
    #[must_use]
    pub const fn new(pool: &'a PgPool, options: UpgradeOptions) -> Self {
        Self { pool, options }
    }

    /// Bring the schema to `target`, running `migration` at most once across all instances.
    ///
    /// # Errors
    /// Returns an error if the version can't be read, the lock can't be checked, the
    /// migration or its commit fails, or a peer doesn't finish before the timeout.
    #[instrument(skip(self, migration))]
    pub async fn upgrade_if_needed<M: Migration + ?Sized>(
        &self,
        target: i32,
        migration: &M,
    ) -> Result<UpgradeOutcome, UpgradeError> {
        let current = current_version(self.pool).await?;
        if current >= target {
            info!(current, "no upgrade needed");
            return Ok(UpgradeOutcome::UpToDate { current });
        }

        let key = self.options.lock_scheme.key_for(target);
        // Advisory locks belong to a session, so the lock gets a connection of its own.
        let conn = self
            .pool
            .acquire()
            .await
            .map_err(UpgradeError::LockCheck)?
            .detach();
        let Some(mut guard) = key.try_acquire(conn).await? else {
            info!(
                key = key.as_i64(),
                "another instance is handling the upgrade, waiting"
            );
            let current = PeerWaiter::new(self.options.timeout, self.options.poll_interval)
                .wait_for(self.pool, target)
                .await?;
            return Ok(UpgradeOutcome::CaughtUp { current });
        };

        let result = upgrade_locked(guard.conn(), target, migration).await;
        guard.release().await;
        result
    }
}

/// Bring the schema on `pool` to `target` with default options and the given wait timeout.
///
/// # Errors
/// See [`Upgrader::upgrade_if_needed`].
pub async fn upgrade_if_needed<M: Migration + ?Sized>(
    pool: &PgPool,
    target: i32,
    migration: &M,
    timeout: Duration,
) -> Result<UpgradeOutcome, UpgradeError> {
    let options = UpgradeOptions {
        timeout,
        ..UpgradeOptions::default()
    };
    Upgrader::new(pool, options)
        .upgrade_if_needed(target, migration)
        .await
}

/// Run the upgrade on the session holding the lock.
async fn upgrade_locked<M: Migration + ?Sized>(
    conn: &mut PgConnection,
    target: i32,
    migration: &M,
) -> Result<UpgradeOutcome, UpgradeError> {
    let current = get_version(conn).await?;
    if current >= target {
        info!(current, "another instance already upgraded the schema");
        return Ok(UpgradeOutcome::UpToDate { current });
    }

    info!(from = current, to = target, "upgrading schema");
    let mut txn = conn
        .begin()
        .await
        .map_err(UpgradeError::BeginTransaction)?;

    if let Err(err) = migration.apply(&mut txn).await {
        warn!(?err, "migration failed, rolling back");
        rollback(txn).await;
        return Err(UpgradeError::UpgradeExecution {
            target,
            source: err.into(),
        });
    }
    if let Err(source) = set_version(&mut txn, target).await {
        warn!(%source, "failed to write schema version, rolling back");
        rollback(txn).await;
        return Err(UpgradeError::VersionWrite { target, source });
    }
    txn.commit()
        .await
        .map_err(|source| UpgradeError::Commit { target, source })?;

    info!(version = target, "upgrade complete");
    Ok(UpgradeOutcome::Upgraded {
        from: current,
        to: target,
    })
}

async fn rollback(txn: Transaction<'_, Postgres>) {
    if let Err(err) = txn.rollback().await {
        warn!(%err, "failed to roll back upgrade transaction");
    }
}

#[cfg(test)]
mod tests {
    mod db_required {
        use std::time::{Duration, Instant};

        use sqlx::PgPool;

        use crate::coordinator::{
            UpgradeOptions, UpgradeOutcome, Upgrader, upgrade_if_needed, upgrade_locked,
        };
        use crate::error::UpgradeError;
        use crate::lock::{LockKey, LockScheme};
        use crate::migration::SqlMigration;
        use crate::tests::{
            CountingMigration, FailingMigration, hold_lock, lock_is_free, test_init_logger,
        };
        use crate::version::current_version;

        fn fast_options() -> UpgradeOptions {
            UpgradeOptions {
                timeout: Duration::from_secs(10),
                poll_interval: Duration::from_millis(100),
                ..UpgradeOptions::default()
            }
        }

        async fn table_exists(pool: &PgPool, name: &str) -> bool {
            sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
                .bind(name)
                .fetch_one(pool)
                .await
                .expect("to_regclass")
        }

        #[sqlx::test(migrations = false)]
        async fn must_upgrade_fresh_database(pool: PgPool) {
            test_init_logger();
            let migration = CountingMigration::new().with_sql("CREATE TABLE widgets (id INT)");

            let outcome = upgrade_if_needed(&pool, 1, &migration, Duration::from_secs(10))
                .await
                .expect("upgrade");

            assert_eq!(outcome, UpgradeOutcome::Upgraded { from: 0, to: 1 });
            assert_eq!(migration.calls(), 1);
            assert_eq!(current_version(&pool).await.expect("version"), 1);
            assert!(table_exists(&pool, "widgets").await);
            assert!(lock_is_free(&pool, LockScheme::default().key_for(1)).await);
        }

        #[sqlx::test(migrations = false)]
        async fn must_skip_lock_when_up_to_date(pool: PgPool) {
            test_init_logger();
            let upgrader = Upgrader::new(&pool, fast_options());
            upgrader
                .upgrade_if_needed(2, &SqlMigration::new("bump", ""))
                .await
                .expect("bump to 2");

            // Had the lock been attempted, this call would end up waiting.
            let peer = hold_lock(&pool, LockScheme::default().key_for(1)).await;
            let migration = CountingMigration::new();
            let outcome = upgrader
                .upgrade_if_needed(1, &migration)
                .await
                .expect("no-op");
            peer.release().await;

            assert_eq!(outcome, UpgradeOutcome::UpToDate { current: 2 });
            assert_eq!(migration.calls(), 0);
            assert_eq!(current_version(&pool).await.expect("version"), 2);
        }

        #[sqlx::test(migrations = false)]
        async fn must_run_migration_once_under_race(pool: PgPool) {
            test_init_logger();
            let migration = CountingMigration::new()
                .with_sql("CREATE TABLE widgets (id INT)")
                .with_delay(Duration::from_millis(500));
            let a = Upgrader::new(&pool, fast_options());
            let b = Upgrader::new(&pool, fast_options());

            let (ra, rb) = tokio::join!(
                a.upgrade_if_needed(1, &migration),
                b.upgrade_if_needed(1, &migration)
            );
            let outcomes = [ra.expect("a"), rb.expect("b")];

            assert_eq!(migration.calls(), 1);
            assert_eq!(
                outcomes
                    .iter()
                    .filter(|o| matches!(o, UpgradeOutcome::Upgraded { .. }))
                    .count(),
                1
            );
            assert_eq!(current_version(&pool).await.expect("version"), 1);
        }

        #[sqlx::test(migrations = false)]
        async fn must_roll_back_failed_migration(pool: PgPool) {
            test_init_logger();
            let err = Upgrader::new(&pool, fast_options())
                .upgrade_if_needed(1, &FailingMigration("CREATE TABLE widgets (id INT)"))
                .await
                .expect_err("must fail");

            assert!(matches!(
                err,
                UpgradeError::UpgradeExecution { target: 1, .. }
            ));
            assert_eq!(current_version(&pool).await.expect("version"), 0);
            assert!(!table_exists(&pool, "widgets").await);
            assert!(lock_is_free(&pool, LockScheme::default().key_for(1)).await);
        }

        #[sqlx::test(migrations = false)]
        async fn must_roll_back_failed_version_write(pool: PgPool) {
            test_init_logger();
            // The migration itself succeeds, but forbids the version it is about to be stamped with.
            let migration = CountingMigration::new().with_sql(
                "ALTER TABLE schema_version ADD CONSTRAINT version_below_one CHECK (version < 1)",
            );

            let err = Upgrader::new(&pool, fast_options())
                .upgrade_if_needed(1, &migration)
                .await
                .expect_err("must fail");

            assert!(matches!(err, UpgradeError::VersionWrite { target: 1, .. }));
            assert_eq!(migration.calls(), 1);
            assert_eq!(current_version(&pool).await.expect("version"), 0);
            let constraint_left: bool = sqlx::query_scalar(
                "SELECT EXISTS (SELECT 1 FROM pg_constraint WHERE conname = 'version_below_one')",
            )
            .fetch_one(&pool)
            .await
            .expect("pg_constraint");
            assert!(!constraint_left);
            assert!(lock_is_free(&pool, LockScheme::default().key_for(1)).await);
        }

        #[sqlx::test(migrations = false)]
        async fn must_run_in_spawned_task(pool: PgPool) {
            test_init_logger();
            let handle = tokio::spawn({
                let pool = pool.clone();
                async move {
                    let migration = SqlMigration::new("bump", "");
                    upgrade_if_needed(&pool, 1, &migration, Duration::from_secs(10)).await
                }
            });

            let outcome = handle.await.expect("join").expect("upgrade");
            assert_eq!(outcome, UpgradeOutcome::Upgraded { from: 0, to: 1 });
            assert_eq!(current_version(&pool).await.expect("version"), 1);
        }

        #[sqlx::test(migrations = false)]
        async fn must_time_out_when_peer_stalls(pool: PgPool) {
            test_init_logger();
            let options = UpgradeOptions {
                timeout: Duration::from_millis(300),
                poll_interval: Duration::from_millis(100),
                lock_scheme: LockScheme::Legacy { base: 6877 },
            };
            let peer = hold_lock(&pool, LockKey::legacy(6877, 1)).await;
            let migration = CountingMigration::new();

            let start = Instant::now();
            let err = Upgrader::new(&pool, options)
                .upgrade_if_needed(1, &migration)
                .await
                .expect_err("must time out");
            let elapsed = start.elapsed();
            peer.release().await;

            assert!(matches!(
                err,
                UpgradeError::Timeout {
                    target: 1,
                    last_seen: Some(0),
                    ..
                }
            ));
            assert!(elapsed >= Duration::from_millis(300), "{elapsed:?}");
            // One poll interval plus slack for the database round trips.
            assert!(elapsed < Duration::from_millis(1400), "{elapsed:?}");
            assert_eq!(migration.calls(), 0);
        }

        #[sqlx::test(migrations = false)]
        async fn must_catch_up_with_peer(pool: PgPool) {
            test_init_logger();
            let key = LockScheme::default().key_for(1);
            let mut peer = hold_lock(&pool, key).await;
            let migration = CountingMigration::new();

            let waiting = tokio::spawn({
                let pool = pool.clone();
                async move {
                    let migration = CountingMigration::new();
                    let outcome = Upgrader::new(&pool, fast_options())
                        .upgrade_if_needed(1, &migration)
                        .await;
                    (outcome, migration.calls())
                }
            });

            tokio::time::sleep(Duration::from_millis(300)).await;
            let outcome = upgrade_locked(peer.conn(), 1, &migration)
                .await
                .expect("peer upgrade");
            assert_eq!(outcome, UpgradeOutcome::Upgraded { from: 0, to: 1 });
            peer.release().await;

            let (outcome, calls) = waiting.await.expect("join");
            assert_eq!(outcome.expect("wait"), UpgradeOutcome::CaughtUp { current: 1 });
            assert_eq!(calls, 0);
        }

        #[sqlx::test(migrations = false)]
        async fn must_double_check_under_lock(pool: PgPool) {
            test_init_logger();
            Upgrader::new(&pool, fast_options())
                .upgrade_if_needed(1, &SqlMigration::new("bump", ""))
                .await
                .expect("bump to 1");

            let mut guard = hold_lock(&pool, LockScheme::default().key_for(1)).await;
            let migration = CountingMigration::new();
            let outcome = upgrade_locked(guard.conn(), 1, &migration)
                .await
                .expect("double check");
            guard.release().await;

            assert_eq!(outcome, UpgradeOutcome::UpToDate { current: 1 });
            assert_eq!(migration.calls(), 0);
        }
    }
}
