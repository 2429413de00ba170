use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::Result;
use sqlx::PgPool;
use tracing::info;

use dblock_core::lock::DEFAULT_LOCK_NAMESPACE;
use dblock_core::{LockScheme, SqlMigration, UpgradeOptions, UpgradeOutcome, Upgrader};

#[derive(Parser)]
pub struct Args {
    /// Schema version to upgrade to.
    #[clap(long, env = "SCHEMA_VERSION", value_parser = clap::value_parser!(i32).range(0..))]
    target_version: i32,
    /// SQL script to run inside the upgrade transaction.
    /// Without it, only the version is bumped.
    #[clap(long)]
    sql_file: Option<PathBuf>,
    /// How long to wait for another instance holding the upgrade lock. (seconds)
    #[clap(long, env = "UPGRADE_TIMEOUT", default_value_t = 300)]
    timeout: u64,
    /// Interval between version checks while waiting. (seconds)
    #[clap(long, default_value_t = 5)]
    poll_interval: u64,
    /// Namespace the lock key is derived from.
    /// Need to be unique for each set of instances sharing a database.
    #[clap(long, default_value = DEFAULT_LOCK_NAMESPACE)]
    lock_namespace: String,
    /// Use `base + target version` as lock key instead of a hashed one.
    /// Only use this to interoperate with instances using the additive scheme.
    /// Without a value, the base is 6877.
    #[clap(long, num_args = 0..=1, default_missing_value = "6877", conflicts_with = "lock_namespace")]
    legacy_lock_base: Option<i64>,
}

impl From<&Args> for UpgradeOptions {
    fn from(args: &Args) -> Self {
        let lock_scheme = args.legacy_lock_base.map_or_else(
            || LockScheme::Hashed {
                namespace: args.lock_namespace.clone(),
            },
            |base| LockScheme::Legacy { base },
        );
        Self {
            timeout: Duration::from_secs(args.timeout),
            poll_interval: Duration::from_secs(args.poll_interval),
            lock_scheme,
        }
    }
}

pub async fn upgrade(args: Args, pool: &PgPool) -> Result<()> {
    let migration = match &args.sql_file {
        Some(path) => SqlMigration::from_file(path).await?,
        None => SqlMigration::new("version bump", ""),
    };

    let outcome = Upgrader::new(pool, UpgradeOptions::from(&args))
        .upgrade_if_needed(args.target_version, &migration)
        .await?;
    match outcome {
        UpgradeOutcome::UpToDate { current } => info!(current, "schema is up to date"),
        UpgradeOutcome::CaughtUp { current } => {
            info!(current, "schema was upgraded by another instance");
        }
        UpgradeOutcome::Upgraded { from, to } => info!(from, to, "schema upgraded"),
    }
    Ok(())
}
