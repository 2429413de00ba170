use clap::{Parser, Subcommand};
use sqlx::PgPool;

use dblock_core::logging::{LogFormat, init_color_eyre, init_logger};

use crate::status::status;
use crate::upgrade::upgrade;

mod status;
mod upgrade;

/// Coordinated one-time schema upgrades for instances sharing a PostgreSQL database.
#[derive(Parser)]
pub struct Args {
    /// Database URL.
    #[clap(long, env = "DATABASE_URL", global = true)]
    db_url: Option<String>,
    /// Log format.
    #[clap(long, value_enum, default_value_t = LogFormat::Human, global = true)]
    log_format: LogFormat,
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upgrade the schema to a target version, unless another instance already did.
    Upgrade(upgrade::Args),
    /// Print the current schema version.
    Status,
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    init_color_eyre()?;
    drop(dotenvy::dotenv());

    let args = Args::parse();
    init_logger(args.log_format);

    let Some(db_url) = args.db_url else {
        eyre::bail!("missing database url, pass --db-url or set DATABASE_URL");
    };
    let pool = PgPool::connect(&db_url).await?;

    match args.cmd {
        Command::Upgrade(args) => upgrade(args, &pool).await?,
        Command::Status => status(&pool).await?,
    }

    pool.close().await;
    Ok(())
}
