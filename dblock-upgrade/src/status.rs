use eyre::Result;
use sqlx::PgPool;

use dblock_core::version::current_version;

#[allow(clippy::print_stdout)]
pub async fn status(pool: &PgPool) -> Result<()> {
    let version = current_version(pool).await?;
    println!("{version}");
    Ok(())
}
