#![allow(
    clippy::module_name_repetitions,
    clippy::default_trait_access,
    clippy::future_not_send
)]

pub mod coordinator;
pub mod error;
pub mod lock;
pub mod logging;
pub mod migration;
pub mod version;
pub mod waiter;

pub use coordinator::{UpgradeOptions, UpgradeOutcome, Upgrader, upgrade_if_needed};
pub use error::UpgradeError;
pub use lock::{LockKey, LockScheme};
pub use migration::{Migration, SqlMigration};
