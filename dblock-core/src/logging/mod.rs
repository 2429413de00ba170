use std::env;
use std::panic::{self, PanicHookInfo};

use tracing::error;
use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use opts::LogFormat;

mod opts;

/// Default directives when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,sqlx=warn";

fn tracing_panic_hook(panic_info: &PanicHookInfo) {
    let payload = panic_info.payload();

    let payload = payload.downcast_ref::<&str>().map_or_else(
        || payload.downcast_ref::<String>().map(String::as_str),
        |s| Some(&**s),
    );

    let location = panic_info.location().map(ToString::to_string);
    let backtrace = backtrace::Backtrace::new();

    error!(
        panic.payload = payload,
        panic.location = location,
        panic.backtrace = ?backtrace,
        "A panic occurred",
    );
}

fn format_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match format {
        LogFormat::Human => layer.boxed(),
        LogFormat::JSON => layer.json().boxed(),
    }
}

/// Init logger with `tracing_subscriber`, setup eyre trace helper and panic handler.
///
/// This must be called after eyre setup or panic handler will not work.
///
/// # Panics
/// Panics if a global subscriber has already been set.
pub fn init_logger(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::Registry::default()
        .with(format_layer(format))
        .with(filter)
        .with(ErrorLayer::default())
        .init();

    let prev_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        tracing_panic_hook(panic_info);
        prev_hook(panic_info);
    }));
}

/// Initialize color-eyre error handling, with `NO_COLOR` support.
///
/// # Errors
/// Returns an error if `color-eyre` has already been initialized.
pub fn init_color_eyre() -> eyre::Result<()> {
    if env::var("NO_COLOR").is_ok() {
        color_eyre::config::HookBuilder::new()
            .theme(color_eyre::config::Theme::new())
            .install()?;
    } else {
        color_eyre::install()?;
    }
    Ok(())
}
