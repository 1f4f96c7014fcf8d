use std::{fs::OpenOptions, path::Path, sync::Mutex};

use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global subscriber writing to `log_file`.
///
/// The terminal belongs to the UI, so nothing is written to stdout/stderr.
/// If the file cannot be opened, logging stays disabled.
pub fn init_logging(log_file: &Path) {
    let level = if cfg!(debug_assertions) { "trace" } else { "info" };

    let (filter, defaulted) = match EnvFilter::try_from_default_env() {
        Ok(f) => (f, false),
        Err(_) => (EnvFilter::new(level), true),
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_file) {
        Ok(file) => file,
        Err(_) => return,
    };

    let fmt_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file));

    if tracing_subscriber::registry()
        .with(fmt_layer)
        .with(filter)
        .try_init()
        .is_err()
    {
        warn!("A global tracing subscriber was already installed");
        return;
    }

    if defaulted {
        info!("\"RUST_LOG\" variable not set, defaulting to {level}");
    }
    info!("Logging to {}", log_file.display());
}
