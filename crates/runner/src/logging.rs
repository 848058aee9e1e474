//! Log file setup shared by the tray process and the helper

use anyhow::{anyhow, Context, Result};
use proxy_tray_core::config;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub const TRAY_LOG: &str = "ProxyTray.log";
pub const HELPER_LOG: &str = "helper.log";

/// Route `tracing` output to `<data>/<file_name>`.
///
/// `RUST_LOG` overrides the default `info` filter. Keep the guard alive for
/// the lifetime of the process or buffered lines are lost.
pub fn init(file_name: &str) -> Result<WorkerGuard> {
    let data_dir = config::get_data_directory().context("Failed to resolve log directory")?;

    let appender = tracing_appender::rolling::never(data_dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_thread_names(true)
        .try_init()
        .map_err(|e| anyhow!("Failed to install log subscriber: {}", e))?;

    Ok(guard)
}
