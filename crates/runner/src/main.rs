//! ProxyTray - System Tray Process
//!
//! This process manages:
//! - System tray icon with context menu
//! - The proxy engine's lifecycle through the supervisor
//! - Win32 message loop for tray icon events
//!
//! Started with `--pm={GUID}` it instead runs as the helper that owns the
//! engine's console, and exits with the helper's exit code.

#![windows_subsystem = "windows"]

use anyhow::Result;
use proxy_tray_core::process::{parse_relaunch_arg, HandoffId};
use std::ffi::OsString;

#[cfg(windows)]
mod app;
mod engine_events;
mod logging;
#[cfg(windows)]
mod tray;

/// E_INVALIDARG, returned for a malformed relaunch identifier
const MALFORMED_RELAUNCH_EXIT: u32 = 0x8007_0057;

/// ERROR_NOT_SUPPORTED as HRESULT
#[cfg(not(windows))]
const UNSUPPORTED_EXIT: u32 = 0x8007_0032;

fn main() -> Result<()> {
    if let Some(id) = relaunch_id(std::env::args_os().skip(1)) {
        let code = run_helper(id);
        std::process::exit(code as i32);
    }

    let _guard = logging::init(logging::TRAY_LOG)?;
    run_tray()
}

/// The relaunch flag among `args`; arguments that are not Unicode are never the flag
fn relaunch_id(args: impl IntoIterator<Item = OsString>) -> Option<Option<HandoffId>> {
    args.into_iter()
        .find_map(|arg| arg.to_str().and_then(parse_relaunch_arg))
}

fn run_helper(id: Option<HandoffId>) -> u32 {
    let _guard = logging::init(logging::HELPER_LOG).ok();

    let Some(id) = id else {
        tracing::error!("Malformed relaunch argument");
        return MALFORMED_RELAUNCH_EXIT;
    };
    tracing::info!("Helper starting for {}", id);

    #[cfg(windows)]
    {
        proxy_tray_core::process::helper::run(&id)
    }

    #[cfg(not(windows))]
    {
        tracing::error!("Helper mode requires Windows");
        UNSUPPORTED_EXIT
    }
}

#[cfg(windows)]
fn run_tray() -> Result<()> {
    let result = app::run();
    if let Err(ref e) = result {
        tracing::error!("Fatal: {:#}", e);
        app::report_fatal(e);
    }
    result
}

#[cfg(not(windows))]
fn run_tray() -> Result<()> {
    anyhow::bail!("ProxyTray requires Windows")
}
