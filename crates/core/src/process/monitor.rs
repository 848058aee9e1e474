//! Crash/health monitor
//!
//! One thread per episode blocks on the engine process and reports how it
//! ended. Classification is a pure function of the supervisor state at exit
//! and the engine's lifetime.

use std::io;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::launcher::{EngineExit, ExitWatcher};
use super::supervisor::SupervisorState;

/// Lifetime below which an exit counts as an early failure
pub const DEFAULT_EARLY_FAILURE_THRESHOLD: Duration = Duration::from_millis(3000);

/// How an engine exit is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit after `stop()`; never reported as a crash
    ManualStop,
    /// Died almost immediately, likely a bad config or binary
    EarlyFailure,
    /// Died after running normally
    RuntimeCrash,
}

/// Delivered to the crash handler for every unexpected engine exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashReport {
    pub exit_code: u32,
    pub lifetime: Duration,
    pub was_early_failure: bool,
}

pub fn classify_exit(state: SupervisorState, lifetime: Duration, threshold: Duration) -> ExitClass {
    if state == SupervisorState::WaitingForManualStop {
        ExitClass::ManualStop
    } else if lifetime < threshold {
        ExitClass::EarlyFailure
    } else {
        ExitClass::RuntimeCrash
    }
}

/// Span between two FILETIME tick counts (100 ns units)
pub fn filetime_span(creation_ticks: u64, exit_ticks: u64) -> Duration {
    let ticks = exit_ticks.saturating_sub(creation_ticks);
    Duration::from_micros(ticks / 10) + Duration::from_nanos((ticks % 10) * 100)
}

/// Start the monitor thread for one episode
pub fn spawn<F>(
    episode_id: u64,
    watcher: Box<dyn ExitWatcher>,
    on_exit: F,
) -> io::Result<JoinHandle<()>>
where
    F: FnOnce(EngineExit) + Send + 'static,
{
    let started = Instant::now();
    thread::Builder::new()
        .name(format!("engine-monitor-{}", episode_id))
        .spawn(move || {
            let exit = watcher.wait().unwrap_or_else(|e| {
                tracing::error!("Engine wait failed, treating as exit: {}", e);
                EngineExit {
                    exit_code: u32::MAX,
                    lifetime: started.elapsed(),
                }
            });
            tracing::debug!("Episode {} engine exited: {:?}", episode_id, exit);
            on_exit(exit);
        })
}
