//! Engine lifecycle events delivered to the tray loop, and the restart policy

#![cfg_attr(not(windows), allow(dead_code))]

use crossbeam_channel::Sender;
use proxy_tray_core::control_api::{ControlApi, EngineVersion};
use proxy_tray_core::process::{CrashReport, Supervisor, SupervisorState};
use proxy_tray_core::startup::{self, ReachabilityPolicy, StartupOutcome};
use std::fmt;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Started and the control API answered
    Online {
        process_id: u32,
        version: EngineVersion,
    },
    /// Started and still running, but the control API never answered
    Unreachable { process_id: u32, attempts: u32 },
    /// The episode ended or was replaced before the check finished
    Superseded { process_id: u32 },
    StartFailed(String),
    Crashed(CrashReport),
}

impl EngineEvent {
    /// Engine the event is about, for events tied to one episode
    pub fn process_id(&self) -> Option<u32> {
        match self {
            EngineEvent::Online { process_id, .. }
            | EngineEvent::Unreachable { process_id, .. }
            | EngineEvent::Superseded { process_id } => Some(*process_id),
            EngineEvent::StartFailed(_) | EngineEvent::Crashed(_) => None,
        }
    }
}

/// What the tray shows about the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineStatus {
    Stopped,
    Starting,
    Stopping,
    Online(String),
    Unreachable,
    StartFailed,
    EarlyFailure { exit_code: u32 },
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Stopped => write!(f, "Engine stopped"),
            EngineStatus::Starting => write!(f, "Engine starting..."),
            EngineStatus::Stopping => write!(f, "Engine stopping..."),
            EngineStatus::Online(version) => write!(f, "Engine running ({})", version),
            EngineStatus::Unreachable => write!(f, "Engine started, control API unreachable"),
            EngineStatus::StartFailed => write!(f, "Engine failed to start"),
            EngineStatus::EarlyFailure { exit_code } => {
                write!(f, "Engine exited right after start (code {})", exit_code)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashAction {
    Restart,
    /// Leave it stopped and show the console for diagnostics
    ShowConsole,
    StayStopped,
}

/// What the console menu item does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleAction {
    Show,
    Hide,
    /// Hide a console left over from an early failure by closing its container
    Dismiss,
}

pub fn console_action(state: SupervisorState, visible: bool) -> ConsoleAction {
    match (visible, state) {
        (false, _) => ConsoleAction::Show,
        (true, SupervisorState::Stopped) => ConsoleAction::Dismiss,
        (true, _) => ConsoleAction::Hide,
    }
}

pub fn crash_action(report: &CrashReport, auto_restart: bool) -> CrashAction {
    if report.was_early_failure {
        CrashAction::ShowConsole
    } else if auto_restart {
        CrashAction::Restart
    } else {
        CrashAction::StayStopped
    }
}

/// Start the engine and check its control API on a background thread
pub fn launch_engine(
    supervisor: &Supervisor,
    api: Arc<dyn ControlApi>,
    policy: ReachabilityPolicy,
    events: Sender<EngineEvent>,
) {
    let supervisor = supervisor.clone();
    let spawned = thread::Builder::new()
        .name("engine-start".to_string())
        .spawn(move || {
            let process_id = match supervisor.start() {
                Ok(process_id) => process_id,
                Err(e) => {
                    let _ = events.send(EngineEvent::StartFailed(e.to_string()));
                    return;
                }
            };

            let still_running = || {
                supervisor.state() == SupervisorState::Running
                    && supervisor.engine_process_id() == Some(process_id)
            };
            let outcome =
                startup::wait_until_reachable(api.as_ref(), policy, thread::sleep, &still_running);

            let event = match outcome {
                _ if !still_running() => EngineEvent::Superseded { process_id },
                StartupOutcome::Online { version } => EngineEvent::Online {
                    process_id,
                    version,
                },
                StartupOutcome::Unreachable { attempts } => EngineEvent::Unreachable {
                    process_id,
                    attempts,
                },
                StartupOutcome::EngineExited { .. } => EngineEvent::Superseded { process_id },
            };
            let _ = events.send(event);
        });

    if let Err(e) = spawned {
        tracing::error!("Failed to spawn engine start thread: {}", e);
    }
}
