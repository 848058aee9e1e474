//! Engine process supervision
//!
//! The supervisor starts the engine through a relaunched copy of this
//! executable (the helper), which owns the engine's console. Both processes
//! meet on a named shared segment and event, and the whole tree lives in one
//! Job Object so closing it is enough to tear everything down.

pub mod error;
pub mod handoff;
pub mod launcher;
pub mod monitor;
pub mod names;
pub mod supervisor;

#[cfg(windows)]
pub mod handle;
#[cfg(windows)]
pub mod helper;
#[cfg(windows)]
pub mod job;

pub use error::{LaunchStage, SupervisorError};
pub use launcher::{create_launcher, EngineEpisode, EngineExit, EngineLauncher, ExitWatcher};
pub use monitor::{CrashReport, ExitClass};
pub use names::{parse_relaunch_arg, HandoffId};
pub use supervisor::{Supervisor, SupervisorConfig, SupervisorState};
