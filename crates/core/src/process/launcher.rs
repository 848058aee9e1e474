//! Launch seam between the supervisor state machine and the OS
//!
//! `EngineLauncher::launch` runs the whole two-stage start (container,
//! handoff channel, suspended helper, adoption of the engine) and hands back
//! one `EngineEpisode`. Dropping the episode closes its container, which is
//! the only teardown path for a launched process tree.

use std::time::Duration;

use super::error::SupervisorError;
use crate::launch_spec::LaunchSpec;

/// How the engine ended, as seen by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineExit {
    pub exit_code: u32,
    /// Time between process creation and exit
    pub lifetime: Duration,
}

/// Blocking wait for the engine to exit, owned by the monitor thread
pub trait ExitWatcher: Send {
    fn wait(self: Box<Self>) -> Result<EngineExit, SupervisorError>;
}

/// One running engine together with its container
pub trait EngineEpisode: Send {
    fn process_id(&self) -> u32;

    /// Ask the helper to deliver an interrupt to the engine
    fn request_interrupt(&self) -> Result<(), SupervisorError>;

    /// Independent watcher on the engine process
    fn exit_watcher(&self) -> Result<Box<dyn ExitWatcher>, SupervisorError>;

    fn set_console_visible(&self, visible: bool) -> Result<(), SupervisorError>;

    fn is_console_visible(&self) -> bool;
}

/// Starts engine episodes
pub trait EngineLauncher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineEpisode>, SupervisorError>;
}

/// Launcher for the current platform, relaunching the running executable as helper
pub fn create_launcher() -> Result<Box<dyn EngineLauncher>, SupervisorError> {
    #[cfg(windows)]
    {
        let launcher = windows_impl::JobLauncher::current()?;
        Ok(Box::new(launcher))
    }

    #[cfg(not(windows))]
    {
        Err(SupervisorError::Unsupported)
    }
}

#[cfg(windows)]
pub use windows_impl::{HandleExitWatcher, JobEpisode, JobLauncher};

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::launch_spec::{helper_command_line, to_wide};
    use crate::process::error::LaunchStage;
    use crate::process::handle::{self, KernelHandle, ProcessHandles, StartupWindow};
    use crate::process::handoff::{
        mark_adopted, read_payload, segment_size, wait_ready, write_launch_args, NamedEvent,
        SharedSegment, WaitOutcome,
    };
    use crate::process::job::JobObject;
    use crate::process::names::{HandoffId, KernelObjectNames};
    use std::ffi::OsStr;
    use std::path::{Path, PathBuf};
    use windows::Win32::Foundation::HWND;
    use windows::Win32::System::Diagnostics::Debug::{
        SetErrorMode, SEM_FAILCRITICALERRORS, SEM_NOGPFAULTERRORBOX, THREAD_ERROR_MODE,
    };
    use windows::Win32::System::Threading::{TerminateProcess, INFINITE};
    use windows::Win32::UI::WindowsAndMessaging::{IsWindowVisible, ShowWindow, SW_HIDE, SW_SHOW};

    /// Suppresses Windows Error Reporting dialogs for children created while alive
    struct ErrorModeGuard(u32);

    impl ErrorModeGuard {
        fn quiet() -> Self {
            let previous = unsafe { SetErrorMode(SEM_FAILCRITICALERRORS | SEM_NOGPFAULTERRORBOX) };
            Self(previous)
        }
    }

    impl Drop for ErrorModeGuard {
        fn drop(&mut self) {
            unsafe {
                SetErrorMode(THREAD_ERROR_MODE(self.0));
            }
        }
    }

    /// Launches the engine through a relaunched helper inside a Job Object
    pub struct JobLauncher {
        helper_exe: PathBuf,
    }

    impl JobLauncher {
        pub fn new(helper_exe: impl Into<PathBuf>) -> Self {
            Self {
                helper_exe: helper_exe.into(),
            }
        }

        /// Use the running executable as helper
        pub fn current() -> Result<Self, SupervisorError> {
            let exe = std::env::current_exe()
                .map_err(|e| SupervisorError::setup(LaunchStage::SpawnHelper, e))?;
            Ok(Self::new(exe))
        }

        /// Run the handoff for an explicit executable and command line
        pub fn launch_command(
            &self,
            engine_exe: &Path,
            command_line: &OsStr,
        ) -> Result<JobEpisode, SupervisorError> {
            let job = JobObject::create()
                .map_err(|e| SupervisorError::setup(LaunchStage::CreateContainer, e))?;

            let id = HandoffId::generate();
            let names = KernelObjectNames::derive(&id);
            tracing::debug!("Handoff objects: {} / {}", names.segment, names.event);

            let exe_wide = to_wide(engine_exe.as_os_str());
            let cmd_wide = to_wide(command_line);

            let mut segment =
                SharedSegment::create(&names.segment, segment_size(&exe_wide, &cmd_wide))
                    .map_err(|e| SupervisorError::setup(LaunchStage::CreateChannel, e))?;
            let event = NamedEvent::create(&names.event)
                .map_err(|e| SupervisorError::setup(LaunchStage::CreateChannel, e))?;

            write_launch_args(segment.bytes_mut(), &exe_wide, &cmd_wide)
                .map_err(|e| SupervisorError::setup(LaunchStage::WriteLaunchArgs, e))?;

            let helper_exe = to_wide(self.helper_exe.as_os_str());
            let helper_cmd = to_wide(&helper_command_line(&self.helper_exe, &id));
            let helper = {
                let _quiet = ErrorModeGuard::quiet();
                ProcessHandles::spawn_suspended(&helper_exe, &helper_cmd, StartupWindow::Hidden)
                    .map_err(|e| SupervisorError::setup(LaunchStage::SpawnHelper, e))?
            };
            tracing::info!("Helper started suspended (pid {})", helper.process_id);

            // Suspended and outside the job: must not survive a failed assignment
            if let Err(e) = job.assign(&helper.process) {
                unsafe {
                    let _ = TerminateProcess(helper.process.raw(), 1);
                }
                return Err(SupervisorError::setup(LaunchStage::AssignContainer, e));
            }
            helper
                .resume()
                .map_err(|e| SupervisorError::setup(LaunchStage::ResumeHelper, e))?;

            match wait_ready(&event, &helper.process, INFINITE) {
                WaitOutcome::Ready => {}
                WaitOutcome::OtherExited => {
                    let code = handle::exit_code(&helper.process).map_err(|e| {
                        SupervisorError::WaitFailed {
                            reason: e.to_string(),
                        }
                    })?;
                    tracing::warn!("Helper exited before ready with code {:#010X}", code);
                    return Err(SupervisorError::HelperExited(code));
                }
                WaitOutcome::Failed(reason) => return Err(SupervisorError::WaitFailed { reason }),
                WaitOutcome::TimedOut => {
                    return Err(SupervisorError::WaitFailed {
                        reason: "timed out".to_string(),
                    })
                }
            }

            let payload = read_payload(segment.bytes())
                .map_err(|e| SupervisorError::setup(LaunchStage::ReadPayload, e))?;
            // Ready was consumed; from now on the event carries stop requests
            mark_adopted(segment.bytes_mut())
                .map_err(|e| SupervisorError::setup(LaunchStage::ReadPayload, e))?;
            drop(segment);

            let engine = ProcessHandles::open(payload.process_id, payload.thread_id)
                .map_err(|e| SupervisorError::setup(LaunchStage::AdoptEngine, e))?;
            engine
                .resume()
                .map_err(|e| SupervisorError::setup(LaunchStage::ResumeEngine, e))?;

            tracing::info!(
                "Engine adopted (pid {}, tid {})",
                engine.process_id,
                engine.thread_id
            );

            Ok(JobEpisode {
                _job: job,
                engine,
                _helper: helper,
                event,
                console_window: payload.console_window,
            })
        }
    }

    impl EngineLauncher for JobLauncher {
        fn launch(&self, spec: &LaunchSpec) -> Result<Box<dyn EngineEpisode>, SupervisorError> {
            let episode = self.launch_command(&spec.engine_path, &spec.engine_command_line())?;
            Ok(Box::new(episode))
        }
    }

    /// A running engine inside its Job Object
    pub struct JobEpisode {
        // Declared first so the tree is killed before the handles are closed
        _job: JobObject,
        engine: ProcessHandles,
        _helper: ProcessHandles,
        event: NamedEvent,
        console_window: usize,
    }

    impl JobEpisode {
        fn console(&self) -> Option<HWND> {
            (self.console_window != 0).then(|| HWND(self.console_window as isize))
        }
    }

    impl EngineEpisode for JobEpisode {
        fn process_id(&self) -> u32 {
            self.engine.process_id
        }

        fn request_interrupt(&self) -> Result<(), SupervisorError> {
            self.event.signal().map_err(|e| SupervisorError::Signal {
                reason: e.to_string(),
            })
        }

        fn exit_watcher(&self) -> Result<Box<dyn ExitWatcher>, SupervisorError> {
            let process = self
                .engine
                .process
                .duplicate()
                .map_err(|e| SupervisorError::setup(LaunchStage::WatchEngine, e))?;
            Ok(Box::new(HandleExitWatcher { process }))
        }

        fn set_console_visible(&self, visible: bool) -> Result<(), SupervisorError> {
            let window = self.console().ok_or(SupervisorError::NoConsole)?;
            let command = if visible { SW_SHOW } else { SW_HIDE };
            unsafe {
                let _ = ShowWindow(window, command);
            }
            Ok(())
        }

        fn is_console_visible(&self) -> bool {
            self.console()
                .map(|window| unsafe { IsWindowVisible(window).as_bool() })
                .unwrap_or(false)
        }
    }

    /// Waits on a duplicated engine process handle
    pub struct HandleExitWatcher {
        process: KernelHandle,
    }

    impl ExitWatcher for HandleExitWatcher {
        fn wait(self: Box<Self>) -> Result<EngineExit, SupervisorError> {
            self.process
                .wait()
                .map_err(|e| SupervisorError::WaitFailed {
                    reason: e.to_string(),
                })?;

            let exit_code = handle::exit_code(&self.process).map_err(|e| {
                SupervisorError::WaitFailed {
                    reason: e.to_string(),
                }
            })?;
            let lifetime = handle::lifetime(&self.process).map_err(|e| {
                SupervisorError::WaitFailed {
                    reason: e.to_string(),
                }
            })?;

            Ok(EngineExit {
                exit_code,
                lifetime,
            })
        }
    }
}
