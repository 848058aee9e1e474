//! Error taxonomy of the supervision subsystem

use std::fmt;
use thiserror::Error;

/// Step of `start()` that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    CreateContainer,
    CreateChannel,
    WriteLaunchArgs,
    SpawnHelper,
    AssignContainer,
    ResumeHelper,
    ReadPayload,
    AdoptEngine,
    ResumeEngine,
    WatchEngine,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            LaunchStage::CreateContainer => "create process container",
            LaunchStage::CreateChannel => "create handoff channel",
            LaunchStage::WriteLaunchArgs => "write launch arguments",
            LaunchStage::SpawnHelper => "spawn helper process",
            LaunchStage::AssignContainer => "assign helper to container",
            LaunchStage::ResumeHelper => "resume helper",
            LaunchStage::ReadPayload => "read handoff payload",
            LaunchStage::AdoptEngine => "open engine handles",
            LaunchStage::ResumeEngine => "resume engine",
            LaunchStage::WatchEngine => "duplicate engine handle",
        };
        f.write_str(text)
    }
}

/// Errors reported by the supervisor and its launcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Engine is already running or starting")]
    AlreadyRunning,

    #[error("Failed to {stage}: {reason}")]
    Setup { stage: LaunchStage, reason: String },

    #[error("Helper exited during setup with code {0:#010X}")]
    HelperExited(u32),

    #[error("Waiting for the helper failed: {reason}")]
    WaitFailed { reason: String },

    #[error("Engine supervision is not supported on this platform")]
    Unsupported,

    #[error("Engine console is not available")]
    NoConsole,

    #[error("Failed to signal the engine: {reason}")]
    Signal { reason: String },
}

impl SupervisorError {
    pub fn setup(stage: LaunchStage, reason: impl fmt::Display) -> Self {
        SupervisorError::Setup {
            stage,
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_message_names_stage() {
        let err = SupervisorError::setup(LaunchStage::AssignContainer, "Access is denied.");
        assert_eq!(
            err.to_string(),
            "Failed to assign helper to container: Access is denied."
        );
    }

    #[test]
    fn test_helper_exit_code_is_hex() {
        let err = SupervisorError::HelperExited(0x8007_0002);
        assert_eq!(err.to_string(), "Helper exited during setup with code 0x80070002");
    }
}
