//! Process group container backed by a Win32 Job Object
//!
//! Closing the job terminates every process assigned to it, including the
//! engine the helper spawned, because children inherit job membership.

use windows::core::{Result, PCWSTR};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};

use super::handle::KernelHandle;

/// Anonymous job configured to kill its members on close
pub struct JobObject {
    handle: KernelHandle,
}

impl JobObject {
    pub fn create() -> Result<Self> {
        let handle = KernelHandle::from_raw(unsafe { CreateJobObjectW(None, PCWSTR::null())? });

        let mut info = JOBOBJECT_EXTENDED_LIMIT_INFORMATION::default();
        info.BasicLimitInformation.LimitFlags =
            JOB_OBJECT_LIMIT_DIE_ON_UNHANDLED_EXCEPTION | JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

        unsafe {
            SetInformationJobObject(
                handle.raw(),
                JobObjectExtendedLimitInformation,
                &info as *const _ as *const std::ffi::c_void,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )?;
        }

        Ok(Self { handle })
    }

    /// Put `process` in the job. Must happen before the process runs any code.
    pub fn assign(&self, process: &KernelHandle) -> Result<()> {
        unsafe { AssignProcessToJobObject(self.handle.raw(), process.raw()) }
    }
}
