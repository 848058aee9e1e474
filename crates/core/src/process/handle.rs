//! Owned Win32 handles and the process operations built on them

use std::time::Duration;
use windows::core::{Error, Result, PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, DUPLICATE_SAME_ACCESS, ERROR_TIMEOUT, FILETIME, HANDLE,
    WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::System::Threading::{
    CreateProcessW, GetCurrentProcess, GetExitCodeProcess, GetProcessTimes, OpenProcess,
    OpenThread, ResumeThread, WaitForSingleObject, CREATE_SUSPENDED, INFINITE,
    PROCESS_ALL_ACCESS, PROCESS_INFORMATION, STARTF_FORCEOFFFEEDBACK, STARTF_USESHOWWINDOW,
    STARTUPINFOW, THREAD_ALL_ACCESS,
};
use windows::Win32::UI::WindowsAndMessaging::SW_HIDE;

use super::monitor::filetime_span;

/// A handle that is closed exactly once, on drop
#[derive(Debug)]
pub struct KernelHandle(HANDLE);

// SAFETY: kernel handles are process-wide values, usable from any thread
unsafe impl Send for KernelHandle {}
unsafe impl Sync for KernelHandle {}

impl KernelHandle {
    /// Take ownership of `handle`
    pub fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }

    /// Independent handle to the same object, closed separately
    pub fn duplicate(&self) -> Result<Self> {
        let mut target = HANDLE::default();
        unsafe {
            let current = GetCurrentProcess();
            DuplicateHandle(
                current,
                self.0,
                current,
                &mut target,
                0,
                false,
                DUPLICATE_SAME_ACCESS,
            )?;
        }
        Ok(Self(target))
    }

    /// Block until the object is signaled
    pub fn wait(&self) -> Result<()> {
        if self.wait_timeout(INFINITE)? {
            Ok(())
        } else {
            Err(Error::from(ERROR_TIMEOUT.to_hresult()))
        }
    }

    /// Whether the object became signaled within `timeout_ms`
    pub fn wait_timeout(&self, timeout_ms: u32) -> Result<bool> {
        let status = unsafe { WaitForSingleObject(self.0, timeout_ms) };
        match status.0 {
            s if s == WAIT_OBJECT_0.0 => Ok(true),
            s if s == WAIT_TIMEOUT.0 => Ok(false),
            _ => Err(Error::from_win32()),
        }
    }
}

impl Drop for KernelHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

/// How a new process shows its first window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupWindow {
    /// Whatever the child would do on its own
    Default,
    /// Start hidden, including a console the child allocates itself,
    /// and without the busy cursor
    Hidden,
}

fn startup_info(window: StartupWindow) -> STARTUPINFOW {
    let mut startup = STARTUPINFOW {
        cb: std::mem::size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    if window == StartupWindow::Hidden {
        startup.dwFlags = STARTF_USESHOWWINDOW | STARTF_FORCEOFFFEEDBACK;
        startup.wShowWindow = SW_HIDE.0 as u16;
    }
    startup
}

/// Process and primary thread of a child
pub struct ProcessHandles {
    pub process: KernelHandle,
    pub thread: KernelHandle,
    pub process_id: u32,
    pub thread_id: u32,
}

impl ProcessHandles {
    /// Start `application` with its primary thread suspended
    pub fn spawn_suspended(
        application: &[u16],
        command_line: &[u16],
        window: StartupWindow,
    ) -> Result<Self> {
        let application: Vec<u16> = application.iter().copied().chain(Some(0)).collect();
        // CreateProcessW may write into the command line buffer
        let mut command_line: Vec<u16> = command_line.iter().copied().chain(Some(0)).collect();

        let startup = startup_info(window);
        let mut info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                CREATE_SUSPENDED,
                None,
                PCWSTR::null(),
                &startup,
                &mut info,
            )?;
        }

        Ok(Self {
            process: KernelHandle::from_raw(info.hProcess),
            thread: KernelHandle::from_raw(info.hThread),
            process_id: info.dwProcessId,
            thread_id: info.dwThreadId,
        })
    }

    /// Open an already running process by id
    pub fn open(process_id: u32, thread_id: u32) -> Result<Self> {
        let process = KernelHandle::from_raw(unsafe { OpenProcess(PROCESS_ALL_ACCESS, false, process_id)? });
        let thread = KernelHandle::from_raw(unsafe { OpenThread(THREAD_ALL_ACCESS, false, thread_id)? });

        Ok(Self {
            process,
            thread,
            process_id,
            thread_id,
        })
    }

    pub fn resume(&self) -> Result<()> {
        let previous = unsafe { ResumeThread(self.thread.raw()) };
        if previous == u32::MAX {
            return Err(Error::from_win32());
        }
        Ok(())
    }
}

/// Exit code of a process; `STILL_ACTIVE` while it runs
pub fn exit_code(process: &KernelHandle) -> Result<u32> {
    let mut code = 0u32;
    unsafe { GetExitCodeProcess(process.raw(), &mut code)? };
    Ok(code)
}

/// Wall-clock time between creation and exit of a finished process
pub fn lifetime(process: &KernelHandle) -> Result<Duration> {
    let mut creation = FILETIME::default();
    let mut exit = FILETIME::default();
    let mut kernel = FILETIME::default();
    let mut user = FILETIME::default();

    unsafe { GetProcessTimes(process.raw(), &mut creation, &mut exit, &mut kernel, &mut user)? };

    Ok(filetime_span(ticks(&creation), ticks(&exit)))
}

fn ticks(time: &FILETIME) -> u64 {
    (u64::from(time.dwHighDateTime) << 32) | u64::from(time.dwLowDateTime)
}
