//! Helper entry point, run by the relaunched executable
//!
//! Owns a console for the engine, starts the engine suspended, publishes its
//! identity and then forwards stop requests as Ctrl+C until the engine exits.

use windows::core::{Error, Result};
use windows::Win32::Foundation::{E_INVALIDARG, ERROR_TIMEOUT};
use windows::Win32::System::Console::{
    AllocConsole, FlushConsoleInputBuffer, GenerateConsoleCtrlEvent, GetConsoleWindow,
    GetStdHandle, ReadConsoleInputW, SetConsoleCtrlHandler, WriteConsoleW, CTRL_C_EVENT,
    INPUT_RECORD, KEY_EVENT, STD_INPUT_HANDLE, STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Threading::INFINITE;
use windows::Win32::UI::WindowsAndMessaging::{ShowWindow, SW_HIDE};

use super::handle::{self, KernelHandle, ProcessHandles, StartupWindow};
use super::handoff::{
    is_adopted, read_launch_args, wait_ready, write_payload, HandoffPayload, NamedEvent,
    SharedSegment, WaitOutcome,
};
use super::names::{HandoffId, KernelObjectNames};

const COMPLETED_NOTICE: &str = "\n[Process completed]\n";

/// Poll interval while waiting for the supervisor to adopt the engine
const ADOPTION_POLL_MS: u32 = 10;

/// Run the helper for `id` and return the process exit code.
///
/// On success this is the engine's exit code; on a setup failure it is the
/// HRESULT of the failing call.
pub fn run(id: &HandoffId) -> u32 {
    match run_helper(id) {
        Ok(code) => {
            tracing::info!("Engine exited with code {}", code);
            code
        }
        Err(e) => {
            tracing::error!("Helper failed: {}", e);
            e.code().0 as u32
        }
    }
}

fn run_helper(id: &HandoffId) -> Result<u32> {
    let names = KernelObjectNames::derive(id);
    let mut segment = SharedSegment::open(&names.segment)?;
    let event = NamedEvent::open(&names.event)?;

    let args = read_launch_args(segment.bytes()).map_err(|e| {
        tracing::error!("Bad launch arguments: {}", e);
        Error::from(E_INVALIDARG)
    })?;
    tracing::info!("Launching {}: {}", args.exe_lossy(), args.command_line_lossy());

    unsafe { AllocConsole()? };
    let console = unsafe { GetConsoleWindow() };
    if console.0 == 0 {
        return Err(Error::from_win32());
    }
    unsafe {
        let _ = ShowWindow(console, SW_HIDE);
    }

    let engine =
        ProcessHandles::spawn_suspended(&args.exe, &args.command_line, StartupWindow::Default)?;

    let payload = HandoffPayload {
        process_id: engine.process_id,
        thread_id: engine.thread_id,
        console_window: console.0 as usize,
    };
    write_payload(segment.bytes_mut(), &payload).map_err(|e| {
        tracing::error!("Cannot publish engine identity: {}", e);
        Error::from(E_INVALIDARG)
    })?;

    // After the engine is created, so it does not inherit the ignore flag
    unsafe { SetConsoleCtrlHandler(None, true)? };
    event.signal()?;
    tracing::info!("Engine {} published", engine.process_id);

    // Waiting on the event before the supervisor took the ready signal would
    // swallow it as a stop request
    wait_for_adoption(&segment, &engine.process)?;
    drop(segment);

    loop {
        match wait_ready(&event, &engine.process, INFINITE) {
            WaitOutcome::Ready => {
                tracing::info!("Stop requested, sending Ctrl+C");
                if let Err(e) = unsafe { GenerateConsoleCtrlEvent(CTRL_C_EVENT, 0) } {
                    tracing::warn!("Ctrl+C delivery failed: {}", e);
                }
            }
            WaitOutcome::OtherExited => break,
            WaitOutcome::Failed(reason) => {
                tracing::error!("Wait on engine failed: {}", reason);
                return Err(Error::from_win32());
            }
            WaitOutcome::TimedOut => return Err(Error::from(ERROR_TIMEOUT.to_hresult())),
        }
    }

    let code = handle::exit_code(&engine.process)?;
    if let Err(e) = show_completed_and_wait_key() {
        tracing::warn!("Console notice failed: {}", e);
    }
    Ok(code)
}

/// Block until the supervisor marks the segment adopted or the engine is gone
fn wait_for_adoption(segment: &SharedSegment, engine: &KernelHandle) -> Result<()> {
    while !is_adopted(segment.bytes()) {
        if engine.wait_timeout(ADOPTION_POLL_MS)? {
            tracing::warn!("Engine exited before it was adopted");
            break;
        }
    }
    Ok(())
}

/// Keep the console open until a key is pressed
fn show_completed_and_wait_key() -> Result<()> {
    let notice: Vec<u16> = COMPLETED_NOTICE.encode_utf16().collect();
    unsafe {
        let output = GetStdHandle(STD_OUTPUT_HANDLE)?;
        WriteConsoleW(output, &notice, None, None)?;

        let input = GetStdHandle(STD_INPUT_HANDLE)?;
        FlushConsoleInputBuffer(input)?;

        let mut records = [INPUT_RECORD::default(); 1];
        loop {
            let mut read = 0u32;
            ReadConsoleInputW(input, &mut records, &mut read)?;
            let record = &records[0];
            if read == 1
                && u32::from(record.EventType) == KEY_EVENT
                && record.Event.KeyEvent.bKeyDown.as_bool()
            {
                return Ok(());
            }
        }
    }
}
