//! Handoff channel between the supervisor and the helper process
//!
//! A single named shared segment is used twice:
//! 1. Supervisor -> helper: the engine executable path and command line,
//!    written back to back as NUL-terminated UTF-16 strings before the helper
//!    is started.
//! 2. Helper -> supervisor: a `HandoffPayload` at offset 0, written after the
//!    helper has consumed the launch arguments and before the ready event is
//!    signaled.
//! 3. Supervisor -> helper: an adoption marker right after the payload, set
//!    once the ready signal has been consumed. Only then may the helper start
//!    waiting on the event for stop requests, since the event is auto-reset
//!    and shared by both directions.
//!
//! The codec below works on plain byte slices; the Win32 objects that own the
//! memory live in `windows_impl`.

use std::mem::size_of;
use std::sync::atomic::{fence, Ordering};
use thiserror::Error;

/// Identity of the engine, published by the helper
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffPayload {
    /// Engine process id
    pub process_id: u32,
    /// Engine primary thread id
    pub thread_id: u32,
    /// Raw value of the helper's console window handle
    pub console_window: usize,
}

/// Engine executable and command line as read back by the helper
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchArgs {
    /// UTF-16 executable path, without terminator
    pub exe: Vec<u16>,
    /// UTF-16 command line, without terminator
    pub command_line: Vec<u16>,
}

impl LaunchArgs {
    pub fn exe_lossy(&self) -> String {
        String::from_utf16_lossy(&self.exe)
    }

    pub fn command_line_lossy(&self) -> String {
        String::from_utf16_lossy(&self.command_line)
    }
}

/// Result of racing the ready event against another process handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The ready event fired
    Ready,
    /// The watched process exited first
    OtherExited,
    /// The wait itself failed
    Failed(String),
    /// The timeout elapsed
    TimedOut,
}

/// Errors of the handoff codec
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandoffError {
    #[error("Shared segment too small: need {required} bytes, have {available}")]
    SegmentTooSmall { required: usize, available: usize },

    #[error("Launch argument contains an interior NUL")]
    InteriorNul,

    #[error("Launch arguments are not NUL-terminated")]
    MissingTerminator,
}

const UNIT: usize = size_of::<u16>();

/// Offset of the adoption marker, right after the payload
const ADOPTED_OFFSET: usize = size_of::<HandoffPayload>();

const ADOPTED_MARK: u32 = 0x4144_4F50;

const PAYLOAD_AREA: usize = ADOPTED_OFFSET + size_of::<u32>();

/// Bytes needed for the segment: large enough for either phase
pub fn segment_size(exe: &[u16], command_line: &[u16]) -> usize {
    launch_args_size(exe, command_line).max(PAYLOAD_AREA)
}

fn launch_args_size(exe: &[u16], command_line: &[u16]) -> usize {
    (exe.len() + 1 + command_line.len() + 1) * UNIT
}

/// Write the engine executable and command line into the segment
pub fn write_launch_args(
    segment: &mut [u8],
    exe: &[u16],
    command_line: &[u16],
) -> Result<(), HandoffError> {
    let required = launch_args_size(exe, command_line);
    if segment.len() < required {
        return Err(HandoffError::SegmentTooSmall {
            required,
            available: segment.len(),
        });
    }
    if exe.contains(&0) || command_line.contains(&0) {
        return Err(HandoffError::InteriorNul);
    }

    let units = exe
        .iter()
        .chain(Some(&0))
        .chain(command_line.iter())
        .chain(Some(&0));
    for (slot, unit) in segment.chunks_exact_mut(UNIT).zip(units) {
        slot.copy_from_slice(&unit.to_ne_bytes());
    }

    Ok(())
}

/// Read back the two strings written by `write_launch_args`
pub fn read_launch_args(segment: &[u8]) -> Result<LaunchArgs, HandoffError> {
    let mut units = segment
        .chunks_exact(UNIT)
        .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]));

    let exe = take_until_nul(&mut units)?;
    let command_line = take_until_nul(&mut units)?;

    Ok(LaunchArgs { exe, command_line })
}

fn take_until_nul(units: &mut impl Iterator<Item = u16>) -> Result<Vec<u16>, HandoffError> {
    let mut text = Vec::new();
    for unit in units {
        if unit == 0 {
            return Ok(text);
        }
        text.push(unit);
    }
    Err(HandoffError::MissingTerminator)
}

/// Publish the engine identity at offset 0 and clear the adoption marker
pub fn write_payload(segment: &mut [u8], payload: &HandoffPayload) -> Result<(), HandoffError> {
    check_payload_fits(segment.len())?;
    // SAFETY: length checked above; unaligned write because the slice may be unaligned
    unsafe {
        std::ptr::write_unaligned(segment.as_mut_ptr().cast::<HandoffPayload>(), *payload);
    }
    // Launch argument bytes may still sit where the marker lives
    segment[ADOPTED_OFFSET..PAYLOAD_AREA].fill(0);
    Ok(())
}

/// Tell the helper its ready signal was consumed
pub fn mark_adopted(segment: &mut [u8]) -> Result<(), HandoffError> {
    check_payload_fits(segment.len())?;
    fence(Ordering::Release);
    segment[ADOPTED_OFFSET..PAYLOAD_AREA].copy_from_slice(&ADOPTED_MARK.to_ne_bytes());
    Ok(())
}

pub fn is_adopted(segment: &[u8]) -> bool {
    let Some(bytes) = segment.get(ADOPTED_OFFSET..PAYLOAD_AREA) else {
        return false;
    };
    let adopted = bytes == ADOPTED_MARK.to_ne_bytes();
    fence(Ordering::Acquire);
    adopted
}

/// Read the engine identity. Only meaningful after the ready event fired.
pub fn read_payload(segment: &[u8]) -> Result<HandoffPayload, HandoffError> {
    check_payload_fits(segment.len())?;
    // SAFETY: length checked above; every bit pattern is a valid HandoffPayload
    Ok(unsafe { std::ptr::read_unaligned(segment.as_ptr().cast::<HandoffPayload>()) })
}

fn check_payload_fits(available: usize) -> Result<(), HandoffError> {
    let required = PAYLOAD_AREA;
    if available < required {
        return Err(HandoffError::SegmentTooSmall {
            required,
            available,
        });
    }
    Ok(())
}

/// NUL-terminated UTF-16 copy of a kernel object name
pub(crate) fn wide_name(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(Some(0)).collect()
}

// ============================================================================
// Windows Implementation
// ============================================================================

#[cfg(windows)]
mod windows_impl {
    use super::*;
    use crate::process::handle::KernelHandle;
    use windows::core::{Error, Result, PCWSTR};
    use windows::Win32::Foundation::{
        ERROR_ALREADY_EXISTS, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
    };
    use windows::Win32::System::Memory::{
        CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, VirtualQuery,
        FILE_MAP_ALL_ACCESS, MEMORY_BASIC_INFORMATION, MEMORY_MAPPED_VIEW_ADDRESS,
        PAGE_READWRITE,
    };
    use windows::Win32::System::Threading::{
        CreateEventW, OpenEventW, SetEvent, WaitForMultipleObjects, EVENT_ALL_ACCESS,
    };

    /// Fails with `ERROR_ALREADY_EXISTS` if the last call opened an existing object
    fn reject_existing() -> Result<()> {
        let last = Error::from_win32();
        if last.code() == ERROR_ALREADY_EXISTS.to_hresult() {
            return Err(last);
        }
        Ok(())
    }

    /// Named, pagefile-backed shared memory
    pub struct SharedSegment {
        view: MEMORY_MAPPED_VIEW_ADDRESS,
        len: usize,
        _mapping: KernelHandle,
    }

    impl SharedSegment {
        /// Create a fresh segment. An existing object of the same name is an error.
        pub fn create(name: &str, size: usize) -> Result<Self> {
            let wide = wide_name(name);
            let mapping = unsafe {
                CreateFileMappingW(
                    INVALID_HANDLE_VALUE,
                    None,
                    PAGE_READWRITE,
                    0,
                    size as u32,
                    PCWSTR(wide.as_ptr()),
                )
            }?;
            let already_exists = reject_existing();
            let mapping = KernelHandle::from_raw(mapping);
            already_exists?;

            Self::map(mapping, size)
        }

        /// Open a segment created by the supervisor
        pub fn open(name: &str) -> Result<Self> {
            let wide = wide_name(name);
            let mapping = unsafe {
                OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(wide.as_ptr()))
            }?;
            Self::map(KernelHandle::from_raw(mapping), 0)
        }

        fn map(mapping: KernelHandle, size: usize) -> Result<Self> {
            let view = unsafe { MapViewOfFile(mapping.raw(), FILE_MAP_ALL_ACCESS, 0, 0, size) };
            if view.Value.is_null() {
                return Err(Error::from_win32());
            }

            let len = if size != 0 {
                size
            } else {
                let mut info = MEMORY_BASIC_INFORMATION::default();
                let written = unsafe {
                    VirtualQuery(
                        Some(view.Value as *const _),
                        &mut info,
                        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if written == 0 {
                    let err = Error::from_win32();
                    unsafe {
                        let _ = UnmapViewOfFile(view);
                    }
                    return Err(err);
                }
                info.RegionSize
            };

            Ok(Self {
                view,
                len,
                _mapping: mapping,
            })
        }

        pub fn bytes(&self) -> &[u8] {
            // SAFETY: the view stays mapped for the lifetime of self
            unsafe { std::slice::from_raw_parts(self.view.Value as *const u8, self.len) }
        }

        pub fn bytes_mut(&mut self) -> &mut [u8] {
            // SAFETY: as above; the handoff protocol gives each phase a single writer
            unsafe { std::slice::from_raw_parts_mut(self.view.Value as *mut u8, self.len) }
        }
    }

    impl Drop for SharedSegment {
        fn drop(&mut self) {
            unsafe {
                let _ = UnmapViewOfFile(self.view);
            }
        }
    }

    /// Named auto-reset event.
    ///
    /// First set by the helper as "payload ready"; afterwards reused by the
    /// supervisor as "please interrupt the engine".
    pub struct NamedEvent {
        handle: KernelHandle,
    }

    impl NamedEvent {
        /// Create a fresh event. An existing object of the same name is an error.
        pub fn create(name: &str) -> Result<Self> {
            let wide = wide_name(name);
            let handle = unsafe { CreateEventW(None, false, false, PCWSTR(wide.as_ptr())) }?;
            let already_exists = reject_existing();
            let handle = KernelHandle::from_raw(handle);
            already_exists?;

            Ok(Self { handle })
        }

        pub fn open(name: &str) -> Result<Self> {
            let wide = wide_name(name);
            let handle = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, PCWSTR(wide.as_ptr())) }?;
            Ok(Self {
                handle: KernelHandle::from_raw(handle),
            })
        }

        pub fn signal(&self) -> Result<()> {
            unsafe { SetEvent(self.handle.raw()) }
        }
    }

    /// Wait until either the event is signaled or `other` becomes signaled.
    ///
    /// The event is checked first, so a helper that signaled and then exited
    /// still counts as ready.
    pub fn wait_ready(event: &NamedEvent, other: &KernelHandle, timeout_ms: u32) -> WaitOutcome {
        let handles = [event.handle.raw(), other.raw()];
        let status = unsafe { WaitForMultipleObjects(&handles, false, timeout_ms) };

        match status.0 {
            s if s == WAIT_OBJECT_0.0 => WaitOutcome::Ready,
            s if s == WAIT_OBJECT_0.0 + 1 => WaitOutcome::OtherExited,
            s if s == WAIT_TIMEOUT.0 => WaitOutcome::TimedOut,
            _ => WaitOutcome::Failed(Error::from_win32().to_string()),
        }
    }
}

#[cfg(windows)]
pub use windows_impl::{wait_ready, NamedEvent, SharedSegment};

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn utf16(text: &str) -> Vec<u16> {
        text.encode_utf16().collect()
    }

    #[test]
    fn test_segment_size_covers_both_phases() {
        assert_eq!(segment_size(&[], &[]), PAYLOAD_AREA);

        let exe = utf16(r"C:\Program Files\ProxyTray\clash.exe");
        let cmd = utf16(r#""clash.exe" -secret """#);
        assert_eq!(segment_size(&exe, &cmd), (exe.len() + cmd.len() + 2) * 2);
    }

    #[test]
    fn test_launch_args_round_trip() {
        let exe = utf16(r"C:\Tools\clash.exe");
        let cmd = utf16(r#""clash.exe" -d "C:\Tools\assets" -secret """#);
        let mut segment = vec![0u8; segment_size(&exe, &cmd)];

        write_launch_args(&mut segment, &exe, &cmd).unwrap();
        let args = read_launch_args(&segment).unwrap();

        assert_eq!(args.exe, exe);
        assert_eq!(args.command_line, cmd);
        assert_eq!(args.exe_lossy(), r"C:\Tools\clash.exe");
    }

    #[test]
    fn test_launch_args_rejects_small_segment() {
        let exe = utf16("a.exe");
        let mut segment = vec![0u8; 4];
        let err = write_launch_args(&mut segment, &exe, &[]).unwrap_err();
        assert_eq!(
            err,
            HandoffError::SegmentTooSmall {
                required: 14,
                available: 4
            }
        );
    }

    #[test]
    fn test_launch_args_rejects_interior_nul() {
        let mut segment = vec![0u8; 64];
        let err = write_launch_args(&mut segment, &[b'a' as u16, 0, b'b' as u16], &[]).unwrap_err();
        assert_eq!(err, HandoffError::InteriorNul);
    }

    #[test]
    fn test_unterminated_launch_args() {
        let segment: Vec<u8> = utf16("abc").iter().flat_map(|u| u.to_ne_bytes()).collect();
        assert_eq!(read_launch_args(&segment), Err(HandoffError::MissingTerminator));
    }

    #[test]
    fn test_payload_overwrites_launch_args() {
        let exe = utf16(r"C:\Tools\clash.exe");
        let cmd = utf16(r#""clash.exe" -f "config.yaml""#);
        let mut segment = vec![0u8; segment_size(&exe, &cmd)];
        write_launch_args(&mut segment, &exe, &cmd).unwrap();

        let payload = HandoffPayload {
            process_id: 4242,
            thread_id: 4343,
            console_window: 0x0001_02F4,
        };
        write_payload(&mut segment, &payload).unwrap();

        assert_eq!(read_payload(&segment).unwrap(), payload);
    }

    #[test]
    fn test_payload_needs_room() {
        let segment = vec![0u8; size_of::<HandoffPayload>() - 1];
        assert!(matches!(
            read_payload(&segment),
            Err(HandoffError::SegmentTooSmall { .. })
        ));
    }

    #[test]
    fn test_adoption_marker_starts_cleared() {
        // Launch args long enough to cover the marker bytes with text
        let exe = utf16(r"C:\Program Files\ProxyTray\clash.exe");
        let mut segment = vec![0u8; segment_size(&exe, &[])];
        write_launch_args(&mut segment, &exe, &[]).unwrap();
        segment[ADOPTED_OFFSET..PAYLOAD_AREA].copy_from_slice(&ADOPTED_MARK.to_ne_bytes());

        write_payload(&mut segment, &HandoffPayload::default()).unwrap();
        assert!(!is_adopted(&segment));

        mark_adopted(&mut segment).unwrap();
        assert!(is_adopted(&segment));
        assert_eq!(read_payload(&segment).unwrap(), HandoffPayload::default());
    }

    #[test]
    fn test_adoption_marker_needs_room() {
        let mut segment = vec![0u8; size_of::<HandoffPayload>()];
        assert!(!is_adopted(&segment));
        assert!(matches!(
            mark_adopted(&mut segment),
            Err(HandoffError::SegmentTooSmall { .. })
        ));
    }

    proptest! {
        #[test]
        fn payload_is_bit_identical(
            process_id in any::<u32>(),
            thread_id in any::<u32>(),
            console_window in any::<usize>(),
            offset in 0usize..8,
        ) {
            // Offset exercises unaligned segment starts
            let mut storage = vec![0u8; PAYLOAD_AREA + offset];
            let segment = &mut storage[offset..];
            let payload = HandoffPayload { process_id, thread_id, console_window };

            write_payload(segment, &payload).unwrap();
            prop_assert_eq!(read_payload(segment).unwrap(), payload);
        }

        #[test]
        fn launch_args_survive_arbitrary_text(exe in "[^\\x00]{0,64}", cmd in "[^\\x00]{0,256}") {
            let exe = utf16(&exe);
            let cmd = utf16(&cmd);
            let mut segment = vec![0u8; segment_size(&exe, &cmd)];

            write_launch_args(&mut segment, &exe, &cmd).unwrap();
            let args = read_launch_args(&segment).unwrap();
            prop_assert_eq!(args.exe, exe);
            prop_assert_eq!(args.command_line, cmd);
        }
    }
}
