//! End-to-end supervision through the real `ProxyTray` helper
//!
//! These tests relaunch the built binary with `--pm=` exactly like the tray
//! process does, using system tools as the engine.

#![cfg(windows)]

use crossbeam_channel::unbounded;
use proxy_tray_core::launch_spec::LaunchSpec;
use proxy_tray_core::process::handle::KernelHandle;
use proxy_tray_core::process::launcher::JobLauncher;
use proxy_tray_core::process::{
    EngineEpisode, EngineLauncher, Supervisor, SupervisorConfig, SupervisorError,
    SupervisorState,
};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};

/// Tests inspect the helpers this process started, so they must not overlap
static SERIAL: Mutex<()> = Mutex::new(());

fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct ProcessEntry {
    process_id: u32,
    parent_id: u32,
    image: String,
}

fn process_table() -> Vec<ProcessEntry> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) }.unwrap();
    let snapshot = KernelHandle::from_raw(snapshot);

    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..Default::default()
    };
    let mut table = Vec::new();
    let mut more = unsafe { Process32FirstW(snapshot.raw(), &mut entry) }.is_ok();
    while more {
        let len = entry
            .szExeFile
            .iter()
            .position(|&unit| unit == 0)
            .unwrap_or(entry.szExeFile.len());
        table.push(ProcessEntry {
            process_id: entry.th32ProcessID,
            parent_id: entry.th32ParentProcessID,
            image: String::from_utf16_lossy(&entry.szExeFile[..len]),
        });
        more = unsafe { Process32NextW(snapshot.raw(), &mut entry) }.is_ok();
    }
    table
}

/// Helper processes started by this test process that are still alive
fn live_helpers() -> Vec<u32> {
    let own = std::process::id();
    process_table()
        .into_iter()
        .filter(|p| p.parent_id == own && p.image.eq_ignore_ascii_case("ProxyTray.exe"))
        .map(|p| p.process_id)
        .collect()
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn helper_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_ProxyTray"))
}

fn system32(exe: &str) -> PathBuf {
    let root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    PathBuf::from(root).join("System32").join(exe)
}

/// `ping -t` runs until interrupted and exits on Ctrl+C
fn ping_forever() -> (PathBuf, &'static OsStr) {
    (system32("PING.EXE"), OsStr::new("\"PING.EXE\" -t 127.0.0.1"))
}

/// Launches `ping -t` regardless of the launch spec's engine flags
struct PingLauncher(JobLauncher);

impl EngineLauncher for PingLauncher {
    fn launch(&self, _spec: &LaunchSpec) -> Result<Box<dyn EngineEpisode>, SupervisorError> {
        let (exe, cmd) = ping_forever();
        Ok(Box::new(self.0.launch_command(&exe, cmd)?))
    }
}

fn ping_supervisor() -> Supervisor {
    Supervisor::new(
        Box::new(PingLauncher(JobLauncher::new(helper_exe()))),
        LaunchSpec::default(),
        SupervisorConfig::default(),
    )
}

fn wait_for_state(sup: &Supervisor, wanted: SupervisorState, timeout: Duration) -> bool {
    wait_until(timeout, || sup.state() == wanted)
}

#[test]
fn test_valid_engine_is_adopted() {
    let _serial = serial();
    let (exe, cmd) = ping_forever();
    let episode = JobLauncher::new(helper_exe())
        .launch_command(&exe, cmd)
        .expect("launch should succeed");

    // The adopted id is the ping the helper created, not some other process
    let table = process_table();
    let engine = table
        .iter()
        .find(|p| p.process_id == episode.process_id())
        .expect("adopted engine is alive");
    assert!(engine.image.eq_ignore_ascii_case("PING.EXE"), "{:?}", engine);
    let helper = table
        .iter()
        .find(|p| p.process_id == engine.parent_id)
        .expect("helper is alive");
    assert!(helper.image.eq_ignore_ascii_case("ProxyTray.exe"), "{:?}", helper);
    assert_eq!(helper.parent_id, std::process::id());

    // Console exists but starts hidden
    assert!(!episode.is_console_visible());
    episode.set_console_visible(true).unwrap();
    assert!(episode.is_console_visible());
    episode.set_console_visible(false).unwrap();

    let engine_id = episode.process_id();
    drop(episode);
    assert!(
        wait_until(Duration::from_secs(5), || {
            process_table().iter().all(|p| p.process_id != engine_id) && live_helpers().is_empty()
        }),
        "closing the container must end helper and engine"
    );
}

#[test]
fn test_supervisor_runs_and_force_stops() {
    let _serial = serial();
    let sup = ping_supervisor();

    let pid = sup.start().expect("start should succeed");
    assert_eq!(sup.engine_process_id(), Some(pid));
    assert_eq!(sup.state(), SupervisorState::Running);
    assert_eq!(sup.start(), Err(SupervisorError::AlreadyRunning));

    sup.force_stop();
    sup.force_stop();
    assert_eq!(sup.state(), SupervisorState::Stopped);
    assert!(wait_until(Duration::from_secs(5), || live_helpers().is_empty()));
}

#[test]
fn test_nonexistent_engine_fails_setup() {
    let _serial = serial();
    let result = JobLauncher::new(helper_exe()).launch_command(
        &PathBuf::from(r"C:\does\not\exist\clash.exe"),
        OsStr::new("\"clash.exe\""),
    );

    match result {
        Err(SupervisorError::HelperExited(code)) => {
            // An HRESULT, not an ordinary exit status
            assert_ne!(code & 0x8000_0000, 0, "code {:#X}", code);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("nonexistent engine must not start"),
    }

    // Nothing from the failed attempt is left running
    assert!(
        wait_until(Duration::from_secs(5), || live_helpers().is_empty()),
        "helpers still alive: {:?}",
        live_helpers()
    );
}

#[test]
fn test_graceful_stop_is_not_a_crash() {
    let _serial = serial();
    let sup = ping_supervisor();
    let (tx, rx) = unbounded();
    sup.set_crash_handler(move |report| {
        let _ = tx.send(report);
    });

    sup.start().expect("start should succeed");
    // Give ping time to install its Ctrl+C handling
    std::thread::sleep(Duration::from_millis(500));

    assert!(sup.stop());
    assert!(
        wait_for_state(&sup, SupervisorState::Stopped, Duration::from_secs(15)),
        "engine did not stop after interrupt"
    );
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
