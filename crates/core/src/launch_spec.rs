//! Engine launch parameters and the command lines built from them

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::process::names::{relaunch_arg, HandoffId};

/// Everything needed to start the engine once
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Full path of the engine executable
    pub engine_path: PathBuf,
    /// Engine home directory (`-d`)
    pub home_dir: PathBuf,
    /// Engine configuration file (`-f`)
    pub config_file: PathBuf,
    /// External dashboard directory (`-ext-ui`)
    pub ui_dir: PathBuf,
    /// Control API listen address (`-ext-ctl`)
    pub control_address: String,
    /// Control API secret (`-secret`, always passed)
    pub control_secret: String,
}

impl LaunchSpec {
    /// Command line handed to the engine.
    ///
    /// Optional flags are omitted when empty. The secret is always passed so a
    /// secret in the engine's own config file cannot take effect.
    pub fn engine_command_line(&self) -> OsString {
        let mut cmd = OsString::from("\"");
        if let Some(name) = self.engine_path.file_name() {
            cmd.push(name);
        }
        cmd.push("\"");

        push_flag(&mut cmd, "-d", self.home_dir.as_os_str());
        push_flag(&mut cmd, "-f", self.config_file.as_os_str());
        push_flag(&mut cmd, "-ext-ui", self.ui_dir.as_os_str());
        push_flag(&mut cmd, "-ext-ctl", OsStr::new(&self.control_address));
        push_quoted(&mut cmd, "-secret", OsStr::new(&self.control_secret));

        cmd
    }
}

fn push_flag(cmd: &mut OsString, flag: &str, value: &OsStr) {
    if !value.is_empty() {
        push_quoted(cmd, flag, value);
    }
}

fn push_quoted(cmd: &mut OsString, flag: &str, value: &OsStr) {
    cmd.push(" ");
    cmd.push(flag);
    cmd.push(" \"");
    cmd.push(value);
    cmd.push("\"");
}

/// Command line that relaunches `helper_exe` as the helper for `id`
pub fn helper_command_line(helper_exe: &Path, id: &HandoffId) -> OsString {
    let mut cmd = OsString::from("\"");
    cmd.push(helper_exe.as_os_str());
    cmd.push("\" ");
    cmd.push(relaunch_arg(id));
    cmd
}

/// UTF-16 code units of an OS string, without terminator
#[cfg(windows)]
pub fn to_wide(text: &OsStr) -> Vec<u16> {
    use std::os::windows::ffi::OsStrExt;
    text.encode_wide().collect()
}

/// UTF-16 code units of an OS string, without terminator
#[cfg(not(windows))]
pub fn to_wide(text: &OsStr) -> Vec<u16> {
    text.to_string_lossy().encode_utf16().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_spec() -> LaunchSpec {
        LaunchSpec {
            engine_path: PathBuf::from("/opt/proxy tray/clash.exe"),
            home_dir: PathBuf::from("/opt/proxy tray/home"),
            config_file: PathBuf::from("/data/Config/config.yaml"),
            ui_dir: PathBuf::from("/opt/proxy tray/dashboard"),
            control_address: "127.0.0.1:9090".to_string(),
            control_secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_engine_command_line_full() {
        let cmd = full_spec().engine_command_line();
        assert_eq!(
            cmd.to_string_lossy(),
            r#""clash.exe" -d "/opt/proxy tray/home" -f "/data/Config/config.yaml" -ext-ui "/opt/proxy tray/dashboard" -ext-ctl "127.0.0.1:9090" -secret "s3cret""#
        );
    }

    #[test]
    fn test_engine_command_line_skips_empty_but_keeps_secret() {
        let spec = LaunchSpec {
            engine_path: PathBuf::from("clash.exe"),
            ..Default::default()
        };
        assert_eq!(
            spec.engine_command_line().to_string_lossy(),
            r#""clash.exe" -secret """#
        );
    }

    #[test]
    fn test_config_file_change_is_reflected() {
        let mut spec = full_spec();
        spec.config_file = PathBuf::from("/data/Config/other.yaml");
        assert!(spec
            .engine_command_line()
            .to_string_lossy()
            .contains(r#"-f "/data/Config/other.yaml""#));
    }

    #[test]
    fn test_helper_command_line() {
        let id = HandoffId::parse("{6B29FC40-CA47-1067-B31D-00DD010662DA}").unwrap();
        let cmd = helper_command_line(Path::new("/apps/ProxyTray.exe"), &id);
        assert_eq!(
            cmd.to_string_lossy(),
            r#""/apps/ProxyTray.exe" --pm={6B29FC40-CA47-1067-B31D-00DD010662DA}"#
        );
    }

    #[test]
    fn test_to_wide_has_no_terminator() {
        let wide = to_wide(OsStr::new("abc"));
        assert_eq!(wide, vec![b'a' as u16, b'b' as u16, b'c' as u16]);
    }
}
