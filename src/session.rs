// SPDX-FileCopyrightText: 2024 Gabriel Marcano
//
// SPDX-License-Identifier: BSD-3-Clause

//! Flashing through Segger's J-Link Commander.
//!
//! A session patches the binary with the bootloader trailer, writes a Commander script that loads
//! the patched image, and runs the Commander on it. Both the script and the patched image only
//! live for the duration of the session.

use crate::error::{Error, Result};
use crate::image;

use log::{debug, info, warn};
use tempfile::TempPath;

use std::ffi::OsStr;
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

/// Device name as understood by the J-Link software.
pub const DEFAULT_DEVICE: &str = "EFM32TG11B520F128";
/// Interface speed, in kHz.
pub const DEFAULT_SPEED: u32 = 4000;
/// Start of the application partition, right after the bootloader.
///
/// Addresses are handed to the Commander as written. It reads bare numbers as hex.
pub const DEFAULT_ADDRESS: &str = "0x8000";

#[cfg(windows)]
pub const DEFAULT_TOOL: &str = "JLink.exe";
#[cfg(not(windows))]
pub const DEFAULT_TOOL: &str = "JLinkExe";

/// Everything needed to run a flash session.
#[derive(Clone, Debug)]
pub struct FlashParameters {
    /// Device name as understood by the J-Link software.
    pub device: String,
    /// Interface speed, in kHz.
    pub speed: u32,
    /// Flash address to load the image at, passed to `loadbin` unchanged.
    pub address: String,
    /// The unpatched application binary.
    pub binary: PathBuf,
    /// The J-Link Commander executable.
    pub tool: OsString,
    /// Directory the Commander script is created in.
    pub script_dir: PathBuf,
}

impl FlashParameters {
    /// Parameters for flashing `binary` with the default device, speed, address and tool, keeping
    /// the script in the current directory.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            device: DEFAULT_DEVICE.to_string(),
            speed: DEFAULT_SPEED,
            address: DEFAULT_ADDRESS.to_string(),
            binary: binary.into(),
            tool: DEFAULT_TOOL.into(),
            script_dir: PathBuf::from("."),
        }
    }
}

/// Renders the Commander script that loads `binary` at `address`.
pub fn render_script(device: &str, speed: u32, binary: &Path, address: &str) -> String {
    format!(
        "device {device}\n\
         speed {speed}\n\
         if SWD\n\
         autoconnect 1\n\
         loadbin {}, {address}\n\
         qc\n",
        binary.display()
    )
}

/// Writes `script` to a new, uniquely named file in `dir`. The file is removed when the returned
/// path is dropped.
fn write_script(dir: &Path, script: &str) -> Result<TempPath> {
    let mut file = tempfile::Builder::new()
        .prefix("flash-")
        .suffix(".jlink")
        .tempfile_in(dir)
        .map_err(Error::file_access(dir))?;
    file.write_all(script.as_bytes())
        .and_then(|()| file.flush())
        .map_err(Error::file_access(file.path()))?;

    // The Commander may want exclusive access, so only keep the path around
    Ok(file.into_temp_path())
}

fn run_commander(tool: &OsStr, script: &Path) -> Result<()> {
    let mut command = Command::new(tool);
    command.arg("-CommanderScript").arg(script);
    debug!("Running {command:?}");

    let status = command.status().map_err(|source| Error::ToolInvocation {
        tool: tool.to_os_string(),
        source,
    })?;
    info!("{} finished with {status}", tool.to_string_lossy());

    if status.success() {
        Ok(())
    } else {
        Err(Error::ToolFailure(status.code()))
    }
}

/// Patches `params.binary` and flashes it with the J-Link Commander.
///
/// The Commander's output is passed through untouched. The script and the patched image are
/// removed before returning, whatever the outcome.
///
/// # Errors
///
/// [Error::FileAccess] if the image or the script can't be written. Nothing is left on disk if
/// the image couldn't be built.
///
/// [Error::ToolInvocation] if the Commander couldn't be started.
///
/// [Error::ToolFailure] with the Commander's exit code if it reported a failure.
pub fn run_flash_session(params: &FlashParameters) -> Result<()> {
    info!("Phase: Image");
    let patched = image::build_patched_image(&params.binary)?;
    info!(
        "Patched {} with CRC 0x{:08X}",
        patched.path().display(),
        patched.trailer().checksum
    );

    info!("Phase: Script");
    let script = render_script(
        &params.device,
        params.speed,
        patched.path(),
        &params.address,
    );
    debug!("Commander script:\n{script}");
    let script = write_script(&params.script_dir, &script)?;
    info!("Wrote script to {}", script.display());

    info!("Phase: Flash");
    let result = run_commander(&params.tool, &script);

    let script_path = script.to_path_buf();
    match script.close() {
        Ok(()) => debug!("Removed {}", script_path.display()),
        Err(error) => warn!("Unable to remove {}: {error}", script_path.display()),
    }
    drop(patched);

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    const EXPECTED_SCRIPT: &str = "device EFM32TG11B520F128\n\
                                   speed 4000\n\
                                   if SWD\n\
                                   autoconnect 1\n\
                                   loadbin build/app.crc.bin, 0x8000\n\
                                   qc\n";

    struct Workspace {
        source_dir: tempfile::TempDir,
        script_dir: tempfile::TempDir,
    }

    impl Workspace {
        fn new(contents: &[u8]) -> Self {
            let workspace = Self {
                source_dir: tempfile::tempdir().unwrap(),
                script_dir: tempfile::tempdir().unwrap(),
            };
            fs::write(workspace.binary(), contents).unwrap();
            workspace
        }

        fn binary(&self) -> PathBuf {
            self.source_dir.path().join("app.bin")
        }

        fn params(&self, tool: impl Into<OsString>) -> FlashParameters {
            FlashParameters {
                tool: tool.into(),
                script_dir: self.script_dir.path().to_path_buf(),
                ..FlashParameters::new(self.binary())
            }
        }

        fn entries(dir: &Path) -> Vec<String> {
            let mut entries: Vec<String> = fs::read_dir(dir)
                .unwrap()
                .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            entries.sort();
            entries
        }

        fn assert_clean(&self) {
            assert_eq!(Self::entries(self.source_dir.path()), ["app.bin"]);
            assert!(Self::entries(self.script_dir.path()).is_empty());
        }
    }

    #[test]
    fn script_is_rendered_exactly() {
        let script = render_script(
            DEFAULT_DEVICE,
            DEFAULT_SPEED,
            Path::new("build/app.crc.bin"),
            DEFAULT_ADDRESS,
        );
        assert_eq!(script, EXPECTED_SCRIPT);
    }

    #[test]
    fn script_uses_given_parameters() {
        let script = render_script("EFM32GG11B820F2048", 12000, Path::new("fw"), "0x10000");
        assert!(script.starts_with("device EFM32GG11B820F2048\nspeed 12000\n"));
        assert!(script.contains("loadbin fw, 0x10000\n"));
    }

    #[test]
    fn address_is_passed_through_unchanged() {
        for address in ["8000", "0X8000", "0x08000", "0x00008000"] {
            let script = render_script(DEFAULT_DEVICE, DEFAULT_SPEED, Path::new("fw"), address);
            assert!(script.contains(&format!("loadbin fw, {address}\n")));
        }
    }

    #[test]
    fn defaults() {
        let params = FlashParameters::new("app.bin");
        assert_eq!(params.device, DEFAULT_DEVICE);
        assert_eq!(params.speed, 4000);
        assert_eq!(params.address, "0x8000");
        assert_eq!(params.tool, DEFAULT_TOOL);
        assert_eq!(params.script_dir, Path::new("."));
    }

    #[test]
    fn missing_binary_creates_nothing() {
        let workspace = Workspace::new(b"");
        let mut params = workspace.params("true");
        params.binary = workspace.source_dir.path().join("missing.bin");

        let result = run_flash_session(&params);
        assert!(matches!(result, Err(Error::FileAccess { .. })));
        workspace.assert_clean();
    }

    #[test]
    fn script_write_failure_removes_image() {
        let workspace = Workspace::new(b"firmware");
        let mut params = workspace.params("true");
        params.script_dir = workspace.script_dir.path().join("missing");

        let result = run_flash_session(&params);
        assert!(
            matches!(result, Err(Error::FileAccess { ref path, .. }) if path == &params.script_dir)
        );
        assert!(!workspace.source_dir.path().join("app.crc.bin").exists());
        workspace.assert_clean();
    }

    #[test]
    fn missing_tool_still_cleans_up() {
        let workspace = Workspace::new(b"firmware");
        let tool = workspace.source_dir.path().join("no-such-JLinkExe");

        let error = run_flash_session(&workspace.params(&tool)).unwrap_err();
        assert!(matches!(error, Error::ToolInvocation { .. }));
        assert_eq!(error.exit_code(), crate::error::EXIT_NOT_FOUND);
        assert_eq!(Workspace::entries(workspace.script_dir.path()).len(), 0);
        assert_eq!(
            Workspace::entries(workspace.source_dir.path()),
            ["app.bin".to_string()]
        );
    }

    #[cfg(unix)]
    fn write_tool(dir: &Path, body: &str, mode: u32) -> PathBuf {
        let tool = dir.join("commander");
        fs::write(&tool, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(mode)).unwrap();
        tool
    }

    #[cfg(unix)]
    #[test]
    fn successful_session_cleans_up() {
        let workspace = Workspace::new(b"firmware");
        assert!(run_flash_session(&workspace.params("true")).is_ok());
        workspace.assert_clean();
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_status_is_propagated() {
        let workspace = Workspace::new(b"firmware");

        let error = run_flash_session(&workspace.params("false")).unwrap_err();
        assert!(matches!(error, Error::ToolFailure(Some(1))));
        assert_eq!(error.exit_code(), 1);
        workspace.assert_clean();
    }

    #[cfg(unix)]
    #[test]
    fn tool_receives_script_and_image() {
        let workspace = Workspace::new(&[0x00]);
        let capture = tempfile::tempdir().unwrap();
        let patched = workspace.source_dir.path().join("app.crc.bin");
        let body = format!(
            "[ \"$1\" = -CommanderScript ] || exit 9\n\
             cp \"$2\" \"{capture}/script\" || exit 8\n\
             cp \"{image}\" \"{capture}/image\" || exit 7",
            capture = capture.path().display(),
            image = patched.display(),
        );
        let tool = write_tool(capture.path(), &body, 0o755);

        run_flash_session(&workspace.params(&tool)).unwrap();
        workspace.assert_clean();

        let script = fs::read_to_string(capture.path().join("script")).unwrap();
        assert_eq!(
            script,
            render_script(DEFAULT_DEVICE, DEFAULT_SPEED, &patched, DEFAULT_ADDRESS)
        );
        let flashed = fs::read(capture.path().join("image")).unwrap();
        assert_eq!(image::verify_patched_image(&flashed).unwrap(), [0x00]);
        assert_eq!(flashed.len(), 9);
    }

    #[cfg(unix)]
    #[test]
    fn tool_exit_code_is_kept() {
        let workspace = Workspace::new(b"firmware");
        let tools = tempfile::tempdir().unwrap();
        let tool = write_tool(tools.path(), "exit 3", 0o755);

        let error = run_flash_session(&workspace.params(&tool)).unwrap_err();
        assert_eq!(error.exit_code(), 3);
        workspace.assert_clean();
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_tool_still_cleans_up() {
        let workspace = Workspace::new(b"firmware");
        let tools = tempfile::tempdir().unwrap();
        let tool = write_tool(tools.path(), "exit 0", 0o644);

        let error = run_flash_session(&workspace.params(&tool)).unwrap_err();
        assert!(matches!(error, Error::ToolInvocation { .. }));
        assert_eq!(error.exit_code(), crate::error::EXIT_NOT_EXECUTABLE);
        workspace.assert_clean();
    }
}
