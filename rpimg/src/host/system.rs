//! [`Host`] implementation backed by the standard Linux tools.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use tracing::debug;

use super::{Cmd, Host};
use crate::{Error, Result};

/// Drives loop devices, mounts and partitions through external tools.
///
/// Privileged commands are prefixed with `sudo` unless the process already
/// runs as root.
#[derive(Debug, Clone, Copy)]
pub struct SystemHost {
    /// Whether privileged commands go through `sudo`.
    sudo: bool,
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemHost {
    /// Creates a host handle for the current process.
    pub fn new() -> Self {
        Self { sudo: !is_root() }
    }

    /// Fails with [`Error::MissingTool`] for the first tool not on `PATH`.
    pub fn check_tools(tools: &[&str]) -> Result<()> {
        for tool in tools {
            if which(tool).is_none() {
                return Err(Error::MissingTool((*tool).to_owned()));
            }
        }
        Ok(())
    }

    /// Builds the [`Command`] for `cmd`, adding `sudo` when needed.
    fn command(&self, cmd: &Cmd) -> Command {
        debug!("$ {cmd}");
        if cmd.is_privileged() && self.sudo {
            let mut c = Command::new("sudo");
            c.arg(cmd.program()).args(cmd.get_args());
            c
        } else {
            let mut c = Command::new(cmd.program());
            c.args(cmd.get_args());
            c
        }
    }

    /// Runs `cmd` capturing its output and checks the exit status.
    fn capture(&self, cmd: &Cmd) -> Result<Output> {
        let output = self
            .command(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| spawn_error(cmd, &e))?;
        check_status(cmd, output.status, &output.stderr)?;
        Ok(output)
    }
}

impl Host for SystemHost {
    fn find_loopdev(&self, image: &Path) -> Result<Option<String>> {
        let image = fs::canonicalize(image)?;
        let out = self.output(&Cmd::new("losetup").arg("-j").arg_path(&image).privileged())?;
        Ok(parse_losetup_list(&out))
    }

    fn attach_loopdev(&self, image: &Path) -> Result<String> {
        let out = self.output(
            &Cmd::new("losetup")
                .args(["--find", "--show", "--partscan"])
                .arg_path(image)
                .privileged(),
        )?;
        let dev = out.trim();
        if dev.is_empty() {
            return Err(Error::Command {
                cmd: format!("losetup --find --show --partscan {}", image.display()),
                status: "no device reported".into(),
                stderr: String::new(),
            });
        }
        Ok(dev.to_owned())
    }

    fn detach_loopdev(&self, loopdev: &str) -> Result<()> {
        self.run(&Cmd::new("losetup").args(["-d", loopdev]).privileged())
    }

    fn device_exists(&self, device: &Path) -> bool {
        device.exists()
    }

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool> {
        let Ok(target) = fs::canonicalize(mountpoint) else {
            return Ok(false);
        };
        let mounts = fs::read_to_string("/proc/self/mounts")?;
        Ok(mount_targets(&mounts).any(|m| m == target))
    }

    fn mount(&self, device: &Path, mountpoint: &Path) -> Result<()> {
        self.run(
            &Cmd::new("mount")
                .args(["-t", "auto"])
                .arg_path(device)
                .arg_path(mountpoint)
                .privileged(),
        )
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        self.run(&Cmd::new("umount").arg_path(mountpoint).privileged())
    }

    fn disk_identifier(&self, loopdev: &str) -> Result<String> {
        let out = self.output(&Cmd::new("sfdisk").args(["--disk-id", loopdev]).privileged())?;
        Ok(out.trim().to_owned())
    }

    fn set_disk_identifier(&self, loopdev: &str, id: &str) -> Result<()> {
        self.run(&Cmd::new("sfdisk").args(["--disk-id", loopdev, id]).privileged())
    }

    fn grow_partition(&self, loopdev: &str, index: u32) -> Result<()> {
        self.run(
            &Cmd::new("parted")
                .args(["-s", loopdev, "resizepart"])
                .arg(index.to_string())
                .arg("100%")
                .privileged(),
        )
    }

    fn check_filesystem(&self, device: &Path) -> Result<()> {
        // e2fsck exits with 1 when it corrected errors.
        self.run(
            &Cmd::new("e2fsck")
                .args(["-f", "-y"])
                .arg_path(device)
                .ok_codes(&[0, 1])
                .privileged(),
        )
    }

    fn resize_filesystem(&self, device: &Path) -> Result<()> {
        self.run(&Cmd::new("resize2fs").arg_path(device).privileged())
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.run(&Cmd::new("mkdir").arg("-p").arg_path(path).privileged())
    }

    fn install_file(&self, origin: &Path, destination: &Path) -> Result<()> {
        self.run(
            &Cmd::new("cp")
                .arg_path(origin)
                .arg_path(destination)
                .privileged(),
        )
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        self.run(
            &Cmd::new("truncate")
                .arg(format!("--size={len}"))
                .arg_path(path)
                .privileged(),
        )
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.run(&Cmd::new("rm").arg("-f").arg_path(path).privileged())
    }

    fn sync(&self) -> Result<()> {
        self.run(&Cmd::new("sync"))
    }

    fn run(&self, cmd: &Cmd) -> Result<()> {
        let status = self
            .command(cmd)
            .stdin(Stdio::null())
            .status()
            .map_err(|e| spawn_error(cmd, &e))?;
        check_status(cmd, status, &[])
    }

    fn output(&self, cmd: &Cmd) -> Result<String> {
        let out = self.capture(cmd)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

/// Maps a spawn failure to [`Error::MissingTool`] or [`Error::Io`].
fn spawn_error(cmd: &Cmd, e: &std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::MissingTool(cmd.program().to_owned())
    } else {
        Error::Io(std::io::Error::new(e.kind(), format!("{cmd}: {e}")))
    }
}

/// Converts a non-accepted exit status into [`Error::Command`].
fn check_status(cmd: &Cmd, status: std::process::ExitStatus, stderr: &[u8]) -> Result<()> {
    match status.code() {
        Some(code) if cmd.accepts(code) => Ok(()),
        code => Err(Error::Command {
            cmd: cmd.to_string(),
            status: code.map_or_else(|| "killed by signal".to_owned(), |c| format!("exit code {c}")),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        }),
    }
}

/// Extracts the device from `losetup -j` output (`/dev/loop3: []: (/img)`).
fn parse_losetup_list(out: &str) -> Option<String> {
    out.lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(dev, _)| dev.trim())
        .find(|dev| !dev.is_empty())
        .map(str::to_owned)
}

/// Yields the mount targets listed in a `/proc/mounts` style table.
fn mount_targets(table: &str) -> impl Iterator<Item = PathBuf> + '_ {
    table
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|target| PathBuf::from(unescape_mount_field(target)))
}

/// Decodes the octal escapes (`\040` for space, ...) used in mount tables.
fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or_default();
            if let Ok(b) = u8::from_str_radix(digits, 8) {
                out.push(b);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Returns `true` when running with effective uid 0.
#[cfg(unix)]
fn is_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Returns `true` when running with effective uid 0.
#[cfg(not(unix))]
const fn is_root() -> bool {
    false
}

/// Looks `tool` up in `PATH`.
fn which(tool: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(tool))
        .find(|candidate| candidate.is_file())
}
