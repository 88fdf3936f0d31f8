//! Side effects on the build host: loop devices, mounts, partition tools
//! and external processes.
//!
//! Everything the pipeline does to block devices or mount state goes through
//! the [`Host`] trait. [`SystemHost`] is the production implementation and
//! drives the usual util-linux / e2fsprogs / parted tools.

mod system;
#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::path::Path;

pub use system::SystemHost;

use crate::Result;

/// Host tools the pipeline shells out to.
pub const REQUIRED_TOOLS: &[&str] = &[
    "losetup", "mount", "umount", "sfdisk", "parted", "e2fsck", "resize2fs", "cp", "mkdir",
    "truncate", "rm", "sync", "touch", "chmod", "chroot", "docker", "unzip",
];

/// Operations on the build host.
///
/// Implementations must make every release operation safe to repeat so the
/// pipeline's cleanup paths never fail on state that is already gone.
pub trait Host: fmt::Debug {
    /// Returns the loop device already bound to `image`, if any.
    fn find_loopdev(&self, image: &Path) -> Result<Option<String>>;
    /// Binds `image` to a free loop device with partition scanning.
    fn attach_loopdev(&self, image: &Path) -> Result<String>;
    /// Releases a loop device.
    fn detach_loopdev(&self, loopdev: &str) -> Result<()>;
    /// Returns `true` if the block-special file exists.
    fn device_exists(&self, device: &Path) -> bool;
    /// Returns `true` if something is mounted at `mountpoint`.
    fn is_mounted(&self, mountpoint: &Path) -> Result<bool>;
    /// Mounts `device` at `mountpoint`.
    fn mount(&self, device: &Path, mountpoint: &Path) -> Result<()>;
    /// Unmounts whatever is mounted at `mountpoint`.
    fn unmount(&self, mountpoint: &Path) -> Result<()>;
    /// Reads the partition table's disk identifier.
    fn disk_identifier(&self, loopdev: &str) -> Result<String>;
    /// Writes the partition table's disk identifier.
    fn set_disk_identifier(&self, loopdev: &str, id: &str) -> Result<()>;
    /// Grows partition `index` to the end of the disk.
    fn grow_partition(&self, loopdev: &str, index: u32) -> Result<()>;
    /// Checks and repairs the filesystem on `device`.
    fn check_filesystem(&self, device: &Path) -> Result<()>;
    /// Grows the filesystem on `device` to fill its partition.
    fn resize_filesystem(&self, device: &Path) -> Result<()>;
    /// Creates a directory and its parents on a mounted partition.
    fn create_dir(&self, path: &Path) -> Result<()>;
    /// Copies a host file onto a mounted partition.
    fn install_file(&self, origin: &Path, destination: &Path) -> Result<()>;
    /// Shrinks or extends a file to exactly `len` bytes.
    fn truncate(&self, path: &Path, len: u64) -> Result<()>;
    /// Removes a file; missing files are not an error.
    fn remove_file(&self, path: &Path) -> Result<()>;
    /// Flushes filesystem buffers.
    fn sync(&self) -> Result<()>;
    /// Runs a command with inherited stdio.
    fn run(&self, cmd: &Cmd) -> Result<()>;
    /// Runs a command and returns its captured stdout.
    fn output(&self, cmd: &Cmd) -> Result<String>;
}

/// An external command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    /// Program name, resolved through `PATH`.
    program: String,
    /// Arguments.
    args: Vec<String>,
    /// Whether the command needs root.
    privileged: bool,
    /// Exit codes treated as success.
    ok_codes: Vec<i32>,
}

impl Cmd {
    /// Starts a command line for `program`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
            ok_codes: vec![0],
        }
    }

    /// Appends an argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    #[must_use]
    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy())
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Marks the command as needing root (`sudo` when not already root).
    #[must_use]
    pub const fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Sets the exit codes that count as success.
    #[must_use]
    pub fn ok_codes(mut self, codes: &[i32]) -> Self {
        self.ok_codes = codes.to_vec();
        self
    }

    /// Program name.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Returns `true` if the command needs root.
    pub const fn is_privileged(&self) -> bool {
        self.privileged
    }

    /// Returns `true` if `code` counts as success.
    pub fn accepts(&self, code: i32) -> bool {
        self.ok_codes.contains(&code)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {arg:?}")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}
