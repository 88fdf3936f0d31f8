//! Error types for image build operations.

use std::path::PathBuf;

use crate::step::Step;

/// Alias for `Result<T, rpimg::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the image build pipeline.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A partition name is not a key of the partition table.
    #[error("partition {0:?} not declared in partition table")]
    PartitionNotDeclared(String),

    /// The block-special file of a partition does not exist.
    #[error("disk device {} not found", .0.display())]
    DeviceMissing(PathBuf),

    /// A partition operation was attempted while no loop device is bound.
    #[error("disk {} is not bound to a loop device", .0.display())]
    NotBound(PathBuf),

    /// The disk identifier could not be restored after the root resize.
    #[error("disk identifier mismatch after resize: expected {expected}, found {found}")]
    IdentityMismatchAfterResize {
        /// Identifier captured before the resize.
        expected: String,
        /// Identifier read back after the restore attempt.
        found: String,
    },

    /// The root resize left the disk identifier untouched, so a later
    /// read-back cannot show that the restore took effect.
    #[error("disk identifier {0} was not changed by the resize")]
    IdentityUnchangedByResize(String),

    /// A surgery placeholder is missing from the sealed image.
    #[error("the string {placeholder:?} was not found in the disk image {}", image.display())]
    PlaceholderNotFound {
        /// Full placeholder string (signature + id).
        placeholder: String,
        /// Image that was scanned.
        image: PathBuf,
    },

    /// Two template files declare the same placeholder id.
    #[error("placeholder {0:?} is declared by more than one template file")]
    DuplicatePlaceholder(String),

    /// A resolved patch window is out of bounds or overlaps another one.
    #[error("invalid surgery window for {placeholder:?}: {reason}")]
    SurgeryWindow {
        /// Placeholder id of the offending record.
        placeholder: String,
        /// What is wrong with the window.
        reason: String,
    },

    /// A template file was rejected by its registered validator.
    #[error("validation failed for {path}: {reason}")]
    ValidationFailed {
        /// Path of the file relative to its partition root.
        path: String,
        /// Validator message.
        reason: String,
    },

    /// ARM binaries cannot be executed inside the chroot.
    #[error(
        "an error occurred while trying to run an ARM binary from the temporary chroot: {0}\n\
         This usually indicates a misconfiguration of QEMU on the host. Make sure that the \
         packages 'qemu-user-static' and 'binfmt-support' are installed."
    )]
    ChrootExec(String),

    /// An external tool exited unsuccessfully.
    #[error("`{cmd}` failed ({status}){}", fmt_stderr(.stderr))]
    Command {
        /// Rendered command line.
        cmd: String,
        /// Exit status description.
        status: String,
        /// Captured standard error, if any.
        stderr: String,
    },

    /// A required host tool is not on `PATH`.
    #[error("required tool `{0}` not found in PATH")]
    MissingTool(String),

    /// A step was selected while its precondition does not hold.
    #[error("step `{step}` cannot run: {reason}")]
    Precondition {
        /// The step that was refused.
        step: Step,
        /// The unmet requirement.
        reason: String,
    },

    /// A step name is not one of the supported steps.
    #[error("unknown step {0:?}")]
    UnknownStep(String),

    /// The user refused to overwrite an existing output image.
    #[error("refusing to overwrite {}", .0.display())]
    OverwriteDeclined(PathBuf),

    /// The run was interrupted by the user.
    #[error("interrupted")]
    Interrupted,

    /// The base image could not be downloaded.
    #[error("download failed: {0}")]
    Download(String),

    /// The build configuration is invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Formats captured stderr as a suffix for [`Error::Command`].
fn fmt_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {trimmed}")
    }
}
