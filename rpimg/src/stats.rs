//! Build records written alongside the image.
//!
//! [`BuildStats`] describes how an image was produced and is stored inside
//! the root partition; [`Metadata`] describes the sealed image and carries
//! the surgery plan. Both are written once, as pretty JSON with sorted keys.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::surgery::SurgeryRecord;
use crate::{Error, Result};

/// Where and by whom the image was built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Environment {
    /// Build host name.
    pub hostname: String,
    /// Effective user name.
    pub user: String,
    /// Version of this tool.
    pub tool_version: String,
}

impl Environment {
    /// Collects facts about the current process.
    pub fn current() -> Self {
        Self {
            hostname: hostname(),
            user: username(),
            tool_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

/// Template manifest, as `"<partition>:<relative>"` keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateManifest {
    /// Directories created.
    pub directories: Vec<String>,
    /// Files installed.
    pub files: Vec<String>,
}

/// Snapshot of a build, stored inside the image.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildStats {
    /// Step name → whether it was selected for this run.
    pub steps: BTreeMap<String, bool>,
    /// Metadata format version.
    pub version: String,
    /// Base image file name.
    pub input_name: String,
    /// Base image download URL.
    pub input_url: String,
    /// Base distribution name.
    pub base_type: String,
    /// Base distribution version.
    pub base_version: String,
    /// Build host facts.
    pub environment: Environment,
    /// Container image references pre-loaded into the image.
    pub modules: Vec<String>,
    /// Installed template entries.
    pub template: TemplateManifest,
    /// Size of the output disk in GiB.
    pub disk_size_gb: u64,
    /// Build start, seconds since the Unix epoch.
    pub stamp: f64,
    /// Build start, RFC 3339.
    pub stamp_human: String,
}

/// Metadata of a sealed image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metadata {
    /// Metadata format version.
    pub version: String,
    /// Image file name.
    pub disk_image: String,
    /// SHA-256 of the image, lowercase hex.
    pub sha256: String,
    /// Resolved surgery plan.
    pub surgery_plan: Vec<SurgeryRecord>,
}

/// Current time as (Unix seconds, RFC 3339 string).
pub fn stamp_now() -> (f64, String) {
    let now = OffsetDateTime::now_utc();
    #[allow(clippy::cast_precision_loss)]
    let secs = now.unix_timestamp_nanos() as f64 / 1e9;
    let human = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());
    (secs, human)
}

/// Writes `value` as pretty JSON with sorted keys, creating parent
/// directories.
pub fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    // Round-tripping through `Value` sorts map keys.
    let sorted = serde_json::to_value(value)?;
    let mut text = serde_json::to_string_pretty(&sorted)?;
    text.push('\n');
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, text).map_err(Error::from)
}

/// Host name, or `"unknown"`.
#[cfg(unix)]
fn hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

#[cfg(not(unix))]
fn hostname() -> String {
    "unknown".into()
}

/// Effective user name, or `"unknown"`.
#[cfg(unix)]
fn username() -> String {
    nix::unistd::User::from_uid(nix::unistd::geteuid())
        .ok()
        .flatten()
        .map_or_else(|| "unknown".into(), |user| user.name)
}

#[cfg(not(unix))]
fn username() -> String {
    "unknown".into()
}
