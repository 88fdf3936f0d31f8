//! Disk template: the desired contents of each partition.
//!
//! ```text
//! {root}/
//!   {partition}/          — one directory per partition table entry
//!     {relative/path}     — copied to {mountpoint}/{relative/path}
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use walkdir::WalkDir;

use crate::Result;

/// Kind of template entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum EntryKind {
    /// A directory to create.
    Directory,
    /// A file to install.
    File,
}

/// One object of the template tree and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    /// Partition the entry belongs to.
    pub partition: String,
    /// Path relative to the partition root, with a leading `/`.
    pub relative: String,
    /// Source path inside the template tree.
    pub origin: PathBuf,
    /// Destination path under the partition's mountpoint.
    pub destination: PathBuf,
    /// Directory or file.
    pub kind: EntryKind,
}

/// A template tree on the host.
#[derive(Debug, Clone)]
pub struct Template {
    /// Template root directory.
    root: PathBuf,
}

impl Template {
    /// Opens the template rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Template root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Names of the top-level directories, i.e. the partitions to update.
    pub fn partitions(&self) -> Result<BTreeSet<String>> {
        let mut names = BTreeSet::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                names.insert(name.to_owned());
            }
        }
        Ok(names)
    }

    /// Entries of `kind` under `partition`, sorted by path, mapped below
    /// `dest_root`.
    ///
    /// Symlinks are listed as files and never followed.
    pub fn entries(
        &self,
        partition: &str,
        kind: EntryKind,
        dest_root: &Path,
    ) -> Result<Vec<TemplateEntry>> {
        let base = self.root.join(partition);
        let mut out = Vec::new();
        for entry in WalkDir::new(&base).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            let file_type = entry.file_type();
            let entry_kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_file() || file_type.is_symlink() {
                EntryKind::File
            } else {
                continue;
            };
            if entry_kind != kind {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&base) else {
                continue;
            };
            out.push(TemplateEntry {
                partition: partition.to_owned(),
                relative: format!("/{}", rel.to_string_lossy()),
                origin: entry.path().to_path_buf(),
                destination: dest_root.join(rel),
                kind,
            });
        }
        Ok(out)
    }
}
