//! Surgery plan: where templated placeholder files live inside the sealed
//! image.
//!
//! A template file whose first line is `<signature><id>` is a surgery
//! target. When installed it is grown to a whole number of blocks so the
//! filesystem commits real extents for it, and a [`SurgeryRecord`] is added
//! with an unresolved offset. Once every partition is unmounted the plan is
//! resolved by scanning the raw image for each placeholder.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result, scan};

/// A file that will be patched in place after the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Placeholder id (the first line without the signature).
    pub placeholder: String,
    /// Current file length.
    pub used_bytes: u64,
    /// Length reserved for the patch.
    pub length_bytes: u64,
}

/// One entry of the surgery plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurgeryRecord {
    /// Partition name.
    pub partition: String,
    /// Partition index in the partition table.
    pub partition_id: u32,
    /// Path of the file relative to the partition root.
    pub path: String,
    /// Placeholder id.
    pub placeholder: String,
    /// Offset of the placeholder in the image; `None` until resolved.
    pub offset_bytes: Option<u64>,
    /// Bytes of real content.
    pub used_bytes: u64,
    /// Bytes reserved for the patch window.
    pub length_bytes: u64,
}

/// Ordered list of surgery records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SurgeryPlan {
    /// Records in installation order.
    records: Vec<SurgeryRecord>,
}

/// Reads the first line of `path` and, if it starts with `signature`,
/// describes the surgery target.
///
/// `length_bytes` is the file length rounded up to whole `block_bytes`
/// blocks (at least one block).
pub fn inspect_target(path: &Path, signature: &str, block_bytes: u64) -> Result<Option<Target>> {
    let file = File::open(path)?;
    let used_bytes = file.metadata()?.len();
    // A line longer than this cannot hold a valid placeholder anyway.
    let mut first = Vec::new();
    BufReader::new(file).take(64 * 1024).read_until(b'\n', &mut first)?;
    let Some(rest) = first.strip_prefix(signature.as_bytes()) else {
        return Ok(None);
    };
    let id = String::from_utf8_lossy(rest).trim_end_matches(['\r', '\n']).to_owned();
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_alphanumeric() || b"_-.".contains(&b)) {
        return Err(Error::ValidationFailed {
            path: path.display().to_string(),
            reason: format!("invalid placeholder id {id:?}"),
        });
    }
    if id.len() > scan::MAX_ID_LEN {
        return Err(Error::ValidationFailed {
            path: path.display().to_string(),
            reason: format!("placeholder id longer than {} bytes", scan::MAX_ID_LEN),
        });
    }
    let block = block_bytes.max(1);
    Ok(Some(Target {
        placeholder: id,
        used_bytes,
        length_bytes: used_bytes.div_ceil(block).max(1) * block,
    }))
}

impl SurgeryPlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records in installation order.
    pub fn records(&self) -> &[SurgeryRecord] {
        &self.records
    }

    /// Returns `true` if the plan has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Appends a record with an unresolved offset.
    pub fn push(&mut self, partition: &str, partition_id: u32, path: &str, target: Target) -> Result<()> {
        if self.records.iter().any(|r| r.placeholder == target.placeholder) {
            return Err(Error::DuplicatePlaceholder(target.placeholder));
        }
        self.records.push(SurgeryRecord {
            partition: partition.to_owned(),
            partition_id,
            path: path.to_owned(),
            placeholder: target.placeholder,
            offset_bytes: None,
            used_bytes: target.used_bytes,
            length_bytes: target.length_bytes,
        });
        Ok(())
    }

    /// Fills in every offset by scanning the sealed `image`.
    ///
    /// Fails with [`Error::PlaceholderNotFound`] if any placeholder is
    /// missing and with [`Error::SurgeryWindow`] if a window runs past the
    /// end of the image or overlaps another one. The scan stops with
    /// [`Error::Interrupted`] once `cancel` is raised.
    pub fn resolve(&mut self, image: &Path, signature: &str, cancel: &AtomicBool) -> Result<()> {
        if self.records.is_empty() {
            return Ok(());
        }
        info!("Locating files for surgery in disk image...");
        let found = scan::find_all(image, signature, cancel)?;
        let image_len = std::fs::metadata(image)?.len();

        for record in &mut self.records {
            let full = format!("{signature}{}", record.placeholder);
            let offset = *found.get(&full).ok_or_else(|| Error::PlaceholderNotFound {
                placeholder: full.clone(),
                image: image.to_path_buf(),
            })?;
            if offset + record.length_bytes > image_len {
                return Err(Error::SurgeryWindow {
                    placeholder: record.placeholder.clone(),
                    reason: format!(
                        "window [{offset}, {}) exceeds image size {image_len}",
                        offset + record.length_bytes
                    ),
                });
            }
            debug!("{full} at offset {offset}");
            record.offset_bytes = Some(offset);
        }

        let mut windows: Vec<(u64, u64, &str)> = self
            .records
            .iter()
            .filter_map(|r| Some((r.offset_bytes?, r.length_bytes, r.placeholder.as_str())))
            .collect();
        windows.sort_unstable();
        for pair in windows.windows(2) {
            let (start, len, name) = pair[0];
            let (next, _, other) = pair[1];
            if start + len > next {
                return Err(Error::SurgeryWindow {
                    placeholder: name.to_owned(),
                    reason: format!("overlaps the window of {other:?}"),
                });
            }
        }
        info!("All files located successfully!");
        Ok(())
    }
}
