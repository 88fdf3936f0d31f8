//! Gzipped tarball of the sealed image and its metadata.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use flate2::Compression;
use flate2::write::GzEncoder;
use tracing::{debug, info};

use crate::{Error, Result};

/// Writes `dest` containing each of `files` at the archive root.
///
/// The archive is built next to `dest` and renamed into place, so an
/// interrupted run never leaves a truncated bundle behind.
pub fn bundle(dest: &Path, files: &[&Path]) -> Result<()> {
    let staging = crate::fetch::staging_path(dest);
    let result = write_tarball(&staging, files);
    if let Err(e) = result {
        if let Err(re) = fs::remove_file(&staging)
            && re.kind() != io::ErrorKind::NotFound
        {
            debug!("could not remove {}: {re}", staging.display());
        }
        return Err(e);
    }
    fs::rename(&staging, dest)?;
    info!("bundle written to {}", dest.display());
    Ok(())
}

/// Streams `files` into a gzipped tarball at `path`.
fn write_tarball(path: &Path, files: &[&Path]) -> Result<()> {
    let out = BufWriter::new(File::create(path)?);
    let mut tar = tar::Builder::new(GzEncoder::new(out, Compression::default()));
    for file in files {
        let name = file
            .file_name()
            .ok_or_else(|| Error::Config(format!("cannot archive {}", file.display())))?;
        info!("adding {}", file.display());
        tar.append_path_with_name(file, name)?;
    }
    tar.into_inner()?.finish()?;
    Ok(())
}
