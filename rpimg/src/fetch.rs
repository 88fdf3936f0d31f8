//! Base image download.
//!
//! Bytes stream into `<dest>.part` and are renamed into place only once the
//! transfer completes, so a cached file is always whole. A cancellation
//! flag is polled between chunks; on cancellation or any error the staging
//! file is removed before the error is returned.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use tracing::{debug, info};

use crate::{Error, Result, interrupt};

/// Bytes between progress log lines.
const PROGRESS_EVERY: u64 = 64 * 1024 * 1024;

/// Staging path of a download into `dest`.
pub fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

/// Downloads `url` into `dest`. Returns the number of bytes written.
pub fn download(url: &str, dest: &Path, cancel: &AtomicBool) -> Result<u64> {
    info!("downloading {url}");
    let resp = ureq::get(url)
        .call()
        .map_err(|e| Error::Download(format!("{url}: {e}")))?;
    let total = resp
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(total) = total {
        debug!("{total} bytes to fetch");
    }
    save(resp.into_body().into_reader(), dest, cancel)
}

/// Streams `reader` into `dest` through its staging file.
pub fn save(reader: impl Read, dest: &Path, cancel: &AtomicBool) -> Result<u64> {
    let staging = staging_path(dest);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    match stream(reader, &staging, cancel) {
        Ok(n) => {
            fs::rename(&staging, dest)?;
            info!("saved {} ({n} bytes)", dest.display());
            Ok(n)
        }
        Err(e) => {
            if let Err(re) = fs::remove_file(&staging)
                && re.kind() != io::ErrorKind::NotFound
            {
                debug!("could not remove {}: {re}", staging.display());
            }
            Err(e)
        }
    }
}

/// Copies until EOF, checking `cancel` between chunks.
fn stream(mut reader: impl Read, staging: &Path, cancel: &AtomicBool) -> Result<u64> {
    let mut out = BufWriter::new(File::create(staging)?);
    let mut buf = vec![0u8; 1024 * 1024];
    let mut written: u64 = 0;
    let mut next_report = PROGRESS_EVERY;
    loop {
        interrupt::check(cancel)?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::Download(e.to_string())),
        };
        out.write_all(&buf[..n])?;
        written += n as u64;
        if written >= next_report {
            info!("{} MiB downloaded", written / (1024 * 1024));
            next_report += PROGRESS_EVERY;
        }
    }
    out.flush()?;
    Ok(written)
}
