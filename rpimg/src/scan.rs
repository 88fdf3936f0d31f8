//! Raw byte scan of a disk image for surgery placeholders.
//!
//! A placeholder is `<signature><id>` where `id` is 1 to [`MAX_ID_LEN`]
//! bytes of `[A-Za-z0-9_.-]`. The scan works on the raw file, never on a
//! mounted filesystem, because the offsets it reports are later used to
//! patch the image in place.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::AtomicBool;

use crate::{Result, interrupt};

/// Longest placeholder id recognised.
pub const MAX_ID_LEN: usize = 256;

/// Bytes read per chunk.
const CHUNK: usize = 8 * 1024 * 1024;

/// Scans `image` and maps each full placeholder string to the offset of its
/// first occurrence.
///
/// `cancel` is polled between chunks.
pub fn find_all(
    image: &Path,
    signature: &str,
    cancel: &AtomicBool,
) -> Result<BTreeMap<String, u64>> {
    scan_reader(File::open(image)?, signature.as_bytes(), cancel)
}

/// [`find_all`] over any reader.
pub fn scan_reader(
    mut reader: impl Read,
    signature: &[u8],
    cancel: &AtomicBool,
) -> Result<BTreeMap<String, u64>> {
    let mut found = BTreeMap::new();
    let Some(&first) = signature.first() else {
        return Ok(found);
    };
    // Bytes kept back at the end of each chunk so a match that straddles
    // the boundary is seen whole in the next round.
    let window = signature.len() + MAX_ID_LEN;
    let mut chunk = vec![0u8; CHUNK];
    let mut buf: Vec<u8> = Vec::with_capacity(CHUNK + window);
    // File offset of buf[0].
    let mut base: u64 = 0;

    loop {
        interrupt::check(cancel)?;
        let n = read_some(&mut reader, &mut chunk)?;
        let eof = n == 0;
        buf.extend_from_slice(&chunk[..n]);

        let limit = if eof {
            buf.len()
        } else {
            buf.len().saturating_sub(window)
        };
        let mut i = 0;
        while i < limit {
            let Some(pos) = buf[i..limit].iter().position(|&b| b == first) else {
                break;
            };
            let at = i + pos;
            if buf[at..].starts_with(signature) {
                let rest = &buf[at + signature.len()..];
                let id_len = rest
                    .iter()
                    .take(MAX_ID_LEN)
                    .take_while(|b| is_id_byte(**b))
                    .count();
                if id_len > 0 {
                    let full = String::from_utf8_lossy(&buf[at..at + signature.len() + id_len])
                        .into_owned();
                    found.entry(full).or_insert(base + at as u64);
                }
            }
            i = at + 1;
        }

        if eof {
            return Ok(found);
        }
        buf.drain(..limit);
        base += limit as u64;
    }
}

/// Characters allowed in a placeholder id.
const fn is_id_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.')
}

/// `read` that retries on `Interrupted`.
fn read_some(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}
