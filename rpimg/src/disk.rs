//! Raw disk image management: loop devices, partitions and mount state.
//!
//! A [`VirtualDisk`] is a disk image file plus its [`PartitionTable`]. It is
//! either *unbound* or *bound* to a loop device; partitions can only be
//! mounted while the disk is bound.
//!
//! # Layout
//!
//! ```text
//! {image}                      — raw disk image (MBR, N partitions)
//! {loopdev}                    — e.g. /dev/loop7 once bound
//! {loopdev}p{index}            — partition block devices
//! {mount_root}/{partition}/    — per-partition mountpoints
//! ```

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::host::Host;
use crate::{Error, Result, interrupt};

/// Partition name → 1-based partition index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionTable(BTreeMap<String, u32>);

impl PartitionTable {
    /// Builds a table from `(name, index)` pairs.
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self(entries.into_iter().map(|(n, i)| (n.into(), i)).collect())
    }

    /// Returns the index of `name`, or [`Error::PartitionNotDeclared`].
    pub fn index(&self, name: &str) -> Result<u32> {
        self.0
            .get(name)
            .copied()
            .ok_or_else(|| Error::PartitionNotDeclared(name.to_owned()))
    }

    /// Returns `true` if `name` is declared.
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Declared partitions, ordered by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(n, i)| (n.as_str(), *i))
    }
}

/// How [`VirtualDisk::bind`] obtained its loop device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Binding {
    /// The disk was already bound (by this process or a previous run).
    Existing,
    /// A new loop device was attached.
    Created,
}

/// A disk image file and the loop/mount state derived from it.
#[derive(Debug)]
pub struct VirtualDisk<'h> {
    /// Image file path.
    image: PathBuf,
    /// Declared partitions.
    table: PartitionTable,
    /// Directory holding one mountpoint per partition.
    mount_root: PathBuf,
    /// Bound loop device, if any.
    loopdev: Option<String>,
    /// Partition name → active mountpoint.
    mounts: BTreeMap<String, PathBuf>,
    /// Side-effect backend.
    host: &'h dyn Host,
}

impl<'h> VirtualDisk<'h> {
    /// Creates an unbound disk for `image`.
    pub fn new(
        host: &'h dyn Host,
        image: impl Into<PathBuf>,
        table: PartitionTable,
        mount_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image: image.into(),
            table,
            mount_root: mount_root.into(),
            loopdev: None,
            mounts: BTreeMap::new(),
            host,
        }
    }

    /// Image file path.
    pub fn image(&self) -> &Path {
        &self.image
    }

    /// Declared partitions.
    pub const fn table(&self) -> &PartitionTable {
        &self.table
    }

    /// Bound loop device, if any.
    pub fn loopdev(&self) -> Option<&str> {
        self.loopdev.as_deref()
    }

    /// Returns `true` if the disk is bound to a loop device.
    pub const fn is_bound(&self) -> bool {
        self.loopdev.is_some()
    }

    /// Returns `true` if partition `name` is currently mounted.
    pub fn is_mounted(&self, name: &str) -> bool {
        self.mounts.contains_key(name)
    }

    /// Deterministic mountpoint of partition `name`.
    pub fn mountpoint(&self, name: &str) -> PathBuf {
        self.mount_root.join(name)
    }

    /// Looks for a loop device already bound to the image and adopts it.
    ///
    /// Returns `true` if one was found.
    pub fn discover(&mut self) -> Result<bool> {
        if self.loopdev.is_some() {
            return Ok(true);
        }
        if let Some(dev) = self.host.find_loopdev(&self.image)? {
            debug!("found {} bound to {dev}", self.image.display());
            self.loopdev = Some(dev);
            return Ok(true);
        }
        Ok(false)
    }

    /// Binds the image to a loop device, reusing an existing binding.
    pub fn bind(&mut self) -> Result<Binding> {
        if self.discover()? {
            return Ok(Binding::Existing);
        }
        let dev = self.host.attach_loopdev(&self.image)?;
        info!("disk {} bound to {dev}", self.image.display());
        self.loopdev = Some(dev);
        Ok(Binding::Created)
    }

    /// Returns the bound loop device or [`Error::NotBound`].
    fn require_loopdev(&self) -> Result<&str> {
        self.loopdev
            .as_deref()
            .ok_or_else(|| Error::NotBound(self.image.clone()))
    }

    /// Block device of partition `name` (`{loopdev}p{index}`).
    pub fn partition_device(&self, name: &str) -> Result<PathBuf> {
        let index = self.table.index(name)?;
        let loopdev = self.require_loopdev()?;
        Ok(PathBuf::from(format!("{loopdev}p{index}")))
    }

    /// Like [`partition_device`](Self::partition_device), and also checks
    /// that the block device exists.
    pub fn existing_partition_device(&self, name: &str) -> Result<PathBuf> {
        let device = self.partition_device(name)?;
        if !self.host.device_exists(&device) {
            return Err(Error::DeviceMissing(device));
        }
        Ok(device)
    }

    /// Mounts partition `name` at its mountpoint and returns the mountpoint.
    ///
    /// A partition that is already mounted (by this object or found mounted
    /// on the host) is adopted, never mounted twice.
    pub fn mount_partition(&mut self, name: &str) -> Result<PathBuf> {
        let mnt = self.mountpoint(name);
        self.mount_partition_at(name, &mnt)
    }

    /// Mounts partition `name` at an explicit `mnt`, e.g. nested inside
    /// another mounted partition.
    pub fn mount_partition_at(&mut self, name: &str, mnt: &Path) -> Result<PathBuf> {
        let device = self.existing_partition_device(name)?;
        if let Some(mnt) = self.mounts.get(name) {
            return Ok(mnt.clone());
        }
        let mnt = mnt.to_path_buf();
        if self.host.is_mounted(&mnt)? {
            warn!("partition {name} already mounted at {}", mnt.display());
        } else {
            std::fs::create_dir_all(&mnt)?;
            self.host.mount(&device, &mnt)?;
            debug!("mounted {} at {}", device.display(), mnt.display());
        }
        self.mounts.insert(name.to_owned(), mnt.clone());
        Ok(mnt)
    }

    /// Unmounts partition `name`. Unmounted partitions are a no-op.
    pub fn unmount_partition(&mut self, name: &str) -> Result<()> {
        let Some(mnt) = self.mounts.remove(name) else {
            return Ok(());
        };
        self.host.unmount(&mnt)?;
        debug!("unmounted {}", mnt.display());
        Ok(())
    }

    /// Unmounts every mounted partition, logging failures.
    pub fn unmount_all(&mut self) {
        // Deepest mountpoints first so nested mounts are released before
        // their parents.
        let mut names: Vec<(usize, String)> = self
            .mounts
            .iter()
            .map(|(name, mnt)| (mnt.components().count(), name.clone()))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        for (_, name) in names {
            if let Err(e) = self.unmount_partition(&name) {
                warn!("failed to unmount partition {name}: {e}");
            }
        }
    }

    /// Unmounts every partition, then releases the loop device.
    ///
    /// Never fails: this runs on cleanup paths.
    pub fn unbind(&mut self) {
        self.unmount_all();
        if let Some(dev) = self.loopdev.take() {
            match self.host.detach_loopdev(&dev) {
                Ok(()) => info!("disk {} released from {dev}", self.image.display()),
                Err(e) => warn!("failed to release {dev}: {e}"),
            }
        }
    }

    /// Runs `f` with partition `name` mounted; unmounts on every exit path.
    pub fn with_partition<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&Path) -> Result<T>,
    ) -> Result<T> {
        let mnt = self.mount_partition(name)?;
        bracket(|| f(&mnt), || self.unmount_partition(name))
    }

    /// Reads the disk identifier of the partition table.
    pub fn disk_identifier(&self) -> Result<String> {
        self.host.disk_identifier(self.require_loopdev()?)
    }

    /// Writes the disk identifier of the partition table.
    pub fn set_disk_identifier(&self, id: &str) -> Result<()> {
        self.host.set_disk_identifier(self.require_loopdev()?, id)
    }

    /// Grows partition `name` to the end of the disk, then checks and grows
    /// its filesystem.
    ///
    /// Rewriting the partition table changes the disk identifier; callers
    /// that need it stable must restore it afterwards.
    pub fn resize_to_fill(&self, name: &str) -> Result<()> {
        let index = self.table.index(name)?;
        let device = self.existing_partition_device(name)?;
        let loopdev = self.require_loopdev()?;
        self.host.grow_partition(loopdev, index)?;
        self.host.check_filesystem(&device)?;
        self.host.resize_filesystem(&device)
    }

    /// SHA-256 of the whole image, lowercase hex. Stops early once
    /// `cancel` is raised.
    pub fn checksum(&self, cancel: &AtomicBool) -> Result<String> {
        sha256_file(&self.image, cancel)
    }
}

/// Runs `body`, then `release` on every exit path.
///
/// A release failure is returned when `body` succeeded and only logged when
/// `body` already failed, so the original error reaches the caller.
pub fn bracket<T>(
    body: impl FnOnce() -> Result<T>,
    release: impl FnOnce() -> Result<()>,
) -> Result<T> {
    match body() {
        Ok(value) => {
            release()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(re) = release() {
                warn!("cleanup failed while handling an error: {re}");
            }
            Err(e)
        }
    }
}

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub fn sha256_file(path: &Path, cancel: &AtomicBool) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        interrupt::check(cancel)?;
        let n = match file.read(&mut buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => other?,
        };
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    fn table() -> PartitionTable {
        PartitionTable::new([("HypriotOS", 1), ("root", 2)])
    }

    #[test]
    fn bind_reuses_existing_loop_device() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("disk.img");

        let mut first = VirtualDisk::new(&host, &image, table(), tmp.path().join("mnt"));
        assert_eq!(first.bind().unwrap(), Binding::Created);

        let mut second = VirtualDisk::new(&host, &image, table(), tmp.path().join("mnt"));
        assert_eq!(second.bind().unwrap(), Binding::Existing);
        assert_eq!(first.loopdev(), second.loopdev());
        assert_eq!(host.state.borrow().attach_calls, 1);
    }

    #[test]
    fn mount_requires_declared_partition() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk = VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path());
        disk.bind().unwrap();
        let err = disk.mount_partition("data").unwrap_err();
        assert!(matches!(err, Error::PartitionNotDeclared(name) if name == "data"));
    }

    #[test]
    fn mount_requires_bound_disk() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk = VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path());
        assert!(matches!(disk.mount_partition("root"), Err(Error::NotBound(_))));
    }

    #[test]
    fn mount_reports_missing_device() {
        let host = FakeHost::new();
        host.state.borrow_mut().partitions.remove(&2);
        let tmp = tempfile::tempdir().unwrap();
        let mut disk = VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path());
        disk.bind().unwrap();
        let err = disk.mount_partition("root").unwrap_err();
        assert!(matches!(err, Error::DeviceMissing(dev) if dev.ends_with("loop7p2")));
    }

    #[test]
    fn mount_is_idempotent_and_unmount_is_noop_when_unmounted() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk =
            VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path().join("mnt"));
        disk.bind().unwrap();

        let a = disk.mount_partition("root").unwrap();
        let b = disk.mount_partition("root").unwrap();
        assert_eq!(a, b);
        let mounts = host.state.borrow().log.iter().filter(|l| l.starts_with("mount ")).count();
        assert_eq!(mounts, 1);

        disk.unmount_partition("root").unwrap();
        disk.unmount_partition("root").unwrap();
        disk.unmount_partition("HypriotOS").unwrap();
        assert!(!disk.is_mounted("root"));
    }

    #[test]
    fn with_partition_unmounts_on_error() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk =
            VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path().join("mnt"));
        disk.bind().unwrap();

        let result: Result<()> =
            disk.with_partition("root", |_| Err(Error::Config("boom".into())));
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(!disk.is_mounted("root"));
        assert!(host.state.borrow().mounted.is_empty());
    }

    #[test]
    fn unmount_all_releases_nested_mounts_first() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk =
            VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path().join("mnt"));
        disk.bind().unwrap();
        let root = disk.mount_partition("root").unwrap();
        disk.mount_partition_at("HypriotOS", &root.join("boot")).unwrap();

        disk.unmount_all();
        let log = host.state.borrow().log.clone();
        let umounts: Vec<&String> = log.iter().filter(|l| l.starts_with("umount ")).collect();
        assert_eq!(umounts.len(), 2);
        assert!(umounts[0].ends_with("root/boot"));
        assert!(host.state.borrow().mounted.is_empty());
    }

    #[test]
    fn unbind_releases_everything() {
        let host = FakeHost::new();
        let tmp = tempfile::tempdir().unwrap();
        let mut disk =
            VirtualDisk::new(&host, tmp.path().join("d.img"), table(), tmp.path().join("mnt"));
        disk.bind().unwrap();
        disk.mount_partition("root").unwrap();
        disk.mount_partition("HypriotOS").unwrap();

        disk.unbind();
        assert!(!disk.is_bound());
        assert!(host.is_clean());
        disk.unbind();
    }

    #[test]
    fn checksum_matches_known_digest() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("d.img");
        std::fs::write(&image, b"abc").unwrap();
        let host = FakeHost::new();
        let disk = VirtualDisk::new(&host, &image, table(), tmp.path());
        assert_eq!(
            disk.checksum(&AtomicBool::new(false)).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn checksum_stops_when_cancelled() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("d.img");
        std::fs::write(&image, vec![0u8; 4096]).unwrap();
        let err = sha256_file(&image, &AtomicBool::new(true)).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }
}
