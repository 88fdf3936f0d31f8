//! In-memory [`Host`] used by the pipeline tests.
//!
//! Loop devices, mounts and the disk identifier are simulated. Mountpoints
//! are real directories, so file operations hit the disk. When a partition
//! is unmounted its files are "sealed" into the image: written back to back
//! (4 KiB aligned) into a region reserved for the partition index, which
//! gives the placeholder scanner real bytes to find.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{Cmd, Host};
use crate::{Error, Result};

/// Bytes of image reserved for each partition index when sealing.
pub(crate) const REGION_BYTES: u64 = 1024 * 1024;

/// Alignment of sealed files inside a region.
const SEAL_ALIGN: u64 = 4096;

/// Mutable simulation state.
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    /// image → loop device.
    pub loopdevs: BTreeMap<PathBuf, String>,
    /// Number of `attach_loopdev` calls.
    pub attach_calls: u32,
    /// mountpoint → device.
    pub mounted: BTreeMap<PathBuf, PathBuf>,
    /// Current disk identifier.
    pub disk_id: String,
    /// Every identifier value handed out by `disk_identifier`, in order.
    pub id_reads: Vec<String>,
    /// Partition indexes whose devices exist.
    pub partitions: BTreeSet<u32>,
    /// Image that unmounted partitions are sealed into.
    pub seal_image: Option<PathBuf>,
    /// When set, `set_disk_identifier` silently keeps the old value.
    pub sticky_id: bool,
    /// Commands whose rendering contains this string fail.
    pub fail_on: Option<String>,
    /// Canned stdout for `output`, keyed by program name.
    pub responses: BTreeMap<String, String>,
    /// Log of every operation.
    pub log: Vec<String>,
}

/// Simulated host. Single-threaded by construction.
#[derive(Debug)]
pub(crate) struct FakeHost {
    /// Simulation state.
    pub state: RefCell<FakeState>,
}

impl FakeHost {
    /// A host where loop devices expose partitions 1 and 2.
    pub fn new() -> Self {
        let state = FakeState {
            disk_id: "0x1a2b3c4d".into(),
            partitions: [1, 2].into_iter().collect(),
            ..FakeState::default()
        };
        Self {
            state: RefCell::new(state),
        }
    }

    /// Seals unmounted partitions into `image`.
    pub fn sealing_into(self, image: &Path) -> Self {
        self.state.borrow_mut().seal_image = Some(image.to_path_buf());
        self
    }

    /// Makes any operation whose log line contains `pattern` fail.
    pub fn failing_on(self, pattern: &str) -> Self {
        self.state.borrow_mut().fail_on = Some(pattern.to_owned());
        self
    }

    /// Returns `true` if nothing is mounted and no loop device is bound.
    pub fn is_clean(&self) -> bool {
        let state = self.state.borrow();
        state.mounted.is_empty() && state.loopdevs.is_empty()
    }

    /// Returns `true` if any logged operation contains `pattern`.
    pub fn logged(&self, pattern: &str) -> bool {
        self.state.borrow().log.iter().any(|l| l.contains(pattern))
    }

    /// Records an operation and applies failure injection.
    fn record(&self, line: String) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let fail = state
            .fail_on
            .as_deref()
            .is_some_and(|pattern| line.contains(pattern));
        state.log.push(line.clone());
        if fail {
            return Err(Error::Command {
                cmd: line,
                status: "exit code 1".into(),
                stderr: "injected failure".into(),
            });
        }
        Ok(())
    }

    /// Writes the files under `mountpoint` into the region of `device`.
    fn seal(&self, mountpoint: &Path, device: &Path) -> Result<()> {
        let Some(image) = self.state.borrow().seal_image.clone() else {
            return Ok(());
        };
        let index: u64 = device
            .to_string_lossy()
            .rsplit('p')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        let mut out = OpenOptions::new().write(true).open(&image)?;
        let mut cursor = index * REGION_BYTES;
        let end = cursor + REGION_BYTES;
        for entry in walkdir::WalkDir::new(mountpoint).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let data = fs::read(entry.path())?;
            let len = data.len() as u64;
            assert!(cursor + len <= end, "fake partition region overflow");
            out.seek(SeekFrom::Start(cursor))?;
            out.write_all(&data)?;
            cursor += len.div_ceil(SEAL_ALIGN).max(1) * SEAL_ALIGN;
        }
        Ok(())
    }
}

impl Host for FakeHost {
    fn find_loopdev(&self, image: &Path) -> Result<Option<String>> {
        Ok(self.state.borrow().loopdevs.get(image).cloned())
    }

    fn attach_loopdev(&self, image: &Path) -> Result<String> {
        self.record(format!("attach {}", image.display()))?;
        let mut state = self.state.borrow_mut();
        state.attach_calls += 1;
        let dev = format!("/dev/loop{}", state.attach_calls + 6);
        state.loopdevs.insert(image.to_path_buf(), dev.clone());
        Ok(dev)
    }

    fn detach_loopdev(&self, loopdev: &str) -> Result<()> {
        self.record(format!("detach {loopdev}"))?;
        self.state
            .borrow_mut()
            .loopdevs
            .retain(|_, dev| dev.as_str() != loopdev);
        Ok(())
    }

    fn device_exists(&self, device: &Path) -> bool {
        let state = self.state.borrow();
        let name = device.to_string_lossy();
        state.loopdevs.values().any(|loopdev| {
            name.strip_prefix(loopdev.as_str())
                .and_then(|rest| rest.strip_prefix('p'))
                .and_then(|n| n.parse().ok())
                .is_some_and(|n: u32| state.partitions.contains(&n))
        })
    }

    fn is_mounted(&self, mountpoint: &Path) -> Result<bool> {
        Ok(self.state.borrow().mounted.contains_key(mountpoint))
    }

    fn mount(&self, device: &Path, mountpoint: &Path) -> Result<()> {
        self.record(format!("mount {} {}", device.display(), mountpoint.display()))?;
        assert!(
            mountpoint.is_dir(),
            "mountpoint {} does not exist",
            mountpoint.display()
        );
        self.state
            .borrow_mut()
            .mounted
            .insert(mountpoint.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mountpoint: &Path) -> Result<()> {
        self.record(format!("umount {}", mountpoint.display()))?;
        let device = self.state.borrow_mut().mounted.remove(mountpoint);
        if let Some(device) = device {
            self.seal(mountpoint, &device)?;
        }
        Ok(())
    }

    fn disk_identifier(&self, _loopdev: &str) -> Result<String> {
        let mut state = self.state.borrow_mut();
        let id = state.disk_id.clone();
        state.id_reads.push(id.clone());
        Ok(id)
    }

    fn set_disk_identifier(&self, loopdev: &str, id: &str) -> Result<()> {
        self.record(format!("set-disk-id {loopdev} {id}"))?;
        let mut state = self.state.borrow_mut();
        if !state.sticky_id {
            state.disk_id = id.to_owned();
        }
        Ok(())
    }

    fn grow_partition(&self, loopdev: &str, index: u32) -> Result<()> {
        self.record(format!("resizepart {loopdev} {index}"))?;
        // Rewriting the partition table assigns a fresh identifier.
        self.state.borrow_mut().disk_id = "0xfeedf00d".into();
        Ok(())
    }

    fn check_filesystem(&self, device: &Path) -> Result<()> {
        self.record(format!("e2fsck {}", device.display()))
    }

    fn resize_filesystem(&self, device: &Path) -> Result<()> {
        self.record(format!("resize2fs {}", device.display()))
    }

    fn create_dir(&self, path: &Path) -> Result<()> {
        self.record(format!("mkdir {}", path.display()))?;
        fs::create_dir_all(path)?;
        Ok(())
    }

    fn install_file(&self, origin: &Path, destination: &Path) -> Result<()> {
        self.record(format!("cp {} {}", origin.display(), destination.display()))?;
        fs::copy(origin, destination)?;
        Ok(())
    }

    fn truncate(&self, path: &Path, len: u64) -> Result<()> {
        self.record(format!("truncate {len} {}", path.display()))?;
        OpenOptions::new().write(true).open(path)?.set_len(len)?;
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        self.record(format!("rm {}", path.display()))?;
        match fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn sync(&self) -> Result<()> {
        self.record("sync".into())
    }

    fn run(&self, cmd: &Cmd) -> Result<()> {
        self.record(cmd.to_string())
    }

    fn output(&self, cmd: &Cmd) -> Result<String> {
        self.record(cmd.to_string())?;
        Ok(self
            .state
            .borrow()
            .responses
            .get(cmd.program())
            .cloned()
            .unwrap_or_default())
    }
}
