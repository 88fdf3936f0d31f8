//! Build configuration.
//!
//! A [`BuildConfig`] is assembled once (defaults, then an optional JSON
//! file, then command-line overrides), checked with
//! [`BuildConfig::validate`] and never modified afterwards.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::disk::PartitionTable;
use crate::{Error, Result};

/// A container image to pre-load into the root partition.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    /// Registry namespace.
    pub owner: String,
    /// Repository name.
    pub module: String,
    /// Explicit tag; defaults to the distro name.
    #[serde(default)]
    pub tag: Option<String>,
}

impl ModuleImage {
    /// Creates a module reference.
    pub fn new(owner: impl Into<String>, module: impl Into<String>, tag: Option<String>) -> Self {
        Self {
            owner: owner.into(),
            module: module.into(),
            tag,
        }
    }

    /// Full image reference, e.g. `duckietown/dt-core:daffy-arm32v7`.
    pub fn reference(&self, distro: &str, arch: &str) -> String {
        let tag = self.tag.as_deref().unwrap_or(distro);
        format!("{}/{}:{tag}-{arch}", self.owner, self.module)
    }
}

/// Everything a build needs to know.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Partition name → index.
    pub partition_table: PartitionTable,
    /// Name of the boot partition.
    pub boot_partition: String,
    /// Name of the root partition.
    pub root_partition: String,
    /// Size of the output disk in GiB.
    pub disk_size_gb: u64,
    /// Format version written into stats and metadata.
    pub format_version: String,
    /// Base distribution name.
    pub base_type: String,
    /// Base distribution version.
    pub base_version: String,
    /// Download URL of the zipped base image.
    pub input_url: String,
    /// Download and extraction directory.
    pub workdir: PathBuf,
    /// Directory receiving the output image and its sidecar files.
    pub output_dir: PathBuf,
    /// Prefix of output file names.
    pub output_prefix: String,
    /// Root of the disk template tree.
    pub template_dir: PathBuf,
    /// Directory holding per-partition mountpoints.
    pub mount_root: PathBuf,
    /// Prefix marking a surgery placeholder.
    pub placeholder_signature: String,
    /// Allocation unit of surgery windows.
    pub surgery_block_bytes: u64,
    /// Location of the build stats inside the root partition.
    pub stats_location: String,
    /// Distribution name used for image tags and validation.
    pub distro: String,
    /// Architecture suffix of module image tags.
    pub arch: String,
    /// Container images to pre-load.
    pub modules: Vec<ModuleImage>,
    /// Extra APT packages installed during the upgrade.
    pub apt_packages: Vec<String>,
    /// Extra shell commands run inside the chroot during the upgrade.
    pub chroot_commands: Vec<String>,
    /// Seconds to wait for the kernel to settle after repartitioning.
    pub settle_secs: u64,
    /// Discard cached downloads before fetching.
    pub no_cache: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        let base_version = "1.11.1".to_owned();
        Self {
            partition_table: PartitionTable::new([("HypriotOS", 1), ("root", 2)]),
            boot_partition: "HypriotOS".into(),
            root_partition: "root".into(),
            disk_size_gb: 8,
            format_version: "1".into(),
            base_type: "HypriotOS".into(),
            input_url: format!(
                "https://github.com/hypriot/image-builder-rpi/releases/download/\
                 v{base_version}/hypriotos-rpi-v{base_version}.img.zip"
            ),
            base_version,
            workdir: Self::default_workdir(),
            output_dir: PathBuf::from("."),
            output_prefix: "sd-".into(),
            template_dir: PathBuf::from("template"),
            mount_root: std::env::temp_dir().join("rpimg").join("mnt"),
            placeholder_signature: "DT_PLACEHOLDER::".into(),
            surgery_block_bytes: 4096,
            stats_location: "data/stats/disk_image/build.json".into(),
            distro: "daffy".into(),
            arch: "arm32v7".into(),
            modules: Vec::new(),
            apt_packages: Vec::new(),
            chroot_commands: Vec::new(),
            settle_secs: 5,
            no_cache: false,
        }
    }
}

impl BuildConfig {
    /// Loads a JSON configuration file; missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    /// Default work directory: `$RPIMG_HOME`, else the user cache dir.
    pub fn default_workdir() -> PathBuf {
        if let Ok(home) = std::env::var("RPIMG_HOME") {
            return PathBuf::from(home);
        }
        if let Ok(xdg) = std::env::var("XDG_CACHE_HOME") {
            return PathBuf::from(xdg).join("rpimg");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".cache/rpimg");
        }
        std::env::temp_dir().join("rpimg")
    }

    /// Checks the invariants every step relies on.
    pub fn validate(&self) -> Result<()> {
        for name in [&self.boot_partition, &self.root_partition] {
            if !self.partition_table.contains(name) {
                return Err(Error::Config(format!(
                    "partition {name:?} is not in the partition table"
                )));
            }
        }
        if self.disk_size_gb == 0 {
            return Err(Error::Config("disk_size_gb must be positive".into()));
        }
        if self.surgery_block_bytes == 0 {
            return Err(Error::Config("surgery_block_bytes must be positive".into()));
        }
        if self.placeholder_signature.is_empty() || !self.placeholder_signature.is_ascii() {
            return Err(Error::Config(
                "placeholder_signature must be a non-empty ASCII string".into(),
            ));
        }
        if Path::new(&self.stats_location).is_absolute() {
            return Err(Error::Config(
                "stats_location must be relative to the root partition".into(),
            ));
        }
        Ok(())
    }

    /// Base image name without extension, e.g. `hypriotos-rpi-v1.11.1`.
    pub fn input_name(&self) -> String {
        format!("hypriotos-rpi-v{}", self.base_version)
    }

    /// Extracted base image.
    pub fn input_image(&self) -> PathBuf {
        self.workdir.join(format!("{}.img", self.input_name()))
    }

    /// Downloaded archive of the base image.
    pub fn input_archive(&self) -> PathBuf {
        self.workdir.join(format!("{}.img.zip", self.input_name()))
    }

    /// `<output_dir>/<prefix><input name>.<ext>`.
    fn output_file(&self, ext: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}{}.{ext}", self.output_prefix, self.input_name()))
    }

    /// Output disk image.
    pub fn output_image(&self) -> PathBuf {
        self.output_file("img")
    }

    /// Metadata file beside the output image.
    pub fn output_metadata(&self) -> PathBuf {
        self.output_file("json")
    }

    /// Copy of the build stats beside the output image.
    pub fn output_stats(&self) -> PathBuf {
        self.output_file("stats")
    }

    /// Compressed bundle of image and metadata.
    pub fn output_archive(&self) -> PathBuf {
        self.output_file("tar.gz")
    }

    /// Full references of every module image.
    pub fn module_references(&self) -> Vec<String> {
        self.modules
            .iter()
            .map(|m| m.reference(&self.distro, &self.arch))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = BuildConfig::default();
        config.validate().unwrap();
        assert_eq!(config.partition_table.index("root").unwrap(), 2);
        assert!(config.input_url.ends_with("/v1.11.1/hypriotos-rpi-v1.11.1.img.zip"));
    }

    #[test]
    fn output_names_share_a_stem() {
        let config = BuildConfig {
            output_dir: PathBuf::from("/out"),
            workdir: PathBuf::from("/work"),
            ..BuildConfig::default()
        };
        assert_eq!(config.input_image(), Path::new("/work/hypriotos-rpi-v1.11.1.img"));
        assert_eq!(config.input_archive(), Path::new("/work/hypriotos-rpi-v1.11.1.img.zip"));
        assert_eq!(config.output_image(), Path::new("/out/sd-hypriotos-rpi-v1.11.1.img"));
        assert_eq!(config.output_metadata(), Path::new("/out/sd-hypriotos-rpi-v1.11.1.json"));
        assert_eq!(config.output_stats(), Path::new("/out/sd-hypriotos-rpi-v1.11.1.stats"));
        assert_eq!(config.output_archive(), Path::new("/out/sd-hypriotos-rpi-v1.11.1.tar.gz"));
    }

    #[test]
    fn load_fills_missing_keys_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("build.json");
        fs::write(
            &path,
            r#"{"disk_size_gb": 16, "modules": [{"owner": "duckietown", "module": "dt-core"}]}"#,
        )
        .unwrap();
        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.disk_size_gb, 16);
        assert_eq!(config.root_partition, "root");
        assert_eq!(config.module_references(), vec!["duckietown/dt-core:daffy-arm32v7"]);
    }

    #[test]
    fn load_reports_malformed_files() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("build.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(BuildConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_undeclared_root() {
        let config = BuildConfig {
            root_partition: "rootfs".into(),
            ..BuildConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn explicit_tag_overrides_distro() {
        let module = ModuleImage::new("duckietown", "portainer", Some("v1".into()));
        assert_eq!(module.reference("daffy", "arm32v7"), "duckietown/portainer:v1-arm32v7");
    }
}
