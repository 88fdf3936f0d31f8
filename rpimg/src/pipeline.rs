//! The image build pipeline.
//!
//! [`Pipeline::run`] executes the selected [`Step`]s in their fixed order.
//! Each step's [`Requirement`] is checked first and every step is framed by
//! `Step BEGIN` / `Step END` log lines. Any failure, including a Ctrl-C
//! noticed between or inside steps, releases the disk (partitions first,
//! then the loop device) before the error is returned.
//!
//! Scopes nest strictly: loop device ⊇ partition mount ⊇ nested mount,
//! chroot or auxiliary container. Each inner scope is released before its
//! parent on every exit path.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::chroot::{self, Chroot};
use crate::config::BuildConfig;
use crate::disk::{Binding, VirtualDisk, bracket};
use crate::host::{Cmd, Host};
use crate::stats::{self, BuildStats, Environment, Metadata, TemplateManifest};
use crate::step::{Requirement, Step, StepSet};
use crate::surgery::{SurgeryPlan, inspect_target};
use crate::template::{EntryKind, Template};
use crate::validate::{ValidationContext, ValidatorRegistry};
use crate::{Error, Result, archive, docker, fetch, interrupt};

/// Bytes per GiB.
const GIB: u64 = 1024 * 1024 * 1024;

/// Name of the auxiliary container engine.
pub const AUX_ENGINE_NAME: &str = "rpimg-aux-docker";

/// Asks the user a yes/no question.
pub trait Confirm {
    /// Returns `true` if the user agrees.
    fn confirm(&self, question: &str) -> bool;
}

/// Answers every question with yes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _question: &str) -> bool {
        true
    }
}

/// Runs build steps against one output image.
pub struct Pipeline<'h> {
    /// Validated, immutable configuration.
    config: BuildConfig,
    /// Side-effect backend.
    host: &'h dyn Host,
    /// Overwrite confirmation.
    confirm: &'h dyn Confirm,
    /// Cancellation flag, checked before each step and inside long copies
    /// and scans.
    cancel: &'h AtomicBool,
    /// The output image.
    disk: VirtualDisk<'h>,
    /// Template file validators.
    validators: ValidatorRegistry,
    /// Surgery records collected by `setup`.
    plan: SurgeryPlan,
    /// Build snapshot of the current run.
    stats: Option<BuildStats>,
}

impl std::fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("image", &self.disk.image())
            .field("loopdev", &self.disk.loopdev())
            .field("surgery_records", &self.plan.records().len())
            .finish_non_exhaustive()
    }
}

impl<'h> Pipeline<'h> {
    /// Validates `config` and prepares a pipeline for its output image.
    pub fn new(config: BuildConfig, host: &'h dyn Host, confirm: &'h dyn Confirm) -> Result<Self> {
        config.validate()?;
        let disk = VirtualDisk::new(
            host,
            config.output_image(),
            config.partition_table.clone(),
            config.mount_root.clone(),
        );
        Ok(Self {
            config,
            host,
            confirm,
            cancel: interrupt::flag(),
            disk,
            validators: ValidatorRegistry::standard()?,
            plan: SurgeryPlan::new(),
            stats: None,
        })
    }

    /// Replaces the stock validators.
    #[must_use]
    pub fn with_validators(mut self, validators: ValidatorRegistry) -> Self {
        self.validators = validators;
        self
    }

    /// Polls `cancel` instead of the process-wide SIGINT flag.
    #[must_use]
    pub fn with_cancel(mut self, cancel: &'h AtomicBool) -> Self {
        self.cancel = cancel;
        self
    }

    /// The configuration in use.
    pub const fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// The output disk.
    pub const fn disk(&self) -> &VirtualDisk<'h> {
        &self.disk
    }

    /// Surgery records collected so far.
    pub const fn plan(&self) -> &SurgeryPlan {
        &self.plan
    }

    /// Build snapshot of the last run.
    pub const fn stats(&self) -> Option<&BuildStats> {
        self.stats.as_ref()
    }

    /// Runs every selected step in order.
    ///
    /// On failure the disk is unbound (if bound) before the error returns.
    pub fn run(&mut self, steps: &StepSet) -> Result<()> {
        self.stats = Some(self.initial_stats(steps));
        for step in steps.iter() {
            if let Err(e) = self.run_one(step) {
                if self.disk.is_bound() {
                    warn!("step {step} failed, releasing {}", self.disk.image().display());
                    self.disk.unbind();
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Checks the requirement of `step`, then runs it.
    fn run_one(&mut self, step: Step) -> Result<()> {
        interrupt::check(self.cancel)?;
        self.check(step)?;
        info!("Step BEGIN: {step}");
        match step {
            Step::Download => self.download()?,
            Step::Create => self.create()?,
            Step::Mount => self.mount()?,
            Step::Resize => self.resize()?,
            Step::Upgrade => self.upgrade()?,
            Step::Setup => self.setup()?,
            Step::Docker => self.docker()?,
            Step::Finalize => self.finalize()?,
            Step::Unmount => self.unmount()?,
            Step::Compress => self.compress()?,
        }
        info!("Step END: {step}");
        Ok(())
    }

    /// Fails with [`Error::Precondition`] unless `step` may run now.
    fn check(&mut self, step: Step) -> Result<()> {
        let image = self.config.output_image();
        let unmet = |reason: String| Err(Error::Precondition { step, reason });
        match step.requires() {
            Requirement::None => Ok(()),
            Requirement::Unbound => {
                let bound = self.disk.is_bound()
                    || (image.exists() && self.host.find_loopdev(&image)?.is_some());
                if bound {
                    return unmet(format!("{} is bound to a loop device", image.display()));
                }
                Ok(())
            }
            Requirement::ImageExists => {
                if !image.exists() {
                    return unmet(format!("{} does not exist", image.display()));
                }
                Ok(())
            }
            Requirement::Bound => {
                if !self.disk.is_bound() && image.exists() {
                    self.disk.discover()?;
                }
                if !self.disk.is_bound() {
                    return unmet(format!(
                        "{} is not bound to a loop device (run the mount step)",
                        image.display()
                    ));
                }
                Ok(())
            }
            Requirement::Sealed => {
                let metadata = self.config.output_metadata();
                for path in [&image, &metadata] {
                    if !path.exists() {
                        return unmet(format!("{} does not exist", path.display()));
                    }
                }
                Ok(())
            }
        }
    }

    /// Snapshot of the facts known before any step runs.
    fn initial_stats(&self, steps: &StepSet) -> BuildStats {
        let config = &self.config;
        let (stamp, stamp_human) = stats::stamp_now();
        BuildStats {
            steps: Step::ALL
                .into_iter()
                .map(|s| (s.name().to_owned(), steps.contains(s)))
                .collect(),
            version: config.format_version.clone(),
            input_name: config.input_name(),
            input_url: config.input_url.clone(),
            base_type: config.base_type.clone(),
            base_version: config.base_version.clone(),
            environment: Environment::current(),
            modules: config.module_references(),
            template: TemplateManifest::default(),
            disk_size_gb: config.disk_size_gb,
            stamp,
            stamp_human,
        }
    }

    // -- download -----------------------------------------------------------

    /// Fetches and extracts the base image unless it is cached.
    fn download(&self) -> Result<()> {
        let config = &self.config;
        let workdir = &config.workdir;
        if config.no_cache {
            if *workdir == BuildConfig::default_workdir() {
                if workdir.exists() {
                    info!("clearing cache {}", workdir.display());
                    fs::remove_dir_all(workdir)?;
                }
            } else {
                warn!(
                    "not clearing custom work directory {}; remove it manually",
                    workdir.display()
                );
            }
        }
        fs::create_dir_all(workdir)?;

        let image = config.input_image();
        if image.exists() {
            info!("reusing cached base image {}", image.display());
            return Ok(());
        }
        let zip = config.input_archive();
        if zip.exists() {
            info!("reusing cached archive {}", zip.display());
        } else {
            fetch::download(&config.input_url, &zip, self.cancel)?;
        }

        info!("extracting {}", zip.display());
        let extracted = self
            .host
            .run(
                &Cmd::new("unzip")
                    .arg("-o")
                    .arg_path(&zip)
                    .arg("-d")
                    .arg_path(workdir),
            )
            .and_then(|()| interrupt::check(self.cancel));
        if let Err(e) = extracted {
            remove_if_exists(&image);
            return Err(e);
        }
        if !image.exists() {
            return Err(Error::Download(format!(
                "{} does not contain {}",
                zip.display(),
                image.display()
            )));
        }
        Ok(())
    }

    // -- create -------------------------------------------------------------

    /// Creates the sparse output image and copies the base image into it.
    fn create(&self) -> Result<()> {
        let input = self.config.input_image();
        let output = self.config.output_image();
        if !input.exists() {
            return Err(Error::Precondition {
                step: Step::Create,
                reason: format!("base image {} not found (run the download step)", input.display()),
            });
        }
        if output.exists() {
            let question = format!("File {} already exists. Overwrite?", output.display());
            if !self.confirm.confirm(&question) {
                return Err(Error::OverwriteDeclined(output));
            }
            // Ctrl-C at the prompt leaves the existing image untouched.
            interrupt::check(self.cancel)?;
        }
        let size = self.config.disk_size_gb * GIB;
        let base_len = fs::metadata(&input)?.len();
        if base_len > size {
            return Err(Error::Config(format!(
                "base image ({base_len} bytes) does not fit in {} GiB",
                self.config.disk_size_gb
            )));
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        info!("creating {} ({} GiB)", output.display(), self.config.disk_size_gb);
        let copied = write_image(&input, &output, size, self.cancel).inspect_err(|_| {
            remove_if_exists(&output);
        })?;
        info!("copied {copied} bytes of {}", input.display());
        Ok(())
    }

    // -- mount / unmount ----------------------------------------------------

    /// Binds the output image to a loop device.
    fn mount(&mut self) -> Result<()> {
        match self.disk.bind()? {
            Binding::Existing => warn!(
                "{} is already bound to {}, reusing it",
                self.disk.image().display(),
                self.disk.loopdev().unwrap_or("?")
            ),
            Binding::Created => {}
        }
        Ok(())
    }

    /// Releases every mount and the loop device.
    fn unmount(&mut self) -> Result<()> {
        if !self.disk.is_bound() && self.disk.image().exists() {
            self.disk.discover()?;
        }
        if self.disk.is_bound() {
            self.disk.unbind();
        } else {
            info!("{} is not bound", self.disk.image().display());
        }
        Ok(())
    }

    // -- resize -------------------------------------------------------------

    /// Grows the root partition, preserving the disk identifier.
    fn resize(&mut self) -> Result<()> {
        let root = self.config.root_partition.clone();
        self.disk.existing_partition_device(&root)?;
        self.disk.unmount_partition(&root)?;

        let original = self.disk.disk_identifier()?;
        info!("disk identifier before resize: {original}");
        self.disk.resize_to_fill(&root)?;
        thread::sleep(Duration::from_secs(self.config.settle_secs));

        let changed = self.disk.disk_identifier()?;
        if changed == original {
            return Err(Error::IdentityUnchangedByResize(changed));
        }
        info!("resize changed disk identifier to {changed}, restoring");
        self.disk.set_disk_identifier(&original)?;
        let restored = self.disk.disk_identifier()?;
        if restored != original {
            return Err(Error::IdentityMismatchAfterResize {
                expected: original,
                found: restored,
            });
        }
        info!("disk identifier restored: {restored}");
        Ok(())
    }

    // -- upgrade ------------------------------------------------------------

    /// Upgrades packages inside an emulated chroot of the root partition.
    fn upgrade(&mut self) -> Result<()> {
        let root = self.config.root_partition.clone();
        let boot = self.config.boot_partition.clone();
        self.disk.existing_partition_device(&root)?;
        self.disk.existing_partition_device(&boot)?;
        // Boot gets mounted inside root below.
        self.disk.unmount_partition(&boot)?;

        let root_mnt = self.disk.mount_partition(&root)?;
        let result = self.upgrade_mounted(&root_mnt);
        bracket(|| result, || self.disk.unmount_partition(&root))
    }

    /// Root is mounted: set up `/dev/null`, then run the chroot work.
    fn upgrade_mounted(&mut self, root_mnt: &Path) -> Result<()> {
        let host = self.host;
        let chroot = Chroot::new(host, root_mnt);
        let dev_null = chroot.create_dev_null()?;
        let result = self.upgrade_in_chroot(&chroot);
        bracket(|| result, || host.remove_file(&dev_null))
    }

    /// `/dev/null` exists: check emulation, mount boot, upgrade.
    fn upgrade_in_chroot(&mut self, chroot: &Chroot<'_>) -> Result<()> {
        chroot::register_qemu(self.host)?;
        chroot.probe()?;
        let boot = self.config.boot_partition.clone();
        self.disk
            .mount_partition_at(&boot, &chroot.root().join("boot"))?;
        let result = chroot.upgrade(&self.config.apt_packages, &self.config.chroot_commands);
        bracket(|| result, || self.disk.unmount_partition(&boot))
    }

    // -- setup --------------------------------------------------------------

    /// Installs the template and resolves the surgery plan.
    fn setup(&mut self) -> Result<()> {
        let template = Template::new(&self.config.template_dir);
        let partitions = template.partitions()?;
        for partition in &partitions {
            self.disk.existing_partition_device(partition)?;
        }

        let mut manifest = TemplateManifest::default();
        for partition in &partitions {
            let dest = self.disk.mountpoint(partition);
            for entry in template.entries(partition, EntryKind::Directory, &dest)? {
                manifest.directories.push(format!("{partition}:{}", entry.relative));
            }
            for entry in template.entries(partition, EntryKind::File, &dest)? {
                manifest.files.push(format!("{partition}:{}", entry.relative));
            }
        }
        if let Some(stats) = self.stats.as_mut() {
            stats.template = manifest;
        }

        for partition in &partitions {
            info!("updating partition {partition}");
            let mnt = self.disk.mount_partition(partition)?;
            let result = self.install_partition(&template, partition, &mnt);
            bracket(|| result, || self.disk.unmount_partition(partition))?;
        }
        self.host.sync()?;

        self.plan.resolve(
            self.disk.image(),
            &self.config.placeholder_signature,
            self.cancel,
        )
    }

    /// Copies one partition's template into its mountpoint.
    fn install_partition(&mut self, template: &Template, partition: &str, mnt: &Path) -> Result<()> {
        let index = self.config.partition_table.index(partition)?;
        let ctx = ValidationContext {
            distro: self.config.distro.clone(),
        };

        for dir in template.entries(partition, EntryKind::Directory, mnt)? {
            if !dir.destination.is_dir() {
                info!("NEW: {partition}:{}", dir.relative);
            }
            self.host.create_dir(&dir.destination)?;
        }

        for file in template.entries(partition, EntryKind::File, mnt)? {
            self.validators
                .check(&ctx, partition, &file.relative, &file.origin)?;
            let verb = if file.destination.exists() { "MODIFY" } else { "NEW" };
            info!("{verb}: {partition}:{}", file.relative);
            self.host.install_file(&file.origin, &file.destination)?;

            let target = inspect_target(
                &file.origin,
                &self.config.placeholder_signature,
                self.config.surgery_block_bytes,
            )?;
            if let Some(target) = target {
                info!(
                    "surgery target {} ({} of {} bytes used)",
                    target.placeholder, target.used_bytes, target.length_bytes
                );
                self.host.truncate(&file.destination, target.length_bytes)?;
                self.plan.push(partition, index, &file.relative, target)?;
            }
        }

        if partition == self.config.root_partition {
            self.write_stats(mnt)?;
        }
        self.host.sync()
    }

    /// Writes the build stats beside the output image and into the root
    /// partition.
    fn write_stats(&self, root_mnt: &Path) -> Result<()> {
        let Some(stats) = self.stats.as_ref() else {
            return Ok(());
        };
        let local = self.config.output_stats();
        stats::write_json(&local, stats)?;
        let dest = root_mnt.join(&self.config.stats_location);
        if let Some(parent) = dest.parent() {
            self.host.create_dir(parent)?;
        }
        self.host.install_file(&local, &dest)?;
        info!("build stats written to {}", dest.display());
        Ok(())
    }

    // -- docker -------------------------------------------------------------

    /// Pre-loads module images into the root partition.
    fn docker(&mut self) -> Result<()> {
        let images = self.config.module_references();
        if images.is_empty() {
            info!("no modules configured");
            return Ok(());
        }
        let root = self.config.root_partition.clone();
        self.disk.existing_partition_device(&root)?;
        let mnt = self.disk.mount_partition(&root)?;
        let result = docker::preload(
            self.host,
            AUX_ENGINE_NAME,
            &mnt.join("var").join("lib").join("docker"),
            Duration::from_secs(self.config.settle_secs),
            &images,
        );
        bracket(|| result, || self.disk.unmount_partition(&root))
    }

    // -- finalize / compress ------------------------------------------------

    /// Checksums the image and writes its metadata file.
    fn finalize(&self) -> Result<()> {
        info!("computing SHA-256 of {}", self.disk.image().display());
        let sha256 = self.disk.checksum(self.cancel)?;
        let disk_image = self
            .disk
            .image()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let metadata = Metadata {
            version: self.config.format_version.clone(),
            disk_image,
            sha256,
            surgery_plan: self.plan.records().to_vec(),
        };
        let path = self.config.output_metadata();
        stats::write_json(&path, &metadata)?;
        info!("metadata written to {}", path.display());
        Ok(())
    }

    /// Bundles the image and its metadata.
    fn compress(&self) -> Result<()> {
        let image = self.config.output_image();
        let metadata = self.config.output_metadata();
        archive::bundle(&self.config.output_archive(), &[&image, &metadata])
    }
}

/// Creates `output` as a sparse file of `size` bytes and copies `input`
/// into its start, checking `cancel` between chunks.
fn write_image(input: &Path, output: &Path, size: u64, cancel: &AtomicBool) -> Result<u64> {
    let mut src = File::open(input)?;
    let mut out = File::create(output)?;
    out.set_len(size)?;
    let mut buf = vec![0u8; 4 * 1024 * 1024];
    let mut copied: u64 = 0;
    loop {
        interrupt::check(cancel)?;
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        out.write_all(&buf[..n])?;
        copied += n as u64;
    }
    out.sync_all()?;
    Ok(copied)
}

/// Removes a partially written file, logging failures.
fn remove_if_exists(path: &Path) {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => {
            warn!("could not remove {}: {e}", path.display());
        }
        _ => {}
    }
}
