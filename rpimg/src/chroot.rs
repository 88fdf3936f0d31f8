//! Running ARM binaries inside the image's root filesystem.
//!
//! The host registers QEMU user-mode emulators with `binfmt_misc` through a
//! privileged helper container, after which `chroot` into the mounted root
//! partition runs the image's own binaries.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::host::{Cmd, Host};
use crate::{Error, Result};

/// Image that registers the QEMU `binfmt_misc` handlers.
pub const QEMU_REGISTER_IMAGE: &str = "multiarch/qemu-user-static:register";

/// Options passed to every non-interactive `apt` invocation.
const APT_FLAGS: &str = "--yes --no-install-recommends \
    -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold";

/// Registers QEMU emulators for foreign architectures on the host.
pub fn register_qemu(host: &dyn Host) -> Result<()> {
    info!("registering QEMU binfmt handlers");
    host.run(
        &Cmd::new("docker")
            .args(["run", "--rm", "--privileged", QEMU_REGISTER_IMAGE, "--reset"]),
    )
}

/// A mounted root filesystem used as a chroot.
#[derive(Debug)]
pub struct Chroot<'h> {
    /// Host that runs the commands.
    host: &'h dyn Host,
    /// Mountpoint of the root partition.
    root: PathBuf,
}

impl<'h> Chroot<'h> {
    /// Wraps the root filesystem mounted at `root`.
    pub fn new(host: &'h dyn Host, root: impl Into<PathBuf>) -> Self {
        Self {
            host,
            root: root.into(),
        }
    }

    /// Mountpoint of the root partition.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `chroot <root> /bin/bash -c <script>`.
    pub fn command(&self, script: &str) -> Cmd {
        Cmd::new("chroot")
            .arg_path(&self.root)
            .args(["/bin/bash", "-c", script])
            .privileged()
    }

    /// Runs `script` inside the chroot.
    pub fn run(&self, script: &str) -> Result<()> {
        debug!("chroot: {script}");
        self.host.run(&self.command(script))
    }

    /// Checks that the image's binaries can be executed.
    ///
    /// Any failure is reported as [`Error::ChrootExec`], whose message
    /// explains how to fix the host's QEMU setup.
    pub fn probe(&self) -> Result<()> {
        let out = self
            .host
            .output(&self.command("echo \"Hello from an ARM chroot!\""))
            .map_err(|e| Error::ChrootExec(e.to_string()))?;
        if out.contains("Exec format error") {
            return Err(Error::ChrootExec("Exec format error".into()));
        }
        debug!("chroot says: {}", out.trim());
        Ok(())
    }

    /// Creates a world-writable `/dev/null` placeholder inside the chroot.
    pub fn create_dev_null(&self) -> Result<PathBuf> {
        let path = self.root.join("dev").join("null");
        self.host.run(&Cmd::new("touch").arg_path(&path).privileged())?;
        self.host
            .run(&Cmd::new("chmod").arg("777").arg_path(&path).privileged())?;
        Ok(path)
    }

    /// Full upgrade, then the extra `packages`, then each of `commands`.
    pub fn upgrade(&self, packages: &[String], commands: &[String]) -> Result<()> {
        info!("upgrading packages inside the image");
        self.run(&format!("apt update && apt {APT_FLAGS} full-upgrade"))?;
        if !packages.is_empty() {
            info!("installing {}", packages.join(", "));
            self.run(&format!(
                "DEBIAN_FRONTEND=noninteractive apt install {APT_FLAGS} {}",
                packages.join(" ")
            ))?;
        }
        for command in commands {
            self.run(command)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::fake::FakeHost;

    #[test]
    fn probe_detects_exec_format_error() {
        let host = FakeHost::new();
        host.state
            .borrow_mut()
            .responses
            .insert("chroot".into(), "chroot: failed to run command: Exec format error".into());
        let chroot = Chroot::new(&host, "/mnt/root");
        let err = chroot.probe().unwrap_err();
        assert!(matches!(err, Error::ChrootExec(_)));
        assert!(err.to_string().contains("qemu-user-static"));
    }

    #[test]
    fn probe_maps_command_failure() {
        let host = FakeHost::new().failing_on("Hello from an ARM chroot");
        let chroot = Chroot::new(&host, "/mnt/root");
        assert!(matches!(chroot.probe(), Err(Error::ChrootExec(_))));
    }

    #[test]
    fn upgrade_runs_packages_then_commands() {
        let host = FakeHost::new();
        let chroot = Chroot::new(&host, "/mnt/root");
        chroot
            .upgrade(&["rsync".into(), "i2c-tools".into()], &["systemctl enable ssh".into()])
            .unwrap();
        let log = host.state.borrow().log.clone();
        assert_eq!(log.len(), 3);
        assert!(log[0].contains("full-upgrade"));
        assert!(log[1].contains("apt install") && log[1].contains("rsync i2c-tools"));
        assert!(log[2].ends_with(r#""systemctl enable ssh""#));
    }

    #[test]
    fn upgrade_skips_empty_package_list() {
        let host = FakeHost::new();
        Chroot::new(&host, "/mnt/root").upgrade(&[], &[]).unwrap();
        assert_eq!(host.state.borrow().log.len(), 1);
    }
}
