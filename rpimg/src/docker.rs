//! Auxiliary container engine used to pre-load images into the root
//! partition.
//!
//! A `docker:dind` container is started with its `/var/lib/docker` bound to
//! the mounted root partition's. Images pulled through that engine land
//! directly in the image's own Docker storage.

use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::disk::bracket;
use crate::host::{Cmd, Host};
use crate::{Error, Result};

/// Image of the auxiliary engine.
pub const DIND_IMAGE: &str = "docker:dind";

/// Port the auxiliary engine listens on.
const ENGINE_PORT: u16 = 2375;

/// A running auxiliary engine.
#[derive(Debug)]
pub struct AuxEngine<'h> {
    /// Host that runs the `docker` client.
    host: &'h dyn Host,
    /// Container name.
    name: String,
    /// `tcp://<ip>:2375`.
    endpoint: String,
}

impl<'h> AuxEngine<'h> {
    /// Starts the engine with its storage at `docker_dir`.
    ///
    /// Waits `settle` for the daemon to come up before asking for its
    /// address.
    pub fn start(host: &'h dyn Host, name: &str, docker_dir: &Path, settle: Duration) -> Result<Self> {
        host.run(&Cmd::new("docker").args(["pull", DIND_IMAGE]))?;
        let volume = format!("{}:/var/lib/docker", docker_dir.display());
        let run = Cmd::new("docker").args([
            "run",
            "--detach",
            "--rm",
            "--privileged",
            "--publish-all",
            "--name",
            name,
            "--volume",
            volume.as_str(),
            "--entrypoint",
            "dockerd",
            DIND_IMAGE,
        ]);
        host.run(&run.arg(format!("--host=tcp://0.0.0.0:{ENGINE_PORT}")))?;

        let mut engine = Self {
            host,
            name: name.to_owned(),
            endpoint: String::new(),
        };
        // From here on the container exists and must be stopped on failure.
        match engine.locate(settle) {
            Ok(endpoint) => {
                info!("auxiliary engine {name} listening on {endpoint}");
                engine.endpoint = endpoint;
                Ok(engine)
            }
            Err(e) => {
                engine.stop();
                Err(e)
            }
        }
    }

    /// Reads the container's IP address.
    fn locate(&self, settle: Duration) -> Result<String> {
        thread::sleep(settle);
        let ip = self.host.output(&Cmd::new("docker").args([
            "inspect",
            "--format",
            "{{.NetworkSettings.IPAddress}}",
            self.name.as_str(),
        ]))?;
        let ip = ip.trim();
        if ip.is_empty() {
            return Err(Error::Command {
                cmd: format!("docker inspect {}", self.name),
                status: "no IP address reported".into(),
                stderr: String::new(),
            });
        }
        Ok(format!("tcp://{ip}:{ENGINE_PORT}"))
    }

    /// Daemon endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Pulls `image` into the engine's storage.
    pub fn pull(&self, image: &str) -> Result<()> {
        info!("pulling {image}");
        self.host
            .run(&Cmd::new("docker").args(["-H", self.endpoint.as_str(), "pull", image]))
    }

    /// Stops the container, logging failures.
    pub fn stop(&self) {
        if let Err(e) = self.host.run(&Cmd::new("docker").args(["stop", self.name.as_str()])) {
            warn!("failed to stop {}: {e}", self.name);
        }
    }
}

/// Starts an engine, pulls every image, then stops it on every exit path.
pub fn preload(
    host: &dyn Host,
    name: &str,
    docker_dir: &Path,
    settle: Duration,
    images: &[String],
) -> Result<()> {
    let engine = AuxEngine::start(host, name, docker_dir, settle)?;
    bracket(
        || {
            info!("transferring {} container images", images.len());
            images.iter().try_for_each(|image| engine.pull(image))
        },
        || {
            engine.stop();
            Ok(())
        },
    )
}
