//! Disk image assembly for Raspberry Pi SD cards.
//!
//! Stages a HypriotOS base image, grows its root partition while keeping the
//! disk identifier stable, installs a template tree into the partitions and
//! records a *surgery plan*: the exact byte offsets, inside the raw image, of
//! placeholder files that a later tool patches in place.
//!
//! # Architecture
//!
//! ```text
//! Pipeline (steps, preconditions, cleanup)
//!  ├── VirtualDisk ── Host (losetup, mount, sfdisk, parted, e2fsprogs)
//!  ├── Template + ValidatorRegistry
//!  ├── SurgeryPlan ── scan (raw byte search)
//!  ├── Chroot / AuxEngine (QEMU chroot, docker:dind)
//!  └── fetch / archive / stats
//! ```

mod archive;
pub mod chroot;
pub mod config;
pub mod disk;
pub mod docker;
mod error;
pub mod fetch;
pub mod host;
pub mod interrupt;
pub mod pipeline;
pub mod scan;
pub mod stats;
pub mod step;
pub mod surgery;
pub mod template;
pub mod validate;

pub use config::{BuildConfig, ModuleImage};
pub use disk::{PartitionTable, VirtualDisk};
pub use error::{Error, Result};
pub use host::{Host, REQUIRED_TOOLS, SystemHost};
pub use pipeline::{AssumeYes, Confirm, Pipeline};
pub use step::{Step, StepSet};
pub use surgery::{SurgeryPlan, SurgeryRecord};
