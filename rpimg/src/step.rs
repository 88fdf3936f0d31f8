//! Pipeline steps, step selection and declared preconditions.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A named stage of the image build.
///
/// Variants are declared in execution order; `Ord` follows that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum Step {
    /// Fetch and extract the base image.
    Download,
    /// Create the output image from the base image.
    Create,
    /// Bind the output image to a loop device.
    Mount,
    /// Grow the root partition to fill the disk.
    Resize,
    /// Upgrade packages inside an emulated chroot.
    Upgrade,
    /// Install the disk template and plan the surgery.
    Setup,
    /// Pre-load container images into the root partition.
    Docker,
    /// Checksum the image and write its metadata.
    Finalize,
    /// Release every mount and the loop device.
    Unmount,
    /// Bundle the image and its metadata.
    Compress,
}

/// What must hold before a step may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Requirement {
    /// No requirement.
    None,
    /// The output image must not be bound to a loop device.
    Unbound,
    /// The output image must exist on disk.
    ImageExists,
    /// The output image must be bound to a loop device.
    Bound,
    /// Both the output image and its metadata file must exist.
    Sealed,
}

impl Step {
    /// Every step, in execution order.
    pub const ALL: [Self; 10] = [
        Self::Download,
        Self::Create,
        Self::Mount,
        Self::Resize,
        Self::Upgrade,
        Self::Setup,
        Self::Docker,
        Self::Finalize,
        Self::Unmount,
        Self::Compress,
    ];

    /// Lowercase step name as used on the command line.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Create => "create",
            Self::Mount => "mount",
            Self::Resize => "resize",
            Self::Upgrade => "upgrade",
            Self::Setup => "setup",
            Self::Docker => "docker",
            Self::Finalize => "finalize",
            Self::Unmount => "unmount",
            Self::Compress => "compress",
        }
    }

    /// The state this step needs in order to run.
    pub const fn requires(self) -> Requirement {
        match self {
            Self::Download | Self::Unmount => Requirement::None,
            Self::Create => Requirement::Unbound,
            Self::Mount | Self::Finalize => Requirement::ImageExists,
            Self::Resize | Self::Upgrade | Self::Setup | Self::Docker => Requirement::Bound,
            Self::Compress => Requirement::Sealed,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Step {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|step| step.name() == s)
            .ok_or_else(|| Error::UnknownStep(s.to_owned()))
    }
}

/// The set of steps selected for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepSet(BTreeSet<Step>);

impl StepSet {
    /// Every step selected.
    pub fn all() -> Self {
        Self(Step::ALL.into_iter().collect())
    }

    /// Builds a selection from comma-separated `steps` minus `skip`.
    ///
    /// Empty items are ignored. Any unknown name in either list is an error,
    /// so nothing runs on a typo.
    pub fn parse(steps: &str, skip: &str) -> Result<Self> {
        let selected = parse_list(steps)?;
        let skipped = parse_list(skip)?;
        Ok(Self(selected.difference(&skipped).copied().collect()))
    }

    /// Returns `true` if `step` is selected.
    pub fn contains(&self, step: Step) -> bool {
        self.0.contains(&step)
    }

    /// Selected steps in execution order.
    pub fn iter(&self) -> impl Iterator<Item = Step> + '_ {
        self.0.iter().copied()
    }
}

impl Default for StepSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<Step> for StepSet {
    fn from_iter<I: IntoIterator<Item = Step>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Parses a comma-separated list of step names.
fn parse_list(list: &str) -> Result<BTreeSet<Step>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn all_steps_in_execution_order() {
        let mut sorted = Step::ALL;
        sorted.sort();
        assert_eq!(sorted, Step::ALL);
        assert_eq!(Step::ALL.first(), Some(&Step::Download));
        assert_eq!(Step::ALL.last(), Some(&Step::Compress));
    }

    #[rstest]
    #[case("download", Step::Download)]
    #[case("setup", Step::Setup)]
    #[case("unmount", Step::Unmount)]
    fn parses_step_names(#[case] name: &str, #[case] step: Step) {
        assert_eq!(name.parse::<Step>().unwrap(), step);
        assert_eq!(step.to_string(), name);
    }

    #[test]
    fn skip_list_removes_steps() {
        let set = StepSet::parse("mount,setup,finalize,unmount", "setup,").unwrap();
        let steps: Vec<Step> = set.iter().collect();
        assert_eq!(steps, vec![Step::Mount, Step::Finalize, Step::Unmount]);
    }

    #[test]
    fn selection_iterates_in_pipeline_order() {
        let set = StepSet::parse("unmount,mount,create", "").unwrap();
        let steps: Vec<Step> = set.iter().collect();
        assert_eq!(steps, vec![Step::Create, Step::Mount, Step::Unmount]);
    }

    #[rstest]
    #[case("mount,flash", "")]
    #[case("mount", "burn")]
    fn rejects_unknown_names(#[case] steps: &str, #[case] skip: &str) {
        let err = StepSet::parse(steps, skip).unwrap_err();
        assert!(matches!(err, Error::UnknownStep(_)));
    }

    #[test]
    fn partition_steps_require_bound_disk() {
        for step in [Step::Resize, Step::Upgrade, Step::Setup, Step::Docker] {
            assert_eq!(step.requires(), Requirement::Bound);
        }
        assert_eq!(Step::Create.requires(), Requirement::Unbound);
    }
}
