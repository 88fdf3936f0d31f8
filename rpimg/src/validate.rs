//! Content validators for template files.
//!
//! A [`ValidatorRegistry`] is an ordered list of glob patterns over
//! `"<partition>:<relative path>"` keys. The first pattern that matches picks
//! the [`Validator`]; files matching no pattern are installed unchecked.

use std::fs;
use std::path::Path;

use glob::Pattern;
use serde_yaml::Value;
use tracing::{debug, warn};

use crate::{Error, Result};

/// Accepted values of a service's `restart` key.
const RESTART_POLICIES: &[&str] = &["no", "always", "on-failure", "unless-stopped"];

/// Information validators may consult.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    /// Distribution name container image tags are expected to carry.
    pub distro: String,
}

/// A content check applied before a template file is installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Validator {
    /// The file must be well-formed YAML.
    YamlSyntax,
    /// The file must describe a container stack started at boot.
    AutobootStack,
}

impl Validator {
    /// Validates `origin`, reporting failures against `relative`.
    pub fn validate(self, ctx: &ValidationContext, origin: &Path, relative: &str) -> Result<()> {
        let text = fs::read_to_string(origin)?;
        let doc = parse_yaml(&text, relative)?;
        match self {
            Self::YamlSyntax => Ok(()),
            Self::AutobootStack => check_stack(ctx, &doc, relative),
        }
    }
}

/// Ordered (pattern, validator) pairs.
#[derive(Debug, Clone, Default)]
pub struct ValidatorRegistry {
    /// Registration order is match order.
    entries: Vec<(Pattern, Validator)>,
}

impl ValidatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock validators for the Raspberry Pi template.
    pub fn standard() -> Result<Self> {
        let mut registry = Self::new();
        registry
            .register("root:/data/config/autoboot/*.yaml", Validator::AutobootStack)?
            .register("root:/data/config/calibrations/*/default.yaml", Validator::YamlSyntax)?;
        Ok(registry)
    }

    /// Appends a pattern. `*` also matches `/`.
    pub fn register(&mut self, pattern: &str, validator: Validator) -> Result<&mut Self> {
        let pattern = Pattern::new(pattern)
            .map_err(|e| Error::Config(format!("invalid validator pattern {pattern:?}: {e}")))?;
        self.entries.push((pattern, validator));
        Ok(self)
    }

    /// The validator for a file, if any pattern matches.
    pub fn resolve(&self, partition: &str, relative: &str) -> Option<Validator> {
        let key = format!("{partition}:{relative}");
        self.entries
            .iter()
            .find(|(pattern, _)| pattern.matches(&key))
            .map(|(_, validator)| *validator)
    }

    /// Validates a file if a validator is registered for it.
    pub fn check(
        &self,
        ctx: &ValidationContext,
        partition: &str,
        relative: &str,
        origin: &Path,
    ) -> Result<()> {
        if let Some(validator) = self.resolve(partition, relative) {
            debug!("validating {relative} with {validator:?}");
            validator.validate(ctx, origin, relative)?;
        }
        Ok(())
    }
}

/// Builds a [`Error::ValidationFailed`].
fn invalid(relative: &str, reason: impl Into<String>) -> Error {
    Error::ValidationFailed {
        path: relative.to_owned(),
        reason: reason.into(),
    }
}

/// Parses YAML, mapping syntax errors to [`Error::ValidationFailed`].
fn parse_yaml(text: &str, relative: &str) -> Result<Value> {
    serde_yaml::from_str(text).map_err(|e| invalid(relative, format!("invalid YAML: {e}")))
}

/// Structural rules for an autoboot stack file.
fn check_stack(ctx: &ValidationContext, doc: &Value, relative: &str) -> Result<()> {
    let root = doc
        .as_mapping()
        .ok_or_else(|| invalid(relative, "top level must be a mapping"))?;
    if !root.contains_key("version") {
        return Err(invalid(relative, "missing `version`"));
    }
    let services = root
        .get("services")
        .and_then(Value::as_mapping)
        .ok_or_else(|| invalid(relative, "missing `services` mapping"))?;
    if services.is_empty() {
        return Err(invalid(relative, "`services` is empty"));
    }
    for (name, service) in services {
        let name = name.as_str().unwrap_or("<non-string>");
        let service = service
            .as_mapping()
            .ok_or_else(|| invalid(relative, format!("service `{name}` must be a mapping")))?;
        let image = service
            .get("image")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid(relative, format!("service `{name}` has no `image`")))?;
        if let Some(restart) = service.get("restart") {
            let ok = restart.as_str().is_some_and(|r| RESTART_POLICIES.contains(&r));
            if !ok {
                return Err(invalid(
                    relative,
                    format!("service `{name}` has an invalid `restart` policy"),
                ));
            }
        }
        match image.rsplit_once(':') {
            Some((_, tag)) if tag.contains('/') || tag.starts_with(ctx.distro.as_str()) => {}
            _ => warn!("{relative}: image `{image}` of service `{name}` is not tagged for {}", ctx.distro),
        }
    }
    Ok(())
}
