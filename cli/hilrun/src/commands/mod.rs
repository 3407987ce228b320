//! CLI command implementations.

pub mod doctor;
pub mod platform;
pub mod ports;
pub mod run;

use anyhow::{Context, Result};
use hilrun_profiles::Registry;

use crate::config::Project;

/// The project's registry: its profile directory layered over the built-ins,
/// or the built-ins alone when the directory does not exist.
pub fn load_registry(project: &Project) -> Result<Registry> {
    let dir = project.registry_dir();
    if dir.is_dir() {
        Registry::from_dir(&dir)
            .with_context(|| format!("loading platform profiles from {}", dir.display()))
    } else {
        tracing::debug!(dir = %dir.display(), "no profile directory; using built-in platforms");
        Ok(Registry::builtin())
    }
}
