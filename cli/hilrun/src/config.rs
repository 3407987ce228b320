//! `hilrun.toml` project configuration.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// File name searched for by [`HilrunConfig::find_and_load`].
pub const CONFIG_FILE: &str = "hilrun.toml";

/// The top-level configuration for a firmware project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HilrunConfig {
    #[serde(default)]
    pub project: Option<ProjectConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Project metadata section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
}

/// Where platform profiles live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Profile directory, relative to the project root.
    #[serde(default = "default_registry_dir")]
    pub dir: PathBuf,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            dir: default_registry_dir(),
        }
    }
}

fn default_registry_dir() -> PathBuf {
    PathBuf::from("platforms")
}

/// Defaults for `hilrun run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunConfig {
    #[serde(default = "default_build_dir")]
    pub build_dir: PathBuf,
    /// Archive every report here when set.
    #[serde(default)]
    pub report_dir: Option<PathBuf>,
    /// Platforms run when none are named on the command line.
    #[serde(default)]
    pub default_platforms: Vec<String>,
    /// Source tree used when `--source` is omitted.
    #[serde(default)]
    pub source: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            build_dir: default_build_dir(),
            report_dir: None,
            default_platforms: Vec::new(),
            source: None,
        }
    }
}

fn default_build_dir() -> PathBuf {
    PathBuf::from("build")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

impl HilrunConfig {
    /// Search upward from `start_dir` for a `hilrun.toml` file, parse and return it
    /// along with the directory it was found in.
    pub fn find_and_load(start_dir: &Path) -> Result<Option<(Self, PathBuf)>> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_FILE);
            if candidate.is_file() {
                let content = std::fs::read_to_string(&candidate)
                    .with_context(|| format!("reading {}", candidate.display()))?;
                let config: HilrunConfig = toml::from_str(&content)
                    .with_context(|| format!("parsing {}", candidate.display()))?;
                return Ok(Some((config, dir)));
            }
            if !dir.pop() {
                break;
            }
        }
        Ok(None)
    }

    /// Parse a configuration from a TOML string.
    #[cfg(test)]
    pub fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing hilrun.toml")
    }
}

/// A loaded configuration plus the directory its relative paths are anchored to.
#[derive(Debug, Clone)]
pub struct Project {
    pub config: HilrunConfig,
    /// Directory holding `hilrun.toml`, or the working directory when there is none.
    pub root: PathBuf,
    pub found: bool,
}

impl Project {
    pub fn discover(cwd: &Path) -> Result<Self> {
        Ok(match HilrunConfig::find_and_load(cwd)? {
            Some((config, root)) => Self {
                config,
                root,
                found: true,
            },
            None => Self {
                config: HilrunConfig::default(),
                root: cwd.to_path_buf(),
                found: false,
            },
        })
    }

    /// Resolve a configured path against the project root.
    pub fn path(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.path(&self.config.registry.dir)
    }

    pub fn build_dir(&self) -> PathBuf {
        self.path(&self.config.run.build_dir)
    }
}
