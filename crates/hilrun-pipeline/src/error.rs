//! Stage errors.

use std::path::PathBuf;

use hilrun_profiles::{ProfileError, ValidationIssue};
use thiserror::Error;

/// Captured toolchain output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics {
    pub stdout: String,
    pub stderr: String,
}

impl Diagnostics {
    /// Last non-empty stderr line, falling back to stdout.
    pub fn summary(&self) -> &str {
        last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or("no output")
    }

    /// All output lines, stdout first.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().chain(self.stderr.lines())
    }
}

fn last_line(s: &str) -> Option<&str> {
    s.lines().rev().map(str::trim).find(|l| !l.is_empty())
}

pub(crate) fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "no exit code (killed by signal)".into(),
    }
}

/// Errors from the compiler stage. Every variant is a permanent failure of the run.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("failed to start compiler '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("compiler failed with {}: {}", describe_code(code), diagnostics.summary())]
    NonZeroExit {
        code: Option<i32>,
        diagnostics: Diagnostics,
    },

    #[error("compiler exited cleanly but produced no artifact at {}", path.display())]
    MissingArtifact {
        path: PathBuf,
        diagnostics: Diagnostics,
    },

    #[error("artifact {} is empty", path.display())]
    EmptyArtifact {
        path: PathBuf,
        diagnostics: Diagnostics,
    },

    #[error("no source files found under {}", root.display())]
    NoSources { root: PathBuf },

    #[error("{0}")]
    Profile(#[from] ProfileError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("compile cancelled")]
    Cancelled,
}

impl CompileError {
    /// Toolchain output attached to this error, if any.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            CompileError::NonZeroExit { diagnostics, .. }
            | CompileError::MissingArtifact { diagnostics, .. }
            | CompileError::EmptyArtifact { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// Errors from the deploy stage.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deploy tool '{program}' is not installed")]
    ToolMissing { program: String },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("flash tool failed with {}", describe_code(code))]
    FlashFailed { code: Option<i32>, output: String },

    #[error("device {device} is busy (in use by another run)")]
    DeviceBusy { device: String },

    #[error("serial device {device} not found")]
    DeviceMissing { device: String },

    #[error("cannot open serial device {device}: {detail}")]
    DeviceOpen { device: String, detail: String },

    #[error("emulator exited during startup with {}", describe_code(code))]
    EmulatorExited { code: Option<i32>, stderr: String },

    #[error("emulator console at {address} unavailable: {detail}")]
    ConsoleUnavailable { address: String, detail: String },

    #[error("{0}")]
    Profile(#[from] ProfileError),

    #[error("deploy cancelled")]
    Cancelled,
}

impl DeployError {
    /// Tool or emulator output attached to this error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            DeployError::FlashFailed { output, .. } => Some(output),
            DeployError::EmulatorExited { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// Failures that prevent a run from starting at all.
///
/// Once a run has started, every failure is reported through its verdict instead.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("unknown platform: '{id}'")]
    UnknownPlatform { id: String },

    #[error("platform '{id}' failed validation ({} issue(s))", issues.len())]
    InvalidProfile {
        id: String,
        issues: Vec<ValidationIssue>,
    },

    #[error("profile error: {0}")]
    Profile(ProfileError),

    #[error("run task aborted: {detail}")]
    Aborted { detail: String },
}

impl From<ProfileError> for PipelineError {
    fn from(e: ProfileError) -> Self {
        match e {
            ProfileError::UnknownPlatform { id } => PipelineError::UnknownPlatform { id },
            ProfileError::Invalid { id, issues } => PipelineError::InvalidProfile { id, issues },
            other => PipelineError::Profile(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_prefers_stderr() {
        let d = Diagnostics {
            stdout: "compiling main.c\n".into(),
            stderr: "main.c:3: error: expected ';'\n\n".into(),
        };
        assert_eq!(d.summary(), "main.c:3: error: expected ';'");
        assert_eq!(Diagnostics::default().summary(), "no output");
    }

    #[test]
    fn nonzero_exit_message() {
        let e = CompileError::NonZeroExit {
            code: Some(1),
            diagnostics: Diagnostics {
                stdout: String::new(),
                stderr: "undefined reference to `main'".into(),
            },
        };
        let msg = e.to_string();
        assert!(msg.contains("exit code 1"));
        assert!(msg.contains("undefined reference"));
        assert!(e.diagnostics().is_some());
    }

    #[test]
    fn profile_errors_map_to_pipeline_errors() {
        let e: PipelineError = ProfileError::UnknownPlatform { id: "x".into() }.into();
        assert!(matches!(e, PipelineError::UnknownPlatform { .. }));
    }
}
