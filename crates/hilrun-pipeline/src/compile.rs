//! Compiler stage: source tree in, verified firmware image out.
//!
//! The compiler's exit status is authoritative. A zero exit is only a success
//! if the declared artifact then exists and is non-empty; any stale artifact is
//! removed first so a toolchain that silently does nothing is caught.

use std::path::{Path, PathBuf};

use hilrun_profiles::layout::render_linker_script;
use hilrun_profiles::{CompileStyle, PlatformProfile, Vars};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::artifact::BuildArtifact;
use crate::error::{CompileError, Diagnostics};
use crate::process::{run_captured, CaptureError};
use crate::source::SourceTree;

/// Fully resolved compiler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilePlan {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the compiler process.
    pub cwd: PathBuf,
    pub artifact_path: PathBuf,
    pub linker_script: Option<PathBuf>,
    /// Script text to write to `linker_script` before compiling, when generated from a memory map.
    pub generated_script: Option<String>,
}

impl CompilePlan {
    /// Resolve templates, linker script, and argv for `profile` against `tree`.
    pub fn new(
        profile: &PlatformProfile,
        tree: &SourceTree,
        build_dir: &Path,
    ) -> Result<Self, CompileError> {
        let source_dir = tree.root().display().to_string();
        let build_dir_s = build_dir.display().to_string();

        let mut path_vars = Vars::new()
            .with("source_dir", &source_dir)
            .with("build_dir", &build_dir_s)
            .with("platform", &profile.id);
        path_vars.extend_missing(&profile.vars);
        let artifact = PathBuf::from(path_vars.expand(&profile.artifact.path)?);
        let artifact_path = if artifact.is_absolute() {
            artifact
        } else {
            build_dir.join(artifact)
        };

        let (linker_script, generated_script) = match profile.compiler.style {
            CompileStyle::Sdk => (None, None),
            CompileStyle::Gcc => match &profile.linker.script {
                Some(script) => (Some(script.clone()), None),
                None if !profile.linker.memory.is_empty() => {
                    let memory = &profile.linker.memory;
                    let text = render_linker_script(memory, profile.linker.stack_bytes)
                        .ok_or_else(|| {
                            CompileError::Io(std::io::Error::new(
                                std::io::ErrorKind::InvalidInput,
                                "memory map cannot be rendered as a linker script",
                            ))
                        })?;
                    (Some(build_dir.join(format!("{}.ld", profile.id))), Some(text))
                }
                None => (None, None),
            },
        };

        let vars = path_vars
            .with("output", artifact_path.display().to_string())
            .with(
                "linker_script",
                linker_script
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
            );
        let mut args = vars.expand_all(&profile.compiler.flags)?;

        if profile.compiler.style == CompileStyle::Gcc {
            if tree.is_empty() {
                return Err(CompileError::NoSources {
                    root: tree.root().to_path_buf(),
                });
            }
            if let Some(script) = &linker_script {
                args.push("-T".into());
                args.push(script.display().to_string());
            }
            args.push("-o".into());
            args.push(artifact_path.display().to_string());
            args.extend(tree.files().iter().map(|f| f.display().to_string()));
        }

        let cwd = match (&profile.compiler.working_dir, profile.compiler.style) {
            (Some(dir), _) => tree.root().join(dir),
            (None, CompileStyle::Gcc) => build_dir.to_path_buf(),
            (None, CompileStyle::Sdk) => tree.root().to_path_buf(),
        };

        Ok(Self {
            program: profile.compiler.program.clone(),
            args,
            cwd,
            artifact_path,
            linker_script,
            generated_script,
        })
    }

    /// The command line as a single display string.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a successful compile.
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub artifact: BuildArtifact,
    pub diagnostics: Diagnostics,
    pub command_line: String,
}

/// Compile `source` for `profile` into `build_dir`.
pub async fn compile(
    profile: &PlatformProfile,
    source: &Path,
    build_dir: &Path,
    cancel: &CancellationToken,
) -> Result<CompileOutput, CompileError> {
    tokio::fs::create_dir_all(build_dir).await?;
    let tree = SourceTree::discover(source, Some(build_dir))?;
    tracing::debug!(
        files = tree.files().len(),
        root = %tree.root().display(),
        "discovered sources"
    );

    let plan = CompilePlan::new(profile, &tree, build_dir)?;
    if let (Some(path), Some(text)) = (&plan.linker_script, &plan.generated_script) {
        tokio::fs::write(path, text).await?;
        tracing::debug!(script = %path.display(), "wrote generated linker script");
    }
    if let Some(parent) = plan.artifact_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(&plan.artifact_path).await {
        Ok(()) => tracing::debug!(path = %plan.artifact_path.display(), "removed stale artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let command_line = plan.command_line();
    tracing::info!(command = %command_line, "compiling");

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args).current_dir(&plan.cwd);
    let captured = run_captured(cmd, &plan.program, cancel)
        .await
        .map_err(|e| match e {
            CaptureError::Spawn(source) | CaptureError::Wait(source) => CompileError::Spawn {
                program: plan.program.clone(),
                source,
            },
            CaptureError::Cancelled => CompileError::Cancelled,
        })?;

    let diagnostics = Diagnostics {
        stdout: captured.stdout,
        stderr: captured.stderr,
    };
    if !captured.status.success() {
        return Err(CompileError::NonZeroExit {
            code: captured.status.code(),
            diagnostics,
        });
    }

    let size = match tokio::fs::metadata(&plan.artifact_path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => {
            return Err(CompileError::MissingArtifact {
                path: plan.artifact_path,
                diagnostics,
            })
        }
    };
    if size == 0 {
        return Err(CompileError::EmptyArtifact {
            path: plan.artifact_path,
            diagnostics,
        });
    }

    let artifact =
        BuildArtifact::inspect(&plan.artifact_path, profile.artifact.format, &profile.arch)
            .await?;
    if artifact.has_vector_table == Some(false) {
        tracing::warn!(
            path = %artifact.path.display(),
            "artifact has no interrupt vector table section"
        );
    }
    tracing::info!(
        path = %artifact.path.display(),
        size = artifact.size_bytes,
        arch = %artifact.arch,
        "compile succeeded"
    );
    Ok(CompileOutput {
        artifact,
        diagnostics,
        command_line,
    })
}
