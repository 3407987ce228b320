//! `hilrun run`: compile, deploy, and monitor on one or more platforms at once.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use hilrun_pipeline::{Pipeline, PipelineConfig, RunHandle, RunProgress, RunReport};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::commands::load_registry;
use crate::config::Project;

/// Command-line options for `hilrun run`; unset values fall back to `hilrun.toml`.
#[derive(Debug, Default)]
pub struct RunOptions {
    pub platforms: Vec<String>,
    pub source: Option<PathBuf>,
    pub json: bool,
    pub report_dir: Option<PathBuf>,
}

/// Returns the process exit code: 0 only when every run passed.
pub async fn run(project: &Project, options: RunOptions) -> Result<i32> {
    let platforms = if options.platforms.is_empty() {
        project.config.run.default_platforms.clone()
    } else {
        options.platforms
    };
    if platforms.is_empty() {
        bail!("no platforms given (name them, or set run.default-platforms in hilrun.toml)");
    }

    let source = match options.source {
        Some(s) => s,
        None => match &project.config.run.source {
            Some(s) => project.path(s),
            None => {
                bail!("no firmware source given (pass --source, or set run.source in hilrun.toml)")
            }
        },
    };
    if !source.exists() {
        bail!("firmware source not found: {}", source.display());
    }
    let report_dir = options.report_dir.or_else(|| {
        project
            .config
            .run
            .report_dir
            .as_ref()
            .map(|d| project.path(d))
    });

    let registry = Arc::new(load_registry(project)?);
    let pipeline = Arc::new(Pipeline::new(
        registry,
        PipelineConfig {
            build_root: project.build_dir(),
            keep_build_dirs: true,
        },
    ));

    let reports = run_all(
        &pipeline,
        &platforms,
        &source,
        !options.json,
        shutdown_signal(),
    )
    .await?;

    if options.json {
        let text = if reports.len() == 1 {
            reports[0].to_json()?
        } else {
            serde_json::to_string_pretty(&reports)?
        };
        println!("{text}");
    } else {
        for report in &reports {
            println!("{report}");
        }
        print_summary(&reports);
    }

    if let Some(dir) = report_dir {
        for report in &reports {
            let path = report
                .archive(&dir)
                .with_context(|| format!("archiving report to {}", dir.display()))?;
            eprintln!("report written to {}", path.display());
        }
    }

    Ok(if reports.iter().all(|r| r.verdict.is_pass()) { 0 } else { 1 })
}

/// Resolves on Ctrl-C. Never resolves if the handler cannot be installed.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Start every platform concurrently and wait for all reports, in `platforms` order.
///
/// When `shutdown` resolves every run is cancelled; each still finishes with a report.
pub async fn run_all(
    pipeline: &Arc<Pipeline>,
    platforms: &[String],
    source: &Path,
    show_progress: bool,
    shutdown: impl Future<Output = ()>,
) -> Result<Vec<RunReport>> {
    let mut handles: Vec<RunHandle> = Vec::with_capacity(platforms.len());
    for id in platforms {
        match pipeline.start(id, source) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                for handle in &handles {
                    handle.cancel();
                }
                for handle in handles {
                    let _ = handle.wait().await;
                }
                return Err(e).with_context(|| format!("cannot start a run on '{id}'"));
            }
        }
    }

    let tokens: Vec<_> = handles.iter().map(RunHandle::cancel_token).collect();
    let mut set = JoinSet::new();
    for (index, handle) in handles.into_iter().enumerate() {
        if show_progress {
            tokio::spawn(print_progress(handle.progress()));
        }
        set.spawn(async move { (index, handle.wait().await) });
    }

    tokio::pin!(shutdown);
    let mut interrupted = false;
    let mut reports = Vec::with_capacity(platforms.len());
    loop {
        tokio::select! {
            joined = set.join_next() => match joined {
                None => break,
                Some(Ok((index, report))) => reports.push((index, report?)),
                Some(Err(e)) => return Err(e).context("run task failed"),
            },
            _ = &mut shutdown, if !interrupted => {
                interrupted = true;
                tracing::warn!(runs = tokens.len(), "interrupted; cancelling runs");
                for token in &tokens {
                    token.cancel();
                }
            }
        }
    }

    reports.sort_by_key(|(index, _)| *index);
    Ok(reports.into_iter().map(|(_, report)| report).collect())
}

/// Print one line per stage change until the run finishes.
async fn print_progress(mut rx: watch::Receiver<RunProgress>) {
    let mut last = None;
    loop {
        let (platform, stage) = {
            let p = rx.borrow_and_update();
            (p.platform_id.clone(), p.stage)
        };
        if last != Some(stage) {
            eprintln!("[{platform}] {stage}");
            last = Some(stage);
        }
        if rx.changed().await.is_err() {
            break;
        }
    }
}

fn print_summary(reports: &[RunReport]) {
    println!("--- Summary ---");
    for report in reports {
        println!(
            "  {:<16} {:<16} {:>6} ms  {}",
            report.platform_id, report.verdict, report.duration_ms, report.reason
        );
    }
    let passed = reports.iter().filter(|r| r.verdict.is_pass()).count();
    println!();
    println!("{passed} of {} run(s) passed", reports.len());
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use hilrun_pipeline::Verdict;
    use hilrun_profiles::{ArtifactFormat, CompileStyle, LinkerSpec, PlatformProfile, Registry};

    fn profile(id: &str, build: &str, emulator: &str) -> PlatformProfile {
        let mut p = PlatformProfile::stm32_qemu();
        p.id = id.into();
        p.compiler.program = "sh".into();
        p.compiler.style = CompileStyle::Sdk;
        p.compiler.flags = vec!["-c".into(), build.into()];
        p.linker = LinkerSpec::default();
        p.artifact.path = "fw.bin".into();
        p.artifact.format = ArtifactFormat::Bin;
        p.deploy.program = "sh".into();
        p.deploy.args = vec!["-c".into(), emulator.into()];
        p.deploy.startup_grace_ms = 5_000;
        p.timeout_secs = 10;
        p.success_keywords = vec!["PASS".into()];
        p.failure_keywords = vec!["FAIL".into()];
        p
    }

    const BUILD_OK: &str = "printf firmware > {output}";

    fn pipeline(dir: &Path, profiles: Vec<PlatformProfile>) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(
            Arc::new(Registry::with_profiles(profiles)),
            PipelineConfig {
                build_root: dir.join("build"),
                keep_build_dirs: false,
            },
        ))
    }

    fn source(dir: &Path) -> PathBuf {
        let src = dir.join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("main.c"), "int main(void) { return 0; }\n").unwrap();
        src
    }

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn reports_follow_platform_order() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            vec![
                profile("slow", BUILD_OK, "sleep 1; echo PASS"),
                profile("fast", BUILD_OK, "echo FAIL"),
            ],
        );
        let reports = run_all(
            &p,
            &ids(&["slow", "fast"]),
            &source(dir.path()),
            false,
            std::future::pending(),
        )
        .await
        .unwrap();

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].platform_id, "slow");
        assert_eq!(reports[0].verdict, Verdict::Pass);
        assert_eq!(reports[1].platform_id, "fast");
        assert_eq!(reports[1].verdict, Verdict::Fail);
    }

    #[tokio::test]
    async fn shutdown_cancels_every_run() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(
            dir.path(),
            vec![
                profile("a", "exec sleep 30", "echo PASS"),
                profile("b", BUILD_OK, "exec sleep 30"),
            ],
        );
        let reports = tokio::time::timeout(
            std::time::Duration::from_secs(15),
            run_all(
                &p,
                &ids(&["a", "b"]),
                &source(dir.path()),
                false,
                tokio::time::sleep(std::time::Duration::from_millis(300)),
            ),
        )
        .await
        .unwrap()
        .unwrap();

        assert!(reports.iter().all(|r| r.verdict == Verdict::Cancelled));
    }

    #[tokio::test]
    async fn unknown_platform_fails_before_reporting() {
        let dir = tempfile::tempdir().unwrap();
        let p = pipeline(dir.path(), vec![profile("a", BUILD_OK, "echo PASS")]);
        let err = run_all(
            &p,
            &ids(&["a", "pdp-11"]),
            &source(dir.path()),
            false,
            std::future::pending(),
        )
        .await
        .unwrap_err();
        assert!(format!("{err:#}").contains("pdp-11"));
    }

    #[tokio::test]
    async fn run_command_requires_platforms() {
        let dir = tempfile::tempdir().unwrap();
        let project = Project {
            config: Default::default(),
            root: dir.path().to_path_buf(),
            found: false,
        };
        let err = run(&project, RunOptions::default()).await.unwrap_err();
        assert!(err.to_string().contains("no platforms"));
    }
}
