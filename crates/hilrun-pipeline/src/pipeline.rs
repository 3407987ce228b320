//! Run orchestrator.
//!
//! compile -> deploy -> monitor -> teardown, short-circuiting on the first
//! stage failure. Once a run has started, every outcome is a [`RunReport`];
//! only an unknown or invalid platform is an `Err`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hilrun_profiles::registry::validate;
use hilrun_profiles::{PlatformProfile, Registry};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::artifact::BuildArtifact;
use crate::compile::compile;
use crate::deploy::{DeployBackend, DeviceLeases, Teardown};
use crate::error::{CompileError, DeployError, PipelineError};
use crate::monitor::{Monitor, MonitorConfig, MonitorOutcome, MonitorState};
use crate::report::{LogSource, RunReport, Stage, Verdict};
use crate::session::{RunProgress, RunSession};

/// Configuration for a [`Pipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Runs build under `<build_root>/<platform>/<run_id>`.
    pub build_root: PathBuf,
    /// Keep per-run build directories after the run finishes.
    pub keep_build_dirs: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            build_root: PathBuf::from("build"),
            keep_build_dirs: true,
        }
    }
}

/// Runs firmware through compile, deploy, and monitor.
///
/// One pipeline can drive many concurrent runs; they share only the registry
/// and the device lease table.
#[derive(Debug)]
pub struct Pipeline {
    registry: Arc<Registry>,
    leases: DeviceLeases,
    config: PipelineConfig,
}

/// A run in flight, started with [`Pipeline::start`].
#[derive(Debug)]
pub struct RunHandle {
    run_id: Uuid,
    platform_id: String,
    progress: watch::Receiver<RunProgress>,
    cancel: CancellationToken,
    task: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn platform_id(&self) -> &str {
        &self.platform_id
    }

    /// Live progress. Never blocks the run.
    pub fn progress(&self) -> watch::Receiver<RunProgress> {
        self.progress.clone()
    }

    /// Request cancellation. The run still finishes with a report.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn wait(self) -> Result<RunReport, PipelineError> {
        self.task.await.map_err(|e| PipelineError::Aborted {
            detail: e.to_string(),
        })
    }
}

/// Terminal state of the stage sequence, before it becomes a report.
struct StageOutcome {
    verdict: Verdict,
    reason: String,
    artifact: Option<BuildArtifact>,
}

impl StageOutcome {
    fn new(verdict: Verdict, reason: impl Into<String>, artifact: Option<BuildArtifact>) -> Self {
        Self {
            verdict,
            reason: reason.into(),
            artifact,
        }
    }
}

impl Pipeline {
    pub fn new(registry: Arc<Registry>, config: PipelineConfig) -> Self {
        Self {
            registry,
            leases: DeviceLeases::new(),
            config,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn leases(&self) -> &DeviceLeases {
        &self.leases
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Resolve and validate, capturing the profile snapshot the run will use.
    fn prepare(&self, platform_id: &str) -> Result<Arc<PlatformProfile>, PipelineError> {
        let profile = self.registry.resolve(platform_id)?;
        validate(&profile)?;
        Ok(profile)
    }

    /// Run `platform_id` against `source` to completion.
    pub async fn run(
        &self,
        platform_id: &str,
        source: &Path,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let profile = self.prepare(platform_id)?;
        let run_id = Uuid::new_v4();
        let (tx, _rx) = watch::channel(RunProgress::new(run_id, &profile.id));
        Ok(self.execute(run_id, profile, source, &cancel, tx).await)
    }

    /// Spawn a run on the current tokio runtime.
    pub fn start(
        self: &Arc<Self>,
        platform_id: &str,
        source: impl Into<PathBuf>,
    ) -> Result<RunHandle, PipelineError> {
        let profile = self.prepare(platform_id)?;
        let run_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let (tx, rx) = watch::channel(RunProgress::new(run_id, &profile.id));
        let platform_id = profile.id.clone();

        let pipeline = Arc::clone(self);
        let token = cancel.clone();
        let source = source.into();
        let task = tokio::spawn(async move {
            pipeline
                .execute(run_id, profile, &source, &token, tx)
                .await
        });

        Ok(RunHandle {
            run_id,
            platform_id,
            progress: rx,
            cancel,
            task,
        })
    }

    async fn execute(
        &self,
        run_id: Uuid,
        profile: Arc<PlatformProfile>,
        source: &Path,
        cancel: &CancellationToken,
        progress: watch::Sender<RunProgress>,
    ) -> RunReport {
        let span = tracing::info_span!("run", %run_id, platform = %profile.id);
        async move {
            tracing::info!(mode = %profile.deploy.mode, source = %source.display(), "run started");
            let mut session = RunSession::new(run_id, &profile.id, progress);
            let build_dir = self
                .config
                .build_root
                .join(&profile.id)
                .join(run_id.to_string());

            let outcome = self
                .stages(&profile, source, &build_dir, cancel, &mut session)
                .await;

            if !self.config.keep_build_dirs {
                match tokio::fs::remove_dir_all(&build_dir).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        let dir = build_dir.display();
                        tracing::warn!(dir = %dir, error = %e, "failed to remove build dir")
                    }
                }
            }

            let report = session.finish(outcome.verdict, outcome.reason, outcome.artifact);
            tracing::info!(
                verdict = %report.verdict,
                duration_ms = report.duration_ms,
                reason = %report.reason,
                "run finished"
            );
            report
        }
        .instrument(span)
        .await
    }

    async fn stages(
        &self,
        profile: &PlatformProfile,
        source: &Path,
        build_dir: &Path,
        cancel: &CancellationToken,
        session: &mut RunSession,
    ) -> StageOutcome {
        // Compile
        session.enter(Stage::Compile);
        let compiled = match compile(profile, source, build_dir, cancel).await {
            Ok(out) => out,
            Err(CompileError::Cancelled) => {
                return StageOutcome::new(Verdict::Cancelled, "cancelled during compile", None)
            }
            Err(e) => {
                if let Some(d) = e.diagnostics() {
                    session.log_lines(LogSource::Compiler, &d.stdout);
                    session.log_lines(LogSource::Compiler, &d.stderr);
                }
                tracing::warn!(error = %e, "compile failed");
                return StageOutcome::new(Verdict::ToolchainError, e.to_string(), None);
            }
        };
        session.log(LogSource::Pipeline, format!("$ {}", compiled.command_line));
        session.log_lines(LogSource::Compiler, &compiled.diagnostics.stdout);
        session.log_lines(LogSource::Compiler, &compiled.diagnostics.stderr);
        let artifact = compiled.artifact;
        let summary = Some(artifact.clone());

        if cancel.is_cancelled() {
            return StageOutcome::new(Verdict::Cancelled, "cancelled before deploy", summary);
        }

        // Deploy
        session.enter(Stage::Deploy);
        let backend = DeployBackend::for_profile(profile);
        let mut target = match backend
            .deploy(profile, artifact, build_dir, &self.leases, cancel)
            .await
        {
            Ok(target) => target,
            Err(DeployError::Cancelled) => {
                return StageOutcome::new(Verdict::Cancelled, "cancelled during deploy", summary)
            }
            Err(e) => {
                let log_source = match e {
                    DeployError::EmulatorExited { .. } => LogSource::Emulator,
                    _ => LogSource::Deploy,
                };
                if let Some(output) = e.output() {
                    session.log_lines(log_source, output);
                }
                tracing::warn!(error = %e, "deploy failed");
                return StageOutcome::new(Verdict::DeployError, e.to_string(), summary);
            }
        };
        session.log_lines(LogSource::Deploy, target.deploy_output());

        // Monitor
        session.enter(Stage::Monitor);
        let mut monitor = Monitor::new(MonitorConfig::from_profile(profile));
        let outcome = monitor
            .run(target.console(), cancel, |line| session.console(line))
            .await;

        // Teardown
        session.enter(Stage::Teardown);
        let teardown = target.shutdown().await;
        session.log_lines(LogSource::Emulator, &teardown.stderr);

        let verdict = Verdict::from_monitor(outcome.state).unwrap_or(Verdict::StreamClosed);
        StageOutcome::new(verdict, describe(&outcome, profile, &teardown), summary)
    }
}

fn describe(outcome: &MonitorOutcome, profile: &PlatformProfile, teardown: &Teardown) -> String {
    let line = outcome.line.as_deref().unwrap_or_default();
    let matched = outcome.matched.as_deref().unwrap_or_default();
    match outcome.state {
        MonitorState::MatchedSuccess => format!("success keyword '{matched}' matched: {line}"),
        MonitorState::MatchedFailure => format!("failure keyword '{matched}' matched: {line}"),
        MonitorState::EndMarker => {
            format!("end marker '{matched}' reached without a success keyword")
        }
        MonitorState::TimedOut => format!(
            "no verdict within {}s ({} console lines)",
            profile.timeout_secs,
            outcome.log.len()
        ),
        MonitorState::StreamClosed => {
            let mut reason = format!(
                "console closed before a verdict ({} lines)",
                outcome.log.len()
            );
            if let Some(e) = &outcome.read_error {
                reason.push_str(&format!("; read error: {e}"));
            }
            if let Some(code) = teardown.exit_code {
                reason.push_str(&format!("; emulator exit code {code}"));
            }
            reason
        }
        MonitorState::Cancelled => "cancelled while monitoring".into(),
        MonitorState::Idle | MonitorState::Listening => {
            format!("monitor stopped in state {}", outcome.state)
        }
    }
}
