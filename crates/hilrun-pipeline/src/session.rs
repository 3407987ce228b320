//! Per-run bookkeeping: stage timings, the combined log, and live progress.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::artifact::BuildArtifact;
use crate::monitor::ConsoleLine;
use crate::report::{LogEntry, LogSource, RunReport, Stage, StageTiming, Verdict};

/// Snapshot of a run in flight, published on every stage change and console line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub platform_id: String,
    pub stage: Stage,
    pub elapsed_ms: u64,
    pub console_lines: usize,
    pub last_line: Option<String>,
    /// Set once the run has finished.
    pub verdict: Option<Verdict>,
}

impl RunProgress {
    pub fn new(run_id: Uuid, platform_id: &str) -> Self {
        Self {
            run_id,
            platform_id: platform_id.to_string(),
            stage: Stage::Pending,
            elapsed_ms: 0,
            console_lines: 0,
            last_line: None,
            verdict: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.verdict.is_some()
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub(crate) struct RunSession {
    run_id: Uuid,
    platform_id: String,
    started: Instant,
    started_at_unix_ms: u64,
    stage: Stage,
    stage_started: Instant,
    timings: Vec<StageTiming>,
    log: Vec<LogEntry>,
    progress: watch::Sender<RunProgress>,
}

impl RunSession {
    pub(crate) fn new(
        run_id: Uuid,
        platform_id: &str,
        progress: watch::Sender<RunProgress>,
    ) -> Self {
        let now = Instant::now();
        let started_at_unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(millis)
            .unwrap_or(0);
        Self {
            run_id,
            platform_id: platform_id.to_string(),
            started: now,
            started_at_unix_ms,
            stage: Stage::Pending,
            stage_started: now,
            timings: Vec::new(),
            log: Vec::new(),
            progress,
        }
    }

    fn elapsed_ms(&self) -> u64 {
        millis(self.started.elapsed())
    }

    fn close_stage(&mut self) {
        if !matches!(self.stage, Stage::Pending | Stage::Done) {
            self.timings.push(StageTiming {
                stage: self.stage,
                duration_ms: millis(self.stage_started.elapsed()),
            });
        }
    }

    pub(crate) fn enter(&mut self, stage: Stage) {
        self.close_stage();
        self.stage = stage;
        self.stage_started = Instant::now();
        tracing::debug!(%stage, "entering stage");
        let elapsed_ms = self.elapsed_ms();
        self.progress.send_modify(|p| {
            p.stage = stage;
            p.elapsed_ms = elapsed_ms;
        });
    }

    pub(crate) fn log(&mut self, source: LogSource, text: impl Into<String>) {
        let offset_ms = self.elapsed_ms();
        self.log.push(LogEntry {
            offset_ms,
            source,
            text: text.into(),
        });
    }

    pub(crate) fn log_lines(&mut self, source: LogSource, text: &str) {
        for line in text.lines() {
            self.log(source, line);
        }
    }

    pub(crate) fn console(&mut self, line: &ConsoleLine) {
        self.log(LogSource::Console, line.text.clone());
        let elapsed_ms = self.elapsed_ms();
        self.progress.send_modify(|p| {
            p.elapsed_ms = elapsed_ms;
            p.console_lines += 1;
            p.last_line = Some(line.text.clone());
        });
    }

    pub(crate) fn finish(
        mut self,
        verdict: Verdict,
        reason: String,
        artifact: Option<BuildArtifact>,
    ) -> RunReport {
        self.close_stage();
        self.stage = Stage::Done;
        let duration_ms = self.elapsed_ms();
        self.progress.send_modify(|p| {
            p.stage = Stage::Done;
            p.elapsed_ms = duration_ms;
            p.verdict = Some(verdict);
        });
        RunReport {
            run_id: self.run_id,
            platform_id: self.platform_id,
            verdict,
            reason,
            stage_timings: self.timings,
            log: self.log,
            artifact,
            started_at_unix_ms: self.started_at_unix_ms,
            duration_ms,
        }
    }
}
