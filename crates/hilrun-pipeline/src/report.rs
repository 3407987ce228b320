//! Run reports: verdict, stage timings, and the combined log.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifact::BuildArtifact;
use crate::monitor::MonitorState;

/// Final outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Verdict {
    Pass,
    Fail,
    Timeout,
    StreamClosed,
    Cancelled,
    ToolchainError,
    DeployError,
}

impl Verdict {
    pub fn is_pass(self) -> bool {
        self == Verdict::Pass
    }

    /// Verdict for a terminal monitor state. `None` for non-terminal states.
    pub fn from_monitor(state: MonitorState) -> Option<Self> {
        Some(match state {
            MonitorState::MatchedSuccess => Verdict::Pass,
            MonitorState::MatchedFailure | MonitorState::EndMarker => Verdict::Fail,
            MonitorState::TimedOut => Verdict::Timeout,
            MonitorState::StreamClosed => Verdict::StreamClosed,
            MonitorState::Cancelled => Verdict::Cancelled,
            MonitorState::Idle | MonitorState::Listening => return None,
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Timeout => "TIMEOUT",
            Verdict::StreamClosed => "STREAM CLOSED",
            Verdict::Cancelled => "CANCELLED",
            Verdict::ToolchainError => "TOOLCHAIN ERROR",
            Verdict::DeployError => "DEPLOY ERROR",
        };
        f.pad(s)
    }
}

/// Pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Pending,
    Compile,
    Deploy,
    Monitor,
    Teardown,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Pending => "pending",
            Stage::Compile => "compile",
            Stage::Deploy => "deploy",
            Stage::Monitor => "monitor",
            Stage::Teardown => "teardown",
            Stage::Done => "done",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: Stage,
    pub duration_ms: u64,
}

/// Where a log line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogSource {
    Compiler,
    Deploy,
    Console,
    Emulator,
    Pipeline,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogSource::Compiler => "compiler",
            LogSource::Deploy => "deploy",
            LogSource::Console => "console",
            LogSource::Emulator => "emulator",
            LogSource::Pipeline => "pipeline",
        };
        f.pad(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Milliseconds since the run started.
    pub offset_ms: u64,
    pub source: LogSource,
    pub text: String,
}

/// Complete record of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub platform_id: String,
    pub verdict: Verdict,
    /// Human-readable explanation of the verdict.
    pub reason: String,
    pub stage_timings: Vec<StageTiming>,
    pub log: Vec<LogEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<BuildArtifact>,
    pub started_at_unix_ms: u64,
    pub duration_ms: u64,
}

impl RunReport {
    /// Log lines from one source.
    pub fn lines_from(&self, source: LogSource) -> impl Iterator<Item = &str> {
        self.log
            .iter()
            .filter(move |e| e.source == source)
            .map(|e| e.text.as_str())
    }

    pub fn timing(&self, stage: Stage) -> Option<u64> {
        self.stage_timings
            .iter()
            .find(|t| t.stage == stage)
            .map(|t| t.duration_ms)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as `<dir>/<platform>-<run_id>.json`.
    pub fn archive(&self, dir: &Path) -> io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}-{}.json", self.platform_id, self.run_id));
        let json = self.to_json().map_err(io::Error::other)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(io::Error::other)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Run Report: {} ===", self.platform_id)?;
        writeln!(f, "Run: {}", self.run_id)?;
        writeln!(f, "Verdict: {}", self.verdict)?;
        writeln!(f, "Reason: {}", self.reason)?;
        writeln!(f, "Duration: {} ms", self.duration_ms)?;

        if !self.stage_timings.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Stages ---")?;
            for t in &self.stage_timings {
                writeln!(f, "  {:<9} {} ms", t.stage, t.duration_ms)?;
            }
        }

        if let Some(artifact) = &self.artifact {
            writeln!(f)?;
            writeln!(f, "--- Artifact ---")?;
            writeln!(f, "  Path: {}", artifact.path.display())?;
            writeln!(f, "  Size: {} bytes ({})", artifact.size_bytes, artifact.arch)?;
            if let Some(entry) = artifact.entry_point {
                writeln!(f, "  Entry: 0x{entry:08X}")?;
            }
            writeln!(f, "  SHA-256: {}", artifact.sha256)?;
        }

        let console: Vec<_> = self.lines_from(LogSource::Console).collect();
        if !console.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Console ({} lines) ---", console.len())?;
            for line in console {
                writeln!(f, "  {line}")?;
            }
        }
        Ok(())
    }
}
