//! Serial monitor: watches a console line by line until a verdict.
//!
//! ```text
//! Idle -> Listening -> MatchedSuccess | MatchedFailure | EndMarker
//!                    | TimedOut | StreamClosed | Cancelled
//! ```
//!
//! Matching is a case-sensitive substring test. Failure keywords are checked
//! before success keywords, so a line containing both is a failure. The
//! deadline is checked before every read and cannot be starved by a console
//! that never stops producing output.

use std::time::Duration;

use hilrun_profiles::PlatformProfile;
use serde::Serialize;
use tokio::io::AsyncBufRead;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::console::LineReader;

/// Monitor lifecycle. Every state after `Listening` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorState {
    Idle,
    Listening,
    MatchedSuccess,
    MatchedFailure,
    EndMarker,
    TimedOut,
    StreamClosed,
    Cancelled,
}

impl MonitorState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, MonitorState::Idle | MonitorState::Listening)
    }
}

impl std::fmt::Display for MonitorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MonitorState::Idle => "idle",
            MonitorState::Listening => "listening",
            MonitorState::MatchedSuccess => "matched success",
            MonitorState::MatchedFailure => "matched failure",
            MonitorState::EndMarker => "end marker",
            MonitorState::TimedOut => "timed out",
            MonitorState::StreamClosed => "stream closed",
            MonitorState::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// Verdict rules for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub timeout: Duration,
    pub success_keywords: Vec<String>,
    pub failure_keywords: Vec<String>,
    pub end_marker: Option<String>,
}

impl MonitorConfig {
    pub fn from_profile(profile: &PlatformProfile) -> Self {
        Self {
            timeout: profile.timeout(),
            success_keywords: profile.success_keywords.clone(),
            failure_keywords: profile.failure_keywords.clone(),
            end_marker: profile.end_marker.clone(),
        }
    }
}

/// Used when `start + limit` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + limit`, saturating to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, limit: Duration) -> Instant {
    start
        .checked_add(limit)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// How a single line classifies against the verdict rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineMatch {
    Failure(String),
    Success(String),
    EndMarker,
    None,
}

/// Classify one line. First matching keyword wins within each list.
pub fn classify(line: &str, config: &MonitorConfig) -> LineMatch {
    if let Some(k) = config.failure_keywords.iter().find(|k| line.contains(k.as_str())) {
        return LineMatch::Failure(k.clone());
    }
    if let Some(k) = config.success_keywords.iter().find(|k| line.contains(k.as_str())) {
        return LineMatch::Success(k.clone());
    }
    if config
        .end_marker
        .as_deref()
        .is_some_and(|m| line.contains(m))
    {
        return LineMatch::EndMarker;
    }
    LineMatch::None
}

/// One console line with its arrival time relative to the start of listening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleLine {
    pub offset: Duration,
    pub text: String,
}

/// Terminal result of monitoring.
#[derive(Debug, Clone)]
pub struct MonitorOutcome {
    pub state: MonitorState,
    /// The keyword (or end marker) that decided the verdict.
    pub matched: Option<String>,
    /// The line that decided the verdict.
    pub line: Option<String>,
    /// Every line observed, in order.
    pub log: Vec<ConsoleLine>,
    pub elapsed: Duration,
    /// Read error that ended the stream, if it did not end cleanly.
    pub read_error: Option<String>,
}

/// Serial monitor for one run.
#[derive(Debug)]
pub struct Monitor {
    config: MonitorConfig,
    state: MonitorState,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            state: MonitorState::Idle,
        }
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// Read `console` until a terminal state, reporting each line to `on_line`.
    ///
    /// The timeout starts when listening starts.
    pub async fn run<R, F>(
        &mut self,
        console: R,
        cancel: &CancellationToken,
        mut on_line: F,
    ) -> MonitorOutcome
    where
        R: AsyncBufRead + Unpin,
        F: FnMut(&ConsoleLine),
    {
        self.state = MonitorState::Listening;
        let started = Instant::now();
        let deadline = deadline_after(started, self.config.timeout);
        let mut lines = LineReader::new(console);
        let mut log = Vec::new();
        let mut matched = None;
        let mut verdict_line = None;
        let mut read_error = None;

        let state = loop {
            if Instant::now() >= deadline {
                break MonitorState::TimedOut;
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break MonitorState::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break MonitorState::TimedOut,
                next = lines.next_line() => next,
            };

            let text = match next {
                Ok(Some(text)) => text,
                Ok(None) => break MonitorState::StreamClosed,
                Err(e) => {
                    tracing::warn!(error = %e, "console read failed");
                    read_error = Some(e.to_string());
                    break MonitorState::StreamClosed;
                }
            };

            let line = ConsoleLine {
                offset: started.elapsed(),
                text,
            };
            on_line(&line);
            let class = classify(&line.text, &self.config);
            let text = line.text.clone();
            log.push(line);

            match class {
                LineMatch::Failure(k) => {
                    matched = Some(k);
                    verdict_line = Some(text);
                    break MonitorState::MatchedFailure;
                }
                LineMatch::Success(k) => {
                    matched = Some(k);
                    verdict_line = Some(text);
                    break MonitorState::MatchedSuccess;
                }
                LineMatch::EndMarker => {
                    matched = self.config.end_marker.clone();
                    verdict_line = Some(text);
                    break MonitorState::EndMarker;
                }
                LineMatch::None => {}
            }
        };

        self.state = state;
        tracing::debug!(%state, lines = log.len(), "monitor finished");
        MonitorOutcome {
            state,
            matched,
            line: verdict_line,
            log,
            elapsed: started.elapsed(),
            read_error,
        }
    }
}
