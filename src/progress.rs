//! Sync progress reporting.
//!
//! Reports observable progress during `bsync sync` so users see which
//! phase is running and how many records have been written. Progress is
//! emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;

use crate::models::Phase;

/// A single progress event for sync.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// A phase resolved its resume point and is about to request pages.
    PhaseStarted { connector: String, phase: Phase },
    /// A batch landed; `records` is the running total for the phase.
    PageFlushed {
        connector: String,
        phase: Phase,
        records: u64,
    },
    /// The phase ran out of pages.
    PhaseDone {
        connector: String,
        phase: Phase,
        records: u64,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    /// Emit a progress event. Called from both phase tasks.
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync circleci:app  fetch  1,234 records".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::PhaseStarted { connector, phase } => {
                format!("sync {}  {}  starting...\n", connector, phase)
            }
            SyncProgressEvent::PageFlushed {
                connector,
                phase,
                records,
            } => format!(
                "sync {}  {}  {} records\n",
                connector,
                phase,
                format_number(*records)
            ),
            SyncProgressEvent::PhaseDone {
                connector,
                phase,
                records,
            } => format!(
                "sync {}  {}  done ({} records)\n",
                connector,
                phase,
                format_number(*records)
            ),
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::PhaseStarted { connector, phase } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": phase.as_str(),
                "status": "started"
            }),
            SyncProgressEvent::PageFlushed {
                connector,
                phase,
                records,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": phase.as_str(),
                "status": "flushed",
                "records": records
            }),
            SyncProgressEvent::PhaseDone {
                connector,
                phase,
                records,
            } => serde_json::json!({
                "event": "progress",
                "connector": connector,
                "phase": phase.as_str(),
                "status": "done",
                "records": records
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    /// Parse the `--progress` flag value.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" | "none" => Some(ProgressMode::Off),
            "human" => Some(ProgressMode::Human),
            "json" => Some(ProgressMode::Json),
            _ => None,
        }
    }

    /// Build a reporter for this mode.
    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}
