//! Ingest progress reporting.
//!
//! Turns [`IngestObserver`] callbacks into progress lines on **stderr** so
//! stdout stays parseable for scripts. Human output looks like:
//!
//! ```text
//! ingest data/products.json  read 1,200 records
//! ingest data/products.json  embedding
//! ingest data/products.json  batch 3 / 12  300 / 1,200 committed
//! ```

use std::io::Write;

use semantic_kb_core::ingest::{BatchProgress, DocumentFailure, IngestObserver, IngestState};

/// Human-friendly progress on stderr.
pub struct StderrProgress {
    label: String,
}

impl StderrProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn emit(&self, message: &str) {
        let line = format!("ingest {}  {}\n", self.label, message);
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

impl IngestObserver for StderrProgress {
    fn on_state(&self, _from: IngestState, to: IngestState) {
        // Batches report Embedding/Writing on their own line.
        if matches!(
            to,
            IngestState::Normalizing | IngestState::Done | IngestState::Failed
        ) {
            self.emit(&to.to_string());
        }
    }

    fn on_read(&self, _source: &str, records: usize) {
        self.emit(&format!("read {} records", format_number(records as u64)));
    }

    fn on_batch(&self, progress: &BatchProgress) {
        self.emit(&format!(
            "batch {} / {}  {} / {} committed",
            progress.batch,
            progress.batches,
            format_number(progress.committed as u64),
            format_number(progress.total as u64)
        ));
    }

    fn on_failure(&self, failure: &DocumentFailure) {
        self.emit(&format!("skipped {}", failure));
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress {
    label: String,
}

impl JsonProgress {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }

    fn emit(&self, obj: serde_json::Value) {
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

impl IngestObserver for JsonProgress {
    fn on_state(&self, from: IngestState, to: IngestState) {
        self.emit(serde_json::json!({
            "event": "state",
            "source": self.label,
            "from": from.to_string(),
            "to": to.to_string()
        }));
    }

    fn on_read(&self, _source: &str, records: usize) {
        self.emit(serde_json::json!({
            "event": "read",
            "source": self.label,
            "records": records
        }));
    }

    fn on_batch(&self, progress: &BatchProgress) {
        self.emit(serde_json::json!({
            "event": "progress",
            "source": self.label,
            "batch": progress.batch,
            "batches": progress.batches,
            "written": progress.written,
            "committed": progress.committed,
            "failed": progress.failed,
            "total": progress.total
        }));
    }

    fn on_failure(&self, failure: &DocumentFailure) {
        self.emit(serde_json::json!({
            "event": "failure",
            "source": self.label,
            "index": failure.source_index,
            "id": failure.id,
            "reason": failure.reason
        }));
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl IngestObserver for NoProgress {}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
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

    /// Parse a `--progress` flag value, falling back to the TTY default.
    pub fn from_flag(flag: Option<&str>) -> anyhow::Result<Self> {
        match flag {
            None => Ok(Self::default_for_tty()),
            Some("off") => Ok(ProgressMode::Off),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some(other) => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be off, human, or json.",
                other
            ),
        }
    }

    pub fn reporter(&self, label: &str) -> Box<dyn IngestObserver> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new(label)),
            ProgressMode::Json => Box::new(JsonProgress::new(label)),
        }
    }
}
