//! Ingestion progress tracking and reporting.
//!
//! [`IngestProgress`] is the per-run tracker: counters, status, and a
//! timestamped error log that is persisted with the run. Reporters emit live
//! progress on **stderr** so stdout stays parseable for scripts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::io::Write;

/// Number of errors included in serialized progress.
const RECENT_ERRORS: usize = 5;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl IngestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStatus::Pending => "pending",
            IngestStatus::Running => "running",
            IngestStatus::Completed => "completed",
            IngestStatus::Failed => "failed",
            IngestStatus::Paused => "paused",
        }
    }
}

/// Counters and status for one ingestion run.
#[derive(Clone, Debug)]
pub struct IngestProgress {
    pub total_items: u64,
    pub processed_items: u64,
    pub failed_items: u64,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub status: IngestStatus,
    pub errors: Vec<String>,
    pub metadata: Map<String, Value>,
}

impl Default for IngestProgress {
    fn default() -> Self {
        Self::new(0)
    }
}

impl IngestProgress {
    pub fn new(total_items: u64) -> Self {
        let now = Utc::now();
        Self {
            total_items,
            processed_items: 0,
            failed_items: 0,
            start_time: now,
            last_update: now,
            status: IngestStatus::Pending,
            errors: Vec::new(),
            metadata: Map::new(),
        }
    }

    /// Share of records attempted so far, in percent.
    pub fn completion_percentage(&self) -> f64 {
        if self.total_items == 0 {
            return 0.0;
        }
        (self.processed_items + self.failed_items) as f64 / self.total_items as f64 * 100.0
    }

    /// Share of attempted records that were stored, in percent.
    pub fn success_rate(&self) -> f64 {
        let attempted = self.processed_items + self.failed_items;
        if attempted == 0 {
            return 0.0;
        }
        self.processed_items as f64 / attempted as f64 * 100.0
    }

    pub fn update(&mut self, processed: u64, failed: u64, metadata: Option<Map<String, Value>>) {
        self.processed_items += processed;
        self.failed_items += failed;
        self.last_update = Utc::now();
        if let Some(extra) = metadata {
            self.metadata.extend(extra);
        }
    }

    pub fn add_error(&mut self, error: impl AsRef<str>) {
        self.errors
            .push(format!("{}: {}", Utc::now().to_rfc3339(), error.as_ref()));
    }

    pub fn start(&mut self) {
        self.status = IngestStatus::Running;
        self.last_update = Utc::now();
    }

    pub fn pause(&mut self) {
        if self.status == IngestStatus::Running {
            self.status = IngestStatus::Paused;
            tracing::info!("ingestion paused");
        }
    }

    pub fn resume(&mut self) {
        if self.status == IngestStatus::Paused {
            self.status = IngestStatus::Running;
            tracing::info!("ingestion resumed");
        }
    }

    /// Settle the final status: completed only when nothing failed.
    pub fn finish(&mut self) {
        self.status = if self.failed_items == 0 && self.errors.is_empty() {
            IngestStatus::Completed
        } else {
            IngestStatus::Failed
        };
        self.last_update = Utc::now();
    }

    pub fn to_json(&self) -> Value {
        let recent: Vec<&String> = self
            .errors
            .iter()
            .skip(self.errors.len().saturating_sub(RECENT_ERRORS))
            .collect();
        json!({
            "total_items": self.total_items,
            "processed_items": self.processed_items,
            "failed_items": self.failed_items,
            "completion_percentage": self.completion_percentage(),
            "success_rate": self.success_rate(),
            "status": self.status.as_str(),
            "start_time": self.start_time.to_rfc3339(),
            "last_update": self.last_update.to_rfc3339(),
            "error_count": self.errors.len(),
            "recent_errors": recent,
            "metadata": Value::Object(self.metadata.clone()),
        })
    }
}

// ============ Live reporting ============

/// A single progress event for an ingestion run.
#[derive(Clone, Debug)]
pub enum IngestEvent {
    /// Source is being validated and parsed; record count not yet known.
    Parsing { ingestor: String },
    /// n records attempted out of total.
    Ingesting { ingestor: String, n: u64, total: u64 },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: IngestEvent);
}

/// Human-friendly progress: `ingest claude  ingesting  1,234 / 5,000 records`.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: IngestEvent) {
        let line = match &event {
            IngestEvent::Parsing { ingestor } => format!("ingest {}  parsing...\n", ingestor),
            IngestEvent::Ingesting { ingestor, n, total } => format!(
                "ingest {}  ingesting  {} / {} records\n",
                ingestor,
                format_number(*n),
                format_number(*total)
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// One JSON object per line.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: IngestEvent) {
        let obj = match &event {
            IngestEvent::Parsing { ingestor } => json!({
                "event": "progress",
                "ingestor": ingestor,
                "phase": "parsing"
            }),
            IngestEvent::Ingesting { ingestor, n, total } => json!({
                "event": "progress",
                "ingestor": ingestor,
                "phase": "ingesting",
                "n": n,
                "total": total
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: IngestEvent) {}
}

pub fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut out = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn parse(value: Option<&str>) -> anyhow::Result<Self> {
        match value {
            None => Ok(Self::default_for_tty()),
            Some("off") => Ok(ProgressMode::Off),
            Some("human") => Ok(ProgressMode::Human),
            Some("json") => Ok(ProgressMode::Json),
            Some(other) => anyhow::bail!("Unknown progress mode: '{}'. Use off, human, or json.", other),
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn rates_are_zero_before_any_work() {
        let p = IngestProgress::new(0);
        assert_eq!(p.completion_percentage(), 0.0);
        assert_eq!(p.success_rate(), 0.0);
        assert_eq!(p.status, IngestStatus::Pending);
    }

    #[test]
    fn rates_track_processed_and_failed() {
        let mut p = IngestProgress::new(10);
        p.start();
        p.update(3, 1, None);
        assert!((p.completion_percentage() - 40.0).abs() < 1e-9);
        assert!((p.success_rate() - 75.0).abs() < 1e-9);
        p.finish();
        assert_eq!(p.status, IngestStatus::Failed);
    }

    #[test]
    fn finish_without_failures_completes() {
        let mut p = IngestProgress::new(2);
        p.start();
        p.update(2, 0, None);
        p.finish();
        assert_eq!(p.status, IngestStatus::Completed);
        assert!((p.success_rate() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn pause_and_resume_only_from_matching_state() {
        let mut p = IngestProgress::new(1);
        p.pause();
        assert_eq!(p.status, IngestStatus::Pending);
        p.start();
        p.pause();
        assert_eq!(p.status, IngestStatus::Paused);
        p.resume();
        assert_eq!(p.status, IngestStatus::Running);
    }

    #[test]
    fn json_keeps_last_five_errors() {
        let mut p = IngestProgress::new(0);
        for i in 0..8 {
            p.add_error(format!("e{}", i));
        }
        let mut extra = Map::new();
        extra.insert("ingestor".into(), json!("claude"));
        p.update(0, 0, Some(extra));

        let v = p.to_json();
        assert_eq!(v["error_count"], 8);
        let recent = v["recent_errors"].as_array().unwrap();
        assert_eq!(recent.len(), 5);
        assert!(recent[0].as_str().unwrap().ends_with(": e3"));
        assert!(recent[4].as_str().unwrap().ends_with(": e7"));
        assert_eq!(v["metadata"]["ingestor"], "claude");
        assert_eq!(v["status"], "pending");
    }
}
