//! Structured run reporting.
//!
//! Operations accumulate one [`ResourceOutcome`] per resource; at the end of
//! the run the reporter rolls them up into a [`RunReport`] with timings and
//! totals, optionally written as a JSON file for upstream orchestration.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub status: u16,
    pub message: String,
    pub file: String,
    pub count: usize,
    pub lines: Vec<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceOutcome {
    pub resource: String,
    /// Payloads dispatched and acknowledged with a success status.
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailureDetail>,
    pub skip_reasons: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Totals {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub command: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub totals: Totals,
    pub resources: Vec<ResourceOutcome>,
}

pub struct RunReporter {
    command: String,
    started_at: DateTime<Utc>,
    outcomes: Mutex<Vec<ResourceOutcome>>,
}

impl RunReporter {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            started_at: Utc::now(),
            outcomes: Mutex::new(Vec::new()),
        }
    }

    pub fn record(&self, outcome: ResourceOutcome) {
        self.outcomes.lock().push(outcome);
    }

    pub fn totals(&self) -> Totals {
        let outcomes = self.outcomes.lock();
        let mut totals = Totals::default();
        for outcome in outcomes.iter() {
            totals.processed += outcome.processed;
            totals.skipped += outcome.skipped;
            totals.failed += outcome.failed;
        }
        totals
    }

    pub fn finalize(&self) -> RunReport {
        let completed_at = Utc::now();
        let resources = self.outcomes.lock().clone();
        let totals = self.totals();
        RunReport {
            run_id: Uuid::new_v4().to_string(),
            command: self.command.clone(),
            started_at: self.started_at,
            completed_at,
            duration_seconds: (completed_at - self.started_at).num_milliseconds() as f64 / 1000.0,
            totals,
            resources,
        }
    }

    /// Writes the final report as pretty JSON.
    pub fn write(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let report = self.finalize();
        let body = serde_json::to_string_pretty(&report)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        fs::write(path, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(resource: &str, processed: usize, skipped: usize, failed: usize) -> ResourceOutcome {
        ResourceOutcome {
            resource: resource.to_string(),
            processed,
            skipped,
            failed,
            failures: Vec::new(),
            skip_reasons: BTreeMap::new(),
        }
    }

    #[test]
    fn totals_roll_up_across_resources() {
        let reporter = RunReporter::new("send");
        reporter.record(outcome("schools", 3, 0, 0));
        reporter.record(outcome("students", 10, 4, 2));
        let totals = reporter.totals();
        assert_eq!(totals.processed, 13);
        assert_eq!(totals.skipped, 4);
        assert_eq!(totals.failed, 2);
    }

    #[test]
    fn report_serializes_with_timings() {
        let reporter = RunReporter::new("send");
        reporter.record(outcome("schools", 1, 0, 0));
        let report = reporter.finalize();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["command"], "send");
        assert_eq!(json["totals"]["processed"], 1);
        assert!(json["run_id"].as_str().is_some());
        assert!(json["duration_seconds"].as_f64().is_some());
    }
}
