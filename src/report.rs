use crate::error::ForgeError;
use crate::repair::RepairOutcome;
use chrono::{DateTime, Utc};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    pub driver: String,
    pub state: String,
    pub success: bool,
    pub iterations: u32,
    pub compile_cycles: u32,
    pub duration_seconds: f64,
    /// BLAKE3 of the retained driver; absent when it was discarded.
    pub fingerprint: Option<String>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl ReportEntry {
    pub fn from_outcome(outcome: &RepairOutcome) -> Self {
        let error = match &outcome.state {
            crate::repair::LoopState::Aborted(e) => Some(e.to_string()),
            _ => None,
        };
        Self {
            driver: outcome.candidate.name(),
            state: outcome.state.label().to_string(),
            success: outcome.succeeded(),
            iterations: outcome.attempts,
            compile_cycles: outcome.compile_cycles,
            duration_seconds: outcome.elapsed.as_secs_f64(),
            fingerprint: outcome.candidate.fingerprint().ok(),
            error,
            finished_at: Utc::now(),
        }
    }
}

/// Aggregate view over many repair loop runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompilationReport {
    pub entries: Vec<ReportEntry>,
}

impl CompilationReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, outcome: &RepairOutcome) {
        self.entries.push(ReportEntry::from_outcome(outcome));
    }

    pub fn succeeded(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }

    pub fn aborted(&self) -> usize {
        self.entries.iter().filter(|e| e.state == "aborted").count()
    }

    pub fn failed(&self) -> usize {
        self.entries.len() - self.succeeded()
    }

    /// Plain-text report, one line per driver plus a summary line.
    pub fn render(&self) -> String {
        let mut out = String::from("=== Compilation Report ===\n");
        for e in &self.entries {
            let status = if e.success {
                "success".green()
            } else {
                e.state.as_str().red()
            };
            let _ = writeln!(
                out,
                "{}: {}, iterations={}, duration_seconds={:.2}",
                e.driver, status, e.iterations, e.duration_seconds
            );
        }
        let _ = writeln!(
            out,
            "total={} succeeded={} failed={} aborted={}",
            self.entries.len(),
            self.succeeded(),
            self.failed(),
            self.aborted()
        );
        out
    }

    pub fn write_json(&self, path: &Path) -> Result<(), ForgeError> {
        let content = serde_json::to_string_pretty(self).map_err(anyhow::Error::from)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ForgeError::io(parent, e))?;
        }
        std::fs::write(path, content).map_err(|e| ForgeError::io(path, e))
    }
}
