//! Outcome of a pipeline run.
//!
//! Every work unit ends up either completed, with the path of its production
//! profile, or failed, with the stage that failed and the error that stopped
//! it. The report is also persisted as JSON next to the profiles.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::artifacts::{StageKind, WorkUnit};
use crate::error::StageError;

/// File name of the persisted report inside the output directory.
pub const REPORT_FILE_NAME: &str = "pipeline_report.json";

/// Version of the persisted report layout.
pub const REPORT_SCHEMA_VERSION: u32 = 1;

/// A unit whose production profile exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletedUnit {
    #[serde(flatten)]
    pub unit: WorkUnit,
    pub production: PathBuf,
}

/// A unit that stopped at `stage`.
///
/// The error is shared: a failed batched extraction fails every lag time it
/// covered with the same error.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub unit: WorkUnit,
    pub stage: StageKind,
    pub error: Arc<StageError>,
}

impl UnitFailure {
    pub fn new(unit: WorkUnit, stage: StageKind, error: impl Into<Arc<StageError>>) -> Self {
        Self {
            unit,
            stage,
            error: error.into(),
        }
    }

    /// Log file to inspect, when the failing stage produced one.
    pub fn log_path(&self) -> Option<&Path> {
        self.error.log_path().map(PathBuf::as_path)
    }

    /// Final artifact the failing stage was expected to produce.
    pub fn artifact_path(&self) -> Option<&Path> {
        self.error.artifact_path().map(PathBuf::as_path)
    }
}

impl fmt::Display for UnitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "replica {} lag {} failed at {}: {}",
            self.unit.replica_id, self.unit.lag_time, self.stage, self.error
        )
    }
}

/// Result of running one unit to completion.
pub type UnitResult = Result<CompletedUnit, UnitFailure>;

/// Overall status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failed,
}

/// Joined results of every unit of a run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed: Vec<CompletedUnit>,
    pub failures: Vec<UnitFailure>,
}

impl PipelineReport {
    /// Split joined unit results, keeping their dispatch order.
    pub fn from_results(
        results: Vec<UnitResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let mut completed = Vec::new();
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(unit) => completed.push(unit),
                Err(failure) => failures.push(failure),
            }
        }
        Self {
            started_at,
            finished_at,
            completed,
            failures,
        }
    }

    /// True only if every unit completed.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn status(&self) -> RunStatus {
        if self.is_success() {
            RunStatus::Success
        } else {
            RunStatus::Failed
        }
    }

    pub fn unit_count(&self) -> usize {
        self.completed.len() + self.failures.len()
    }

    /// Production profiles of the completed units.
    pub fn production_paths(&self) -> Vec<&Path> {
        self.completed
            .iter()
            .map(|unit| unit.production.as_path())
            .collect()
    }

    /// One-line summary such as `3 of 4 units completed, 1 failed`.
    pub fn summary(&self) -> String {
        format!(
            "{} of {} units completed, {} failed",
            self.completed.len(),
            self.unit_count(),
            self.failures.len()
        )
    }

    /// JSON document persisted by [`PipelineReport::write`].
    ///
    /// Fails when a recorded path is not valid UTF-8.
    pub fn to_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(self.export())
    }

    /// Write the report to `path` through a temporary file.
    ///
    /// Nothing is written when the report cannot be serialized.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(&self.export()).map_err(io::Error::other)?;
        let temp_path = path.with_extension("json.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)
    }

    fn export(&self) -> ReportExport<'_> {
        let failed: Vec<FailureRecord<'_>> = self
            .failures
            .iter()
            .map(|failure| FailureRecord {
                replica_id: &failure.unit.replica_id,
                lag_time: failure.unit.lag_time,
                stage: failure.stage,
                error: failure.error.to_string(),
                artifact: failure.artifact_path(),
                log: failure.log_path(),
            })
            .collect();
        ReportExport {
            schema_version: REPORT_SCHEMA_VERSION,
            status: self.status(),
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            units: self.unit_count(),
            completed: &self.completed,
            failed,
        }
    }
}

#[derive(Serialize)]
struct ReportExport<'a> {
    schema_version: u32,
    status: RunStatus,
    started_at: String,
    finished_at: String,
    units: usize,
    completed: &'a [CompletedUnit],
    failed: Vec<FailureRecord<'a>>,
}

#[derive(Serialize)]
struct FailureRecord<'a> {
    replica_id: &'a str,
    lag_time: u64,
    stage: StageKind,
    error: String,
    artifact: Option<&'a Path>,
    log: Option<&'a Path>,
}
