//! Error types for every layer of the pipeline.
//!
//! Configuration problems surface as [`ConfigError`] before any worker starts.
//! Everything that goes wrong while a stage runs is a [`StageError`], which is
//! local to the work unit it belongs to and never aborts sibling units.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::artifacts::StageKind;

/// Errors raised while loading or validating the pipeline configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration document is not valid TOML or has the wrong shape.
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required key is absent.
    #[error("missing configuration key [{section}] {key}")]
    Missing {
        section: &'static str,
        key: &'static str,
    },

    /// A key is present but its value is unusable.
    #[error("invalid value for [{section}] {key}: {reason}")]
    Invalid {
        section: &'static str,
        key: String,
        reason: String,
    },

    /// The transition-matrix path template cannot produce a usable path.
    #[error("invalid transition-matrix template {template:?}: {reason}")]
    Template { template: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(
        section: &'static str,
        key: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        ConfigError::Invalid {
            section,
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the process runner itself, independent of exit status.
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The log file could not be created.
    #[error("cannot open log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The driver script for standard input could not be opened.
    #[error("cannot open stdin source {path}: {source}")]
    Stdin {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The child process could not be started.
    #[error("cannot start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Waiting on the child failed.
    #[error("lost track of {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child exceeded its time limit and was killed.
    #[error("{program} exceeded its {}s limit and was killed", .limit.as_secs())]
    TimedOut { program: String, limit: Duration },
}

/// Failure of a single stage for one replica and one or more lag times.
#[derive(Error, Debug)]
pub enum StageError {
    /// The stage ran but its declared output did not appear.
    #[error(
        "{stage} for replica {replica} lag {}: expected artifact {} was not produced; check {}",
        fmt_lags(.lags),
        .artifact.display(),
        .log.display()
    )]
    ArtifactMissing {
        replica: String,
        lags: Vec<u64>,
        stage: StageKind,
        artifact: PathBuf,
        log: PathBuf,
    },

    /// The external command returned a non-zero status.
    #[error(
        "{stage} for replica {replica} lag {} exited with {}; expected artifact {}; check {}",
        fmt_lags(.lags),
        fmt_exit(.exit_code),
        .artifact.display(),
        .log.display()
    )]
    ProcessExit {
        replica: String,
        lags: Vec<u64>,
        stage: StageKind,
        exit_code: Option<i32>,
        artifact: PathBuf,
        log: PathBuf,
    },

    /// A batched extraction produced fewer lag-time outputs than expected.
    ///
    /// `artifacts` holds the final matrix path of each lag in `missing`.
    #[error(
        "transition-matrix for replica {replica} lag {}: batched extraction produced no output; expected artifacts {}; check {}",
        fmt_lags(.missing),
        fmt_paths(.artifacts),
        .log.display()
    )]
    BatchArtifactIncomplete {
        replica: String,
        missing: Vec<u64>,
        artifacts: Vec<PathBuf>,
        log: PathBuf,
    },

    /// The process runner could not complete the invocation.
    #[error(
        "{stage} for replica {replica} lag {}: {source}; expected artifact {}; check {}",
        fmt_lags(.lags),
        .artifact.display(),
        .log.display()
    )]
    Process {
        replica: String,
        lags: Vec<u64>,
        stage: StageKind,
        artifact: PathBuf,
        log: PathBuf,
        #[source]
        source: ProcessError,
    },

    /// A produced transition matrix could not be moved to its final location.
    #[error(
        "transition-matrix for replica {replica} lag {}: cannot move {} to expected artifact {}: {source}",
        fmt_lags(.lags),
        .from.display(),
        .to.display()
    )]
    Relocate {
        replica: String,
        lags: Vec<u64>,
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A scratch directory for transition-matrix extraction could not be prepared.
    #[error(
        "transition-matrix for replica {replica} lag {}: cannot prepare scratch directory {}: {source}",
        fmt_lags(.lags),
        .path.display()
    )]
    Scratch {
        replica: String,
        lags: Vec<u64>,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The worker running the stage stopped without reporting a result.
    #[error("worker for replica {replica} lag {} stopped unexpectedly: {reason}", fmt_lags(.lags))]
    WorkerAborted {
        replica: String,
        lags: Vec<u64>,
        reason: String,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StageError {
    /// The log file to inspect for this failure, when one exists.
    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            StageError::ArtifactMissing { log, .. }
            | StageError::ProcessExit { log, .. }
            | StageError::BatchArtifactIncomplete { log, .. }
            | StageError::Process { log, .. } => Some(log),
            StageError::Relocate { .. }
            | StageError::Scratch { .. }
            | StageError::WorkerAborted { .. }
            | StageError::Config(_) => None,
        }
    }

    /// The final artifact path the failed stage was expected to produce.
    ///
    /// A batched extraction reports the first of its missing matrices.
    pub fn artifact_path(&self) -> Option<&PathBuf> {
        match self {
            StageError::ArtifactMissing { artifact, .. }
            | StageError::ProcessExit { artifact, .. }
            | StageError::Process { artifact, .. } => Some(artifact),
            StageError::BatchArtifactIncomplete { artifacts, .. } => artifacts.first(),
            StageError::Relocate { to, .. } => Some(to),
            StageError::Scratch { .. }
            | StageError::WorkerAborted { .. }
            | StageError::Config(_) => None,
        }
    }
}

/// Top-level errors that stop a run before or after the fan-out.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The output directory could not be created.
    #[error("cannot create output directory {}: {source}", .path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The run report could not be written.
    #[error("cannot write run report {}: {source}", .path.display())]
    Report {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Result type for pipeline-level operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

fn fmt_lags(lags: &[u64]) -> String {
    lags.iter()
        .map(|lag| lag.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

fn fmt_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn fmt_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}
