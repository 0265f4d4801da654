//! Deterministic artifact paths.
//!
//! Every stage of every work unit has exactly one durable output file. Its
//! existence is the only "done" signal the pipeline trusts, so the paths
//! computed here must be stable across runs and distinct across units.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::config::PipelineConfig;
use crate::error::ConfigError;

/// One (replica, lag time) pipeline instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkUnit {
    pub replica_id: String,
    pub lag_time: u64,
}

impl WorkUnit {
    pub fn new(replica_id: impl Into<String>, lag_time: u64) -> Self {
        Self {
            replica_id: replica_id.into(),
            lag_time,
        }
    }
}

impl fmt::Display for WorkUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica_id, self.lag_time)
    }
}

/// The three stages each work unit passes through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    TransitionMatrix,
    Equilibration,
    Production,
}

impl StageKind {
    /// Every stage in execution order.
    pub const ALL: [StageKind; 3] = [
        StageKind::TransitionMatrix,
        StageKind::Equilibration,
        StageKind::Production,
    ];

    pub fn as_label(&self) -> &'static str {
        match self {
            StageKind::TransitionMatrix => "transition-matrix",
            StageKind::Equilibration => "equilibration",
            StageKind::Production => "production",
        }
    }

    /// Solver phase for the Monte-Carlo stages.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            StageKind::TransitionMatrix => None,
            StageKind::Equilibration => Some(Phase::Equilibration),
            StageKind::Production => Some(Phase::Production),
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Monte-Carlo solver phase. The discriminant is the index used in file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Equilibration = 0,
    Production = 1,
}

impl Phase {
    pub fn index(self) -> u8 {
        self as u8
    }

    pub fn stage(self) -> StageKind {
        match self {
            Phase::Equilibration => StageKind::Equilibration,
            Phase::Production => StageKind::Production,
        }
    }
}

/// A resolved output path whose existence marks a stage as done.
///
/// Existence is checked on every call; artifacts can appear or vanish
/// between runs and nothing here caches it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageArtifact {
    path: PathBuf,
}

impl StageArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn into_path(self) -> PathBuf {
        self.path
    }
}

/// Maps work units and stages onto absolute file paths.
#[derive(Debug, Clone, Copy)]
pub struct ArtifactResolver<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ArtifactResolver<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// Output artifact of `stage` for `unit`.
    pub fn resolve(&self, unit: &WorkUnit, stage: StageKind) -> Result<StageArtifact, ConfigError> {
        match stage.phase() {
            None => self.transition_matrix(unit),
            Some(phase) => Ok(self.profile(unit, phase)),
        }
    }

    /// Transition matrix for one replica and lag time, rendered from the template.
    pub fn transition_matrix(&self, unit: &WorkUnit) -> Result<StageArtifact, ConfigError> {
        let template =
            self.config
                .transition
                .template
                .as_ref()
                .ok_or(ConfigError::Missing {
                    section: "charmm",
                    key: "tmat",
                })?;
        let rendered = template.render(&unit.replica_id, unit.lag_time);
        Ok(StageArtifact::new(self.absolute(Path::new(&rendered))))
    }

    /// Density and free-energy profile written by one solver phase.
    pub fn profile(&self, unit: &WorkUnit, phase: Phase) -> StageArtifact {
        StageArtifact::new(self.config.output_dir.join(format!(
            "profiles.{}.{}.{}.dat",
            unit.replica_id,
            unit.lag_time,
            phase.index()
        )))
    }

    /// Combined stdout/stderr capture of one solver phase.
    pub fn solver_log(&self, unit: &WorkUnit, phase: Phase) -> PathBuf {
        self.config.output_dir.join(format!(
            "profiles.{}.{}.{}.log",
            unit.replica_id,
            unit.lag_time,
            phase.index()
        ))
    }

    /// Log of the stage's external invocation, whichever stage it is.
    pub fn log(&self, unit: &WorkUnit, stage: StageKind) -> PathBuf {
        match stage.phase() {
            None => self.transition_log(unit),
            Some(phase) => self.solver_log(unit, phase),
        }
    }

    /// Capture file of a single-lag transition-matrix invocation.
    pub fn transition_log(&self, unit: &WorkUnit) -> PathBuf {
        self.config
            .output_dir
            .join(format!("chm_tmat.{}.{}.out", unit.replica_id, unit.lag_time))
    }

    /// Capture file of a batched transition-matrix invocation over a lag range.
    pub fn batch_log(&self, replica_id: &str, first: u64, last: u64, step: u64) -> PathBuf {
        self.config.output_dir.join(format!(
            "chm_tmat.{}.{}-{}-{}.out",
            replica_id, first, last, step
        ))
    }

    fn absolute(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.config.base_dir.join(path)
        }
    }
}
