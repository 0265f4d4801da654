//! Orchestration of the mcdiff diffusion-profile pipeline.
//!
//! Every (replica, lag time) pair is a work unit that passes through three
//! stages: transition-matrix extraction with a CHARMM-style executable, then
//! an equilibration and a production run of the Monte-Carlo solver. Each
//! stage is skipped when its output file already exists, so an interrupted
//! run can simply be started again.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod options;
pub mod parallel;
pub mod pipeline;
pub mod process;
pub mod report;
pub mod stage;
pub mod timeout;

#[cfg(test)]
mod testing;

pub use artifacts::{ArtifactResolver, Phase, StageArtifact, StageKind, WorkUnit};
pub use config::{
    ExitCodePolicy, FanOutShape, LagTimes, PipelineConfig, Replica, TransitionMatrixStrategy,
};
pub use error::{ConfigError, PipelineError, PipelineResult, ProcessError, StageError};
pub use options::{format_flags, merge, OptionSet, OptionValue};
pub use parallel::{FanOutPlan, ParallelRunner, UnitScheduler};
pub use pipeline::{Pipeline, StagePlan, UnitPlan};
pub use process::{ExecutionResult, ProcessInvocation, ProcessRunner, SystemProcessRunner};
pub use report::{CompletedUnit, PipelineReport, UnitFailure, UnitResult, REPORT_FILE_NAME};
pub use stage::StageExecutor;
pub use timeout::TimeoutConfig;
