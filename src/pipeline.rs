//! Top-level controller.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info};

use crate::artifacts::{ArtifactResolver, StageArtifact, StageKind, WorkUnit};
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError, PipelineResult};
use crate::parallel::{ParallelRunner, UnitScheduler};
use crate::process::{ProcessRunner, SystemProcessRunner};
use crate::report::{PipelineReport, REPORT_FILE_NAME};
use crate::stage::StageExecutor;

/// Artifact state of one stage of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    pub stage: StageKind,
    pub artifact: StageArtifact,
    pub done: bool,
}

/// Artifact state of every stage of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitPlan {
    pub unit: WorkUnit,
    pub stages: Vec<StagePlan>,
}

impl UnitPlan {
    /// The stage a run would start this unit at, or `None` if it is done.
    pub fn next_stage(&self) -> Option<StageKind> {
        self.stages
            .iter()
            .find(|stage| !stage.done)
            .map(|stage| stage.stage)
    }

    pub fn is_complete(&self) -> bool {
        self.next_stage().is_none()
    }
}

/// Runs every work unit of a configuration to completion.
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn ProcessRunner>,
    write_report: bool,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            config: Arc::new(config),
            runner,
            write_report: true,
        }
    }

    /// Pipeline that spawns the real executables.
    pub fn with_system_runner(config: PipelineConfig) -> Self {
        Self::new(config, Arc::new(SystemProcessRunner::new()))
    }

    /// Skip writing `pipeline_report.json`.
    pub fn without_report(mut self) -> Self {
        self.write_report = false;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn report_path(&self) -> PathBuf {
        self.config.output_dir.join(REPORT_FILE_NAME)
    }

    /// Resolve every artifact of every unit and check which exist, without
    /// running anything.
    pub fn plan(&self) -> Result<Vec<UnitPlan>, ConfigError> {
        let resolver = ArtifactResolver::new(&self.config);
        self.config
            .units()
            .into_iter()
            .map(|unit| {
                let stages = StageKind::ALL
                    .into_iter()
                    .map(|stage| {
                        let artifact = resolver.resolve(&unit, stage)?;
                        let done = artifact.exists();
                        Ok(StagePlan {
                            stage,
                            artifact,
                            done,
                        })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok(UnitPlan { unit, stages })
            })
            .collect()
    }

    /// Run every unit and join the results.
    ///
    /// Unit failures are reported, not returned: the `Err` arm is reserved
    /// for problems that stop the run as a whole.
    pub async fn run(&self) -> PipelineResult<PipelineReport> {
        let plan = self.plan()?;
        let pending = plan.iter().filter(|unit| !unit.is_complete()).count();

        fs::create_dir_all(&self.config.output_dir).map_err(|source| {
            PipelineError::OutputDir {
                path: self.config.output_dir.clone(),
                source,
            }
        })?;

        info!(
            units = plan.len(),
            pending,
            replicas = self.config.replicas.len(),
            parallel = self.config.parallel,
            fanout = self.config.fanout.as_label(),
            "starting pipeline"
        );
        let started_at = Utc::now();
        let stages = StageExecutor::new(Arc::clone(&self.config), Arc::clone(&self.runner));
        let results = ParallelRunner::new(UnitScheduler::new(stages)).run().await;
        let report = PipelineReport::from_results(results, started_at, Utc::now());

        for failure in &report.failures {
            error!(
                replica = %failure.unit.replica_id,
                lag = failure.unit.lag_time,
                stage = %failure.stage,
                artifact = ?failure.artifact_path(),
                log = ?failure.log_path(),
                error = %failure.error,
                "unit failed"
            );
        }

        if self.write_report {
            let path = self.report_path();
            report
                .write(&path)
                .map_err(|source| PipelineError::Report { path, source })?;
        }

        info!(
            completed = report.completed.len(),
            failed = report.failures.len(),
            "pipeline finished"
        );
        Ok(report)
    }
}
