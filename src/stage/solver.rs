//! Monte-Carlo solver phases.

use tracing::info;

use super::StageExecutor;
use crate::artifacts::{Phase, StageArtifact, StageKind, WorkUnit};
use crate::error::StageError;
use crate::options::{format_flags, merge, to_args, OptionSet};
use crate::process::ProcessInvocation;

impl StageExecutor {
    /// Equilibration run for one unit.
    pub async fn equilibration(&self, unit: &WorkUnit) -> Result<StageArtifact, StageError> {
        self.solver_phase(unit, Phase::Equilibration).await
    }

    /// Production run for one unit, started from the equilibration output.
    pub async fn production(&self, unit: &WorkUnit) -> Result<StageArtifact, StageError> {
        self.solver_phase(unit, Phase::Production).await
    }

    /// Options in effect for `phase`. Production inherits equilibration settings.
    pub fn effective_options(&self, phase: Phase) -> OptionSet {
        match phase {
            Phase::Equilibration => self.config.equilibration.clone(),
            Phase::Production => merge(&self.config.equilibration, &self.config.production),
        }
    }

    /// Command line of one solver phase.
    pub fn solver_invocation(
        &self,
        unit: &WorkUnit,
        phase: Phase,
    ) -> Result<ProcessInvocation, StageError> {
        let resolver = self.resolver();
        let transition_matrix = resolver.transition_matrix(unit)?;
        let output = resolver.profile(unit, phase);

        let solver = &self.config.solver;
        let mut args = solver.args.clone();
        args.push(transition_matrix.path().display().to_string());
        args.push("-o".to_string());
        args.push(output.path().display().to_string());
        if phase == Phase::Production {
            args.push("--initf".to_string());
            args.push(
                resolver
                    .profile(unit, Phase::Equilibration)
                    .path()
                    .display()
                    .to_string(),
            );
        }
        args.extend(to_args(&format_flags(&self.effective_options(phase))));

        Ok(
            ProcessInvocation::new(&solver.executable, resolver.solver_log(unit, phase))
                .args(args)
                .artifact(output.path())
                .timeout(self.config.timeouts.for_stage(phase.stage())),
        )
    }

    async fn solver_phase(&self, unit: &WorkUnit, phase: Phase) -> Result<StageArtifact, StageError> {
        let stage = phase.stage();
        let resolver = self.resolver();
        let output = resolver.profile(unit, phase);
        if output.exists() {
            info!(
                replica = %unit.replica_id,
                lag = unit.lag_time,
                stage = %stage,
                path = %output.path().display(),
                "profile exists, not updating"
            );
            return Ok(output);
        }

        let transition_matrix = resolver.transition_matrix(unit)?;
        if !transition_matrix.exists() {
            return Err(StageError::ArtifactMissing {
                replica: unit.replica_id.clone(),
                lags: vec![unit.lag_time],
                stage: StageKind::TransitionMatrix,
                artifact: transition_matrix.into_path(),
                log: resolver.log(unit, StageKind::TransitionMatrix),
            });
        }
        if phase == Phase::Production {
            let initial = resolver.profile(unit, Phase::Equilibration);
            if !initial.exists() {
                return Err(StageError::ArtifactMissing {
                    replica: unit.replica_id.clone(),
                    lags: vec![unit.lag_time],
                    stage: StageKind::Equilibration,
                    artifact: initial.into_path(),
                    log: resolver.log(unit, StageKind::Equilibration),
                });
            }
        }

        let invocation = self.solver_invocation(unit, phase)?;
        info!(
            replica = %unit.replica_id,
            lag = unit.lag_time,
            stage = %stage,
            command = %invocation,
            "starting Monte-Carlo run"
        );
        let result = self
            .invoke(
                &invocation,
                &unit.replica_id,
                &[unit.lag_time],
                stage,
                output.path(),
            )
            .await?;

        if !result.succeeded() {
            return Err(StageError::ProcessExit {
                replica: unit.replica_id.clone(),
                lags: vec![unit.lag_time],
                stage,
                exit_code: result.exit_code,
                artifact: output.into_path(),
                log: result.log_path,
            });
        }
        if !output.exists() {
            return Err(StageError::ArtifactMissing {
                replica: unit.replica_id.clone(),
                lags: vec![unit.lag_time],
                stage,
                artifact: output.into_path(),
                log: result.log_path,
            });
        }

        info!(
            replica = %unit.replica_id,
            lag = unit.lag_time,
            stage = %stage,
            elapsed_ms = result.duration.as_millis() as u64,
            "Monte-Carlo run finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_config, RecordingRunner};
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn executor(dir: &TempDir, runner: Arc<RecordingRunner>) -> StageExecutor {
        StageExecutor::new(Arc::new(fixture_config(dir.path(), "[50]", "")), runner)
    }

    fn seed_transition_matrix(dir: &TempDir) {
        fs::create_dir_all(dir.path().join("tmat")).unwrap();
        fs::write(dir.path().join("tmat/tmat.A.50.dat"), "matrix").unwrap();
    }

    #[test]
    fn test_equilibration_command_line() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir, Arc::new(RecordingRunner::well_behaved()));
        let unit = WorkUnit::new("A", 50);

        let invocation = executor.solver_invocation(&unit, Phase::Equilibration).unwrap();

        let root = dir.path().display().to_string();
        assert_eq!(
            invocation.to_string(),
            format!(
                "mcdiff run {root}/tmat/tmat.A.50.dat -o {root}/out/profiles.A.50.0.dat --nmc 100 -T 1.0"
            )
        );
        assert_eq!(invocation.log_path, dir.path().join("out/profiles.A.50.0.log"));
    }

    #[test]
    fn test_production_command_line_merges_options() {
        let dir = TempDir::new().unwrap();
        let executor = executor(&dir, Arc::new(RecordingRunner::well_behaved()));
        let unit = WorkUnit::new("A", 50);

        let invocation = executor.solver_invocation(&unit, Phase::Production).unwrap();

        let root = dir.path().display().to_string();
        assert_eq!(
            invocation.to_string(),
            format!(
                "mcdiff run {root}/tmat/tmat.A.50.dat -o {root}/out/profiles.A.50.1.dat \
                 --initf {root}/out/profiles.A.50.0.dat --nmc 500 -T 1.0 --seed 7"
            )
        );
    }

    #[tokio::test]
    async fn test_phases_run_in_order_and_skip_when_done() {
        let dir = TempDir::new().unwrap();
        seed_transition_matrix(&dir);
        let runner = Arc::new(RecordingRunner::well_behaved());
        let executor = executor(&dir, runner.clone());
        let unit = WorkUnit::new("A", 50);

        let equilibration = executor.equilibration(&unit).await.unwrap();
        let production = executor.production(&unit).await.unwrap();
        assert!(equilibration.exists());
        assert!(production.exists());
        assert_eq!(runner.call_count(), 2);

        executor.equilibration(&unit).await.unwrap();
        executor.production(&unit).await.unwrap();
        assert_eq!(runner.call_count(), 2);
    }

    #[tokio::test]
    async fn test_missing_transition_matrix_blocks_solver() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::well_behaved());
        let executor = executor(&dir, runner.clone());

        let err = executor.equilibration(&WorkUnit::new("A", 50)).await.unwrap_err();

        assert!(matches!(
            err,
            StageError::ArtifactMissing { stage: StageKind::TransitionMatrix, .. }
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_production_requires_equilibration_output() {
        let dir = TempDir::new().unwrap();
        seed_transition_matrix(&dir);
        let runner = Arc::new(RecordingRunner::well_behaved());
        let executor = executor(&dir, runner.clone());

        let err = executor.production(&WorkUnit::new("A", 50)).await.unwrap_err();

        assert!(matches!(
            err,
            StageError::ArtifactMissing { stage: StageKind::Equilibration, .. }
        ));
        assert_eq!(runner.call_count(), 0);
    }

    #[tokio::test]
    async fn test_nonzero_solver_exit_is_fatal() {
        let dir = TempDir::new().unwrap();
        seed_transition_matrix(&dir);
        let runner = Arc::new(RecordingRunner::well_behaved().with_exit_code(StageKind::Equilibration, 2));
        let executor = executor(&dir, runner);

        let err = executor.equilibration(&WorkUnit::new("A", 50)).await.unwrap_err();

        match err {
            StageError::ProcessExit { exit_code, log, .. } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(log, dir.path().join("out/profiles.A.50.0.log"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_solver_output_is_artifact_missing() {
        let dir = TempDir::new().unwrap();
        seed_transition_matrix(&dir);
        let runner = Arc::new(RecordingRunner::well_behaved().without_outputs(StageKind::Equilibration));
        let executor = executor(&dir, runner);

        let err = executor.equilibration(&WorkUnit::new("A", 50)).await.unwrap_err();

        match err {
            StageError::ArtifactMissing { stage, artifact, .. } => {
                assert_eq!(stage, StageKind::Equilibration);
                assert_eq!(artifact, dir.path().join("out/profiles.A.50.0.dat"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
