//! Per-unit stage sequencing.

use tracing::debug;

use crate::artifacts::{StageKind, WorkUnit};
use crate::error::StageError;
use crate::report::{CompletedUnit, UnitFailure, UnitResult};
use crate::stage::StageExecutor;

/// Runs the stages of one work unit strictly in order, stopping at the first
/// failure.
#[derive(Clone)]
pub struct UnitScheduler {
    stages: StageExecutor,
}

impl UnitScheduler {
    pub fn new(stages: StageExecutor) -> Self {
        Self { stages }
    }

    pub fn stages(&self) -> &StageExecutor {
        &self.stages
    }

    /// Transition matrix, then equilibration, then production.
    pub async fn run_unit(&self, unit: &WorkUnit) -> UnitResult {
        let fail = |err: StageError| UnitFailure::new(unit.clone(), StageKind::TransitionMatrix, err);
        let replica = self.stages.replica(&unit.replica_id).map_err(fail)?;
        self.stages
            .ensure_transition_matrices(replica, &[unit.lag_time])
            .await
            .map_err(fail)?;
        self.run_solver(unit).await
    }

    /// Equilibration then production, for a unit whose transition matrix is
    /// already in place.
    pub async fn run_solver(&self, unit: &WorkUnit) -> UnitResult {
        debug!(unit = %unit, "running solver phases");
        self.stages
            .equilibration(unit)
            .await
            .map_err(|err| UnitFailure::new(unit.clone(), StageKind::Equilibration, err))?;
        let production = self
            .stages
            .production(unit)
            .await
            .map_err(|err| UnitFailure::new(unit.clone(), StageKind::Production, err))?;
        Ok(CompletedUnit {
            unit: unit.clone(),
            production: production.into_path(),
        })
    }

    /// First stage of `unit` whose artifact is not on disk.
    pub(crate) fn first_incomplete_stage(&self, unit: &WorkUnit) -> StageKind {
        let resolver = self.stages.resolver();
        StageKind::ALL
            .into_iter()
            .find(|&stage| {
                resolver
                    .resolve(unit, stage)
                    .map_or(true, |artifact| !artifact.exists())
            })
            .unwrap_or(StageKind::Production)
    }
}
