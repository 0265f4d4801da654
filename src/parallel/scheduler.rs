//! Fan-out of work units over bounded worker pools.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::UnitScheduler;
use crate::artifacts::{StageKind, WorkUnit};
use crate::config::{FanOutShape, PipelineConfig, Replica, TransitionMatrixStrategy};
use crate::error::StageError;
use crate::report::{UnitFailure, UnitResult};

/// How units are distributed over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FanOutPlan {
    /// Run concurrently; otherwise every unit is awaited in turn.
    pub parallel: bool,
    pub shape: FanOutShape,
    /// Upper bound on the width of each pool.
    pub max_workers: Option<usize>,
}

impl FanOutPlan {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            parallel: config.parallel,
            shape: config.fanout,
            max_workers: config.max_workers,
        }
    }

    /// Number of workers of a pool that has `jobs` jobs to run.
    pub fn pool_width(&self, jobs: usize) -> usize {
        if !self.parallel {
            return 1;
        }
        self.max_workers
            .map_or(jobs, |max| max.min(jobs))
            .max(1)
    }
}

/// Distributes work units over workers and joins their results.
///
/// A failed unit never cancels its siblings; every unit yields exactly one
/// result, in dispatch order.
#[derive(Clone)]
pub struct ParallelRunner {
    scheduler: UnitScheduler,
    plan: FanOutPlan,
}

impl ParallelRunner {
    pub fn new(scheduler: UnitScheduler) -> Self {
        let plan = FanOutPlan::from_config(scheduler.stages().config());
        Self { scheduler, plan }
    }

    pub fn plan(&self) -> FanOutPlan {
        self.plan
    }

    fn config(&self) -> &PipelineConfig {
        self.scheduler.stages().config()
    }

    /// Run every unit of the configuration.
    pub async fn run(&self) -> Vec<UnitResult> {
        match self.plan.shape {
            FanOutShape::Flat => self.run_flat().await,
            FanOutShape::Nested => self.run_nested().await,
        }
    }

    async fn run_flat(&self) -> Vec<UnitResult> {
        let units = self.config().units();
        if !self.plan.parallel {
            info!(units = units.len(), "running units serially");
            let mut results = Vec::with_capacity(units.len());
            for unit in &units {
                results.push(self.scheduler.run_unit(unit).await);
            }
            return results;
        }

        let width = self.plan.pool_width(units.len());
        info!(units = units.len(), workers = width, "dispatching units to worker pool");
        let permits = Arc::new(Semaphore::new(width));
        let handles: Vec<JoinHandle<UnitResult>> = units
            .iter()
            .map(|unit| {
                let scheduler = self.scheduler.clone();
                let permits = Arc::clone(&permits);
                let unit = unit.clone();
                tokio::spawn(async move {
                    // Hold the permit until the unit finishes (RAII)
                    let _permit = permits.acquire_owned().await;
                    scheduler.run_unit(&unit).await
                })
            })
            .collect();
        self.join_units(units, handles).await
    }

    async fn run_nested(&self) -> Vec<UnitResult> {
        let replicas = self.config().replicas.clone();
        if !self.plan.parallel {
            info!(replicas = replicas.len(), "running replicas serially");
            let mut results = Vec::new();
            for replica in &replicas {
                results.extend(self.run_replica(replica).await);
            }
            return results;
        }

        let width = self.plan.pool_width(replicas.len());
        info!(replicas = replicas.len(), workers = width, "dispatching replicas to outer pool");
        let permits = Arc::new(Semaphore::new(width));
        let handles: Vec<JoinHandle<Vec<UnitResult>>> = replicas
            .iter()
            .map(|replica| {
                let runner = self.clone();
                let permits = Arc::clone(&permits);
                let replica = replica.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    runner.run_replica(&replica).await
                })
            })
            .collect();

        let mut results = Vec::new();
        for (joined, replica) in join_all(handles).await.into_iter().zip(&replicas) {
            match joined {
                Ok(outcomes) => results.extend(outcomes),
                Err(err) => {
                    let reason = err.to_string();
                    results.extend(
                        self.replica_units(replica)
                            .into_iter()
                            .map(|unit| Err(self.aborted(unit, &reason))),
                    );
                }
            }
        }
        results
    }

    /// All transition matrices of `replica` first, then the solver phases of
    /// each lag time that has one. Results keep the replica's lag order.
    async fn run_replica(&self, replica: &Replica) -> Vec<UnitResult> {
        let units = self.replica_units(replica);
        let position: HashMap<u64, usize> = units
            .iter()
            .enumerate()
            .map(|(index, unit)| (unit.lag_time, index))
            .collect();
        let (ready, mut results) = self.prepare_transition_matrices(replica, units).await;
        results.extend(self.run_solver_pool(ready).await);
        results.sort_by_key(|result| {
            let unit = match result {
                Ok(completed) => &completed.unit,
                Err(failure) => &failure.unit,
            };
            position.get(&unit.lag_time).copied()
        });
        results
    }

    /// Returns the units whose transition matrix is in place, and failures
    /// for the rest.
    async fn prepare_transition_matrices(
        &self,
        replica: &Replica,
        units: Vec<WorkUnit>,
    ) -> (Vec<WorkUnit>, Vec<UnitResult>) {
        let stages = self.scheduler.stages();
        match self.config().transition.strategy {
            TransitionMatrixStrategy::BatchedLagRange => {
                let lags: Vec<u64> = units.iter().map(|unit| unit.lag_time).collect();
                match stages.ensure_transition_matrices(replica, &lags).await {
                    Ok(_) => (units, Vec::new()),
                    Err(err) => {
                        let error = Arc::new(err);
                        let failures = units
                            .into_iter()
                            .map(|unit| {
                                Err(UnitFailure::new(
                                    unit,
                                    StageKind::TransitionMatrix,
                                    Arc::clone(&error),
                                ))
                            })
                            .collect();
                        (Vec::new(), failures)
                    }
                }
            }
            TransitionMatrixStrategy::PerLagTime => {
                let mut ready = Vec::with_capacity(units.len());
                let mut failures = Vec::new();
                for unit in units {
                    match stages.transition_matrix(replica, unit.lag_time).await {
                        Ok(_) => ready.push(unit),
                        Err(err) => failures.push(Err(UnitFailure::new(
                            unit,
                            StageKind::TransitionMatrix,
                            err,
                        ))),
                    }
                }
                (ready, failures)
            }
        }
    }

    async fn run_solver_pool(&self, units: Vec<WorkUnit>) -> Vec<UnitResult> {
        if !self.plan.parallel {
            let mut results = Vec::with_capacity(units.len());
            for unit in &units {
                results.push(self.scheduler.run_solver(unit).await);
            }
            return results;
        }

        let width = self.plan.pool_width(units.len());
        debug!(units = units.len(), workers = width, "dispatching lag times to inner pool");
        let permits = Arc::new(Semaphore::new(width));
        let handles: Vec<JoinHandle<UnitResult>> = units
            .iter()
            .map(|unit| {
                let scheduler = self.scheduler.clone();
                let permits = Arc::clone(&permits);
                let unit = unit.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await;
                    scheduler.run_solver(&unit).await
                })
            })
            .collect();
        self.join_units(units, handles).await
    }

    async fn join_units(
        &self,
        units: Vec<WorkUnit>,
        handles: Vec<JoinHandle<UnitResult>>,
    ) -> Vec<UnitResult> {
        join_all(handles)
            .await
            .into_iter()
            .zip(units)
            .map(|(joined, unit)| match joined {
                Ok(result) => result,
                Err(err) => Err(self.aborted(unit, &err.to_string())),
            })
            .collect()
    }

    fn replica_units(&self, replica: &Replica) -> Vec<WorkUnit> {
        self.config()
            .lag_times_for(replica)
            .into_iter()
            .map(|lag| WorkUnit::new(replica.id.clone(), lag))
            .collect()
    }

    /// Failure for a unit whose worker died without a result. It is charged
    /// to the first stage whose artifact is missing.
    fn aborted(&self, unit: WorkUnit, reason: &str) -> UnitFailure {
        warn!(unit = %unit, reason, "worker stopped unexpectedly");
        let stage = self.scheduler.first_incomplete_stage(&unit);
        let error = StageError::WorkerAborted {
            replica: unit.replica_id.clone(),
            lags: vec![unit.lag_time],
            reason: reason.to_string(),
        };
        UnitFailure::new(unit, stage, error)
    }
}
